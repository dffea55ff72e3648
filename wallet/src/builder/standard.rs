// Standard and blinded inputs: both spend a single known output with a
// Schnorr signature over the transaction signature hash

use rand::{CryptoRng, RngCore};

use super::TransactionBuilder;
use crate::crypto::{schnorr_sign, BlindingFactor, Commitment, SCHNORR_SIGNATURE_SIZE};
use crate::error::{Result, WalletError};
use crate::recipient::TempRecipient;
use crate::records::OutputRecord;
use crate::state::SpendableCoin;
use crate::transaction::{Transaction, TxIn};
use crate::types::{Amount, KeyId, OutputKind};

pub(super) fn spend_key_id(output: &OutputRecord) -> Result<KeyId> {
    output
        .key_id
        .or_else(|| output.script.key_id())
        .ok_or_else(|| WalletError::StateInconsistency(format!("output {} has no spend key", output.n)))
}

impl<'a> TransactionBuilder<'a> {
    /// Inputs with zeroed signatures of the real size
    pub(super) fn dummy_standard_inputs(&self, coins: &[SpendableCoin]) -> Result<Vec<TxIn>> {
        coins
            .iter()
            .map(|coin| {
                let id = spend_key_id(&coin.output)?;
                Ok(TxIn::Standard {
                    prevout: coin.candidate.outpoint,
                    pubkey: self.state.public_key(self.keys, &id)?,
                    signature: vec![0u8; SCHNORR_SIGNATURE_SIZE],
                })
            })
            .collect()
    }

    /// Replace the placeholder signatures. `coins[i]` funds `tx.inputs[i]`.
    pub(super) fn sign_standard_inputs<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        tx: &mut Transaction,
        coins: &[SpendableCoin],
    ) -> Result<()> {
        let sighash = tx.signature_hash()?;
        for (input, coin) in tx.inputs.iter_mut().zip(coins) {
            let secret = self.state.secret_key(self.keys, &spend_key_id(&coin.output)?)?;
            match input {
                TxIn::Standard {
                    pubkey, signature, ..
                } => {
                    if secret.public_key() != *pubkey {
                        return Err(WalletError::StateInconsistency(format!(
                            "key for {} does not match its input",
                            coin.candidate.outpoint
                        )));
                    }
                    *signature = schnorr_sign(rng, &secret, &sighash.0).to_vec();
                }
                TxIn::Anon { .. } => {
                    return Err(WalletError::StateInconsistency(
                        "ring input among standard inputs".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Blinds of spent blinded outputs, in input order
pub(super) fn input_blinds(coins: &[SpendableCoin]) -> Result<Vec<BlindingFactor>> {
    coins
        .iter()
        .map(|c| {
            c.output.blind.clone().ok_or_else(|| {
                WalletError::StateInconsistency(format!("blinded input {} has no blind", c.candidate.outpoint))
            })
        })
        .collect()
}

pub(super) fn input_commitments(coins: &[SpendableCoin]) -> Result<Vec<Commitment>> {
    coins
        .iter()
        .map(|c| {
            c.output.commitment.ok_or_else(|| {
                WalletError::StateInconsistency(format!(
                    "blinded input {} has no commitment",
                    c.candidate.outpoint
                ))
            })
        })
        .collect()
}

/// Plain outputs plus the fee consume the blinded inputs exactly, which
/// would reveal the blinded change as zero
pub(super) fn is_exact_match(recipients: &[TempRecipient], fee: Amount, value_in: Amount) -> bool {
    let plain_out: Amount = recipients
        .iter()
        .filter(|r| r.kind == OutputKind::Standard)
        .map(|r| r.amount)
        .sum();
    plain_out + fee == value_in
}

/// Take one unit from the first fee-paying standard recipient
pub(super) fn nudge_exact_match(recipients: &mut [TempRecipient]) -> bool {
    match recipients.iter_mut().find(|r| {
        r.kind == OutputKind::Standard && r.subtract_fee && !r.is_change && r.amount_selected > 0
    }) {
        Some(r) => {
            r.amount_selected -= 1;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipient::Destination;

    fn temp(kind: OutputKind, amount: Amount, subtract: bool) -> TempRecipient {
        TempRecipient::new(
            Destination::KeyId(KeyId::default()),
            kind,
            amount,
            subtract,
            None,
            Vec::new(),
        )
    }

    #[test]
    fn test_exact_match_nudge() {
        let mut rs = vec![
            temp(OutputKind::Blinded, 0, false),
            temp(OutputKind::Standard, 900, true),
        ];
        rs[0].is_change = true;
        assert!(is_exact_match(&rs, 100, 1_000));
        assert!(!is_exact_match(&rs, 99, 1_000));

        assert!(nudge_exact_match(&mut rs));
        assert_eq!(rs[1].amount_selected, 899);

        let mut none = vec![temp(OutputKind::Standard, 900, false)];
        assert!(!nudge_exact_match(&mut none));
    }

    #[test]
    fn test_spend_key_falls_back_to_script() {
        let id = KeyId([3u8; 20]);
        let mut out = OutputRecord::new(0, OutputKind::Standard, 10);
        assert!(spend_key_id(&out).is_err());
        out.script = crate::types::Script::for_key_id(&id);
        assert_eq!(spend_key_id(&out).unwrap(), id);
    }
}

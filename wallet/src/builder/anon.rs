// Anonymous inputs: ring placement, key images and MLSAG signing

use rand::{CryptoRng, RngCore};
use tracing::debug;

use super::TransactionBuilder;
use crate::blinding::plain_commitment;
use crate::crypto::{key_image, BlindingFactor, Commitment, CryptoError, KeyImage, MlsagSignature, SecretKey};
use crate::error::{Result, WalletError};
use crate::recipient::TempRecipient;
use crate::ring::{
    check_unique_images, group_inputs, pick_decoys, sign_group, split_blinds, split_commitment, RealInput,
};
use crate::state::SpendableCoin;
use crate::transaction::{Transaction, TxIn};
use crate::types::{Amount, OutPoint};

/// Ring inputs with zeroed members and signatures, shaped like the real ones
pub(super) fn dummy_anon_inputs(count: usize, ring_size: usize, inputs_per_sig: usize) -> Vec<TxIn> {
    let multiple = count > inputs_per_sig;
    let mut inputs = Vec::new();
    let mut remaining = count;
    while remaining > 0 {
        let k = remaining.min(inputs_per_sig);
        inputs.push(TxIn::Anon {
            ring: vec![vec![0u64; k]; ring_size],
            split_commitment: if multiple {
                Some(Commitment([0u8; 32]))
            } else {
                None
            },
            signature: MlsagSignature::dummy(ring_size, k),
        });
        remaining -= k;
    }
    inputs
}

impl<'a> TransactionBuilder<'a> {
    fn real_inputs(&self, coins: &[SpendableCoin]) -> Result<Vec<RealInput>> {
        coins
            .iter()
            .map(|coin| {
                let outpoint = coin.candidate.outpoint;
                let missing = |what: &str| {
                    WalletError::StateInconsistency(format!("anonymous input {} has no {}", outpoint, what))
                };
                let pubkey = coin.output.anon_pubkey.ok_or_else(|| missing("one-time key"))?;
                let blind = coin.output.blind.clone().ok_or_else(|| missing("blind"))?;
                let index = self
                    .chain
                    .anon_index_of(&pubkey)
                    .ok_or_else(|| missing("global index"))?;
                let commitment = self
                    .chain
                    .anon_output(index)
                    .ok_or_else(|| missing("chain entry"))?
                    .commitment;
                Ok(RealInput {
                    outpoint,
                    index,
                    pubkey,
                    commitment,
                    value: coin.output.value,
                    blind,
                })
            })
            .collect()
    }

    /// Pick decoys and fill in the ring inputs, signing them when `sign` is
    /// set. Returns each spent outpoint with its key image.
    pub(super) fn finalize_anon<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        tx: &mut Transaction,
        coins: &[SpendableCoin],
        recipients: &[TempRecipient],
        fee: Amount,
        sign: bool,
    ) -> Result<Vec<(KeyImage, OutPoint)>> {
        let real = self.real_inputs(coins)?;

        let secrets: Vec<SecretKey> = if sign {
            real.iter()
                .map(|input| self.state.secret_key(self.keys, &input.pubkey.key_id()))
                .collect::<Result<_>>()?
        } else {
            Vec::new()
        };

        let images: Vec<KeyImage> = if sign {
            real.iter()
                .zip(&secrets)
                .map(|(input, secret)| key_image(&input.pubkey, secret))
                .collect::<std::result::Result<_, CryptoError>>()?
        } else {
            coins
                .iter()
                .map(|c| c.output.key_image.unwrap_or(KeyImage([0u8; 32])))
                .collect()
        };

        if sign {
            check_unique_images(&images)?;
            for (image, input) in images.iter().zip(&real) {
                let owner = match self.state.ledger.key_image_owner(image) {
                    Some(owner) if *owner != input.outpoint => *owner,
                    _ => continue,
                };
                // The index gives this key image to another output
                self.mark_spent(&input.outpoint)?;
                return Err(CryptoError::DuplicateKeyImage(format!(
                    "{} spends {} and {}",
                    image.to_hex(),
                    owner,
                    input.outpoint
                ))
                .into());
            }
        }
        let ring_config = &self.config.ring;
        let spent: Vec<(KeyImage, OutPoint)> = images
            .iter()
            .copied()
            .zip(real.iter().map(|i| i.outpoint))
            .collect();

        let mut groups = group_inputs(rng, real, ring_config.ring_size, ring_config.inputs_per_sig);
        pick_decoys(rng, self.chain, ring_config, &mut groups, &self.state.anon_blacklist)?;

        let mut out_commitments: Vec<Commitment> =
            tx.outputs.iter().filter_map(|o| o.commitment().copied()).collect();
        out_commitments.push(plain_commitment(tx.plain_output_value() + fee)?);
        let out_blinds: Vec<&BlindingFactor> = recipients
            .iter()
            .filter(|r| r.kind.is_blinded())
            .map(|r| {
                r.blind.as_ref().ok_or_else(|| {
                    WalletError::StateInconsistency("blinded output without a blind".to_string())
                })
            })
            .collect::<Result<_>>()?;

        let splits = if groups.len() > 1 {
            Some(split_blinds(rng, groups.len(), &out_blinds)?)
        } else {
            None
        };

        let mut inputs = Vec::with_capacity(groups.len());
        let mut offset = 0;
        for (g, group) in groups.iter().enumerate() {
            let count = group.inputs.len();
            let split = match &splits {
                Some(blinds) => Some(split_commitment(group, &blinds[g])?),
                None => None,
            };
            let mut signature = MlsagSignature::dummy(group.ring_size(), count);
            signature.key_images = images[offset..offset + count].to_vec();
            inputs.push(TxIn::Anon {
                ring: group.ring.clone(),
                split_commitment: split,
                signature,
            });
            offset += count;
        }
        tx.inputs = inputs;

        if sign {
            // Ring signatures commit to the outputs only
            let message = tx.outputs_hash()?;
            let mut offset = 0;
            for (g, group) in groups.iter().enumerate() {
                let count = group.inputs.len();
                let group_secrets = &secrets[offset..offset + count];
                let signature = match (&splits, &tx.inputs[g]) {
                    (Some(blinds), TxIn::Anon {
                        split_commitment: Some(commitment),
                        ..
                    }) => sign_group(
                        rng,
                        self.chain,
                        group,
                        &message.0,
                        group_secrets,
                        &[*commitment],
                        &[&blinds[g]],
                    )?,
                    _ => sign_group(
                        rng,
                        self.chain,
                        group,
                        &message.0,
                        group_secrets,
                        &out_commitments,
                        &out_blinds,
                    )?,
                };
                if signature.key_images[..] != images[offset..offset + count] {
                    return Err(WalletError::StateInconsistency(
                        "ring signature key images differ from the recorded ones".to_string(),
                    ));
                }
                if let TxIn::Anon { signature: slot, .. } = &mut tx.inputs[g] {
                    *slot = signature;
                }
                offset += count;
            }
        }

        debug!(
            signatures = groups.len(),
            inputs = spent.len(),
            ring_size = ring_config.ring_size,
            signed = sign,
            "finalized ring inputs"
        );
        Ok(spent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_inputs_match_grouping() {
        let inputs = dummy_anon_inputs(5, 11, 2);
        assert_eq!(inputs.len(), 3);
        let shapes: Vec<(usize, usize, bool)> = inputs
            .iter()
            .map(|i| match i {
                TxIn::Anon {
                    ring,
                    split_commitment,
                    signature,
                } => (ring.len(), signature.key_images.len(), split_commitment.is_some()),
                TxIn::Standard { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(shapes, vec![(11, 2, true), (11, 2, true), (11, 1, true)]);

        let single = dummy_anon_inputs(3, 5, 32);
        assert_eq!(single.len(), 1);
        assert!(matches!(
            &single[0],
            TxIn::Anon { split_commitment: None, .. }
        ));
    }
}

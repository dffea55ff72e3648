// Blinding Balancer
// Assigns blinding factors so commitments tally, and signs range proofs

use rand::{CryptoRng, Rng, RngCore};
use tracing::debug;

use crate::coin_selection::CoinControl;
use crate::crypto::pedersen::{blind_sum, commit, verify_tally};
use crate::crypto::rangeproof::{self, MAX_EXPONENT};
use crate::crypto::{BlindingFactor, Commitment, CryptoError, RangeProof, RangeProofParams};
use crate::error::{Result, WalletError};
use crate::recipient::TempRecipient;
use crate::types::Amount;

/// Output that receives the solved blind: blinded change if any, else the
/// last blinded output
pub fn designated_output(recipients: &[TempRecipient]) -> Option<usize> {
    recipients
        .iter()
        .position(|r| r.is_change && r.kind.is_blinded())
        .or_else(|| recipients.iter().rposition(|r| r.kind.is_blinded()))
}

/// Give every blinded recipient a blind. All are random except
/// `designated`, which is solved so that the input blinds minus the output
/// blinds sum to zero.
pub fn assign_blinds<R: RngCore + CryptoRng>(
    rng: &mut R,
    recipients: &mut [TempRecipient],
    input_blinds: &[BlindingFactor],
    designated: Option<usize>,
) -> Result<()> {
    if designated.is_none() && !input_blinds.is_empty() {
        return Err(CryptoError::BlindSum("no blinded output to balance the inputs".to_string()).into());
    }

    for (i, r) in recipients.iter_mut().enumerate() {
        if r.kind.is_blinded() && Some(i) != designated {
            r.blind = Some(BlindingFactor::random(rng));
        }
    }

    if let Some(d) = designated {
        let mut blinds: Vec<&BlindingFactor> = input_blinds.iter().collect();
        for (i, r) in recipients.iter().enumerate() {
            if i == d || !r.kind.is_blinded() {
                continue;
            }
            if let Some(b) = &r.blind {
                blinds.push(b);
            }
        }
        let solved = blind_sum(&blinds, input_blinds.len())?;
        recipients[d].blind = Some(solved);
    }
    Ok(())
}

/// Raise `min_value` so the offset is a multiple of `10^exponent`, and the
/// width so the mantissa fits
pub fn fit_params(value: u64, mut params: RangeProofParams) -> RangeProofParams {
    params.exponent = params.exponent.min(MAX_EXPONENT);
    if params.min_value > value {
        params.min_value = value;
    }
    let scale = 10u64.pow(params.exponent);
    params.min_value += (value - params.min_value) % scale;

    let mantissa = (value - params.min_value) / scale;
    let required = 64 - mantissa.leading_zeros();
    if required > params.bits {
        params.bits = required;
    }
    params.bits = (((params.bits + 3) / 4) * 4).min(64);
    params
}

/// Automatic parameters with coin-control overrides applied
pub fn proof_params<R: Rng>(rng: &mut R, value: u64, coin_control: &CoinControl) -> RangeProofParams {
    let mut params = rangeproof::select_parameters(rng, value);
    if let Some(min_value) = coin_control.min_value {
        params.min_value = min_value;
    }
    if let Some(exponent) = coin_control.ct_exponent {
        params.exponent = exponent;
    }
    if let Some(bits) = coin_control.ct_bits {
        params.bits = bits;
    }
    fit_params(value, params)
}

/// Commitment and range proof for a blinded recipient with its blind set
pub fn make_range_proof<R: Rng>(
    rng: &mut R,
    recipient: &TempRecipient,
    coin_control: &CoinControl,
) -> Result<(Commitment, RangeProof)> {
    let blind = recipient
        .blind
        .as_ref()
        .ok_or_else(|| WalletError::StateInconsistency("blinded output without a blind".to_string()))?;
    let nonce = recipient
        .shared
        .as_ref()
        .ok_or_else(|| WalletError::StateInconsistency("blinded output without a nonce".to_string()))?;
    let value = u64::try_from(recipient.amount)
        .map_err(|_| CryptoError::RangeProof(format!("negative value {}", recipient.amount)))?;

    let commitment = commit(blind, value);
    let params = proof_params(rng, value, coin_control);
    let message = recipient.narration.as_deref().unwrap_or("").as_bytes();
    let proof = rangeproof::sign(&commitment, value, blind, nonce, message, &params)?;
    debug!(
        exponent = params.exponent,
        bits = params.bits,
        size = proof.size(),
        "signed range proof"
    );
    Ok((commitment, proof))
}

/// Commitment to a cleartext amount with a zero blind
pub fn plain_commitment(value: Amount) -> Result<Commitment> {
    let value = u64::try_from(value)
        .map_err(|_| CryptoError::BlindSum(format!("negative plain value {}", value)))?;
    Ok(commit(&BlindingFactor::zero(), value))
}

/// `plain_in + Σ inputs == plain_out + Σ outputs` over commitments; the fee
/// belongs in `plain_out`
pub fn check_balance(
    plain_in: Amount,
    inputs: &[Commitment],
    plain_out: Amount,
    outputs: &[Commitment],
) -> Result<bool> {
    let mut positive = inputs.to_vec();
    positive.push(plain_commitment(plain_in)?);
    let mut negative = outputs.to_vec();
    negative.push(plain_commitment(plain_out)?);
    Ok(verify_tally(&positive, &negative)?)
}

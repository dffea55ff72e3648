// Ring Builder
// Places real anonymous spends among decoys and assembles MLSAG witnesses

use std::collections::HashSet;

use rand::{CryptoRng, Rng, RngCore};
use tracing::debug;

use crate::chain::ChainState;
use crate::config::{RingConfig, MAX_ANON_INPUTS, MAX_RINGSIZE, MIN_RINGSIZE};
use crate::crypto::mlsag::{self, MlsagSignature};
use crate::crypto::pedersen::{blind_sum, commit};
use crate::crypto::{BlindingFactor, Commitment, CryptoError, KeyImage, PublicKey, SecretKey};
use crate::error::{InputError, ResourceError, Result, WalletError};
use crate::retry::{retry, Attempt};
use crate::types::{Amount, OutPoint};

/// An owned anonymous output being spent
#[derive(Debug, Clone)]
pub struct RealInput {
    /// Where the wallet recorded the output
    pub outpoint: OutPoint,
    /// Position in the global anonymous-output set
    pub index: u64,
    pub pubkey: PublicKey,
    pub commitment: Commitment,
    pub value: Amount,
    pub blind: BlindingFactor,
}

/// Real inputs sharing one ring signature
#[derive(Debug, Clone)]
pub struct RingGroup {
    pub inputs: Vec<RealInput>,
    pub secret_col: usize,
    /// Global indices, `ring[col][k]`
    pub ring: Vec<Vec<u64>>,
}

impl RingGroup {
    pub fn value(&self) -> Amount {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn ring_size(&self) -> usize {
        self.ring.len()
    }
}

pub fn check_ring_params(ring_size: usize, inputs_per_sig: usize) -> Result<()> {
    if !(MIN_RINGSIZE..=MAX_RINGSIZE).contains(&ring_size) {
        return Err(InputError::RingSizeOutOfRange {
            size: ring_size,
            min: MIN_RINGSIZE,
            max: MAX_RINGSIZE,
        }
        .into());
    }
    if inputs_per_sig == 0 || inputs_per_sig > MAX_ANON_INPUTS {
        return Err(InputError::TooManyInputs {
            count: inputs_per_sig,
            max: MAX_ANON_INPUTS,
        }
        .into());
    }
    Ok(())
}

/// Pick a secret column and put each real index there; other cells stay 0
/// until decoys are picked
pub fn place_real<R: Rng>(rng: &mut R, ring_size: usize, real: &[u64]) -> (usize, Vec<Vec<u64>>) {
    let secret_col = rng.gen_range(0..ring_size);
    let mut ring = vec![vec![0u64; real.len()]; ring_size];
    ring[secret_col].copy_from_slice(real);
    (secret_col, ring)
}

/// Chunk real inputs into signatures of at most `inputs_per_sig`
pub fn group_inputs<R: Rng>(
    rng: &mut R,
    inputs: Vec<RealInput>,
    ring_size: usize,
    inputs_per_sig: usize,
) -> Vec<RingGroup> {
    let mut groups = Vec::new();
    let mut inputs = inputs.into_iter().peekable();
    while inputs.peek().is_some() {
        let chunk: Vec<RealInput> = inputs.by_ref().take(inputs_per_sig).collect();
        let real: Vec<u64> = chunk.iter().map(|i| i.index).collect();
        let (secret_col, ring) = place_real(rng, ring_size, &real);
        groups.push(RingGroup {
            inputs: chunk,
            secret_col,
            ring,
        });
    }
    groups
}

/// Fill every non-secret cell of every group with a decoy.
///
/// Real indices enter the used set before any decoy is drawn, so no index
/// repeats anywhere in the transaction.
pub fn pick_decoys<R: Rng>(
    rng: &mut R,
    chain: &dyn ChainState,
    config: &RingConfig,
    groups: &mut [RingGroup],
    blacklist: &HashSet<u64>,
) -> Result<HashSet<u64>> {
    let total_inputs: usize = groups.iter().map(|g| g.inputs.len()).sum();
    let ring_size = groups.first().map(|g| g.ring_size()).unwrap_or(0);
    let required = (total_inputs * ring_size) as u64;
    let mut last = chain.anon_output_count();
    if last < required {
        return Err(ResourceError::NotEnoughAnonOutputs {
            available: last,
            required,
        }
        .into());
    }

    let mut used = HashSet::new();
    for g in groups.iter() {
        for input in &g.inputs {
            if !used.insert(input.index) {
                return Err(WalletError::StateInconsistency(format!(
                    "anonymous output {} spent twice",
                    input.index
                )));
            }
        }
    }

    let max_height = chain.best_height() - (config.min_output_depth + config.extra_depth);
    let mut input_base = 0;
    let mut last_depth_ok = 0u64;

    for g in groups.iter_mut() {
        for k in 0..g.inputs.len() {
            for col in 0..g.ring.len() {
                if col == g.secret_col {
                    continue;
                }
                let min_index = if rng.gen_range(0..100) < 50 {
                    last.saturating_sub(config.group1).max(1)
                } else if rng.gen_range(0..100) < 70 {
                    last.saturating_sub(config.group2).max(1)
                } else {
                    1
                };

                let picked = retry(config.max_tries, |_| {
                    if last <= min_index {
                        return Err(Attempt::Fatal(
                            ResourceError::NotEnoughAnonOutputs {
                                available: last,
                                required,
                            }
                            .into(),
                        ));
                    }
                    let decoy = rng.gen_range(min_index..=last);
                    if used.contains(&decoy) {
                        if decoy == last {
                            last -= 1;
                        }
                        return Err(Attempt::Retry("index already used"));
                    }
                    if blacklist.contains(&decoy) {
                        return Err(Attempt::Retry("index blacklisted"));
                    }
                    let output = chain.anon_output(decoy).ok_or_else(|| {
                        WalletError::StateInconsistency(format!("anonymous output {} not found", decoy))
                    })?;
                    if decoy > last_depth_ok {
                        if output.height > max_height {
                            // Everything above this index is at least as shallow
                            if last > decoy {
                                last = decoy - 1;
                            }
                            return Err(Attempt::Retry("decoy too shallow"));
                        }
                        last_depth_ok = decoy;
                    }
                    Ok(decoy)
                })
                .map_err(|e| match e {
                    WalletError::ResourceExhausted(ResourceError::RetriesExhausted(_)) => {
                        ResourceError::DecoyPoolExhausted {
                            input: input_base + k,
                            column: col,
                        }
                        .into()
                    }
                    other => other,
                })?;

                g.ring[col][k] = picked;
                used.insert(picked);
            }
        }
        input_base += g.inputs.len();
    }

    debug!(
        signatures = groups.len(),
        inputs = total_inputs,
        ring_size,
        "picked decoys"
    );
    Ok(used)
}

/// Blinds for per-signature split commitments. Random except the last,
/// which makes the splits sum to the output blinds.
pub fn split_blinds<R: RngCore + CryptoRng>(
    rng: &mut R,
    count: usize,
    output_blinds: &[&BlindingFactor],
) -> Result<Vec<BlindingFactor>> {
    let mut splits: Vec<BlindingFactor> = Vec::with_capacity(count);
    for _ in 1..count {
        splits.push(BlindingFactor::random(rng));
    }
    let last = {
        let mut blinds: Vec<&BlindingFactor> = output_blinds.to_vec();
        blinds.extend(splits.iter());
        blind_sum(&blinds, output_blinds.len())?
    };
    splits.push(last);
    Ok(splits)
}

/// Commitment to a group's input value under its split blind
pub fn split_commitment(group: &RingGroup, blind: &BlindingFactor) -> Result<Commitment> {
    let value = u64::try_from(group.value())
        .map_err(|_| CryptoError::BlindSum(format!("negative group value {}", group.value())))?;
    Ok(commit(blind, value))
}

fn ring_members(
    chain: &dyn ChainState,
    ring: &[Vec<u64>],
) -> Result<(Vec<Vec<PublicKey>>, Vec<Vec<Commitment>>)> {
    let mut keys = Vec::with_capacity(ring.len());
    let mut commitments = Vec::with_capacity(ring.len());
    for column in ring {
        let mut col_keys = Vec::with_capacity(column.len());
        let mut col_commitments = Vec::with_capacity(column.len());
        for &index in column {
            let output = chain.anon_output(index).ok_or_else(|| {
                WalletError::StateInconsistency(format!("anonymous output {} not found", index))
            })?;
            col_keys.push(output.pubkey);
            col_commitments.push(output.commitment);
        }
        keys.push(col_keys);
        commitments.push(col_commitments);
    }
    Ok((keys, commitments))
}

/// Sign one group over `output_commitments`, then verify the result.
/// `secrets[k]` spends `group.inputs[k]`.
pub fn sign_group<R: RngCore + CryptoRng>(
    rng: &mut R,
    chain: &dyn ChainState,
    group: &RingGroup,
    message: &[u8; 32],
    secrets: &[SecretKey],
    output_commitments: &[Commitment],
    output_blinds: &[&BlindingFactor],
) -> Result<MlsagSignature> {
    let (keys, commitments) = ring_members(chain, &group.ring)?;
    let input_blinds: Vec<&BlindingFactor> = group.inputs.iter().map(|i| &i.blind).collect();
    let (matrix, commitment_secret) =
        mlsag::prepare(&keys, &commitments, output_commitments, &input_blinds, output_blinds)?;

    let secret_refs: Vec<&SecretKey> = secrets.iter().collect();
    let signature = mlsag::generate(
        rng,
        message,
        &matrix,
        &secret_refs,
        &commitment_secret,
        group.secret_col,
    )?;
    mlsag::verify(message, &matrix, &signature)?;
    Ok(signature)
}

/// Check a ring signature against the chain's view of its members
pub fn verify_ring(
    chain: &dyn ChainState,
    ring: &[Vec<u64>],
    message: &[u8; 32],
    signature: &MlsagSignature,
    output_commitments: &[Commitment],
) -> Result<()> {
    let (keys, commitments) = ring_members(chain, ring)?;
    let matrix = mlsag::build_matrix(&keys, &commitments, output_commitments)?;
    mlsag::verify(message, &matrix, signature)?;
    Ok(())
}

/// Fail if any key image repeats within the transaction
pub fn check_unique_images<'a, I>(images: I) -> Result<()>
where
    I: IntoIterator<Item = &'a KeyImage>,
{
    let mut seen = HashSet::new();
    for image in images {
        if !seen.insert(*image) {
            return Err(CryptoError::DuplicateKeyImage(image.to_hex()).into());
        }
    }
    Ok(())
}

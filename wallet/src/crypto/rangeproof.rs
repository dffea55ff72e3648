// Range proofs with an encrypted rewind payload
//
// The proof shows that `(v - min_value) / 10^exponent` fits in the proof
// width, against the value generator scaled by `10^exponent`. The payload
// lets the holder of the nonce recover value, blind and message.

use bulletproofs::{BulletproofGens, PedersenGens, RangeProof as Bulletproof};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use curve25519_dalek_ng::ristretto::RistrettoPoint;
use curve25519_dalek_ng::scalar::Scalar;
use hkdf::Hkdf;
use lazy_static::lazy_static;
use merlin::Transcript;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroize;

use super::keys::SharedSecret;
use super::pedersen::{commit, generators, BlindingFactor, Commitment};
use super::CryptoError;

/// Largest message (narration) carried in the rewind payload
pub const MAX_MESSAGE_LEN: usize = 32;

pub const MAX_EXPONENT: u32 = 18;

const MIN_BITS: u32 = 32;

lazy_static! {
    static ref BP_GENS: BulletproofGens = BulletproofGens::new(64, 1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProofParams {
    pub min_value: u64,
    pub exponent: u32,
    pub bits: u32,
}

impl RangeProofParams {
    /// Bulletproof width covering `bits`
    pub fn proof_width(&self) -> usize {
        if self.bits <= 32 {
            32
        } else {
            64
        }
    }

    fn scale(&self) -> Result<u64, CryptoError> {
        if self.exponent > MAX_EXPONENT {
            return Err(CryptoError::RangeProof(format!(
                "exponent {} above {}",
                self.exponent, MAX_EXPONENT
            )));
        }
        Ok(10u64.pow(self.exponent))
    }
}

fn rand_below<R: Rng>(rng: &mut R, n: u32) -> u32 {
    if n == 0 {
        0
    } else {
        rng.gen_range(0..n)
    }
}

/// Pick proof parameters from the value: a random exponent between half and
/// all of its trailing decimal zeros, and a width of at least 32 bits.
pub fn select_parameters<R: Rng>(rng: &mut R, value: u64) -> RangeProofParams {
    let mut bits = MIN_BITS;

    if value == 0 {
        let exponent = rand_below(rng, 5);
        if rand_below(rng, 10) == 0 {
            bits += rand_below(rng, 5);
        }
        return RangeProofParams {
            min_value: 0,
            exponent,
            bits: round_bits(bits),
        };
    }

    let mut test = value;
    let mut div10 = 0u32;
    while test % 10 == 0 && div10 < MAX_EXPONENT {
        div10 += 1;
        test /= 10;
    }

    let e_min = div10 / 2;
    let exponent = e_min + rand_below(rng, div10 - e_min);

    let mantissa = value / 10u64.pow(exponent);
    let bits_required = 64 - mantissa.leading_zeros();
    if bits_required > bits {
        bits = bits_required;
    }

    RangeProofParams {
        min_value: 0,
        exponent,
        bits: round_bits(bits),
    }
}

fn round_bits(bits: u32) -> u32 {
    (((bits + 3) / 4) * 4).min(64)
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProof {
    pub params: RangeProofParams,
    pub proof: Vec<u8>,
    pub payload: Vec<u8>,
}

impl RangeProof {
    pub fn size(&self) -> usize {
        self.proof.len() + self.payload.len() + 16
    }
}

impl fmt::Debug for RangeProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeProof")
            .field("params", &self.params)
            .field("proof_len", &self.proof.len())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Values recovered from a proof's payload
#[derive(Debug, Clone)]
pub struct Rewound {
    pub value: u64,
    pub blind: BlindingFactor,
    pub message: Vec<u8>,
}

fn scaled_generators(params: &RangeProofParams) -> Result<PedersenGens, CryptoError> {
    let base = generators();
    Ok(PedersenGens {
        B: base.B * Scalar::from(params.scale()?),
        B_blinding: base.B_blinding,
    })
}

fn proof_transcript(params: &RangeProofParams) -> Transcript {
    let mut transcript = Transcript::new(b"ringct_rangeproof");
    transcript.append_u64(b"min_value", params.min_value);
    transcript.append_u64(b"exponent", u64::from(params.exponent));
    transcript
}

/// Commitment minus the public minimum value
fn shifted_commitment(
    commitment: &Commitment,
    params: &RangeProofParams,
) -> Result<RistrettoPoint, CryptoError> {
    Ok(commitment.point()? - generators().B * Scalar::from(params.min_value))
}

pub fn sign(
    commitment: &Commitment,
    value: u64,
    blind: &BlindingFactor,
    nonce: &SharedSecret,
    message: &[u8],
    params: &RangeProofParams,
) -> Result<RangeProof, CryptoError> {
    if message.len() > MAX_MESSAGE_LEN {
        return Err(CryptoError::RangeProof(format!(
            "message is {} bytes, maximum {}",
            message.len(),
            MAX_MESSAGE_LEN
        )));
    }
    if value < params.min_value {
        return Err(CryptoError::RangeProof("value below min_value".to_string()));
    }
    let scale = params.scale()?;
    let offset = value - params.min_value;
    if offset % scale != 0 {
        return Err(CryptoError::RangeProof(format!(
            "value not a multiple of 10^{}",
            params.exponent
        )));
    }
    let mantissa = offset / scale;
    let width = params.proof_width();
    if width < 64 && mantissa >> width != 0 {
        return Err(CryptoError::RangeProof(format!(
            "value does not fit in {} bits",
            width
        )));
    }

    let pc_gens = scaled_generators(params)?;
    let mut transcript = proof_transcript(params);
    let (proof, committed) = Bulletproof::prove_single(
        &BP_GENS,
        &pc_gens,
        &mut transcript,
        mantissa,
        &blind.scalar(),
        width,
    )
    .map_err(|e| CryptoError::RangeProof(e.to_string()))?;

    if committed != shifted_commitment(commitment, params)?.compress() {
        return Err(CryptoError::RangeProof(
            "commitment does not match value and blind".to_string(),
        ));
    }

    Ok(RangeProof {
        params: *params,
        proof: proof.to_bytes(),
        payload: seal(nonce, value, blind, message)?,
    })
}

pub fn verify(commitment: &Commitment, proof: &RangeProof) -> Result<(), CryptoError> {
    let params = &proof.params;
    let bulletproof = Bulletproof::from_bytes(&proof.proof)
        .map_err(|e| CryptoError::RangeProof(e.to_string()))?;
    let pc_gens = scaled_generators(params)?;
    let mut transcript = proof_transcript(params);
    let shifted = shifted_commitment(commitment, params)?.compress();

    bulletproof
        .verify_single(
            &BP_GENS,
            &pc_gens,
            &mut transcript,
            &shifted,
            params.proof_width(),
        )
        .map_err(|e| CryptoError::RangeProof(e.to_string()))
}

/// Recover value, blind and message, checking them against the commitment
pub fn rewind(
    nonce: &SharedSecret,
    commitment: &Commitment,
    proof: &RangeProof,
) -> Result<Rewound, CryptoError> {
    let rewound = open(nonce, &proof.payload)?;
    if commit(&rewound.blind, rewound.value) != *commitment {
        return Err(CryptoError::Rewind(
            "recovered value does not open the commitment".to_string(),
        ));
    }
    Ok(rewound)
}

fn payload_cipher(nonce: &SharedSecret) -> Result<(ChaCha20Poly1305, [u8; 12]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(b"ringct_rewind"), nonce.as_bytes());
    let mut okm = [0u8; 44];
    hk.expand(b"payload", &mut okm)
        .map_err(|e| CryptoError::Rewind(e.to_string()))?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm[..32]));
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((cipher, iv))
}

fn seal(
    nonce: &SharedSecret,
    value: u64,
    blind: &BlindingFactor,
    message: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let (cipher, iv) = payload_cipher(nonce)?;

    let mut plaintext = Vec::with_capacity(40 + message.len());
    plaintext.extend_from_slice(&value.to_le_bytes());
    plaintext.extend_from_slice(blind.as_bytes());
    plaintext.extend_from_slice(message);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
        .map_err(|e| CryptoError::RangeProof(e.to_string()));
    plaintext.zeroize();
    sealed
}

fn open(nonce: &SharedSecret, payload: &[u8]) -> Result<Rewound, CryptoError> {
    let (cipher, iv) = payload_cipher(nonce)?;
    let mut plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), payload)
        .map_err(|_| CryptoError::Rewind("payload authentication failed".to_string()))?;

    if plaintext.len() < 40 || plaintext.len() > 40 + MAX_MESSAGE_LEN {
        plaintext.zeroize();
        return Err(CryptoError::Rewind("bad payload length".to_string()));
    }

    let mut value_bytes = [0u8; 8];
    value_bytes.copy_from_slice(&plaintext[..8]);
    let mut blind_bytes = [0u8; 32];
    blind_bytes.copy_from_slice(&plaintext[8..40]);
    let message = plaintext[40..].to_vec();
    plaintext.zeroize();

    let blind = BlindingFactor::from_bytes(blind_bytes);
    blind_bytes.zeroize();

    Ok(Rewound {
        value: u64::from_le_bytes(value_bytes),
        blind: blind?,
        message,
    })
}

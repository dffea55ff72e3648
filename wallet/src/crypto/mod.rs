// Confidential transaction primitives over the Ristretto group
//
// Pedersen commitments, range proofs with rewind payloads, key images,
// ECDH and MLSAG ring signatures.

pub mod keys;
pub mod mlsag;
pub mod pedersen;
pub mod rangeproof;

use thiserror::Error;

pub use keys::{
    ecdh, hash_to_point, hash_to_scalar, key_image, schnorr_sign, schnorr_verify, ExtKeyPair,
    KeyImage, PublicKey, SecretKey, SharedSecret, SCHNORR_SIGNATURE_SIZE,
};
pub use mlsag::{MlsagMatrix, MlsagSignature};
pub use pedersen::{BlindingFactor, Commitment};
pub use rangeproof::{RangeProof, RangeProofParams, Rewound};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid point encoding")]
    InvalidPoint,

    #[error("Invalid scalar encoding")]
    InvalidScalar,

    #[error("ECDH produced the identity")]
    DegenerateSharedSecret,

    #[error("Blind sum failed: {0}")]
    BlindSum(String),

    #[error("Range proof error: {0}")]
    RangeProof(String),

    #[error("Range proof rewind failed: {0}")]
    Rewind(String),

    #[error("MLSAG error: {0}")]
    Mlsag(String),

    #[error("MLSAG failed verification")]
    MlsagVerify,

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Duplicate key image: {0}")]
    DuplicateKeyImage(String),
}

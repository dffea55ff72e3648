// Ristretto key material: secret/public keys, key images, ECDH, Schnorr

use curve25519_dalek_ng::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek_ng::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek_ng::scalar::Scalar;
use curve25519_dalek_ng::traits::IsIdentity;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;
use crate::types::KeyId;

pub const SCHNORR_SIGNATURE_SIZE: usize = 64;

/// Hash arbitrary data onto the group
pub fn hash_to_point(data: &[u8]) -> RistrettoPoint {
    let mut hasher = Sha512::new();
    hasher.update(b"ringct_hash_to_point");
    hasher.update(data);
    let digest = hasher.finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    RistrettoPoint::from_uniform_bytes(&wide)
}

/// Domain-separated hash of several byte strings onto a scalar
pub fn hash_to_scalar(domain: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(domain);
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    Scalar::from_bytes_mod_order_wide(&wide)
}

#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_scalar(&Scalar::random(rng))
    }

    pub fn from_scalar(scalar: &Scalar) -> Self {
        Self(scalar.to_bytes())
    }

    /// Rejects non-canonical and zero encodings
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        match Scalar::from_canonical_bytes(bytes) {
            Some(s) if s != Scalar::zero() => Ok(Self(bytes)),
            _ => Err(CryptoError::InvalidScalar),
        }
    }

    pub fn scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_point(&(self.scalar() * RISTRETTO_BASEPOINT_POINT))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `self + tweak`
    pub fn tweak_add(&self, tweak: &Scalar) -> Result<Self, CryptoError> {
        let sum = self.scalar() + tweak;
        if sum == Scalar::zero() {
            return Err(CryptoError::InvalidScalar);
        }
        Ok(Self::from_scalar(&sum))
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for SecretKey {}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// Compressed Ristretto public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_point(point: &RistrettoPoint) -> Self {
        Self(point.compress().to_bytes())
    }

    pub fn point(&self) -> Result<RistrettoPoint, CryptoError> {
        CompressedRistretto(self.0)
            .decompress()
            .ok_or(CryptoError::InvalidPoint)
    }

    pub fn key_id(&self) -> KeyId {
        KeyId::from_pubkey_bytes(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `self + tweak·G`
    pub fn tweak_add(&self, tweak: &Scalar) -> Result<Self, CryptoError> {
        let point = self.point()? + tweak * RISTRETTO_BASEPOINT_POINT;
        if point.is_identity() {
            return Err(CryptoError::InvalidPoint);
        }
        Ok(Self::from_point(&point))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// Linkable tag of a spent key, `x·Hp(P)`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyImage(pub [u8; 32]);

impl KeyImage {
    pub fn point(&self) -> Result<RistrettoPoint, CryptoError> {
        CompressedRistretto(self.0)
            .decompress()
            .ok_or(CryptoError::InvalidPoint)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for KeyImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyImage({})", self.to_hex())
    }
}

pub fn key_image(pubkey: &PublicKey, secret: &SecretKey) -> Result<KeyImage, CryptoError> {
    if secret.public_key() != *pubkey {
        return Err(CryptoError::Signature(
            "secret key does not match public key".to_string(),
        ));
    }
    let hp = hash_to_point(pubkey.as_bytes());
    Ok(KeyImage((secret.scalar() * hp).compress().to_bytes()))
}

/// ECDH output, hashed
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub(crate) [u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// SHA-256 of the compressed point `secret·pubkey`
pub fn ecdh(secret: &SecretKey, pubkey: &PublicKey) -> Result<SharedSecret, CryptoError> {
    let point = secret.scalar() * pubkey.point()?;
    if point.is_identity() {
        return Err(CryptoError::DegenerateSharedSecret);
    }
    let digest = Sha256::digest(point.compress().as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(SharedSecret(out))
}

pub fn schnorr_sign<R: RngCore + CryptoRng>(
    rng: &mut R,
    secret: &SecretKey,
    message: &[u8; 32],
) -> [u8; SCHNORR_SIGNATURE_SIZE] {
    let pubkey = secret.public_key();
    let k = Scalar::random(rng);
    let r = PublicKey::from_point(&(k * RISTRETTO_BASEPOINT_POINT));
    let e = hash_to_scalar(b"ringct_schnorr", &[&r.0, &pubkey.0, message]);
    let s = k + e * secret.scalar();

    let mut sig = [0u8; SCHNORR_SIGNATURE_SIZE];
    sig[..32].copy_from_slice(&r.0);
    sig[32..].copy_from_slice(s.as_bytes());
    sig
}

pub fn schnorr_verify(
    pubkey: &PublicKey,
    message: &[u8; 32],
    signature: &[u8],
) -> Result<(), CryptoError> {
    if signature.len() != SCHNORR_SIGNATURE_SIZE {
        return Err(CryptoError::Signature("bad signature length".to_string()));
    }
    let mut r_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&signature[..32]);
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&signature[32..]);

    let r = PublicKey(r_bytes).point()?;
    let s = Scalar::from_canonical_bytes(s_bytes).ok_or(CryptoError::InvalidScalar)?;
    let e = hash_to_scalar(b"ringct_schnorr", &[&r_bytes, &pubkey.0, message]);

    if s * RISTRETTO_BASEPOINT_POINT == r + e * pubkey.point()? {
        Ok(())
    } else {
        Err(CryptoError::Signature("verification failed".to_string()))
    }
}

/// Extended public key: derives unlinkable non-hardened children
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtKeyPair {
    pub pubkey: PublicKey,
    pub chain_code: [u8; 32],
}

impl ExtKeyPair {
    pub fn id(&self) -> KeyId {
        self.pubkey.key_id()
    }

    fn child_tweak(&self, index: u32) -> Scalar {
        hash_to_scalar(
            b"ringct_ext_child",
            &[&self.chain_code, &self.pubkey.0, &index.to_le_bytes()],
        )
    }

    pub fn child_pubkey(&self, index: u32) -> Result<PublicKey, CryptoError> {
        self.pubkey.tweak_add(&self.child_tweak(index))
    }

    /// Child secret for the owner of the parent secret
    pub fn child_secret(&self, parent: &SecretKey, index: u32) -> Result<SecretKey, CryptoError> {
        parent.tweak_add(&self.child_tweak(index))
    }

    /// Extended child, for walking multi-level paths
    pub fn derive_child(&self, index: u32) -> Result<ExtKeyPair, CryptoError> {
        let pubkey = self.child_pubkey(index)?;
        let mut hasher = Sha256::new();
        hasher.update(b"ringct_ext_chain");
        hasher.update(self.chain_code);
        hasher.update(index.to_le_bytes());
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&hasher.finalize());
        Ok(ExtKeyPair { pubkey, chain_code })
    }
}

impl fmt::Debug for ExtKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtKeyPair({})", hex::encode(self.pubkey.0))
    }
}

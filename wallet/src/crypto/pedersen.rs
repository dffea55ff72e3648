// Pedersen commitments `v·B + r·B_blinding`

use bulletproofs::PedersenGens;
use curve25519_dalek_ng::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek_ng::scalar::Scalar;
use curve25519_dalek_ng::traits::Identity;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

pub fn generators() -> PedersenGens {
    PedersenGens::default()
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment(pub [u8; 32]);

impl Commitment {
    pub fn from_point(point: &RistrettoPoint) -> Self {
        Self(point.compress().to_bytes())
    }

    pub fn point(&self) -> Result<RistrettoPoint, CryptoError> {
        CompressedRistretto(self.0)
            .decompress()
            .ok_or(CryptoError::InvalidPoint)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({})", hex::encode(self.0))
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct BlindingFactor([u8; 32]);

impl BlindingFactor {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(Scalar::random(rng).to_bytes())
    }

    /// Blind used for plain values folded into a blinded balance
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn from_scalar(scalar: &Scalar) -> Self {
        Self(scalar.to_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        Scalar::from_canonical_bytes(bytes)
            .map(|_| Self(bytes))
            .ok_or(CryptoError::InvalidScalar)
    }

    pub fn scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl PartialEq for BlindingFactor {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for BlindingFactor {}

impl fmt::Debug for BlindingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlindingFactor([REDACTED])")
    }
}

pub fn commit(blind: &BlindingFactor, value: u64) -> Commitment {
    Commitment::from_point(&generators().commit(Scalar::from(value), blind.scalar()))
}

/// `Σ blinds[..positive] − Σ blinds[positive..]`
pub fn blind_sum(blinds: &[&BlindingFactor], positive: usize) -> Result<BlindingFactor, CryptoError> {
    if positive > blinds.len() {
        return Err(CryptoError::BlindSum(format!(
            "positive count {} exceeds {} blinds",
            positive,
            blinds.len()
        )));
    }
    let mut sum = Scalar::zero();
    for (i, blind) in blinds.iter().enumerate() {
        if i < positive {
            sum += blind.scalar();
        } else {
            sum -= blind.scalar();
        }
    }
    Ok(BlindingFactor::from_scalar(&sum))
}

/// True when `Σ positive == Σ negative` as group elements
pub fn verify_tally(positive: &[Commitment], negative: &[Commitment]) -> Result<bool, CryptoError> {
    let mut total = RistrettoPoint::identity();
    for c in positive {
        total += c.point()?;
    }
    for c in negative {
        total -= c.point()?;
    }
    Ok(total == RistrettoPoint::identity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn test_commitment_homomorphism() {
        let mut rng = thread_rng();
        let r1 = BlindingFactor::random(&mut rng);
        let r2 = BlindingFactor::random(&mut rng);
        let r_sum = BlindingFactor::from_scalar(&(r1.scalar() + r2.scalar()));

        let c1 = commit(&r1, 60);
        let c2 = commit(&r2, 40);
        let c = commit(&r_sum, 100);

        assert!(verify_tally(&[c], &[c1, c2]).unwrap());
        assert!(!verify_tally(&[commit(&r_sum, 99)], &[c1, c2]).unwrap());
    }

    #[test]
    fn test_blind_sum_balances() {
        let mut rng = thread_rng();
        let input = BlindingFactor::random(&mut rng);
        let out_a = BlindingFactor::random(&mut rng);

        // Solve the last output blind so inputs and outputs balance
        let out_b = blind_sum(&[&input, &out_a], 1).unwrap();

        let c_in = commit(&input, 100);
        let c_a = commit(&out_a, 70);
        let c_b = commit(&out_b, 30);
        assert!(verify_tally(&[c_in], &[c_a, c_b]).unwrap());
    }

    #[test]
    fn test_blind_sum_rejects_bad_count() {
        let b = BlindingFactor::zero();
        assert!(blind_sum(&[&b], 2).is_err());
    }
}

// Multilayer linkable spontaneous anonymous group signatures
//
// The matrix has one column per ring member and one row per real input plus
// a final commitment row. Key rows are keys over the base point and carry a
// key image; the commitment row is `Σ input commitments − Σ output
// commitments` for that column, which is a multiple of the blinding
// generator only in the column whose values balance.

use curve25519_dalek_ng::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek_ng::ristretto::RistrettoPoint;
use curve25519_dalek_ng::scalar::Scalar;
use curve25519_dalek_ng::traits::Identity;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::keys::{hash_to_point, hash_to_scalar, KeyImage, PublicKey, SecretKey};
use super::pedersen::{blind_sum, generators, BlindingFactor, Commitment};
use super::CryptoError;

#[derive(Clone)]
pub struct MlsagMatrix {
    cols: usize,
    rows: usize,
    // column-major: points[col * rows + row]
    points: Vec<RistrettoPoint>,
}

impl MlsagMatrix {
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Rows including the commitment row
    pub fn rows(&self) -> usize {
        self.rows
    }

    fn get(&self, col: usize, row: usize) -> &RistrettoPoint {
        &self.points[col * self.rows + row]
    }
}

impl fmt::Debug for MlsagMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MlsagMatrix({}x{})", self.cols, self.rows)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlsagSignature {
    pub c0: [u8; 32],
    /// Responses, column-major like the matrix
    pub ss: Vec<[u8; 32]>,
    pub key_images: Vec<KeyImage>,
}

impl MlsagSignature {
    /// Serialized size for a ring of `cols` members over `inputs` real inputs
    pub fn encoded_size(cols: usize, inputs: usize) -> usize {
        32 + cols * (inputs + 1) * 32 + inputs * 32
    }

    /// Zero-filled signature of the right shape, used while sizing a transaction
    pub fn dummy(cols: usize, inputs: usize) -> Self {
        Self {
            c0: [0u8; 32],
            ss: vec![[0u8; 32]; cols * (inputs + 1)],
            key_images: vec![KeyImage([0u8; 32]); inputs],
        }
    }
}

impl fmt::Debug for MlsagSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MlsagSignature")
            .field("c0", &hex::encode(self.c0))
            .field("responses", &self.ss.len())
            .field("key_images", &self.key_images)
            .finish()
    }
}

/// Build the public matrix.
///
/// `key_rows[col][k]` and `input_commitments[col][k]` hold the ring member
/// for real input `k` at column `col`.
pub fn build_matrix(
    key_rows: &[Vec<PublicKey>],
    input_commitments: &[Vec<Commitment>],
    output_commitments: &[Commitment],
) -> Result<MlsagMatrix, CryptoError> {
    let cols = key_rows.len();
    if cols == 0 || input_commitments.len() != cols {
        return Err(CryptoError::Mlsag("matrix column count mismatch".to_string()));
    }
    let inputs = key_rows[0].len();
    if inputs == 0 {
        return Err(CryptoError::Mlsag("matrix has no key rows".to_string()));
    }

    let mut out_sum = RistrettoPoint::identity();
    for c in output_commitments {
        out_sum += c.point()?;
    }

    let rows = inputs + 1;
    let mut points = Vec::with_capacity(cols * rows);
    for col in 0..cols {
        if key_rows[col].len() != inputs || input_commitments[col].len() != inputs {
            return Err(CryptoError::Mlsag(format!("ragged column {}", col)));
        }
        let mut in_sum = RistrettoPoint::identity();
        for k in 0..inputs {
            points.push(key_rows[col][k].point()?);
            in_sum += input_commitments[col][k].point()?;
        }
        points.push(in_sum - out_sum);
    }
    Ok(MlsagMatrix { cols, rows, points })
}

/// Build the signing matrix and the commitment-row secret
pub fn prepare(
    key_rows: &[Vec<PublicKey>],
    input_commitments: &[Vec<Commitment>],
    output_commitments: &[Commitment],
    input_blinds: &[&BlindingFactor],
    output_blinds: &[&BlindingFactor],
) -> Result<(MlsagMatrix, BlindingFactor), CryptoError> {
    let matrix = build_matrix(key_rows, input_commitments, output_commitments)?;
    let inputs = matrix.rows - 1;
    if input_blinds.len() != inputs {
        return Err(CryptoError::Mlsag("matrix row count mismatch".to_string()));
    }

    let mut blinds: Vec<&BlindingFactor> = input_blinds.to_vec();
    blinds.extend_from_slice(output_blinds);
    let secret = blind_sum(&blinds, inputs)?;

    Ok((matrix, secret))
}

fn challenge(message: &[u8; 32], ls: &[RistrettoPoint], rs: &[RistrettoPoint]) -> Scalar {
    let mut buf = Vec::with_capacity(32 + (ls.len() + rs.len()) * 32);
    buf.extend_from_slice(message);
    for l in ls {
        buf.extend_from_slice(l.compress().as_bytes());
    }
    for r in rs {
        buf.extend_from_slice(r.compress().as_bytes());
    }
    hash_to_scalar(b"ringct_mlsag", &[&buf])
}

pub fn generate<R: RngCore + CryptoRng>(
    rng: &mut R,
    message: &[u8; 32],
    matrix: &MlsagMatrix,
    secrets: &[&SecretKey],
    commitment_secret: &BlindingFactor,
    secret_col: usize,
) -> Result<MlsagSignature, CryptoError> {
    let n = matrix.cols;
    let m = matrix.rows - 1;
    if secret_col >= n {
        return Err(CryptoError::Mlsag("secret column out of range".to_string()));
    }
    if secrets.len() != m {
        return Err(CryptoError::Mlsag(format!(
            "expected {} secret keys, got {}",
            m,
            secrets.len()
        )));
    }

    let g = RISTRETTO_BASEPOINT_POINT;
    let h = generators().B_blinding;

    for (k, x) in secrets.iter().enumerate() {
        if x.scalar() * g != *matrix.get(secret_col, k) {
            return Err(CryptoError::Mlsag(format!("secret key {} not in ring", k)));
        }
    }
    if commitment_secret.scalar() * h != *matrix.get(secret_col, m) {
        return Err(CryptoError::Mlsag(
            "commitment row does not balance".to_string(),
        ));
    }

    let hp: Vec<RistrettoPoint> = (0..n * m)
        .map(|i| hash_to_point(matrix.get(i / m, i % m).compress().as_bytes()))
        .collect();
    let hp_at = |col: usize, row: usize| &hp[col * m + row];

    let images: Vec<RistrettoPoint> = secrets
        .iter()
        .enumerate()
        .map(|(k, x)| x.scalar() * hp_at(secret_col, k))
        .collect();

    let alpha: Vec<Scalar> = (0..=m).map(|_| Scalar::random(rng)).collect();
    let mut ss = vec![Scalar::zero(); n * (m + 1)];
    let mut cs = vec![Scalar::zero(); n];

    let mut ls = Vec::with_capacity(m + 1);
    let mut rs = Vec::with_capacity(m);
    for k in 0..m {
        ls.push(alpha[k] * g);
        rs.push(alpha[k] * hp_at(secret_col, k));
    }
    ls.push(alpha[m] * h);
    cs[(secret_col + 1) % n] = challenge(message, &ls, &rs);

    let mut col = (secret_col + 1) % n;
    while col != secret_col {
        ls.clear();
        rs.clear();
        for k in 0..=m {
            let s = Scalar::random(rng);
            ss[col * (m + 1) + k] = s;
            if k < m {
                ls.push(s * g + cs[col] * matrix.get(col, k));
                rs.push(s * hp_at(col, k) + cs[col] * images[k]);
            } else {
                ls.push(s * h + cs[col] * matrix.get(col, k));
            }
        }
        cs[(col + 1) % n] = challenge(message, &ls, &rs);
        col = (col + 1) % n;
    }

    for k in 0..m {
        ss[secret_col * (m + 1) + k] = alpha[k] - cs[secret_col] * secrets[k].scalar();
    }
    ss[secret_col * (m + 1) + m] = alpha[m] - cs[secret_col] * commitment_secret.scalar();

    Ok(MlsagSignature {
        c0: cs[0].to_bytes(),
        ss: ss.iter().map(|s| s.to_bytes()).collect(),
        key_images: images
            .iter()
            .map(|i| KeyImage(i.compress().to_bytes()))
            .collect(),
    })
}

pub fn verify(
    message: &[u8; 32],
    matrix: &MlsagMatrix,
    signature: &MlsagSignature,
) -> Result<(), CryptoError> {
    let n = matrix.cols;
    let m = matrix.rows - 1;
    if signature.ss.len() != n * (m + 1) || signature.key_images.len() != m {
        return Err(CryptoError::Mlsag("signature shape mismatch".to_string()));
    }

    let g = RISTRETTO_BASEPOINT_POINT;
    let h = generators().B_blinding;
    let images = signature
        .key_images
        .iter()
        .map(|i| i.point())
        .collect::<Result<Vec<_>, _>>()?;
    let c0 = Scalar::from_canonical_bytes(signature.c0).ok_or(CryptoError::InvalidScalar)?;

    let mut c = c0;
    let mut ls = Vec::with_capacity(m + 1);
    let mut rs = Vec::with_capacity(m);
    for col in 0..n {
        ls.clear();
        rs.clear();
        for k in 0..=m {
            let s = Scalar::from_canonical_bytes(signature.ss[col * (m + 1) + k])
                .ok_or(CryptoError::InvalidScalar)?;
            let p = matrix.get(col, k);
            if k < m {
                let hp = hash_to_point(p.compress().as_bytes());
                ls.push(s * g + c * p);
                rs.push(s * hp + c * images[k]);
            } else {
                ls.push(s * h + c * p);
            }
        }
        c = challenge(message, &ls, &rs);
    }

    if c == c0 {
        Ok(())
    } else {
        Err(CryptoError::MlsagVerify)
    }
}

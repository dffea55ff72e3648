// Transaction Model
// Inputs, typed outputs, output data payloads, hashing and sizing

use serde::{Deserialize, Serialize};

use crate::crypto::{Commitment, KeyImage, MlsagSignature, PublicKey, RangeProof};
use crate::error::{Result, WalletError};
use crate::types::{get_varint, put_varint, Amount, Hash256, OutPoint, OutputKind, Script, Txid};

/// Output data tags
pub const DO_STEALTH: u8 = 1;
pub const DO_STEALTH_PREFIX: u8 = 2;
pub const DO_NARRATION: u8 = 4;
pub const DO_FEE: u8 = 6;

/// Output index marking an anonymous input's synthetic outpoint
pub const ANON_OUTPOINT_INDEX: u32 = u32::MAX;

/// Outpoint standing in for an anonymous input, derived from its key image
pub fn anon_outpoint(image: &KeyImage) -> OutPoint {
    OutPoint::new(Hash256(image.0), ANON_OUTPOINT_INDEX)
}

pub fn is_anon_outpoint(outpoint: &OutPoint) -> bool {
    outpoint.n == ANON_OUTPOINT_INDEX
}

/// Tagged payload carried by data outputs and by blinded outputs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputData {
    pub ephemeral: Option<PublicKey>,
    pub prefix: Option<u32>,
    pub narration: Option<Vec<u8>>,
    pub fee: Option<Amount>,
}

impl OutputData {
    pub fn fee(fee: Amount) -> Self {
        Self {
            fee: Some(fee),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(fee) = self.fee {
            out.push(DO_FEE);
            put_varint(&mut out, fee.max(0) as u64);
        }
        if let Some(ephemeral) = &self.ephemeral {
            out.push(DO_STEALTH);
            out.extend_from_slice(ephemeral.as_bytes());
        }
        if let Some(prefix) = self.prefix {
            out.push(DO_STEALTH_PREFIX);
            out.extend_from_slice(&prefix.to_le_bytes());
        }
        if let Some(narration) = &self.narration {
            out.push(DO_NARRATION);
            put_varint(&mut out, narration.len() as u64);
            out.extend_from_slice(narration);
        }
        out
    }

    /// None on unknown tags or truncated fields
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut parsed = Self::default();
        let mut i = 0;
        while i < data.len() {
            let tag = data[i];
            i += 1;
            match tag {
                DO_FEE => {
                    let (fee, used) = get_varint(data, i)?;
                    parsed.fee = Some(i64::try_from(fee).ok()?);
                    i += used;
                }
                DO_STEALTH => {
                    let bytes = data.get(i..i + 32)?;
                    let mut key = [0u8; 32];
                    key.copy_from_slice(bytes);
                    parsed.ephemeral = Some(PublicKey(key));
                    i += 32;
                }
                DO_STEALTH_PREFIX => {
                    let bytes = data.get(i..i + 4)?;
                    let mut prefix = [0u8; 4];
                    prefix.copy_from_slice(bytes);
                    parsed.prefix = Some(u32::from_le_bytes(prefix));
                    i += 4;
                }
                DO_NARRATION => {
                    let (len, used) = get_varint(data, i)?;
                    i += used;
                    let end = i.checked_add(usize::try_from(len).ok()?)?;
                    parsed.narration = Some(data.get(i..end)?.to_vec());
                    i = end;
                }
                _ => return None,
            }
        }
        Some(parsed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOut {
    Standard {
        value: Amount,
        script: Script,
    },
    Blinded {
        commitment: Commitment,
        script: Script,
        data: Vec<u8>,
        range_proof: RangeProof,
    },
    Anon {
        pubkey: PublicKey,
        commitment: Commitment,
        data: Vec<u8>,
        range_proof: RangeProof,
    },
    Data {
        data: Vec<u8>,
    },
}

impl TxOut {
    pub fn kind(&self) -> OutputKind {
        match self {
            TxOut::Standard { .. } => OutputKind::Standard,
            TxOut::Blinded { .. } => OutputKind::Blinded,
            TxOut::Anon { .. } => OutputKind::Anonymous,
            TxOut::Data { .. } => OutputKind::DataCarrier,
        }
    }

    /// Cleartext value, for standard outputs only
    pub fn value(&self) -> Option<Amount> {
        match self {
            TxOut::Standard { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn commitment(&self) -> Option<&Commitment> {
        match self {
            TxOut::Blinded { commitment, .. } | TxOut::Anon { commitment, .. } => Some(commitment),
            _ => None,
        }
    }

    pub fn script(&self) -> Option<&Script> {
        match self {
            TxOut::Standard { script, .. } | TxOut::Blinded { script, .. } => Some(script),
            _ => None,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            TxOut::Blinded { data, .. } | TxOut::Anon { data, .. } | TxOut::Data { data } => data,
            TxOut::Standard { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxIn {
    /// Spend of a standard or blinded output
    Standard {
        prevout: OutPoint,
        pubkey: PublicKey,
        signature: Vec<u8>,
    },
    /// Ring-signed spend of one or more anonymous outputs
    Anon {
        /// Global anon indices, `ring[column][input]`
        ring: Vec<Vec<u64>>,
        /// Commitment to this signature's input value when the
        /// transaction carries more than one ring signature
        split_commitment: Option<Commitment>,
        signature: MlsagSignature,
    },
}

impl TxIn {
    pub fn key_images(&self) -> &[KeyImage] {
        match self {
            TxIn::Anon { signature, .. } => &signature.key_images,
            TxIn::Standard { .. } => &[],
        }
    }

    /// Real prevout, or one synthetic outpoint per key image
    pub fn prevouts(&self) -> Vec<OutPoint> {
        match self {
            TxIn::Standard { prevout, .. } => vec![*prevout],
            TxIn::Anon { signature, .. } => signature.key_images.iter().map(anon_outpoint).collect(),
        }
    }

    fn stripped(&self) -> TxIn {
        match self {
            TxIn::Standard {
                prevout, pubkey, ..
            } => TxIn::Standard {
                prevout: *prevout,
                pubkey: *pubkey,
                signature: Vec::new(),
            },
            TxIn::Anon {
                ring,
                split_commitment,
                signature,
            } => TxIn::Anon {
                ring: ring.clone(),
                split_commitment: *split_commitment,
                signature: MlsagSignature {
                    c0: [0u8; 32],
                    ss: Vec::new(),
                    key_images: signature.key_images.clone(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u16,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| WalletError::Serialization(e.to_string()))
}

impl Transaction {
    pub fn new(lock_time: u32) -> Self {
        Self {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time,
        }
    }

    pub fn txid(&self) -> Result<Txid> {
        Ok(Hash256::hash(&encode(self)?))
    }

    /// Hash committed to by input signatures: everything but the signatures
    pub fn signature_hash(&self) -> Result<Hash256> {
        let stripped = Transaction {
            version: self.version,
            inputs: self.inputs.iter().map(TxIn::stripped).collect(),
            outputs: self.outputs.clone(),
            lock_time: self.lock_time,
        };
        Ok(Hash256::hash(&encode(&stripped)?))
    }

    /// Message signed by ring signatures
    pub fn outputs_hash(&self) -> Result<Hash256> {
        Ok(Hash256::hash(&encode(&self.outputs)?))
    }

    /// Serialized size in bytes
    pub fn size(&self) -> Result<usize> {
        bincode::serialized_size(self)
            .map(|s| s as usize)
            .map_err(|e| WalletError::Serialization(e.to_string()))
    }

    /// Fee declared by the leading data output, if any
    pub fn declared_fee(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .filter_map(|o| match o {
                TxOut::Data { data } => OutputData::parse(data).and_then(|d| d.fee),
                _ => None,
            })
            .next()
    }

    pub fn key_images(&self) -> Vec<KeyImage> {
        self.inputs
            .iter()
            .flat_map(|i| i.key_images().iter().copied())
            .collect()
    }

    pub fn has_anon_inputs(&self) -> bool {
        self.inputs.iter().any(|i| matches!(i, TxIn::Anon { .. }))
    }

    /// Sum of cleartext output values
    pub fn plain_output_value(&self) -> Amount {
        self.outputs.iter().filter_map(TxOut::value).sum()
    }
}

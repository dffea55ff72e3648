// Transaction Records
// The wallet's durable view of transactions and their outputs

use serde::{Deserialize, Serialize};

use crate::crypto::{BlindingFactor, Commitment, KeyImage, PublicKey};
use crate::types::{Amount, BlockHash, KeyId, OutPoint, OutputKind, Script, Txid};

/// Output record flags
pub mod flags {
    pub const OWNED: u32 = 1 << 0;
    pub const FROM_ME: u32 = 1 << 1;
    pub const CHANGE: u32 = 1 << 2;
    pub const SPENT: u32 = 1 << 3;
    pub const LOCKED: u32 = 1 << 4;
    pub const STEALTH: u32 = 1 << 5;
    pub const WATCH_ONLY: u32 = 1 << 6;
    pub const PENDING_SPEND: u32 = 1 << 7;

    // Transaction record flags
    pub const STANDARD_IN: u32 = 1 << 13;
    pub const BLIND_IN: u32 = 1 << 14;
    pub const ANON_IN: u32 = 1 << 15;
    pub const ABANDONED: u32 = 1 << 16;
}

/// Output index of the balancing placeholder record
pub const PLACEHOLDER_INDEX: u32 = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub n: u32,
    pub kind: OutputKind,
    pub flags: u32,
    /// Cleartext value, recovered through the shared secret for blinded kinds
    pub value: Amount,
    pub script: Script,
    pub narration: Option<String>,
    /// Owning stealth address, by id
    pub stealth_address: Option<KeyId>,
    /// Id of the spending key
    pub key_id: Option<KeyId>,
    pub commitment: Option<Commitment>,
    pub blind: Option<BlindingFactor>,
    /// One-time key of an anonymous output
    pub anon_pubkey: Option<PublicKey>,
    pub key_image: Option<KeyImage>,
}

impl OutputRecord {
    pub fn new(n: u32, kind: OutputKind, value: Amount) -> Self {
        Self {
            n,
            kind,
            flags: 0,
            value,
            script: Script::default(),
            narration: None,
            stealth_address: None,
            key_id: None,
            commitment: None,
            blind: None,
            anon_pubkey: None,
            key_image: None,
        }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn is_owned(&self) -> bool {
        self.has(flags::OWNED)
    }

    /// Owned, not locked and not spent according to the cached flag
    pub fn is_spendable(&self) -> bool {
        self.is_owned() && !self.has(flags::LOCKED) && !self.has(flags::WATCH_ONLY)
    }
}

/// Block position of a confirmed (or conflicted, when `index < 0`) transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub hash: BlockHash,
    pub index: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub txid: Txid,
    /// Sorted ascending by `n`, unique
    pub outputs: Vec<OutputRecord>,
    pub inputs: Vec<OutPoint>,
    pub fee: Amount,
    pub block: Option<BlockRef>,
    /// Receipt time, unix seconds
    pub time: i64,
    pub flags: u32,
}

impl TransactionRecord {
    pub fn new(txid: Txid) -> Self {
        Self {
            txid,
            outputs: Vec::new(),
            inputs: Vec::new(),
            fee: 0,
            block: None,
            time: chrono::Utc::now().timestamp(),
            flags: 0,
        }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn is_abandoned(&self) -> bool {
        self.has(flags::ABANDONED)
    }

    pub fn is_from_me(&self) -> bool {
        self.has(flags::STANDARD_IN | flags::BLIND_IN | flags::ANON_IN)
    }

    pub fn output(&self, n: u32) -> Option<&OutputRecord> {
        self.outputs
            .binary_search_by_key(&n, |o| o.n)
            .ok()
            .map(|i| &self.outputs[i])
    }

    pub fn output_mut(&mut self, n: u32) -> Option<&mut OutputRecord> {
        match self.outputs.binary_search_by_key(&n, |o| o.n) {
            Ok(i) => Some(&mut self.outputs[i]),
            Err(_) => None,
        }
    }

    /// Replace the record for `output.n`, or insert it in sorted position.
    /// Returns true if anything changed.
    pub fn insert_output(&mut self, output: OutputRecord) -> bool {
        match self.outputs.binary_search_by_key(&output.n, |o| o.n) {
            Ok(i) => {
                if self.outputs[i] == output {
                    false
                } else {
                    self.outputs[i] = output;
                    true
                }
            }
            Err(i) => {
                self.outputs.insert(i, output);
                true
            }
        }
    }

    pub fn total_output(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Insert or clear the placeholder so that `total_output() + fee == input_value`
    pub fn balance_with_placeholder(&mut self, input_value: Amount) {
        self.outputs.retain(|o| o.n != PLACEHOLDER_INDEX);
        let diff = input_value - self.total_output() - self.fee;
        if diff != 0 {
            let mut placeholder = OutputRecord::new(PLACEHOLDER_INDEX, OutputKind::DataCarrier, diff);
            placeholder.flags = flags::FROM_ME;
            self.insert_output(placeholder);
        }
    }

    /// Owned value in outputs, excluding change
    pub fn credit_excluding_change(&self) -> Amount {
        self.outputs
            .iter()
            .filter(|o| o.is_owned() && !o.has(flags::CHANGE))
            .map(|o| o.value)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash256;

    fn owned(n: u32, value: Amount) -> OutputRecord {
        let mut o = OutputRecord::new(n, OutputKind::Standard, value);
        o.flags = flags::OWNED;
        o
    }

    #[test]
    fn test_sorted_insert_and_update() {
        let mut rtx = TransactionRecord::new(Hash256::hash(b"tx"));
        assert!(rtx.insert_output(owned(3, 30)));
        assert!(rtx.insert_output(owned(1, 10)));
        assert!(rtx.insert_output(owned(2, 20)));

        let ns: Vec<u32> = rtx.outputs.iter().map(|o| o.n).collect();
        assert_eq!(ns, vec![1, 2, 3]);

        // Same content is a no-op, new content replaces
        assert!(!rtx.insert_output(owned(2, 20)));
        assert!(rtx.insert_output(owned(2, 25)));
        assert_eq!(rtx.outputs.len(), 3);
        assert_eq!(rtx.output(2).map(|o| o.value), Some(25));
        assert_eq!(rtx.total_output(), 65);
    }

    #[test]
    fn test_placeholder_balances() {
        let mut rtx = TransactionRecord::new(Hash256::hash(b"tx"));
        rtx.fee = 100;
        rtx.insert_output(owned(1, 1_000));

        rtx.balance_with_placeholder(5_000);
        let placeholder = rtx.output(PLACEHOLDER_INDEX).unwrap();
        assert_eq!(placeholder.value, 3_900);
        assert_eq!(placeholder.kind, OutputKind::DataCarrier);
        assert_eq!(rtx.total_output() + rtx.fee, 5_000);

        // Balanced again: the placeholder goes away
        rtx.balance_with_placeholder(1_100);
        assert!(rtx.output(PLACEHOLDER_INDEX).is_none());
    }

    #[test]
    fn test_flags() {
        let mut rtx = TransactionRecord::new(Hash256::zero());
        assert!(!rtx.is_from_me());
        rtx.flags |= flags::BLIND_IN;
        assert!(rtx.is_from_me());
        rtx.flags |= flags::ABANDONED;
        assert!(rtx.is_abandoned());
    }
}

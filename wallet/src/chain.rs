// Chain State
// What the wallet needs to know about blocks, the mempool, fees and the
// global anonymous-output set

use std::collections::{HashMap, HashSet};

use crate::crypto::{Commitment, PublicKey};
use crate::types::{Amount, BlockHash, OutPoint, Txid};

/// Entry of the global anonymous-output set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnonOutput {
    pub pubkey: PublicKey,
    pub commitment: Commitment,
    /// Height of the block that created it
    pub height: i32,
    pub outpoint: OutPoint,
}

pub trait ChainState {
    fn best_height(&self) -> i32;

    /// Confirmations of a transaction at `(block, index)`. 0 when unconfirmed,
    /// negative when the position conflicts with the main chain.
    fn confirmation_depth(&self, block: &BlockHash, index: i32) -> i32;

    fn utxo_exists(&self, outpoint: &OutPoint) -> bool;

    fn mempool_contains(&self, txid: &Txid) -> bool;

    /// In-mempool ancestor and descendant counts, `(0, 0)` when not pooled
    fn mempool_ancestry(&self, txid: &Txid) -> (usize, usize);

    fn minimum_relay_fee(&self, size: usize) -> Amount;

    fn minimum_required_fee(&self, size: usize, confirm_target: u32) -> Amount;

    /// Number of anonymous outputs; valid indices are `1..=count`
    fn anon_output_count(&self) -> u64;

    fn anon_output(&self, index: u64) -> Option<AnonOutput>;

    fn anon_index_of(&self, pubkey: &PublicKey) -> Option<u64>;
}

/// How a `MemoryChain` prices transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeePolicy {
    PerKb(Amount),
    Fixed(Amount),
}

/// Chain state held in memory, for embedding and tests
#[derive(Debug, Clone)]
pub struct MemoryChain {
    best_height: i32,
    blocks: HashMap<BlockHash, i32>,
    utxos: HashSet<OutPoint>,
    mempool: HashMap<Txid, (usize, usize)>,
    fee_policy: FeePolicy,
    relay_fee_per_kb: Amount,
    anon_outputs: Vec<AnonOutput>,
    anon_index: HashMap<PublicKey, u64>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    pub fn new() -> Self {
        Self {
            best_height: 0,
            blocks: HashMap::new(),
            utxos: HashSet::new(),
            mempool: HashMap::new(),
            fee_policy: FeePolicy::PerKb(10_000),
            relay_fee_per_kb: 1_000,
            anon_outputs: Vec::new(),
            anon_index: HashMap::new(),
        }
    }

    pub fn set_fee_policy(&mut self, policy: FeePolicy) {
        self.fee_policy = policy;
    }

    pub fn set_relay_fee_per_kb(&mut self, rate: Amount) {
        self.relay_fee_per_kb = rate;
    }

    /// Append a block at the next height and make it the tip
    pub fn add_block(&mut self, hash: BlockHash) -> i32 {
        self.best_height += 1;
        self.blocks.insert(hash, self.best_height);
        self.best_height
    }

    /// Advance the tip by `count` anonymous blocks
    pub fn mine_empty(&mut self, count: i32) {
        for _ in 0..count {
            let mut seed = [0u8; 36];
            seed[..4].copy_from_slice(&(self.best_height + 1).to_le_bytes());
            self.add_block(BlockHash::hash(&seed));
        }
    }

    pub fn block_height(&self, hash: &BlockHash) -> Option<i32> {
        self.blocks.get(hash).copied()
    }

    pub fn add_utxo(&mut self, outpoint: OutPoint) {
        self.utxos.insert(outpoint);
    }

    pub fn spend_utxo(&mut self, outpoint: &OutPoint) {
        self.utxos.remove(outpoint);
    }

    pub fn add_to_mempool(&mut self, txid: Txid, ancestors: usize, descendants: usize) {
        self.mempool.insert(txid, (ancestors, descendants));
    }

    pub fn remove_from_mempool(&mut self, txid: &Txid) {
        self.mempool.remove(txid);
    }

    /// Register an anonymous output, returning its global index
    pub fn push_anon_output(
        &mut self,
        pubkey: PublicKey,
        commitment: Commitment,
        height: i32,
        outpoint: OutPoint,
    ) -> u64 {
        self.anon_outputs.push(AnonOutput {
            pubkey,
            commitment,
            height,
            outpoint,
        });
        let index = self.anon_outputs.len() as u64;
        self.anon_index.insert(pubkey, index);
        index
    }
}

impl ChainState for MemoryChain {
    fn best_height(&self) -> i32 {
        self.best_height
    }

    fn confirmation_depth(&self, block: &BlockHash, index: i32) -> i32 {
        match self.blocks.get(block) {
            Some(height) => {
                let depth = self.best_height - height + 1;
                if index < 0 {
                    -depth
                } else {
                    depth
                }
            }
            None => 0,
        }
    }

    fn utxo_exists(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains(outpoint)
    }

    fn mempool_contains(&self, txid: &Txid) -> bool {
        self.mempool.contains_key(txid)
    }

    fn mempool_ancestry(&self, txid: &Txid) -> (usize, usize) {
        self.mempool.get(txid).copied().unwrap_or((0, 0))
    }

    fn minimum_relay_fee(&self, size: usize) -> Amount {
        self.relay_fee_per_kb * size as Amount / 1_000
    }

    fn minimum_required_fee(&self, size: usize, _confirm_target: u32) -> Amount {
        let fee = match self.fee_policy {
            FeePolicy::PerKb(rate) => rate * size as Amount / 1_000,
            FeePolicy::Fixed(fee) => fee,
        };
        fee.max(self.minimum_relay_fee(size))
    }

    fn anon_output_count(&self) -> u64 {
        self.anon_outputs.len() as u64
    }

    fn anon_output(&self, index: u64) -> Option<AnonOutput> {
        let slot = usize::try_from(index.checked_sub(1)?).ok()?;
        self.anon_outputs.get(slot).copied()
    }

    fn anon_index_of(&self, pubkey: &PublicKey) -> Option<u64> {
        self.anon_index.get(pubkey).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash256;

    #[test]
    fn test_depth() {
        let mut chain = MemoryChain::new();
        let a = Hash256::hash(b"a");
        chain.add_block(a);
        chain.mine_empty(4);

        assert_eq!(chain.best_height(), 5);
        assert_eq!(chain.confirmation_depth(&a, 0), 5);
        assert_eq!(chain.confirmation_depth(&a, -1), -5);
        assert_eq!(chain.confirmation_depth(&Hash256::hash(b"b"), 0), 0);
    }

    #[test]
    fn test_fees() {
        let mut chain = MemoryChain::new();
        assert_eq!(chain.minimum_required_fee(500, 6), 5_000);

        chain.set_fee_policy(FeePolicy::Fixed(1_000));
        assert_eq!(chain.minimum_required_fee(500, 6), 1_000);
        // Never below relay
        assert_eq!(chain.minimum_required_fee(2_000_000, 6), 2_000_000);
    }

    #[test]
    fn test_anon_index() {
        let mut chain = MemoryChain::new();
        let pk = PublicKey([1u8; 32]);
        let idx = chain.push_anon_output(
            pk,
            Commitment([2u8; 32]),
            1,
            OutPoint::new(Hash256::zero(), 0),
        );
        assert_eq!(idx, 1);
        assert_eq!(chain.anon_output_count(), 1);
        assert_eq!(chain.anon_index_of(&pk), Some(1));
        assert!(chain.anon_output(0).is_none());
        assert_eq!(chain.anon_output(1).map(|o| o.pubkey), Some(pk));
        assert!(chain.anon_output(2).is_none());
        assert!(chain.anon_output(u64::MAX).is_none());
    }
}

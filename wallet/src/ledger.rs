// Ledger
// Transaction records, the spend index and the key-image index.
//
// Mutations are planned against the current state, committed to storage by
// the caller, then applied with `apply`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info};

use crate::chain::ChainState;
use crate::crypto::KeyImage;
use crate::error::{Result, WalletError};
use crate::records::{flags, BlockRef, OutputRecord, TransactionRecord, PLACEHOLDER_INDEX};
use crate::transaction::{anon_outpoint, is_anon_outpoint};
use crate::types::{BlockHash, OutPoint, Txid};

/// Records to write, keyed by txid
#[derive(Debug, Default, Clone)]
pub struct LedgerUpdate {
    pub records: BTreeMap<Txid, TransactionRecord>,
    pub key_images: Vec<(KeyImage, OutPoint)>,
}

impl LedgerUpdate {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.key_images.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Updated,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct Ledger {
    records: HashMap<Txid, TransactionRecord>,
    /// Outpoint to spending transactions; several before confirmation
    spends: HashMap<OutPoint, BTreeSet<Txid>>,
    /// Key image to the owned anonymous output it spends
    key_images: HashMap<KeyImage, OutPoint>,
    images_by_outpoint: HashMap<OutPoint, KeyImage>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored records and key images
    pub fn from_parts(records: Vec<TransactionRecord>, key_images: Vec<(KeyImage, OutPoint)>) -> Self {
        let mut ledger = Self::new();
        for (image, outpoint) in key_images {
            ledger.insert_key_image(image, outpoint);
        }
        for record in records {
            ledger.insert(record);
        }
        ledger
    }

    pub fn get(&self, txid: &Txid) -> Option<&TransactionRecord> {
        self.records.get(txid)
    }

    pub fn records(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn output(&self, outpoint: &OutPoint) -> Option<&OutputRecord> {
        self.records.get(&outpoint.txid)?.output(outpoint.n)
    }

    pub fn key_image_owner(&self, image: &KeyImage) -> Option<&OutPoint> {
        self.key_images.get(image)
    }

    pub fn key_image_of(&self, outpoint: &OutPoint) -> Option<&KeyImage> {
        self.images_by_outpoint.get(outpoint)
    }

    /// Owned outpoint behind an input reference, resolving anonymous spends
    /// through the key-image index
    pub fn resolve(&self, input: &OutPoint) -> Option<OutPoint> {
        if is_anon_outpoint(input) {
            self.key_images.get(&KeyImage(input.txid.0)).copied()
        } else {
            Some(*input)
        }
    }

    pub fn depth(&self, record: &TransactionRecord, chain: &dyn ChainState) -> i32 {
        match record.block {
            Some(block) => chain.confirmation_depth(&block.hash, block.index),
            None => 0,
        }
    }

    /// Confirmed, or our own pooled transaction spending only our outputs
    pub fn is_trusted(&self, record: &TransactionRecord, chain: &dyn ChainState) -> bool {
        let depth = self.depth(record, chain);
        if depth >= 1 {
            return true;
        }
        if depth < 0 || record.is_abandoned() || !record.is_from_me() {
            return false;
        }
        if !chain.mempool_contains(&record.txid) {
            return false;
        }
        record.inputs.iter().all(|input| {
            self.resolve(input)
                .and_then(|o| self.output(&o))
                .map(OutputRecord::is_owned)
                .unwrap_or(false)
        })
    }

    /// Transactions spending `outpoint`, including ring spends of its key image
    pub fn spenders(&self, outpoint: &OutPoint) -> Vec<Txid> {
        let mut txids: Vec<Txid> = self
            .spends
            .get(outpoint)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        if let Some(image) = self.images_by_outpoint.get(outpoint) {
            if let Some(ring_spends) = self.spends.get(&anon_outpoint(image)) {
                txids.extend(ring_spends.iter().copied());
            }
        }
        txids
    }

    /// Spent by any transaction that is neither abandoned nor conflicted
    pub fn is_spent(&self, outpoint: &OutPoint, chain: &dyn ChainState) -> bool {
        let spenders = self.spenders(outpoint);
        if spenders.is_empty() {
            // Flagged with no spender: retired by `plan_mark_spent`
            return self.output(outpoint).map_or(false, |o| o.has(flags::SPENT));
        }
        spenders.iter().any(|txid| match self.records.get(txid) {
            Some(spender) => !spender.is_abandoned() && self.depth(spender, chain) >= 0,
            None => false,
        })
    }

    /// True if a wallet transaction spends the key image
    pub fn key_image_spent(&self, image: &KeyImage) -> bool {
        self.spends.contains_key(&anon_outpoint(image))
    }

    /// Merge `incoming` into the stored record. None when nothing changes.
    pub fn merge(&self, incoming: TransactionRecord) -> Option<TransactionRecord> {
        let existing = match self.records.get(&incoming.txid) {
            Some(existing) => existing,
            None => return Some(incoming),
        };

        let mut merged = existing.clone();
        if let Some(block) = incoming.block {
            if merged.block != Some(block) {
                merged.block = Some(block);
            }
            if block.index >= 0 {
                merged.flags &= !flags::ABANDONED;
            }
        }
        merged.flags |= incoming.flags & !flags::ABANDONED;
        if merged.fee == 0 && incoming.fee != 0 {
            merged.fee = incoming.fee;
        }
        if merged.inputs.is_empty() {
            merged.inputs = incoming.inputs;
        }
        for mut output in incoming.outputs {
            if let Some(current) = merged.output(output.n) {
                if output.has(flags::LOCKED) && !current.has(flags::LOCKED) {
                    // Already resolved with the spend key
                    continue;
                }
                output.flags |= current.flags
                    & (flags::SPENT | flags::PENDING_SPEND | flags::CHANGE | flags::FROM_ME);
                if output.narration.is_none() {
                    output.narration = current.narration.clone();
                }
                if output.key_image.is_none() {
                    output.key_image = current.key_image;
                }
                if output.stealth_address.is_none() {
                    output.stealth_address = current.stealth_address;
                }
            }
            merged.insert_output(output);
        }

        if merged == *existing {
            None
        } else {
            Some(merged)
        }
    }

    /// Plan the insertion of `incoming`, with spent-flag updates on the
    /// outputs it consumes
    pub fn plan_record(&self, incoming: TransactionRecord) -> (LedgerUpdate, RecordOutcome) {
        let mut update = LedgerUpdate::default();
        let merged = match self.merge(incoming) {
            Some(merged) => merged,
            None => return (update, RecordOutcome::Unchanged),
        };
        let txid = merged.txid;
        let inputs = merged.inputs.clone();
        update.records.insert(txid, merged);
        self.refresh_spent_flags(&mut update.records, &inputs, Some(txid));
        (update, RecordOutcome::Updated)
    }

    /// Plan retiring an owned output that can never be spent, such as one
    /// whose key image the index already gives to another output
    pub fn plan_mark_spent(&self, outpoint: &OutPoint) -> LedgerUpdate {
        let mut update = LedgerUpdate::default();
        let mut record = match self.records.get(&outpoint.txid) {
            Some(r) => r.clone(),
            None => return update,
        };
        if let Some(output) = record.output_mut(outpoint.n) {
            if !output.has(flags::SPENT) {
                output.flags |= flags::SPENT;
                update.records.insert(record.txid, record);
            }
        }
        update
    }

    /// Plan recomputing every cached spent flag, used after loading
    pub fn plan_spent_refresh(&self) -> LedgerUpdate {
        let mut update = LedgerUpdate::default();
        let inputs: Vec<OutPoint> = self
            .records
            .values()
            .flat_map(|r| r.inputs.iter().copied())
            .collect();
        self.refresh_spent_flags(&mut update.records, &inputs, None);
        update
    }

    fn record_view<'a>(
        &'a self,
        pending: &'a BTreeMap<Txid, TransactionRecord>,
        txid: &Txid,
    ) -> Option<&'a TransactionRecord> {
        pending.get(txid).or_else(|| self.records.get(txid))
    }

    /// Recompute SPENT and PENDING_SPEND for the outputs behind `inputs`
    fn refresh_spent_flags(
        &self,
        pending: &mut BTreeMap<Txid, TransactionRecord>,
        inputs: &[OutPoint],
        extra_spender: Option<Txid>,
    ) {
        for input in inputs {
            let owned = match self.resolve(input) {
                Some(o) => o,
                None => continue,
            };

            let mut spenders: BTreeSet<Txid> = self.spenders(&owned).into_iter().collect();
            if let Some(txid) = extra_spender {
                spenders.insert(txid);
            }

            let mut state = 0u32;
            for txid in &spenders {
                let spender = match self.record_view(pending, txid) {
                    Some(r) => r,
                    None => continue,
                };
                if spender.is_abandoned() {
                    continue;
                }
                match spender.block {
                    Some(block) if block.index < 0 => {}
                    Some(_) => state = flags::SPENT,
                    None if state == 0 => state = flags::PENDING_SPEND,
                    None => {}
                }
            }

            let mut record = match self.record_view(pending, &owned.txid) {
                Some(r) => r.clone(),
                None => continue,
            };
            let changed = match record.output_mut(owned.n) {
                Some(output) => {
                    let before = output.flags;
                    output.flags = (output.flags & !(flags::SPENT | flags::PENDING_SPEND)) | state;
                    before != output.flags
                }
                None => false,
            };
            if changed {
                pending.insert(record.txid, record);
            }
        }
    }

    fn children(&self, record: &TransactionRecord) -> Vec<Txid> {
        let mut children = Vec::new();
        for output in &record.outputs {
            if output.n == PLACEHOLDER_INDEX {
                continue;
            }
            let outpoint = OutPoint::new(record.txid, output.n);
            children.extend(self.spenders(&outpoint));
            if let Some(image) = &output.key_image {
                if let Some(ring_spends) = self.spends.get(&anon_outpoint(image)) {
                    children.extend(ring_spends.iter().copied());
                }
            }
        }
        children
    }

    /// Plan abandoning an unconfirmed transaction that is not in the
    /// mempool, together with its unconfirmed descendants
    pub fn plan_abandon(&self, txid: &Txid, chain: &dyn ChainState) -> Result<LedgerUpdate> {
        let record = self.records.get(txid).ok_or(WalletError::TxNotFound(*txid))?;
        let depth = self.depth(record, chain);
        if depth > 0 {
            return Err(WalletError::Abandon(format!(
                "transaction {} has {} confirmations",
                txid, depth
            )));
        }
        if depth < 0 {
            return Err(WalletError::Abandon(format!(
                "transaction {} is conflicted",
                txid
            )));
        }
        if chain.mempool_contains(txid) {
            return Err(WalletError::Abandon(format!(
                "transaction {} is in the mempool",
                txid
            )));
        }

        let mut update = LedgerUpdate::default();
        let mut queue = VecDeque::from([*txid]);
        let mut seen = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            let mut record = match self.record_view(&update.records, &current) {
                Some(r) => r.clone(),
                None => continue,
            };
            if self.depth(&record, chain) != 0
                || record.is_abandoned()
                || chain.mempool_contains(&current)
            {
                continue;
            }

            record.flags |= flags::ABANDONED;
            let inputs = record.inputs.clone();
            queue.extend(self.children(&record));
            update.records.insert(current, record);
            self.refresh_spent_flags(&mut update.records, &inputs, None);
            info!(txid = %current, "abandoned transaction");
        }

        Ok(update)
    }

    /// Plan marking `txid` and its descendants conflicted by a transaction in
    /// `conflicting_block`
    pub fn plan_conflict(
        &self,
        txid: &Txid,
        conflicting_block: &BlockHash,
        chain: &dyn ChainState,
    ) -> LedgerUpdate {
        let mut update = LedgerUpdate::default();
        let conflict_confirms = -chain.confirmation_depth(conflicting_block, 0);
        if conflict_confirms >= 0 {
            // Block is not in the main chain
            return update;
        }

        let mut queue = VecDeque::from([*txid]);
        let mut seen = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            let mut record = match self.record_view(&update.records, &current) {
                Some(r) => r.clone(),
                None => continue,
            };
            if conflict_confirms >= self.depth(&record, chain) {
                continue;
            }

            record.block = Some(BlockRef {
                hash: *conflicting_block,
                index: -1,
            });
            let inputs = record.inputs.clone();
            queue.extend(self.children(&record));
            update.records.insert(current, record);
            self.refresh_spent_flags(&mut update.records, &inputs, None);
            debug!(txid = %current, block = %conflicting_block, "marked conflicted");
        }

        update
    }

    /// Wallet transactions other than `txid` spending any of `inputs`
    pub fn conflicting(&self, txid: &Txid, inputs: &[OutPoint]) -> Vec<Txid> {
        let mut found = BTreeSet::new();
        for input in inputs {
            if let Some(spenders) = self.spends.get(input) {
                found.extend(spenders.iter().filter(|t| *t != txid).copied());
            }
        }
        found.into_iter().collect()
    }

    /// Install committed changes
    pub fn apply(&mut self, update: LedgerUpdate) {
        for (image, outpoint) in update.key_images {
            self.insert_key_image(image, outpoint);
        }
        for (_, record) in update.records {
            self.insert(record);
        }
    }

    fn insert_key_image(&mut self, image: KeyImage, outpoint: OutPoint) {
        self.key_images.insert(image, outpoint);
        self.images_by_outpoint.insert(outpoint, image);
    }

    fn insert(&mut self, record: TransactionRecord) {
        for input in &record.inputs {
            self.spends.entry(*input).or_default().insert(record.txid);
        }
        self.records.insert(record.txid, record);
    }

    /// Owned, unspent outputs of live transactions, with their depth
    pub fn unspent<'a>(
        &'a self,
        chain: &'a dyn ChainState,
    ) -> impl Iterator<Item = (&'a TransactionRecord, &'a OutputRecord, i32)> + 'a {
        self.records.values().flat_map(move |record| {
            let depth = self.depth(record, chain);
            record
                .outputs
                .iter()
                .filter(move |output| {
                    output.is_owned()
                        && output.n != PLACEHOLDER_INDEX
                        && !record.is_abandoned()
                        && depth >= 0
                        && !self.is_spent(&OutPoint::new(record.txid, output.n), chain)
                })
                .map(move |output| (record, output, depth))
        })
    }
}

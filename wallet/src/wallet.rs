// Wallet
// Facade owning storage, key access and the in-memory state. Every entry
// point takes the chain lock first, then the wallet lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use rand::{CryptoRng, RngCore};
use tracing::{debug, info, warn};

use crate::builder::{BuiltTransaction, InputKind, TransactionBuilder};
use crate::chain::ChainState;
use crate::coin_selection::CoinControl;
use crate::config::WalletConfig;
use crate::crypto::rangeproof::rewind;
use crate::crypto::{key_image, KeyImage};
use crate::error::{Result, WalletError};
use crate::keys::{KeyProvider, OwnershipKind};
use crate::ledger::LedgerUpdate;
use crate::recipient::{Destination, Recipient};
use crate::records::{flags, BlockRef, OutputRecord, TransactionRecord};
use crate::state::{SpendableCoin, WalletState, DEFAULT_ACCOUNT};
use crate::stealth::{try_claim, ClaimKey, StealthAddress, StealthKeyMeta};
use crate::storage::WalletStorage;
use crate::transaction::{OutputData, Transaction, TxIn, TxOut};
use crate::types::{Amount, BlockHash, KeyId, OutPoint, OutputKind, Txid};

/// Chain state shared with the node; its lock orders before the wallet's
pub type SharedChain = Arc<RwLock<dyn ChainState + Send + Sync>>;

/// Spendable value per output kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Balances {
    pub standard: Amount,
    pub blinded: Amount,
    pub anon: Amount,
    pub standard_unconfirmed: Amount,
    pub blinded_unconfirmed: Amount,
    pub anon_unconfirmed: Amount,
    pub watch_only: Amount,
}

/// One output found by scanning
struct ScannedOutput {
    output: OutputRecord,
    stealth_key: Option<(KeyId, StealthKeyMeta)>,
    key_image: Option<KeyImage>,
}

pub struct Wallet {
    chain: SharedChain,
    keys: Arc<dyn KeyProvider>,
    storage: WalletStorage,
    config: WalletConfig,
    state: Mutex<WalletState>,
}

impl Wallet {
    /// Open the wallet at the configured storage path, or a temporary
    /// database when none is set
    pub fn load(chain: SharedChain, keys: Arc<dyn KeyProvider>, config: WalletConfig) -> Result<Self> {
        let storage = match &config.storage.path {
            Some(path) => WalletStorage::open(path)?,
            None => WalletStorage::temporary()?,
        };
        Self::with_storage(chain, keys, storage, config)
    }

    pub fn with_storage(
        chain: SharedChain,
        keys: Arc<dyn KeyProvider>,
        storage: WalletStorage,
        config: WalletConfig,
    ) -> Result<Self> {
        let mut state = WalletState::load(&storage)?;

        // Cached spent flags may predate the last shutdown
        let refresh = state.ledger.plan_spent_refresh();
        let refreshed = refresh.records.len();
        commit_update(&storage, &mut state, refresh)?;
        if refreshed > 0 {
            debug!(records = refreshed, "refreshed spent flags");
        }

        let wallet = Self {
            chain,
            keys,
            storage,
            config,
            state: Mutex::new(state),
        };
        {
            let mut state = wallet.state()?;
            wallet.process_locked_outputs(&mut state)?;
        }
        Ok(wallet)
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    fn chain(&self) -> Result<RwLockReadGuard<'_, dyn ChainState + Send + Sync>> {
        self.chain
            .read()
            .map_err(|e| WalletError::LockPoisoned(e.to_string()))
    }

    fn state(&self) -> Result<MutexGuard<'_, WalletState>> {
        self.state
            .lock()
            .map_err(|e| WalletError::LockPoisoned(e.to_string()))
    }

    pub fn new_address(&self) -> Result<KeyId> {
        let (pubkey, path) = self.keys.derive_next_address(DEFAULT_ACCOUNT)?;
        debug!(%path, "derived receiving key");
        Ok(pubkey.key_id())
    }

    pub fn new_stealth_address(&self, label: Option<&str>) -> Result<StealthAddress> {
        let mut owned = self.keys.derive_next_stealth_address(DEFAULT_ACCOUNT)?;
        owned.label = label.map(str::to_string);
        let address = owned.address;
        self.state()?.add_stealth_address(&self.storage, owned)?;
        Ok(address)
    }

    /// Build, and with `sign` set, sign and record a transaction
    pub fn build_transaction(
        &self,
        recipients: &[Recipient],
        kind: InputKind,
        coin_control: &CoinControl,
        sign: bool,
    ) -> Result<(Transaction, Amount)> {
        let built = self.build_with_rng(&mut rand::thread_rng(), recipients, kind, coin_control, sign)?;
        Ok((built.tx, built.fee))
    }

    pub fn build_with_rng<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        recipients: &[Recipient],
        kind: InputKind,
        coin_control: &CoinControl,
        sign: bool,
    ) -> Result<BuiltTransaction> {
        let chain = self.chain()?;
        let mut state = self.state()?;
        TransactionBuilder::new(&*chain, self.keys.as_ref(), &self.storage, &self.config, &mut state)
            .build(rng, recipients, kind, coin_control, sign)
    }

    /// Record `tx` if it pays or spends this wallet. Returns whether it does.
    pub fn scan_transaction(&self, tx: &Transaction, block: Option<BlockRef>) -> Result<bool> {
        let _chain = self.chain()?;
        let mut state = self.state()?;
        self.record_transaction(&mut state, tx, block)
    }

    /// Record the wallet's transactions in a newly connected block and mark
    /// what they conflict with
    pub fn block_connected(&self, block: &BlockHash, txs: &[Transaction]) -> Result<usize> {
        let chain = self.chain()?;
        let mut state = self.state()?;
        let mut relevant = 0;

        for (index, tx) in txs.iter().enumerate() {
            let block_ref = BlockRef {
                hash: *block,
                index: index as i32,
            };
            if !self.record_transaction(&mut state, tx, Some(block_ref))? {
                continue;
            }
            relevant += 1;

            let txid = tx.txid()?;
            let inputs: Vec<OutPoint> = tx.inputs.iter().flat_map(TxIn::prevouts).collect();
            for other in state.ledger.conflicting(&txid, &inputs) {
                let update = state.ledger.plan_conflict(&other, block, &*chain);
                commit_update(&self.storage, &mut state, update)?;
            }
        }

        info!(block = %block, transactions = txs.len(), relevant, "processed block");
        Ok(relevant)
    }

    /// Mark `txid` and its descendants conflicted by a transaction in `block`
    pub fn transaction_conflicted(&self, txid: &Txid, block: &BlockHash) -> Result<()> {
        let chain = self.chain()?;
        let mut state = self.state()?;
        let update = state.ledger.plan_conflict(txid, block, &*chain);
        commit_update(&self.storage, &mut state, update)
    }

    pub fn abandon(&self, txid: &Txid) -> Result<()> {
        let chain = self.chain()?;
        let mut state = self.state()?;
        let update = state.ledger.plan_abandon(txid, &*chain)?;
        commit_update(&self.storage, &mut state, update)
    }

    pub fn lock(&self) {
        self.keys.lock();
    }

    /// Unlock the key provider and derive the keys of outputs claimed while
    /// locked. Returns how many were resolved.
    pub fn unlock(&self, passphrase: &str) -> Result<usize> {
        let mut state = self.state()?;
        self.keys.unlock(passphrase)?;
        self.process_locked_outputs(&mut state)
    }

    pub fn get_balance(&self, kind: OutputKind, min_depth: i32) -> Result<Amount> {
        let chain = self.chain()?;
        let state = self.state()?;
        Ok(state
            .ledger
            .unspent(&*chain)
            .filter(|(record, output, depth)| {
                output.kind == kind
                    && !output.has(flags::WATCH_ONLY)
                    && *depth >= min_depth
                    && (*depth > 0 || state.ledger.is_trusted(record, &*chain))
            })
            .map(|(_, output, _)| output.value)
            .sum())
    }

    pub fn get_balances(&self) -> Result<Balances> {
        let chain = self.chain()?;
        let state = self.state()?;
        let mut balances = Balances::default();

        for (record, output, _) in state.ledger.unspent(&*chain) {
            if output.has(flags::WATCH_ONLY) {
                balances.watch_only += output.value;
                continue;
            }
            let trusted = state.ledger.is_trusted(record, &*chain);
            let bucket = match (output.kind, trusted) {
                (OutputKind::Standard, true) => &mut balances.standard,
                (OutputKind::Standard, false) => &mut balances.standard_unconfirmed,
                (OutputKind::Blinded, true) => &mut balances.blinded,
                (OutputKind::Blinded, false) => &mut balances.blinded_unconfirmed,
                (OutputKind::Anonymous, true) => &mut balances.anon,
                (OutputKind::Anonymous, false) => &mut balances.anon_unconfirmed,
                (OutputKind::DataCarrier, _) => continue,
            };
            *bucket += output.value;
        }
        Ok(balances)
    }

    /// Coins of `kind` that a build with `coin_control` may spend
    pub fn available_coins(&self, kind: OutputKind, coin_control: &CoinControl) -> Result<Vec<SpendableCoin>> {
        let chain = self.chain()?;
        let state = self.state()?;
        Ok(state.available_coins(&*chain, kind, coin_control, &self.config))
    }

    /// Owned unspent outputs with their depth, optionally of one kind
    pub fn list_unspent(&self, kind: Option<OutputKind>) -> Result<Vec<(OutPoint, OutputRecord, i32)>> {
        let chain = self.chain()?;
        let state = self.state()?;
        Ok(state
            .ledger
            .unspent(&*chain)
            .filter(|(_, output, _)| kind.map_or(true, |k| output.kind == k))
            .map(|(record, output, depth)| (OutPoint::new(record.txid, output.n), output.clone(), depth))
            .collect())
    }

    pub fn get_record(&self, txid: &Txid) -> Result<Option<TransactionRecord>> {
        Ok(self.state()?.ledger.get(txid).cloned())
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> Result<bool> {
        let chain = self.chain()?;
        let state = self.state()?;
        Ok(state.ledger.is_spent(outpoint, &*chain))
    }

    /// Never use the anonymous output at `index` as a decoy
    pub fn blacklist_anon_index(&self, index: u64) -> Result<()> {
        let mut state = self.state()?;
        let mut batch = self.storage.begin();
        batch.put_blacklisted(index)?;
        batch.commit()?;
        state.anon_blacklist.insert(index);
        Ok(())
    }

    fn record_transaction(
        &self,
        state: &mut WalletState,
        tx: &Transaction,
        block: Option<BlockRef>,
    ) -> Result<bool> {
        let txid = tx.txid()?;

        let mut debit: Amount = 0;
        let mut from_me = false;
        let mut input_flags = 0;
        for input in &tx.inputs {
            for prevout in input.prevouts() {
                let spent = match state
                    .ledger
                    .resolve(&prevout)
                    .and_then(|o| state.ledger.output(&o))
                {
                    Some(output) if output.is_owned() => output,
                    _ => continue,
                };
                from_me = true;
                debit += spent.value;
                input_flags |= match (input, spent.kind) {
                    (TxIn::Anon { .. }, _) => flags::ANON_IN,
                    (TxIn::Standard { .. }, OutputKind::Blinded) => flags::BLIND_IN,
                    (TxIn::Standard { .. }, _) => flags::STANDARD_IN,
                };
            }
        }

        let mut scanned = Vec::new();
        for n in 0..tx.outputs.len() {
            if let Some(found) = self.scan_output(state, tx, n)? {
                if found.output.is_owned() || from_me {
                    scanned.push(found);
                }
            }
        }

        let existing = state.ledger.get(&txid).is_some();
        if !from_me && !existing && scanned.is_empty() {
            return Ok(false);
        }

        let mut record = TransactionRecord::new(txid);
        record.block = block;
        record.inputs = tx.inputs.iter().flat_map(TxIn::prevouts).collect();
        if from_me {
            record.flags |= input_flags;
            record.fee = match tx.declared_fee() {
                Some(fee) => fee,
                None if tx.outputs.iter().all(|o| o.commitment().is_none()) => {
                    debit - tx.plain_output_value()
                }
                None => 0,
            };
        }
        for found in &scanned {
            let mut output = found.output.clone();
            if from_me {
                output.flags |= flags::FROM_ME;
            }
            record.insert_output(output);
        }
        if from_me && !existing {
            record.balance_with_placeholder(debit);
        }

        let (mut update, outcome) = state.ledger.plan_record(record);
        let images: Vec<(KeyImage, OutPoint)> = scanned
            .iter()
            .filter_map(|s| s.key_image.map(|image| (image, OutPoint::new(txid, s.output.n))))
            .filter(|(_, outpoint)| state.ledger.key_image_of(outpoint).is_none())
            .collect();
        update.key_images.extend(images);

        let stealth_keys: Vec<(KeyId, StealthKeyMeta)> =
            scanned.iter().filter_map(|s| s.stealth_key).collect();
        let locked: Vec<OutPoint> = scanned
            .iter()
            .filter(|s| s.output.has(flags::LOCKED))
            .map(|s| OutPoint::new(txid, s.output.n))
            .filter(|outpoint| {
                !state.locked_outputs.contains(outpoint)
                    && state
                        .ledger
                        .output(outpoint)
                        .map_or(true, |o| o.has(flags::LOCKED))
            })
            .collect();

        if update.is_empty() && stealth_keys.is_empty() && locked.is_empty() {
            return Ok(true);
        }

        let mut batch = self.storage.begin();
        for record in update.records.values() {
            batch.put_record(record)?;
        }
        for (image, outpoint) in &update.key_images {
            batch.put_key_image(image, outpoint)?;
        }
        for (id, meta) in &stealth_keys {
            batch.put_stealth_key(id, meta)?;
        }
        for outpoint in &locked {
            batch.put_locked_output(outpoint)?;
        }
        batch.commit()?;

        state.ledger.apply(update);
        state.stealth_keys.extend(stealth_keys);
        state.locked_outputs.extend(locked.iter().copied());

        info!(
            txid = %txid,
            from_me,
            owned = scanned.iter().filter(|s| s.output.is_owned()).count(),
            locked = locked.len(),
            confirmed = block.is_some(),
            updated = matches!(outcome, crate::ledger::RecordOutcome::Updated),
            "recorded transaction"
        );
        Ok(true)
    }

    /// Classify output `n`. Standard outputs are always returned so a
    /// from-me transaction can account for them; blinded outputs only when
    /// they rewind.
    fn scan_output(&self, state: &WalletState, tx: &Transaction, n: usize) -> Result<Option<ScannedOutput>> {
        let keys = self.keys.as_ref();
        let (dest_id, payload) = match &tx.outputs[n] {
            TxOut::Data { .. } => return Ok(None),
            TxOut::Standard { script, .. } => {
                let payload = match tx.outputs.get(n + 1) {
                    Some(TxOut::Data { data }) => OutputData::parse(data),
                    _ => None,
                };
                (script.key_id(), payload)
            }
            TxOut::Blinded { script, data, .. } => (script.key_id(), OutputData::parse(data)),
            TxOut::Anon { pubkey, data, .. } => (Some(pubkey.key_id()), OutputData::parse(data)),
        };

        let claim = match (&dest_id, payload.as_ref().and_then(|p| p.ephemeral)) {
            (Some(id), Some(ephemeral)) => try_claim(
                &state.stealth_addresses,
                &state.stealth_keys,
                keys,
                id,
                &ephemeral,
                payload.as_ref().and_then(|p| p.prefix),
            )?,
            _ => None,
        };

        let kind = tx.outputs[n].kind();
        let mut output = OutputRecord::new(n as u32, kind, 0);
        output.key_id = dest_id;
        let mut stealth_key = None;
        let mut key_image_found = None;

        let ownership = match &claim {
            Some(claim) => {
                output.flags |= flags::STEALTH;
                output.stealth_address = Some(claim.meta.address_id);
                if state.change_address == Some(claim.meta.address_id) {
                    output.flags |= flags::CHANGE;
                }
                if claim.is_new {
                    stealth_key = Some((claim.dest_key_id, claim.meta));
                }
                match claim.key {
                    ClaimKey::Spendable(_) => OwnershipKind::Spendable,
                    ClaimKey::Locked => {
                        output.flags |= flags::LOCKED;
                        OwnershipKind::Spendable
                    }
                    ClaimKey::WatchOnly => OwnershipKind::WatchOnly,
                }
            }
            None => match &tx.outputs[n] {
                TxOut::Standard { script, .. } => state.is_mine(keys, &Destination::Script(script.clone())),
                _ => OwnershipKind::No,
            },
        };
        match ownership {
            OwnershipKind::Spendable => output.flags |= flags::OWNED,
            OwnershipKind::WatchOnly => output.flags |= flags::OWNED | flags::WATCH_ONLY,
            OwnershipKind::No => {}
        }

        match &tx.outputs[n] {
            TxOut::Data { .. } => return Ok(None),
            TxOut::Standard { value, script } => {
                output.value = *value;
                output.script = script.clone();
                if claim.is_some() {
                    output.narration = payload
                        .and_then(|p| p.narration)
                        .map(|n| String::from_utf8_lossy(&n).into_owned());
                }
            }
            TxOut::Blinded {
                commitment,
                range_proof,
                ..
            }
            | TxOut::Anon {
                commitment,
                range_proof,
                ..
            } => {
                let claim = match &claim {
                    Some(claim) => claim,
                    None => return Ok(None),
                };
                let rewound = match rewind(&claim.shared, commitment, range_proof) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(output = n, error = %e, "claimed output failed to rewind");
                        return Ok(None);
                    }
                };
                output.value = match Amount::try_from(rewound.value) {
                    Ok(v) => v,
                    Err(_) => {
                        warn!(output = n, value = rewound.value, "rewound value out of range");
                        return Ok(None);
                    }
                };
                output.commitment = Some(*commitment);
                output.blind = Some(rewound.blind);
                if !rewound.message.is_empty() {
                    output.narration = Some(String::from_utf8_lossy(&rewound.message).into_owned());
                }

                match &tx.outputs[n] {
                    TxOut::Blinded { script, .. } => output.script = script.clone(),
                    TxOut::Anon { pubkey, .. } => {
                        output.anon_pubkey = Some(*pubkey);
                        if let ClaimKey::Spendable(secret) = &claim.key {
                            let image = key_image(pubkey, secret)?;
                            output.key_image = Some(image);
                            key_image_found = Some(image);
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Some(ScannedOutput {
            output,
            stealth_key,
            key_image: key_image_found,
        }))
    }

    /// Derive spend keys for outputs claimed while locked
    fn process_locked_outputs(&self, state: &mut WalletState) -> Result<usize> {
        if self.keys.is_locked() || state.locked_outputs.is_empty() {
            return Ok(0);
        }

        let mut records: BTreeMap<Txid, TransactionRecord> = BTreeMap::new();
        let mut key_images = Vec::new();
        let mut resolved = Vec::new();

        for outpoint in &state.locked_outputs {
            let mut record = match records
                .get(&outpoint.txid)
                .or_else(|| state.ledger.get(&outpoint.txid))
            {
                Some(r) => r.clone(),
                None => {
                    resolved.push(*outpoint);
                    continue;
                }
            };
            if let Some(output) = record.output_mut(outpoint.n) {
                let key_id = output.key_id.ok_or_else(|| {
                    WalletError::StateInconsistency(format!("locked output {} has no key", outpoint))
                })?;
                let secret = state.secret_key(self.keys.as_ref(), &key_id)?;
                if let Some(pubkey) = output.anon_pubkey {
                    let image = key_image(&pubkey, &secret)?;
                    output.key_image = Some(image);
                    key_images.push((image, *outpoint));
                }
                output.flags &= !flags::LOCKED;
            }
            records.insert(record.txid, record);
            resolved.push(*outpoint);
        }

        let mut batch = self.storage.begin();
        for record in records.values() {
            batch.put_record(record)?;
        }
        for (image, outpoint) in &key_images {
            batch.put_key_image(image, outpoint)?;
        }
        for outpoint in &resolved {
            batch.remove_locked_output(outpoint);
        }
        batch.commit()?;

        state.ledger.apply(LedgerUpdate { records, key_images });
        for outpoint in &resolved {
            state.locked_outputs.remove(outpoint);
        }
        info!(resolved = resolved.len(), "processed outputs claimed while locked");
        Ok(resolved.len())
    }
}

/// Persist a planned ledger update, then install it
fn commit_update(storage: &WalletStorage, state: &mut WalletState, update: LedgerUpdate) -> Result<()> {
    if update.is_empty() {
        return Ok(());
    }
    let mut batch = storage.begin();
    for record in update.records.values() {
        batch.put_record(record)?;
    }
    for (image, outpoint) in &update.key_images {
        batch.put_key_image(image, outpoint)?;
    }
    batch.commit()?;
    state.ledger.apply(update);
    Ok(())
}

// Wallet State
// In-memory mirror of everything the wallet persists. One instance per
// wallet, held behind the wallet lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::chain::ChainState;
use crate::coin_selection::{CoinCandidate, CoinControl};
use crate::config::WalletConfig;
use crate::crypto::{ecdh, ExtKeyPair, PublicKey, SecretKey};
use crate::error::{Result, WalletError};
use crate::keys::{KeyError, KeyProvider, OwnershipKind};
use crate::ledger::Ledger;
use crate::recipient::Destination;
use crate::records::{flags, OutputRecord};
use crate::stealth::{
    derive_one_time_pubkey, derive_spend_secret, OwnedStealthAddress, StealthAddress, StealthKeyMeta,
};
use crate::storage::WalletStorage;
use crate::types::{KeyId, OutPoint, OutputKind};

/// Account for receiving addresses
pub const DEFAULT_ACCOUNT: u32 = 0;
/// Account for change keys and the change stealth address
pub const CHANGE_ACCOUNT: u32 = 1;

/// An unspent owned output offered to coin selection
#[derive(Debug, Clone)]
pub struct SpendableCoin {
    pub candidate: CoinCandidate,
    pub output: OutputRecord,
}

#[derive(Default)]
pub struct WalletState {
    pub ledger: Ledger,
    pub stealth_addresses: BTreeMap<KeyId, OwnedStealthAddress>,
    /// One-time key id to the data needed to rederive it
    pub stealth_keys: HashMap<KeyId, StealthKeyMeta>,
    /// Outputs claimed while locked, resolved on unlock
    pub locked_outputs: BTreeSet<OutPoint>,
    /// Next child index per extended-key destination
    pub ext_counters: HashMap<KeyId, u32>,
    pub anon_blacklist: HashSet<u64>,
    pub change_address: Option<KeyId>,
}

impl WalletState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the in-memory state from storage
    pub fn load(storage: &WalletStorage) -> Result<Self> {
        let records = storage.load_records()?;
        let key_images = storage.load_key_images()?;
        let ledger = Ledger::from_parts(records, key_images);

        let stealth_addresses = storage
            .load_stealth_addresses()?
            .into_iter()
            .map(|a| (a.id(), a))
            .collect();

        let state = Self {
            ledger,
            stealth_addresses,
            stealth_keys: storage.load_stealth_keys()?.into_iter().collect(),
            locked_outputs: storage.load_locked_outputs()?.into_iter().collect(),
            ext_counters: storage.load_ext_counters()?.into_iter().collect(),
            anon_blacklist: storage.load_anon_blacklist()?.into_iter().collect(),
            change_address: storage.load_change_address()?,
        };

        info!(
            records = state.ledger.len(),
            stealth_addresses = state.stealth_addresses.len(),
            locked = state.locked_outputs.len(),
            "loaded wallet state"
        );
        Ok(state)
    }

    pub fn owned_stealth(&self, address: &StealthAddress) -> Option<&OwnedStealthAddress> {
        self.stealth_addresses.get(&address.id())
    }

    /// Public key for `id`, including one-time stealth keys. Works while
    /// locked.
    pub fn public_key(&self, keys: &dyn KeyProvider, id: &KeyId) -> Result<PublicKey> {
        if let Some(pk) = keys.get_public_key(id) {
            return Ok(pk);
        }
        let (address, meta) = self.stealth_source(id)?;
        let shared = ecdh(&address.scan_secret, &meta.ephemeral)?;
        Ok(derive_one_time_pubkey(&address.address, &shared)?)
    }

    /// Private key for `id`, deriving one-time stealth keys from the
    /// address spend key
    pub fn secret_key(&self, keys: &dyn KeyProvider, id: &KeyId) -> Result<SecretKey> {
        match keys.get_private_key(id) {
            Ok(secret) => return Ok(secret),
            Err(KeyError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let (address, meta) = self.stealth_source(id)?;
        let spend = keys.get_private_key(&address.spend_key_id)?;
        let shared = ecdh(&address.scan_secret, &meta.ephemeral)?;
        let secret = derive_spend_secret(&spend, &shared)?;
        if secret.public_key().key_id() != *id {
            return Err(WalletError::StateInconsistency(format!(
                "stealth key {} does not rederive",
                id.to_hex()
            )));
        }
        Ok(secret)
    }

    fn stealth_source(&self, id: &KeyId) -> Result<(&OwnedStealthAddress, &StealthKeyMeta)> {
        let meta = self
            .stealth_keys
            .get(id)
            .ok_or_else(|| WalletError::Key(KeyError::NotFound(id.to_hex())))?;
        let address = self.stealth_addresses.get(&meta.address_id).ok_or_else(|| {
            WalletError::StateInconsistency(format!(
                "stealth key {} references unknown address {}",
                id.to_hex(),
                meta.address_id.to_hex()
            ))
        })?;
        Ok((address, meta))
    }

    /// Ownership of a destination, counting claimed one-time keys
    pub fn is_mine(&self, keys: &dyn KeyProvider, destination: &Destination) -> OwnershipKind {
        let direct = keys.have_address(destination);
        if direct != OwnershipKind::No {
            return direct;
        }
        let id = match destination {
            Destination::KeyId(id) => *id,
            Destination::Script(script) => match script.key_id() {
                Some(id) => id,
                None => return OwnershipKind::No,
            },
            Destination::Stealth(address) => {
                return match self.owned_stealth(address) {
                    Some(owned) => keys.have_address(&Destination::KeyId(owned.spend_key_id)),
                    None => OwnershipKind::No,
                };
            }
            Destination::ExtKeyPair(_) => return OwnershipKind::No,
        };
        match self.stealth_source(&id) {
            Ok((address, _)) => keys.have_address(&Destination::KeyId(address.spend_key_id)),
            Err(_) => OwnershipKind::No,
        }
    }

    pub fn add_stealth_address(
        &mut self,
        storage: &WalletStorage,
        address: OwnedStealthAddress,
    ) -> Result<()> {
        let mut batch = storage.begin();
        batch.put_stealth_address(&address)?;
        batch.commit()?;
        debug!(address = %address.id().to_hex(), "added stealth address");
        self.stealth_addresses.insert(address.id(), address);
        Ok(())
    }

    /// Stealth address receiving blinded and anonymous change, created on
    /// first use
    pub fn change_stealth_address(
        &mut self,
        keys: &dyn KeyProvider,
        storage: &WalletStorage,
    ) -> Result<StealthAddress> {
        if let Some(id) = self.change_address {
            if let Some(owned) = self.stealth_addresses.get(&id) {
                return Ok(owned.address);
            }
        }

        let owned = keys.derive_next_stealth_address(CHANGE_ACCOUNT)?;
        let address = owned.address;
        let mut batch = storage.begin();
        batch.put_stealth_address(&owned)?;
        batch.put_change_address(&owned.id())?;
        batch.commit()?;

        info!(address = %owned.id().to_hex(), "created change stealth address");
        self.change_address = Some(owned.id());
        self.stealth_addresses.insert(owned.id(), owned);
        Ok(address)
    }

    /// Next child public key of an extended destination; the counter is
    /// persisted before the key is handed out
    pub fn next_ext_child(&mut self, storage: &WalletStorage, ext: &ExtKeyPair) -> Result<PublicKey> {
        let id = ext.id();
        let index = self.ext_counters.get(&id).copied().unwrap_or(0);
        let child = ext.child_pubkey(index)?;

        let mut batch = storage.begin();
        batch.put_ext_counter(&id, index + 1)?;
        batch.commit()?;
        self.ext_counters.insert(id, index + 1);
        Ok(child)
    }

    /// Unspent owned outputs of `kind` that coin selection may consider,
    /// sorted by outpoint
    pub fn available_coins(
        &self,
        chain: &dyn ChainState,
        kind: OutputKind,
        coin_control: &CoinControl,
        config: &WalletConfig,
    ) -> Vec<SpendableCoin> {
        let mut coins: Vec<SpendableCoin> = self
            .ledger
            .unspent(chain)
            .filter_map(|(record, output, depth)| {
                if output.kind != kind {
                    return None;
                }
                if depth == 0 && !chain.mempool_contains(&record.txid) {
                    return None;
                }
                if output.has(flags::LOCKED) {
                    return None;
                }
                let watch_only = output.has(flags::WATCH_ONLY);
                if watch_only && !coin_control.allow_watch_only {
                    return None;
                }

                match kind {
                    OutputKind::Anonymous => {
                        if depth < config.ring.min_output_depth {
                            return None;
                        }
                        let pubkey = output.anon_pubkey?;
                        output.blind.as_ref()?;
                        chain.anon_index_of(&pubkey)?;
                    }
                    OutputKind::Blinded => {
                        output.blind.as_ref()?;
                        output.commitment?;
                    }
                    _ => {}
                }

                let (ancestors, descendants) = chain.mempool_ancestry(&record.txid);
                Some(SpendableCoin {
                    candidate: CoinCandidate {
                        outpoint: OutPoint::new(record.txid, output.n),
                        kind,
                        value: output.value,
                        depth,
                        spendable: !watch_only,
                        solvable: true,
                        safe: self.ledger.is_trusted(record, chain),
                        from_me: record.is_from_me(),
                        ancestors,
                        descendants,
                    },
                    output: output.clone(),
                })
            })
            .collect();
        coins.sort_by(|a, b| a.candidate.outpoint.cmp(&b.candidate.outpoint));
        coins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::keys::MemoryKeyProvider;
    use crate::records::TransactionRecord;
    use crate::types::{Hash256, Script};

    fn owned_output(n: u32, kind: OutputKind, value: i64) -> OutputRecord {
        let mut out = OutputRecord::new(n, kind, value);
        out.flags = flags::OWNED;
        out
    }

    #[test]
    fn test_change_address_created_once() {
        let storage = WalletStorage::temporary().unwrap();
        let keys = MemoryKeyProvider::new("pw");
        let mut state = WalletState::new();

        let first = state.change_stealth_address(&keys, &storage).unwrap();
        let second = state.change_stealth_address(&keys, &storage).unwrap();
        assert_eq!(first, second);

        let reloaded = WalletState::load(&storage).unwrap();
        assert_eq!(reloaded.change_address, Some(first.id()));
        assert!(reloaded.stealth_addresses.contains_key(&first.id()));
    }

    #[test]
    fn test_ext_counter_advances_and_persists() {
        let storage = WalletStorage::temporary().unwrap();
        let keys = MemoryKeyProvider::new("pw");
        let ext = keys.account_ext(5).unwrap();
        let mut state = WalletState::new();

        let a = state.next_ext_child(&storage, &ext).unwrap();
        let b = state.next_ext_child(&storage, &ext).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, ext.child_pubkey(0).unwrap());

        let reloaded = WalletState::load(&storage).unwrap();
        assert_eq!(reloaded.ext_counters.get(&ext.id()), Some(&2));
    }

    #[test]
    fn test_stealth_keys_resolve_while_locked() {
        let storage = WalletStorage::temporary().unwrap();
        let keys = MemoryKeyProvider::new("pw");
        let mut state = WalletState::new();
        let owned = keys.derive_next_stealth_address(DEFAULT_ACCOUNT).unwrap();
        let address = owned.address;
        state.add_stealth_address(&storage, owned).unwrap();

        let dest = crate::stealth::derive_destination(&mut rand::thread_rng(), &address).unwrap();
        let id = dest.dest_pubkey.key_id();
        state.stealth_keys.insert(
            id,
            StealthKeyMeta {
                address_id: address.id(),
                ephemeral: dest.ephemeral,
            },
        );

        keys.lock();
        assert_eq!(state.public_key(&keys, &id).unwrap(), dest.dest_pubkey);
        assert!(matches!(state.secret_key(&keys, &id), Err(WalletError::Locked)));
        assert_eq!(
            state.is_mine(&keys, &Destination::Script(Script::for_key_id(&id))),
            OwnershipKind::Spendable
        );

        keys.unlock("pw").unwrap();
        assert_eq!(state.secret_key(&keys, &id).unwrap().public_key(), dest.dest_pubkey);
    }

    #[test]
    fn test_available_coins_filters() {
        let mut chain = MemoryChain::new();
        let block = Hash256::hash(b"block");
        chain.add_block(block);
        let mut state = WalletState::new();

        let mut confirmed = TransactionRecord::new(Hash256::hash(b"confirmed"));
        confirmed.block = Some(crate::records::BlockRef { hash: block, index: 0 });
        confirmed.insert_output(owned_output(0, OutputKind::Standard, 1_000));
        let mut locked = owned_output(1, OutputKind::Standard, 2_000);
        locked.flags |= flags::LOCKED;
        confirmed.insert_output(locked);
        let mut watch = owned_output(2, OutputKind::Standard, 3_000);
        watch.flags |= flags::WATCH_ONLY;
        confirmed.insert_output(watch);
        confirmed.insert_output(owned_output(3, OutputKind::Blinded, 4_000));

        // Unconfirmed and not pooled
        let mut stray = TransactionRecord::new(Hash256::hash(b"stray"));
        stray.insert_output(owned_output(0, OutputKind::Standard, 5_000));

        let (update, _) = state.ledger.plan_record(confirmed.clone());
        state.ledger.apply(update);
        let (update, _) = state.ledger.plan_record(stray);
        state.ledger.apply(update);

        let config = WalletConfig::default();
        let mut control = CoinControl::new();
        let coins = state.available_coins(&chain, OutputKind::Standard, &control, &config);
        assert_eq!(coins.len(), 1);
        assert_eq!(coins[0].candidate.value, 1_000);
        assert!(coins[0].candidate.safe);

        control.allow_watch_only = true;
        let coins = state.available_coins(&chain, OutputKind::Standard, &control, &config);
        assert_eq!(coins.len(), 2);
        assert!(coins.iter().any(|c| !c.candidate.spendable));

        // Blinded output without a blind is not spendable
        let coins = state.available_coins(&chain, OutputKind::Blinded, &control, &config);
        assert!(coins.is_empty());
    }
}

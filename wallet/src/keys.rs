// Wallet Key Provider
// Hands out receiving keys and stealth addresses; private keys only while unlocked

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

use crate::crypto::{hash_to_scalar, CryptoError, ExtKeyPair, PublicKey, SecretKey};
use crate::recipient::Destination;
use crate::stealth::{OwnedStealthAddress, StealthAddress};
use crate::types::KeyId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key provider is locked")]
    Locked,

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key derivation failed: {0}")]
    Derivation(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl From<CryptoError> for KeyError {
    fn from(e: CryptoError) -> Self {
        KeyError::Derivation(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipKind {
    No,
    WatchOnly,
    Spendable,
}

/// Derivation path below the master key
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPath(pub Vec<u32>);

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for i in &self.0 {
            write!(f, "/{}", i)?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPath({})", self)
    }
}

/// Source of keys for the wallet. Derivation works while locked; private
/// keys do not.
pub trait KeyProvider: Send + Sync {
    fn derive_next_address(&self, account: u32) -> Result<(PublicKey, KeyPath), KeyError>;

    fn derive_next_stealth_address(&self, account: u32) -> Result<OwnedStealthAddress, KeyError>;

    fn get_private_key(&self, id: &KeyId) -> Result<SecretKey, KeyError>;

    fn get_public_key(&self, id: &KeyId) -> Option<PublicKey>;

    fn have_address(&self, destination: &Destination) -> OwnershipKind;

    fn is_locked(&self) -> bool;

    fn lock(&self);

    fn unlock(&self, passphrase: &str) -> Result<(), KeyError>;
}

const CHAIN_EXTERNAL: u32 = 0;
const CHAIN_STEALTH_SPEND: u32 = 2;

/// In-memory provider over a single extended master key
pub struct MemoryKeyProvider {
    master: ExtKeyPair,
    master_secret: SecretKey,
    scan_seed: [u8; 32],
    passphrase_hash: [u8; 32],
    locked: RwLock<bool>,
    /// Next child index per (account, chain)
    counters: RwLock<HashMap<(u32, u32), u32>>,
    paths: RwLock<HashMap<KeyId, (PublicKey, KeyPath)>>,
    accounts: RwLock<HashMap<KeyId, u32>>,
    watch: RwLock<HashMap<KeyId, PublicKey>>,
}

fn sha256_tagged(tag: &[u8], data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

impl MemoryKeyProvider {
    /// New provider with a random seed, initially unlocked
    pub fn new(passphrase: &str) -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed, passphrase)
    }

    pub fn from_seed(seed: [u8; 32], passphrase: &str) -> Self {
        let master_secret =
            SecretKey::from_scalar(&hash_to_scalar(b"ringct_master_secret", &[&seed]));
        let master = ExtKeyPair {
            pubkey: master_secret.public_key(),
            chain_code: sha256_tagged(b"ringct_master_chain", &seed),
        };
        Self {
            master,
            master_secret,
            scan_seed: sha256_tagged(b"ringct_scan_seed", &seed),
            passphrase_hash: sha256_tagged(b"ringct_passphrase", passphrase.as_bytes()),
            locked: RwLock::new(false),
            counters: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
            accounts: RwLock::new(HashMap::new()),
            watch: RwLock::new(HashMap::new()),
        }
    }

    /// Extended public key of an account, for `Destination::ExtKeyPair`
    pub fn account_ext(&self, account: u32) -> Result<ExtKeyPair, KeyError> {
        let ext = self.master.derive_child(account)?;
        self.accounts
            .write()
            .map_err(|_| KeyError::LockPoisoned)?
            .insert(ext.id(), account);
        Ok(ext)
    }

    pub fn add_watch_key(&self, pubkey: PublicKey) -> Result<(), KeyError> {
        self.watch
            .write()
            .map_err(|_| KeyError::LockPoisoned)?
            .insert(pubkey.key_id(), pubkey);
        Ok(())
    }

    fn derive(&self, account: u32, chain: u32) -> Result<(PublicKey, KeyPath), KeyError> {
        let index = {
            let mut counters = self.counters.write().map_err(|_| KeyError::LockPoisoned)?;
            let next = counters.entry((account, chain)).or_insert(0);
            let index = *next;
            *next += 1;
            index
        };
        let ext = self.master.derive_child(account)?.derive_child(chain)?;
        let pubkey = ext.child_pubkey(index)?;
        let path = KeyPath(vec![account, chain, index]);
        self.paths
            .write()
            .map_err(|_| KeyError::LockPoisoned)?
            .insert(pubkey.key_id(), (pubkey, path.clone()));
        Ok((pubkey, path))
    }

    fn ownership(&self, id: &KeyId) -> OwnershipKind {
        if self.paths.read().map(|p| p.contains_key(id)).unwrap_or(false) {
            OwnershipKind::Spendable
        } else if self.watch.read().map(|w| w.contains_key(id)).unwrap_or(false) {
            OwnershipKind::WatchOnly
        } else {
            OwnershipKind::No
        }
    }
}

impl KeyProvider for MemoryKeyProvider {
    fn derive_next_address(&self, account: u32) -> Result<(PublicKey, KeyPath), KeyError> {
        self.derive(account, CHAIN_EXTERNAL)
    }

    fn derive_next_stealth_address(&self, account: u32) -> Result<OwnedStealthAddress, KeyError> {
        let (spend_pubkey, path) = self.derive(account, CHAIN_STEALTH_SPEND)?;
        let index = path.0.last().copied().unwrap_or(0);
        let scan_secret = SecretKey::from_scalar(&hash_to_scalar(
            b"ringct_scan_secret",
            &[&self.scan_seed, &account.to_le_bytes(), &index.to_le_bytes()],
        ));
        Ok(OwnedStealthAddress {
            address: StealthAddress {
                scan_pubkey: scan_secret.public_key(),
                spend_pubkey,
                prefix: None,
            },
            scan_secret,
            spend_key_id: spend_pubkey.key_id(),
            label: None,
        })
    }

    fn get_private_key(&self, id: &KeyId) -> Result<SecretKey, KeyError> {
        if self.is_locked() {
            return Err(KeyError::Locked);
        }
        let path = self
            .paths
            .read()
            .map_err(|_| KeyError::LockPoisoned)?
            .get(id)
            .map(|(_, path)| path.clone())
            .ok_or_else(|| KeyError::NotFound(id.to_hex()))?;

        let mut secret = self.master_secret.clone();
        let mut ext = self.master;
        for index in path.0 {
            secret = ext.child_secret(&secret, index)?;
            ext = ext.derive_child(index)?;
        }
        Ok(secret)
    }

    fn get_public_key(&self, id: &KeyId) -> Option<PublicKey> {
        if let Some((pk, _)) = self.paths.read().ok()?.get(id) {
            return Some(*pk);
        }
        self.watch.read().ok()?.get(id).copied()
    }

    fn have_address(&self, destination: &Destination) -> OwnershipKind {
        match destination {
            Destination::KeyId(id) => self.ownership(id),
            Destination::Stealth(address) => self.ownership(&address.spend_pubkey.key_id()),
            Destination::ExtKeyPair(ext) => {
                if self
                    .accounts
                    .read()
                    .map(|a| a.contains_key(&ext.id()))
                    .unwrap_or(false)
                {
                    OwnershipKind::Spendable
                } else {
                    OwnershipKind::No
                }
            }
            Destination::Script(script) => match script.key_id() {
                Some(id) => self.ownership(&id),
                None => OwnershipKind::No,
            },
        }
    }

    fn is_locked(&self) -> bool {
        self.locked.read().map(|l| *l).unwrap_or(true)
    }

    fn lock(&self) {
        if let Ok(mut locked) = self.locked.write() {
            *locked = true;
        }
    }

    fn unlock(&self, passphrase: &str) -> Result<(), KeyError> {
        use subtle::ConstantTimeEq;
        let hash = sha256_tagged(b"ringct_passphrase", passphrase.as_bytes());
        if !bool::from(hash[..].ct_eq(&self.passphrase_hash[..])) {
            return Err(KeyError::InvalidPassphrase);
        }
        *self.locked.write().map_err(|_| KeyError::LockPoisoned)? = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Script;

    #[test]
    fn test_derived_keys_match_secrets() {
        let keys = MemoryKeyProvider::new("pw");
        let (pk1, path1) = keys.derive_next_address(0).unwrap();
        let (pk2, path2) = keys.derive_next_address(0).unwrap();

        assert_ne!(pk1, pk2);
        assert_eq!(path1.to_string(), "m/0/0/0");
        assert_eq!(path2.to_string(), "m/0/0/1");
        assert_eq!(keys.get_private_key(&pk2.key_id()).unwrap().public_key(), pk2);
        assert_eq!(keys.get_public_key(&pk1.key_id()), Some(pk1));
    }

    #[test]
    fn test_locking() {
        let keys = MemoryKeyProvider::new("pw");
        let (pk, _) = keys.derive_next_address(1).unwrap();

        keys.lock();
        assert!(keys.is_locked());
        assert_eq!(keys.get_private_key(&pk.key_id()), Err(KeyError::Locked));

        // Public derivation still works while locked
        assert!(keys.derive_next_address(1).is_ok());

        assert_eq!(keys.unlock("wrong"), Err(KeyError::InvalidPassphrase));
        keys.unlock("pw").unwrap();
        assert!(keys.get_private_key(&pk.key_id()).is_ok());
    }

    #[test]
    fn test_ownership() {
        let keys = MemoryKeyProvider::new("pw");
        let (pk, _) = keys.derive_next_address(0).unwrap();
        let stranger = SecretKey::random(&mut rand::thread_rng()).public_key();

        assert_eq!(
            keys.have_address(&Destination::KeyId(pk.key_id())),
            OwnershipKind::Spendable
        );
        assert_eq!(
            keys.have_address(&Destination::Script(Script::for_key_id(&pk.key_id()))),
            OwnershipKind::Spendable
        );
        assert_eq!(
            keys.have_address(&Destination::KeyId(stranger.key_id())),
            OwnershipKind::No
        );

        keys.add_watch_key(stranger).unwrap();
        assert_eq!(
            keys.have_address(&Destination::KeyId(stranger.key_id())),
            OwnershipKind::WatchOnly
        );

        let stealth = keys.derive_next_stealth_address(0).unwrap();
        assert_eq!(
            keys.have_address(&Destination::Stealth(stealth.address)),
            OwnershipKind::Spendable
        );

        let ext = keys.account_ext(3).unwrap();
        assert_eq!(
            keys.have_address(&Destination::ExtKeyPair(ext)),
            OwnershipKind::Spendable
        );
    }

    #[test]
    fn test_seeded_provider_is_deterministic() {
        let a = MemoryKeyProvider::from_seed([4u8; 32], "x");
        let b = MemoryKeyProvider::from_seed([4u8; 32], "y");
        assert_eq!(
            a.derive_next_stealth_address(0).unwrap().address,
            b.derive_next_stealth_address(0).unwrap().address
        );
    }
}

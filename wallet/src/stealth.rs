// Stealth Addresses
// One-time destination keys from an ECDH shared secret, and the scanner that
// recognises outputs paid to the wallet's own addresses

use curve25519_dalek_ng::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

use crate::config::EPHEMERAL_RETRIES;
use crate::crypto::{ecdh, hash_to_scalar, CryptoError, PublicKey, SecretKey, SharedSecret};
use crate::error::WalletError;
use crate::keys::{KeyError, KeyProvider, OwnershipKind};
use crate::recipient::Destination;
use crate::retry::{retry, Attempt};
use crate::types::KeyId;

/// Bit-prefix filter letting scanners skip most outputs without ECDH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StealthPrefix {
    /// Number of significant low bits
    pub bits: u8,
    pub bitfield: u32,
}

impl StealthPrefix {
    pub fn mask(&self) -> u32 {
        match self.bits {
            0 => 0,
            b if b >= 32 => u32::MAX,
            b => (1u32 << b) - 1,
        }
    }

    pub fn matches(&self, prefix: u32) -> bool {
        (prefix & self.mask()) == (self.bitfield & self.mask())
    }

    /// Prefix value for an output: significant bits from the address, the rest random
    pub fn fill<R: RngCore>(&self, rng: &mut R) -> u32 {
        (rng.next_u32() & !self.mask()) | (self.bitfield & self.mask())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StealthAddress {
    pub scan_pubkey: PublicKey,
    pub spend_pubkey: PublicKey,
    pub prefix: Option<StealthPrefix>,
}

impl StealthAddress {
    pub fn id(&self) -> KeyId {
        self.scan_pubkey.key_id()
    }
}

impl fmt::Debug for StealthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StealthAddress({})", self.id().to_hex())
    }
}

/// A stealth address generated by this wallet. The scan secret is always
/// available; the spend secret lives with the key provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnedStealthAddress {
    pub address: StealthAddress,
    pub scan_secret: SecretKey,
    pub spend_key_id: KeyId,
    pub label: Option<String>,
}

impl OwnedStealthAddress {
    pub fn id(&self) -> KeyId {
        self.address.id()
    }
}

/// Recovery data for a claimed one-time key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StealthKeyMeta {
    pub address_id: KeyId,
    pub ephemeral: PublicKey,
}

/// Sender-side result of paying to a stealth address
#[derive(Debug, Clone)]
pub struct StealthDestination {
    pub ephemeral: PublicKey,
    pub shared: SharedSecret,
    pub dest_pubkey: PublicKey,
    pub prefix: Option<u32>,
}

fn stealth_tweak(shared: &SharedSecret) -> Scalar {
    hash_to_scalar(b"ringct_stealth", &[shared.as_bytes()])
}

/// Derive a fresh one-time destination, redrawing the ephemeral key when the
/// shared secret or the tweaked key degenerates.
pub fn derive_destination<R: RngCore + CryptoRng>(
    rng: &mut R,
    address: &StealthAddress,
) -> Result<StealthDestination, WalletError> {
    retry(EPHEMERAL_RETRIES, |_| {
        let ephemeral_secret = SecretKey::random(rng);
        let shared = match ecdh(&ephemeral_secret, &address.scan_pubkey) {
            Ok(s) => s,
            Err(CryptoError::DegenerateSharedSecret) => {
                return Err(Attempt::Retry("degenerate shared secret"))
            }
            Err(e) => return Err(Attempt::Fatal(e.into())),
        };
        let dest_pubkey = match derive_one_time_pubkey(address, &shared) {
            Ok(p) => p,
            Err(CryptoError::InvalidPoint) => return Err(Attempt::Retry("degenerate destination")),
            Err(e) => return Err(Attempt::Fatal(e.into())),
        };
        Ok(StealthDestination {
            ephemeral: ephemeral_secret.public_key(),
            shared,
            dest_pubkey,
            prefix: address.prefix.map(|p| p.fill(rng)),
        })
    })
}

/// One-time public key for an output paid to `address` under `shared`
pub fn derive_one_time_pubkey(
    address: &StealthAddress,
    shared: &SharedSecret,
) -> Result<PublicKey, CryptoError> {
    address.spend_pubkey.tweak_add(&stealth_tweak(shared))
}

/// One-time spend secret for a claimed output
pub fn derive_spend_secret(
    spend_secret: &SecretKey,
    shared: &SharedSecret,
) -> Result<SecretKey, CryptoError> {
    spend_secret.tweak_add(&stealth_tweak(shared))
}

/// How much of a claimed output the wallet controls right now
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimKey {
    Spendable(SecretKey),
    /// Owned, but the wallet is locked; derive on unlock
    Locked,
    WatchOnly,
}

#[derive(Debug, Clone)]
pub struct Claim {
    pub meta: StealthKeyMeta,
    pub dest_key_id: KeyId,
    pub shared: SharedSecret,
    pub key: ClaimKey,
    /// False when the destination was already recorded
    pub is_new: bool,
}

fn claim_key(
    keys: &dyn KeyProvider,
    address: &OwnedStealthAddress,
    shared: &SharedSecret,
    dest: &KeyId,
) -> Result<ClaimKey, WalletError> {
    if keys.have_address(&Destination::KeyId(address.spend_key_id)) != OwnershipKind::Spendable {
        return Ok(ClaimKey::WatchOnly);
    }
    if keys.is_locked() {
        return Ok(ClaimKey::Locked);
    }
    let spend = match keys.get_private_key(&address.spend_key_id) {
        Ok(k) => k,
        Err(KeyError::Locked) => return Ok(ClaimKey::Locked),
        Err(e) => return Err(e.into()),
    };
    let secret = derive_spend_secret(&spend, shared)?;
    if secret.public_key().key_id() != *dest {
        return Err(WalletError::StateInconsistency(format!(
            "derived stealth key does not match {}",
            dest.to_hex()
        )));
    }
    Ok(ClaimKey::Spendable(secret))
}

/// Test whether the one-time key `dest_key_id` was paid to one of `addresses`
pub fn try_claim(
    addresses: &BTreeMap<KeyId, OwnedStealthAddress>,
    known: &HashMap<KeyId, StealthKeyMeta>,
    keys: &dyn KeyProvider,
    dest_key_id: &KeyId,
    ephemeral: &PublicKey,
    prefix: Option<u32>,
) -> Result<Option<Claim>, WalletError> {
    let dest_key_id = *dest_key_id;

    if let Some(meta) = known.get(&dest_key_id) {
        if let Some(address) = addresses.get(&meta.address_id) {
            let shared = ecdh(&address.scan_secret, &meta.ephemeral)?;
            let key = claim_key(keys, address, &shared, &dest_key_id)?;
            return Ok(Some(Claim {
                meta: *meta,
                dest_key_id,
                shared,
                key,
                is_new: false,
            }));
        }
    }

    for address in addresses.values() {
        if let (Some(filter), Some(value)) = (address.address.prefix, prefix) {
            if !filter.matches(value) {
                continue;
            }
        }

        let shared = match ecdh(&address.scan_secret, ephemeral) {
            Ok(s) => s,
            Err(CryptoError::DegenerateSharedSecret) => continue,
            Err(e) => return Err(e.into()),
        };
        let candidate = derive_one_time_pubkey(&address.address, &shared)?;
        if candidate.key_id() != dest_key_id {
            continue;
        }

        let key = claim_key(keys, address, &shared, &dest_key_id)?;
        debug!(
            address = %address.id().to_hex(),
            dest = %dest_key_id.to_hex(),
            locked = matches!(key, ClaimKey::Locked),
            "claimed stealth output"
        );
        return Ok(Some(Claim {
            meta: StealthKeyMeta {
                address_id: address.id(),
                ephemeral: *ephemeral,
            },
            dest_key_id,
            shared,
            key,
            is_new: true,
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MemoryKeyProvider;
    use rand::thread_rng;

    fn setup(prefix: Option<StealthPrefix>) -> (MemoryKeyProvider, BTreeMap<KeyId, OwnedStealthAddress>) {
        let keys = MemoryKeyProvider::new("pass");
        let mut owned = keys.derive_next_stealth_address(0).unwrap();
        owned.address.prefix = prefix;
        let mut addresses = BTreeMap::new();
        addresses.insert(owned.id(), owned);
        (keys, addresses)
    }

    #[test]
    fn test_claim_own_output() {
        let (keys, addresses) = setup(None);
        let address = addresses.values().next().unwrap().address;

        let dest = derive_destination(&mut thread_rng(), &address).unwrap();
        let claim = try_claim(
            &addresses,
            &HashMap::new(),
            &keys,
            &dest.dest_pubkey.key_id(),
            &dest.ephemeral,
            dest.prefix,
        )
        .unwrap()
        .unwrap();

        assert!(claim.is_new);
        assert_eq!(claim.shared, dest.shared);
        match claim.key {
            ClaimKey::Spendable(secret) => assert_eq!(secret.public_key(), dest.dest_pubkey),
            other => panic!("unexpected claim key {:?}", other),
        }
    }

    #[test]
    fn test_foreign_output_not_claimed() {
        let (keys, addresses) = setup(None);
        let (_, other) = setup(None);
        let address = other.values().next().unwrap().address;

        let dest = derive_destination(&mut thread_rng(), &address).unwrap();
        let claim = try_claim(
            &addresses,
            &HashMap::new(),
            &keys,
            &dest.dest_pubkey.key_id(),
            &dest.ephemeral,
            None,
        )
        .unwrap();
        assert!(claim.is_none());
    }

    #[test]
    fn test_prefix_filter() {
        let prefix = StealthPrefix {
            bits: 4,
            bitfield: 0b1010,
        };
        assert!(prefix.matches(0xffff_fffa));
        assert!(!prefix.matches(0xffff_fffb));
        assert_eq!(prefix.fill(&mut thread_rng()) & 0xf, 0b1010);

        let (keys, addresses) = setup(Some(prefix));
        let address = addresses.values().next().unwrap().address;
        let dest = derive_destination(&mut thread_rng(), &address).unwrap();

        // A non-matching prefix skips the address entirely
        let skipped = try_claim(
            &addresses,
            &HashMap::new(),
            &keys,
            &dest.dest_pubkey.key_id(),
            &dest.ephemeral,
            Some(0b0101),
        )
        .unwrap();
        assert!(skipped.is_none());

        let found = try_claim(
            &addresses,
            &HashMap::new(),
            &keys,
            &dest.dest_pubkey.key_id(),
            &dest.ephemeral,
            dest.prefix,
        )
        .unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_locked_claim_and_fast_path() {
        let (keys, addresses) = setup(None);
        let address = addresses.values().next().unwrap().address;
        let dest = derive_destination(&mut thread_rng(), &address).unwrap();

        keys.lock();
        let claim = try_claim(
            &addresses,
            &HashMap::new(),
            &keys,
            &dest.dest_pubkey.key_id(),
            &dest.ephemeral,
            None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(claim.key, ClaimKey::Locked);

        let mut known = HashMap::new();
        known.insert(claim.dest_key_id, claim.meta);
        keys.unlock("pass").unwrap();

        // Already recorded: the fast path ignores the ephemeral argument
        let again = try_claim(
            &addresses,
            &known,
            &keys,
            &dest.dest_pubkey.key_id(),
            &PublicKey([0u8; 32]),
            None,
        )
        .unwrap()
        .unwrap();
        assert!(!again.is_new);
        assert!(matches!(again.key, ClaimKey::Spendable(_)));
    }
}

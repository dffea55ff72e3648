// Wallet Storage
// Persists transaction records, stealth addresses and index data in sled,
// written through atomic batches

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::crypto::KeyImage;
use crate::records::TransactionRecord;
use crate::stealth::{OwnedStealthAddress, StealthKeyMeta};
use crate::types::{KeyId, OutPoint, Txid};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

const RECORD_PREFIX: &str = "rtx_";
const STEALTH_ADDRESS_PREFIX: &str = "sxad_";
const STEALTH_KEY_PREFIX: &str = "sxkm_";
const LOCKED_OUTPUT_PREFIX: &str = "lock_";
const KEY_IMAGE_PREFIX: &str = "ki_";
const ANON_BLACKLIST_PREFIX: &str = "anbl_";
const EXT_COUNTER_PREFIX: &str = "extc_";
const CHANGE_ADDRESS_KEY: &str = "__change_address__";

fn record_key(txid: &Txid) -> String {
    format!("{}{}", RECORD_PREFIX, txid.to_hex())
}

fn stealth_address_key(id: &KeyId) -> String {
    format!("{}{}", STEALTH_ADDRESS_PREFIX, id.to_hex())
}

fn stealth_key_key(id: &KeyId) -> String {
    format!("{}{}", STEALTH_KEY_PREFIX, id.to_hex())
}

fn locked_output_key(outpoint: &OutPoint) -> String {
    format!("{}{}", LOCKED_OUTPUT_PREFIX, outpoint.key())
}

fn key_image_key(image: &KeyImage) -> String {
    format!("{}{}", KEY_IMAGE_PREFIX, image.to_hex())
}

fn blacklist_key(index: u64) -> String {
    format!("{}{:020}", ANON_BLACKLIST_PREFIX, index)
}

fn ext_counter_key(id: &KeyId) -> String {
    format!("{}{}", EXT_COUNTER_PREFIX, id.to_hex())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn parse_key_id(hex_str: &str) -> Result<KeyId, StorageError> {
    let bytes = hex::decode(hex_str).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    let array: [u8; 20] = bytes
        .try_into()
        .map_err(|_| StorageError::SerializationError(format!("bad key id {}", hex_str)))?;
    Ok(KeyId(array))
}

/// Wallet storage backend
pub struct WalletStorage {
    db: Arc<Db>,
}

/// Pending writes, applied atomically by `commit`
pub struct StoreBatch {
    db: Arc<Db>,
    batch: sled::Batch,
    writes: usize,
}

impl WalletStorage {
    /// Open wallet storage
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// In-memory database, discarded on drop
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn begin(&self) -> StoreBatch {
        StoreBatch {
            db: Arc::clone(&self.db),
            batch: sled::Batch::default(),
            writes: 0,
        }
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self
            .db
            .get(key.as_bytes())
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>, StorageError> {
        let mut items = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            let suffix = key.strip_prefix(prefix).unwrap_or(&key).to_string();
            items.push((suffix, decode(&value)?));
        }
        Ok(items)
    }

    pub fn load_record(&self, txid: &Txid) -> Result<TransactionRecord, StorageError> {
        self.get(&record_key(txid))?
            .ok_or_else(|| StorageError::NotFound(format!("Transaction record {}", txid)))
    }

    pub fn load_records(&self) -> Result<Vec<TransactionRecord>, StorageError> {
        Ok(self
            .scan::<TransactionRecord>(RECORD_PREFIX)?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }

    pub fn load_stealth_addresses(&self) -> Result<Vec<OwnedStealthAddress>, StorageError> {
        Ok(self
            .scan::<OwnedStealthAddress>(STEALTH_ADDRESS_PREFIX)?
            .into_iter()
            .map(|(_, a)| a)
            .collect())
    }

    /// One-time key id to recovery metadata
    pub fn load_stealth_keys(&self) -> Result<Vec<(KeyId, StealthKeyMeta)>, StorageError> {
        self.scan::<StealthKeyMeta>(STEALTH_KEY_PREFIX)?
            .into_iter()
            .map(|(id, meta)| Ok((parse_key_id(&id)?, meta)))
            .collect()
    }

    pub fn load_locked_outputs(&self) -> Result<Vec<OutPoint>, StorageError> {
        Ok(self
            .scan::<OutPoint>(LOCKED_OUTPUT_PREFIX)?
            .into_iter()
            .map(|(_, o)| o)
            .collect())
    }

    pub fn load_key_images(&self) -> Result<Vec<(KeyImage, OutPoint)>, StorageError> {
        Ok(self
            .scan::<(KeyImage, OutPoint)>(KEY_IMAGE_PREFIX)?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    pub fn load_anon_blacklist(&self) -> Result<Vec<u64>, StorageError> {
        Ok(self
            .scan::<u64>(ANON_BLACKLIST_PREFIX)?
            .into_iter()
            .map(|(_, i)| i)
            .collect())
    }

    pub fn load_ext_counters(&self) -> Result<Vec<(KeyId, u32)>, StorageError> {
        self.scan::<u32>(EXT_COUNTER_PREFIX)?
            .into_iter()
            .map(|(id, counter)| Ok((parse_key_id(&id)?, counter)))
            .collect()
    }

    pub fn load_change_address(&self) -> Result<Option<KeyId>, StorageError> {
        self.get(CHANGE_ADDRESS_KEY)
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}

impl StoreBatch {
    fn put<T: Serialize>(&mut self, key: String, value: &T) -> Result<(), StorageError> {
        self.batch.insert(key.into_bytes(), encode(value)?);
        self.writes += 1;
        Ok(())
    }

    fn remove(&mut self, key: String) {
        self.batch.remove(key.into_bytes());
        self.writes += 1;
    }

    pub fn put_record(&mut self, record: &TransactionRecord) -> Result<(), StorageError> {
        self.put(record_key(&record.txid), record)
    }

    pub fn put_stealth_address(&mut self, address: &OwnedStealthAddress) -> Result<(), StorageError> {
        self.put(stealth_address_key(&address.id()), address)
    }

    pub fn put_stealth_key(&mut self, id: &KeyId, meta: &StealthKeyMeta) -> Result<(), StorageError> {
        self.put(stealth_key_key(id), meta)
    }

    pub fn put_locked_output(&mut self, outpoint: &OutPoint) -> Result<(), StorageError> {
        self.put(locked_output_key(outpoint), outpoint)
    }

    pub fn remove_locked_output(&mut self, outpoint: &OutPoint) {
        self.remove(locked_output_key(outpoint));
    }

    pub fn put_key_image(&mut self, image: &KeyImage, outpoint: &OutPoint) -> Result<(), StorageError> {
        self.put(key_image_key(image), &(*image, *outpoint))
    }

    pub fn put_blacklisted(&mut self, index: u64) -> Result<(), StorageError> {
        self.put(blacklist_key(index), &index)
    }

    pub fn put_ext_counter(&mut self, id: &KeyId, counter: u32) -> Result<(), StorageError> {
        self.put(ext_counter_key(id), &counter)
    }

    pub fn put_change_address(&mut self, id: &KeyId) -> Result<(), StorageError> {
        self.put(CHANGE_ADDRESS_KEY.to_string(), id)
    }

    pub fn is_empty(&self) -> bool {
        self.writes == 0
    }

    /// Apply every write atomically and flush
    pub fn commit(self) -> Result<(), StorageError> {
        if self.writes == 0 {
            return Ok(());
        }
        self.db
            .apply_batch(self.batch)
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        debug!(writes = self.writes, "committed storage batch");
        Ok(())
    }

    /// Discard every write
    pub fn abort(self) {
        debug!(writes = self.writes, "aborted storage batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{flags, OutputRecord};
    use crate::types::{Hash256, OutputKind};
    use tempfile::TempDir;

    fn record(tag: &[u8]) -> TransactionRecord {
        let mut rtx = TransactionRecord::new(Hash256::hash(tag));
        let mut out = OutputRecord::new(0, OutputKind::Standard, 1_000);
        out.flags = flags::OWNED;
        rtx.insert_output(out);
        rtx
    }

    #[test]
    fn test_batch_commit_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("wallet.db");
        let rtx = record(b"a");
        let outpoint = OutPoint::new(rtx.txid, 0);
        let image = KeyImage([7u8; 32]);

        {
            let storage = WalletStorage::open(&path).unwrap();
            let mut batch = storage.begin();
            batch.put_record(&rtx).unwrap();
            batch.put_locked_output(&outpoint).unwrap();
            batch.put_key_image(&image, &outpoint).unwrap();
            batch.put_blacklisted(42).unwrap();
            batch.put_ext_counter(&KeyId([1u8; 20]), 3).unwrap();
            batch.commit().unwrap();
        }

        let storage = WalletStorage::open(&path).unwrap();
        assert_eq!(storage.load_record(&rtx.txid).unwrap(), rtx);
        assert_eq!(storage.load_records().unwrap().len(), 1);
        assert_eq!(storage.load_locked_outputs().unwrap(), vec![outpoint]);
        assert_eq!(storage.load_key_images().unwrap(), vec![(image, outpoint)]);
        assert_eq!(storage.load_anon_blacklist().unwrap(), vec![42]);
        assert_eq!(
            storage.load_ext_counters().unwrap(),
            vec![(KeyId([1u8; 20]), 3)]
        );
    }

    #[test]
    fn test_abort_discards() {
        let storage = WalletStorage::temporary().unwrap();
        let rtx = record(b"b");

        let mut batch = storage.begin();
        batch.put_record(&rtx).unwrap();
        assert!(!batch.is_empty());
        batch.abort();

        assert!(matches!(
            storage.load_record(&rtx.txid),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_locked_output() {
        let storage = WalletStorage::temporary().unwrap();
        let outpoint = OutPoint::new(Hash256::hash(b"c"), 1);

        let mut batch = storage.begin();
        batch.put_locked_output(&outpoint).unwrap();
        batch.commit().unwrap();

        let mut batch = storage.begin();
        batch.remove_locked_output(&outpoint);
        batch.commit().unwrap();
        assert!(storage.load_locked_outputs().unwrap().is_empty());
    }
}

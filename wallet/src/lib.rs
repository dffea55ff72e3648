// RingCT Wallet Library
// Confidential transaction construction and ownership detection for
// standard, blinded and anonymous outputs

// Public modules
pub mod blinding;
pub mod builder;
pub mod chain;
pub mod coin_selection;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod logging;
pub mod recipient;
pub mod records;
pub mod retry;
pub mod ring;
pub mod state;
pub mod stealth;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod wallet;

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use crate::builder::{BuiltTransaction, InputKind, TransactionBuilder};
pub use crate::chain::{ChainState, FeePolicy, MemoryChain};
pub use crate::coin_selection::CoinControl;
pub use crate::config::WalletConfig;
pub use crate::error::{InputError, ResourceError, Result, WalletError};
pub use crate::keys::{KeyProvider, MemoryKeyProvider, OwnershipKind};
pub use crate::recipient::{Destination, Recipient};
pub use crate::records::{OutputRecord, TransactionRecord};
pub use crate::stealth::StealthAddress;
pub use crate::transaction::Transaction;
pub use crate::types::{Amount, OutPoint, OutputKind, Txid, CENT, COIN};
pub use crate::wallet::{Balances, SharedChain, Wallet};

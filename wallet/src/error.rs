// Wallet error taxonomy

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::keys::KeyError;
use crate::storage::StorageError;
use crate::types::{Amount, OutPoint, Txid};

/// Caller mistakes, reported before any state changes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("No recipients")]
    NoRecipients,

    #[error("Negative amount: {0}")]
    NegativeAmount(Amount),

    #[error("Amount must be positive")]
    ZeroAmount,

    #[error("Amount out of range: {0}")]
    AmountOutOfRange(Amount),

    #[error("Output {amount} below dust threshold {threshold}")]
    Dust { amount: Amount, threshold: Amount },

    #[error("Unsupported destination for {0} output")]
    UnsupportedDestination(&'static str),

    #[error("Narration is {len} bytes, maximum is {max}")]
    NarrationTooLong { len: usize, max: usize },

    #[error("Ring size {size} out of range [{min}, {max}]")]
    RingSizeOutOfRange { size: usize, min: usize, max: usize },

    #[error("Too many inputs per signature: {count}, maximum {max}")]
    TooManyInputs { count: usize, max: usize },

    #[error("Change position {0} out of range")]
    ChangePosition(usize),

    #[error("Selected input not available: {0}")]
    UnknownInput(OutPoint),

    #[error("Selected input {outpoint} is not a {expected} output")]
    InputKind { outpoint: OutPoint, expected: &'static str },
}

/// Bounded resources ran out
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Amount, available: Amount },

    #[error("Not enough anonymous outputs exist: have {available}, need {required}")]
    NotEnoughAnonOutputs { available: u64, required: u64 },

    #[error("Exceeded maximum tries picking decoys for input {input}, column {column}")]
    DecoyPoolExhausted { input: usize, column: usize },

    #[error("Fee calculation did not converge after {0} iterations")]
    FeeIterationLimit(usize),

    #[error("Transaction fee and change calculation failed")]
    SubFeeTriesExhausted,

    #[error("Gave up after {0} attempts")]
    RetriesExhausted(usize),
}

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Invalid input: {0}")]
    Input(#[from] InputError),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(#[from] ResourceError),

    #[error("Cryptographic failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Wallet state inconsistency: {0}")]
    StateInconsistency(String),

    #[error("Wallet is locked")]
    Locked,

    #[error("Fee {fee} below relay minimum {minimum}: transaction too large for fee policy")]
    FeePolicy { fee: Amount, minimum: Amount },

    #[error("Transaction too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Transaction not found: {0}")]
    TxNotFound(Txid),

    #[error("Cannot abandon transaction: {0}")]
    Abandon(String),

    #[error("Key error: {0}")]
    Key(KeyError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl From<KeyError> for WalletError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::Locked => WalletError::Locked,
            other => WalletError::Key(other),
        }
    }
}

impl WalletError {
    /// Duplicate key images mean the ledger missed a spend of its own output
    pub fn needs_rescan(&self) -> bool {
        matches!(self, WalletError::Crypto(CryptoError::DuplicateKeyImage(_)))
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;

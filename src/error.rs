//! Error types for ledger, sandbox and mempool validation

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("Invalid sender address: {0}")]
    InvalidSender(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Contract lookup failure: {0}")]
    ContractNotFound(String),

    #[error("Can not find function: {0}")]
    FunctionNotFound(String),

    #[error("Can not call internal function directly: {0}")]
    ForbiddenDirectCall(String),

    #[error("Too many args in contract call: {given} exceeds {limit}")]
    ArgumentLimitExceeded { given: usize, limit: usize },

    #[error("Run out of instruction budget: {0} instructions allowed")]
    InstructionBudgetExceeded(u64),

    #[error("Run out of limit instruction: call depth exceeds {0}")]
    RecursionLimitExceeded(usize),

    #[error("Invalid destination address: {0}")]
    InvalidDestination(String),

    #[error("Amount out of range: {0}")]
    AmountOutOfRange(String),

    #[error("Double spend conflict: {0}")]
    DoubleSpendConflict(String),

    #[error("State corruption: {0}")]
    StateCorruption(String),

    #[error("Input not found: {0}")]
    InputNotFound(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Contract execution failed: {0}")]
    ContractExecution(String),

    #[error("Contract data too large: {size} bytes exceeds {limit}")]
    DataLimitExceeded { size: usize, limit: usize },

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Orphan block: parent {0} unknown")]
    OrphanBlock(String),

    #[error("Block already known: {0}")]
    DuplicateBlock(String),

    #[error("Unknown block: {0}")]
    UnknownBlock(String),

    #[error("Stale tip handle: {0}")]
    StaleTip(String),

    #[error("Mempool is full")]
    MempoolFull,

    #[error("Transaction already in mempool: {0}")]
    AlreadyInMempool(String),

    #[error("Chain does not have more work: {0}")]
    NotBetterChain(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Only state corruption is unrecoverable; every other kind is reported and discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::StateCorruption(_))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

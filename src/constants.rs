//! Ledger and contract execution constants

/// Smallest units per coin
pub const COIN: i64 = 100_000_000;

/// Maximum money supply: 21,000,000 coins in smallest units
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Maximum serialized transaction size: 1MB
pub const MAX_TX_SIZE: usize = 1_000_000;

/// Maximum number of inputs per transaction
pub const MAX_INPUTS: usize = 1000;

/// Maximum number of outputs per transaction
pub const MAX_OUTPUTS: usize = 1000;

/// Halving interval: 210,000 blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Initial block subsidy: 50 coins
pub const INITIAL_SUBSIDY: i64 = 50 * COIN;

/// Instructions a single top-level contract invocation may execute
pub const DEFAULT_INSTRUCTION_BUDGET: u64 = 15_000;

/// Nested contract-to-contract calls allowed below the entry call
pub const MAX_CALL_DEPTH: usize = 18;

/// Fixed argument slots of a contract function
pub const MAX_CALL_ARGS: usize = 12;

/// Value stack limit inside one frame
pub const MAX_STACK_SIZE: usize = 1000;

/// Longest string a contract may build on its stack
pub const MAX_VALUE_LEN: usize = 16 * 1024;

/// Bytes a contract may copy for the price of one instruction
pub const COPY_BYTES_PER_INSTRUCTION: u64 = 256;

/// Change below this many units is coalesced instead of emitted (0.001 coin)
pub const DUST_THRESHOLD: i64 = COIN / 1000;

/// Blocks before a coinbase output may be spent
pub const COINBASE_MATURITY: u64 = 100;

/// Blocks before an output created by a contract send may be spent
pub const CONTRACT_OUTPUT_MATURITY: u64 = 1;

/// Pool capacity in transactions
pub const MAX_MEMPOOL_TRANSACTIONS: usize = 5000;

/// Blocks held while waiting for an unknown parent
pub const MAX_ORPHAN_BLOCKS: usize = 100;

/// Maximum published contract code size in bytes
pub const MAX_CONTRACT_CODE_LEN: usize = 65_536;

/// Maximum serialized persistent data per contract
pub const MAX_CONTRACT_DATA_LEN: usize = 1024 * 1024;

/// Decimal places of the coin unit
pub const COIN_DECIMALS: usize = 8;

/// Address version byte for public key hash destinations
pub const ADDRESS_VERSION: u8 = 0x32;

/// Address version byte for contract destinations
pub const CONTRACT_VERSION: u8 = 0x0f;

//! # Contract-Ledger
//!
//! Reorg-safe mempool and contract-state consistency engine for a UTXO ledger
//! with metered smart-contract execution.
//!
//! ## Architecture
//!
//! Components, leaves first:
//! - Ledger State (`ledger`): UTXO set and contract accounts addressed by tip handle
//! - Contract Execution Sandbox (`sandbox`, `vm`): metered, deterministic invocation
//! - Payment Coalescer (`coalescer`): dust accumulation and settlement of transfer plans
//! - Mempool Admission Controller (`mempool`): ordered validation pipeline and pool view
//! - Fork/Reorg Manager (`reorganization`): block index, best tip, rewind and replay
//!
//! ## Usage
//!
//! ```rust
//! use contract_ledger::{ChainConfig, ContractLedger};
//! use contract_ledger::types::*;
//!
//! let coinbase = Transaction {
//!     version: 1,
//!     inputs: vec![],
//!     outputs: vec![],
//!     payload: TxPayload::Coinbase { height: 0 },
//! };
//! let genesis = Block::new([0; 32], 0, 0x207fffff, vec![coinbase]);
//! let node = ContractLedger::new(ChainConfig::default(), genesis).unwrap();
//!
//! assert_eq!(node.chain_tips().len(), 1);
//! assert!(node.mempool_txids().is_empty());
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod config;
pub mod address;
pub mod transaction;
pub mod vm;
pub mod sandbox;
pub mod coalescer;
pub mod economic;
pub mod ledger;
pub mod parallel;
pub mod mempool;
pub mod reorganization;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use config::ChainConfig;
pub use error::{LedgerError, Result};
pub use ledger::TipHandle;
pub use mempool::{MempoolEntry, MempoolResult};
pub use reorganization::{ChainTip, ChainUpdate, TipStatus};
pub use sandbox::ExecutionOutcome;

use address::parse_contract;
use mempool::{accept_to_memory_pool, prevalidate_transfer, Mempool, PoolView};
use parking_lot::{Mutex, RwLock};
use reorganization::ChainState;
use sandbox::{execute, Invocation, StateView};

/// Engine facade
///
/// Block application and reorgs take the chain write lock, so admission and
/// queries wait for them rather than fail. Locks are always taken chain first,
/// pool second.
pub struct ContractLedger {
    chain: RwLock<ChainState>,
    mempool: Mutex<Mempool>,
}

impl ContractLedger {
    /// Start an engine from its genesis block
    pub fn new(config: ChainConfig, genesis: Block) -> Result<Self> {
        Ok(ContractLedger {
            chain: RwLock::new(ChainState::new(config, genesis)?),
            mempool: Mutex::new(Mempool::new()),
        })
    }

    pub fn config(&self) -> ChainConfig {
        self.chain.read().config().clone()
    }

    /// Validate a transaction and add it to the pool
    ///
    /// Plain transfers are validated before the pool is locked; only the
    /// conflict check and insertion are serialized. Calls and publishes read
    /// the pool view and run entirely under the pool lock.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<MempoolResult> {
        let chain = self.chain.read();
        chain.check_running()?;
        let config = chain.config();

        let result = match tx.payload {
            TxPayload::Transfer => prevalidate_transfer(&tx, chain.ledger(), config)?,
            _ => {
                let mut pool = self.mempool.lock();
                let result = accept_to_memory_pool(&tx, chain.ledger(), &pool, config)?;
                return Ok(admit(&mut pool, result, config));
            }
        };
        let mut pool = self.mempool.lock();
        Ok(admit(&mut pool, result, config))
    }

    /// Run the full admission pipeline without touching the pool or the ledger
    pub fn dry_run_transaction(&self, tx: &Transaction) -> Result<MempoolResult> {
        let chain = self.chain.read();
        chain.check_running()?;
        let pool = self.mempool.lock();
        accept_to_memory_pool(tx, chain.ledger(), &pool, chain.config())
    }

    /// Read-only invocation with no caller and no payment, against the pool view
    pub fn simulate_call(&self, contract: &str, function: &str, args: &[Value]) -> Result<ExecutionOutcome> {
        let chain = self.chain.read();
        let pool = self.mempool.lock();
        let view = PoolView::new(chain.ledger(), Some(&pool));

        let id = parse_contract(contract)?;
        if view.account(&id).is_none() {
            return Err(LedgerError::ContractNotFound(contract.to_string()));
        }
        let invocation = Invocation {
            contract: id,
            function,
            args,
            payment: 0,
            caller: None,
        };
        execute(&view, &invocation, chain.config())
    }

    /// Confirmed balance at the best tip
    pub fn balance_of(&self, address: &str) -> Result<Amount> {
        let destination: Destination = address.parse()?;
        let chain = self.chain.read();
        chain.ledger().balance_of(&destination, &chain.best_tip()?)
    }

    /// Confirmed balance as of any retained, valid tip
    pub fn balance_of_at(&self, address: &str, tip: &Hash) -> Result<Amount> {
        let destination: Destination = address.parse()?;
        let ledger = self.chain.read().ledger_at(tip)?;
        let handle = ledger
            .tip()
            .ok_or_else(|| LedgerError::StateCorruption("ledger has no tip".into()))?;
        ledger.balance_of(&destination, &handle)
    }

    /// Confirmed value of a contract key; Ok(None) when not set
    pub fn contract_data_get(&self, contract: &str, key: &str) -> Result<Option<Value>> {
        let id = parse_contract(contract)?;
        let chain = self.chain.read();
        chain.ledger().contract_data_get(&id, key, &chain.best_tip()?)
    }

    pub fn chain_tips(&self) -> Vec<ChainTip> {
        self.chain.read().chain_tips()
    }

    pub fn best_tip(&self) -> Result<TipHandle> {
        self.chain.read().best_tip()
    }

    /// Accept a block; if the best tip changes, rebuild the pool with the
    /// abandoned transactions queued first
    pub fn apply_block(&self, block: Block) -> Result<ChainUpdate> {
        let mut chain = self.chain.write();
        let update = chain.accept_block(block)?;
        self.refresh_pool(&chain, &update)?;
        Ok(update)
    }

    /// Switch the best chain to a known tip with more work
    pub fn handle_reorg(&self, new_best: &Hash) -> Result<ChainUpdate> {
        let mut chain = self.chain.write();
        let update = chain.handle_reorg(*new_best)?;
        self.refresh_pool(&chain, &update)?;
        Ok(update)
    }

    fn refresh_pool(&self, chain: &ChainState, update: &ChainUpdate) -> Result<()> {
        if !update.tip_changed() {
            return Ok(());
        }
        let mut pool = self.mempool.lock();
        pool.revalidate(chain.ledger(), chain.config(), update.abandoned.clone())?;
        Ok(())
    }

    /// Pool transaction ids in arrival order
    pub fn mempool_txids(&self) -> Vec<Hash> {
        self.mempool.lock().txids()
    }

    pub fn mempool_entry(&self, txid: &Hash) -> Option<MempoolEntry> {
        self.mempool.lock().get(txid).cloned()
    }

    pub fn ledger_digest(&self) -> Hash {
        self.chain.read().ledger().digest()
    }

    pub fn mempool_digest(&self) -> Hash {
        self.mempool.lock().digest()
    }

    pub fn is_halted(&self) -> bool {
        self.chain.read().is_halted()
    }
}

fn admit(pool: &mut Mempool, result: MempoolResult, config: &ChainConfig) -> MempoolResult {
    match result {
        MempoolResult::Accepted(entry) => {
            let accepted = entry.clone();
            match pool.admit(*entry, config) {
                Ok(_) => MempoolResult::Accepted(accepted),
                Err(reason) => MempoolResult::Rejected(reason),
            }
        }
        rejected => rejected,
    }
}

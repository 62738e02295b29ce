//! Engine configuration

use crate::constants::*;
use crate::error::{LedgerError, Result};
use crate::types::Amount;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Limits and thresholds shared by the sandbox, the pool and block validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_instruction_budget")]
    pub instruction_budget: u64,
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    #[serde(default = "default_max_call_args")]
    pub max_call_args: usize,
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: Amount,
    #[serde(default = "default_coinbase_maturity")]
    pub coinbase_maturity: u64,
    #[serde(default = "default_contract_output_maturity")]
    pub contract_output_maturity: u64,
    #[serde(default = "default_max_mempool_transactions")]
    pub max_mempool_transactions: usize,
    #[serde(default = "default_max_contract_code_len")]
    pub max_contract_code_len: usize,
    #[serde(default = "default_max_contract_data_len")]
    pub max_contract_data_len: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            instruction_budget: default_instruction_budget(),
            max_call_depth: default_max_call_depth(),
            max_call_args: default_max_call_args(),
            dust_threshold: default_dust_threshold(),
            coinbase_maturity: default_coinbase_maturity(),
            contract_output_maturity: default_contract_output_maturity(),
            max_mempool_transactions: default_max_mempool_transactions(),
            max_contract_code_len: default_max_contract_code_len(),
            max_contract_data_len: default_max_contract_data_len(),
        }
    }
}

impl ChainConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: ChainConfig =
            serde_json::from_str(text).map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file; an absent file yields the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(LedgerError::Config(format!("{}: {}", path.display(), err))),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instruction_budget == 0 {
            return Err(LedgerError::Config("instruction_budget must be positive".into()));
        }
        if self.max_call_args > MAX_CALL_ARGS {
            return Err(LedgerError::Config(format!(
                "max_call_args {} exceeds the {} argument slots",
                self.max_call_args, MAX_CALL_ARGS
            )));
        }
        if self.dust_threshold < 0 || self.dust_threshold > MAX_MONEY {
            return Err(LedgerError::Config("dust_threshold out of range".into()));
        }
        if self.max_mempool_transactions == 0 {
            return Err(LedgerError::Config("max_mempool_transactions must be positive".into()));
        }
        if self.max_contract_code_len == 0 || self.max_contract_data_len == 0 {
            return Err(LedgerError::Config("contract size limits must be positive".into()));
        }
        Ok(())
    }
}

fn default_instruction_budget() -> u64 {
    DEFAULT_INSTRUCTION_BUDGET
}

fn default_max_call_depth() -> usize {
    MAX_CALL_DEPTH
}

fn default_max_call_args() -> usize {
    MAX_CALL_ARGS
}

fn default_dust_threshold() -> Amount {
    DUST_THRESHOLD
}

fn default_coinbase_maturity() -> u64 {
    COINBASE_MATURITY
}

fn default_contract_output_maturity() -> u64 {
    CONTRACT_OUTPUT_MATURITY
}

fn default_max_mempool_transactions() -> usize {
    MAX_MEMPOOL_TRANSACTIONS
}

fn default_max_contract_code_len() -> usize {
    MAX_CONTRACT_CODE_LEN
}

fn default_max_contract_data_len() -> usize {
    MAX_CONTRACT_DATA_LEN
}

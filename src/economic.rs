//! Block subsidy and coinbase value limits

use crate::constants::*;
use crate::error::{LedgerError, Result};
use crate::types::*;

/// GetBlockSubsidy: ℕ → ℤ
///
/// Calculate the block subsidy for a given height.
/// Subsidy halves every 210,000 blocks (HALVING_INTERVAL).
///
/// Formula: subsidy = 50 * C * 2^(-⌊h/H⌋)
/// Where:
/// - h = block height
/// - H = HALVING_INTERVAL (210,000)
/// - C = COIN (10^8)
pub fn get_block_subsidy(height: Height) -> Amount {
    let halving_period = height / HALVING_INTERVAL;

    // After 64 halvings, subsidy becomes 0
    if halving_period >= 64 {
        return 0;
    }

    INITIAL_SUBSIDY >> halving_period
}

/// CheckCoinbaseValue: 𝒯𝒳 × ℕ × ℤ → {valid, invalid}
///
/// 1. Let claimed = Σₒ coinbase.outputs
/// 2. Let allowed = GetBlockSubsidy(height) + fees
/// 3. claimed ≤ allowed
pub fn check_coinbase_value(coinbase: &Transaction, height: Height, fees: Amount) -> Result<()> {
    // 1. Claimed value
    let claimed: Amount = coinbase.outputs.iter().map(|o| o.value).sum();

    // 2. Allowed value
    let allowed = get_block_subsidy(height)
        .checked_add(fees)
        .ok_or_else(|| LedgerError::InvalidBlock("Fee total overflow".into()))?;

    // 3. Compare
    if claimed > allowed {
        return Err(LedgerError::InvalidBlock(format!(
            "Coinbase output {} exceeds fees + subsidy {}",
            claimed, allowed
        )));
    }
    Ok(())
}

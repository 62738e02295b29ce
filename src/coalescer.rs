//! Payment coalescing and settlement of contract transfer plans
//!
//! Change left over after a contract pays out is only emitted as a real
//! output when it reaches the dust threshold. Smaller change is kept as
//! account-level dust and swept into the next emitted change, or emitted on
//! an explicit flush.

use crate::error::{LedgerError, Result};
use crate::sandbox::TransferPlan;
use crate::types::*;
use std::collections::{BTreeMap, BTreeSet};

/// Source of contract-owned value at the point a settlement is built or checked
pub trait ContractFunds {
    /// Owner and value of a spendable contract output
    fn contract_output(&self, outpoint: &OutPoint) -> Option<(ContractId, Amount)>;

    /// Spendable outputs of a contract that nothing else has claimed, in outpoint order
    fn spendable_outputs(&self, id: &ContractId) -> Vec<(OutPoint, Amount)>;

    /// Dust the contract may draw
    fn available_dust(&self, id: &ContractId) -> Amount;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DustDecision {
    /// Value of the change output, zero for none
    pub emitted: Amount,
    /// Dust taken out of the account
    pub drawn: Amount,
    /// Change put into the account instead of emitted
    pub deposited: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentCoalescer {
    pub threshold: Amount,
}

impl PaymentCoalescer {
    pub fn new(threshold: Amount) -> Self {
        Self { threshold }
    }

    /// Coalesce: change × dust × flush → (emitted, drawn, deposited)
    ///
    /// 1. total = change + accumulated
    /// 2. If total > 0 and (total ≥ threshold or flush): emit total, drawing all dust
    /// 3. Otherwise deposit the change and leave the dust in place
    ///
    /// change + drawn = emitted + deposited always holds.
    pub fn coalesce(&self, change: Amount, accumulated: Amount, flush: bool) -> DustDecision {
        // 1. Total
        let total = change + accumulated;

        // 2. Emit
        if total > 0 && (total >= self.threshold || flush) {
            return DustDecision { emitted: total, drawn: accumulated, deposited: 0 };
        }

        // 3. Accumulate
        DustDecision { emitted: 0, drawn: 0, deposited: change }
    }
}

/// Per-contract requirements derived from a plan
fn requirements(plan: &TransferPlan) -> BTreeMap<ContractId, (Amount, bool)> {
    let mut needs: BTreeMap<ContractId, (Amount, bool)> = BTreeMap::new();
    for (contract, amount) in plan.outgoing() {
        needs.entry(contract).or_default().0 = amount;
    }
    for contract in &plan.flush {
        needs.entry(*contract).or_default().1 = true;
    }
    needs
}

fn transfer_outputs(plan: &TransferPlan) -> Vec<TxOutput> {
    plan.transfers
        .iter()
        .map(|t| TxOutput { value: t.amount, destination: Destination::Address(t.to) })
        .collect()
}

/// BuildSettlement: 𝒫𝐿𝒜𝒩 × ℱ𝒰𝒩𝒟𝒮 → 𝒮𝐸𝒯𝒯𝐿𝐸
///
/// 1. Outputs start with the plan's transfers in order
/// 2. For each contract in id order, select unclaimed outputs in outpoint order
///    until the amount it sends is covered
/// 3. If outputs alone fall short, draw all dust to cover the rest
/// 4. Coalesce the change with the remaining dust
/// 5. Append one change output per contract that emits change
pub fn build_settlement<F: ContractFunds + ?Sized>(
    plan: &TransferPlan,
    funds: &F,
    coalescer: &PaymentCoalescer,
) -> Result<Settlement> {
    // 1. Recipient outputs
    let mut settlement = Settlement {
        inputs: Vec::new(),
        outputs: transfer_outputs(plan),
        dust: Vec::new(),
    };

    for (contract, (needed, flush)) in requirements(plan) {
        // 2. Select outputs
        let mut selected: Amount = 0;
        if needed > 0 {
            for (outpoint, value) in funds.spendable_outputs(&contract) {
                if selected >= needed {
                    break;
                }
                settlement.inputs.push(outpoint);
                selected += value;
            }
        }
        let dust = funds.available_dust(&contract);

        let decision = if selected < needed {
            // 3. Cover the shortfall from dust
            if selected + dust < needed {
                return Err(LedgerError::InsufficientFunds(format!(
                    "contract {} needs {} but holds {}",
                    contract,
                    needed,
                    selected + dust
                )));
            }
            let change = selected + dust - needed;
            let rest = coalescer.coalesce(change, 0, flush);
            DustDecision { drawn: dust, ..rest }
        } else {
            // 4. Coalesce
            coalescer.coalesce(selected - needed, dust, flush)
        };

        // 5. Change output
        if decision.emitted > 0 {
            settlement.outputs.push(TxOutput {
                value: decision.emitted,
                destination: Destination::Contract(contract),
            });
        }
        if decision.drawn != 0 || decision.deposited != 0 {
            settlement.dust.push(DustMovement {
                contract,
                drawn: decision.drawn,
                deposited: decision.deposited,
            });
        }
    }

    Ok(settlement)
}

/// VerifySettlement: 𝒮𝐸𝒯𝒯𝐿𝐸 × 𝒫𝐿𝒜𝒩 × ℱ𝒰𝒩𝒟𝒮 → {valid, invalid}
///
/// 1. Outputs begin with exactly the plan's transfers
/// 2. The remaining outputs are change to paying contracts, ascending, at most one each
/// 3. Every input is a spendable output of a paying contract
/// 4. Dust movements name paying contracts, ascending, and draw no more than held
/// 5. Per contract: inputs + drawn = sent + change + deposited
/// 6. Deposits are below the threshold, never alongside change, never on flush;
///    change below the threshold is only emitted on flush
pub fn verify_settlement<F: ContractFunds + ?Sized>(
    settlement: &Settlement,
    plan: &TransferPlan,
    funds: &F,
    coalescer: &PaymentCoalescer,
) -> Result<()> {
    let invalid = |reason: String| Err(LedgerError::MalformedTransaction(format!("settlement: {}", reason)));
    let needs = requirements(plan);

    // 1. Transfers
    let transfers = transfer_outputs(plan);
    if settlement.outputs.len() < transfers.len() || settlement.outputs[..transfers.len()] != transfers[..] {
        return invalid("outputs do not match the transfer plan".into());
    }

    // 2. Change outputs
    let mut change: BTreeMap<ContractId, Amount> = BTreeMap::new();
    let mut last: Option<ContractId> = None;
    for output in &settlement.outputs[transfers.len()..] {
        let contract = match output.destination {
            Destination::Contract(id) if needs.contains_key(&id) => id,
            _ => return invalid("change paid to a non-paying destination".into()),
        };
        if last.map_or(false, |prev| prev >= contract) || output.value <= 0 {
            return invalid("change outputs out of order".into());
        }
        last = Some(contract);
        change.insert(contract, output.value);
    }

    // 3. Inputs
    let mut inputs: BTreeMap<ContractId, Amount> = BTreeMap::new();
    let mut seen = BTreeSet::new();
    for outpoint in &settlement.inputs {
        if !seen.insert(*outpoint) {
            return invalid("input spent twice".into());
        }
        match funds.contract_output(outpoint) {
            Some((owner, value)) if needs.contains_key(&owner) => {
                *inputs.entry(owner).or_insert(0) += value;
            }
            Some(_) => return invalid("input owned by a non-paying contract".into()),
            None => {
                return Err(LedgerError::InputNotFound(format!(
                    "{}:{}",
                    hex::encode(outpoint.hash),
                    outpoint.index
                )))
            }
        }
    }

    // 4. Dust movements
    let mut dust: BTreeMap<ContractId, (Amount, Amount)> = BTreeMap::new();
    let mut last: Option<ContractId> = None;
    for movement in &settlement.dust {
        if !needs.contains_key(&movement.contract) || last.map_or(false, |prev| prev >= movement.contract) {
            return invalid("dust movement out of order".into());
        }
        last = Some(movement.contract);
        if movement.drawn < 0 || movement.deposited < 0 {
            return invalid("negative dust movement".into());
        }
        if movement.drawn > funds.available_dust(&movement.contract) {
            return Err(LedgerError::InsufficientFunds(format!(
                "contract {} draws {} dust it does not hold",
                movement.contract, movement.drawn
            )));
        }
        dust.insert(movement.contract, (movement.drawn, movement.deposited));
    }

    for (contract, (needed, flush)) in &needs {
        let input = inputs.get(contract).copied().unwrap_or(0);
        let emitted = change.get(contract).copied().unwrap_or(0);
        let (drawn, deposited) = dust.get(contract).copied().unwrap_or((0, 0));

        // 5. Conservation
        if input + drawn != needed + emitted + deposited {
            return invalid(format!("contract {} does not balance", contract));
        }

        // 6. Coalescing rule
        if deposited > 0 && (emitted > 0 || *flush || deposited >= coalescer.threshold) {
            return invalid(format!("contract {} deposits spendable change", contract));
        }
        if emitted > 0 && emitted < coalescer.threshold && !*flush {
            return invalid(format!("contract {} emits dust change", contract));
        }
    }

    Ok(())
}

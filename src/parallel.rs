//! Speculative parallel execution of a block's contract calls
//!
//! Every call in a block is first executed in parallel against the state the
//! block starts from, recording which contracts each execution looked at.
//! While connecting the block in order, a speculative result is kept only if
//! no earlier transaction in the block changed any contract it touched;
//! otherwise the call is executed again against the intermediate state. The
//! connected result is therefore the same as strictly sequential execution.

use crate::config::ChainConfig;
use crate::ledger::{run_call, CallEffects, LedgerState};
use crate::sandbox::StateView;
use crate::transaction::check_sender;
use crate::types::*;
use rayon::prelude::*;
use std::cell::RefCell;
use std::collections::BTreeSet;

/// A call executed ahead of its turn
#[derive(Debug, Clone)]
pub struct Speculation {
    pub effects: CallEffects,
    /// Every contract whose account, data or balance the execution read
    pub touched: BTreeSet<ContractId>,
}

/// Records the contracts an execution reads through a view
struct RecordingView<'a, S: StateView> {
    inner: &'a S,
    touched: RefCell<BTreeSet<ContractId>>,
}

impl<S: StateView> StateView for RecordingView<'_, S> {
    fn account(&self, id: &ContractId) -> Option<&ContractAccount> {
        self.touched.borrow_mut().insert(*id);
        self.inner.account(id)
    }

    fn data(&self, id: &ContractId) -> Option<&DataMap> {
        self.touched.borrow_mut().insert(*id);
        self.inner.data(id)
    }

    fn spendable_balance(&self, id: &ContractId) -> Amount {
        self.touched.borrow_mut().insert(*id);
        self.inner.spendable_balance(id)
    }
}

/// SpeculateCalls: 𝒮𝒯 × ℬ → [𝒮𝒫𝐸𝒞 ∪ {⊥}]
///
/// One slot per block transaction. Non-calls, and calls that fail against the
/// starting state, get ⊥ and are left to sequential connection, which reports
/// the authoritative error.
pub fn speculate_calls(
    ledger: &LedgerState,
    block: &Block,
    height: Height,
    config: &ChainConfig,
) -> Vec<Option<Speculation>> {
    let view = ledger.view_at(height);
    block
        .transactions
        .par_iter()
        .map(|tx| {
            let call = tx.contract_call()?;
            let caller = check_sender(tx, &call.sender).ok()?;
            let recording = RecordingView {
                inner: &view,
                touched: RefCell::new(BTreeSet::new()),
            };
            let effects = run_call(&recording, tx, call, caller, config).ok()?;
            Some(Speculation {
                effects,
                touched: recording.touched.into_inner(),
            })
        })
        .collect()
}

/// CheckCross: a speculative result stands iff nothing it touched is dirty
pub fn crosses(speculation: &Speculation, dirty: &BTreeSet<ContractId>) -> bool {
    !speculation.touched.is_disjoint(dirty)
}

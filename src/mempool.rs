//! Mempool admission and revalidation
//!
//! Admission validates a candidate against the confirmed ledger and the
//! current pool. Funds are only ever checked against confirmed outputs;
//! contract calls execute against the confirmed contract data overlaid with
//! the writes of earlier pool entries.

use crate::address::{contract_id_for, sha256d_hash};
use crate::coalescer::{build_settlement, verify_settlement, ContractFunds, PaymentCoalescer};
use crate::config::ChainConfig;
use crate::error::{LedgerError, Result};
use crate::ledger::{run_call, LedgerState, LedgerView};
use crate::sandbox::{StateDelta, StateView};
use crate::transaction::{calculate_tx_id, check_sender, check_transaction, check_tx_inputs, signature_hash};
use crate::types::*;
use crate::vm::validate_code;
use indexmap::IndexMap;
use log::debug;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Something a pool entry consumes; no two entries may share one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpendKey {
    Output(OutPoint),
    /// Drawing a contract's accumulated dust
    Dust(ContractId),
}

/// Simulated effects of an entry, visible to later pool entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryEffects {
    pub published: Option<(ContractId, ContractAccount)>,
    pub delta: StateDelta,
    pub return_values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolEntry {
    pub txid: Hash,
    /// Identity of the signed content, independent of unlocks and settlement
    pub body_id: Hash,
    /// Final form, settlement attached
    pub tx: Transaction,
    pub validation_height: Height,
    pub spends: BTreeSet<SpendKey>,
    pub fee: Amount,
    pub effects: EntryEffects,
}

/// Result of mempool acceptance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MempoolResult {
    Accepted(Box<MempoolEntry>),
    Rejected(LedgerError),
}

#[derive(Debug, Clone, Default)]
struct PoolOverlay {
    published: HashMap<ContractId, ContractAccount>,
    data: HashMap<ContractId, DataMap>,
}

/// Unconfirmed transactions in arrival order
#[derive(Debug, Clone, Default)]
pub struct Mempool {
    entries: IndexMap<Hash, MempoolEntry>,
    bodies: HashMap<Hash, Hash>,
    spent: HashMap<SpendKey, Hash>,
    overlay: PoolOverlay,
}

/// Confirmed state seen through the pool: contracts published and data written
/// by pool entries are visible, balances are not.
pub struct PoolView<'a> {
    base: LedgerView<'a>,
    pool: Option<&'a Mempool>,
}

impl<'a> PoolView<'a> {
    pub fn new(ledger: &'a LedgerState, pool: Option<&'a Mempool>) -> Self {
        PoolView { base: ledger.view(), pool }
    }

    fn claimed(&self, outpoint: &OutPoint) -> bool {
        self.pool
            .map_or(false, |pool| pool.spent.contains_key(&SpendKey::Output(*outpoint)))
    }
}

impl StateView for PoolView<'_> {
    fn account(&self, id: &ContractId) -> Option<&ContractAccount> {
        self.base
            .account(id)
            .or_else(|| self.pool.and_then(|pool| pool.overlay.published.get(id)))
    }

    fn data(&self, id: &ContractId) -> Option<&DataMap> {
        if let Some(pool) = self.pool {
            if let Some(data) = pool.overlay.data.get(id) {
                return Some(data);
            }
            if let Some(account) = pool.overlay.published.get(id) {
                return Some(&account.data);
            }
        }
        self.base.data(id)
    }

    fn spendable_balance(&self, id: &ContractId) -> Amount {
        self.base.spendable_balance(id)
    }
}

impl ContractFunds for PoolView<'_> {
    fn contract_output(&self, outpoint: &OutPoint) -> Option<(ContractId, Amount)> {
        self.base.contract_output(outpoint)
    }

    fn spendable_outputs(&self, id: &ContractId) -> Vec<(OutPoint, Amount)> {
        self.base
            .spendable_outputs(id)
            .into_iter()
            .filter(|(outpoint, _)| !self.claimed(outpoint))
            .collect()
    }

    /// Confirmed dust, claimed or not: a second draw is caught as a conflict
    fn available_dust(&self, id: &ContractId) -> Amount {
        self.base.available_dust(id)
    }
}

/// AcceptToMemoryPool: 𝒯𝒳 × 𝒮𝒯 × ℳ𝒫 → {accepted, rejected}
///
/// For transaction tx, confirmed state st and pool mp:
/// 1. Validate transaction structure
/// 2. Check the sender address
/// 3. Check the called contract exists
/// 4. Check inputs against confirmed outputs only
/// 5. Execute contract calls and settle their transfer plans
/// 6. Check for conflicts with existing pool entries and pool capacity
/// 7. Return acceptance result
///
/// Nothing is inserted: the caller decides whether to admit the entry, which
/// is what makes simulate-only mode side-effect free. Only fatal errors are
/// returned as `Err`.
pub fn accept_to_memory_pool(
    tx: &Transaction,
    ledger: &LedgerState,
    mempool: &Mempool,
    config: &ChainConfig,
) -> Result<MempoolResult> {
    let outcome = check_duplicate(tx, mempool)
        .and_then(|_| validate_transaction(tx, ledger, Some(mempool), config))
        .and_then(|entry| {
            mempool.check_admission(&entry, config)?;
            Ok(entry)
        });
    into_result(outcome)
}

/// Steps 1–4 for a plain transfer, which needs nothing from the pool and can
/// therefore run before the pool is locked.
pub fn prevalidate_transfer(tx: &Transaction, ledger: &LedgerState, config: &ChainConfig) -> Result<MempoolResult> {
    if !matches!(tx.payload, TxPayload::Transfer) {
        return Ok(MempoolResult::Rejected(LedgerError::MalformedTransaction(
            "not a plain transfer".into(),
        )));
    }
    into_result(validate_transaction(tx, ledger, None, config))
}

fn into_result(outcome: Result<MempoolEntry>) -> Result<MempoolResult> {
    match outcome {
        Ok(entry) => Ok(MempoolResult::Accepted(Box::new(entry))),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => Ok(MempoolResult::Rejected(err)),
    }
}

fn check_duplicate(tx: &Transaction, mempool: &Mempool) -> Result<()> {
    let txid = calculate_tx_id(tx);
    if mempool.entries.contains_key(&txid) || mempool.bodies.contains_key(&signature_hash(tx)) {
        return Err(LedgerError::AlreadyInMempool(hex::encode(txid)));
    }
    Ok(())
}

/// Steps 1–5. With no pool, contracts and data are the confirmed ones.
fn validate_transaction(
    tx: &Transaction,
    ledger: &LedgerState,
    pool: Option<&Mempool>,
    config: &ChainConfig,
) -> Result<MempoolEntry> {
    let view = PoolView::new(ledger, pool);
    let height = view.base.spend_height;

    // 1. Structure
    check_structure(tx)?;

    // 2. Sender
    let sender = check_parties(tx)?;

    // 3. Contract existence
    if let Some(call) = tx.contract_call() {
        let contract = crate::address::parse_contract(&call.contract)?;
        if view.account(&contract).is_none() {
            return Err(LedgerError::ContractNotFound(call.contract.clone()));
        }
    }

    // 4. Funds
    let fee = check_funds(tx, ledger, height)?;

    // 5. Execution
    let (final_tx, effects) = execute_payload(tx, &view, sender, config)?;

    let txid = calculate_tx_id(&final_tx);
    let spends = spend_keys(&final_tx);
    debug!(
        "validated {} at height {} (fee {}, {} spends)",
        hex::encode(txid),
        height,
        fee,
        spends.len()
    );
    Ok(MempoolEntry {
        txid,
        body_id: signature_hash(&final_tx),
        tx: final_tx,
        validation_height: height,
        spends,
        fee,
        effects,
    })
}

fn check_structure(tx: &Transaction) -> Result<()> {
    if tx.is_coinbase() {
        return Err(LedgerError::MalformedTransaction("Coinbase outside a block".into()));
    }
    check_transaction(tx)
}

fn check_parties(tx: &Transaction) -> Result<Option<PubKeyHash>> {
    match &tx.payload {
        TxPayload::Publish(publish) => check_sender(tx, &publish.sender).map(Some),
        TxPayload::Call(call) => check_sender(tx, &call.sender).map(Some),
        _ => Ok(None),
    }
}

fn check_funds(tx: &Transaction, ledger: &LedgerState, height: Height) -> Result<Amount> {
    check_tx_inputs(tx, ledger.utxos(), height)
}

/// Run the payload: validate published code, or execute a call and attach
/// (or verify) its settlement.
fn execute_payload(
    tx: &Transaction,
    view: &PoolView<'_>,
    sender: Option<PubKeyHash>,
    config: &ChainConfig,
) -> Result<(Transaction, EntryEffects)> {
    match (&tx.payload, sender) {
        (TxPayload::Publish(publish), Some(owner)) => {
            validate_code(&publish.code, config.max_contract_code_len)?;
            let txid = calculate_tx_id(tx);
            let account = ContractAccount {
                code: Arc::new(publish.code.clone()),
                owner,
                publish_txid: txid,
                data: DataMap::new(),
                dust: 0,
            };
            let effects = EntryEffects {
                published: Some((contract_id_for(&txid), account)),
                ..EntryEffects::default()
            };
            Ok((tx.clone(), effects))
        }
        (TxPayload::Call(call), Some(caller)) => {
            let call_effects = run_call(view, tx, call, caller, config)?;
            let plan = &call_effects.outcome.transfers;
            let coalescer = PaymentCoalescer::new(config.dust_threshold);

            let mut final_tx = tx.clone();
            if call.settlement.is_empty() && !plan.is_empty() {
                let settlement = build_settlement(plan, view, &coalescer)?;
                if let TxPayload::Call(final_call) = &mut final_tx.payload {
                    final_call.settlement = settlement;
                }
            } else {
                verify_settlement(&call.settlement, plan, view, &coalescer)?;
            }

            let effects = EntryEffects {
                published: None,
                delta: call_effects.outcome.delta,
                return_values: call_effects.outcome.return_values,
            };
            Ok((final_tx, effects))
        }
        _ => Ok((tx.clone(), EntryEffects::default())),
    }
}

fn spend_keys(tx: &Transaction) -> BTreeSet<SpendKey> {
    let mut keys: BTreeSet<SpendKey> = tx.spent_outpoints().into_iter().map(SpendKey::Output).collect();
    if let Some(settlement) = tx.settlement() {
        for movement in &settlement.dust {
            if movement.drawn > 0 {
                keys.insert(SpendKey::Dust(movement.contract));
            }
        }
    }
    keys
}

/// Outcome of rebuilding the pool after the best chain changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Revalidation {
    pub kept: Vec<Hash>,
    pub dropped: Vec<(Hash, LedgerError)>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Transaction ids in arrival order
    pub fn txids(&self) -> Vec<Hash> {
        self.entries.keys().copied().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    /// Pool entry currently holding a spend key
    pub fn spender_of(&self, key: &SpendKey) -> Option<Hash> {
        self.spent.get(key).copied()
    }

    /// Step 6: duplicates, conflicts (first seen wins), capacity
    pub fn check_admission(&self, entry: &MempoolEntry, config: &ChainConfig) -> Result<()> {
        if self.entries.contains_key(&entry.txid) || self.bodies.contains_key(&entry.body_id) {
            return Err(LedgerError::AlreadyInMempool(hex::encode(entry.txid)));
        }
        for key in &entry.spends {
            if let Some(holder) = self.spent.get(key) {
                return Err(LedgerError::DoubleSpendConflict(format!(
                    "{:?} already spent by {}",
                    key,
                    hex::encode(holder)
                )));
            }
        }
        if self.entries.len() >= config.max_mempool_transactions {
            return Err(LedgerError::MempoolFull);
        }
        Ok(())
    }

    /// Step 6 and insertion, performed together
    pub fn admit(&mut self, entry: MempoolEntry, config: &ChainConfig) -> Result<Hash> {
        self.check_admission(&entry, config)?;
        let txid = entry.txid;
        for key in &entry.spends {
            self.spent.insert(*key, txid);
        }
        self.bodies.insert(entry.body_id, txid);
        if let Some((id, account)) = &entry.effects.published {
            self.overlay.published.insert(*id, account.clone());
        }
        for (id, map) in &entry.effects.delta.dumps {
            match self.overlay.published.get_mut(id) {
                Some(account) => account.data = map.clone(),
                None => {
                    self.overlay.data.insert(*id, map.clone());
                }
            }
        }
        debug!("admitted {} ({} in pool)", hex::encode(txid), self.entries.len() + 1);
        self.entries.insert(txid, entry);
        Ok(txid)
    }

    /// Rebuild the pool against a new ledger.
    ///
    /// 1. Candidates are `requeue` (in order) followed by current entries in arrival order
    /// 2. Each is validated afresh against the ledger and the rebuilt pool
    /// 3. Failures are dropped silently; entries confirmed by the new chain
    ///    fail on their spent inputs and vanish with them
    pub fn revalidate(&mut self, ledger: &LedgerState, config: &ChainConfig, requeue: Vec<Transaction>) -> Result<Revalidation> {
        // 1. Candidates
        let previous = std::mem::take(self);
        let candidates = requeue
            .into_iter()
            .chain(previous.entries.into_values().map(|entry| entry.tx));

        // 2. Re-admit
        let mut summary = Revalidation::default();
        for tx in candidates {
            match accept_to_memory_pool(&tx, ledger, self, config)? {
                MempoolResult::Accepted(entry) => {
                    summary.kept.push(self.admit(*entry, config)?);
                }
                // 3. Drop
                MempoolResult::Rejected(reason) => {
                    let txid = calculate_tx_id(&tx);
                    debug!("dropped {} on revalidation: {}", hex::encode(txid), reason);
                    summary.dropped.push((txid, reason));
                }
            }
        }
        Ok(summary)
    }

    /// Deterministic digest over the pool's contents in arrival order
    pub fn digest(&self) -> Hash {
        let txs: Vec<(&Hash, &Transaction)> = self.entries.iter().map(|(id, entry)| (id, &entry.tx)).collect();
        sha256d_hash(&serde_json::to_vec(&txs).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Block;
    use crate::transaction::{address_of, sign_all_inputs};
    use crate::vm::{ContractCode, Op};
    use secp256k1::SecretKey;

    fn key(seed: u8) -> SecretKey {
        SecretKey::from_slice(&[seed; 32]).unwrap()
    }

    fn config() -> ChainConfig {
        ChainConfig { coinbase_maturity: 0, ..ChainConfig::default() }
    }

    /// Ledger with one confirmed block paying `outputs` coinbase values to key(1)
    fn funded_ledger(outputs: usize) -> (LedgerState, Hash) {
        let mut ledger = LedgerState::new();
        let coinbase = Transaction {
            version: 1,
            inputs: vec![],
            outputs: (0..outputs)
                .map(|_| TxOutput {
                    value: crate::constants::COIN,
                    destination: Destination::Address(address_of(&key(1))),
                })
                .collect(),
            payload: TxPayload::Coinbase { height: 0 },
        };
        let coinbase_id = calculate_tx_id(&coinbase);
        let block = Block::new([0; 32], 0, 0x207fffff, vec![coinbase]);
        ledger.apply_block(None, &block, &config()).unwrap();
        (ledger, coinbase_id)
    }

    fn transfer(from: Hash, index: u32, value: Amount) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint { hash: from, index },
                unlock: Unlock::Signature { pubkey: vec![], signature: vec![] },
            }],
            outputs: vec![TxOutput { value, destination: Destination::Address(PubKeyHash([2; 20])) }],
            payload: TxPayload::Transfer,
        };
        sign_all_inputs(&mut tx, &key(1)).unwrap();
        tx
    }

    fn submit(tx: &Transaction, ledger: &LedgerState, pool: &mut Mempool) -> std::result::Result<Hash, LedgerError> {
        match accept_to_memory_pool(tx, ledger, pool, &config()).unwrap() {
            MempoolResult::Accepted(entry) => pool.admit(*entry, &config()),
            MempoolResult::Rejected(reason) => Err(reason),
        }
    }

    #[test]
    fn test_accept_valid_transfer() {
        let (ledger, cb) = funded_ledger(1);
        let mut pool = Mempool::new();
        let txid = submit(&transfer(cb, 0, 1000), &ledger, &mut pool).unwrap();
        assert!(pool.contains(&txid));
        assert_eq!(pool.txids(), vec![txid]);
    }

    #[test]
    fn test_second_spender_is_double_spend() {
        let (ledger, cb) = funded_ledger(1);
        let mut pool = Mempool::new();
        let first = submit(&transfer(cb, 0, 1000), &ledger, &mut pool).unwrap();
        let err = submit(&transfer(cb, 0, 2000), &ledger, &mut pool).unwrap_err();
        assert!(matches!(err, LedgerError::DoubleSpendConflict(_)));
        assert_eq!(pool.len(), 1);
        let claimed = SpendKey::Output(OutPoint { hash: cb, index: 0 });
        assert_eq!(pool.spender_of(&claimed), Some(first));
    }

    #[test]
    fn test_duplicate_is_already_in_mempool() {
        let (ledger, cb) = funded_ledger(1);
        let mut pool = Mempool::new();
        let tx = transfer(cb, 0, 1000);
        submit(&tx, &ledger, &mut pool).unwrap();
        assert!(matches!(
            submit(&tx, &ledger, &mut pool).unwrap_err(),
            LedgerError::AlreadyInMempool(_)
        ));
    }

    #[test]
    fn test_insufficient_funds_leaves_pool_untouched() {
        let (ledger, cb) = funded_ledger(1);
        let mut pool = Mempool::new();
        let before = (pool.digest(), ledger.digest());
        let err = submit(&transfer(cb, 0, 2 * crate::constants::COIN), &ledger, &mut pool).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds(_)));
        assert_eq!((pool.digest(), ledger.digest()), before);
    }

    #[test]
    fn test_pool_capacity() {
        let (ledger, cb) = funded_ledger(2);
        let mut pool = Mempool::new();
        let small = ChainConfig { max_mempool_transactions: 1, ..config() };
        let first = transfer(cb, 0, 10);
        let second = transfer(cb, 1, 10);

        match accept_to_memory_pool(&first, &ledger, &pool, &small).unwrap() {
            MempoolResult::Accepted(entry) => {
                pool.admit(*entry, &small).unwrap();
            }
            MempoolResult::Rejected(reason) => panic!("rejected: {}", reason),
        }
        assert_eq!(
            accept_to_memory_pool(&second, &ledger, &pool, &small).unwrap(),
            MempoolResult::Rejected(LedgerError::MempoolFull)
        );
    }

    #[test]
    fn test_prevalidated_transfer_still_conflict_checked() {
        let (ledger, cb) = funded_ledger(1);
        let mut pool = Mempool::new();
        submit(&transfer(cb, 0, 1000), &ledger, &mut pool).unwrap();

        let entry = match prevalidate_transfer(&transfer(cb, 0, 5), &ledger, &config()).unwrap() {
            MempoolResult::Accepted(entry) => entry,
            MempoolResult::Rejected(reason) => panic!("rejected: {}", reason),
        };
        assert!(matches!(pool.admit(*entry, &config()), Err(LedgerError::DoubleSpendConflict(_))));
    }

    fn call_tx(from: Hash, index: u32, contract: ContractId, function: &str) -> Transaction {
        let mut tx = transfer(from, index, 1000);
        tx.payload = TxPayload::Call(ContractCall {
            contract: contract.to_string(),
            function: function.into(),
            args: vec![],
            amount: 0,
            sender: address_of(&key(1)).to_string(),
            settlement: Settlement::default(),
        });
        sign_all_inputs(&mut tx, &key(1)).unwrap();
        tx
    }

    #[test]
    fn test_pool_writes_visible_to_later_calls() {
        let (ledger, cb) = funded_ledger(3);
        let mut pool = Mempool::new();

        let code = ContractCode::new()
            .public("set", vec![Op::Push("x".into()), Op::Push(Value::Int(5)), Op::Store])
            .public("get", vec![Op::Push("x".into()), Op::Load, Op::Return(1)]);
        let mut publish = transfer(cb, 0, 1000);
        publish.payload = TxPayload::Publish(ContractPublish { code, sender: address_of(&key(1)).to_string() });
        sign_all_inputs(&mut publish, &key(1)).unwrap();
        let publish_id = submit(&publish, &ledger, &mut pool).unwrap();
        let contract = contract_id_for(&publish_id);

        submit(&call_tx(cb, 1, contract, "set"), &ledger, &mut pool).unwrap();
        let get_id = submit(&call_tx(cb, 2, contract, "get"), &ledger, &mut pool).unwrap();
        let returned = &pool.get(&get_id).unwrap().effects.return_values;
        assert_eq!(returned.first().and_then(Value::as_int), Some(5));

        // Confirmed state knows nothing of the contract
        assert!(ledger.contract(&contract).is_none());
    }

    #[test]
    fn test_unknown_contract_rejected() {
        let (ledger, cb) = funded_ledger(1);
        let mut pool = Mempool::new();
        let err = submit(&call_tx(cb, 0, ContractId([9; 20]), "get"), &ledger, &mut pool).unwrap_err();
        assert!(matches!(err, LedgerError::ContractNotFound(_)));
    }

    #[test]
    fn test_revalidate_drops_confirmed_and_keeps_rest() {
        let (mut ledger, cb) = funded_ledger(2);
        let mut pool = Mempool::new();
        let a = transfer(cb, 0, 10);
        let b = transfer(cb, 1, 10);
        submit(&a, &ledger, &mut pool).unwrap();
        let b_id = submit(&b, &ledger, &mut pool).unwrap();

        let tip = ledger.tip().unwrap();
        let coinbase = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![],
            payload: TxPayload::Coinbase { height: 1 },
        };
        let block = Block::new(tip.hash, 1, 0x207fffff, vec![coinbase, a]);
        ledger.apply_block(Some(&tip), &block, &config()).unwrap();

        let summary = pool.revalidate(&ledger, &config(), vec![]).unwrap();
        assert_eq!(summary.kept, vec![b_id]);
        assert_eq!(summary.dropped.len(), 1);
        assert_eq!(pool.txids(), vec![b_id]);
    }
}

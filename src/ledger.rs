//! Ledger state: UTXO set and contract accounts, advanced and rewound block by block

use crate::address::{contract_id_for, parse_contract, sha256d_hash};
use crate::coalescer::{verify_settlement, ContractFunds, PaymentCoalescer};
use crate::config::ChainConfig;
use crate::economic::check_coinbase_value;
use crate::parallel::{crosses, speculate_calls};
use crate::error::{LedgerError, Result};
use crate::sandbox::{execute, ExecutionOutcome, Invocation, StateView};
use crate::transaction::{calculate_tx_id, check_call_payment, check_sender, check_transaction, check_tx_inputs};
use crate::types::*;
use crate::vm::validate_code;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Versioned handle on the state a ledger operation is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TipHandle {
    pub hash: Hash,
    pub height: Height,
}

/// Unspent outputs with a per-destination index
#[derive(Debug, Clone, Default)]
pub struct UtxoStore {
    entries: HashMap<OutPoint, Utxo>,
    by_destination: HashMap<Destination, BTreeSet<OutPoint>>,
}

impl UtxoStore {
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.entries.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns false if the outpoint was already present
    pub fn insert(&mut self, outpoint: OutPoint, utxo: Utxo) -> bool {
        if self.entries.contains_key(&outpoint) {
            return false;
        }
        self.by_destination
            .entry(utxo.destination)
            .or_default()
            .insert(outpoint);
        self.entries.insert(outpoint, utxo);
        true
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        let utxo = self.entries.remove(outpoint)?;
        if let Some(set) = self.by_destination.get_mut(&utxo.destination) {
            set.remove(outpoint);
            if set.is_empty() {
                self.by_destination.remove(&utxo.destination);
            }
        }
        Some(utxo)
    }

    /// Outputs paying a destination, in outpoint order
    pub fn outputs_of<'a>(&'a self, destination: &Destination) -> impl Iterator<Item = (OutPoint, &'a Utxo)> + 'a {
        self.by_destination
            .get(destination)
            .into_iter()
            .flat_map(|set| set.iter())
            .filter_map(move |outpoint| self.entries.get(outpoint).map(|utxo| (*outpoint, utxo)))
    }

    fn sorted(&self) -> Vec<(&OutPoint, &Utxo)> {
        let mut all: Vec<(&OutPoint, &Utxo)> = self.entries.iter().collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all
    }
}

/// Everything needed to reverse one applied block exactly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockUndo {
    pub block_hash: Hash,
    pub prev_tip: Option<TipHandle>,
    /// Outputs consumed, in spend order
    pub spent: Vec<(OutPoint, Utxo)>,
    /// Outputs created, in creation order
    pub created: Vec<OutPoint>,
    /// Contract accounts before each modification, in modification order
    pub contracts: Vec<(ContractId, Option<ContractAccount>)>,
}

impl BlockUndo {
    fn new(block_hash: Hash, prev_tip: Option<TipHandle>) -> Self {
        BlockUndo {
            block_hash,
            prev_tip,
            spent: Vec::new(),
            created: Vec::new(),
            contracts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    tip: Option<TipHandle>,
    utxos: UtxoStore,
    contracts: HashMap<ContractId, ContractAccount>,
}

/// Read-only view of a ledger for spends at a given height
#[derive(Clone, Copy)]
pub struct LedgerView<'a> {
    pub ledger: &'a LedgerState,
    pub spend_height: Height,
}

impl StateView for LedgerView<'_> {
    fn account(&self, id: &ContractId) -> Option<&ContractAccount> {
        self.ledger.contracts.get(id)
    }

    fn spendable_balance(&self, id: &ContractId) -> Amount {
        let outputs: Amount = self
            .ledger
            .utxos
            .outputs_of(&Destination::Contract(*id))
            .filter(|(_, utxo)| utxo.is_mature_at(self.spend_height))
            .map(|(_, utxo)| utxo.value)
            .sum();
        outputs + self.ledger.contracts.get(id).map_or(0, |account| account.dust)
    }
}

impl ContractFunds for LedgerView<'_> {
    fn contract_output(&self, outpoint: &OutPoint) -> Option<(ContractId, Amount)> {
        let utxo = self.ledger.utxos.get(outpoint)?;
        match utxo.destination {
            Destination::Contract(id) if utxo.is_mature_at(self.spend_height) => Some((id, utxo.value)),
            _ => None,
        }
    }

    fn spendable_outputs(&self, id: &ContractId) -> Vec<(OutPoint, Amount)> {
        self.ledger
            .utxos
            .outputs_of(&Destination::Contract(*id))
            .filter(|(_, utxo)| utxo.is_mature_at(self.spend_height))
            .map(|(outpoint, utxo)| (outpoint, utxo.value))
            .collect()
    }

    fn available_dust(&self, id: &ContractId) -> Amount {
        self.ledger.contracts.get(id).map_or(0, |account| account.dust)
    }
}

/// Outcome of validating a contract call against some view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEffects {
    pub contract: ContractId,
    pub outcome: ExecutionOutcome,
}

/// Validate a call up to and including execution against a view
///
/// 1. The contract must exist in the view
/// 2. Attached value must be paid to the contract by the caller's outputs
/// 3. Execute the entry function with the call's arguments
pub fn run_call<S: StateView + ?Sized>(
    view: &S,
    tx: &Transaction,
    call: &ContractCall,
    caller: PubKeyHash,
    config: &ChainConfig,
) -> Result<CallEffects> {
    // 1. Contract
    let contract = parse_contract(&call.contract)?;
    if view.account(&contract).is_none() {
        return Err(LedgerError::ContractNotFound(call.contract.clone()));
    }

    // 2. Payment
    check_call_payment(tx, contract, call.amount)?;

    // 3. Execute
    let invocation = Invocation {
        contract,
        function: &call.function,
        args: &call.args,
        payment: call.amount,
        caller: Some(caller),
    };
    let outcome = execute(view, &invocation, config)?;
    Ok(CallEffects { contract, outcome })
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<TipHandle> {
        self.tip
    }

    /// Height the next block would have
    pub fn next_height(&self) -> Height {
        self.tip.map_or(0, |tip| tip.height + 1)
    }

    pub fn utxos(&self) -> &UtxoStore {
        &self.utxos
    }

    pub fn contract(&self, id: &ContractId) -> Option<&ContractAccount> {
        self.contracts.get(id)
    }

    /// View for validating spends in the next block
    pub fn view(&self) -> LedgerView<'_> {
        self.view_at(self.next_height())
    }

    pub fn view_at(&self, spend_height: Height) -> LedgerView<'_> {
        LedgerView { ledger: self, spend_height }
    }

    fn check_handle(&self, tip: &TipHandle) -> Result<()> {
        if self.tip.as_ref() != Some(tip) {
            return Err(LedgerError::StaleTip(hex::encode(tip.hash)));
        }
        Ok(())
    }

    /// Confirmed balance of an address or contract: every confirmed output it
    /// owns, plus a contract's accumulated dust. Pool effects are never included.
    pub fn balance_of(&self, destination: &Destination, tip: &TipHandle) -> Result<Amount> {
        self.check_handle(tip)?;
        let outputs: Amount = self.utxos.outputs_of(destination).map(|(_, utxo)| utxo.value).sum();
        let dust = match destination {
            Destination::Contract(id) => self.contracts.get(id).map_or(0, |account| account.dust),
            Destination::Address(_) => 0,
        };
        Ok(outputs + dust)
    }

    /// Stored value of a contract key; Ok(None) when the key is not set
    pub fn contract_data_get(&self, contract: &ContractId, key: &str, tip: &TipHandle) -> Result<Option<Value>> {
        self.check_handle(tip)?;
        let account = self
            .contracts
            .get(contract)
            .ok_or_else(|| LedgerError::ContractNotFound(contract.to_string()))?;
        Ok(account.data.get(key).cloned())
    }

    /// Deterministic digest over the tip, every output and every account
    pub fn digest(&self) -> Hash {
        let mut contracts: Vec<(&ContractId, &ContractAccount)> = self.contracts.iter().collect();
        contracts.sort_by(|a, b| a.0.cmp(b.0));
        let encoded = serde_json::to_vec(&(&self.tip, self.utxos.sorted(), contracts)).unwrap_or_default();
        sha256d_hash(&encoded)
    }

    /// ApplyBlock: ℬ × 𝒮𝒯 → 𝒮𝒯 × 𝒰𝒩𝒟𝒪
    ///
    /// For block b on top of tip t:
    /// 1. The handle must name the current tip and b must link to it
    /// 2. b must start with its height's coinbase and carry a matching merkle root
    /// 3. Apply every other transaction in order, re-executing contract calls
    /// 4. The coinbase may claim no more than subsidy + fees
    /// 5. On any failure, restore the pre-block state and report the block invalid
    pub fn apply_block(
        &mut self,
        tip: Option<&TipHandle>,
        block: &Block,
        config: &ChainConfig,
    ) -> Result<BlockUndo> {
        // 1. Handle and linkage
        if self.tip.as_ref() != tip {
            return Err(LedgerError::StaleTip(
                tip.map(|t| hex::encode(t.hash)).unwrap_or_else(|| "genesis".into()),
            ));
        }
        let expected_parent = tip.map_or([0u8; 32], |t| t.hash);
        if block.header.prev_block_hash != expected_parent {
            return Err(LedgerError::InvalidBlock("Block does not extend the given tip".into()));
        }
        let height = self.next_height();
        let block_hash = calculate_block_hash(&block.header);

        // 2. Structure
        check_block_structure(block, height)?;

        let mut undo = BlockUndo::new(block_hash, self.tip);
        match self.connect_transactions(block, height, config, &mut undo) {
            Ok(()) => {
                self.tip = Some(TipHandle { hash: block_hash, height });
                debug!(
                    "applied block {} at height {} ({} transactions)",
                    hex::encode(block_hash),
                    height,
                    block.transactions.len()
                );
                Ok(undo)
            }
            Err(err) => {
                // 5. Restore
                self.revert(&undo)?;
                Err(match err {
                    LedgerError::InvalidBlock(reason) => LedgerError::InvalidBlock(reason),
                    other => LedgerError::InvalidBlock(other.to_string()),
                })
            }
        }
    }

    fn connect_transactions(
        &mut self,
        block: &Block,
        height: Height,
        config: &ChainConfig,
        undo: &mut BlockUndo,
    ) -> Result<()> {
        // 3. Transactions after the coinbase, reusing speculative call results
        //    that no earlier transaction invalidated
        let mut speculated = speculate_calls(self, block, height, config);
        let mut dirty = BTreeSet::new();
        let mut total_fees: Amount = 0;
        for (tx, speculation) in block.transactions.iter().zip(speculated.iter_mut()).skip(1) {
            let ready = speculation
                .take()
                .filter(|speculation| !crosses(speculation, &dirty))
                .map(|speculation| speculation.effects);
            let fee = self.connect_transaction(tx, height, config, ready, &mut dirty, undo)?;
            total_fees = total_fees
                .checked_add(fee)
                .ok_or_else(|| LedgerError::InvalidBlock("Fee total overflow".into()))?;
        }

        // 4. Coinbase
        let coinbase = &block.transactions[0];
        check_transaction(coinbase)?;
        check_coinbase_value(coinbase, height, total_fees)?;
        self.create_outputs(coinbase, height, config, undo)
    }

    /// Apply one transaction, returning its fee
    ///
    /// `ready` holds the call's effects when they were already computed against
    /// an equivalent state. Every contract the transaction changes is added to
    /// `dirty`.
    fn connect_transaction(
        &mut self,
        tx: &Transaction,
        height: Height,
        config: &ChainConfig,
        ready: Option<CallEffects>,
        dirty: &mut BTreeSet<ContractId>,
        undo: &mut BlockUndo,
    ) -> Result<Amount> {
        check_transaction(tx)?;
        let txid = calculate_tx_id(tx);

        let mut effects = None;
        let mut published = None;
        match &tx.payload {
            TxPayload::Coinbase { .. } => {
                return Err(LedgerError::InvalidBlock("Coinbase after the first transaction".into()))
            }
            TxPayload::Transfer => {}
            TxPayload::Publish(publish) => {
                let owner = check_sender(tx, &publish.sender)?;
                validate_code(&publish.code, config.max_contract_code_len)?;
                published = Some(ContractAccount {
                    code: Arc::new(publish.code.clone()),
                    owner,
                    publish_txid: txid,
                    data: DataMap::new(),
                    dust: 0,
                });
            }
            TxPayload::Call(call) => {
                let caller = check_sender(tx, &call.sender)?;
                let view = self.view_at(height);
                let call_effects = match ready {
                    Some(effects) => effects,
                    None => run_call(&view, tx, call, caller, config)?,
                };
                verify_settlement(
                    &call.settlement,
                    &call_effects.outcome.transfers,
                    &view,
                    &PaymentCoalescer::new(config.dust_threshold),
                )?;
                effects = Some(call_effects);
            }
        }
        let fee = check_tx_inputs(tx, &self.utxos, height)?;

        // Spend
        for outpoint in tx.spent_outpoints() {
            let utxo = self.utxos.remove(&outpoint).ok_or_else(|| {
                LedgerError::InputNotFound(format!("{}:{}", hex::encode(outpoint.hash), outpoint.index))
            })?;
            dirty.extend(utxo.destination.contract());
            undo.spent.push((outpoint, utxo));
        }

        // Contract effects
        if let Some(account) = published {
            let id = contract_id_for(&txid);
            dirty.insert(id);
            undo.contracts.push((id, self.contracts.get(&id).cloned()));
            self.contracts.insert(id, account);
        }
        if let (Some(effects), Some(call)) = (effects, tx.contract_call()) {
            dirty.insert(effects.contract);
            for (id, data) in effects.outcome.delta.dumps {
                dirty.insert(id);
                self.touch_contract(id, undo)?.data = data;
            }
            for movement in &call.settlement.dust {
                dirty.insert(movement.contract);
                let account = self.touch_contract(movement.contract, undo)?;
                account.dust = account.dust - movement.drawn + movement.deposited;
            }
        }

        dirty.extend(tx.all_outputs().filter_map(|output| output.destination.contract()));
        self.create_outputs(tx, height, config, undo)?;
        Ok(fee)
    }

    fn touch_contract(&mut self, id: ContractId, undo: &mut BlockUndo) -> Result<&mut ContractAccount> {
        let previous = self
            .contracts
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::ContractNotFound(id.to_string()))?;
        undo.contracts.push((id, Some(previous)));
        self.contracts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::ContractNotFound(id.to_string()))
    }

    fn create_outputs(
        &mut self,
        tx: &Transaction,
        height: Height,
        config: &ChainConfig,
        undo: &mut BlockUndo,
    ) -> Result<()> {
        let txid = calculate_tx_id(tx);
        let own_outputs = tx.outputs.len();
        for (i, output) in tx.all_outputs().enumerate() {
            let maturity = if tx.is_coinbase() {
                config.coinbase_maturity
            } else if i >= own_outputs {
                config.contract_output_maturity
            } else {
                0
            };
            let outpoint = OutPoint { hash: txid, index: i as u32 };
            let utxo = Utxo {
                value: output.value,
                destination: output.destination,
                height,
                mature_height: height + maturity,
            };
            if !self.utxos.insert(outpoint, utxo) {
                return Err(LedgerError::InvalidBlock(format!(
                    "Output {}:{} already exists",
                    hex::encode(txid),
                    i
                )));
            }
            undo.created.push(outpoint);
        }
        Ok(())
    }

    /// RewindBlock: 𝒮𝒯 × ℬ × 𝒰𝒩𝒟𝒪 → 𝒮𝒯
    ///
    /// 1. The handle must name the current tip, which must be this block
    /// 2. Remove created outputs, restore spent outputs, restore accounts
    /// 3. The previous tip becomes current
    ///
    /// Any mismatch between the undo record and the state is corruption.
    pub fn rewind_block(&mut self, tip: &TipHandle, block: &Block, undo: &BlockUndo) -> Result<()> {
        // 1. Handle
        self.check_handle(tip)?;
        let block_hash = calculate_block_hash(&block.header);
        if block_hash != tip.hash || undo.block_hash != block_hash {
            return Err(LedgerError::StateCorruption(format!(
                "undo record for {} does not match tip {}",
                hex::encode(undo.block_hash),
                hex::encode(tip.hash)
            )));
        }

        // 2. Reverse effects
        self.revert(undo)?;

        // 3. Tip
        self.tip = undo.prev_tip;
        debug!("rewound block {} at height {}", hex::encode(block_hash), tip.height);
        Ok(())
    }

    fn revert(&mut self, undo: &BlockUndo) -> Result<()> {
        for (id, previous) in undo.contracts.iter().rev() {
            match previous {
                Some(account) => {
                    self.contracts.insert(*id, account.clone());
                }
                None => {
                    if self.contracts.remove(id).is_none() {
                        return Err(LedgerError::StateCorruption(format!("contract {} missing on rewind", id)));
                    }
                }
            }
        }
        // Spent outputs first: an output created and spent in the same block
        // must be back in place before the created pass removes it.
        for (outpoint, utxo) in undo.spent.iter().rev() {
            if !self.utxos.insert(*outpoint, utxo.clone()) {
                return Err(LedgerError::StateCorruption(format!(
                    "spent output {}:{} present on rewind",
                    hex::encode(outpoint.hash),
                    outpoint.index
                )));
            }
        }
        for outpoint in undo.created.iter().rev() {
            if self.utxos.remove(outpoint).is_none() {
                return Err(LedgerError::StateCorruption(format!(
                    "created output {}:{} missing on rewind",
                    hex::encode(outpoint.hash),
                    outpoint.index
                )));
            }
        }
        Ok(())
    }
}

/// Block structure checks
///
/// 1. At least one transaction
/// 2. The first transaction is the coinbase for this height, and the only one
/// 3. The merkle root commits to the transaction ids
pub(crate) fn check_block_structure(block: &Block, height: Height) -> Result<()> {
    // 1. Non-empty
    let coinbase = block
        .transactions
        .first()
        .ok_or_else(|| LedgerError::InvalidBlock("Block must have at least one transaction".into()))?;

    // 2. Coinbase
    match coinbase.payload {
        TxPayload::Coinbase { height: h } if h == height => {}
        _ => {
            return Err(LedgerError::InvalidBlock(format!(
                "First transaction must be the coinbase for height {}",
                height
            )))
        }
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(LedgerError::InvalidBlock("More than one coinbase".into()));
    }

    // 3. Merkle root
    if calculate_merkle_root(&block.transactions) != block.header.merkle_root {
        return Err(LedgerError::InvalidBlock("Merkle root mismatch".into()));
    }
    Ok(())
}

/// Merkle root over transaction ids, duplicating the last hash on odd levels
pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash {
    let mut hashes: Vec<Hash> = transactions.iter().map(calculate_tx_id).collect();
    if hashes.is_empty() {
        return [0u8; 32];
    }

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity((hashes.len() + 1) / 2);
        for chunk in hashes.chunks(2) {
            let right = chunk.get(1).unwrap_or(&chunk[0]);
            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(&chunk[0]);
            combined.extend_from_slice(right);
            next_level.push(sha256d_hash(&combined));
        }
        hashes = next_level;
    }

    hashes[0]
}

/// Block hash: double SHA-256 of the little-endian header fields
pub fn calculate_block_hash(header: &BlockHeader) -> Hash {
    let mut data = Vec::with_capacity(92);
    data.extend_from_slice(&header.version.to_le_bytes());
    data.extend_from_slice(&header.prev_block_hash);
    data.extend_from_slice(&header.merkle_root);
    data.extend_from_slice(&header.timestamp.to_le_bytes());
    data.extend_from_slice(&header.bits.to_le_bytes());
    data.extend_from_slice(&header.nonce.to_le_bytes());
    sha256d_hash(&data)
}

impl Block {
    /// Assemble a block with its merkle root filled in
    pub fn new(prev_block_hash: Hash, timestamp: u64, bits: u32, transactions: Vec<Transaction>) -> Self {
        let merkle_root = calculate_merkle_root(&transactions);
        Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash,
                merkle_root,
                timestamp,
                bits,
                nonce: 0,
            },
            transactions,
        }
    }

    pub fn hash(&self) -> Hash {
        calculate_block_hash(&self.header)
    }
}

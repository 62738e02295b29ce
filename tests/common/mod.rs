//! Shared fixtures: keys, a funded genesis, transaction and block builders

#![allow(dead_code)]

use contract_ledger::transaction::{address_of, calculate_tx_id, sign_all_inputs};
use contract_ledger::vm::ContractCode;
use contract_ledger::*;
use secp256k1::SecretKey;

pub const BITS: u32 = 0x207fffff;
pub const FEE: Amount = 10_000;
pub const GENESIS_OUTPUTS: u32 = 20;
pub const GENESIS_VALUE: Amount = 2 * COIN;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn key(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed; 32]).unwrap()
}

pub fn user(seed: u8) -> PubKeyHash {
    address_of(&key(seed))
}

pub fn config() -> ChainConfig {
    ChainConfig { coinbase_maturity: 0, ..ChainConfig::default() }
}

fn genesis_coinbase() -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![],
        outputs: (0..GENESIS_OUTPUTS)
            .map(|_| TxOutput { value: GENESIS_VALUE, destination: Destination::Address(user(1)) })
            .collect(),
        payload: TxPayload::Coinbase { height: 0 },
    }
}

/// Genesis paying `GENESIS_OUTPUTS` outputs of `GENESIS_VALUE` to user(1)
pub fn genesis() -> Block {
    Block::new([0; 32], 0, BITS, vec![genesis_coinbase()])
}

pub fn funding(index: u32) -> OutPoint {
    OutPoint { hash: calculate_tx_id(&genesis_coinbase()), index }
}

pub fn new_node() -> ContractLedger {
    new_node_with(config())
}

pub fn new_node_with(config: ChainConfig) -> ContractLedger {
    init_logging();
    ContractLedger::new(config, genesis()).unwrap()
}

pub fn coinbase(height: Height) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![],
        outputs: vec![TxOutput { value: COIN, destination: Destination::Address(user(9)) }],
        payload: TxPayload::Coinbase { height },
    }
}

pub fn block_on(parent: Hash, height: Height, stamp: u64, mut txs: Vec<Transaction>) -> Block {
    txs.insert(0, coinbase(height));
    Block::new(parent, stamp, BITS, txs)
}

/// Build a block on the best tip and apply it
pub fn mine(node: &ContractLedger, txs: Vec<Transaction>) -> Block {
    let tip = node.best_tip().unwrap();
    let block = block_on(tip.hash, tip.height + 1, tip.height + 1, txs);
    node.apply_block(block.clone()).unwrap();
    block
}

/// Mine every pool transaction, in pool order
pub fn mine_pool(node: &ContractLedger) -> Block {
    let txs = node
        .mempool_txids()
        .iter()
        .filter_map(|txid| node.mempool_entry(txid))
        .map(|entry| entry.tx)
        .collect();
    mine(node, txs)
}

pub fn signed(signer: u8, inputs: Vec<OutPoint>, outputs: Vec<TxOutput>, payload: TxPayload) -> Transaction {
    let mut tx = Transaction {
        version: 1,
        inputs: inputs
            .into_iter()
            .map(|prevout| TxInput { prevout, unlock: Unlock::Signature { pubkey: vec![], signature: vec![] } })
            .collect(),
        outputs,
        payload,
    };
    sign_all_inputs(&mut tx, &key(signer)).unwrap();
    tx
}

fn change(signer: u8, input_value: Amount, spent: Amount) -> Option<TxOutput> {
    let rest = input_value - spent - FEE;
    (rest > 0).then(|| TxOutput { value: rest, destination: Destination::Address(user(signer)) })
}

/// Pay `value` to `to` from one output worth `input_value`, change back to the signer
pub fn pay(signer: u8, from: OutPoint, input_value: Amount, to: PubKeyHash, value: Amount) -> Transaction {
    let mut outputs = vec![TxOutput { value, destination: Destination::Address(to) }];
    outputs.extend(change(signer, input_value, value));
    signed(signer, vec![from], outputs, TxPayload::Transfer)
}

/// Pay from a genesis output
pub fn transfer(index: u32, to: PubKeyHash, value: Amount) -> Transaction {
    pay(1, funding(index), GENESIS_VALUE, to, value)
}

pub fn publish(index: u32, code: ContractCode) -> (Transaction, ContractId) {
    let outputs = change(1, GENESIS_VALUE, 0).into_iter().collect();
    let tx = signed(
        1,
        vec![funding(index)],
        outputs,
        TxPayload::Publish(ContractPublish { code, sender: user(1).to_string() }),
    );
    let id = contract_id_for(&calculate_tx_id(&tx));
    (tx, id)
}

/// Call from a genesis output, paying `amount` to the contract in one output
pub fn call(index: u32, contract: ContractId, function: &str, args: Vec<Value>, amount: Amount) -> Transaction {
    let payments = if amount > 0 { vec![amount] } else { vec![] };
    call_paying(index, contract, function, args, payments)
}

/// Call paying the contract one output per entry of `payments`
pub fn call_paying(
    index: u32,
    contract: ContractId,
    function: &str,
    args: Vec<Value>,
    payments: Vec<Amount>,
) -> Transaction {
    let amount: Amount = payments.iter().sum();
    let mut outputs: Vec<TxOutput> = payments
        .into_iter()
        .map(|value| TxOutput { value, destination: Destination::Contract(contract) })
        .collect();
    outputs.extend(change(1, GENESIS_VALUE, amount));
    signed(
        1,
        vec![funding(index)],
        outputs,
        TxPayload::Call(ContractCall {
            contract: contract.to_string(),
            function: function.to_string(),
            args,
            amount,
            sender: user(1).to_string(),
            settlement: Settlement::default(),
        }),
    )
}

pub fn accepted(result: MempoolResult) -> MempoolEntry {
    match result {
        MempoolResult::Accepted(entry) => *entry,
        MempoolResult::Rejected(reason) => panic!("unexpected rejection: {}", reason),
    }
}

pub fn rejected(result: MempoolResult) -> LedgerError {
    match result {
        MempoolResult::Accepted(entry) => panic!("unexpected acceptance of {}", hex::encode(entry.txid)),
        MempoolResult::Rejected(reason) => reason,
    }
}

pub fn contract_id_for(txid: &Hash) -> ContractId {
    contract_ledger::address::contract_id_for(txid)
}

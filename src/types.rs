//! Core ledger types: outputs, transactions, blocks and contract accounts

use crate::vm::ContractCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// Short hash type: RIPEMD160(SHA256(x))
pub type Hash160 = [u8; 20];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Value in smallest coin units
pub type Amount = i64;

/// Block height
pub type Height = u64;

/// Persistent data of one contract, ordered by key
pub type DataMap = BTreeMap<String, Value>;

/// Public key hash identifying an ordinary address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PubKeyHash(pub Hash160);

/// Contract identifier: HASH160 of the publishing transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractId(pub Hash160);

/// Where an output's value goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Destination {
    Address(PubKeyHash),
    Contract(ContractId),
}

impl Destination {
    pub fn contract(&self) -> Option<ContractId> {
        match self {
            Destination::Contract(id) => Some(*id),
            Destination::Address(_) => None,
        }
    }
}

/// OutPoint: (transaction id, output index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

/// Authorisation for spending an input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unlock {
    /// Compressed public key and compact ECDSA signature over the signature hash
    Signature { pubkey: ByteString, signature: ByteString },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prevout: OutPoint,
    pub unlock: Unlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: Amount,
    pub destination: Destination,
}

/// Dynamically typed value passed to and stored by contracts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(_) => true,
        }
    }

    /// Heap bytes held by the value
    pub fn byte_len(&self) -> usize {
        match self {
            Value::Str(s) => s.len(),
            _ => 0,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Change in a contract's accumulated dust caused by one settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DustMovement {
    pub contract: ContractId,
    pub drawn: Amount,
    pub deposited: Amount,
}

/// Coin movements a contract call performs on behalf of contracts.
///
/// Inputs spend contract-owned outputs and need no signature: they are
/// authorised by re-executing the call. Outputs are the transfer plan in
/// order, followed by at most one change output per paying contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOutput>,
    pub dust: Vec<DustMovement>,
}

impl Settlement {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty() && self.dust.is_empty()
    }
}

/// Contract invocation descriptor, with addresses as submitted by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCall {
    pub contract: String,
    pub function: String,
    pub args: Vec<Value>,
    pub amount: Amount,
    pub sender: String,
    pub settlement: Settlement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractPublish {
    pub code: ContractCode,
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPayload {
    Coinbase { height: Height },
    Transfer,
    Publish(ContractPublish),
    Call(ContractCall),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub payload: TxPayload,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        matches!(self.payload, TxPayload::Coinbase { .. })
    }

    pub fn contract_call(&self) -> Option<&ContractCall> {
        match &self.payload {
            TxPayload::Call(call) => Some(call),
            _ => None,
        }
    }

    pub fn settlement(&self) -> Option<&Settlement> {
        self.contract_call().map(|call| &call.settlement)
    }

    /// Every outpoint this transaction consumes, signed inputs first
    pub fn spent_outpoints(&self) -> Vec<OutPoint> {
        let mut spent: Vec<OutPoint> = self.inputs.iter().map(|i| i.prevout).collect();
        if let Some(settlement) = self.settlement() {
            spent.extend(settlement.inputs.iter().copied());
        }
        spent
    }

    /// Outputs in index order: caller outputs, then settlement outputs
    pub fn all_outputs(&self) -> impl Iterator<Item = &TxOutput> {
        let settlement: &[TxOutput] = match self.settlement() {
            Some(s) => &s.outputs,
            None => &[],
        };
        self.outputs.iter().chain(settlement.iter())
    }
}

/// Block Header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u64,
    pub bits: u32,
    pub nonce: u64,
}

/// Block: header plus transactions, coinbase first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Unspent output as held by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub value: Amount,
    pub destination: Destination,
    /// Height of the block that created it
    pub height: Height,
    /// First height at which it may be spent
    pub mature_height: Height,
}

impl Utxo {
    pub fn is_mature_at(&self, spend_height: Height) -> bool {
        spend_height >= self.mature_height
    }
}

/// Contract account created by a publish transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAccount {
    pub code: Arc<ContractCode>,
    pub owner: PubKeyHash,
    pub publish_txid: Hash,
    pub data: DataMap,
    /// Change too small to emit, still owned by the contract
    pub dust: Amount,
}

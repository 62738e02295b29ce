//! Transaction validation, identifiers and input authorisation

use crate::address::{parse_sender, pubkey_hash, sha256d_hash};
use crate::constants::*;
use crate::error::{LedgerError, Result};
use crate::ledger::UtxoStore;
use crate::types::*;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use std::collections::HashSet;

/// CheckTransaction: 𝒯𝒳 → {valid, malformed}
///
/// A transaction tx = (v, ins, outs, payload) is well formed if and only if:
/// 1. coinbase ⇔ ins = ∅, and every other transaction has |ins| > 0
/// 2. ∀o ∈ outs ∪ settlement.outs: 0 ≤ o.value ≤ M_max, and the sum stays ≤ M_max
/// 3. |ins| ≤ M_max_inputs ∧ |outs| ≤ M_max_outputs
/// 4. no outpoint is spent twice, settlement inputs included
/// 5. a call's attached amount is in range
/// 6. |tx| ≤ M_max_tx_size
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    // 1. Coinbase shape
    if tx.is_coinbase() != tx.inputs.is_empty() {
        return Err(LedgerError::MalformedTransaction(if tx.is_coinbase() {
            "Coinbase may not spend inputs".to_string()
        } else {
            "Empty inputs".to_string()
        }));
    }

    // 2. Output values
    let mut total: Amount = 0;
    for (i, output) in tx.all_outputs().enumerate() {
        if output.value < 0 || output.value > MAX_MONEY {
            return Err(LedgerError::MalformedTransaction(format!(
                "Invalid output value {} at index {}",
                output.value, i
            )));
        }
        total = total
            .checked_add(output.value)
            .filter(|t| *t <= MAX_MONEY)
            .ok_or_else(|| LedgerError::MalformedTransaction("Total output value out of range".into()))?;
    }

    // 3. Count limits
    if tx.inputs.len() > MAX_INPUTS {
        return Err(LedgerError::MalformedTransaction(format!(
            "Too many inputs: {}",
            tx.inputs.len()
        )));
    }
    if tx.outputs.len() > MAX_OUTPUTS {
        return Err(LedgerError::MalformedTransaction(format!(
            "Too many outputs: {}",
            tx.outputs.len()
        )));
    }

    // 4. Duplicate spends inside the transaction
    let mut seen = HashSet::new();
    for outpoint in tx.spent_outpoints() {
        if !seen.insert(outpoint) {
            return Err(LedgerError::MalformedTransaction(format!(
                "Duplicate input {}:{}",
                hex::encode(outpoint.hash),
                outpoint.index
            )));
        }
    }

    // 5. Attached amount
    if let Some(call) = tx.contract_call() {
        if call.amount < 0 || call.amount > MAX_MONEY {
            return Err(LedgerError::MalformedTransaction(format!(
                "Invalid call amount {}",
                call.amount
            )));
        }
    }

    // 6. Size
    let tx_size = calculate_transaction_size(tx);
    if tx_size > MAX_TX_SIZE {
        return Err(LedgerError::MalformedTransaction(format!(
            "Transaction too large: {} bytes",
            tx_size
        )));
    }

    Ok(())
}

/// CheckTxInputs: 𝒯𝒳 × 𝒰𝒮 × ℕ → ℤ
///
/// For transaction tx against the confirmed UTXO set us at spend height h:
/// 1. If tx is coinbase: return 0
/// 2. ∀i ∈ ins: us(i.prevout) exists
/// 3. ∀i ∈ ins: us(i.prevout) is mature at h
/// 4. ∀i ∈ ins: us(i.prevout) pays an address whose key signed the input
/// 5. Σᵢ us(i.prevout).value ≥ Σₒ o.value
/// 6. Return fee = Σᵢ - Σₒ
///
/// Settlement inputs and outputs are not covered here: they balance on their
/// own and are authorised by re-executing the call.
pub fn check_tx_inputs(tx: &Transaction, utxos: &UtxoStore, height: Height) -> Result<Amount> {
    // 1. Coinbase
    if tx.is_coinbase() {
        return Ok(0);
    }

    let sighash = signature_hash(tx);
    let secp = Secp256k1::verification_only();
    let mut total_in: Amount = 0;

    for (i, input) in tx.inputs.iter().enumerate() {
        // 2. Existence
        let utxo = utxos.get(&input.prevout).ok_or_else(|| {
            LedgerError::InputNotFound(format!(
                "{}:{}",
                hex::encode(input.prevout.hash),
                input.prevout.index
            ))
        })?;

        // 3. Maturity
        if !utxo.is_mature_at(height) {
            return Err(LedgerError::InsufficientFunds(format!(
                "input {} is immature until height {}",
                i, utxo.mature_height
            )));
        }

        // 4. Ownership
        let Unlock::Signature { pubkey, signature } = &input.unlock;
        let owner = match utxo.destination {
            Destination::Address(pkh) => pkh,
            Destination::Contract(_) => {
                return Err(LedgerError::InvalidSignature(format!(
                    "input {} is owned by a contract",
                    i
                )))
            }
        };
        if pubkey_hash(pubkey) != owner || !verify_signature(&secp, pubkey, signature, &sighash) {
            return Err(LedgerError::InvalidSignature(format!("input {}", i)));
        }

        total_in = total_in
            .checked_add(utxo.value)
            .ok_or_else(|| LedgerError::MalformedTransaction("Input value overflow".into()))?;
    }

    // 5. Value balance
    let total_out: Amount = tx.outputs.iter().map(|o| o.value).sum();
    if total_in < total_out {
        return Err(LedgerError::InsufficientFunds(format!(
            "inputs {} below outputs {}",
            total_in, total_out
        )));
    }

    // 6. Fee
    Ok(total_in - total_out)
}

/// Addresses whose keys unlock the signed inputs
pub fn signers(tx: &Transaction) -> Vec<PubKeyHash> {
    let mut signers: Vec<PubKeyHash> = tx
        .inputs
        .iter()
        .map(|input| {
            let Unlock::Signature { pubkey, .. } = &input.unlock;
            pubkey_hash(pubkey)
        })
        .collect();
    signers.sort();
    signers.dedup();
    signers
}

/// The sender named by a call or publish must be an ordinary address that
/// signed one of the inputs.
pub fn check_sender(tx: &Transaction, sender: &str) -> Result<PubKeyHash> {
    let pkh = parse_sender(sender)?;
    if !signers(tx).contains(&pkh) {
        return Err(LedgerError::InvalidSender(format!("{} did not sign the transaction", sender)));
    }
    Ok(pkh)
}

/// A call's attached amount must be exactly what its own outputs pay the contract
pub fn check_call_payment(tx: &Transaction, contract: ContractId, amount: Amount) -> Result<()> {
    let paid: Amount = tx
        .outputs
        .iter()
        .filter(|output| output.destination == Destination::Contract(contract))
        .map(|output| output.value)
        .sum();
    if paid != amount {
        return Err(LedgerError::MalformedTransaction(format!(
            "call attaches {} but pays the contract {}",
            amount, paid
        )));
    }
    Ok(())
}

// ============================================================================
// IDENTIFIERS AND SIGNING
// ============================================================================

/// Transaction id: double SHA-256 of the full encoding, settlement included
pub fn calculate_tx_id(tx: &Transaction) -> Hash {
    sha256d_hash(&encode(tx))
}

/// Hash committed to by input signatures: the transaction with every unlock
/// blanked and the settlement removed, since the node attaches the settlement
/// after the caller has signed.
pub fn signature_hash(tx: &Transaction) -> Hash {
    let mut stripped = tx.clone();
    for input in &mut stripped.inputs {
        input.unlock = Unlock::Signature { pubkey: Vec::new(), signature: Vec::new() };
    }
    if let TxPayload::Call(call) = &mut stripped.payload {
        call.settlement = Settlement::default();
    }
    sha256d_hash(&encode(&stripped))
}

/// Sign one input with a secret key, filling in its unlock
pub fn sign_input(tx: &mut Transaction, index: usize, key: &SecretKey) -> Result<()> {
    let secp = Secp256k1::signing_only();
    let sighash = signature_hash(tx);
    let message = Message::from_digest(sighash);
    let signature = secp.sign_ecdsa(&message, key);
    let pubkey = PublicKey::from_secret_key(&secp, key);

    let input = tx.inputs.get_mut(index).ok_or_else(|| {
        LedgerError::MalformedTransaction(format!("no input at index {}", index))
    })?;
    input.unlock = Unlock::Signature {
        pubkey: pubkey.serialize().to_vec(),
        signature: signature.serialize_compact().to_vec(),
    };
    Ok(())
}

/// Sign every input with the same key
pub fn sign_all_inputs(tx: &mut Transaction, key: &SecretKey) -> Result<()> {
    for index in 0..tx.inputs.len() {
        sign_input(tx, index, key)?;
    }
    Ok(())
}

/// Verify a compact ECDSA signature over the signature hash
fn verify_signature<C: secp256k1::Verification>(
    secp: &Secp256k1<C>,
    pubkey_bytes: &[u8],
    signature_bytes: &[u8],
    sighash: &Hash,
) -> bool {
    let pubkey = match PublicKey::from_slice(pubkey_bytes) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let signature = match Signature::from_compact(signature_bytes) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    let message = Message::from_digest(*sighash);
    secp.verify_ecdsa(&message, &signature, &pubkey).is_ok()
}

fn encode(tx: &Transaction) -> Vec<u8> {
    // String-keyed maps only, so encoding cannot fail
    serde_json::to_vec(tx).unwrap_or_default()
}

/// Calculate transaction size
pub fn calculate_transaction_size(tx: &Transaction) -> usize {
    encode(tx).len()
}

/// Helper: derive the address of a secret key
pub fn address_of(key: &SecretKey) -> PubKeyHash {
    let secp = Secp256k1::signing_only();
    pubkey_hash(&PublicKey::from_secret_key(&secp, key).serialize())
}

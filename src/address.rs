//! Address and contract-id text encoding

use crate::constants::*;
use crate::error::{LedgerError, Result};
use crate::types::*;
use bitcoin_hashes::{sha256d, Hash as BitcoinHash, HashEngine};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// HASH160: RIPEMD160(SHA256(x))
pub fn hash160(data: &[u8]) -> Hash160 {
    let sha256_hash = Sha256::digest(data);
    let ripemd160_hash = Ripemd160::digest(&sha256_hash);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripemd160_hash);
    out
}

/// Double SHA-256
pub fn sha256d_hash(data: &[u8]) -> Hash {
    let mut hasher = sha256d::Hash::engine();
    hasher.input(data);
    let result = sha256d::Hash::from_engine(hasher);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Public key hash of a serialized public key
pub fn pubkey_hash(pubkey: &[u8]) -> PubKeyHash {
    PubKeyHash(hash160(pubkey))
}

/// Contract id derived from the publishing transaction id
pub fn contract_id_for(publish_txid: &Hash) -> ContractId {
    ContractId(hash160(publish_txid))
}

/// Base58Check: base58(version || payload || sha256d(version || payload)[..4])
fn encode(version: u8, payload: &Hash160) -> String {
    let mut raw = Vec::with_capacity(21);
    raw.push(version);
    raw.extend_from_slice(payload);
    bs58::encode(raw).with_check().into_string()
}

fn decode(text: &str) -> Option<(u8, Hash160)> {
    let raw = bs58::decode(text.trim()).with_check(None).into_vec().ok()?;
    if raw.len() != 21 {
        return None;
    }
    let mut payload = [0u8; 20];
    payload.copy_from_slice(&raw[1..]);
    Some((raw[0], payload))
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Address(pkh) => f.write_str(&encode(ADDRESS_VERSION, &pkh.0)),
            Destination::Contract(id) => f.write_str(&encode(CONTRACT_VERSION, &id.0)),
        }
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Destination::Contract(*self).fmt(f)
    }
}

impl fmt::Display for PubKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Destination::Address(*self).fmt(f)
    }
}

impl FromStr for Destination {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match decode(s) {
            Some((ADDRESS_VERSION, payload)) => Ok(Destination::Address(PubKeyHash(payload))),
            Some((CONTRACT_VERSION, payload)) => Ok(Destination::Contract(ContractId(payload))),
            _ => Err(LedgerError::InvalidDestination(s.to_string())),
        }
    }
}

/// Parse the sender of a call or publish; it must be an ordinary address
pub fn parse_sender(text: &str) -> Result<PubKeyHash> {
    match text.parse::<Destination>() {
        Ok(Destination::Address(pkh)) => Ok(pkh),
        _ => Err(LedgerError::InvalidSender(text.to_string())),
    }
}

/// Parse a contract address; anything else is a lookup failure
pub fn parse_contract(text: &str) -> Result<ContractId> {
    match text.parse::<Destination>() {
        Ok(Destination::Contract(id)) => Ok(id),
        _ => Err(LedgerError::ContractNotFound(text.to_string())),
    }
}

/// Parse the recipient of a contract send; only ordinary addresses may receive
pub fn parse_send_destination(text: &str) -> Result<PubKeyHash> {
    match text.parse::<Destination>() {
        Ok(Destination::Address(pkh)) => Ok(pkh),
        _ => Err(LedgerError::InvalidDestination(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_text_roundtrip() {
        let dest = Destination::Address(PubKeyHash([7; 20]));
        let text = dest.to_string();
        let raw = bs58::decode(&text).into_vec().unwrap();
        assert_eq!(raw.len(), 25);
        assert_eq!(raw[0], ADDRESS_VERSION);
        assert_eq!(text.parse::<Destination>().unwrap(), dest);
    }

    #[test]
    fn test_contract_and_address_versions_differ() {
        let addr = Destination::Address(PubKeyHash([1; 20])).to_string();
        let contract = Destination::Contract(ContractId([1; 20])).to_string();
        assert_ne!(addr, contract);
        assert!(matches!(parse_contract(&addr), Err(LedgerError::ContractNotFound(_))));
        assert!(matches!(parse_sender(&contract), Err(LedgerError::InvalidSender(_))));
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut text = Destination::Address(PubKeyHash([9; 20])).to_string();
        let last = text.pop().unwrap();
        text.push(if last == '1' { '2' } else { '1' });
        assert!(matches!(
            text.parse::<Destination>(),
            Err(LedgerError::InvalidDestination(_))
        ));
        assert!(matches!(parse_sender("not an address"), Err(LedgerError::InvalidSender(_))));
        // Valid checksum, wrong payload length
        let short = bs58::encode([ADDRESS_VERSION, 1, 2]).with_check().into_string();
        assert!(matches!(parse_sender(&short), Err(LedgerError::InvalidSender(_))));
    }

    #[test]
    fn test_send_destination_must_be_address() {
        let contract = ContractId([3; 20]).to_string();
        assert!(matches!(
            parse_send_destination(&contract),
            Err(LedgerError::InvalidDestination(_))
        ));
        let addr = PubKeyHash([3; 20]).to_string();
        assert_eq!(parse_send_destination(&addr).unwrap(), PubKeyHash([3; 20]));
    }

    #[test]
    fn test_hash160_length_and_determinism() {
        assert_eq!(hash160(b"abc"), hash160(b"abc"));
        assert_ne!(hash160(b"abc"), hash160(b"abd"));
        assert_ne!(contract_id_for(&[1; 32]), contract_id_for(&[2; 32]));
    }
}

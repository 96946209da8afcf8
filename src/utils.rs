//! Utility functions for identifiers and hashing

use bech32::Bech32m;
use uuid7::uuid7;

use crate::types::{TradeId, Uid};

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub fn new_trade_id() -> TradeId {
    // "trade" is a valid hrp, encoding 16 bytes cannot exceed the bech32 length limit
    TradeId::new(new_uuid_to_bech32("trade").unwrap_or_else(|_| uuid7().to_string()))
}

pub fn new_uid() -> Uid {
    Uid::new(uuid7().to_string())
}

/// Raw sha256 over `data`.
pub fn sha256_bytes(data: &[u8]) -> Vec<u8> {
    // sha256::digest yields lowercase hex, decoding it back can not fail
    hex::decode(sha256::digest(data)).unwrap_or_default()
}

/// sha256 over the concatenation of `parts`, each prefixed with its length.
pub fn hash_parts(parts: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len() + 8).sum());
    for part in parts {
        buf.extend_from_slice(&(part.len() as u64).to_be_bytes());
        buf.extend_from_slice(part);
    }
    sha256_bytes(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_ids_are_unique_and_prefixed() {
        let a = new_trade_id();
        let b = new_trade_id();

        assert!(a.as_str().starts_with("trade1"));
        assert_ne!(a, b);
    }

    #[test]
    fn hash_parts_is_length_prefixed() {
        // without the prefix both would hash "abc"
        assert_ne!(hash_parts(&[b"ab", b"c"]), hash_parts(&[b"a", b"bc"]));
        assert_eq!(hash_parts(&[b"ab"]).len(), 32);
    }
}

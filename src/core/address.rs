use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{sha2_256, sha2_256d, Hash32};

/// Address prefix byte, rendered as the leading 'Q'.
pub const ADDRESS_PREFIX: u8 = b'Q';
/// prefix (1) + identifier (20) + checksum (4)
pub const ADDRESS_LEN: usize = 25;

#[derive(Error, Debug, PartialEq)]
pub enum AddressError {
    #[error("address must be {ADDRESS_LEN} bytes, got {0}")]
    BadLength(usize),
    #[error("address prefix byte is not 'Q'")]
    BadPrefix,
    #[error("address checksum mismatch")]
    BadChecksum,
    #[error("address is not valid hex")]
    BadHex,
}

/// Account address: 1-byte prefix, 20-byte public-key digest, 4-byte
/// double-SHA2 checksum.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// Derive the address owned by an XMSS public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = sha2_256(public_key);
        let mut raw = [0u8; ADDRESS_LEN];
        raw[0] = ADDRESS_PREFIX;
        raw[1..21].copy_from_slice(&digest[..20]);
        let checksum = sha2_256d(&raw[..21]);
        raw[21..].copy_from_slice(&checksum[..4]);
        Self(raw)
    }

    /// Parse `Q<48 hex chars>` and verify prefix + checksum.
    pub fn from_qstring(s: &str) -> Result<Self, AddressError> {
        let hex_part = s.strip_prefix('Q').ok_or(AddressError::BadPrefix)?;
        let body = hex::decode(hex_part).map_err(|_| AddressError::BadHex)?;
        if body.len() != ADDRESS_LEN - 1 {
            return Err(AddressError::BadLength(body.len() + 1));
        }
        let mut raw = [0u8; ADDRESS_LEN];
        raw[0] = ADDRESS_PREFIX;
        raw[1..].copy_from_slice(&body);
        Self::from_bytes(&raw)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, AddressError> {
        if raw.len() != ADDRESS_LEN {
            return Err(AddressError::BadLength(raw.len()));
        }
        if raw[0] != ADDRESS_PREFIX {
            return Err(AddressError::BadPrefix);
        }
        let checksum = sha2_256d(&raw[..21]);
        if raw[21..] != checksum[..4] {
            return Err(AddressError::BadChecksum);
        }
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(raw);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", hex::encode(&self.0[1..]))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Bitmap over the XMSS tree leaves recording which one-time signature
/// indices an account has already burned.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OtsBitfield {
    bits: Vec<u8>,
}

impl OtsBitfield {
    pub fn is_used(&self, index: u64) -> bool {
        let byte = (index / 8) as usize;
        byte < self.bits.len() && self.bits[byte] & (1 << (index % 8)) != 0
    }

    pub fn mark_used(&mut self, index: u64) {
        let byte = (index / 8) as usize;
        if byte >= self.bits.len() {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 1 << (index % 8);
    }

    pub fn used_indices(&self) -> Vec<u64> {
        let mut out = Vec::new();
        for (i, byte) in self.bits.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    out.push(i as u64 * 8 + bit as u64);
                }
            }
        }
        out
    }
}

/// Per-account replicated state: balance, monotone nonce, burned OTS leaves
/// and token holdings keyed by the creating transaction's hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddressState {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
    pub ots_bitfield: OtsBitfield,
    pub tokens: HashMap<Hash32, u64>,
}

impl AddressState {
    pub fn get_default(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            nonce: 0,
            ots_bitfield: OtsBitfield::default(),
            tokens: HashMap::new(),
        }
    }

    pub fn token_balance(&self, token_txhash: &Hash32) -> u64 {
        self.tokens.get(token_txhash).copied().unwrap_or(0)
    }

    pub fn credit_token(&mut self, token_txhash: Hash32, amount: u64) {
        *self.tokens.entry(token_txhash).or_insert(0) += amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::xmss::XmssKeypair;

    #[test]
    fn test_address_derivation_roundtrip() {
        let kp = XmssKeypair::from_seed(4, [1u8; 32]);
        let addr = Address::from_public_key(&kp.public_key());
        let parsed = Address::from_qstring(&addr.to_string()).unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn test_address_checksum_detects_corruption() {
        let kp = XmssKeypair::from_seed(4, [2u8; 32]);
        let addr = Address::from_public_key(&kp.public_key());
        let mut raw = addr.0;
        raw[5] ^= 0xFF;
        assert_eq!(Address::from_bytes(&raw), Err(AddressError::BadChecksum));
    }

    #[test]
    fn test_address_rejects_wrong_prefix() {
        assert!(matches!(
            Address::from_qstring("X00"),
            Err(AddressError::BadPrefix)
        ));
    }

    #[test]
    fn test_ots_bitfield() {
        let mut bf = OtsBitfield::default();
        assert!(!bf.is_used(0));
        bf.mark_used(0);
        bf.mark_used(19);
        assert!(bf.is_used(0));
        assert!(bf.is_used(19));
        assert!(!bf.is_used(7));
        assert_eq!(bf.used_indices(), vec![0, 19]);
    }

    #[test]
    fn test_default_state_is_empty() {
        let kp = XmssKeypair::from_seed(4, [3u8; 32]);
        let addr = Address::from_public_key(&kp.public_key());
        let state = AddressState::get_default(addr);
        assert_eq!(state.balance, 0);
        assert_eq!(state.nonce, 0);
        assert!(state.ots_bitfield.used_indices().is_empty());
    }
}

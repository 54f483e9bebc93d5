pub mod xmss;

use sha2::{Digest, Sha256};
use sha3::Sha3_256;

pub use xmss::{XmssKeypair, XmssSignature, verify_xmss};

/// 32-byte content digest used everywhere a hash identifies data:
/// transaction hashes, block header hashes, address derivation.
pub type Hash32 = [u8; 32];

/// Calculate SHA2-256 hash
/// Returns exactly 32 bytes for type safety
pub fn sha2_256(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Double SHA2-256, used for address checksums
pub fn sha2_256d(data: &[u8]) -> Hash32 {
    sha2_256(&sha2_256(data))
}

/// PoW digest over `mining_hash || nonce`.
///
/// This is the seam where the memory-hard mining hash plugs in; everything
/// above it only sees a deterministic, stateless `(mining_hash, nonce) -> 32
/// bytes` function. The node itself never depends on which digest sits here.
pub fn pow_hash(mining_hash: &Hash32, nonce: u32) -> Hash32 {
    let mut hasher = Sha3_256::new();
    hasher.update(mining_hash);
    hasher.update(nonce.to_be_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha2_256_deterministic() {
        let a = sha2_256(b"deterministic test");
        let b = sha2_256(b"deterministic test");
        assert_eq!(a, b);
        assert_ne!(a, sha2_256(b"something else"));
    }

    #[test]
    fn test_pow_hash_depends_on_nonce() {
        let mh = sha2_256(b"header");
        assert_ne!(pow_hash(&mh, 0), pow_hash(&mh, 1));
        assert_eq!(pow_hash(&mh, 7), pow_hash(&mh, 7));
    }
}

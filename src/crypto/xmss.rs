//! XMSS one-time signatures over SHA2-256.
//!
//! WOTS+ (w = 16) leaves under a binary Merkle tree of height `h`, giving
//! `2^h` one-time leaves per keypair. The leaf index travels inside the
//! signature and verification recomputes the Merkle root, so `verify` needs
//! nothing but the message, the signature and the public key.
//!
//! Leaf bookkeeping is deliberately NOT done here: which index an account
//! has burned is consensus state (the per-address OTS bitfield), so `sign`
//! takes the index explicitly and never auto-advances it.

use rand::RngCore;
use zeroize::Zeroize;

use crate::crypto::{sha2_256, Hash32};

/// Winternitz parameter. 4 bits per chain.
const WOTS_W: u32 = 16;
const WOTS_LOG_W: u32 = 4;
/// 64 message chains (32 bytes, two nibbles each) + 3 checksum chains.
const WOTS_LEN1: usize = 64;
const WOTS_LEN2: usize = 3;
const WOTS_LEN: usize = WOTS_LEN1 + WOTS_LEN2;

// Domain separators so chain secrets, leaf compression and tree nodes can
// never collide on input bytes.
const DOM_CHAIN_SEED: u8 = 0x01;
const DOM_CHAIN_STEP: u8 = 0x02;
const DOM_LEAF: u8 = 0x03;
const DOM_NODE: u8 = 0x04;

/// Public key: tree height byte followed by the 32-byte Merkle root.
pub const XMSS_PK_LEN: usize = 1 + 32;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct XmssSignature {
    pub ots_index: u64,
    pub wots: Vec<Hash32>,
    pub auth_path: Vec<Hash32>,
}

impl XmssSignature {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + (self.wots.len() + self.auth_path.len()) * 32);
        out.extend_from_slice(&self.ots_index.to_be_bytes());
        for c in &self.wots {
            out.extend_from_slice(c);
        }
        for a in &self.auth_path {
            out.extend_from_slice(a);
        }
        out
    }

    /// Parse from raw bytes; the auth path length is whatever remains after
    /// the fixed WOTS part, which pins the tree height.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 8 + WOTS_LEN * 32 || (data.len() - 8) % 32 != 0 {
            return None;
        }
        let mut idx = [0u8; 8];
        idx.copy_from_slice(&data[..8]);
        let chunks: Vec<Hash32> = data[8..]
            .chunks_exact(32)
            .map(|c| {
                let mut h = [0u8; 32];
                h.copy_from_slice(c);
                h
            })
            .collect();
        let (wots, auth) = chunks.split_at(WOTS_LEN);
        Some(Self {
            ots_index: u64::from_be_bytes(idx),
            wots: wots.to_vec(),
            auth_path: auth.to_vec(),
        })
    }
}

/// XMSS keypair with `2^height` one-time leaves.
///
/// The secret seed is zeroized on drop. Leaf hashes are computed once at
/// generation so signing only walks one authentication path.
pub struct XmssKeypair {
    height: u8,
    seed: [u8; 32],
    leaves: Vec<Hash32>,
    root: Hash32,
}

impl Drop for XmssKeypair {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl XmssKeypair {
    /// Generate a keypair from a fresh random seed.
    pub fn generate(height: u8) -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(height, seed)
    }

    /// Deterministic generation, used by tests and wallet recovery.
    pub fn from_seed(height: u8, seed: [u8; 32]) -> Self {
        let num_leaves = 1usize << height;
        let leaves: Vec<Hash32> = (0..num_leaves as u64)
            .map(|i| wots_leaf(&seed, i))
            .collect();
        let root = merkle_root(&leaves);
        Self { height, seed, leaves, root }
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn num_leaves(&self) -> u64 {
        1u64 << self.height
    }

    /// Serialized public key: height byte || Merkle root.
    pub fn public_key(&self) -> Vec<u8> {
        let mut pk = Vec::with_capacity(XMSS_PK_LEN);
        pk.push(self.height);
        pk.extend_from_slice(&self.root);
        pk
    }

    /// Sign `message` with the one-time leaf `ots_index`.
    ///
    /// The caller is responsible for never passing the same index twice for
    /// value-bearing messages; the chain rejects reuse, this function does
    /// not.
    pub fn sign(&self, message: &Hash32, ots_index: u64) -> Option<XmssSignature> {
        if ots_index >= self.num_leaves() {
            return None;
        }
        let digits = wots_digits(message);
        let wots = digits
            .iter()
            .enumerate()
            .map(|(chain, &d)| {
                let sk = chain_seed(&self.seed, ots_index, chain as u8);
                chain_iter(&sk, 0, d)
            })
            .collect();
        let auth_path = self.auth_path(ots_index);
        Some(XmssSignature { ots_index, wots, auth_path })
    }

    fn auth_path(&self, ots_index: u64) -> Vec<Hash32> {
        let mut path = Vec::with_capacity(self.height as usize);
        let mut level: Vec<Hash32> = self.leaves.clone();
        let mut idx = ots_index as usize;
        while level.len() > 1 {
            path.push(level[idx ^ 1]);
            level = level
                .chunks_exact(2)
                .map(|pair| node_hash(&pair[0], &pair[1]))
                .collect();
            idx >>= 1;
        }
        path
    }
}

/// Verify an XMSS signature against a serialized public key.
pub fn verify_xmss(message: &Hash32, signature: &XmssSignature, public_key: &[u8]) -> bool {
    if public_key.len() != XMSS_PK_LEN {
        return false;
    }
    let height = public_key[0] as usize;
    if signature.auth_path.len() != height
        || signature.wots.len() != WOTS_LEN
        || signature.ots_index >= (1u64 << height)
    {
        return false;
    }

    // Finish every chain, compress to the leaf, climb to the root.
    let digits = wots_digits(message);
    let mut leaf_input = Vec::with_capacity(1 + WOTS_LEN * 32);
    leaf_input.push(DOM_LEAF);
    for (chain, &d) in digits.iter().enumerate() {
        let end = chain_iter(&signature.wots[chain], d, (WOTS_W - 1) as u8);
        leaf_input.extend_from_slice(&end);
    }
    let mut node = sha2_256(&leaf_input);

    let mut idx = signature.ots_index;
    for sibling in &signature.auth_path {
        node = if idx & 1 == 0 {
            node_hash(&node, sibling)
        } else {
            node_hash(sibling, &node)
        };
        idx >>= 1;
    }

    node == public_key[1..]
}

/// Message digits plus the WOTS checksum digits.
fn wots_digits(message: &Hash32) -> Vec<u8> {
    let mut digits = Vec::with_capacity(WOTS_LEN);
    for byte in message {
        digits.push(byte >> WOTS_LOG_W);
        digits.push(byte & (WOTS_W - 1) as u8);
    }
    let csum: u32 = digits.iter().map(|&d| WOTS_W - 1 - d as u32).sum();
    // 3 base-w digits cover the maximum checksum of 64 * 15 = 960.
    for i in (0..WOTS_LEN2).rev() {
        digits.push(((csum >> (i as u32 * WOTS_LOG_W)) & (WOTS_W - 1)) as u8);
    }
    digits
}

fn chain_seed(seed: &[u8; 32], leaf: u64, chain: u8) -> Hash32 {
    let mut input = Vec::with_capacity(1 + 32 + 8 + 1);
    input.push(DOM_CHAIN_SEED);
    input.extend_from_slice(seed);
    input.extend_from_slice(&leaf.to_be_bytes());
    input.push(chain);
    sha2_256(&input)
}

/// Walk a WOTS chain from step `from` to step `to`.
fn chain_iter(start: &Hash32, from: u8, to: u8) -> Hash32 {
    let mut value = *start;
    for step in from..to {
        let mut input = Vec::with_capacity(2 + 32);
        input.push(DOM_CHAIN_STEP);
        input.push(step);
        input.extend_from_slice(&value);
        value = sha2_256(&input);
    }
    value
}

fn wots_leaf(seed: &[u8; 32], leaf: u64) -> Hash32 {
    let mut input = Vec::with_capacity(1 + WOTS_LEN * 32);
    input.push(DOM_LEAF);
    for chain in 0..WOTS_LEN as u8 {
        let sk = chain_seed(seed, leaf, chain);
        let end = chain_iter(&sk, 0, (WOTS_W - 1) as u8);
        input.extend_from_slice(&end);
    }
    sha2_256(&input)
}

fn node_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut input = Vec::with_capacity(1 + 64);
    input.push(DOM_NODE);
    input.extend_from_slice(left);
    input.extend_from_slice(right);
    sha2_256(&input)
}

fn merkle_root(leaves: &[Hash32]) -> Hash32 {
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks_exact(2)
            .map(|pair| node_hash(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

//! Typed transactions and their validation/application rules.
//!
//! Every variant is a plain struct implementing [`TransactionOps`]; the
//! [`Transaction`] enum is the tagged sum that travels on the wire and in
//! blocks. A transaction hash commits to the canonical fields and to
//! `pubhash = H(public_key || ots_key)`, binding the signature to one XMSS
//! leaf.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::address::{Address, AddressState};
use crate::core::state::StateOverlay;
use crate::crypto::xmss::{verify_xmss, XmssKeypair, XmssSignature};
use crate::crypto::{sha2_256, Hash32};
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum TxError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid transaction structure: {0}")]
    InvalidStructure(&'static str),
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },
    #[error("nonce mismatch: expected {expected}, got {got}")]
    NonceMismatch { expected: u64, got: u64 },
    #[error("one-time signature index {0} already used")]
    OtsReused(u64),
    #[error("insufficient token balance: required {required}, available {available}")]
    InsufficientTokenBalance { required: u64, available: u64 },
    #[error("arithmetic overflow")]
    MathOverflow,
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

/// Per-block facts a transaction may consult while applying.
#[derive(Clone, Debug)]
pub struct BlockContext {
    pub block_number: u64,
    pub stake_selector: Address,
    pub fixed_reward: u64,
    pub total_fees: u64,
    pub min_stake_balance: u64,
    pub blocks_per_epoch: u64,
}

/// Signing envelope carried by every non-coinbase transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxAuth {
    pub public_key: Vec<u8>,
    pub ots_key: u64,
    pub nonce: u64,
    pub fee: u64,
    pub signature: Vec<u8>,
}

impl TxAuth {
    /// `H(public_key || ots_key)`, the leaf-binding half of the txhash.
    pub fn pubhash(&self) -> Hash32 {
        let mut input = Vec::with_capacity(self.public_key.len() + 8);
        input.extend_from_slice(&self.public_key);
        input.extend_from_slice(&self.ots_key.to_be_bytes());
        sha2_256(&input)
    }

    pub fn derived_address(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    fn verify_signature(&self, txhash: &Hash32) -> Result<(), TxError> {
        if self.signature.is_empty() || self.public_key.is_empty() {
            return Err(TxError::InvalidSignature);
        }
        let sig = XmssSignature::from_bytes(&self.signature).ok_or(TxError::InvalidSignature)?;
        // The signed leaf must be the leaf the hash committed to.
        if sig.ots_index != self.ots_key {
            return Err(TxError::InvalidSignature);
        }
        if !verify_xmss(txhash, &sig, &self.public_key) {
            return Err(TxError::InvalidSignature);
        }
        Ok(())
    }
}

/// Uniform validation/application surface implemented by every variant.
pub trait TransactionOps {
    /// Canonical field bytes fed into the transaction hash.
    fn hashable_bytes(&self) -> Vec<u8>;

    /// Stateless checks: structure, amounts, signature, key/address binding.
    fn static_validate(&self) -> Result<(), TxError>;

    /// Mutate the speculative overlay. Nonce and OTS rules are enforced
    /// here so every caller shares one set of state rules.
    fn apply(&self, overlay: &mut StateOverlay, ctx: &BlockContext) -> Result<(), TxError>;
}

/// Debit the spend side: funds check, strict nonce sequencing, OTS burn.
fn apply_spend(
    overlay: &mut StateOverlay,
    addr_from: Address,
    auth: &TxAuth,
    debit: u64,
) -> Result<(), TxError> {
    let acc = overlay.load_mut(addr_from)?;
    if acc.balance < debit {
        return Err(TxError::InsufficientFunds { required: debit, available: acc.balance });
    }
    let expected = acc.nonce + 1;
    if auth.nonce != expected {
        return Err(TxError::NonceMismatch { expected, got: auth.nonce });
    }
    if acc.ots_bitfield.is_used(auth.ots_key) {
        return Err(TxError::OtsReused(auth.ots_key));
    }
    acc.balance -= debit;
    acc.nonce = auth.nonce;
    acc.ots_bitfield.mark_used(auth.ots_key);
    Ok(())
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferTx {
    pub addr_from: Address,
    pub addr_to: Address,
    pub amount: u64,
    pub auth: TxAuth,
}

impl TransferTx {
    pub fn create(
        addr_to: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
        public_key: Vec<u8>,
        ots_key: u64,
    ) -> Self {
        let auth = TxAuth { public_key, ots_key, nonce, fee, signature: Vec::new() };
        Self { addr_from: auth.derived_address(), addr_to, amount, auth }
    }
}

impl TransactionOps for TransferTx {
    fn hashable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"transfer");
        out.extend_from_slice(self.addr_from.as_bytes());
        out.extend_from_slice(self.addr_to.as_bytes());
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(&self.auth.fee.to_be_bytes());
        out.extend_from_slice(&self.auth.nonce.to_be_bytes());
        out
    }

    fn static_validate(&self) -> Result<(), TxError> {
        if self.amount == 0 {
            return Err(TxError::InvalidStructure("zero-amount transfer"));
        }
        if self.auth.derived_address() != self.addr_from {
            return Err(TxError::InvalidSignature);
        }
        self.auth.verify_signature(&hash_with_pubhash(&self.hashable_bytes(), &self.auth))
    }

    fn apply(&self, overlay: &mut StateOverlay, _ctx: &BlockContext) -> Result<(), TxError> {
        let debit = self
            .amount
            .checked_add(self.auth.fee)
            .ok_or(TxError::MathOverflow)?;
        apply_spend(overlay, self.addr_from, &self.auth, debit)?;
        let dst = overlay.load_mut(self.addr_to)?;
        dst.balance = dst.balance.checked_add(self.amount).ok_or(TxError::MathOverflow)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Coinbase
// ---------------------------------------------------------------------------

/// Block reward payout. Unsigned; the chain manager checks the amount
/// equals `fixed_reward + total fees` and the destination is the block's
/// stake selector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoinbaseTx {
    pub addr_to: Address,
    pub amount: u64,
    pub block_number: u64,
}

impl CoinbaseTx {
    pub fn create(addr_to: Address, amount: u64, block_number: u64) -> Self {
        Self { addr_to, amount, block_number }
    }
}

impl TransactionOps for CoinbaseTx {
    fn hashable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"coinbase");
        out.extend_from_slice(self.addr_to.as_bytes());
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(&self.block_number.to_be_bytes());
        out
    }

    fn static_validate(&self) -> Result<(), TxError> {
        Ok(())
    }

    fn apply(&self, overlay: &mut StateOverlay, _ctx: &BlockContext) -> Result<(), TxError> {
        let dst = overlay.load_mut(self.addr_to)?;
        dst.balance = dst.balance.checked_add(self.amount).ok_or(TxError::MathOverflow)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Token creation
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenTx {
    pub addr_from: Address,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub initial_balances: Vec<(Address, u64)>,
    pub auth: TxAuth,
}

impl TransactionOps for TokenTx {
    fn hashable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"token");
        out.extend_from_slice(self.addr_from.as_bytes());
        out.extend_from_slice(self.symbol.as_bytes());
        out.push(0);
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out.push(self.decimals);
        for (addr, amount) in &self.initial_balances {
            out.extend_from_slice(addr.as_bytes());
            out.extend_from_slice(&amount.to_be_bytes());
        }
        out.extend_from_slice(&self.auth.fee.to_be_bytes());
        out.extend_from_slice(&self.auth.nonce.to_be_bytes());
        out
    }

    fn static_validate(&self) -> Result<(), TxError> {
        if self.symbol.is_empty() || self.name.is_empty() {
            return Err(TxError::InvalidStructure("empty token symbol or name"));
        }
        if self.initial_balances.is_empty() {
            return Err(TxError::InvalidStructure("token without initial balances"));
        }
        if self.auth.derived_address() != self.addr_from {
            return Err(TxError::InvalidSignature);
        }
        self.auth.verify_signature(&hash_with_pubhash(&self.hashable_bytes(), &self.auth))
    }

    fn apply(&self, overlay: &mut StateOverlay, _ctx: &BlockContext) -> Result<(), TxError> {
        apply_spend(overlay, self.addr_from, &self.auth, self.auth.fee)?;
        let token_id = hash_with_pubhash(&self.hashable_bytes(), &self.auth);
        for (addr, amount) in &self.initial_balances {
            overlay.load_mut(*addr)?.credit_token(token_id, *amount);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Token transfer
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferTokenTx {
    pub addr_from: Address,
    pub addr_to: Address,
    pub token_txhash: Hash32,
    pub amount: u64,
    pub auth: TxAuth,
}

impl TransactionOps for TransferTokenTx {
    fn hashable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"transfer_token");
        out.extend_from_slice(self.addr_from.as_bytes());
        out.extend_from_slice(self.addr_to.as_bytes());
        out.extend_from_slice(&self.token_txhash);
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(&self.auth.fee.to_be_bytes());
        out.extend_from_slice(&self.auth.nonce.to_be_bytes());
        out
    }

    fn static_validate(&self) -> Result<(), TxError> {
        if self.amount == 0 {
            return Err(TxError::InvalidStructure("zero-amount token transfer"));
        }
        if self.auth.derived_address() != self.addr_from {
            return Err(TxError::InvalidSignature);
        }
        self.auth.verify_signature(&hash_with_pubhash(&self.hashable_bytes(), &self.auth))
    }

    fn apply(&self, overlay: &mut StateOverlay, _ctx: &BlockContext) -> Result<(), TxError> {
        // Token units move between the per-address token maps; the fee is
        // paid in coins.
        let available = overlay.get(&self.addr_from)?.token_balance(&self.token_txhash);
        if available < self.amount {
            return Err(TxError::InsufficientTokenBalance {
                required: self.amount,
                available,
            });
        }
        apply_spend(overlay, self.addr_from, &self.auth, self.auth.fee)?;
        let src = overlay.load_mut(self.addr_from)?;
        *src.tokens.entry(self.token_txhash).or_insert(0) -= self.amount;
        overlay
            .load_mut(self.addr_to)?
            .credit_token(self.token_txhash, self.amount);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stake
// ---------------------------------------------------------------------------

/// Stake declaration. The commitment payload is opaque to consensus; what
/// matters here is the fee, the minimum-balance rule and the OTS burn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StakeTx {
    pub addr_from: Address,
    pub commitment: Vec<u8>,
    /// Epoch the declaration targets: `block_number / blocks_per_epoch`.
    pub epoch: u64,
    pub auth: TxAuth,
}

impl TransactionOps for StakeTx {
    fn hashable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"stake");
        out.extend_from_slice(self.addr_from.as_bytes());
        out.extend_from_slice(&self.commitment);
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&self.auth.fee.to_be_bytes());
        out.extend_from_slice(&self.auth.nonce.to_be_bytes());
        out
    }

    fn static_validate(&self) -> Result<(), TxError> {
        if self.commitment.is_empty() {
            return Err(TxError::InvalidStructure("empty stake commitment"));
        }
        if self.auth.derived_address() != self.addr_from {
            return Err(TxError::InvalidSignature);
        }
        self.auth.verify_signature(&hash_with_pubhash(&self.hashable_bytes(), &self.auth))
    }

    fn apply(&self, overlay: &mut StateOverlay, ctx: &BlockContext) -> Result<(), TxError> {
        if self.epoch != ctx.block_number / ctx.blocks_per_epoch.max(1) {
            return Err(TxError::InvalidStructure("stake declared for a different epoch"));
        }
        let balance = overlay.get(&self.addr_from)?.balance;
        let required = ctx
            .min_stake_balance
            .checked_add(self.auth.fee)
            .ok_or(TxError::MathOverflow)?;
        if balance < required {
            return Err(TxError::InsufficientFunds { required, available: balance });
        }
        apply_spend(overlay, self.addr_from, &self.auth, self.auth.fee)
    }
}

// ---------------------------------------------------------------------------
// The tagged sum
// ---------------------------------------------------------------------------

// Externally tagged so both the JSON wire form and the bincode disk form
// round-trip through the same derive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transaction {
    Transfer(TransferTx),
    Coinbase(CoinbaseTx),
    Token(TokenTx),
    TransferToken(TransferTokenTx),
    Stake(StakeTx),
}

fn hash_with_pubhash(hashable: &[u8], auth: &TxAuth) -> Hash32 {
    let mut input = Vec::with_capacity(hashable.len() + 32);
    input.extend_from_slice(hashable);
    input.extend_from_slice(&auth.pubhash());
    sha2_256(&input)
}

impl Transaction {
    fn ops(&self) -> &dyn TransactionOps {
        match self {
            Transaction::Transfer(tx) => tx,
            Transaction::Coinbase(tx) => tx,
            Transaction::Token(tx) => tx,
            Transaction::TransferToken(tx) => tx,
            Transaction::Stake(tx) => tx,
        }
    }

    pub fn auth(&self) -> Option<&TxAuth> {
        match self {
            Transaction::Transfer(tx) => Some(&tx.auth),
            Transaction::Coinbase(_) => None,
            Transaction::Token(tx) => Some(&tx.auth),
            Transaction::TransferToken(tx) => Some(&tx.auth),
            Transaction::Stake(tx) => Some(&tx.auth),
        }
    }

    fn auth_mut(&mut self) -> Option<&mut TxAuth> {
        match self {
            Transaction::Transfer(tx) => Some(&mut tx.auth),
            Transaction::Coinbase(_) => None,
            Transaction::Token(tx) => Some(&mut tx.auth),
            Transaction::TransferToken(tx) => Some(&mut tx.auth),
            Transaction::Stake(tx) => Some(&mut tx.auth),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, Transaction::Coinbase(_))
    }

    /// Content hash; commits to the canonical fields and, for signed
    /// variants, to the (public key, OTS leaf) pair.
    pub fn txhash(&self) -> Hash32 {
        match self.auth() {
            Some(auth) => hash_with_pubhash(&self.ops().hashable_bytes(), auth),
            None => sha2_256(&self.ops().hashable_bytes()),
        }
    }

    pub fn fee(&self) -> u64 {
        self.auth().map(|a| a.fee).unwrap_or(0)
    }

    pub fn addr_from(&self) -> Option<Address> {
        match self {
            Transaction::Transfer(tx) => Some(tx.addr_from),
            Transaction::Coinbase(_) => None,
            Transaction::Token(tx) => Some(tx.addr_from),
            Transaction::TransferToken(tx) => Some(tx.addr_from),
            Transaction::Stake(tx) => Some(tx.addr_from),
        }
    }

    pub fn static_validate(&self) -> Result<(), TxError> {
        self.ops().static_validate()
    }

    pub fn apply(&self, overlay: &mut StateOverlay, ctx: &BlockContext) -> Result<(), TxError> {
        self.ops().apply(overlay, ctx)
    }

    /// Sign in place with `ots_index = auth.ots_key`. No-op for coinbase.
    pub fn sign(&mut self, keypair: &XmssKeypair) -> Result<(), TxError> {
        let txhash = self.txhash();
        if let Some(auth) = self.auth_mut() {
            let sig = keypair
                .sign(&txhash, auth.ots_key)
                .ok_or(TxError::InvalidStructure("ots index beyond tree height"))?;
            auth.signature = sig.to_bytes();
        }
        Ok(())
    }
}

/// Validate a sender's balance/nonce/OTS against a bare state without
/// mutating anything; used by pool admission.
pub fn check_against_state(tx: &Transaction, state: &AddressState) -> Result<(), TxError> {
    let auth = match tx.auth() {
        Some(auth) => auth,
        None => return Ok(()),
    };
    let required = match tx {
        Transaction::Transfer(t) => t.amount.checked_add(auth.fee).ok_or(TxError::MathOverflow)?,
        _ => auth.fee,
    };
    if state.balance < required {
        return Err(TxError::InsufficientFunds { required, available: state.balance });
    }
    if let Transaction::TransferToken(t) = tx {
        let available = state.token_balance(&t.token_txhash);
        if available < t.amount {
            return Err(TxError::InsufficientTokenBalance { required: t.amount, available });
        }
    }
    let expected = state.nonce + 1;
    if auth.nonce != expected {
        return Err(TxError::NonceMismatch { expected, got: auth.nonce });
    }
    if state.ots_bitfield.is_used(auth.ots_key) {
        return Err(TxError::OtsReused(auth.ots_key));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StateStore;

    fn test_keypair(tag: u8) -> XmssKeypair {
        XmssKeypair::from_seed(4, [tag; 32])
    }

    fn test_address(tag: u8) -> Address {
        Address::from_public_key(&test_keypair(tag).public_key())
    }

    fn ctx() -> BlockContext {
        BlockContext {
            block_number: 1,
            stake_selector: test_address(0xEE),
            fixed_reward: 50,
            total_fees: 0,
            min_stake_balance: 1000,
            blocks_per_epoch: 100,
        }
    }

    fn signed_transfer(
        from: &XmssKeypair,
        to: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
        ots: u64,
    ) -> Transaction {
        let mut tx = Transaction::Transfer(TransferTx::create(
            to,
            amount,
            fee,
            nonce,
            from.public_key(),
            ots,
        ));
        tx.sign(from).unwrap();
        tx
    }

    fn fund(store: &StateStore, address: Address, balance: u64) {
        let mut state = AddressState::get_default(address);
        state.balance = balance;
        let mut batch = store.new_batch();
        store.put_address_state(&state, &mut batch).unwrap();
        store.commit(batch).unwrap();
    }

    #[test]
    fn test_transfer_validate_and_apply() {
        let alice = test_keypair(1);
        let bob = test_address(2);
        let store = StateStore::open_temporary().unwrap();
        fund(&store, Address::from_public_key(&alice.public_key()), 1_000);

        let tx = signed_transfer(&alice, bob, 100, 1, 1, 0);
        tx.static_validate().unwrap();

        let mut overlay = StateOverlay::new(&store);
        tx.apply(&mut overlay, &ctx()).unwrap();

        let alice_addr = Address::from_public_key(&alice.public_key());
        let src = overlay.get(&alice_addr).unwrap();
        assert_eq!(src.balance, 899);
        assert_eq!(src.nonce, 1);
        assert!(src.ots_bitfield.is_used(0));
        assert_eq!(overlay.get(&bob).unwrap().balance, 100);
    }

    #[test]
    fn test_zero_amount_transfer_rejected() {
        let alice = test_keypair(1);
        let tx = signed_transfer(&alice, test_address(2), 0, 1, 1, 0);
        assert!(matches!(
            tx.static_validate(),
            Err(TxError::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_tampered_amount_breaks_signature() {
        let alice = test_keypair(1);
        let mut tx = signed_transfer(&alice, test_address(2), 100, 1, 1, 0);
        if let Transaction::Transfer(ref mut t) = tx {
            t.amount = 200;
        }
        assert!(matches!(tx.static_validate(), Err(TxError::InvalidSignature)));
    }

    #[test]
    fn test_nonce_mismatch_rejected() {
        let alice = test_keypair(1);
        let store = StateStore::open_temporary().unwrap();
        fund(&store, Address::from_public_key(&alice.public_key()), 1_000);

        let tx = signed_transfer(&alice, test_address(2), 10, 1, 5, 0);
        let mut overlay = StateOverlay::new(&store);
        assert!(matches!(
            tx.apply(&mut overlay, &ctx()),
            Err(TxError::NonceMismatch { expected: 1, got: 5 })
        ));
    }

    #[test]
    fn test_ots_reuse_rejected() {
        let alice = test_keypair(1);
        let store = StateStore::open_temporary().unwrap();
        fund(&store, Address::from_public_key(&alice.public_key()), 1_000);

        let mut overlay = StateOverlay::new(&store);
        signed_transfer(&alice, test_address(2), 10, 1, 1, 3)
            .apply(&mut overlay, &ctx())
            .unwrap();
        let err = signed_transfer(&alice, test_address(2), 10, 1, 2, 3)
            .apply(&mut overlay, &ctx())
            .unwrap_err();
        assert!(matches!(err, TxError::OtsReused(3)));
    }

    #[test]
    fn test_insufficient_funds_rejected() {
        let alice = test_keypair(1);
        let store = StateStore::open_temporary().unwrap();
        fund(&store, Address::from_public_key(&alice.public_key()), 50);

        let tx = signed_transfer(&alice, test_address(2), 100, 1, 1, 0);
        let mut overlay = StateOverlay::new(&store);
        assert!(matches!(
            tx.apply(&mut overlay, &ctx()),
            Err(TxError::InsufficientFunds { required: 101, available: 50 })
        ));
    }

    #[test]
    fn test_token_create_and_transfer() {
        let alice = test_keypair(1);
        let alice_addr = Address::from_public_key(&alice.public_key());
        let bob = test_address(2);
        let store = StateStore::open_temporary().unwrap();
        fund(&store, alice_addr, 1_000);

        let mut create = Transaction::Token(TokenTx {
            addr_from: alice_addr,
            symbol: "QT".into(),
            name: "Quantum Token".into(),
            decimals: 2,
            initial_balances: vec![(alice_addr, 10_000)],
            auth: TxAuth {
                public_key: alice.public_key(),
                ots_key: 0,
                nonce: 1,
                fee: 5,
                signature: Vec::new(),
            },
        });
        create.sign(&alice).unwrap();
        create.static_validate().unwrap();
        let token_id = create.txhash();

        let mut overlay = StateOverlay::new(&store);
        create.apply(&mut overlay, &ctx()).unwrap();
        assert_eq!(overlay.get(&alice_addr).unwrap().token_balance(&token_id), 10_000);

        let mut send = Transaction::TransferToken(TransferTokenTx {
            addr_from: alice_addr,
            addr_to: bob,
            token_txhash: token_id,
            amount: 2_500,
            auth: TxAuth {
                public_key: alice.public_key(),
                ots_key: 1,
                nonce: 2,
                fee: 5,
                signature: Vec::new(),
            },
        });
        send.sign(&alice).unwrap();
        send.static_validate().unwrap();
        send.apply(&mut overlay, &ctx()).unwrap();

        assert_eq!(overlay.get(&alice_addr).unwrap().token_balance(&token_id), 7_500);
        assert_eq!(overlay.get(&bob).unwrap().token_balance(&token_id), 2_500);
    }

    #[test]
    fn test_stake_requires_minimum_balance() {
        let alice = test_keypair(1);
        let alice_addr = Address::from_public_key(&alice.public_key());
        let store = StateStore::open_temporary().unwrap();
        fund(&store, alice_addr, 500); // below min_stake_balance of 1000

        let mut tx = Transaction::Stake(StakeTx {
            addr_from: alice_addr,
            commitment: vec![0xAA; 32],
            epoch: 0,
            auth: TxAuth {
                public_key: alice.public_key(),
                ots_key: 0,
                nonce: 1,
                fee: 1,
                signature: Vec::new(),
            },
        });
        tx.sign(&alice).unwrap();

        let mut overlay = StateOverlay::new(&store);
        assert!(matches!(
            tx.apply(&mut overlay, &ctx()),
            Err(TxError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_serde_roundtrips_preserve_hash() {
        let alice = test_keypair(1);
        let tx = signed_transfer(&alice, test_address(2), 100, 1, 1, 0);

        let json = serde_json::to_string(&tx).unwrap();
        let from_json: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, from_json);
        assert_eq!(tx.txhash(), from_json.txhash());

        let bin = bincode::serialize(&tx).unwrap();
        let from_bin: Transaction = bincode::deserialize(&bin).unwrap();
        assert_eq!(tx.txhash(), from_bin.txhash());
    }
}

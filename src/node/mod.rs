//! The node core and its event loop.
//!
//! One task owns the [`Core`] (store, chain manager, pool, miner, gossip
//! tracker, sync tracker, peer table) and dispatches an explicit event
//! enum. Peer reader tasks, pull-timeout timers, the miner worker and the
//! API server all communicate with it through the same channel, so every
//! consensus mutation is serialized and deterministic in arrival order.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use primitive_types::U256;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::QrldConfig;
use crate::consensus::chain::{BlockDisposition, ChainError, ChainManager};
use crate::consensus::mempool::{PoolError, TransactionPool};
use crate::core::address::{Address, AddressError, AddressState};
use crate::core::block::Block;
use crate::core::metadata::BlockMetadata;
use crate::core::transaction::{Transaction, TxError};
use crate::crypto::Hash32;
use crate::miner::Miner;
use crate::network::gossip::{MessageReceiptTracker, PeerId, PullRequest, ReceiptOutcome};
use crate::network::peer::{spawn_peer_tasks, PeerChannel, PeerInfo, STRIKE_LIMIT};
use crate::network::protocol::{
    FullMessageRequest, HeightData, NetMessage, ReceiptData, ReceiptType, VersionData,
    PROTOCOL_VERSION,
};
use crate::network::sync::{SyncAction, SyncState, SyncTracker};
use crate::storage::{StateStore, StorageError};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything that can wake the event loop.
pub enum Event {
    PeerConnected { channel: PeerChannel, outbound: bool },
    PeerDisconnected { peer: PeerId },
    PeerMessage { peer: PeerId, msg: NetMessage },
    PeerMisbehaved { peer: PeerId, reason: &'static str },
    /// A pull deadline armed for (hash, seq) expired.
    PullTimeout { hash: Hash32, seq: u64 },
    /// Periodic housekeeping: pings, height exchange, sync evaluation.
    SyncTick,
    /// The nonce search succeeded.
    MinedBlock(Box<Block>),
    Api(ApiRequest),
}

/// Requests from the HTTP surface, answered through oneshots so the API
/// server never touches consensus state directly.
pub enum ApiRequest {
    KnownPeers { respond: oneshot::Sender<Vec<String>> },
    AddressState { address: Address, respond: oneshot::Sender<Option<AddressState>> },
    BlockByNumber { number: u64, respond: oneshot::Sender<Option<(Block, BlockMetadata)>> },
    BlockTemplate { wallet: Address, respond: oneshot::Sender<Result<(Block, U256), String>> },
    SubmitBlock { block: Box<Block>, respond: oneshot::Sender<Result<bool, String>> },
    SubmitTransaction { tx: Box<Transaction>, respond: oneshot::Sender<Result<Hash32, String>> },
}

struct PeerEntry {
    channel: PeerChannel,
    info: PeerInfo,
}

pub struct Core {
    config: QrldConfig,
    chain: ChainManager,
    pool: TransactionPool,
    miner: Miner,
    mr: MessageReceiptTracker,
    sync: SyncTracker,
    peers: std::collections::HashMap<PeerId, PeerEntry>,
    known_peers: Vec<String>,
    events: mpsc::UnboundedSender<Event>,
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Core {
    pub fn new(
        config: QrldConfig,
        store: Arc<StateStore>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Self, NodeError> {
        let mut chain = ChainManager::new(Arc::clone(&store), config.chain_params());
        let genesis = config.genesis_block()?;
        chain.load(genesis)?;

        let mining_address = if config.mining.enabled {
            Address::from_qstring(&config.mining.mining_address)?
        } else {
            // placeholder, never used while mining is off
            Address::from_public_key(&[])
        };

        let known_peers = store.get_peer_list()?;
        let now = now_secs();
        Ok(Self {
            pool: TransactionPool::new(
                config.security.pool_size_cap,
                1u64 << config.genesis.xmss_tree_height,
            ),
            miner: Miner::new(mining_address, events.clone()),
            mr: MessageReceiptTracker::new(config.security.receipt_cache_size),
            sync: SyncTracker::new(
                config.security.sync_grace_secs,
                config.security.stale_watchdog_secs,
                now,
            ),
            peers: std::collections::HashMap::new(),
            known_peers,
            events,
            chain,
            config,
        })
    }

    pub fn chain(&self) -> &ChainManager {
        &self.chain
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    fn local_height(&self) -> HeightData {
        HeightData {
            block_number: self.chain.height(),
            headerhash: self
                .chain
                .tip()
                .map(|b| b.header_hash())
                .unwrap_or([0u8; 32]),
        }
    }

    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::PeerConnected { channel, outbound } => self.on_peer_connected(channel, outbound),
            Event::PeerDisconnected { peer } => self.on_peer_disconnected(peer),
            Event::PeerMessage { peer, msg } => self.on_peer_message(peer, msg).await,
            Event::PeerMisbehaved { peer, reason } => self.strike(peer, reason),
            Event::PullTimeout { hash, seq } => {
                if let Some(pull) = self.mr.on_pull_timeout(hash, seq) {
                    self.send_pull(pull);
                }
            }
            Event::SyncTick => self.on_sync_tick().await,
            Event::MinedBlock(block) => {
                info!(height = block.block_number(), "mined block found, ingesting");
                self.ingest_block(None, *block).await;
            }
            Event::Api(request) => self.on_api_request(request).await,
        }
    }

    // -- peers -----------------------------------------------------------

    fn on_peer_connected(&mut self, channel: PeerChannel, outbound: bool) {
        if self.peers.len() >= self.config.network.max_peers {
            warn!(addr = %channel.addr, "peer table full, dropping connection");
            return;
        }
        let id = channel.id;
        let addr = channel.addr;
        info!(peer = id, %addr, outbound, "peer connected");

        channel.send(NetMessage::Version(VersionData {
            version: PROTOCOL_VERSION,
            genesis_prev_headerhash: self.config.genesis_prev_headerhash(),
        }));
        channel.send(NetMessage::BlockHeight(self.local_height()));
        channel.send(NetMessage::RequestPeers);

        if outbound {
            let addr_str = addr.to_string();
            if !self.known_peers.contains(&addr_str) {
                self.known_peers.push(addr_str);
                self.persist_peers();
            }
        }
        self.peers.insert(id, PeerEntry { channel, info: PeerInfo::new(addr) });
    }

    fn on_peer_disconnected(&mut self, peer: PeerId) {
        if self.peers.remove(&peer).is_some() {
            info!(peer, "peer disconnected");
        }
        self.mr.peer_disconnected(peer);
        self.sync.on_peer_gone(peer);
    }

    fn strike(&mut self, peer: PeerId, reason: &'static str) {
        let drop_now = if let Some(entry) = self.peers.get_mut(&peer) {
            entry.info.strikes += 1;
            warn!(peer, reason, strikes = entry.info.strikes, "peer penalized");
            entry.info.strikes >= STRIKE_LIMIT
        } else {
            false
        };
        // structural violations close immediately
        if drop_now || reason == "undecodable payload" || reason == "genesis mismatch" {
            self.on_peer_disconnected(peer);
        }
    }

    fn persist_peers(&self) {
        if let Err(err) = self.chain.store().put_peer_list(&self.known_peers) {
            warn!("failed to persist peer list: {err}");
        }
    }

    fn send_to(&self, peer: PeerId, msg: NetMessage) {
        if let Some(entry) = self.peers.get(&peer) {
            entry.channel.send(msg);
        }
    }

    fn send_pull(&mut self, pull: PullRequest) {
        debug!(peer = pull.peer, hash = %hex::encode(pull.hash), "requesting full message");
        self.send_to(
            pull.peer,
            NetMessage::SendFullMessage(FullMessageRequest {
                hash: pull.hash,
                msg_type: pull.msg_type,
            }),
        );
        let events = self.events.clone();
        let timeout = Duration::from_millis(self.config.network.receipt_timeout_ms);
        let (hash, seq) = (pull.hash, pull.seq);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::PullTimeout { hash, seq });
        });
    }

    /// Announce a payload hash to every connected peer that neither
    /// announced it to us nor received our receipt already.
    fn broadcast_receipt(&mut self, hash: Hash32, msg_type: ReceiptType, exclude: &HashSet<PeerId>) {
        let targets: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(id, entry)| entry.info.handshaked && !exclude.contains(id))
            .map(|(id, _)| *id)
            .collect();
        for peer in targets {
            if self.mr.mark_announced(peer, hash) {
                self.send_to(
                    peer,
                    NetMessage::MessageReceipt(ReceiptData { hash, msg_type, extra: None }),
                );
            }
        }
    }

    // -- message dispatch ------------------------------------------------

    async fn on_peer_message(&mut self, peer: PeerId, msg: NetMessage) {
        if let Some(entry) = self.peers.get_mut(&peer) {
            entry.info.last_seen = now_secs();
        } else {
            return;
        }

        match msg {
            NetMessage::Version(v) => {
                if v.genesis_prev_headerhash != self.config.genesis_prev_headerhash() {
                    self.strike(peer, "genesis mismatch");
                    return;
                }
                if let Some(entry) = self.peers.get_mut(&peer) {
                    entry.info.version = v.version;
                    entry.info.handshaked = true;
                }
            }
            NetMessage::MessageReceipt(r) => {
                // tx gossip only matters once we track the tip
                if r.msg_type != ReceiptType::Block && self.sync.state() != SyncState::Synced {
                    return;
                }
                if let ReceiptOutcome::Pull(pull) = self.mr.on_receipt(r.hash, r.msg_type, peer) {
                    self.send_pull(pull);
                }
            }
            NetMessage::SendFullMessage(req) => {
                if let Some(payload) = self.mr.get_payload(&req.hash, req.msg_type) {
                    let payload = payload.clone();
                    self.mr.mark_announced(peer, req.hash);
                    self.send_to(peer, payload);
                }
            }
            NetMessage::Block(block) => self.on_block_payload(peer, *block).await,
            NetMessage::PushBlock(block) => self.on_block_payload(peer, *block).await,
            NetMessage::Transfer(tx) => self.on_tx_payload(peer, *tx, ReceiptType::Transfer),
            NetMessage::Stake(tx) => self.on_tx_payload(peer, *tx, ReceiptType::Stake),
            NetMessage::FetchBlock(number) => match self.chain.get_block_by_number(number) {
                Ok(Some(block)) => self.send_to(peer, NetMessage::PushBlock(Box::new(block))),
                Ok(None) => debug!(peer, number, "FB for unknown height"),
                Err(err) => warn!("FB lookup failed: {err}"),
            },
            NetMessage::FetchHeader(number) => {
                if let Ok(Some(block)) = self.chain.get_block_by_number(number) {
                    self.send_to(
                        peer,
                        NetMessage::PushHeader(HeightData {
                            block_number: number,
                            headerhash: block.header_hash(),
                        }),
                    );
                }
            }
            NetMessage::PushHeader(hd) => self.on_push_header(peer, hd),
            NetMessage::BlockHeight(hd) => {
                self.sync
                    .on_peer_report(peer, hd, self.chain.height(), now_secs());
                self.record_peer_height(peer, hd);
                let local = self.local_height();
                self.send_to(peer, NetMessage::BlockHeightReply(local));
                self.evaluate_sync().await;
            }
            NetMessage::BlockHeightReply(hd) | NetMessage::PushMaxBlockHeight(hd) => {
                self.sync
                    .on_peer_report(peer, hd, self.chain.height(), now_secs());
                self.record_peer_height(peer, hd);
                self.evaluate_sync().await;
            }
            NetMessage::FetchMaxBlockHeight => {
                let reply = self
                    .sync
                    .majority_report()
                    .map(|(data, _)| data)
                    .unwrap_or_else(|| self.local_height());
                self.send_to(peer, NetMessage::PushMaxBlockHeight(reply));
            }
            NetMessage::PeerList(addrs) => {
                let mut changed = false;
                for addr in addrs {
                    if self.known_peers.len() >= 256 {
                        break;
                    }
                    if addr.parse::<SocketAddr>().is_ok() && !self.known_peers.contains(&addr) {
                        self.known_peers.push(addr);
                        changed = true;
                    }
                }
                if changed {
                    self.persist_peers();
                }
            }
            NetMessage::RequestPeers => {
                let list = self.known_peers.clone();
                self.send_to(peer, NetMessage::PeerList(list));
            }
            NetMessage::Ping(_) => self.send_to(peer, NetMessage::Pong("NG".to_string())),
            NetMessage::Pong(_) => {}
        }
    }

    fn record_peer_height(&mut self, peer: PeerId, hd: HeightData) {
        if let Some(entry) = self.peers.get_mut(&peer) {
            entry.info.chain_height = hd.block_number;
            entry.info.chain_headerhash = hd.headerhash;
        }
    }

    fn on_push_header(&mut self, peer: PeerId, hd: HeightData) {
        // Fork-recovery ancestor walk: matching header means common
        // ancestor, re-request blocks from there; otherwise keep walking
        // back.
        match self.chain.get_block_by_number(hd.block_number) {
            Ok(Some(ours)) if ours.header_hash() == hd.headerhash => {
                let from = hd.block_number + 1;
                let to = from + self.config.network.sync_batch - 1;
                debug!(peer, from, to, "common ancestor found, re-requesting blocks");
                for number in from..=to {
                    self.send_to(peer, NetMessage::FetchBlock(number));
                }
            }
            _ => {
                if hd.block_number > 0 {
                    self.send_to(peer, NetMessage::FetchHeader(hd.block_number - 1));
                }
            }
        }
    }

    // -- payload handling ------------------------------------------------

    async fn on_block_payload(&mut self, peer: PeerId, block: Block) {
        self.ingest_block(Some(peer), block).await;
    }

    fn on_tx_payload(&mut self, peer: PeerId, tx: Transaction, msg_type: ReceiptType) {
        let txhash = tx.txhash();
        // already on chain? silent drop
        if matches!(self.chain.store().get_tx_mapping(&txhash), Ok(Some(_))) {
            return;
        }
        let Some(address) = tx.addr_from() else {
            self.strike(peer, "coinbase gossiped as transaction");
            return;
        };
        let sender_state = match self.chain.address_state(&address) {
            Ok(state) => state,
            Err(err) => {
                warn!("state lookup failed: {err}");
                return;
            }
        };

        let wire = match msg_type {
            ReceiptType::Stake => NetMessage::Stake(Box::new(tx.clone())),
            _ => NetMessage::Transfer(Box::new(tx.clone())),
        };
        let mut exclude: HashSet<PeerId> =
            self.mr.on_payload(txhash, msg_type, wire).into_iter().collect();
        exclude.insert(peer);

        match self.pool.admit(tx, &sender_state) {
            Ok(()) => {
                debug!(hash = %hex::encode(txhash), "transaction admitted to pool");
                self.broadcast_receipt(txhash, msg_type, &exclude);
            }
            Err(PoolError::Invalid(TxError::InvalidSignature)) => {
                self.strike(peer, "invalid transaction signature");
            }
            Err(PoolError::Duplicate) => {}
            Err(err) => debug!("transaction rejected: {err}"),
        }
    }

    /// Shared ingest for peer blocks, sync replies and mined blocks.
    async fn ingest_block(&mut self, from: Option<PeerId>, block: Block) {
        let hash = block.header_hash();
        match self.chain.add_block(block.clone()).await {
            Ok(disposition) => {
                self.sync.note_progress(now_secs());
                let mut exclude: HashSet<PeerId> = self
                    .mr
                    .on_payload(hash, ReceiptType::Block, NetMessage::Block(Box::new(block.clone())))
                    .into_iter()
                    .collect();
                if let Some(peer) = from {
                    exclude.insert(peer);
                }

                match disposition {
                    BlockDisposition::Tip { included_txs, abandoned_txs, reorged } => {
                        // included_txs spans every block that became
                        // main-chain here: the ingested block, reorged-in
                        // branch blocks, and resolved orphans.
                        self.pool.remove_included(&included_txs);
                        if reorged {
                            // A branch switch made other blocks canonical;
                            // sweep out anything their state supersedes,
                            // then offer the abandoned branch back.
                            let chain = &self.chain;
                            let purged = self.pool.purge_stale(|addr| {
                                chain
                                    .address_state(addr)
                                    .unwrap_or_else(|_| AddressState::get_default(*addr))
                            });
                            let requeued = self.pool.requeue(abandoned_txs, |addr| {
                                chain
                                    .address_state(addr)
                                    .unwrap_or_else(|_| AddressState::get_default(*addr))
                            });
                            info!(purged, requeued, "pool reconciled after reorg");
                        }
                        if self.config.mining.enabled {
                            if let Err(err) = self.miner.restart(&self.chain, &self.pool) {
                                warn!("miner restart failed: {err}");
                            }
                        }
                    }
                    BlockDisposition::Alternate => {}
                    BlockDisposition::Orphan => {
                        // ask the sender for the missing parent
                        if let Some(peer) = from {
                            let parent_number = block.block_number().saturating_sub(1);
                            self.send_to(peer, NetMessage::FetchBlock(parent_number));
                        }
                    }
                }
                self.broadcast_receipt(hash, ReceiptType::Block, &exclude);
            }
            Err(ChainError::Duplicate) => {}
            Err(err) => {
                warn!(hash = %hex::encode(hash), "block rejected: {err}");
                if let Some(peer) = from {
                    let penalize = matches!(
                        err,
                        ChainError::InvalidPoW | ChainError::Tx(TxError::InvalidSignature)
                    );
                    if penalize {
                        self.strike(peer, "invalid block");
                    }
                }
            }
        }
    }

    // -- housekeeping ----------------------------------------------------

    async fn on_sync_tick(&mut self) {
        let now = now_secs();

        // drop silent peers, ping the rest, exchange heights
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, e)| now - e.info.last_seen > self.config.network.peer_timeout_secs)
            .map(|(id, _)| *id)
            .collect();
        for peer in stale {
            info!(peer, "peer timed out");
            self.on_peer_disconnected(peer);
        }

        let local = self.local_height();
        for entry in self.peers.values() {
            if entry.info.handshaked {
                entry.channel.send(NetMessage::Ping("NG".to_string()));
                entry.channel.send(NetMessage::BlockHeight(local));
            }
        }

        self.evaluate_sync().await;

        // keep the miner grinding even if no event restarted it
        if self.config.mining.enabled && self.sync.state() == SyncState::Synced {
            if let Err(err) = self.miner.restart(&self.chain, &self.pool) {
                warn!("miner restart failed: {err}");
            }
        }
    }

    async fn evaluate_sync(&mut self) {
        let local = self.local_height();
        match self.sync.evaluate(local, now_secs()) {
            SyncAction::Download { target } => {
                // pull the gap from a peer that actually reported the
                // target branch
                let source = self
                    .peers
                    .iter()
                    .find(|(_, e)| e.info.chain_headerhash == target.headerhash)
                    .or_else(|| self.peers.iter().find(|(_, e)| e.info.chain_height >= target.block_number))
                    .map(|(id, _)| *id);
                if let Some(peer) = source {
                    let from = local.block_number + 1;
                    let to = target
                        .block_number
                        .min(local.block_number + self.config.network.sync_batch);
                    debug!(peer, from, to, "requesting block backfill");
                    for number in from..=to {
                        self.send_to(peer, NetMessage::FetchBlock(number));
                    }
                }
            }
            SyncAction::ForkRecovery { peer_height } => {
                // start the ancestor walk just below the disputed height
                let probe = peer_height.saturating_sub(1);
                let targets: Vec<PeerId> = self.peers.keys().copied().collect();
                info!(probe, "fork detected, walking back to a common ancestor");
                for peer in targets {
                    self.send_to(peer, NetMessage::FetchHeader(probe));
                }
            }
            SyncAction::None => {}
        }
    }

    // -- api -------------------------------------------------------------

    async fn on_api_request(&mut self, request: ApiRequest) {
        match request {
            ApiRequest::KnownPeers { respond } => {
                let mut list = self.known_peers.clone();
                for entry in self.peers.values() {
                    let addr = entry.info.addr.to_string();
                    if !list.contains(&addr) {
                        list.push(addr);
                    }
                }
                let _ = respond.send(list);
            }
            ApiRequest::AddressState { address, respond } => {
                let state = self.chain.store().get_address_state(&address).ok().flatten();
                let _ = respond.send(state);
            }
            ApiRequest::BlockByNumber { number, respond } => {
                let result = match self.chain.get_block_by_number(number) {
                    Ok(Some(block)) => {
                        let hh = block.header_hash();
                        self.chain
                            .store()
                            .get_block_metadata(&hh)
                            .ok()
                            .flatten()
                            .map(|meta| (block, meta))
                    }
                    _ => None,
                };
                let _ = respond.send(result);
            }
            ApiRequest::BlockTemplate { wallet, respond } => {
                let result = crate::miner::build_candidate(&self.chain, &self.pool, wallet)
                    .map(|(block, difficulty, _)| (block, difficulty))
                    .map_err(|e| e.to_string());
                let _ = respond.send(result);
            }
            ApiRequest::SubmitBlock { block, respond } => {
                let hash = block.header_hash();
                self.ingest_block(None, *block).await;
                let accepted = matches!(self.chain.store().get_block(&hash), Ok(Some(_)));
                let _ = respond.send(Ok(accepted));
            }
            ApiRequest::SubmitTransaction { tx, respond } => {
                let result = self.submit_local_transaction(*tx);
                let _ = respond.send(result);
            }
        }
    }

    /// Admission path for transactions born on this node (wallet/API).
    pub fn submit_local_transaction(&mut self, tx: Transaction) -> Result<Hash32, String> {
        let Some(address) = tx.addr_from() else {
            return Err("coinbase cannot be submitted".to_string());
        };
        let sender_state = self
            .chain
            .address_state(&address)
            .map_err(|e| e.to_string())?;
        let txhash = tx.txhash();
        let msg_type = match tx {
            Transaction::Stake(_) => ReceiptType::Stake,
            _ => ReceiptType::Transfer,
        };
        let wire = match msg_type {
            ReceiptType::Stake => NetMessage::Stake(Box::new(tx.clone())),
            _ => NetMessage::Transfer(Box::new(tx.clone())),
        };
        self.pool
            .admit(tx, &sender_state)
            .map_err(|e| e.to_string())?;
        let exclude: HashSet<PeerId> =
            self.mr.on_payload(txhash, msg_type, wire).into_iter().collect();
        self.broadcast_receipt(txhash, msg_type, &exclude);
        Ok(txhash)
    }
}

/// Handle the API server (and tests) use to reach the event loop.
#[derive(Clone)]
pub struct NodeHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl NodeHandle {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self { events }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ApiRequest,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.events.send(Event::Api(build(tx))).ok()?;
        rx.await.ok()
    }

    pub async fn known_peers(&self) -> Option<Vec<String>> {
        self.request(|respond| ApiRequest::KnownPeers { respond }).await
    }

    pub async fn address_state(&self, address: Address) -> Option<Option<AddressState>> {
        self.request(|respond| ApiRequest::AddressState { address, respond })
            .await
    }

    pub async fn block_by_number(&self, number: u64) -> Option<Option<(Block, BlockMetadata)>> {
        self.request(|respond| ApiRequest::BlockByNumber { number, respond })
            .await
    }

    pub async fn block_template(&self, wallet: Address) -> Option<Result<(Block, U256), String>> {
        self.request(|respond| ApiRequest::BlockTemplate { wallet, respond })
            .await
    }

    pub async fn submit_block(&self, block: Block) -> Option<Result<bool, String>> {
        self.request(|respond| ApiRequest::SubmitBlock { block: Box::new(block), respond })
            .await
    }

    pub async fn submit_transaction(&self, tx: Transaction) -> Option<Result<Hash32, String>> {
        self.request(|respond| ApiRequest::SubmitTransaction { tx: Box::new(tx), respond })
            .await
    }
}

static PEER_ID_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_peer_id() -> PeerId {
    PEER_ID_SEQ.fetch_add(1, Ordering::Relaxed)
}

async fn dial_peer(addr: SocketAddr, events: mpsc::UnboundedSender<Event>) {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            let id = next_peer_id();
            let channel = spawn_peer_tasks(id, stream, addr, events.clone());
            let _ = events.send(Event::PeerConnected { channel, outbound: true });
        }
        Err(err) => warn!(%addr, "dial failed: {err}"),
    }
}

async fn listen_loop(listener: TcpListener, events: mpsc::UnboundedSender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let id = next_peer_id();
                let channel = spawn_peer_tasks(id, stream, addr, events.clone());
                if events
                    .send(Event::PeerConnected { channel, outbound: false })
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => warn!("accept failed: {err}"),
        }
    }
}

/// Bring the whole node up and pump the event loop until shutdown.
pub async fn run_node(config: QrldConfig) -> Result<(), NodeError> {
    config.validate().map_err(NodeError::Config)?;
    config.print_effective_config();

    let store = Arc::new(StateStore::open(&config.node.db_path)?);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut core = Core::new(config.clone(), store, events_tx.clone())?;

    if !config.node.no_network {
        let listen_addr: SocketAddr = format!("0.0.0.0:{}", config.node.p2p_port)
            .parse()
            .expect("static listen address");
        let listener = TcpListener::bind(listen_addr).await?;
        info!(%listen_addr, "p2p listener up");
        tokio::spawn(listen_loop(listener, events_tx.clone()));

        for addr_str in &config.network.bootstrap_nodes {
            if let Ok(addr) = addr_str.parse::<SocketAddr>() {
                tokio::spawn(dial_peer(addr, events_tx.clone()));
            } else {
                warn!(addr = %addr_str, "unparseable bootstrap address");
            }
        }
    }

    // periodic housekeeping
    {
        let events = events_tx.clone();
        let period = Duration::from_secs(config.network.ping_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if events.send(Event::SyncTick).is_err() {
                    break;
                }
            }
        });
    }

    // HTTP surface
    let handle = NodeHandle::new(events_tx.clone());
    let api_addr: SocketAddr = format!("0.0.0.0:{}", config.node.api_port)
        .parse()
        .expect("static api address");
    tokio::spawn(crate::api::serve(api_addr, handle));

    info!("node event loop running");
    while let Some(event) = events_rx.recv().await {
        core.handle_event(event).await;
    }
    Ok(())
}

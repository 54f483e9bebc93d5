//! Message-receipt gossip core.
//!
//! Peers announce content hashes (MR) instead of payloads; the payload is
//! pulled (SFM) from one announcer at a time with a timeout-driven retry
//! down the announcer list. The tracker enforces the protocol invariants:
//! at most one outstanding pull per hash, at most one receipt sent to a
//! given peer per hash, and idempotent payload delivery.
//!
//! The tracker owns no timers; the event loop arms a deadline for every
//! `PullRequest` it returns and feeds expiry back via `on_pull_timeout`.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::crypto::Hash32;
use crate::network::protocol::{NetMessage, ReceiptType};

pub type PeerId = u64;

/// Instruction to send one SFM to one peer.
#[derive(Debug, PartialEq)]
pub struct PullRequest {
    pub peer: PeerId,
    pub hash: Hash32,
    pub msg_type: ReceiptType,
    /// Discriminates this pull's deadline from earlier ones for the same
    /// hash; a stale timeout event must not advance the announcer walk.
    pub seq: u64,
}

#[derive(Debug)]
pub enum ReceiptOutcome {
    /// First time anyone announced this hash (or a pull slot opened up):
    /// pull it.
    Pull(PullRequest),
    /// Known payload, duplicate receipt, or a pull is already in flight.
    Ignored,
}

struct ReceiptEntry {
    msg_type: ReceiptType,
    /// Peers that announced the hash, in arrival order.
    announcers: Vec<PeerId>,
    /// Announcers we already tried.
    requested: HashSet<PeerId>,
    outstanding: Option<(PeerId, u64)>,
    payload: Option<NetMessage>,
}

pub struct MessageReceiptTracker {
    entries: HashMap<Hash32, ReceiptEntry>,
    /// Outbound dedup: hashes already announced to each peer.
    announced_to: HashMap<PeerId, HashSet<Hash32>>,
    /// Insertion order for cache eviction.
    order: VecDeque<Hash32>,
    capacity: usize,
    pull_seq: u64,
}

impl MessageReceiptTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            announced_to: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            pull_seq: 0,
        }
    }

    fn entry_mut(&mut self, hash: Hash32, msg_type: ReceiptType) -> &mut ReceiptEntry {
        if !self.entries.contains_key(&hash) {
            if self.order.len() >= self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
            self.order.push_back(hash);
            self.entries.insert(
                hash,
                ReceiptEntry {
                    msg_type,
                    announcers: Vec::new(),
                    requested: HashSet::new(),
                    outstanding: None,
                    payload: None,
                },
            );
        }
        self.entries.get_mut(&hash).unwrap()
    }

    /// Record a payload we produced ourselves (mined block, local tx) or
    /// accepted from the network. Idempotent. Returns whether it was new.
    pub fn note_payload(&mut self, hash: Hash32, msg_type: ReceiptType, msg: NetMessage) -> bool {
        let entry = self.entry_mut(hash, msg_type);
        if entry.payload.is_some() {
            return false;
        }
        entry.payload = Some(msg);
        entry.outstanding = None;
        true
    }

    pub fn has_payload(&self, hash: &Hash32) -> bool {
        self.entries
            .get(hash)
            .map(|e| e.payload.is_some())
            .unwrap_or(false)
    }

    /// Serve an SFM: the payload, if we hold it under the declared type.
    pub fn get_payload(&self, hash: &Hash32, msg_type: ReceiptType) -> Option<&NetMessage> {
        self.entries
            .get(hash)
            .filter(|e| e.msg_type == msg_type)
            .and_then(|e| e.payload.as_ref())
    }

    pub fn announcers(&self, hash: &Hash32) -> Vec<PeerId> {
        self.entries
            .get(hash)
            .map(|e| e.announcers.clone())
            .unwrap_or_default()
    }

    /// Handle an incoming MR from `peer`.
    pub fn on_receipt(&mut self, hash: Hash32, msg_type: ReceiptType, peer: PeerId) -> ReceiptOutcome {
        let entry = self.entry_mut(hash, msg_type);
        if entry.announcers.contains(&peer) {
            return ReceiptOutcome::Ignored;
        }
        entry.announcers.push(peer);
        // Announcing a hash means holding the payload; never echo the
        // receipt back at them.
        self.announced_to.entry(peer).or_default().insert(hash);

        let entry = self.entries.get_mut(&hash).unwrap();
        if entry.payload.is_some() || entry.outstanding.is_some() {
            return ReceiptOutcome::Ignored;
        }
        self.pull_seq += 1;
        let seq = self.pull_seq;
        let entry = self.entries.get_mut(&hash).unwrap();
        Self::next_pull(entry, hash, seq)
            .map(ReceiptOutcome::Pull)
            .unwrap_or(ReceiptOutcome::Ignored)
    }

    fn next_pull(entry: &mut ReceiptEntry, hash: Hash32, seq: u64) -> Option<PullRequest> {
        let peer = entry
            .announcers
            .iter()
            .copied()
            .find(|p| !entry.requested.contains(p))?;
        entry.requested.insert(peer);
        entry.outstanding = Some((peer, seq));
        Some(PullRequest { peer, hash, msg_type: entry.msg_type, seq })
    }

    /// The armed pull deadline fired. Try the next announcer; exhausting
    /// them forgets the hash so a later receipt can start over. `seq` must
    /// match the pull the deadline was armed for.
    pub fn on_pull_timeout(&mut self, hash: Hash32, seq: u64) -> Option<PullRequest> {
        let entry = self.entries.get_mut(&hash)?;
        if entry.payload.is_some() {
            return None;
        }
        match entry.outstanding {
            Some((_, current)) if current == seq => {}
            _ => return None,
        }
        entry.outstanding = None;
        self.pull_seq += 1;
        let next_seq = self.pull_seq;
        let entry = self.entries.get_mut(&hash).unwrap();
        match Self::next_pull(entry, hash, next_seq) {
            Some(pull) => Some(pull),
            None => {
                tracing::debug!(hash = %hex::encode(hash), "no announcer delivered, forgetting hash");
                self.entries.remove(&hash);
                self.order.retain(|h| h != &hash);
                None
            }
        }
    }

    /// A pulled payload arrived and was verified by the caller. Stores it
    /// and returns the peers that must NOT receive our re-announce.
    pub fn on_payload(&mut self, hash: Hash32, msg_type: ReceiptType, msg: NetMessage) -> Vec<PeerId> {
        self.note_payload(hash, msg_type, msg);
        self.announcers(&hash)
    }

    /// Outbound receipt dedup: true exactly once per (peer, hash).
    pub fn mark_announced(&mut self, peer: PeerId, hash: Hash32) -> bool {
        self.announced_to.entry(peer).or_default().insert(hash)
    }

    /// Drop a gone peer from announcer lists. An outstanding pull aimed at
    /// it is left to its armed deadline, which advances to the next
    /// announcer.
    pub fn peer_disconnected(&mut self, peer: PeerId) {
        self.announced_to.remove(&peer);
        for entry in self.entries.values_mut() {
            entry.announcers.retain(|p| *p != peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: Hash32 = [0xAB; 32];

    fn tracker() -> MessageReceiptTracker {
        MessageReceiptTracker::new(64)
    }

    fn payload() -> NetMessage {
        NetMessage::Ping("NG".into())
    }

    #[test]
    fn test_first_receipt_triggers_single_pull() {
        let mut mr = tracker();
        let out = mr.on_receipt(HASH, ReceiptType::Block, 1);
        assert!(matches!(out, ReceiptOutcome::Pull(PullRequest { peer: 1, .. })));
        // second announcer while a pull is outstanding: no second SFM
        assert!(matches!(
            mr.on_receipt(HASH, ReceiptType::Block, 2),
            ReceiptOutcome::Ignored
        ));
    }

    #[test]
    fn test_duplicate_receipt_from_same_peer_ignored() {
        let mut mr = tracker();
        let _ = mr.on_receipt(HASH, ReceiptType::Block, 1);
        assert!(matches!(
            mr.on_receipt(HASH, ReceiptType::Block, 1),
            ReceiptOutcome::Ignored
        ));
    }

    fn pull_of(outcome: ReceiptOutcome) -> PullRequest {
        match outcome {
            ReceiptOutcome::Pull(pull) => pull,
            ReceiptOutcome::Ignored => panic!("expected a pull"),
        }
    }

    #[test]
    fn test_timeout_walks_announcer_list_then_forgets() {
        let mut mr = tracker();
        let first = pull_of(mr.on_receipt(HASH, ReceiptType::Block, 1));
        let _ = mr.on_receipt(HASH, ReceiptType::Block, 2);

        let second = mr.on_pull_timeout(HASH, first.seq).expect("second announcer");
        assert_eq!(second.peer, 2);

        // a stale deadline from the first pull changes nothing
        assert!(mr.on_pull_timeout(HASH, first.seq).is_none());

        // both tried, the live deadline forgets the hash entirely
        assert!(mr.on_pull_timeout(HASH, second.seq).is_none());
        assert!(mr.announcers(&HASH).is_empty());

        // a fresh receipt restarts the pull cycle
        assert!(matches!(
            mr.on_receipt(HASH, ReceiptType::Block, 3),
            ReceiptOutcome::Pull(_)
        ));
    }

    #[test]
    fn test_payload_arrival_stops_pulls_and_lists_exclusions() {
        let mut mr = tracker();
        let pull = pull_of(mr.on_receipt(HASH, ReceiptType::Block, 1));
        let _ = mr.on_receipt(HASH, ReceiptType::Block, 2);

        let skip = mr.on_payload(HASH, ReceiptType::Block, payload());
        assert_eq!(skip, vec![1, 2]);
        assert!(mr.has_payload(&HASH));

        // stale timeout after delivery is inert
        assert!(mr.on_pull_timeout(HASH, pull.seq).is_none());
        // late announcer does not trigger another pull
        assert!(matches!(
            mr.on_receipt(HASH, ReceiptType::Block, 3),
            ReceiptOutcome::Ignored
        ));
    }

    #[test]
    fn test_payload_delivery_is_idempotent() {
        let mut mr = tracker();
        assert!(mr.note_payload(HASH, ReceiptType::Transfer, payload()));
        assert!(!mr.note_payload(HASH, ReceiptType::Transfer, payload()));
    }

    #[test]
    fn test_get_payload_checks_type() {
        let mut mr = tracker();
        mr.note_payload(HASH, ReceiptType::Transfer, payload());
        assert!(mr.get_payload(&HASH, ReceiptType::Transfer).is_some());
        assert!(mr.get_payload(&HASH, ReceiptType::Block).is_none());
    }

    #[test]
    fn test_mark_announced_dedups_per_peer() {
        let mut mr = tracker();
        assert!(mr.mark_announced(7, HASH));
        assert!(!mr.mark_announced(7, HASH));
        assert!(mr.mark_announced(8, HASH));
    }

    #[test]
    fn test_cache_eviction_bounds_memory() {
        let mut mr = MessageReceiptTracker::new(2);
        mr.note_payload([1u8; 32], ReceiptType::Block, payload());
        mr.note_payload([2u8; 32], ReceiptType::Block, payload());
        mr.note_payload([3u8; 32], ReceiptType::Block, payload());
        assert!(!mr.has_payload(&[1u8; 32]));
        assert!(mr.has_payload(&[3u8; 32]));
    }
}

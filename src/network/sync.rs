//! Node-level session state machine: Unsynced, Syncing, Forked, Synced.
//!
//! Pure bookkeeping over peer height reports; the node loop feeds it
//! events and acts on the transitions it returns (requesting backfill
//! blocks, walking back from a fork, restarting the download).

use std::collections::HashMap;

use crate::crypto::Hash32;
use crate::network::gossip::PeerId;
use crate::network::protocol::HeightData;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Syncing,
    Forked,
    Synced,
}

/// What the node should do after a state evaluation.
#[derive(Debug, PartialEq)]
pub enum SyncAction {
    /// Start or continue backfilling toward the target height.
    Download { target: HeightData },
    /// Walk back toward a common ancestor and re-request from there.
    ForkRecovery { peer_height: u64 },
    None,
}

pub struct SyncTracker {
    state: SyncState,
    /// Latest height report per peer.
    reports: HashMap<PeerId, HeightData>,
    /// Seconds of no higher tip before Syncing settles into Synced.
    grace_secs: i64,
    /// Seconds of no ingest progress before Synced degrades to Unsynced.
    stale_secs: i64,
    last_progress: i64,
    last_higher_report: i64,
}

impl SyncTracker {
    pub fn new(grace_secs: i64, stale_secs: i64, now: i64) -> Self {
        Self {
            state: SyncState::Unsynced,
            reports: HashMap::new(),
            grace_secs,
            stale_secs,
            last_progress: now,
            last_higher_report: now,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    fn transition(&mut self, next: SyncState) {
        if self.state != next {
            tracing::info!("node status changed {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Chain ingest made progress (a block was applied).
    pub fn note_progress(&mut self, now: i64) {
        self.last_progress = now;
    }

    pub fn on_peer_report(&mut self, peer: PeerId, data: HeightData, local_height: u64, now: i64) {
        if data.block_number > local_height {
            self.last_higher_report = now;
        }
        self.reports.insert(peer, data);
    }

    pub fn on_peer_gone(&mut self, peer: PeerId) {
        self.reports.remove(&peer);
    }

    /// Largest group of peers agreeing on one (height, headerhash) report.
    pub fn majority_report(&self) -> Option<(HeightData, usize)> {
        let mut counts: HashMap<(u64, Hash32), usize> = HashMap::new();
        for data in self.reports.values() {
            *counts.entry((data.block_number, data.headerhash)).or_insert(0) += 1;
        }
        let ((block_number, headerhash), votes) = counts.into_iter().max_by_key(|(_, n)| *n)?;
        // a majority of the peers reporting, not merely a plurality
        if votes * 2 > self.reports.len() {
            Some((HeightData { block_number, headerhash }, votes))
        } else {
            None
        }
    }

    /// Re-evaluate the state against the local tip. Called on timer ticks
    /// and after height reports.
    pub fn evaluate(&mut self, local: HeightData, now: i64) -> SyncAction {
        let majority = self.majority_report();

        match self.state {
            SyncState::Unsynced => {
                if let Some((target, _)) = majority {
                    if target.block_number > local.block_number {
                        self.transition(SyncState::Syncing);
                        return SyncAction::Download { target };
                    }
                }
                // nothing better out there
                if now - self.last_higher_report >= self.grace_secs {
                    self.transition(SyncState::Synced);
                }
                SyncAction::None
            }
            SyncState::Syncing => {
                if let Some((target, _)) = majority {
                    if target.block_number > local.block_number {
                        return SyncAction::Download { target };
                    }
                }
                if now - self.last_higher_report >= self.grace_secs {
                    self.transition(SyncState::Synced);
                }
                SyncAction::None
            }
            SyncState::Synced => {
                if let Some((target, _)) = majority {
                    // Same height, different hash, peer consensus behind
                    // it: we are on the wrong branch.
                    if target.block_number == local.block_number
                        && target.headerhash != local.headerhash
                    {
                        self.transition(SyncState::Forked);
                        return SyncAction::ForkRecovery { peer_height: target.block_number };
                    }
                    if target.block_number > local.block_number {
                        self.transition(SyncState::Syncing);
                        return SyncAction::Download { target };
                    }
                }
                // Watchdog: no ingest progress while claiming to be synced.
                if now - self.last_progress >= self.stale_secs {
                    tracing::warn!("no ingest progress in {}s, resyncing", self.stale_secs);
                    self.transition(SyncState::Unsynced);
                }
                SyncAction::None
            }
            SyncState::Forked => {
                // Recovery walked back and re-requested; start over.
                self.transition(SyncState::Unsynced);
                SyncAction::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn height(n: u64, tag: u8) -> HeightData {
        HeightData { block_number: n, headerhash: [tag; 32] }
    }

    #[test]
    fn test_unsynced_to_syncing_on_majority_higher_tip() {
        let mut sync = SyncTracker::new(20, 90, 0);
        sync.on_peer_report(1, height(10, 0xAA), 0, 1);
        sync.on_peer_report(2, height(10, 0xAA), 0, 1);
        sync.on_peer_report(3, height(8, 0xBB), 0, 1);

        let action = sync.evaluate(height(0, 0x00), 2);
        assert_eq!(action, SyncAction::Download { target: height(10, 0xAA) });
        assert_eq!(sync.state(), SyncState::Syncing);
    }

    #[test]
    fn test_no_majority_no_download() {
        let mut sync = SyncTracker::new(20, 90, 0);
        sync.on_peer_report(1, height(10, 0xAA), 0, 1);
        sync.on_peer_report(2, height(12, 0xBB), 0, 1);
        assert_eq!(sync.evaluate(height(0, 0x00), 2), SyncAction::None);
        assert_eq!(sync.state(), SyncState::Unsynced);
    }

    #[test]
    fn test_syncing_settles_after_grace() {
        let mut sync = SyncTracker::new(20, 90, 0);
        sync.on_peer_report(1, height(5, 0xAA), 0, 1);
        sync.on_peer_report(2, height(5, 0xAA), 0, 1);
        let _ = sync.evaluate(height(0, 0x00), 2);
        assert_eq!(sync.state(), SyncState::Syncing);

        // caught up; nobody reports higher for the grace interval
        sync.on_peer_report(1, height(5, 0xAA), 5, 10);
        sync.on_peer_report(2, height(5, 0xAA), 5, 10);
        assert_eq!(sync.evaluate(height(5, 0xAA), 30), SyncAction::None);
        assert_eq!(sync.state(), SyncState::Synced);
    }

    #[test]
    fn test_synced_detects_fork() {
        let mut sync = SyncTracker::new(0, 90, 0);
        let _ = sync.evaluate(height(5, 0xAA), 1); // grace 0: jumps to synced
        assert_eq!(sync.state(), SyncState::Synced);

        sync.on_peer_report(1, height(5, 0xCC), 5, 2);
        sync.on_peer_report(2, height(5, 0xCC), 5, 2);
        let action = sync.evaluate(height(5, 0xAA), 3);
        assert_eq!(action, SyncAction::ForkRecovery { peer_height: 5 });
        assert_eq!(sync.state(), SyncState::Forked);

        // recovery resets toward unsynced
        let _ = sync.evaluate(height(5, 0xAA), 4);
        assert_eq!(sync.state(), SyncState::Unsynced);
    }

    #[test]
    fn test_stale_watchdog_degrades_synced() {
        let mut sync = SyncTracker::new(0, 90, 0);
        let _ = sync.evaluate(height(5, 0xAA), 1);
        assert_eq!(sync.state(), SyncState::Synced);

        sync.note_progress(10);
        let _ = sync.evaluate(height(5, 0xAA), 50);
        assert_eq!(sync.state(), SyncState::Synced);
        let _ = sync.evaluate(height(5, 0xAA), 101);
        assert_eq!(sync.state(), SyncState::Unsynced);
    }

    #[test]
    fn test_peer_gone_removes_report() {
        let mut sync = SyncTracker::new(20, 90, 0);
        sync.on_peer_report(1, height(10, 0xAA), 0, 1);
        sync.on_peer_gone(1);
        assert!(sync.majority_report().is_none());
    }
}

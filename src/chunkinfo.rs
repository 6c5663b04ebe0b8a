//! The Chunk-Info & Watch-List engine (§3.1, §4.4) — the dedup/ref-count brain.
//!
//! One mutex guards the whole `chunk_name -> ChunkInfo` map (§5); individual
//! chunk updates run under that lock. Fine-grained per-chunk locking is a
//! valid redesign but is not required by the invariants below, and the
//! whole-map lock keeps `RemoveFromWatchList`'s "both lists empty -> destroy"
//! rule a single atomic step.

use crate::id::{ChunkName, Pmid};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkInfoError {
    #[error("chunk {0} is unknown")]
    InvalidName(ChunkName),
    #[error("chunk {0} size does not match stored size")]
    InvalidSize(ChunkName),
    #[error("chunk {0} has no active watchers")]
    NoActiveWatchers(ChunkName),
    #[error("holder {1} is already on the reference list for chunk {0}")]
    AlreadyReferenced(ChunkName, Pmid),
    #[error("reference list for chunk {0} is already at capacity")]
    ReferenceListFull(ChunkName),
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEntry {
    pub pmid: Pmid,
    pub payments_done: bool,
    pub requested_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingEntry {
    pub pmid: Pmid,
    pub requested_at: u64,
    /// 1 for a plain queued watcher, K for one pre-paying to replace a
    /// probationary row (§4.4.1).
    pub prepay_units: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub pmid: Pmid,
    pub size: u64,
    pub stored_at: u64,
}

/// Result of a successful (or queued) [`ChunkInfoHandler::try_commit_to_watch_list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub committed: bool,
    pub replaced_pmid: Option<Pmid>,
    pub refunds: u16,
}

/// Outcome of [`ChunkInfoHandler::remove_from_watch_list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub chunk_size: u64,
    /// One entry per unit of `chunk_size` to be credited back, in order.
    pub credit_pmids: Vec<Pmid>,
    /// Holders to instruct to delete the chunk (non-empty only when the
    /// chunk as a whole is now unwatched).
    pub deref_pmids: Vec<Pmid>,
    pub chunk_destroyed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chunk_size: u64,
    pub watch_list: Vec<WatchEntry>,
    pub waiting_list: VecDeque<WaitingEntry>,
    pub reference_list: Vec<ReferenceEntry>,
    pub watcher_count: u64,
    pub watcher_checksum: u64,
    /// Virtual-watch reference count per pmid; a pmid's row/waiting-entry is
    /// only removed once this reaches zero (re-watching just bumps it).
    watch_counts: HashMap<Pmid, u32>,
    /// Units of `chunk_size` currently charged to each pmid for this chunk,
    /// not yet refunded.
    net_paid: HashMap<Pmid, u16>,
    /// Pmids that pre-paid K units when joining a full watch_list as a
    /// pending replacement; consumed (and refunded K-1) on commit.
    prepaid_k: HashSet<Pmid>,
    /// Waiting-list pmids whose payment has been confirmed but who have not
    /// yet been promoted to a `watch_list` row.
    paid_waiting: HashSet<Pmid>,
}

impl ChunkInfo {
    fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            watch_list: Vec::new(),
            waiting_list: VecDeque::new(),
            reference_list: Vec::new(),
            watcher_count: 0,
            watcher_checksum: 0,
            watch_counts: HashMap::new(),
            net_paid: HashMap::new(),
            prepaid_k: HashSet::new(),
            paid_waiting: HashSet::new(),
        }
    }

    fn is_active_watcher(&self, pmid: &Pmid) -> bool {
        self.watch_list.iter().any(|e| &e.pmid == pmid)
            || self.waiting_list.iter().any(|e| &e.pmid == pmid)
    }

    fn has_reference_for(&self, pmid: &Pmid) -> bool {
        self.reference_list.iter().any(|r| &r.pmid == pmid)
    }

    fn recompute_checksum(&mut self) {
        let mut checksum = 0u64;
        for entry in &self.watch_list {
            let bytes = entry.pmid.as_bytes();
            let mut chunk8 = [0u8; 8];
            chunk8.copy_from_slice(&bytes[0..8]);
            checksum ^= u64::from_le_bytes(chunk8) ^ (entry.payments_done as u64);
        }
        self.watcher_checksum = checksum;
    }

    fn credit(&mut self, pmid: Pmid, units: u16) {
        *self.net_paid.entry(pmid).or_insert(0) += units;
    }

    fn is_empty_of_watchers(&self) -> bool {
        self.watch_list.is_empty() && self.waiting_list.is_empty()
    }
}

/// Map `chunk_name -> ChunkInfo`, the dedup/ref-count brain of §4.4.
pub struct ChunkInfoHandler {
    chunks: Mutex<HashMap<ChunkName, ChunkInfo>>,
    /// Replication factor K: max watch_list/reference_list length.
    k: usize,
}

impl ChunkInfoHandler {
    pub fn new(k: usize) -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
            k,
        }
    }

    /// `PrepareAddToWatchList(C, W, S) -> (required_references, required_payments)`.
    pub fn prepare_add_to_watch_list(
        &self,
        chunk: ChunkName,
        watcher: Pmid,
        size: u64,
    ) -> Result<(u32, u32), ChunkInfoError> {
        let mut chunks = self.chunks.lock().unwrap();
        let info = chunks.entry(chunk).or_insert_with(|| ChunkInfo::new(size));
        if info.chunk_size != size {
            return Err(ChunkInfoError::InvalidSize(chunk));
        }

        if info.is_active_watcher(&watcher) {
            info.watcher_count += 1;
            *info.watch_counts.entry(watcher).or_insert(0) += 1;
            return Ok((0, 0));
        }

        info.watcher_count += 1;
        *info.watch_counts.entry(watcher).or_insert(0) += 1;

        if info.watch_list.len() < self.k {
            info.watch_list.push(WatchEntry {
                pmid: watcher,
                payments_done: false,
                requested_at: now(),
            });
            info.credit(watcher, 1);
            info.recompute_checksum();
            let required_references = if info.reference_list.len() < self.k {
                (self.k - info.reference_list.len()) as u32
            } else {
                0
            };
            return Ok((required_references, 1));
        }

        // watch_list full: look for a probationary row (unpaid, unstored).
        let probationary_exists = info
            .watch_list
            .iter()
            .any(|e| !e.payments_done && !info.reference_list.iter().any(|r| r.pmid == e.pmid));

        if probationary_exists {
            info.waiting_list.push_back(WaitingEntry {
                pmid: watcher,
                requested_at: now(),
                prepay_units: self.k as u16,
            });
            info.prepaid_k.insert(watcher);
            info.credit(watcher, self.k as u16);
            Ok((0, self.k as u32))
        } else {
            info.waiting_list.push_back(WaitingEntry {
                pmid: watcher,
                requested_at: now(),
                prepay_units: 1,
            });
            info.credit(watcher, 1);
            Ok((0, 1))
        }
    }

    /// `TryCommitToWatchList(C, W) -> (committed, replaced_pmid, refunds)`.
    pub fn try_commit_to_watch_list(
        &self,
        chunk: ChunkName,
        watcher: Pmid,
    ) -> Result<CommitOutcome, ChunkInfoError> {
        let mut chunks = self.chunks.lock().unwrap();
        let info = chunks
            .get_mut(&chunk)
            .ok_or(ChunkInfoError::InvalidName(chunk))?;

        let payments_done = info
            .watch_list
            .iter()
            .find(|e| e.pmid == watcher)
            .map(|e| e.payments_done)
            .unwrap_or_else(|| info.paid_waiting.contains(&watcher));

        if !payments_done || !info.has_reference_for(&watcher) {
            return Ok(CommitOutcome {
                committed: false,
                replaced_pmid: None,
                refunds: 0,
            });
        }

        let refunds = if info.prepaid_k.remove(&watcher) {
            info.net_paid
                .entry(watcher)
                .and_modify(|u| *u = u.saturating_sub(self.k as u16 - 1));
            self.k as u16 - 1
        } else {
            0
        };

        if info.watch_list.iter().any(|e| e.pmid == watcher) {
            if let Some(row) = info.watch_list.iter_mut().find(|e| e.pmid == watcher) {
                row.payments_done = true;
            }
            return Ok(CommitOutcome {
                committed: true,
                replaced_pmid: None,
                refunds,
            });
        }

        let probationary_idx = info
            .watch_list
            .iter()
            .position(|e| !e.payments_done && !info.reference_list.iter().any(|r| r.pmid == e.pmid));

        if let Some(idx) = probationary_idx {
            let replaced = info.watch_list[idx].pmid;
            info.watch_list[idx] = WatchEntry {
                pmid: watcher,
                payments_done: true,
                requested_at: now(),
            };
            info.waiting_list.retain(|w| w.pmid != watcher);
            info.recompute_checksum();
            return Ok(CommitOutcome {
                committed: true,
                replaced_pmid: Some(replaced),
                refunds,
            });
        }

        if info.watch_list.len() < self.k {
            info.watch_list.push(WatchEntry {
                pmid: watcher,
                payments_done: true,
                requested_at: now(),
            });
            info.waiting_list.retain(|w| w.pmid != watcher);
            info.recompute_checksum();
            return Ok(CommitOutcome {
                committed: true,
                replaced_pmid: None,
                refunds,
            });
        }

        Ok(CommitOutcome {
            committed: false,
            replaced_pmid: None,
            refunds: 0,
        })
    }

    /// Marks that `watcher`'s storage-or-payment obligation for `chunk` has
    /// been confirmed (called by the orchestrator after `AmendAccount`
    /// quorum succeeds for this watcher's `SpaceTakenInc`), then attempts
    /// the commit. This is the entry point the service layer calls instead
    /// of reaching into `ChunkInfo` internals directly.
    pub fn mark_paid_and_commit(
        &self,
        chunk: ChunkName,
        watcher: Pmid,
    ) -> Result<CommitOutcome, ChunkInfoError> {
        {
            let mut chunks = self.chunks.lock().unwrap();
            let info = chunks
                .get_mut(&chunk)
                .ok_or(ChunkInfoError::InvalidName(chunk))?;
            if let Some(row) = info.watch_list.iter_mut().find(|e| e.pmid == watcher) {
                row.payments_done = true;
            } else {
                info.paid_waiting.insert(watcher);
            }
        }
        self.try_commit_to_watch_list(chunk, watcher)
    }

    /// `AddToReferenceList(C, H, S)`. Returns any watch-list commits the new
    /// reference unblocked.
    pub fn add_to_reference_list(
        &self,
        chunk: ChunkName,
        holder: Pmid,
        size: u64,
    ) -> Result<Vec<(Pmid, CommitOutcome)>, ChunkInfoError> {
        let candidates: Vec<Pmid> = {
            let mut chunks = self.chunks.lock().unwrap();
            let info = chunks
                .get_mut(&chunk)
                .ok_or(ChunkInfoError::InvalidName(chunk))?;
            if info.chunk_size != size {
                return Err(ChunkInfoError::InvalidSize(chunk));
            }
            if info.has_reference_for(&holder) {
                return Err(ChunkInfoError::AlreadyReferenced(chunk, holder));
            }
            if info.reference_list.len() >= self.k {
                return Err(ChunkInfoError::ReferenceListFull(chunk));
            }
            info.reference_list.push(ReferenceEntry {
                pmid: holder,
                size,
                stored_at: now(),
            });

            info.watch_list
                .iter()
                .filter(|e| e.payments_done && !info.reference_list.iter().any(|r| r.pmid == e.pmid))
                .map(|e| e.pmid)
                .chain(info.paid_waiting.iter().copied())
                .collect()
        };

        let mut outcomes = Vec::new();
        for pmid in candidates {
            let outcome = self.try_commit_to_watch_list(chunk, pmid)?;
            if outcome.committed {
                let mut chunks = self.chunks.lock().unwrap();
                if let Some(info) = chunks.get_mut(&chunk) {
                    info.paid_waiting.remove(&pmid);
                }
            }
            outcomes.push((pmid, outcome));
        }
        Ok(outcomes)
    }

    /// `RemoveFromWatchList(C, W)`.
    pub fn remove_from_watch_list(
        &self,
        chunk: ChunkName,
        watcher: Pmid,
    ) -> Result<RemoveOutcome, ChunkInfoError> {
        let mut chunks = self.chunks.lock().unwrap();
        let info = chunks
            .get_mut(&chunk)
            .ok_or(ChunkInfoError::InvalidName(chunk))?;

        let chunk_size = info.chunk_size;
        let remaining = {
            let count = info.watch_counts.entry(watcher).or_insert(0);
            *count = count.saturating_sub(1);
            *count
        };
        if info.watcher_count > 0 {
            info.watcher_count -= 1;
        }

        let mut credit_pmids = Vec::new();
        if remaining == 0 {
            info.watch_counts.remove(&watcher);
            info.watch_list.retain(|e| e.pmid != watcher);
            info.waiting_list.retain(|w| w.pmid != watcher);
            info.paid_waiting.remove(&watcher);
            info.prepaid_k.remove(&watcher);
            info.recompute_checksum();
            if let Some(units) = info.net_paid.remove(&watcher) {
                credit_pmids = std::iter::repeat(watcher).take(units as usize).collect();
            }
        }

        let mut deref_pmids = Vec::new();
        let mut chunk_destroyed = false;
        if info.is_empty_of_watchers() {
            deref_pmids = info.reference_list.iter().map(|r| r.pmid).collect();
            chunks.remove(&chunk);
            chunk_destroyed = true;
        }

        Ok(RemoveOutcome {
            chunk_size,
            credit_pmids,
            deref_pmids,
            chunk_destroyed,
        })
    }

    /// `GetActiveReferences(C)`.
    pub fn get_active_references(&self, chunk: &ChunkName) -> Result<Vec<Pmid>, ChunkInfoError> {
        let chunks = self.chunks.lock().unwrap();
        let info = chunks
            .get(chunk)
            .ok_or(ChunkInfoError::InvalidName(*chunk))?;
        if info.watcher_count == 0 {
            return Err(ChunkInfoError::NoActiveWatchers(*chunk));
        }
        Ok(info.reference_list.iter().map(|r| r.pmid).collect())
    }

    pub fn watch_list_len(&self, chunk: &ChunkName) -> usize {
        self.chunks
            .lock()
            .unwrap()
            .get(chunk)
            .map(|c| c.watch_list.len())
            .unwrap_or(0)
    }

    pub fn reference_list_len(&self, chunk: &ChunkName) -> usize {
        self.chunks
            .lock()
            .unwrap()
            .get(chunk)
            .map(|c| c.reference_list.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, chunk: &ChunkName) -> bool {
        self.chunks.lock().unwrap().contains_key(chunk)
    }

    /// Whole chunk-info map, serialisable for startup-sync (§4.9).
    pub fn snapshot_all(&self) -> HashMap<ChunkName, ChunkInfo> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn restore_all(&self, snapshot: HashMap<ChunkName, ChunkInfo>) {
        *self.chunks.lock().unwrap() = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmid(byte: u8) -> Pmid {
        Pmid::new([byte; 64])
    }
    fn chunk(byte: u8) -> ChunkName {
        ChunkName::new([byte; 64])
    }

    #[test]
    fn first_watcher_creates_chunk_info_and_requires_full_replication() {
        let handler = ChunkInfoHandler::new(4);
        let (refs, pay) = handler
            .prepare_add_to_watch_list(chunk(1), pmid(1), 1000)
            .unwrap();
        assert_eq!(refs, 4);
        assert_eq!(pay, 1);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let handler = ChunkInfoHandler::new(4);
        handler
            .prepare_add_to_watch_list(chunk(1), pmid(1), 1000)
            .unwrap();
        let err = handler
            .prepare_add_to_watch_list(chunk(1), pmid(2), 2000)
            .unwrap_err();
        assert_eq!(err, ChunkInfoError::InvalidSize(chunk(1)));
    }

    #[test]
    fn rewatch_by_active_pmid_only_bumps_counter() {
        let handler = ChunkInfoHandler::new(4);
        handler
            .prepare_add_to_watch_list(chunk(1), pmid(1), 1000)
            .unwrap();
        let (refs, pay) = handler
            .prepare_add_to_watch_list(chunk(1), pmid(1), 1000)
            .unwrap();
        assert_eq!((refs, pay), (0, 0));
        assert_eq!(handler.watch_list_len(&chunk(1)), 1);
    }

    /// Scenario 1 (§8): cold store of a new chunk.
    #[test]
    fn cold_store_scenario() {
        let handler = ChunkInfoHandler::new(4);
        let c = chunk(1);
        let client = pmid(10);
        let holder = pmid(20);

        handler.prepare_add_to_watch_list(c, client, 1000).unwrap();
        handler
            .mark_paid_and_commit(c, client)
            .unwrap(); // not yet referenced, stays uncommitted
        handler.add_to_reference_list(c, holder, 1000).unwrap();
        let outcome = handler.mark_paid_and_commit(c, client).unwrap();
        assert!(!outcome.committed); // client itself never gets a reference
        assert_eq!(
            handler.get_active_references(&c).unwrap(),
            vec![holder]
        );
    }

    /// Scenario 2 (§8): dedup on second watcher.
    #[test]
    fn dedup_on_second_watcher_requires_no_new_reference() {
        let handler = ChunkInfoHandler::new(4);
        let c = chunk(2);
        let client_a = pmid(10);
        let client_b = pmid(11);
        let holder = pmid(20);

        handler.prepare_add_to_watch_list(c, client_a, 1000).unwrap();
        handler.add_to_reference_list(c, holder, 1000).unwrap();

        let (refs, pay) = handler
            .prepare_add_to_watch_list(c, client_b, 1000)
            .unwrap();
        assert_eq!(pay, 1);
        assert!(refs <= 4);
    }

    /// Scenario 3 (§8): probationary displacement with refund.
    #[test]
    fn probationary_displacement_refunds_k_minus_one() {
        let handler = ChunkInfoHandler::new(4);
        let c = chunk(3);
        for i in 0..4 {
            handler
                .prepare_add_to_watch_list(c, pmid(i), 1000)
                .unwrap();
        }
        assert_eq!(handler.watch_list_len(&c), 4);

        let newcomer = pmid(99);
        let (refs, pay) = handler.prepare_add_to_watch_list(c, newcomer, 1000).unwrap();
        assert_eq!((refs, pay), (0, 4));

        // newcomer stores a copy itself, then its payment clears.
        handler.add_to_reference_list(c, newcomer, 1000).unwrap();
        let outcome = handler.mark_paid_and_commit(c, newcomer).unwrap();
        assert!(outcome.committed);
        // pmid(0) is the oldest probationary row and must be the one named
        // as displaced, not merely "some row or other".
        assert_eq!(outcome.replaced_pmid, Some(pmid(0)));
        assert_eq!(outcome.refunds, 3);
    }

    /// Scenario 6 (§8): full remove cycle.
    #[test]
    fn full_remove_cycle_derefs_sole_holder_and_destroys_chunk() {
        let handler = ChunkInfoHandler::new(4);
        let c = chunk(6);
        let watcher = pmid(10);
        let holder = pmid(20);

        handler.prepare_add_to_watch_list(c, watcher, 1000).unwrap();
        handler.add_to_reference_list(c, holder, 1000).unwrap();

        let outcome = handler.remove_from_watch_list(c, watcher).unwrap();
        assert_eq!(outcome.chunk_size, 1000);
        assert_eq!(outcome.credit_pmids, vec![watcher]);
        assert_eq!(outcome.deref_pmids, vec![holder]);
        assert!(outcome.chunk_destroyed);
        assert!(!handler.contains(&c));
    }

    #[test]
    fn watch_list_never_exceeds_k() {
        let handler = ChunkInfoHandler::new(2);
        let c = chunk(9);
        for i in 0..5u8 {
            handler.prepare_add_to_watch_list(c, pmid(i), 500).unwrap();
        }
        assert!(handler.watch_list_len(&c) <= 2);
    }

    #[test]
    fn reference_list_rejects_duplicate_holder() {
        let handler = ChunkInfoHandler::new(4);
        let c = chunk(4);
        let watcher = pmid(1);
        let holder = pmid(2);
        handler.prepare_add_to_watch_list(c, watcher, 1000).unwrap();
        handler.add_to_reference_list(c, holder, 1000).unwrap();
        assert_eq!(
            handler.add_to_reference_list(c, holder, 1000).unwrap_err(),
            ChunkInfoError::AlreadyReferenced(c, holder)
        );
    }

    #[test]
    fn reference_list_rejects_beyond_k() {
        let handler = ChunkInfoHandler::new(1);
        let c = chunk(5);
        let watcher = pmid(1);
        handler.prepare_add_to_watch_list(c, watcher, 1000).unwrap();
        handler.add_to_reference_list(c, pmid(2), 1000).unwrap();
        assert_eq!(
            handler.add_to_reference_list(c, pmid(3), 1000).unwrap_err(),
            ChunkInfoError::ReferenceListFull(c)
        );
    }

    #[test]
    fn get_active_references_fails_without_watchers() {
        let handler = ChunkInfoHandler::new(4);
        let c = chunk(7);
        assert_eq!(
            handler.get_active_references(&c).unwrap_err(),
            ChunkInfoError::InvalidName(c)
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn double_prepare_without_remove_counts_twice_but_one_row(
                seed in 0u8..255,
            ) {
                let handler = ChunkInfoHandler::new(4);
                let c = chunk(seed);
                let w = pmid(1);
                handler.prepare_add_to_watch_list(c, w, 1000).unwrap();
                handler.prepare_add_to_watch_list(c, w, 1000).unwrap();
                prop_assert_eq!(handler.watch_list_len(&c), 1);
            }

            #[test]
            fn watch_list_and_reference_list_stay_within_k(k in 1usize..8, n in 0u8..20) {
                let handler = ChunkInfoHandler::new(k);
                let c = chunk(200);
                for i in 0..n {
                    let _ = handler.prepare_add_to_watch_list(c, pmid(i), 1000);
                }
                prop_assert!(handler.watch_list_len(&c) <= k);
            }
        }
    }
}

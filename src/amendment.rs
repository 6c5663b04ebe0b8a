//! Account-amendment quorum handler (§3.3, §4.7): accept an amendment of
//! account A iff at least `kKadUpperThreshold` of the K chunk-info holders
//! of the referenced chunk have independently requested the same amendment
//! within `kAccountAmendmentTimeout`.
//!
//! Each in-flight amendment is a transient quorum collector keyed by the
//! `(pmid, field, size, increase)` tuple being asserted. Requests that
//! arrive before the chunk's holder group is known queue in
//! `probable_pendings`; once the overlay lookup resolves, they are assessed
//! in arrival order exactly like any later request.

use crate::account::{AccountField, AccountHandler};
use crate::id::{ChunkName, Pmid};
use crate::identity::RpcResult;
use crate::overlay::Overlay;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmendmentError {
    #[error("account field {0:?} is not amendable by quorum")]
    TypeError(AccountField),
    #[error("amendment capacity exceeded")]
    CountError,
    #[error("no matching amendment in progress")]
    NotFound,
    #[error("amendment registered, quorum not yet reached")]
    Updated,
    #[error("amendment reached full agreement and was erased")]
    Finished,
    #[error("amendment timed out waiting for quorum")]
    Pending,
}

/// The real classification of one `process_request` call, matching §4.7's
/// `assess_amendment`: a requester the chunk's holder group doesn't
/// recognise gets `NotFound`; a fresh, still-collecting assertion gets
/// `Updated`; the assertion that reaches (or already reached) quorum gets
/// `Finished` with the applied result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssessOutcome {
    NotFound,
    Updated,
    Finished(RpcResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AmendmentKey {
    pmid: Pmid,
    field: AccountField,
    size: u64,
    increase: bool,
}

struct AccountAmendment {
    chunk_name: ChunkName,
    key: AmendmentKey,
    /// `None` until the overlay lookup resolves; then pmid -> already asserted.
    chunk_info_holders: Option<HashMap<Pmid, bool>>,
    probable_pendings: Vec<(Pmid, oneshot::Sender<AssessOutcome>)>,
    pendings: Vec<oneshot::Sender<AssessOutcome>>,
    expiry_time: Instant,
    success_count: u32,
    applied: bool,
    account_amendment_result: Option<RpcResult>,
}

impl AccountAmendment {
    fn total_holders(&self) -> usize {
        self.chunk_info_holders.as_ref().map(|h| h.len()).unwrap_or(usize::MAX)
    }
}

/// Transient quorum collector for `AmendAccount` requests.
pub struct AccountAmendmentHandler {
    amendments: Mutex<HashMap<AmendmentKey, AccountAmendment>>,
    repeated_counts: Mutex<HashMap<AmendmentKey, u32>>,
    /// Keys erased out of `amendments` within the last `result_timeout`,
    /// mapped to when that grace period ends. Lets a duplicate request that
    /// arrives after an amendment has already run to completion (or expired)
    /// come back as an immediate `NotFound` instead of spinning up a fresh
    /// collector and blocking the caller for a whole `amendment_timeout`.
    completed: Mutex<HashMap<AmendmentKey, Instant>>,
    account_handler: Arc<AccountHandler>,
    overlay: Arc<dyn Overlay>,
    k: usize,
    kad_upper_threshold: usize,
    max_account_amendments: usize,
    max_repeated_account_amendments: usize,
    amendment_timeout: Duration,
    result_timeout: Duration,
}

impl AccountAmendmentHandler {
    pub fn new(
        account_handler: Arc<AccountHandler>,
        overlay: Arc<dyn Overlay>,
        k: usize,
        kad_upper_threshold: usize,
        max_account_amendments: usize,
        max_repeated_account_amendments: usize,
        amendment_timeout: Duration,
        result_timeout: Duration,
    ) -> Self {
        Self {
            amendments: Mutex::new(HashMap::new()),
            repeated_counts: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            account_handler,
            overlay,
            k,
            kad_upper_threshold,
            max_account_amendments,
            max_repeated_account_amendments,
            amendment_timeout,
            result_timeout,
        }
    }

    /// Checks and prunes the completed-amendment cache in one sweep.
    fn is_recently_completed(&self, key: AmendmentKey) -> bool {
        let now = Instant::now();
        let mut completed = self.completed.lock().unwrap();
        completed.retain(|_, expiry| *expiry > now);
        completed.contains_key(&key)
    }

    fn mark_completed(&self, key: AmendmentKey) {
        self.completed
            .lock()
            .unwrap()
            .insert(key, Instant::now() + self.result_timeout);
    }

    /// `process_request(req) -> Ack | Nack`, per §4.7. `requester` is the
    /// chunk-info holder asserting this amendment on behalf of its own
    /// observation of the chunk's watch state (§4.4/§4.6).
    pub async fn process_request(
        &self,
        requester: Pmid,
        chunk_name: ChunkName,
        target_pmid: Pmid,
        field: AccountField,
        size: u64,
        increase: bool,
    ) -> Result<RpcResult, AmendmentError> {
        if !matches!(field, AccountField::SpaceGiven | AccountField::SpaceTaken) {
            return Err(AmendmentError::TypeError(field));
        }
        let key = AmendmentKey {
            pmid: target_pmid,
            field,
            size,
            increase,
        };
        debug!(?target_pmid, ?field, size, increase, "amendment request received");

        if self.is_recently_completed(key) {
            return Err(AmendmentError::NotFound);
        }

        let (rx, must_resolve_holders) = {
            let mut amendments = self.amendments.lock().unwrap();
            if !amendments.contains_key(&key) {
                if amendments.len() >= self.max_account_amendments {
                    return Err(AmendmentError::CountError);
                }
                let mut repeated = self.repeated_counts.lock().unwrap();
                let count = repeated.entry(key).or_insert(0);
                if *count >= self.max_repeated_account_amendments as u32 {
                    return Err(AmendmentError::CountError);
                }
                *count += 1;
                amendments.insert(
                    key,
                    AccountAmendment {
                        chunk_name,
                        key,
                        chunk_info_holders: None,
                        probable_pendings: Vec::new(),
                        pendings: Vec::new(),
                        expiry_time: Instant::now() + self.amendment_timeout,
                        success_count: 0,
                        applied: false,
                        account_amendment_result: None,
                    },
                );
            }

            let amendment = amendments.get_mut(&key).unwrap();
            let (tx, rx) = oneshot::channel();
            match amendment.chunk_info_holders.take() {
                Some(mut holders) => {
                    self.assess_locked(&mut holders, amendment, requester, tx);
                    amendment.chunk_info_holders = Some(holders);
                    (rx, false)
                }
                None => {
                    let must_resolve = amendment.probable_pendings.is_empty();
                    amendment.probable_pendings.push((requester, tx));
                    (rx, must_resolve)
                }
            }
        };

        self.finish_if_complete(key);

        if must_resolve_holders {
            self.resolve_holders(key).await;
        }

        match tokio::time::timeout(self.amendment_timeout, rx).await {
            Ok(Ok(AssessOutcome::NotFound)) => Err(AmendmentError::NotFound),
            Ok(Ok(AssessOutcome::Updated)) => Err(AmendmentError::Updated),
            Ok(Ok(AssessOutcome::Finished(result))) => Ok(result),
            Ok(Err(_)) => Err(AmendmentError::Pending),
            Err(_) => Err(AmendmentError::Pending),
        }
    }

    /// Classifies one assertion against the chunk's now-known holder group,
    /// per §4.7's `assess_amendment`: a requester the group doesn't
    /// recognise is `NotFound`; a repeat assertion from a holder who's
    /// already voted is `Updated` (or `Finished` if quorum has since been
    /// reached); a fresh assertion is recorded and is `Updated` unless it is
    /// itself the one that reaches `kad_upper_threshold`, in which case the
    /// amendment is applied and every waiting holder is woken with
    /// `Finished`.
    fn assess_locked(
        &self,
        holders: &mut HashMap<Pmid, bool>,
        amendment: &mut AccountAmendment,
        requester: Pmid,
        tx: oneshot::Sender<AssessOutcome>,
    ) {
        match holders.get(&requester).copied() {
            None => {
                let _ = tx.send(AssessOutcome::NotFound);
                return;
            }
            Some(true) => {
                let outcome = if amendment.applied {
                    AssessOutcome::Finished(amendment.account_amendment_result.unwrap_or(RpcResult::Nack))
                } else {
                    AssessOutcome::Updated
                };
                let _ = tx.send(outcome);
                return;
            }
            Some(false) => {}
        }
        holders.insert(requester, true);
        amendment.success_count += 1;

        if amendment.applied {
            let _ = tx.send(AssessOutcome::Finished(
                amendment.account_amendment_result.unwrap_or(RpcResult::Nack),
            ));
            return;
        }

        amendment.pendings.push(tx);

        if amendment.success_count as usize >= self.kad_upper_threshold {
            amendment.applied = true;
            let outcome =
                self.account_handler
                    .amend(&amendment.key.pmid, amendment.key.field, amendment.key.size, amendment.key.increase);
            let rpc_result = if outcome.is_ok() {
                RpcResult::Ack
            } else {
                RpcResult::Nack
            };
            info!(pmid = %amendment.key.pmid, ?amendment.key.field, "amendment quorum reached");
            amendment.account_amendment_result = Some(rpc_result);
            for pending in amendment.pendings.drain(..) {
                let _ = pending.send(AssessOutcome::Finished(rpc_result));
            }
        }
    }

    async fn resolve_holders(&self, key: AmendmentKey) {
        let chunk_name = {
            let amendments = self.amendments.lock().unwrap();
            match amendments.get(&key) {
                Some(a) => a.chunk_name,
                None => return,
            }
        };
        let holders = self.overlay.closest_group(chunk_name.as_bytes(), self.k).await;

        let mut amendments = self.amendments.lock().unwrap();
        let Some(amendment) = amendments.get_mut(&key) else {
            return;
        };
        if holders.is_empty() {
            warn!(?chunk_name, "overlay lookup for amendment holders returned empty; erasing");
            for (_, tx) in amendment.probable_pendings.drain(..) {
                let _ = tx.send(AssessOutcome::NotFound);
            }
            amendments.remove(&key);
            drop(amendments);
            self.mark_completed(key);
            self.release_repeated_slot(key);
            return;
        }

        let mut holder_map: HashMap<Pmid, bool> = holders.into_iter().map(|p| (p, false)).collect();
        let queued = std::mem::take(&mut amendment.probable_pendings);
        for (requester, tx) in queued {
            self.assess_locked(&mut holder_map, amendment, requester, tx);
        }
        amendment.chunk_info_holders = Some(holder_map);
        drop(amendments);
        self.finish_if_complete(key);
    }

    fn finish_if_complete(&self, key: AmendmentKey) {
        let mut amendments = self.amendments.lock().unwrap();
        let done = amendments
            .get(&key)
            .map(|a| a.success_count as usize >= a.total_holders())
            .unwrap_or(false);
        if done {
            amendments.remove(&key);
            drop(amendments);
            self.mark_completed(key);
            self.release_repeated_slot(key);
        }
    }

    fn release_repeated_slot(&self, key: AmendmentKey) {
        let mut repeated = self.repeated_counts.lock().unwrap();
        if let Some(count) = repeated.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                repeated.remove(&key);
            }
        }
    }

    /// Iterates in-flight amendments and Nacks/erases every one past its
    /// `expiry_time`. Intended to run on a `tokio::time::interval` timer
    /// (§4.8). Returns the number erased.
    pub fn clean_up(&self) -> usize {
        let now = Instant::now();
        let mut amendments = self.amendments.lock().unwrap();
        let expired: Vec<AmendmentKey> = amendments
            .iter()
            .filter(|(_, a)| a.expiry_time < now)
            .map(|(k, _)| *k)
            .collect();

        for key in &expired {
            if let Some(mut amendment) = amendments.remove(key) {
                for tx in amendment.pendings.drain(..) {
                    let _ = tx.send(AssessOutcome::Updated);
                }
                for (_, tx) in amendment.probable_pendings.drain(..) {
                    let _ = tx.send(AssessOutcome::Updated);
                }
            }
        }
        drop(amendments);
        for key in &expired {
            self.mark_completed(*key);
            self.release_repeated_slot(*key);
        }
        expired.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.amendments.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::StaticOverlay;

    fn pmid(byte: u8) -> Pmid {
        Pmid::new([byte; 64])
    }
    fn chunk(byte: u8) -> ChunkName {
        ChunkName::new([byte; 64])
    }

    fn handler(members: Vec<Pmid>, k: usize, threshold: usize) -> AccountAmendmentHandler {
        let accounts = Arc::new(AccountHandler::new());
        accounts.add_account(pmid(250), 10_000).unwrap();
        let overlay = Arc::new(StaticOverlay::new(pmid(0), members));
        AccountAmendmentHandler::new(
            accounts,
            overlay,
            k,
            threshold,
            100,
            10,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    /// Scenario 4 (§8): amendment count caps.
    #[tokio::test]
    async fn amendment_count_cap_rejects_beyond_limit() {
        let accounts = Arc::new(AccountHandler::new());
        accounts.add_account(pmid(250), 10_000).unwrap();
        let overlay = Arc::new(StaticOverlay::new(pmid(0), vec![pmid(1), pmid(2), pmid(3)]));
        let h = AccountAmendmentHandler::new(
            accounts,
            overlay,
            3,
            2,
            1,
            10,
            Duration::from_secs(5),
            Duration::from_secs(5),
        );

        // First amendment occupies the single global slot; don't await it
        // to completion so it stays in-flight.
        let fut1 = h.process_request(pmid(1), chunk(1), pmid(250), AccountField::SpaceTaken, 100, true);
        tokio::pin!(fut1);
        // Poll once to drive it to the "registered, waiting" state.
        let _ = futures::poll!(&mut fut1);

        let err = h
            .process_request(pmid(1), chunk(2), pmid(251), AccountField::SpaceTaken, 200, true)
            .await
            .unwrap_err();
        assert_eq!(err, AmendmentError::CountError);
    }

    /// Scenario 4 (§8): quorum of kKadUpperThreshold - 1 stays pending, the
    /// threshold-th assertion flips it to Ack.
    #[tokio::test]
    async fn quorum_is_reached_at_threshold() {
        let members = vec![pmid(1), pmid(2), pmid(3)];
        let h = handler(members, 3, 2);

        let h1 = Arc::new(h);
        let h2 = h1.clone();
        let fut1 = tokio::spawn(async move {
            h1.process_request(pmid(1), chunk(1), pmid(250), AccountField::SpaceTaken, 100, true)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result2 = h2
            .process_request(pmid(2), chunk(1), pmid(250), AccountField::SpaceTaken, 100, true)
            .await
            .unwrap();
        assert_eq!(result2, RpcResult::Ack);
        let result1 = fut1.await.unwrap().unwrap();
        assert_eq!(result1, RpcResult::Ack);

        let snap = h2.account_handler.get(&pmid(250)).unwrap();
        assert_eq!(snap.taken, 100);
    }

    /// Scenario 5 (§8): amendment expiry.
    #[tokio::test]
    async fn expired_amendment_is_nacked_and_applies_no_state() {
        let members = vec![pmid(1), pmid(2), pmid(3), pmid(4)];
        let accounts = Arc::new(AccountHandler::new());
        accounts.add_account(pmid(250), 10_000).unwrap();
        let overlay = Arc::new(StaticOverlay::new(pmid(0), members));
        let h = Arc::new(AccountAmendmentHandler::new(
            accounts,
            overlay,
            4,
            3,
            100,
            10,
            Duration::from_millis(30),
            Duration::from_secs(5),
        ));

        let h1 = h.clone();
        let fut1 = tokio::spawn(async move {
            h1.process_request(pmid(1), chunk(9), pmid(250), AccountField::SpaceTaken, 100, true)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let h2 = h.clone();
        let fut2 = tokio::spawn(async move {
            h2.process_request(pmid(2), chunk(9), pmid(250), AccountField::SpaceTaken, 100, true)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let erased = h.clean_up();
        assert_eq!(erased, 1);

        assert_eq!(fut1.await.unwrap(), Err(AmendmentError::Updated));
        assert_eq!(fut2.await.unwrap(), Err(AmendmentError::Updated));
        assert_eq!(h.account_handler.get(&pmid(250)).unwrap().taken, 0);
    }

    /// Scenario 4 (§8): once an amendment has run to completion and been
    /// erased, a duplicate from a holder who already voted is rejected
    /// immediately as `NotFound` rather than spinning up a fresh collector
    /// and blocking for a whole `amendment_timeout`.
    #[tokio::test]
    async fn duplicate_after_quorum_completion_is_rejected_as_not_found() {
        let members = vec![pmid(1), pmid(2)];
        let h = Arc::new(handler(members, 2, 2));

        let h1 = h.clone();
        let fut1 = tokio::spawn(async move {
            h1.process_request(pmid(1), chunk(1), pmid(250), AccountField::SpaceTaken, 100, true)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let r2 = h
            .process_request(pmid(2), chunk(1), pmid(250), AccountField::SpaceTaken, 100, true)
            .await
            .unwrap();
        assert_eq!(r2, RpcResult::Ack);
        assert_eq!(fut1.await.unwrap().unwrap(), RpcResult::Ack);
        assert_eq!(h.in_flight_count(), 0);

        let err = h
            .process_request(pmid(2), chunk(1), pmid(250), AccountField::SpaceTaken, 100, true)
            .await
            .unwrap_err();
        assert_eq!(err, AmendmentError::NotFound);
        assert_eq!(h.account_handler.get(&pmid(250)).unwrap().taken, 100);
    }

    /// A second, distinct holder asserting the same amendment before quorum
    /// is reached is registered (`Updated`), not blocked until timeout.
    #[tokio::test]
    async fn duplicate_assertion_before_quorum_is_updated_not_blocked() {
        let members = vec![pmid(1), pmid(2), pmid(3)];
        let h = handler(members, 3, 3);

        let h1 = Arc::new(h);
        let h2 = h1.clone();
        let fut1 = tokio::spawn(async move {
            h1.process_request(pmid(1), chunk(1), pmid(250), AccountField::SpaceTaken, 100, true)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        // pmid(1) asserts again before the 3-of-3 quorum is reached.
        let err = h2
            .process_request(pmid(1), chunk(1), pmid(250), AccountField::SpaceTaken, 100, true)
            .await
            .unwrap_err();
        assert_eq!(err, AmendmentError::Updated);
        assert_eq!(h2.in_flight_count(), 1);
        fut1.abort();
    }

    #[tokio::test]
    async fn space_offered_is_not_amendable_via_quorum() {
        let h = handler(vec![pmid(1), pmid(2)], 2, 2);
        let err = h
            .process_request(pmid(1), chunk(1), pmid(250), AccountField::SpaceOffered, 100, true)
            .await
            .unwrap_err();
        assert_eq!(err, AmendmentError::TypeError(AccountField::SpaceOffered));
    }
}

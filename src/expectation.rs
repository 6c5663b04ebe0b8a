//! Request-expectation tracking: a short-lived record of "I was told to
//! expect an `AmendAccount` for this PMID/field" used to filter unsolicited
//! amendments (§4.6, referenced from §4.7).
//!
//! A vault only accepts an `AmendAccount` request if it previously told the
//! requester (via `PrepareAddToWatchList`/`TryCommitToWatchList`/
//! `AddToReferenceList`) that such an amendment was coming. Expectations
//! expire on their own; nothing ever explicitly fails them besides time or
//! consumption.

use crate::account::AccountField;
use crate::id::Pmid;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ExpectationKey {
    pmid: Pmid,
    field: AccountField,
}

struct Expectation {
    amount: u64,
    expires_at: Instant,
}

/// Tracks outstanding "expect an amendment" promises, keyed by (pmid, field).
pub struct RequestExpectationHandler {
    expectations: Mutex<HashMap<ExpectationKey, Expectation>>,
    ttl: Duration,
}

impl RequestExpectationHandler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            expectations: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record that an `AmendAccount(pmid, field, amount)` is expected soon.
    pub fn expect(&self, pmid: Pmid, field: AccountField, amount: u64) {
        let mut guard = self.expectations.lock().unwrap();
        guard.insert(
            ExpectationKey { pmid, field },
            Expectation {
                amount,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Consume a matching, unexpired expectation. Returns `true` if the
    /// amendment should proceed.
    pub fn consume(&self, pmid: Pmid, field: AccountField, amount: u64) -> bool {
        let mut guard = self.expectations.lock().unwrap();
        let key = ExpectationKey { pmid, field };
        match guard.remove(&key) {
            Some(exp) if exp.expires_at >= Instant::now() && exp.amount == amount => true,
            _ => false,
        }
    }

    /// Drop every expectation that has expired. Intended to be driven by the
    /// same background sweep that runs `AccountAmendmentHandler::clean_up`.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.expectations
            .lock()
            .unwrap()
            .retain(|_, exp| exp.expires_at >= now);
    }

    pub fn pending_count(&self) -> usize {
        self.expectations.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmid(byte: u8) -> Pmid {
        Pmid::new([byte; 64])
    }

    #[test]
    fn consume_matching_expectation_succeeds_once() {
        let handler = RequestExpectationHandler::new(Duration::from_secs(60));
        let p = pmid(1);
        handler.expect(p, AccountField::SpaceTaken, 1000);
        assert!(handler.consume(p, AccountField::SpaceTaken, 1000));
        assert!(!handler.consume(p, AccountField::SpaceTaken, 1000));
    }

    #[test]
    fn unsolicited_amendment_is_rejected() {
        let handler = RequestExpectationHandler::new(Duration::from_secs(60));
        let p = pmid(1);
        assert!(!handler.consume(p, AccountField::SpaceTaken, 1000));
    }

    #[test]
    fn amount_mismatch_is_rejected() {
        let handler = RequestExpectationHandler::new(Duration::from_secs(60));
        let p = pmid(1);
        handler.expect(p, AccountField::SpaceTaken, 1000);
        assert!(!handler.consume(p, AccountField::SpaceTaken, 500));
    }

    #[test]
    fn expired_expectation_is_rejected() {
        let handler = RequestExpectationHandler::new(Duration::from_millis(1));
        let p = pmid(1);
        handler.expect(p, AccountField::SpaceTaken, 1000);
        std::thread::sleep(Duration::from_millis(10));
        assert!(!handler.consume(p, AccountField::SpaceTaken, 1000));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let handler = RequestExpectationHandler::new(Duration::from_millis(1));
        handler.expect(pmid(1), AccountField::SpaceGiven, 1);
        std::thread::sleep(Duration::from_millis(10));
        handler.sweep_expired();
        assert_eq!(handler.pending_count(), 0);
    }

    #[test]
    fn distinct_fields_do_not_collide() {
        let handler = RequestExpectationHandler::new(Duration::from_secs(60));
        let p = pmid(1);
        handler.expect(p, AccountField::SpaceGiven, 10);
        assert!(!handler.consume(p, AccountField::SpaceTaken, 10));
        assert!(handler.consume(p, AccountField::SpaceGiven, 10));
    }
}

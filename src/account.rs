//! Per-PMID credit ledger (§4.3).
//!
//! One mutex guards the entire account set (§5): the map is small relative
//! to chunk-info, and every operation here is O(1), so a single coarse lock
//! is simpler than per-account locking and was not worth the complexity.

use crate::id::Pmid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountError {
    #[error("account {0} already exists")]
    Exists(Pmid),
    #[error("account {0} not found")]
    NotFound(Pmid),
    #[error("not enough space for this amendment")]
    NotEnoughSpace,
    #[error("field does not accept this amendment")]
    WrongField,
}

/// Which balance an `AmendAccount` request targets (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountField {
    SpaceOffered,
    SpaceGiven,
    SpaceTaken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub pmid: Pmid,
    pub space_offered: u64,
    pub space_given: u64,
    pub space_taken: u64,
    pub alerts: Vec<String>,
}

impl Account {
    fn new(pmid: Pmid, offered: u64) -> Self {
        Self {
            pmid,
            space_offered: offered,
            space_given: 0,
            space_taken: 0,
            alerts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub offered: u64,
    pub given: u64,
    pub taken: u64,
}

#[derive(Default)]
struct Accounts(HashMap<Pmid, Account>);

/// In-memory map `pmid → account`, with add/delete/amend/query and the
/// alert side-channel used for operator-visible warnings.
pub struct AccountHandler {
    accounts: Mutex<Accounts>,
}

impl AccountHandler {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(Accounts::default()),
        }
    }

    pub fn add_account(&self, pmid: Pmid, offered: u64) -> Result<(), AccountError> {
        let mut accounts = self.accounts.lock().unwrap();
        if accounts.0.contains_key(&pmid) {
            return Err(AccountError::Exists(pmid));
        }
        accounts.0.insert(pmid, Account::new(pmid, offered));
        Ok(())
    }

    pub fn delete_account(&self, pmid: &Pmid) -> Result<(), AccountError> {
        let mut accounts = self.accounts.lock().unwrap();
        accounts
            .0
            .remove(pmid)
            .map(|_| ())
            .ok_or(AccountError::NotFound(*pmid))
    }

    /// Apply an amendment to one field of `pmid`'s account.
    ///
    /// For `SpaceOffered`, `increase = false` means "set to `amount`"; the
    /// new value is rejected if it would fall below the current `given` or
    /// `taken`. For `SpaceGiven`/`SpaceTaken`, an increase that would exceed
    /// `offered`, or a decrease that would underflow, fails with
    /// [`AccountError::NotEnoughSpace`].
    pub fn amend(
        &self,
        pmid: &Pmid,
        field: AccountField,
        amount: u64,
        increase: bool,
    ) -> Result<AccountSnapshot, AccountError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .0
            .get_mut(pmid)
            .ok_or(AccountError::NotFound(*pmid))?;

        match field {
            AccountField::SpaceOffered => {
                let new_offered = if increase {
                    account.space_offered + amount
                } else {
                    amount
                };
                if new_offered < account.space_given || new_offered < account.space_taken {
                    return Err(AccountError::NotEnoughSpace);
                }
                account.space_offered = new_offered;
            }
            AccountField::SpaceGiven => {
                if increase {
                    let new_given = account.space_given + amount;
                    if new_given > account.space_offered {
                        return Err(AccountError::NotEnoughSpace);
                    }
                    account.space_given = new_given;
                } else {
                    account.space_given = account
                        .space_given
                        .checked_sub(amount)
                        .ok_or(AccountError::NotEnoughSpace)?;
                }
            }
            AccountField::SpaceTaken => {
                if increase {
                    let new_taken = account.space_taken + amount;
                    if new_taken > account.space_offered {
                        return Err(AccountError::NotEnoughSpace);
                    }
                    account.space_taken = new_taken;
                } else {
                    account.space_taken = account
                        .space_taken
                        .checked_sub(amount)
                        .ok_or(AccountError::NotEnoughSpace)?;
                }
            }
        }

        Ok(AccountSnapshot {
            offered: account.space_offered,
            given: account.space_given,
            taken: account.space_taken,
        })
    }

    pub fn get(&self, pmid: &Pmid) -> Result<AccountSnapshot, AccountError> {
        let accounts = self.accounts.lock().unwrap();
        let account = accounts.0.get(pmid).ok_or(AccountError::NotFound(*pmid))?;
        Ok(AccountSnapshot {
            offered: account.space_offered,
            given: account.space_given,
            taken: account.space_taken,
        })
    }

    pub fn add_alert(&self, pmid: &Pmid, text: impl Into<String>) -> Result<(), AccountError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts.0.get_mut(pmid).ok_or(AccountError::NotFound(*pmid))?;
        account.alerts.push(text.into());
        Ok(())
    }

    /// Returns queued alerts and clears them.
    pub fn take_alerts(&self, pmid: &Pmid) -> Result<Vec<String>, AccountError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts.0.get_mut(pmid).ok_or(AccountError::NotFound(*pmid))?;
        Ok(std::mem::take(&mut account.alerts))
    }

    /// Whole account set, serialisable for startup-sync (§4.9).
    pub fn snapshot_all(&self) -> Vec<Account> {
        self.accounts.lock().unwrap().0.values().cloned().collect()
    }

    /// Replace the account set wholesale, used when applying a startup-sync
    /// payload received from a peer.
    pub fn restore_all(&self, accounts: Vec<Account>) {
        let mut guard = self.accounts.lock().unwrap();
        guard.0 = accounts.into_iter().map(|a| (a.pmid, a)).collect();
    }
}

impl Default for AccountHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmid(byte: u8) -> Pmid {
        Pmid::new([byte; 64])
    }

    #[test]
    fn add_then_get_round_trips() {
        let handler = AccountHandler::new();
        let p = pmid(1);
        handler.add_account(p, 1000).unwrap();
        let snap = handler.get(&p).unwrap();
        assert_eq!(snap.offered, 1000);
        assert_eq!(snap.given, 0);
        assert_eq!(snap.taken, 0);
    }

    #[test]
    fn duplicate_add_account_fails() {
        let handler = AccountHandler::new();
        let p = pmid(1);
        handler.add_account(p, 1000).unwrap();
        assert_eq!(handler.add_account(p, 500), Err(AccountError::Exists(p)));
    }

    #[test]
    fn add_delete_add_is_indistinguishable_from_initial() {
        let handler = AccountHandler::new();
        let p = pmid(1);
        handler.add_account(p, 1000).unwrap();
        handler.delete_account(&p).unwrap();
        handler.add_account(p, 1000).unwrap();
        let snap = handler.get(&p).unwrap();
        assert_eq!(snap.offered, 1000);
        assert_eq!(snap.given, 0);
        assert_eq!(snap.taken, 0);
    }

    #[test]
    fn space_given_increase_respects_offered_ceiling() {
        let handler = AccountHandler::new();
        let p = pmid(1);
        handler.add_account(p, 1000).unwrap();
        handler
            .amend(&p, AccountField::SpaceGiven, 1000, true)
            .unwrap();
        assert_eq!(
            handler.amend(&p, AccountField::SpaceGiven, 1, true),
            Err(AccountError::NotEnoughSpace)
        );
    }

    #[test]
    fn space_taken_decrease_cannot_underflow() {
        let handler = AccountHandler::new();
        let p = pmid(1);
        handler.add_account(p, 1000).unwrap();
        assert_eq!(
            handler.amend(&p, AccountField::SpaceTaken, 1, false),
            Err(AccountError::NotEnoughSpace)
        );
    }

    #[test]
    fn space_offered_set_below_given_is_rejected() {
        let handler = AccountHandler::new();
        let p = pmid(1);
        handler.add_account(p, 1000).unwrap();
        handler
            .amend(&p, AccountField::SpaceGiven, 500, true)
            .unwrap();
        assert_eq!(
            handler.amend(&p, AccountField::SpaceOffered, 100, false),
            Err(AccountError::NotEnoughSpace)
        );
    }

    #[test]
    fn space_offered_can_decrease_to_max_of_given_and_taken() {
        let handler = AccountHandler::new();
        let p = pmid(1);
        handler.add_account(p, 1000).unwrap();
        handler
            .amend(&p, AccountField::SpaceGiven, 300, true)
            .unwrap();
        handler
            .amend(&p, AccountField::SpaceTaken, 700, true)
            .unwrap();
        let snap = handler
            .amend(&p, AccountField::SpaceOffered, 700, false)
            .unwrap();
        assert_eq!(snap.offered, 700);
    }

    #[test]
    fn alerts_clear_on_read() {
        let handler = AccountHandler::new();
        let p = pmid(1);
        handler.add_account(p, 1000).unwrap();
        handler.add_alert(&p, "low space").unwrap();
        let alerts = handler.take_alerts(&p).unwrap();
        assert_eq!(alerts, vec!["low space".to_string()]);
        assert!(handler.take_alerts(&p).unwrap().is_empty());
    }

    #[test]
    fn snapshot_round_trips_through_restore() {
        let handler = AccountHandler::new();
        let p = pmid(1);
        handler.add_account(p, 1000).unwrap();
        handler
            .amend(&p, AccountField::SpaceGiven, 200, true)
            .unwrap();
        let snapshot = handler.snapshot_all();

        let fresh = AccountHandler::new();
        fresh.restore_all(snapshot);
        assert_eq!(fresh.get(&p).unwrap().given, 200);
    }

    proptest::proptest! {
        #[test]
        fn given_and_taken_never_exceed_offered(
            offered in 0u64..1_000_000,
            inc1 in 0u64..2_000_000,
            inc2 in 0u64..2_000_000,
        ) {
            let handler = AccountHandler::new();
            let p = pmid(7);
            handler.add_account(p, offered).unwrap();
            let _ = handler.amend(&p, AccountField::SpaceGiven, inc1, true);
            let _ = handler.amend(&p, AccountField::SpaceTaken, inc2, true);
            let snap = handler.get(&p).unwrap();
            proptest::prop_assert!(snap.given <= snap.offered);
            proptest::prop_assert!(snap.taken <= snap.offered);
        }
    }
}

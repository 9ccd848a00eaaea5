//! Append-only transaction log.
//!
//! Entries are write-once: the log exposes no update or delete. Corrections
//! are new compensating entries appended through the ledger's reversal
//! flow, never edits to history.

use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::Amount;
use crate::model::{
    AccountId, EntryId, IntentRef, TransactionEntry, TransactionKind, TransactionStatus,
};

/// Error raised when the log cannot commit an append.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("transaction log rejected the append")]
    Unavailable,
}

/// Entry fields as submitted by the materializer; the log assigns the id.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub account: AccountId,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub value: Amount,
    pub balance: Amount,
    pub source: Option<IntentRef>,
    pub reverses: Option<EntryId>,
}

#[derive(Debug, Default)]
struct LogInner {
    entries: Vec<TransactionEntry>,
    next_id: EntryId,
}

impl LogInner {
    fn commit(&mut self, draft: EntryDraft) -> TransactionEntry {
        self.next_id += 1;
        let entry = TransactionEntry {
            id: self.next_id,
            account: draft.account,
            kind: draft.kind,
            status: draft.status,
            value: draft.value,
            balance: draft.balance,
            source: draft.source,
            reverses: draft.reverses,
        };
        self.entries.push(entry.clone());
        entry
    }
}

/// The transaction log. Appends serialize on an internal lock, so entry
/// ids follow commit order.
#[derive(Debug, Default)]
pub struct TransactionLog {
    inner: Mutex<LogInner>,
    #[cfg(test)]
    fail_appends: std::sync::atomic::AtomicU32,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry.
    pub fn append(&self, draft: EntryDraft) -> Result<TransactionEntry, JournalError> {
        self.take_fault()?;
        let mut inner = self.lock();
        Ok(inner.commit(draft))
    }

    /// Append two entries under one lock acquisition: both commit with
    /// adjacent ids, or neither commits.
    pub fn append_pair(
        &self,
        first: EntryDraft,
        second: EntryDraft,
    ) -> Result<(TransactionEntry, TransactionEntry), JournalError> {
        self.take_fault()?;
        let mut inner = self.lock();
        let a = inner.commit(first);
        let b = inner.commit(second);
        Ok((a, b))
    }

    /// One entry by id.
    pub fn get(&self, id: EntryId) -> Option<TransactionEntry> {
        self.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    /// All entries for one account in commit order. The returned snapshot
    /// is safe to re-iterate for reconciliation and audits.
    pub fn entries_for(&self, account: AccountId) -> Vec<TransactionEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.account == account)
            .cloned()
            .collect()
    }

    /// Entries materialized for one intent, in commit order.
    pub fn entries_for_intent(&self, intent: IntentRef) -> Vec<TransactionEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.source == Some(intent))
            .cloned()
            .collect()
    }

    /// The correction entry neutralizing `entry`, if one was appended.
    pub fn reversal_of(&self, entry: EntryId) -> Option<TransactionEntry> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.reverses == Some(entry))
            .cloned()
    }

    /// Available balance of `account` replayed from its entries alone.
    pub fn replayed_available(&self, account: AccountId) -> Amount {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.account == account)
            .fold(Amount::ZERO, |sum, e| sum + e.value)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` appends fail, to exercise retry and rollback.
    #[cfg(test)]
    pub(crate) fn fail_next_appends(&self, n: u32) {
        self.fail_appends
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    fn take_fault(&self) -> Result<(), JournalError> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            let armed = self
                .fail_appends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if armed {
                return Err(JournalError::Unavailable);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(account: AccountId, value: i64, balance: i64) -> EntryDraft {
        EntryDraft {
            account,
            kind: TransactionKind::Deposit,
            status: TransactionStatus::Processed,
            value: Amount::from_minor(value),
            balance: Amount::from_minor(balance),
            source: None,
            reverses: None,
        }
    }

    #[test]
    fn append_assigns_increasing_ids() {
        let log = TransactionLog::new();
        let a = log.append(draft(1, 100, 100)).unwrap();
        let b = log.append(draft(1, 50, 150)).unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[test]
    fn entries_for_preserves_commit_order() {
        let log = TransactionLog::new();
        log.append(draft(1, 100, 100)).unwrap();
        log.append(draft(2, 30, 30)).unwrap();
        log.append(draft(1, -40, 60)).unwrap();

        let entries = log.entries_for(1);
        let values: Vec<Amount> = entries.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![Amount::from_minor(100), Amount::from_minor(-40)]);
    }

    #[test]
    fn entries_for_intent_finds_linked_entries() {
        let log = TransactionLog::new();
        let mut d1 = draft(1, -100, 0);
        d1.source = Some(IntentRef::Transfer(7));
        let mut d2 = draft(2, 100, 100);
        d2.source = Some(IntentRef::Transfer(7));
        log.append_pair(d1, d2).unwrap();
        log.append(draft(1, 10, 10)).unwrap();

        let linked = log.entries_for_intent(IntentRef::Transfer(7));
        assert_eq!(linked.len(), 2);
        assert_eq!(linked[0].account, 1);
        assert_eq!(linked[1].account, 2);

        assert!(log.entries_for_intent(IntentRef::Transfer(8)).is_empty());
        assert!(log.entries_for_intent(IntentRef::Withdrawal(7)).is_empty());
    }

    #[test]
    fn append_pair_assigns_adjacent_ids() {
        let log = TransactionLog::new();
        let (a, b) = log.append_pair(draft(1, -10, 0), draft(2, 10, 10)).unwrap();
        assert_eq!(b.id, a.id + 1);
    }

    #[test]
    fn replayed_available_sums_entry_values() {
        let log = TransactionLog::new();
        log.append(draft(1, 500, 500)).unwrap();
        log.append(draft(1, -200, 300)).unwrap();
        log.append(draft(2, 200, 200)).unwrap();

        assert_eq!(log.replayed_available(1), Amount::from_minor(300));
        assert_eq!(log.replayed_available(2), Amount::from_minor(200));
        assert_eq!(log.replayed_available(3), Amount::ZERO);
    }

    #[test]
    fn reversal_of_finds_correction() {
        let log = TransactionLog::new();
        let original = log.append(draft(1, 100, 100)).unwrap();
        let mut correction = draft(1, -100, 0);
        correction.kind = TransactionKind::Reversal;
        correction.status = TransactionStatus::Reversed;
        correction.reverses = Some(original.id);
        log.append(correction).unwrap();

        let found = log.reversal_of(original.id).unwrap();
        assert_eq!(found.value, Amount::from_minor(-100));
        assert!(log.reversal_of(found.id).is_none());
    }

    #[test]
    fn injected_fault_fails_exactly_n_appends() {
        let log = TransactionLog::new();
        log.fail_next_appends(1);

        assert!(log.append(draft(1, 1, 1)).is_err());
        assert!(log.append(draft(1, 1, 1)).is_ok());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn faulted_append_pair_commits_neither_entry() {
        let log = TransactionLog::new();
        log.fail_next_appends(1);

        assert!(log.append_pair(draft(1, -10, 0), draft(2, 10, 10)).is_err());
        assert!(log.is_empty());
    }
}

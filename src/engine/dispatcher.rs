//! Materialization: turning a committed intent into journal entries and
//! balance updates.
//!
//! This is an explicit workflow step invoked by the ledger while it holds
//! the affected account locks, never a storage-layer hook. Materialization
//! is idempotent per intent id: if entries already exist for the id they
//! are returned as-is and no balance is touched.

use std::sync::Arc;

use tracing::warn;

use crate::balance::{AccountState, BalanceKind};
use crate::journal::{EntryDraft, JournalError, TransactionLog};
use crate::model::{
    Deposit, IntentRef, TransactionEntry, TransactionKind, TransactionStatus, Transfer, Withdrawal,
};

use super::error::LedgerError;

/// Append attempts per materialization before giving up and rolling back.
pub(crate) const MAX_APPEND_RETRIES: u32 = 3;

/// Writes journal entries for committed intents.
pub struct Materializer {
    journal: Arc<TransactionLog>,
    #[cfg(test)]
    fail_between_legs: std::sync::atomic::AtomicBool,
}

impl Materializer {
    pub fn new(journal: Arc<TransactionLog>) -> Self {
        Self {
            journal,
            #[cfg(test)]
            fail_between_legs: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Materialize a transfer: debit the sender, credit the receiver, and
    /// append the linked entry pair. Called with both account locks held.
    /// On journal failure every balance change is undone before the error
    /// is returned.
    pub(crate) fn transfer_entries(
        &self,
        transfer: &Transfer,
        sender: &mut AccountState,
        receiver: &mut AccountState,
    ) -> Result<(TransactionEntry, TransactionEntry), LedgerError> {
        let source = IntentRef::Transfer(transfer.id);
        if let [out, credit] = self.journal.entries_for_intent(source).as_slice() {
            return Ok((out.clone(), credit.clone()));
        }

        let value = transfer.value;
        sender.apply(-value, BalanceKind::Available)?;

        #[cfg(test)]
        if self.take_leg_fault() {
            sender.apply_unchecked(value, BalanceKind::Available);
            return Err(LedgerError::MaterializationFailure(JournalError::Unavailable));
        }

        if let Err(err) = receiver.apply(value, BalanceKind::Available) {
            sender.apply_unchecked(value, BalanceKind::Available);
            return Err(err.into());
        }

        let debit = EntryDraft {
            account: transfer.from,
            kind: TransactionKind::TransferOut,
            status: TransactionStatus::Processed,
            value: -value,
            balance: sender.balance().available,
            source: Some(source),
            reverses: None,
        };
        let credit = EntryDraft {
            account: transfer.to,
            kind: TransactionKind::TransferIn,
            status: TransactionStatus::Processed,
            value,
            balance: receiver.balance().available,
            source: Some(source),
            reverses: None,
        };

        match self.append_pair_with_retry(debit, credit) {
            Ok(pair) => Ok(pair),
            Err(source) => {
                receiver.apply_unchecked(-value, BalanceKind::Available);
                sender.apply_unchecked(value, BalanceKind::Available);
                warn!(intent = transfer.id, "transfer rolled back after journal failure");
                Err(LedgerError::MaterializationFailure(source))
            }
        }
    }

    /// Materialize a withdrawal: debit the account and append one entry.
    /// Called with the account lock held.
    pub(crate) fn withdrawal_entry(
        &self,
        withdrawal: &Withdrawal,
        state: &mut AccountState,
    ) -> Result<TransactionEntry, LedgerError> {
        let source = IntentRef::Withdrawal(withdrawal.id);
        if let [entry] = self.journal.entries_for_intent(source).as_slice() {
            return Ok(entry.clone());
        }

        let value = withdrawal.value;
        state.apply(-value, BalanceKind::Available)?;

        let draft = EntryDraft {
            account: withdrawal.account,
            kind: TransactionKind::Withdrawal,
            status: TransactionStatus::Processed,
            value: -value,
            balance: state.balance().available,
            source: Some(source),
            reverses: None,
        };

        match self.append_with_retry(draft) {
            Ok(entry) => Ok(entry),
            Err(source) => {
                state.apply_unchecked(value, BalanceKind::Available);
                warn!(
                    intent = withdrawal.id,
                    "withdrawal rolled back after journal failure"
                );
                Err(LedgerError::MaterializationFailure(source))
            }
        }
    }

    /// Materialize a deposit: credit the account and append one entry.
    /// Called with the account lock held.
    pub(crate) fn deposit_entry(
        &self,
        deposit: &Deposit,
        state: &mut AccountState,
    ) -> Result<TransactionEntry, LedgerError> {
        let source = IntentRef::Deposit(deposit.id);
        if let [entry] = self.journal.entries_for_intent(source).as_slice() {
            return Ok(entry.clone());
        }

        let value = deposit.value;
        state.apply(value, BalanceKind::Available)?;

        let draft = EntryDraft {
            account: deposit.account,
            kind: TransactionKind::Deposit,
            status: TransactionStatus::Processed,
            value,
            balance: state.balance().available,
            source: Some(source),
            reverses: None,
        };

        match self.append_with_retry(draft) {
            Ok(entry) => Ok(entry),
            Err(source) => {
                state.apply_unchecked(-value, BalanceKind::Available);
                warn!(intent = deposit.id, "deposit rolled back after journal failure");
                Err(LedgerError::MaterializationFailure(source))
            }
        }
    }

    /// Append a compensating entry for `original` and apply the opposite
    /// delta. Called with the owner's account lock held.
    pub(crate) fn correction_entry(
        &self,
        original: &TransactionEntry,
        state: &mut AccountState,
    ) -> Result<TransactionEntry, LedgerError> {
        let delta = -original.value;
        state.apply(delta, BalanceKind::Available)?;

        let draft = EntryDraft {
            account: original.account,
            kind: TransactionKind::Reversal,
            status: TransactionStatus::Reversed,
            value: delta,
            balance: state.balance().available,
            source: None,
            reverses: Some(original.id),
        };

        match self.append_with_retry(draft) {
            Ok(entry) => Ok(entry),
            Err(source) => {
                state.apply_unchecked(-delta, BalanceKind::Available);
                warn!(entry = original.id, "reversal rolled back after journal failure");
                Err(LedgerError::MaterializationFailure(source))
            }
        }
    }

    fn append_with_retry(&self, draft: EntryDraft) -> Result<TransactionEntry, JournalError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.journal.append(draft.clone()) {
                Ok(entry) => return Ok(entry),
                Err(err) if attempt < MAX_APPEND_RETRIES => {
                    warn!(attempt, error = %err, "journal append failed, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn append_pair_with_retry(
        &self,
        first: EntryDraft,
        second: EntryDraft,
    ) -> Result<(TransactionEntry, TransactionEntry), JournalError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.journal.append_pair(first.clone(), second.clone()) {
                Ok(pair) => return Ok(pair),
                Err(err) if attempt < MAX_APPEND_RETRIES => {
                    warn!(attempt, error = %err, "journal append failed, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Arm a one-shot failure between the debit and credit legs of the next
    /// transfer materialization.
    #[cfg(test)]
    pub(crate) fn fail_between_legs(&self) {
        self.fail_between_legs
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_leg_fault(&self) -> bool {
        self.fail_between_legs
            .swap(false, std::sync::atomic::Ordering::SeqCst)
    }
}

//! Core domain types for the ledger.

use crate::Amount;

/// Ledger account identifier.
pub type AccountId = u32;

/// Intent record identifier, supplied by the caller. Doubles as the
/// idempotency key for retries.
pub type IntentId = u64;

/// Journal entry identifier, assigned by the transaction log in commit order.
pub type EntryId = u64;

/// Bank identifier in the external bank directory.
pub type BankId = u32;

/// Linked external bank-account identifier.
pub type BankAccountId = u32;

/// What a journal entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Debit leg of a transfer between two ledger accounts.
    TransferOut,
    /// Credit leg of a transfer between two ledger accounts.
    TransferIn,
    /// Debit paid out to an external bank account.
    Withdrawal,
    /// Credit into a ledger account.
    Deposit,
    /// Compensating entry neutralizing an earlier entry.
    Reversal,
}

/// Status stamped on a journal entry when it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Processed,
    Failed,
    Reversed,
}

/// Lifecycle of an intent record. `Processed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    Pending,
    Processed,
    Failed,
}

/// Back-reference from a journal entry to the intent that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentRef {
    Transfer(IntentId),
    Withdrawal(IntentId),
    Deposit(IntentId),
}

/// Immutable journal entry. `balance` is the owner's available balance
/// after this entry applied; corrections reference the entry they
/// neutralize through `reverses` and are never edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEntry {
    pub id: EntryId,
    pub account: AccountId,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub value: Amount,
    pub balance: Amount,
    pub source: Option<IntentRef>,
    pub reverses: Option<EntryId>,
}

/// Intent to move `value` from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub id: IntentId,
    pub from: AccountId,
    pub to: AccountId,
    pub value: Amount,
    pub status: IntentStatus,
    /// Journal ids of the (debit, credit) pair once materialized.
    pub entries: Option<(EntryId, EntryId)>,
}

/// Intent to pay `value` out of `account` to a linked external bank account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawal {
    pub id: IntentId,
    pub account: AccountId,
    pub destination: BankAccountId,
    pub value: Amount,
    /// Fee schedule captured from the account's policy at execution time.
    /// Settled by the payment rail, never debited from the ledger.
    pub rate: Amount,
    pub status: IntentStatus,
    pub entry: Option<EntryId>,
}

/// Intent to credit `value` into `account`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    pub id: IntentId,
    pub account: AccountId,
    pub value: Amount,
    pub status: IntentStatus,
    pub entry: Option<EntryId>,
}

/// One intent record of any kind, as stored in the ledger's registry.
#[derive(Debug, Clone)]
pub enum Intent {
    Transfer(Transfer),
    Withdrawal(Withdrawal),
    Deposit(Deposit),
}

/// A money-moving command, the possible inputs of the command runner.
#[derive(Debug, Clone)]
pub enum LedgerCommand {
    Deposit {
        tx: IntentId,
        account: AccountId,
        amount: Amount,
    },
    Transfer {
        tx: IntentId,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    },
    Withdrawal {
        tx: IntentId,
        account: AccountId,
        destination: BankAccountId,
        amount: Amount,
    },
}

//! Error taxonomy for ledger operations.

use thiserror::Error;

use crate::Amount;
use crate::balance::BalanceError;
use crate::journal::JournalError;
use crate::model::{AccountId, BankAccountId, EntryId, IntentId};
use crate::policy::PolicyBound;

/// Error returned by [`Ledger`](super::Ledger) operations.
///
/// Validation errors are raised before any mutation; `MaterializationFailure`
/// is the only kind that leaves a persisted record, and that record is a
/// terminal `Failed` intent with every balance change rolled back.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("value must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("account {0} cannot transfer to itself")]
    SelfTransferNotAllowed(AccountId),

    #[error(
        "insufficient available funds on account {account}: available {available}, requested {requested}"
    )]
    InsufficientFunds {
        account: AccountId,
        available: Amount,
        requested: Amount,
    },

    #[error("account {0} does not exist or is frozen")]
    AccountUnavailable(AccountId),

    #[error("bank account {0} does not exist or does not belong to the caller")]
    DestinationUnavailable(BankAccountId),

    #[error("withdrawal of {requested} violates the {bound} bound of {bound_value}")]
    PolicyViolation {
        requested: Amount,
        bound: PolicyBound,
        bound_value: Amount,
    },

    #[error("ledger entries could not be written: {0}")]
    MaterializationFailure(#[from] JournalError),

    #[error("operation id {0} was already used by a different operation")]
    DuplicateOperation(IntentId),

    #[error("entry {0} cannot be reversed")]
    EntryNotReversible(EntryId),
}

impl From<BalanceError> for LedgerError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::UnknownAccount(id) => LedgerError::AccountUnavailable(id),
            BalanceError::Insufficient {
                account,
                available,
                requested,
                ..
            } => LedgerError::InsufficientFunds {
                account,
                available,
                requested,
            },
        }
    }
}

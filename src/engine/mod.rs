//! Ledger engine.
//!
//! The ledger validates money-moving requests, persists intent records,
//! and materializes journal entries plus balance updates through the
//! [`Materializer`]. It also accepts an async stream of commands.
//!
//! Every operation is keyed by a caller-supplied intent id. Replaying a
//! processed intent with identical parameters returns the original record;
//! replaying a failed one retries materialization under the same key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::Amount;
use crate::balance::{Balance, BalanceStore};
use crate::bank::BankDirectory;
use crate::journal::TransactionLog;
use crate::model::{
    AccountId, BankAccountId, Deposit, EntryId, Intent, IntentId, IntentStatus, LedgerCommand,
    TransactionEntry, TransactionKind, Transfer, Withdrawal,
};
use crate::policy::PolicyStore;

mod dispatcher;
pub use dispatcher::Materializer;

mod error;
pub use error::LedgerError;

/// An account whose stored balance no longer matches its replayed entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divergence {
    pub account: AccountId,
    pub available: Amount,
    pub replayed: Amount,
}

/// The ledger: balance store, transaction log, policy and bank lookups,
/// and the intent registry, wired together at construction.
pub struct Ledger {
    balances: Arc<BalanceStore>,
    journal: Arc<TransactionLog>,
    policies: Arc<PolicyStore>,
    banks: Arc<BankDirectory>,
    materializer: Materializer,
    intents: Mutex<HashMap<IntentId, Intent>>,
}

/// Public API
impl Ledger {
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(BalanceStore::new()),
            Arc::new(TransactionLog::new()),
            Arc::new(PolicyStore::new()),
            Arc::new(BankDirectory::new()),
        )
    }

    /// Build a ledger over explicitly provided collaborators.
    pub fn with_parts(
        balances: Arc<BalanceStore>,
        journal: Arc<TransactionLog>,
        policies: Arc<PolicyStore>,
        banks: Arc<BankDirectory>,
    ) -> Self {
        let materializer = Materializer::new(journal.clone());
        Self {
            balances,
            journal,
            policies,
            banks,
            materializer,
            intents: Mutex::new(HashMap::new()),
        }
    }

    pub fn balances(&self) -> &BalanceStore {
        &self.balances
    }

    pub fn journal(&self) -> &TransactionLog {
        &self.journal
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub fn banks(&self) -> &BankDirectory {
        &self.banks
    }

    /// Create a ledger account with a zero balance. Idempotent.
    pub fn open_account(&self, account: AccountId) {
        self.balances.open(account);
    }

    pub fn balance(&self, account: AccountId) -> Option<Balance> {
        self.balances.get(account)
    }

    /// Snapshot of every account as `(id, balance, frozen)`, ascending by id.
    pub fn snapshot(&self) -> Vec<(AccountId, Balance, bool)> {
        self.balances.snapshot()
    }

    /// Credit `value` into `account`, opening the account if needed.
    pub fn deposit(
        &self,
        id: IntentId,
        account: AccountId,
        value: Amount,
    ) -> Result<Deposit, LedgerError> {
        if let Some(done) = self.gate_deposit(id, account, value, false)? {
            return Ok(done);
        }
        if !value.is_positive() {
            return Err(LedgerError::InvalidAmount(value));
        }

        self.balances.open(account);
        self.balances.with_account(account, |state| {
            if state.is_frozen() {
                return Err(LedgerError::AccountUnavailable(account));
            }
            if let Some(done) = self.gate_deposit(id, account, value, true)? {
                return Ok(done);
            }

            let mut deposit = Deposit {
                id,
                account,
                value,
                status: IntentStatus::Pending,
                entry: None,
            };
            match self.materializer.deposit_entry(&deposit, state) {
                Ok(entry) => {
                    deposit.status = IntentStatus::Processed;
                    deposit.entry = Some(entry.id);
                    self.record(Intent::Deposit(deposit.clone()));
                    Ok(deposit)
                }
                Err(err) => {
                    deposit.status = IntentStatus::Failed;
                    self.record(Intent::Deposit(deposit));
                    Err(err)
                }
            }
        })?
    }

    /// Move `value` from `from` to `to`.
    ///
    /// Preconditions are checked with no side effects on failure; the funds
    /// check, the intent commit, and materialization all run under the pair
    /// lock, so the decision and the write are one atomic unit. The
    /// returned transfer is `Processed` only after both entries and both
    /// balance updates have committed.
    pub fn transfer(
        &self,
        id: IntentId,
        from: AccountId,
        to: AccountId,
        value: Amount,
    ) -> Result<Transfer, LedgerError> {
        if let Some(done) = self.gate_transfer(id, from, to, value, false)? {
            return Ok(done);
        }
        if from == to {
            return Err(LedgerError::SelfTransferNotAllowed(from));
        }
        if !value.is_positive() {
            return Err(LedgerError::InvalidAmount(value));
        }

        self.balances.with_pair(from, to, |sender, receiver| {
            let available = sender.balance().available;
            if available < value {
                return Err(LedgerError::InsufficientFunds {
                    account: from,
                    available,
                    requested: value,
                });
            }
            if sender.is_frozen() {
                return Err(LedgerError::AccountUnavailable(from));
            }
            if receiver.is_frozen() {
                return Err(LedgerError::AccountUnavailable(to));
            }
            // Re-check the registry under the pair lock; this claim is the
            // authoritative one.
            if let Some(done) = self.gate_transfer(id, from, to, value, true)? {
                return Ok(done);
            }

            let mut transfer = Transfer {
                id,
                from,
                to,
                value,
                status: IntentStatus::Pending,
                entries: None,
            };
            match self.materializer.transfer_entries(&transfer, sender, receiver) {
                Ok((debit, credit)) => {
                    transfer.status = IntentStatus::Processed;
                    transfer.entries = Some((debit.id, credit.id));
                    self.record(Intent::Transfer(transfer.clone()));
                    Ok(transfer)
                }
                Err(err) => {
                    transfer.status = IntentStatus::Failed;
                    self.record(Intent::Transfer(transfer));
                    Err(err)
                }
            }
        })?
    }

    /// Pay `value` out of `account` to a registered bank account.
    pub fn withdraw(
        &self,
        id: IntentId,
        account: AccountId,
        destination: BankAccountId,
        value: Amount,
    ) -> Result<Withdrawal, LedgerError> {
        if let Some(done) = self.gate_withdrawal(id, account, destination, value, false)? {
            return Ok(done);
        }
        if !value.is_positive() {
            return Err(LedgerError::InvalidAmount(value));
        }

        let dest = self
            .banks
            .get(destination)
            .ok_or(LedgerError::DestinationUnavailable(destination))?;
        if dest.owner != account {
            return Err(LedgerError::DestinationUnavailable(destination));
        }

        let policy = self.policies.policy_for(account);
        policy
            .check(value)
            .map_err(|breach| LedgerError::PolicyViolation {
                requested: value,
                bound: breach.bound,
                bound_value: breach.bound_value,
            })?;
        let rate = policy.rate_for(dest.is_third_party());

        self.balances.with_account(account, |state| {
            let available = state.balance().available;
            if available < value {
                return Err(LedgerError::InsufficientFunds {
                    account,
                    available,
                    requested: value,
                });
            }
            if state.is_frozen() {
                return Err(LedgerError::AccountUnavailable(account));
            }
            if let Some(done) = self.gate_withdrawal(id, account, destination, value, true)? {
                return Ok(done);
            }

            let mut withdrawal = Withdrawal {
                id,
                account,
                destination,
                value,
                rate,
                status: IntentStatus::Pending,
                entry: None,
            };
            match self.materializer.withdrawal_entry(&withdrawal, state) {
                Ok(entry) => {
                    withdrawal.status = IntentStatus::Processed;
                    withdrawal.entry = Some(entry.id);
                    self.record(Intent::Withdrawal(withdrawal.clone()));
                    Ok(withdrawal)
                }
                Err(err) => {
                    withdrawal.status = IntentStatus::Failed;
                    self.record(Intent::Withdrawal(withdrawal));
                    Err(err)
                }
            }
        })?
    }

    /// Neutralize one journal entry with a compensating `Reversal` entry.
    /// History is never edited; an entry can be reversed at most once, and
    /// a reversal cannot itself be reversed.
    pub fn reverse_entry(&self, entry: EntryId) -> Result<TransactionEntry, LedgerError> {
        let original = self
            .journal
            .get(entry)
            .ok_or(LedgerError::EntryNotReversible(entry))?;
        if matches!(original.kind, TransactionKind::Reversal) {
            return Err(LedgerError::EntryNotReversible(entry));
        }

        self.balances.with_account(original.account, |state| {
            // The reversed-once check lives under the owner's lock, where
            // the correction is appended.
            if self.journal.reversal_of(entry).is_some() {
                return Err(LedgerError::EntryNotReversible(entry));
            }
            self.materializer.correction_entry(&original, state)
        })?
    }

    /// Replay every account's entries and report stored balances that the
    /// journal does not reproduce.
    pub fn reconcile(&self) -> Vec<Divergence> {
        self.snapshot()
            .into_iter()
            .filter_map(|(account, balance, _)| {
                let replayed = self.journal.replayed_available(account);
                (balance.available != replayed).then_some(Divergence {
                    account,
                    available: balance.available,
                    replayed,
                })
            })
            .collect()
    }

    pub fn get_transfer(&self, id: IntentId) -> Option<Transfer> {
        match self.intents().get(&id) {
            Some(Intent::Transfer(transfer)) => Some(transfer.clone()),
            _ => None,
        }
    }

    pub fn get_withdrawal(&self, id: IntentId) -> Option<Withdrawal> {
        match self.intents().get(&id) {
            Some(Intent::Withdrawal(withdrawal)) => Some(withdrawal.clone()),
            _ => None,
        }
    }

    pub fn get_deposit(&self, id: IntentId) -> Option<Deposit> {
        match self.intents().get(&id) {
            Some(Intent::Deposit(deposit)) => Some(deposit.clone()),
            _ => None,
        }
    }

    /// Apply a single command on top of the current ledger state.
    pub fn apply(&self, command: LedgerCommand) -> Result<(), LedgerError> {
        match command {
            LedgerCommand::Deposit { tx, account, amount } => {
                let result = self.deposit(tx, account, amount);
                Self::log_result("deposit", tx, account, amount, &result);
                result?;
            }
            LedgerCommand::Transfer { tx, from, to, amount } => {
                let result = self.transfer(tx, from, to, amount);
                Self::log_result("transfer", tx, from, amount, &result);
                result?;
            }
            LedgerCommand::Withdrawal {
                tx,
                account,
                destination,
                amount,
            } => {
                let result = self.withdraw(tx, account, destination, amount);
                Self::log_result("withdrawal", tx, account, amount, &result);
                result?;
            }
        }
        Ok(())
    }

    /// Run the ledger over the given command stream.
    pub async fn run(&self, mut stream: impl Stream<Item = LedgerCommand> + Unpin) {
        while let Some(command) = stream.next().await {
            // a failed command should not stop the run, so the result is
            // only logged
            let _ = self.apply(command);
        }
    }
}

/// Private API
impl Ledger {
    /// Small helper to log `apply` results
    fn log_result<T>(
        op: &str,
        tx: IntentId,
        account: AccountId,
        amount: Amount,
        result: &Result<T, LedgerError>,
    ) {
        match result {
            Ok(_) => {
                info!(tx, account, amount = %amount, "{op} applied");
            }
            Err(e) => {
                info!(tx, account, amount = %amount, reason = %e, "{op} skipped");
            }
        }
    }

    fn intents(&self) -> MutexGuard<'_, HashMap<IntentId, Intent>> {
        // never held while taking account locks; see the gate call sites
        self.intents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, intent: Intent) {
        let id = match &intent {
            Intent::Transfer(t) => t.id,
            Intent::Withdrawal(w) => w.id,
            Intent::Deposit(d) => d.id,
        };
        self.intents().insert(id, intent);
    }

    /// Idempotency gate for transfers. Returns the recorded transfer for a
    /// success-replay, `None` when the caller should proceed, and an error
    /// when the id is taken. With `claim` set (account locks held) a
    /// `Pending` record is installed so concurrent resubmissions are
    /// rejected rather than applied twice.
    fn gate_transfer(
        &self,
        id: IntentId,
        from: AccountId,
        to: AccountId,
        value: Amount,
        claim: bool,
    ) -> Result<Option<Transfer>, LedgerError> {
        let mut intents = self.intents();
        match intents.get(&id) {
            Some(Intent::Transfer(prev))
                if prev.from == from && prev.to == to && prev.value == value =>
            {
                match prev.status {
                    IntentStatus::Processed => return Ok(Some(prev.clone())),
                    IntentStatus::Pending => return Err(LedgerError::DuplicateOperation(id)),
                    IntentStatus::Failed => {}
                }
            }
            Some(_) => return Err(LedgerError::DuplicateOperation(id)),
            None => {}
        }
        if claim {
            intents.insert(
                id,
                Intent::Transfer(Transfer {
                    id,
                    from,
                    to,
                    value,
                    status: IntentStatus::Pending,
                    entries: None,
                }),
            );
        }
        Ok(None)
    }

    fn gate_withdrawal(
        &self,
        id: IntentId,
        account: AccountId,
        destination: BankAccountId,
        value: Amount,
        claim: bool,
    ) -> Result<Option<Withdrawal>, LedgerError> {
        let mut intents = self.intents();
        match intents.get(&id) {
            Some(Intent::Withdrawal(prev))
                if prev.account == account
                    && prev.destination == destination
                    && prev.value == value =>
            {
                match prev.status {
                    IntentStatus::Processed => return Ok(Some(prev.clone())),
                    IntentStatus::Pending => return Err(LedgerError::DuplicateOperation(id)),
                    IntentStatus::Failed => {}
                }
            }
            Some(_) => return Err(LedgerError::DuplicateOperation(id)),
            None => {}
        }
        if claim {
            intents.insert(
                id,
                Intent::Withdrawal(Withdrawal {
                    id,
                    account,
                    destination,
                    value,
                    rate: Amount::ZERO,
                    status: IntentStatus::Pending,
                    entry: None,
                }),
            );
        }
        Ok(None)
    }

    fn gate_deposit(
        &self,
        id: IntentId,
        account: AccountId,
        value: Amount,
        claim: bool,
    ) -> Result<Option<Deposit>, LedgerError> {
        let mut intents = self.intents();
        match intents.get(&id) {
            Some(Intent::Deposit(prev)) if prev.account == account && prev.value == value => {
                match prev.status {
                    IntentStatus::Processed => return Ok(Some(prev.clone())),
                    IntentStatus::Pending => return Err(LedgerError::DuplicateOperation(id)),
                    IntentStatus::Failed => {}
                }
            }
            Some(_) => return Err(LedgerError::DuplicateOperation(id)),
            None => {}
        }
        if claim {
            intents.insert(
                id,
                Intent::Deposit(Deposit {
                    id,
                    account,
                    value,
                    status: IntentStatus::Pending,
                    entry: None,
                }),
            );
        }
        Ok(None)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

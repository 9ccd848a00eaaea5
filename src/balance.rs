//! Materialized balance state, one record per account.
//!
//! The store is the only mutable shared resource in the ledger core. Every
//! mutation goes through [`AccountState::apply`] under the account's lock,
//! so a read-decide-write sequence is atomic with respect to concurrent
//! writers of the same account.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;

use crate::Amount;
use crate::model::AccountId;

/// Current balance of one account, in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    /// Funds the owner can spend. Never negative after a committed operation.
    pub available: Amount,
    /// Funds held back. Never negative.
    pub blocked: Amount,
    /// Pending credits not yet available. May be negative.
    pub future: Amount,
}

/// Which balance component a delta applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceKind {
    Available,
    Blocked,
    Future,
}

/// Error raised by balance mutations.
#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error(
        "insufficient {kind:?} funds on account {account}: available {available}, requested {requested}"
    )]
    Insufficient {
        account: AccountId,
        kind: BalanceKind,
        available: Amount,
        requested: Amount,
    },
}

/// Balance plus the account-level frozen flag. `frozen` gates new
/// operations; it is unrelated to the `blocked` funds component.
#[derive(Debug)]
pub struct AccountState {
    id: AccountId,
    balance: Balance,
    frozen: bool,
}

impl AccountState {
    pub(crate) fn new(id: AccountId) -> Self {
        Self {
            id,
            balance: Balance::default(),
            frozen: false,
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn balance(&self) -> Balance {
        self.balance
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub(crate) fn unfreeze(&mut self) {
        self.frozen = false;
    }

    /// Apply a delta to one balance component. Rejects the mutation if
    /// `available` or `blocked` would go negative; `future` is unchecked.
    pub(crate) fn apply(
        &mut self,
        delta: Amount,
        kind: BalanceKind,
    ) -> Result<Balance, BalanceError> {
        let current = *self.slot(kind);
        let next = current + delta;
        if !matches!(kind, BalanceKind::Future) && next < Amount::ZERO {
            return Err(BalanceError::Insufficient {
                account: self.id,
                kind,
                available: current,
                requested: -delta,
            });
        }
        *self.slot(kind) = next;
        Ok(self.balance)
    }

    /// Apply a delta without the non-negative check. Only for undoing a
    /// delta applied earlier in the same critical section.
    pub(crate) fn apply_unchecked(&mut self, delta: Amount, kind: BalanceKind) {
        *self.slot(kind) += delta;
    }

    fn slot(&mut self, kind: BalanceKind) -> &mut Amount {
        match kind {
            BalanceKind::Available => &mut self.balance.available,
            BalanceKind::Blocked => &mut self.balance.blocked,
            BalanceKind::Future => &mut self.balance.future,
        }
    }
}

/// Concurrent store of account balances.
///
/// Accounts live behind per-account mutexes inside a shared map, so
/// operations on disjoint accounts proceed in parallel while operations on
/// the same account serialize.
#[derive(Debug, Default)]
pub struct BalanceStore {
    accounts: RwLock<HashMap<AccountId, Arc<Mutex<AccountState>>>>,
}

impl BalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the account with a zero balance. Idempotent; accounts are
    /// never removed.
    pub fn open(&self, id: AccountId) {
        let mut accounts = self
            .accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        accounts
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(AccountState::new(id))));
    }

    /// Snapshot of one account's balance.
    pub fn get(&self, id: AccountId) -> Option<Balance> {
        let arc = self.account(id)?;
        let state = arc.lock().unwrap_or_else(PoisonError::into_inner);
        Some(state.balance())
    }

    pub fn freeze(&self, id: AccountId) -> Result<(), BalanceError> {
        self.with_account(id, |state| state.freeze())
    }

    pub fn unfreeze(&self, id: AccountId) -> Result<(), BalanceError> {
        self.with_account(id, |state| state.unfreeze())
    }

    /// Atomically apply a delta to one account.
    pub fn apply_delta(
        &self,
        id: AccountId,
        delta: Amount,
        kind: BalanceKind,
    ) -> Result<Balance, BalanceError> {
        self.with_account(id, |state| state.apply(delta, kind))?
    }

    /// All known account ids, ascending.
    pub fn account_ids(&self) -> Vec<AccountId> {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<AccountId> = accounts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of every account as `(id, balance, frozen)`, ascending by id.
    pub fn snapshot(&self) -> Vec<(AccountId, Balance, bool)> {
        self.account_ids()
            .into_iter()
            .filter_map(|id| {
                let arc = self.account(id)?;
                let state = arc.lock().unwrap_or_else(PoisonError::into_inner);
                Some((id, state.balance(), state.is_frozen()))
            })
            .collect()
    }

    /// Run `f` under the account's lock.
    pub fn with_account<R>(
        &self,
        id: AccountId,
        f: impl FnOnce(&mut AccountState) -> R,
    ) -> Result<R, BalanceError> {
        let arc = self.account(id).ok_or(BalanceError::UnknownAccount(id))?;
        let mut state = arc.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut state))
    }

    /// Run `f` with both accounts locked. Locks are always acquired in
    /// ascending id order, so overlapping pairs cannot deadlock; `f` still
    /// receives the states in `(a, b)` argument order.
    pub fn with_pair<R>(
        &self,
        a: AccountId,
        b: AccountId,
        f: impl FnOnce(&mut AccountState, &mut AccountState) -> R,
    ) -> Result<R, BalanceError> {
        debug_assert_ne!(a, b);
        let arc_a = self.account(a).ok_or(BalanceError::UnknownAccount(a))?;
        let arc_b = self.account(b).ok_or(BalanceError::UnknownAccount(b))?;

        let (first, second) = if a < b { (&arc_a, &arc_b) } else { (&arc_b, &arc_a) };
        let mut guard_first = first.lock().unwrap_or_else(PoisonError::into_inner);
        let mut guard_second = second.lock().unwrap_or_else(PoisonError::into_inner);

        if a < b {
            Ok(f(&mut guard_first, &mut guard_second))
        } else {
            Ok(f(&mut guard_second, &mut guard_first))
        }
    }

    fn account(&self, id: AccountId) -> Option<Arc<Mutex<AccountState>>> {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        accounts.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minor(v: i64) -> Amount {
        Amount::from_minor(v)
    }

    #[test]
    fn open_creates_zero_account() {
        let store = BalanceStore::new();
        store.open(1);

        assert_eq!(store.get(1), Some(Balance::default()));
    }

    #[test]
    fn open_is_idempotent() {
        let store = BalanceStore::new();
        store.open(1);
        store.apply_delta(1, minor(100), BalanceKind::Available).unwrap();
        store.open(1);

        assert_eq!(store.get(1).unwrap().available, minor(100));
    }

    #[test]
    fn get_unknown_account_is_none() {
        let store = BalanceStore::new();
        assert_eq!(store.get(9), None);
    }

    #[test]
    fn apply_delta_moves_each_component() {
        let store = BalanceStore::new();
        store.open(1);

        store.apply_delta(1, minor(100), BalanceKind::Available).unwrap();
        store.apply_delta(1, minor(40), BalanceKind::Blocked).unwrap();
        store.apply_delta(1, minor(-25), BalanceKind::Future).unwrap();

        let balance = store.get(1).unwrap();
        assert_eq!(balance.available, minor(100));
        assert_eq!(balance.blocked, minor(40));
        assert_eq!(balance.future, minor(-25));
    }

    #[test]
    fn apply_delta_rejects_negative_available() {
        let store = BalanceStore::new();
        store.open(1);
        store.apply_delta(1, minor(50), BalanceKind::Available).unwrap();

        let result = store.apply_delta(1, minor(-51), BalanceKind::Available);
        assert!(matches!(
            result,
            Err(BalanceError::Insufficient {
                account: 1,
                kind: BalanceKind::Available,
                ..
            })
        ));

        // Balance unchanged
        assert_eq!(store.get(1).unwrap().available, minor(50));
    }

    #[test]
    fn apply_delta_rejects_negative_blocked() {
        let store = BalanceStore::new();
        store.open(1);

        let result = store.apply_delta(1, minor(-1), BalanceKind::Blocked);
        assert!(matches!(
            result,
            Err(BalanceError::Insufficient {
                kind: BalanceKind::Blocked,
                ..
            })
        ));
    }

    #[test]
    fn future_may_go_negative() {
        let store = BalanceStore::new();
        store.open(1);

        let balance = store.apply_delta(1, minor(-300), BalanceKind::Future).unwrap();
        assert_eq!(balance.future, minor(-300));
    }

    #[test]
    fn apply_delta_unknown_account_fails() {
        let store = BalanceStore::new();
        let result = store.apply_delta(9, minor(1), BalanceKind::Available);
        assert!(matches!(result, Err(BalanceError::UnknownAccount(9))));
    }

    #[test]
    fn freeze_and_unfreeze() {
        let store = BalanceStore::new();
        store.open(1);

        store.freeze(1).unwrap();
        assert!(store.with_account(1, |s| s.is_frozen()).unwrap());

        store.unfreeze(1).unwrap();
        assert!(!store.with_account(1, |s| s.is_frozen()).unwrap());
    }

    #[test]
    fn snapshot_is_sorted_by_id() {
        let store = BalanceStore::new();
        store.open(3);
        store.open(1);
        store.open(2);

        let ids: Vec<AccountId> = store.snapshot().into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn with_pair_passes_states_in_argument_order() {
        let store = BalanceStore::new();
        store.open(1);
        store.open(2);
        store.apply_delta(1, minor(100), BalanceKind::Available).unwrap();

        // Descending argument order must still map a -> first closure arg
        store
            .with_pair(2, 1, |second, first| {
                assert_eq!(second.id(), 2);
                assert_eq!(first.id(), 1);
                assert_eq!(first.balance().available, minor(100));
            })
            .unwrap();
    }

    #[test]
    fn with_pair_unknown_account_fails() {
        let store = BalanceStore::new();
        store.open(1);

        let result = store.with_pair(1, 9, |_, _| ());
        assert!(matches!(result, Err(BalanceError::UnknownAccount(9))));
    }

    #[test]
    fn concurrent_deltas_on_one_account_do_not_lose_updates() {
        let store = BalanceStore::new();
        store.open(1);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        store.apply_delta(1, minor(1), BalanceKind::Available).unwrap();
                    }
                });
            }
        });

        assert_eq!(store.get(1).unwrap().available, minor(8000));
    }
}

//! Withdrawal policy lookup.
//!
//! Bounds and rates are static stub constants today, with a per-account
//! override hook so the schedule can move to real configuration without
//! touching the engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use crate::Amount;
use crate::model::AccountId;

const DEFAULT_RATE: Amount = Amount::from_minor(3390);
const DEFAULT_THIRD_PARTY_RATE: Amount = Amount::from_minor(4890);
const DEFAULT_LIMIT: Amount = Amount::from_minor(1234);
const DEFAULT_MIN_VALUE: Amount = Amount::from_minor(1000);

/// Per-account withdrawal policy, in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithdrawalPolicy {
    /// Fee charged by the payment rail for withdrawals to own accounts.
    pub rate: Amount,
    /// Fee for withdrawals to third-party accounts.
    pub third_party_rate: Amount,
    /// Largest value a single withdrawal may move.
    pub limit: Amount,
    /// Smallest value a single withdrawal may move.
    pub min_value: Amount,
}

impl Default for WithdrawalPolicy {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            third_party_rate: DEFAULT_THIRD_PARTY_RATE,
            limit: DEFAULT_LIMIT,
            min_value: DEFAULT_MIN_VALUE,
        }
    }
}

/// Which policy bound a withdrawal violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyBound {
    Minimum,
    Limit,
}

impl fmt::Display for PolicyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyBound::Minimum => write!(f, "minimum value"),
            PolicyBound::Limit => write!(f, "limit"),
        }
    }
}

/// A violated bound and its configured value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyBreach {
    pub bound: PolicyBound,
    pub bound_value: Amount,
}

impl WithdrawalPolicy {
    /// Check a withdrawal value against the bounds. Both bounds are
    /// inclusive.
    pub fn check(&self, value: Amount) -> Result<(), PolicyBreach> {
        if value < self.min_value {
            return Err(PolicyBreach {
                bound: PolicyBound::Minimum,
                bound_value: self.min_value,
            });
        }
        if value > self.limit {
            return Err(PolicyBreach {
                bound: PolicyBound::Limit,
                bound_value: self.limit,
            });
        }
        Ok(())
    }

    pub fn rate_for(&self, third_party: bool) -> Amount {
        if third_party {
            self.third_party_rate
        } else {
            self.rate
        }
    }
}

/// Policy lookup: a default schedule plus per-account overrides.
#[derive(Debug, Default)]
pub struct PolicyStore {
    default: WithdrawalPolicy,
    overrides: RwLock<HashMap<AccountId, WithdrawalPolicy>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(default: WithdrawalPolicy) -> Self {
        Self {
            default,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Install an override for one account.
    pub fn set(&self, account: AccountId, policy: WithdrawalPolicy) {
        let mut overrides = self
            .overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        overrides.insert(account, policy);
    }

    pub fn policy_for(&self, account: AccountId) -> WithdrawalPolicy {
        let overrides = self
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        overrides.get(&account).copied().unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_carries_stub_schedule() {
        let policy = WithdrawalPolicy::default();
        assert_eq!(policy.rate, Amount::from_minor(3390));
        assert_eq!(policy.third_party_rate, Amount::from_minor(4890));
        assert_eq!(policy.limit, Amount::from_minor(1234));
        assert_eq!(policy.min_value, Amount::from_minor(1000));
    }

    fn policy(min: i64, limit: i64) -> WithdrawalPolicy {
        WithdrawalPolicy {
            min_value: Amount::from_minor(min),
            limit: Amount::from_minor(limit),
            ..WithdrawalPolicy::default()
        }
    }

    #[test]
    fn check_rejects_below_minimum() {
        let breach = policy(1000, 100_000).check(Amount::from_minor(999)).unwrap_err();
        assert_eq!(breach.bound, PolicyBound::Minimum);
        assert_eq!(breach.bound_value, Amount::from_minor(1000));
    }

    #[test]
    fn check_rejects_above_limit() {
        let breach = policy(1000, 100_000)
            .check(Amount::from_minor(100_001))
            .unwrap_err();
        assert_eq!(breach.bound, PolicyBound::Limit);
        assert_eq!(breach.bound_value, Amount::from_minor(100_000));
    }

    #[test]
    fn check_accepts_bounds_inclusive() {
        let p = policy(1000, 100_000);
        assert!(p.check(Amount::from_minor(1000)).is_ok());
        assert!(p.check(Amount::from_minor(100_000)).is_ok());
        assert!(p.check(Amount::from_minor(50_000)).is_ok());
    }

    #[test]
    fn rate_for_picks_third_party_schedule() {
        let policy = WithdrawalPolicy::default();
        assert_eq!(policy.rate_for(false), policy.rate);
        assert_eq!(policy.rate_for(true), policy.third_party_rate);
    }

    #[test]
    fn store_returns_default_until_overridden() {
        let store = PolicyStore::with_default(policy(500, 2000));
        assert_eq!(store.policy_for(1).min_value, Amount::from_minor(500));

        store.set(1, policy(100, 9000));
        assert_eq!(store.policy_for(1).min_value, Amount::from_minor(100));
        assert_eq!(store.policy_for(2).min_value, Amount::from_minor(500));
    }
}

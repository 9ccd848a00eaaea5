//! Bank-account metadata: the destination side of withdrawals.
//!
//! The ledger core only ever reads this directory (`get`); registration and
//! its validation rules live here so the boundary is complete, but nothing
//! in the directory touches balances or the journal.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

use crate::model::{AccountId, BankAccountId, BankId};

/// A bank known to the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bank {
    pub id: BankId,
    pub name: String,
    pub short_name: String,
    pub code: String,
    pub ispb: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankAccountType {
    Checking,
    Savings,
}

/// Payee details required when the destination belongs to someone other
/// than the registering user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThirdParty {
    pub name: String,
    pub document: String,
}

/// A registered destination for withdrawals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserBankAccount {
    pub id: BankAccountId,
    pub owner: AccountId,
    pub bank: BankId,
    pub agency: String,
    pub account: String,
    pub account_type: BankAccountType,
    pub third_party: Option<ThirdParty>,
    pub default: bool,
}

impl UserBankAccount {
    pub fn is_third_party(&self) -> bool {
        self.third_party.is_some()
    }
}

/// Registration request for a new destination.
#[derive(Debug, Clone)]
pub struct NewBankAccount {
    pub owner: AccountId,
    pub bank: BankId,
    pub agency: String,
    pub account: String,
    pub account_type: BankAccountType,
    pub third_party: Option<ThirdParty>,
    pub default: bool,
}

/// Validation errors raised at registration time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BankAccountError {
    #[error("bank {0} is not registered")]
    UnknownBank(BankId),

    #[error("agency must be exactly 4 digits")]
    InvalidAgency,

    #[error("account number must be 1 to 21 digits")]
    InvalidAccountNumber,

    #[error("third-party document failed validation")]
    InvalidDocument,

    #[error("payee name must be at least two words of two characters each")]
    InvalidPayeeName,
}

#[derive(Debug, Default)]
struct DirectoryInner {
    banks: HashMap<BankId, Bank>,
    accounts: HashMap<BankAccountId, UserBankAccount>,
    next_account: BankAccountId,
}

/// In-memory bank and bank-account directory.
#[derive(Debug, Default)]
pub struct BankDirectory {
    inner: RwLock<DirectoryInner>,
}

impl BankDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bank(&self, bank: Bank) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.banks.insert(bank.id, bank);
    }

    pub fn bank(&self, id: BankId) -> Option<Bank> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.banks.get(&id).cloned()
    }

    /// Validate and store a new destination, returning its id.
    pub fn register(&self, new: NewBankAccount) -> Result<BankAccountId, BankAccountError> {
        let agency = new.agency.trim();
        if agency.len() != 4 || !agency.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BankAccountError::InvalidAgency);
        }

        let account = new.account.trim();
        if account.is_empty()
            || account.len() > 21
            || !account.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(BankAccountError::InvalidAccountNumber);
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.banks.contains_key(&new.bank) {
            return Err(BankAccountError::UnknownBank(new.bank));
        }

        if let Some(third) = &new.third_party {
            if !valid_cpf(&third.document) {
                return Err(BankAccountError::InvalidDocument);
            }
            if !valid_payee_name(&third.name) {
                return Err(BankAccountError::InvalidPayeeName);
            }
        }

        inner.next_account += 1;
        let id = inner.next_account;
        inner.accounts.insert(
            id,
            UserBankAccount {
                id,
                owner: new.owner,
                bank: new.bank,
                agency: agency.to_string(),
                account: account.to_string(),
                account_type: new.account_type,
                third_party: new.third_party,
                default: new.default,
            },
        );
        Ok(id)
    }

    /// Read-only lookup used by the withdrawal engine.
    pub fn get(&self, id: BankAccountId) -> Option<UserBankAccount> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.accounts.get(&id).cloned()
    }

    /// All destinations registered by one user.
    pub fn accounts_of(&self, owner: AccountId) -> Vec<UserBankAccount> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut accounts: Vec<UserBankAccount> = inner
            .accounts
            .values()
            .filter(|a| a.owner == owner)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.id);
        accounts
    }
}

/// CPF check-digit validation: 11 digits, not all equal, both mod-11
/// verification digits correct.
fn valid_cpf(document: &str) -> bool {
    let digits: Vec<u32> = document.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 11 {
        return false;
    }
    if digits.iter().all(|&d| d == digits[0]) {
        return false;
    }

    let check = |take: usize| -> u32 {
        let sum: u32 = digits
            .iter()
            .take(take)
            .enumerate()
            .map(|(i, &d)| d * (take as u32 + 1 - i as u32))
            .sum();
        sum * 10 % 11 % 10
    };

    check(9) == digits[9] && check(10) == digits[10]
}

fn valid_payee_name(name: &str) -> bool {
    let words: Vec<&str> = name.split_whitespace().collect();
    match (words.first(), words.last()) {
        (Some(first), Some(last)) if words.len() >= 2 => {
            first.chars().count() >= 2 && last.chars().count() >= 2
        }
        _ => false,
    }
}

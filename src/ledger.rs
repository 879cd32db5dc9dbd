//! Balance/margin ledger
//!
//! The only writer of `Account::balance`. Every operation is a single
//! read-modify-write under that account's lock, so concurrent placements
//! on one account cannot both pass the funds check.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::{Account, AccountId, AccountStore, BalanceSnapshot, Error, Result, ValidationError};
use crate::hub::HubPublisher;

/// Lazily-created mutex per key. Entries are dropped once nobody holds them.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self { locks: Mutex::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`. Must not be held across an await.
    pub fn with<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let lock = self
            .locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let entry = Entry { owner: self, key, lock };
        let _guard = entry.lock.lock();
        f()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

/// Drops the map entry on the way out, unwinding included.
struct Entry<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedLocks<K>,
    key: &'a K,
    lock: Arc<Mutex<()>>,
}

impl<K: Eq + Hash + Clone> Drop for Entry<'_, K> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock();
        // map + this clone
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(self.key);
        }
    }
}

/// Reserve / release / credit / snapshot, and nothing else.
pub struct Ledger {
    accounts: Arc<dyn AccountStore>,
    locks: KeyedLocks<AccountId>,
    hub: HubPublisher,
}

impl Ledger {
    pub fn new(accounts: Arc<dyn AccountStore>, hub: HubPublisher) -> Self {
        Self {
            accounts,
            locks: KeyedLocks::new(),
            hub,
        }
    }

    pub fn balance(&self, account_id: AccountId) -> Result<Decimal> {
        self.accounts
            .get(account_id)?
            .map(|a| a.balance)
            .ok_or_else(|| ValidationError::AccountNotFound(account_id).into())
    }

    /// Take `amount` out of the available balance. Fails without effect if
    /// the balance does not cover it.
    pub fn reserve(&self, account_id: AccountId, amount: Decimal) -> Result<Decimal> {
        check_amount(amount)?;
        self.apply(account_id, "reserve", amount, |balance| {
            if amount > balance {
                return Err(Error::InsufficientFunds {
                    required: amount,
                    available: balance,
                });
            }
            Ok(balance - amount)
        })
    }

    /// Return a reservation that will not be used.
    pub fn release(&self, account_id: AccountId, amount: Decimal) -> Result<Decimal> {
        check_amount(amount)?;
        self.apply(account_id, "release", amount, |balance| add(balance, amount))
    }

    /// Pay out proceeds of a closed trade.
    pub fn credit(&self, account_id: AccountId, amount: Decimal) -> Result<Decimal> {
        check_amount(amount)?;
        self.apply(account_id, "credit", amount, |balance| add(balance, amount))
    }

    /// Overwrite with the venue's figure, for venue-owned account types.
    pub fn set_from_venue_snapshot(&self, account_id: AccountId, balance: Decimal) -> Result<Decimal> {
        check_amount(balance)?;
        let applied = self.apply(account_id, "snapshot", balance, |_| Ok(balance))?;
        info!(account = %account_id, balance = %applied, "💰 Balance set from venue");
        Ok(applied)
    }

    /// Record an external wallet on the account. Not a balance operation, but
    /// it rewrites the account, so it takes the same lock.
    pub fn link_wallet(&self, account_id: AccountId, wallet_id: &str) -> Result<Account> {
        self.locks.with(&account_id, || -> Result<Account> {
            let mut account = self
                .accounts
                .get(account_id)?
                .ok_or(ValidationError::AccountNotFound(account_id))?;
            account.wallet_id = Some(wallet_id.to_string());
            self.accounts.save(&account)?;
            Ok(account)
        })
    }

    fn apply(
        &self,
        account_id: AccountId,
        op: &'static str,
        amount: Decimal,
        f: impl FnOnce(Decimal) -> Result<Decimal>,
    ) -> Result<Decimal> {
        let account = self.locks.with(&account_id, || -> Result<_> {
            let mut account = self
                .accounts
                .get(account_id)?
                .ok_or(ValidationError::AccountNotFound(account_id))?;
            let before = account.balance;
            account.balance = f(before)?;
            self.accounts.save(&account)?;
            debug!(account = %account_id, op, %amount, %before, after = %account.balance, "ledger");
            Ok(account)
        })?;

        self.hub.publish_balance(BalanceSnapshot {
            account_id,
            account_type: account.account_type,
            balance: account.balance,
            timestamp: chrono::Utc::now().timestamp(),
        });
        Ok(account.balance)
    }
}

fn add(balance: Decimal, amount: Decimal) -> Result<Decimal> {
    balance.checked_add(amount).ok_or(Error::InvalidAmount(amount))
}

fn check_amount(amount: Decimal) -> Result<()> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(Error::InvalidAmount(amount));
    }
    Ok(())
}

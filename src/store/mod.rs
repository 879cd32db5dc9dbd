//! In-memory repositories
//!
//! Backing stores for the repository traits. The production platform puts a
//! document store behind the same traits.

pub mod audit;

pub use audit::TracingAudit;

use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::*;

#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<AccountId, Account>>,
}

impl AccountStore for MemoryAccountStore {
    fn get(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.accounts.read().get(&id).cloned())
    }

    fn save(&self, account: &Account) -> Result<()> {
        self.accounts.write().insert(account.id, account.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Account>> {
        Ok(self.accounts.read().values().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryTradeStore {
    trades: RwLock<HashMap<TradeId, Trade>>,
}

impl TradeStore for MemoryTradeStore {
    fn get(&self, id: TradeId) -> Result<Option<Trade>> {
        Ok(self.trades.read().get(&id).cloned())
    }

    fn save(&self, trade: &Trade) -> Result<()> {
        self.trades.write().insert(trade.id, trade.clone());
        Ok(())
    }

    fn list_by(&self, filter: &TradeFilter) -> Result<Vec<Trade>> {
        let mut trades: Vec<Trade> = self
            .trades
            .read()
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.open_time);
        Ok(trades)
    }
}

#[derive(Default)]
pub struct MemorySymbolStore {
    symbols: RwLock<HashMap<String, Symbol>>,
}

impl SymbolStore for MemorySymbolStore {
    fn get(&self, name: &str) -> Result<Option<Symbol>> {
        Ok(self.symbols.read().get(name).cloned())
    }

    fn save(&self, symbol: &Symbol) -> Result<()> {
        self.symbols.write().insert(symbol.name.clone(), symbol.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCopyTradeStore {
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    records: RwLock<Vec<CopyTradeRecord>>,
}

impl CopyTradeStore for MemoryCopyTradeStore {
    fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.read().get(&id).cloned())
    }

    fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.subscriptions
            .write()
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    fn active_for_leader(&self, leader: AccountId, account_type: AccountType) -> Result<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.active && s.leader_account == leader && s.account_type == account_type)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    fn save_record(&self, record: &CopyTradeRecord) -> Result<()> {
        let mut records = self.records.write();
        if records.iter().any(|r| r.id == record.id) {
            return Err(Error::Storage(format!("copy-trade record {} already written", record.id)));
        }
        records.push(record.clone());
        Ok(())
    }

    fn records_for_leader_trade(&self, leader_trade: TradeId) -> Result<Vec<CopyTradeRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.leader_trade_id == leader_trade)
            .cloned()
            .collect())
    }
}

//! Core traits - seams to storage, audit and the venue

use uuid::Uuid;

use crate::core::{Result, types::*};
use crate::transport::VenueMessage;

/// Selection for [`TradeStore::list_by`]. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub account_id: Option<AccountId>,
    pub status: Option<TradeStatus>,
}

impl TradeFilter {
    pub fn matches(&self, trade: &Trade) -> bool {
        self.account_id.is_none_or(|id| id == trade.account_id)
            && self.status.is_none_or(|s| s == trade.status)
    }
}

/// Account persistence
pub trait AccountStore: Send + Sync {
    fn get(&self, id: AccountId) -> Result<Option<Account>>;

    fn save(&self, account: &Account) -> Result<()>;

    fn list(&self) -> Result<Vec<Account>>;
}

/// Trade persistence
pub trait TradeStore: Send + Sync {
    fn get(&self, id: TradeId) -> Result<Option<Trade>>;

    fn save(&self, trade: &Trade) -> Result<()>;

    fn list_by(&self, filter: &TradeFilter) -> Result<Vec<Trade>>;
}

/// Symbol definitions, maintained by an administrative collaborator
pub trait SymbolStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<Symbol>>;

    fn save(&self, symbol: &Symbol) -> Result<()>;
}

/// Copy-trade subscriptions and the records mirroring produces
pub trait CopyTradeStore: Send + Sync {
    fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>>;

    fn save_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Active subscriptions following `leader` within one account-type scope.
    fn active_for_leader(
        &self,
        leader: AccountId,
        account_type: AccountType,
    ) -> Result<Vec<Subscription>>;

    fn save_record(&self, record: &CopyTradeRecord) -> Result<()>;

    fn records_for_leader_trade(&self, leader_trade: TradeId) -> Result<Vec<CopyTradeRecord>>;
}

/// Audit trail. Fire-and-forget: implementations swallow their own failures.
pub trait AuditSink: Send + Sync {
    fn record(&self, actor: Uuid, action: &str, description: &str, metadata: serde_json::Value);
}

/// Outbound half of the venue transport
pub trait VenueGateway: Send + Sync {
    /// Hand `message` to the first live venue connection that accepts it.
    /// Returns the label of that connection (`identity#conn`), or
    /// `Error::VenueUnreachable`.
    fn send(&self, message: &VenueMessage) -> Result<String>;
}

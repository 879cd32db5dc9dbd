//! Core types - Strong typing for safety

use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::core::error::ValidationError;

pub type AccountId = Uuid;
pub type UserId = Uuid;
pub type TradeId = Uuid;

/// Subscription key for account-scoped streams: `accountId:accountType`.
pub fn stream_key(account_id: AccountId, account_type: AccountType) -> String {
    format!("{}:{}", account_id, account_type)
}

/// Balance pool flavour; one user may hold one of each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountType {
    Demo,
    Real,
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountType::Demo => write!(f, "DEMO"),
            AccountType::Real => write!(f, "REAL"),
        }
    }
}

/// Tradable balance pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub account_type: AccountType,
    /// Available balance. Only the ledger writes this.
    pub balance: Decimal,
    pub wallet_id: Option<String>,
}

impl Account {
    pub fn new(user_id: UserId, account_type: AccountType, balance: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            account_type,
            balance,
            wallet_id: None,
        }
    }

    pub fn stream_key(&self) -> String {
        stream_key(self.id, self.account_type)
    }
}

/// Daily trading window in UTC wall-clock time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingHours {
    pub unlimited: bool,
    #[serde(default)]
    pub open: Option<NaiveTime>,
    #[serde(default)]
    pub close: Option<NaiveTime>,
}

impl TradingHours {
    pub fn unlimited() -> Self {
        Self { unlimited: true, open: None, close: None }
    }

    /// Whether `now` falls inside the window. Windows may wrap past midnight.
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.unlimited {
            return true;
        }
        match (self.open, self.close) {
            (Some(open), Some(close)) if open <= close => now >= open && now < close,
            (Some(open), Some(close)) => now >= open || now < close,
            // a half-specified window is treated as always open
            _ => true,
        }
    }
}

/// Instrument definition, read-only to the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    /// Leverage ceiling
    pub leverage: u32,
    pub min_volume: Decimal,
    pub max_volume: Decimal,
    /// Commission charged per unit of volume
    pub commission: Decimal,
    pub trading_hours: TradingHours,
    pub is_trading_open: bool,
    #[serde(default)]
    pub denied_account_types: Vec<AccountType>,
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for Side {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(ValidationError::InvalidSide(s.to_string())),
        }
    }
}

/// Order kind: market or one of the pending variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Market,
    Limit,
    BuyLimit,
    SellLimit,
    BuyStop,
    SellStop,
}

impl OrderKind {
    pub fn is_market(&self) -> bool {
        matches!(self, OrderKind::Market)
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Market => write!(f, "MARKET"),
            OrderKind::Limit => write!(f, "LIMIT"),
            OrderKind::BuyLimit => write!(f, "BUY_LIMIT"),
            OrderKind::SellLimit => write!(f, "SELL_LIMIT"),
            OrderKind::BuyStop => write!(f, "BUY_STOP"),
            OrderKind::SellStop => write!(f, "SELL_STOP"),
        }
    }
}

impl FromStr for OrderKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MARKET" => Ok(OrderKind::Market),
            "LIMIT" => Ok(OrderKind::Limit),
            "BUY_LIMIT" => Ok(OrderKind::BuyLimit),
            "SELL_LIMIT" => Ok(OrderKind::SellLimit),
            "BUY_STOP" => Ok(OrderKind::BuyStop),
            "SELL_STOP" => Ok(OrderKind::SellStop),
            _ => Err(ValidationError::UnsupportedOrderKind(s.to_string())),
        }
    }
}

/// Trade state machine. `Closed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Pending,
    Open,
    Closed,
    Expired,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Closed | TradeStatus::Expired)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeStatus::Pending => write!(f, "PENDING"),
            TradeStatus::Open => write!(f, "OPEN"),
            TradeStatus::Closed => write!(f, "CLOSED"),
            TradeStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub account_id: AccountId,
    pub user_id: UserId,
    pub account_type: AccountType,
    pub symbol: String,
    pub side: Side,
    pub order_kind: OrderKind,
    pub leverage: u32,
    pub volume: Decimal,
    /// Requested price for pending kinds, quote at placement for market orders
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub expiration: Option<DateTime<Utc>>,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub close_price: Option<Decimal>,
    pub close_reason: Option<String>,
    pub profit: Option<Decimal>,
    /// Margin held by the ledger while the trade is live
    pub margin: Decimal,
    /// Commission taken at placement; refunded only if the venue never fills
    pub commission: Decimal,
    pub matched_trade_id: Option<String>,
    pub status: TradeStatus,
}

impl Trade {
    /// Total amount the ledger reserved for this trade.
    pub fn reserved(&self) -> Decimal {
        self.margin + self.commission
    }

    /// `(close - entry) * volume`, sign-flipped for sells. `None` when the
    /// figure does not fit a `Decimal`.
    pub fn realized_pnl(&self, close_price: Decimal) -> Option<Decimal> {
        let pnl = close_price
            .checked_sub(self.entry_price)?
            .checked_mul(self.volume)?;
        Some(match self.side {
            Side::Buy => pnl,
            Side::Sell => -pnl,
        })
    }

    /// Amount returned on close: `margin + pnl`, floored at zero.
    pub fn payout(&self, pnl: Decimal) -> Option<Decimal> {
        self.margin.checked_add(pnl).map(|p| p.max(Decimal::ZERO))
    }

    pub fn stream_key(&self) -> String {
        stream_key(self.account_id, self.account_type)
    }
}

/// Follower-to-leader copy binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub follower_account: AccountId,
    pub leader_account: AccountId,
    /// Capital ceiling the follower commits to mirroring
    pub allocated_amount: Decimal,
    pub account_type: AccountType,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Write-once link between a leader trade and the trade it produced for a follower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyTradeRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub leader_trade_id: TradeId,
    pub follower_trade_id: TradeId,
    pub follower_volume: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Latest quote for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(default)]
    pub timestamp: i64,
}

/// Balance pushed to account subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub account_id: AccountId,
    pub account_type: AccountType,
    pub balance: Decimal,
    pub timestamp: i64,
}

impl BalanceSnapshot {
    pub fn stream_key(&self) -> String {
        stream_key(self.account_id, self.account_type)
    }
}

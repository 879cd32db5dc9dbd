//! Venue wire messages
//!
//! Newline-delimited JSON; every object carries a `type` tag naming one
//! [`VenueMessage`] variant. Money values travel as JSON numbers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::types::*;
use crate::core::{Error, Result};

/// Every message the bridge and a venue terminal exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VenueMessage {
    Handshake {
        client_id: String,
        #[serde(default)]
        version: Option<String>,
    },
    HandshakeResponse {
        status: String,
        server: String,
        version: String,
        timestamp: i64,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<f64>,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<f64>,
    },
    Disconnect {
        #[serde(default)]
        reason: String,
        #[serde(default)]
        timestamp: Option<f64>,
    },
    TradeRequest(TradeRequest),
    TradeResponse(TradeResponse),
    CloseTradeRequest(CloseTradeRequest),
    CloseTradeResponse(TradeResponse),
    ModifyTradeRequest(ModifyTradeRequest),
    ModifyTradeResponse(TradeResponse),
    BalanceRequest(BalanceRequest),
    BalanceResponse(BalanceResponse),
    OrderStreamRequest(OrderStreamRequest),
    OrderStreamResponse(OrderStreamResponse),
    PriceTick(PriceTick),
}

/// Tag of a [`VenueMessage`], used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    HandshakeResponse,
    Ping,
    Pong,
    Disconnect,
    TradeRequest,
    TradeResponse,
    CloseTradeRequest,
    CloseTradeResponse,
    ModifyTradeRequest,
    ModifyTradeResponse,
    BalanceRequest,
    BalanceResponse,
    OrderStreamRequest,
    OrderStreamResponse,
    PriceTick,
}

impl MessageKind {
    pub const ALL: [MessageKind; 16] = [
        MessageKind::Handshake,
        MessageKind::HandshakeResponse,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Disconnect,
        MessageKind::TradeRequest,
        MessageKind::TradeResponse,
        MessageKind::CloseTradeRequest,
        MessageKind::CloseTradeResponse,
        MessageKind::ModifyTradeRequest,
        MessageKind::ModifyTradeResponse,
        MessageKind::BalanceRequest,
        MessageKind::BalanceResponse,
        MessageKind::OrderStreamRequest,
        MessageKind::OrderStreamResponse,
        MessageKind::PriceTick,
    ];

    /// Inbound kinds that must have an application handler registered.
    pub const APPLICATION_INBOUND: [MessageKind; 6] = [
        MessageKind::TradeResponse,
        MessageKind::CloseTradeResponse,
        MessageKind::ModifyTradeResponse,
        MessageKind::BalanceResponse,
        MessageKind::OrderStreamResponse,
        MessageKind::PriceTick,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            MessageKind::Handshake => "handshake",
            MessageKind::HandshakeResponse => "handshake_response",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Disconnect => "disconnect",
            MessageKind::TradeRequest => "trade_request",
            MessageKind::TradeResponse => "trade_response",
            MessageKind::CloseTradeRequest => "close_trade_request",
            MessageKind::CloseTradeResponse => "close_trade_response",
            MessageKind::ModifyTradeRequest => "modify_trade_request",
            MessageKind::ModifyTradeResponse => "modify_trade_response",
            MessageKind::BalanceRequest => "balance_request",
            MessageKind::BalanceResponse => "balance_response",
            MessageKind::OrderStreamRequest => "order_stream_request",
            MessageKind::OrderStreamResponse => "order_stream_response",
            MessageKind::PriceTick => "price_tick",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

impl VenueMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            VenueMessage::Handshake { .. } => MessageKind::Handshake,
            VenueMessage::HandshakeResponse { .. } => MessageKind::HandshakeResponse,
            VenueMessage::Ping { .. } => MessageKind::Ping,
            VenueMessage::Pong { .. } => MessageKind::Pong,
            VenueMessage::Disconnect { .. } => MessageKind::Disconnect,
            VenueMessage::TradeRequest(_) => MessageKind::TradeRequest,
            VenueMessage::TradeResponse(_) => MessageKind::TradeResponse,
            VenueMessage::CloseTradeRequest(_) => MessageKind::CloseTradeRequest,
            VenueMessage::CloseTradeResponse(_) => MessageKind::CloseTradeResponse,
            VenueMessage::ModifyTradeRequest(_) => MessageKind::ModifyTradeRequest,
            VenueMessage::ModifyTradeResponse(_) => MessageKind::ModifyTradeResponse,
            VenueMessage::BalanceRequest(_) => MessageKind::BalanceRequest,
            VenueMessage::BalanceResponse(_) => MessageKind::BalanceResponse,
            VenueMessage::OrderStreamRequest(_) => MessageKind::OrderStreamRequest,
            VenueMessage::OrderStreamResponse(_) => MessageKind::OrderStreamResponse,
            VenueMessage::PriceTick(_) => MessageKind::PriceTick,
        }
    }

    pub fn ping() -> Self {
        VenueMessage::Ping { timestamp: Some(now_secs() as f64) }
    }

    pub fn pong() -> Self {
        VenueMessage::Pong { timestamp: Some(now_secs() as f64) }
    }

    pub fn disconnect(reason: impl Into<String>) -> Self {
        VenueMessage::Disconnect {
            reason: reason.into(),
            timestamp: Some(now_secs() as f64),
        }
    }

    /// One wire frame, without the trailing newline.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Result of decoding one inbound line.
#[derive(Debug)]
pub enum Frame {
    Message(VenueMessage),
    /// Well-formed JSON whose tag names no known message
    UnknownTag(String),
}

/// Decode one line. Unknown tags are reported, not treated as errors.
pub fn decode(line: &str) -> Result<Frame> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| Error::InvalidState("message without a type tag".into()))?;

    if MessageKind::from_tag(tag).is_none() {
        return Ok(Frame::UnknownTag(tag.to_string()));
    }
    Ok(Frame::Message(serde_json::from_value(value)?))
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Placement forwarded to the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub trade_id: TradeId,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub account_type: AccountType,
    pub symbol: String,
    pub trade_type: Side,
    pub order_type: OrderKind,
    pub leverage: u32,
    pub volume: Decimal,
    /// Absent for market orders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<Decimal>,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,
    pub timestamp: i64,
}

/// Venue answer to trade, close and modify requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResponse {
    pub trade_id: TradeId,
    pub status: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub account_type: Option<AccountType>,
    #[serde(default)]
    pub matched_trade_id: Option<String>,
    #[serde(default)]
    pub matched_volume: Option<Decimal>,
    #[serde(default)]
    pub trade_retcode: Option<i32>,
    #[serde(default)]
    pub close_price: Option<Decimal>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl TradeResponse {
    /// Bare response carrying only id and status.
    pub fn new(trade_id: TradeId, status: impl Into<String>) -> Self {
        Self {
            trade_id,
            status: status.into(),
            user_id: None,
            account_id: None,
            account_type: None,
            matched_trade_id: None,
            matched_volume: None,
            trade_retcode: None,
            close_price: None,
            close_reason: None,
            error: None,
            timestamp: None,
        }
    }

    /// Venue counterpart id; terminals send an empty string for "none".
    pub fn matched_id(&self) -> Option<String> {
        self.matched_trade_id.clone().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseTradeRequest {
    pub trade_id: TradeId,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub account_type: AccountType,
    pub symbol: String,
    pub volume: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyTradeRequest {
    pub trade_id: TradeId,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub account_type: AccountType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRequest {
    /// Echoed back in the matching [`BalanceResponse`]
    pub request_id: String,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub account_type: AccountType,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceResponse {
    /// Absent on unsolicited balance-stream pushes
    #[serde(default)]
    pub request_id: Option<String>,
    pub account_id: AccountId,
    pub account_type: AccountType,
    pub balance: Decimal,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStreamRequest {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub account_type: AccountType,
    pub timestamp: i64,
}

/// Authoritative snapshot of one account's trades, as the venue sees them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStreamResponse {
    pub account_id: AccountId,
    pub account_type: AccountType,
    #[serde(default)]
    pub trades: Vec<TradeReport>,
}

impl OrderStreamResponse {
    pub fn stream_key(&self) -> String {
        stream_key(self.account_id, self.account_type)
    }
}

/// One trade inside an order-stream batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeReport {
    pub id: TradeId,
    pub symbol: String,
    pub trade_type: Side,
    pub order_type: OrderKind,
    #[serde(default)]
    pub leverage: Option<u32>,
    pub volume: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub stop_loss: Decimal,
    #[serde(default)]
    pub take_profit: Decimal,
    #[serde(default)]
    pub profit: Option<Decimal>,
    #[serde(default)]
    pub close_price: Option<Decimal>,
    /// Unix seconds
    #[serde(default)]
    pub open_time: Option<i64>,
    pub status: TradeStatus,
}

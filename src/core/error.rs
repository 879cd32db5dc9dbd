//! Error handling - one hierarchy for the whole bridge

use rust_decimal::Decimal;
use thiserror::Error;

use crate::core::types::{AccountType, TradeStatus};

pub type Result<T> = std::result::Result<T, Error>;

/// Bridge error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input, rejected before any side effect
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Reservation refused by the ledger
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    /// No live venue connection accepted the message
    #[error("No venue reachable")]
    VenueUnreachable,

    /// Correlation deadline elapsed
    #[error("Timed out waiting for venue response to {0}")]
    Timeout(String),

    /// The connection carrying the request went away
    #[error("Venue connection {0} dropped before responding")]
    VenueDisconnected(String),

    /// Venue answered with a non-success status
    #[error("Venue rejected request: {status} ({reason})")]
    VenueRejected { status: String, reason: String },

    /// A waiter is already registered under this request id
    #[error("Request {0} already in flight")]
    DuplicateRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Ledger amounts must be non-negative
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Repository failure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// One variant per precondition, so callers can tell failures apart.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("account {0} not found")]
    AccountNotFound(uuid::Uuid),

    #[error("account {0} does not belong to caller")]
    AccountNotOwned(uuid::Uuid),

    #[error("symbol {0} not found")]
    SymbolNotFound(String),

    #[error("trading is closed for {0}")]
    TradingClosed(String),

    #[error("{0} is outside its trading hours")]
    OutsideTradingHours(String),

    #[error("{symbol} is not available to {account_type} accounts")]
    AccountTypeDenied { symbol: String, account_type: AccountType },

    #[error("invalid side {0}")]
    InvalidSide(String),

    #[error("unsupported order kind {0}")]
    UnsupportedOrderKind(String),

    #[error("volume {volume} outside [{min}, {max}]")]
    VolumeOutOfRange { volume: Decimal, min: Decimal, max: Decimal },

    #[error("leverage must be positive")]
    InvalidLeverage,

    #[error("leverage {requested} exceeds ceiling {ceiling}")]
    LeverageExceeded { requested: u32, ceiling: u32 },

    #[error("market orders must not carry an entry price")]
    EntryPriceForbidden,

    #[error("pending orders require a positive entry price")]
    EntryPriceRequired,

    #[error("no quote known for {0}")]
    NoReferencePrice(String),

    #[error("notional of {volume} at {price} is out of range")]
    NotionalOverflow { volume: Decimal, price: Decimal },

    #[error("stop-loss and take-profit must be non-negative")]
    NegativeStops,

    #[error("expiration must be in the future")]
    ExpirationInPast,

    #[error("trade {0} does not belong to account")]
    TradeNotOwned(uuid::Uuid),

    #[error("trade {id} is already {status}")]
    TradeTerminal { id: uuid::Uuid, status: TradeStatus },

    #[error("trade {id} is {status}; only pending trades can be modified")]
    NotModifiable { id: uuid::Uuid, status: TradeStatus },

    #[error("modification changes nothing")]
    NothingToModify,
}

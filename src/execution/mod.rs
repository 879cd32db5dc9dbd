//! Execution layer - Trade lifecycle
//!
//! Owns the trade state machine:
//!
//! ```text
//! PENDING -> OPEN -> CLOSED
//!    |                 ^
//!    +-----------------+   (rejected, timeout, disconnect, venue cancel)
//!    +-> EXPIRED
//! ```
//!
//! Caller-facing operations reserve funds, send the venue request and wait
//! on the correlator. The venue's answers are applied by the inbound
//! handlers in [`inbound`], whether or not the caller is still waiting.
//! Transitions are serialized per trade and are no-ops on terminal trades.

pub mod inbound;
pub mod validate;

pub use validate::{PlaceOrder, Pricing};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::config::{Timeouts, TradingConfig};
use crate::core::*;
use crate::correlation::Correlator;
use crate::hub::HubPublisher;
use crate::ledger::{KeyedLocks, Ledger};
use crate::transport::message::{
    BalanceRequest, CloseTradeRequest, ModifyTradeRequest, OrderStreamRequest, TradeRequest,
    VenueMessage, now_secs,
};

/// Where a placement came from. Mirrored placements are never mirrored again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Direct,
    Mirror,
}

/// Collaborators the engine is wired to.
pub struct EngineDeps {
    pub accounts: Arc<dyn AccountStore>,
    pub trades: Arc<dyn TradeStore>,
    pub symbols: Arc<dyn SymbolStore>,
    pub audit: Arc<dyn AuditSink>,
    pub venue: Arc<dyn VenueGateway>,
    pub correlator: Arc<Correlator<VenueMessage>>,
    pub hub: HubPublisher,
}

pub(crate) fn placement_key(id: TradeId) -> String {
    format!("trade:{}", id)
}

pub(crate) fn close_key(id: TradeId) -> String {
    format!("close:{}", id)
}

pub(crate) fn modify_key(id: TradeId) -> String {
    format!("modify:{}", id)
}

pub(crate) fn balance_key(request_id: &str) -> String {
    format!("balance:{}", request_id)
}

/// Trade lifecycle engine
pub struct TradeEngine {
    accounts: Arc<dyn AccountStore>,
    trades: Arc<dyn TradeStore>,
    symbols: Arc<dyn SymbolStore>,
    audit: Arc<dyn AuditSink>,
    venue: Arc<dyn VenueGateway>,
    correlator: Arc<Correlator<VenueMessage>>,
    hub: HubPublisher,
    ledger: Ledger,
    /// Latest quote per symbol
    prices: RwLock<HashMap<String, PriceTick>>,
    trade_locks: KeyedLocks<TradeId>,
    /// Terminal trades whose write failed, shadowing the store until retried
    unsaved: Mutex<HashMap<TradeId, Trade>>,
    timeouts: Timeouts,
    venue_balance_types: Vec<AccountType>,
    mirror_tx: Option<flume::Sender<Trade>>,
}

impl TradeEngine {
    pub fn new(deps: EngineDeps, trading: &TradingConfig) -> Self {
        let ledger = Ledger::new(deps.accounts.clone(), deps.hub.clone());
        Self {
            accounts: deps.accounts,
            trades: deps.trades,
            symbols: deps.symbols,
            audit: deps.audit,
            venue: deps.venue,
            correlator: deps.correlator,
            hub: deps.hub,
            ledger,
            prices: RwLock::new(HashMap::new()),
            trade_locks: KeyedLocks::new(),
            unsaved: Mutex::new(HashMap::new()),
            timeouts: trading.timeouts(),
            venue_balance_types: trading.venue_balance_types.clone(),
            mirror_tx: None,
        }
    }

    /// Feed successful direct placements to the mirroring task.
    pub fn with_mirror(mut self, leaders: flume::Sender<Trade>) -> Self {
        self.mirror_tx = Some(leaders);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn quote(&self, symbol: &str) -> Option<PriceTick> {
        self.prices.read().get(symbol).cloned()
    }

    fn venue_owns_balance(&self, account_type: AccountType) -> bool {
        self.venue_balance_types.contains(&account_type)
    }

    fn owned_account(&self, caller: UserId, account_id: AccountId) -> Result<Account> {
        validate::check_ownership(self.accounts.get(account_id)?, account_id, caller)
    }

    fn stored_trade(&self, id: TradeId) -> Result<Option<Trade>> {
        if let Some(trade) = self.unsaved.lock().get(&id) {
            return Ok(Some(trade.clone()));
        }
        self.trades.get(id)
    }

    fn load_trade(&self, id: TradeId) -> Result<Trade> {
        self.stored_trade(id)?
            .ok_or_else(|| Error::NotFound(format!("trade {}", id)))
    }

    /// Write a terminal transition. A refused write keeps the trade in memory
    /// until [`TradeEngine::retry_unsaved`] gets it into the store.
    fn persist_terminal(&self, trade: &Trade) {
        if let Err(e) = self.trades.save(trade) {
            error!(trade_id = %trade.id, status = %trade.status, "🚨 terminal state not persisted, will retry: {}", e);
            self.unsaved.lock().insert(trade.id, trade.clone());
        }
    }

    /// Retry terminal writes that failed earlier. Returns how many landed.
    pub fn retry_unsaved(&self) -> usize {
        let backlog: Vec<Trade> = self.unsaved.lock().values().cloned().collect();
        let mut saved = 0;
        for trade in backlog {
            self.trade_locks.with(&trade.id, || match self.trades.save(&trade) {
                Ok(()) => {
                    self.unsaved.lock().remove(&trade.id);
                    saved += 1;
                }
                Err(e) => warn!(trade_id = %trade.id, "terminal write still failing: {}", e),
            });
        }
        if saved > 0 {
            info!(saved, "💾 Deferred trade writes persisted");
        }
        saved
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// Validate, reserve, forward to the venue and wait for its verdict.
    pub async fn place_trade(&self, caller: UserId, order: PlaceOrder) -> Result<Trade> {
        self.place(caller, order, Origin::Direct).await
    }

    pub(crate) async fn place(&self, caller: UserId, order: PlaceOrder, origin: Origin) -> Result<Trade> {
        let account = self.owned_account(caller, order.account_id)?;
        let symbol = self
            .symbols
            .get(&order.symbol)?
            .ok_or_else(|| ValidationError::SymbolNotFound(order.symbol.clone()))?;
        let now = Utc::now();
        validate::check_symbol(&symbol, account.account_type, now)?;
        validate::check_order(&order, &symbol, now)?;
        let pricing = validate::price_order(&order, &symbol, self.quote(&symbol.name).as_ref())?;

        let trade = Trade {
            id: Uuid::new_v4(),
            account_id: account.id,
            user_id: account.user_id,
            account_type: account.account_type,
            symbol: symbol.name.clone(),
            side: order.side,
            order_kind: order.order_kind,
            leverage: order.leverage,
            volume: order.volume,
            entry_price: pricing.price,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            expiration: order.expiration,
            open_time: now,
            close_time: None,
            close_price: None,
            close_reason: None,
            profit: None,
            margin: pricing.margin,
            commission: pricing.commission,
            matched_trade_id: None,
            status: TradeStatus::Pending,
        };

        // pessimistic: funds leave the balance before the venue hears of it
        self.ledger.reserve(account.id, trade.reserved())?;
        if let Err(e) = self.trades.save(&trade) {
            error!(trade_id = %trade.id, "trade not persisted, rolling back reservation: {}", e);
            if let Err(re) = self.ledger.release(account.id, trade.reserved()) {
                error!(trade_id = %trade.id, amount = %trade.reserved(), "🚨 rollback failed: {}", re);
            }
            return Err(e);
        }
        self.hub.publish_trade(trade.clone());

        let key = placement_key(trade.id);
        let waiter = match self.correlator.register(key.clone()) {
            Ok(w) => w,
            Err(e) => {
                self.fail_pending(trade.id, "INTERNAL")?;
                return Err(e);
            }
        };

        let request = VenueMessage::TradeRequest(TradeRequest {
            trade_id: trade.id,
            user_id: trade.user_id,
            account_id: trade.account_id,
            account_type: trade.account_type,
            symbol: trade.symbol.clone(),
            trade_type: trade.side,
            order_type: trade.order_kind,
            leverage: trade.leverage,
            volume: trade.volume,
            entry_price: order.entry_price,
            stop_loss: trade.stop_loss,
            take_profit: trade.take_profit,
            expiration: trade.expiration.map(|e| e.timestamp()),
            timestamp: now_secs(),
        });
        let route = match self.venue.send(&request) {
            Ok(route) => route,
            Err(e) => {
                drop(waiter);
                self.fail_pending(trade.id, "VENUE_UNREACHABLE")?;
                return Err(e);
            }
        };
        self.correlator.bind(&key, route.clone());

        info!(
            trade_id = %trade.id,
            account = %trade.account_id,
            route = %route,
            "📤 {} {} {} @ {} x{} (margin {})",
            trade.side, trade.volume, trade.symbol, trade.entry_price, trade.leverage, trade.margin
        );
        // mirrored placements are audited by the mirror, with their subscription
        if origin == Origin::Direct {
            self.audit.record(
                caller,
                "PlaceTrade",
                "Trade placed",
                json!({
                    "trade_id": trade.id,
                    "account_id": trade.account_id,
                    "symbol": trade.symbol,
                    "volume": trade.volume,
                    "margin": trade.margin,
                }),
            );
        }

        let placed = match waiter.wait(self.timeouts.placement).await {
            Ok(VenueMessage::TradeResponse(resp)) => {
                let current = self.load_trade(trade.id)?;
                if current.status == TradeStatus::Closed {
                    return Err(Error::VenueRejected {
                        status: resp.status,
                        reason: current.close_reason.unwrap_or_default(),
                    });
                }
                current
            }
            Ok(other) => {
                self.fail_pending(trade.id, "INVALID_RESPONSE")?;
                return Err(Error::InvalidState(format!(
                    "expected trade_response, got {}",
                    other.kind()
                )));
            }
            Err(Error::Timeout(_)) => {
                let current = self.fail_pending(trade.id, "TIMEOUT")?;
                if current.status.is_terminal() {
                    warn!(trade_id = %trade.id, "⏱️ venue did not answer, reservation released");
                    return Err(Error::Timeout(trade.id.to_string()));
                }
                current
            }
            Err(Error::VenueDisconnected(route)) => {
                let current = self.fail_pending(trade.id, "DISCONNECTED")?;
                if current.status.is_terminal() {
                    return Err(Error::VenueDisconnected(route));
                }
                current
            }
            Err(e) => {
                self.fail_pending(trade.id, "INTERNAL")?;
                return Err(e);
            }
        };

        if origin == Origin::Direct {
            if let Some(tx) = &self.mirror_tx {
                if tx.send(placed.clone()).is_err() {
                    warn!(trade_id = %placed.id, "mirror task gone, not mirroring");
                }
            }
        }
        Ok(placed)
    }

    /// Close a still-PENDING trade the venue never acknowledged, returning
    /// its reservation even if the terminal write is refused. Returns the
    /// trade as it stands afterwards; a trade the venue answered in the
    /// meantime is left alone.
    fn fail_pending(&self, id: TradeId, reason: &str) -> Result<Trade> {
        let trade = self.trade_locks.with(&id, || -> Result<Trade> {
            let mut trade = self.load_trade(id)?;
            if trade.status != TradeStatus::Pending {
                return Ok(trade);
            }
            trade.status = TradeStatus::Closed;
            trade.close_reason = Some(reason.to_string());
            trade.close_time = Some(Utc::now());
            self.persist_terminal(&trade);
            self.refund(&trade, trade.reserved());
            Ok(trade)
        })?;
        if trade.status == TradeStatus::Closed {
            self.hub.publish_trade(trade.clone());
        }
        Ok(trade)
    }

    /// Return `amount` to the trade's account. The trade is already persisted
    /// as terminal, so a failure here is logged for manual repair.
    fn refund(&self, trade: &Trade, amount: Decimal) {
        if amount.is_zero() {
            return;
        }
        if let Err(e) = self.ledger.release(trade.account_id, amount) {
            error!(trade_id = %trade.id, account = %trade.account_id, %amount, "🚨 release failed: {}", e);
        }
    }

    fn pay_out(&self, trade: &Trade, amount: Decimal) {
        if amount.is_zero() {
            return;
        }
        if let Err(e) = self.ledger.credit(trade.account_id, amount) {
            error!(trade_id = %trade.id, account = %trade.account_id, %amount, "🚨 credit failed: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Close / modify
    // ------------------------------------------------------------------

    /// Ask the venue to close the trade. A timeout leaves the trade as it was.
    pub async fn close_trade(&self, caller: UserId, account_id: AccountId, trade_id: TradeId) -> Result<Trade> {
        self.owned_account(caller, account_id)?;
        let trade = self.get_trade(trade_id)?;
        if trade.account_id != account_id {
            return Err(ValidationError::TradeNotOwned(trade_id).into());
        }
        if trade.status.is_terminal() {
            return Err(ValidationError::TradeTerminal {
                id: trade_id,
                status: trade.status,
            }
            .into());
        }

        let key = close_key(trade_id);
        let waiter = self.correlator.register(key.clone())?;
        let route = self.venue.send(&VenueMessage::CloseTradeRequest(CloseTradeRequest {
            trade_id,
            user_id: trade.user_id,
            account_id,
            account_type: trade.account_type,
            symbol: trade.symbol.clone(),
            volume: trade.volume,
            timestamp: now_secs(),
        }))?;
        self.correlator.bind(&key, route);

        let resp = match waiter.wait(self.timeouts.close).await? {
            VenueMessage::CloseTradeResponse(resp) => resp,
            other => {
                return Err(Error::InvalidState(format!(
                    "expected close_trade_response, got {}",
                    other.kind()
                )));
            }
        };

        let current = self.load_trade(trade_id)?;
        if current.status != TradeStatus::Closed {
            return Err(Error::VenueRejected {
                status: resp.status,
                reason: resp.close_reason.or(resp.error).unwrap_or_default(),
            });
        }
        self.audit.record(
            caller,
            "CloseTrade",
            "Trade closed",
            json!({
                "trade_id": trade_id,
                "close_price": current.close_price,
                "profit": current.profit,
            }),
        );
        Ok(current)
    }

    /// Change price and/or volume of a PENDING trade. Margin is not re-checked.
    pub async fn modify_trade(
        &self,
        caller: UserId,
        account_id: AccountId,
        trade_id: TradeId,
        entry_price: Option<Decimal>,
        volume: Option<Decimal>,
    ) -> Result<Trade> {
        self.owned_account(caller, account_id)?;
        let trade = self.get_trade(trade_id)?;
        if trade.account_id != account_id {
            return Err(ValidationError::TradeNotOwned(trade_id).into());
        }
        let symbol = self
            .symbols
            .get(&trade.symbol)?
            .ok_or_else(|| ValidationError::SymbolNotFound(trade.symbol.clone()))?;
        validate::check_modify(&trade, &symbol, entry_price, volume)?;

        let key = modify_key(trade_id);
        let waiter = self.correlator.register(key.clone())?;
        let route = self.venue.send(&VenueMessage::ModifyTradeRequest(ModifyTradeRequest {
            trade_id,
            user_id: trade.user_id,
            account_id,
            account_type: trade.account_type,
            entry_price,
            volume,
            timestamp: now_secs(),
        }))?;
        self.correlator.bind(&key, route);

        let resp = match waiter.wait(self.timeouts.modify).await? {
            VenueMessage::ModifyTradeResponse(resp) => resp,
            other => {
                return Err(Error::InvalidState(format!(
                    "expected modify_trade_response, got {}",
                    other.kind()
                )));
            }
        };
        if !inbound::is_modify_success(&resp.status) {
            return Err(Error::VenueRejected {
                status: resp.status.clone(),
                reason: crate::core::retcode::rejection_reason(&resp.status, resp.trade_retcode),
            });
        }

        let updated = self.trade_locks.with(&trade_id, || -> Result<Trade> {
            let mut trade = self.load_trade(trade_id)?;
            if trade.status != TradeStatus::Pending {
                return Err(ValidationError::NotModifiable {
                    id: trade_id,
                    status: trade.status,
                }
                .into());
            }
            if let Some(p) = entry_price {
                trade.entry_price = p;
            }
            if let Some(v) = volume {
                trade.volume = v;
            }
            self.trades.save(&trade)?;
            Ok(trade)
        })?;

        info!(trade_id = %trade_id, "✏️ Trade modified: {} @ {}", updated.volume, updated.entry_price);
        self.hub.publish_trade(updated.clone());
        self.audit.record(
            caller,
            "ModifyTrade",
            "Trade modified",
            json!({ "trade_id": trade_id, "entry_price": entry_price, "volume": volume }),
        );
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Reads, balances, accounts
    // ------------------------------------------------------------------

    /// Trade by id. A PENDING trade past its expiration is expired on read.
    pub fn get_trade(&self, trade_id: TradeId) -> Result<Trade> {
        let trade = self.load_trade(trade_id)?;
        if trade.status == TradeStatus::Pending && trade.expiration.is_some() {
            return self.expire_if_due(trade_id);
        }
        Ok(trade)
    }

    pub fn list_trades(&self, filter: &TradeFilter) -> Result<Vec<Trade>> {
        let mut trades = self
            .trades
            .list_by(filter)?
            .into_iter()
            .map(|t| self.get_trade(t.id))
            .collect::<Result<Vec<_>>>()?;
        // expiry or a deferred write may have moved a trade out of the filter
        if let Some(status) = filter.status {
            trades.retain(|t| t.status == status);
        }
        Ok(trades)
    }

    /// Balance of the caller's account. Venue-owned account types ask the
    /// venue and apply its answer as a snapshot.
    pub async fn request_balance(&self, caller: UserId, account_id: AccountId) -> Result<Decimal> {
        let account = self.owned_account(caller, account_id)?;
        self.account_balance(&account).await
    }

    pub(crate) async fn account_balance(&self, account: &Account) -> Result<Decimal> {
        if !self.venue_owns_balance(account.account_type) {
            return self.ledger.balance(account.id);
        }

        let request_id = Uuid::new_v4().to_string();
        let key = balance_key(&request_id);
        let waiter = self.correlator.register(key.clone())?;
        let route = self.venue.send(&VenueMessage::BalanceRequest(BalanceRequest {
            request_id,
            user_id: account.user_id,
            account_id: account.id,
            account_type: account.account_type,
            timestamp: now_secs(),
        }))?;
        self.correlator.bind(&key, route);

        match waiter.wait(self.timeouts.balance).await? {
            VenueMessage::BalanceResponse(resp) => match resp.error {
                Some(err) if !err.is_empty() => Err(Error::VenueRejected {
                    status: "ERROR".to_string(),
                    reason: err,
                }),
                _ => Ok(resp.balance),
            },
            other => Err(Error::InvalidState(format!(
                "expected balance_response, got {}",
                other.kind()
            ))),
        }
    }

    /// Link an external wallet to the caller's account.
    pub fn register_wallet(&self, caller: UserId, account_id: AccountId, wallet_id: &str) -> Result<Account> {
        self.owned_account(caller, account_id)?;
        let wallet_id = wallet_id.trim();
        if wallet_id.is_empty() {
            return Err(Error::InvalidState("wallet id is empty".to_string()));
        }
        let account = self.ledger.link_wallet(account_id, wallet_id)?;
        self.audit.record(
            caller,
            "RegisterWallet",
            "External wallet linked",
            json!({ "account_id": account_id, "wallet_id": wallet_id }),
        );
        Ok(account)
    }

    /// Ask the venue for the authoritative trade list of one account.
    pub fn request_order_stream(&self, account_id: AccountId) -> Result<String> {
        let account = self
            .accounts
            .get(account_id)?
            .ok_or(ValidationError::AccountNotFound(account_id))?;
        self.venue.send(&VenueMessage::OrderStreamRequest(OrderStreamRequest {
            user_id: account.user_id,
            account_id,
            account_type: account.account_type,
            timestamp: now_secs(),
        }))
    }

    /// Request order streams for every account. Returns how many went out.
    pub fn request_all_order_streams(&self) -> Result<usize> {
        let mut sent = 0;
        for account in self.accounts.list()? {
            match self.request_order_stream(account.id) {
                Ok(_) => sent += 1,
                Err(Error::VenueUnreachable) => {
                    warn!("no venue connected, skipping reconciliation round");
                    break;
                }
                Err(e) => warn!(account = %account.id, "order stream request failed: {}", e),
            }
        }
        Ok(sent)
    }
}

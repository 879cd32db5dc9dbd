//! Venue → engine: responses, reconciliation, quotes, expiry
//!
//! Every handler applies venue truth first and only then resolves the
//! correlation waiter, so a caller that already gave up still leaves the
//! ledger and the trade in the state the venue reports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{TradeEngine, balance_key, close_key, modify_key, placement_key};
use crate::core::retcode;
use crate::core::*;
use crate::transport::dispatch::MessageHandler;
use crate::transport::message::{BalanceResponse, OrderStreamResponse, TradeReport, TradeResponse, VenueMessage};

pub const STATUS_MATCHED: &str = "MATCHED";
pub const STATUS_PENDING: &str = "PENDING";

pub fn is_close_success(status: &str) -> bool {
    matches!(status, "CLOSED" | "SUCCESS")
}

pub fn is_modify_success(status: &str) -> bool {
    matches!(status, "MODIFIED" | "SUCCESS")
}

#[async_trait]
impl MessageHandler for TradeEngine {
    async fn handle(&self, identity: &str, message: VenueMessage) -> Result<()> {
        match message {
            VenueMessage::TradeResponse(resp) => {
                self.apply_trade_response(&resp)?;
                let key = placement_key(resp.trade_id);
                self.correlator.resolve(&key, VenueMessage::TradeResponse(resp));
            }
            VenueMessage::CloseTradeResponse(resp) => {
                // a waiting caller sees the trade unchanged and reports a rejection
                let applied = self.apply_close_response(&resp);
                let key = close_key(resp.trade_id);
                self.correlator.resolve(&key, VenueMessage::CloseTradeResponse(resp));
                applied?;
            }
            VenueMessage::ModifyTradeResponse(resp) => {
                // applied by the waiting caller, which holds the requested values
                let key = modify_key(resp.trade_id);
                if !self.correlator.resolve(&key, VenueMessage::ModifyTradeResponse(resp)) {
                    warn!(identity, "modify response without a waiting caller");
                }
            }
            VenueMessage::BalanceResponse(resp) => {
                self.apply_balance_response(&resp)?;
                if let Some(request_id) = resp.request_id.clone() {
                    self.correlator
                        .resolve(&balance_key(&request_id), VenueMessage::BalanceResponse(resp));
                }
            }
            VenueMessage::OrderStreamResponse(batch) => {
                self.reconcile(&batch)?;
            }
            VenueMessage::PriceTick(tick) => self.apply_price_tick(tick),
            other => {
                debug!(identity, kind = %other.kind(), "not an inbound application message");
            }
        }
        Ok(())
    }
}

impl TradeEngine {
    /// Apply a placement verdict. MATCHED opens, PENDING keeps the order
    /// queued, anything else rejects and returns the reservation.
    pub fn apply_trade_response(&self, resp: &TradeResponse) -> Result<Option<Trade>> {
        let id = resp.trade_id;
        let changed = self.trade_locks.with(&id, || -> Result<Option<Trade>> {
            let Some(mut trade) = self.stored_trade(id)? else {
                warn!(trade_id = %id, "trade_response for unknown trade");
                return Ok(None);
            };
            if trade.status.is_terminal() {
                warn!(trade_id = %id, status = %trade.status, venue_status = %resp.status, "late trade_response ignored");
                return Ok(None);
            }

            match resp.status.as_str() {
                STATUS_MATCHED => {
                    if trade.status == TradeStatus::Open {
                        debug!(trade_id = %id, "duplicate MATCHED");
                        return Ok(None);
                    }
                    trade.status = TradeStatus::Open;
                    trade.matched_trade_id = resp.matched_id().or(trade.matched_trade_id.take());
                    self.trades.save(&trade)?;
                    info!(trade_id = %id, matched = ?trade.matched_trade_id, "✅ Trade matched");
                }
                STATUS_PENDING => {
                    if trade.status == TradeStatus::Open {
                        return Ok(None);
                    }
                    let matched = resp.matched_id();
                    if matched.is_none() || matched == trade.matched_trade_id {
                        return Ok(None);
                    }
                    trade.matched_trade_id = matched;
                    self.trades.save(&trade)?;
                    info!(trade_id = %id, "⏳ Trade queued at venue");
                }
                other => {
                    if trade.status == TradeStatus::Open {
                        warn!(trade_id = %id, venue_status = other, "rejection for an open trade ignored");
                        return Ok(None);
                    }
                    trade.status = TradeStatus::Closed;
                    trade.close_time = Some(Utc::now());
                    trade.close_reason = Some(retcode::rejection_reason(other, resp.trade_retcode));
                    self.trades.save(&trade)?;
                    self.refund(&trade, trade.reserved());
                    warn!(trade_id = %id, reason = ?trade.close_reason, "❌ Trade rejected by venue");
                }
            }
            Ok(Some(trade))
        })?;

        if let Some(trade) = &changed {
            self.hub.publish_trade(trade.clone());
        }
        Ok(changed)
    }

    /// Apply a close verdict. An OPEN trade is paid `margin + pnl` (never
    /// below zero); a never-filled PENDING trade gets its full reservation back.
    pub fn apply_close_response(&self, resp: &TradeResponse) -> Result<Option<Trade>> {
        let id = resp.trade_id;
        if !is_close_success(&resp.status) {
            warn!(
                trade_id = %id,
                venue_status = %resp.status,
                reason = resp.close_reason.as_deref().unwrap_or("-"),
                "venue refused close"
            );
            return Ok(None);
        }

        let changed = self.trade_locks.with(&id, || -> Result<Option<Trade>> {
            let Some(mut trade) = self.stored_trade(id)? else {
                warn!(trade_id = %id, "close_trade_response for unknown trade");
                return Ok(None);
            };
            if trade.status.is_terminal() {
                warn!(trade_id = %id, status = %trade.status, "duplicate close ignored");
                return Ok(None);
            }

            let (close_price, pnl, payout) = match trade.status {
                TradeStatus::Open => {
                    let price = resp
                        .close_price
                        .filter(|p| *p > Decimal::ZERO)
                        .or_else(|| self.exit_quote(&trade))
                        .unwrap_or(trade.entry_price);
                    let Some((pnl, payout)) = self.settle(&trade, price, None)? else {
                        error!(trade_id = %id, close_price = %price, "close price out of range, response rejected");
                        return Err(Error::InvalidState(format!(
                            "close price {} out of range for trade {}",
                            price, id
                        )));
                    };
                    (price, pnl, payout)
                }
                _ => (trade.entry_price, Decimal::ZERO, trade.reserved()),
            };

            trade.status = TradeStatus::Closed;
            trade.close_price = Some(close_price);
            trade.close_time = Some(close_time(resp.timestamp));
            trade.close_reason = Some(resp.close_reason.clone().unwrap_or_else(|| "CLOSED".to_string()));
            trade.profit = Some(pnl);
            self.trades.save(&trade)?;
            self.pay_out(&trade, payout);

            info!(trade_id = %id, %close_price, %pnl, %payout, "🏁 Trade closed");
            Ok(Some(trade))
        })?;

        if let Some(trade) = &changed {
            self.hub.publish_trade(trade.clone());
        }
        Ok(changed)
    }

    /// Realized pnl and payout for closing `trade` at `close_price`, or at
    /// the venue's own profit figure when it sent one. `None` when either
    /// figure, or the balance it is paid into, would not fit a `Decimal`.
    fn settle(
        &self,
        trade: &Trade,
        close_price: Decimal,
        reported_profit: Option<Decimal>,
    ) -> Result<Option<(Decimal, Decimal)>> {
        let pnl = match reported_profit.or_else(|| trade.realized_pnl(close_price)) {
            Some(pnl) => pnl,
            None => return Ok(None),
        };
        let Some(payout) = trade.payout(pnl) else {
            return Ok(None);
        };
        let balance = self.ledger.balance(trade.account_id)?;
        Ok(balance.checked_add(payout).map(|_| (pnl, payout)))
    }

    /// Exit price at the current quote: bid to sell a long, ask to buy back a short.
    fn exit_quote(&self, trade: &Trade) -> Option<Decimal> {
        self.quote(&trade.symbol).map(|q| match trade.side {
            Side::Buy => q.bid,
            Side::Sell => q.ask,
        })
    }

    /// Venue-owned balances follow the venue; others only log a mismatch.
    pub fn apply_balance_response(&self, resp: &BalanceResponse) -> Result<()> {
        if let Some(err) = resp.error.as_deref().filter(|e| !e.is_empty()) {
            warn!(account = %resp.account_id, "venue balance error: {}", err);
            return Ok(());
        }
        let Some(account) = self.accounts.get(resp.account_id)? else {
            warn!(account = %resp.account_id, "balance for unknown account");
            return Ok(());
        };
        if account.account_type != resp.account_type {
            warn!(account = %account.id, "balance reported for the wrong account type");
            return Ok(());
        }
        if !self.venue_owns_balance(account.account_type) {
            debug!(account = %account.id, local = %account.balance, venue = %resp.balance, "locally owned balance, venue figure ignored");
            return Ok(());
        }
        self.ledger.set_from_venue_snapshot(account.id, resp.balance)?;
        Ok(())
    }

    pub fn apply_price_tick(&self, tick: PriceTick) {
        if tick.bid <= Decimal::ZERO || tick.ask <= Decimal::ZERO {
            debug!(symbol = %tick.symbol, "non-positive quote dropped");
            return;
        }
        self.prices.write().insert(tick.symbol.clone(), tick.clone());
        self.hub.publish_price(tick);
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Bring local trades in line with the venue's report for one account.
    /// Terminal trades are never touched, so feeding a batch twice is the
    /// same as feeding it once. Returns how many trades changed.
    pub fn reconcile(&self, batch: &OrderStreamResponse) -> Result<usize> {
        let account = self
            .accounts
            .get(batch.account_id)?
            .ok_or(ValidationError::AccountNotFound(batch.account_id))?;
        if account.account_type != batch.account_type {
            warn!(account = %account.id, reported = %batch.account_type, "order stream for the wrong account type ignored");
            return Ok(0);
        }

        let mut changed = 0;
        for report in &batch.trades {
            match self.reconcile_one(&account, report) {
                Ok(Some(trade)) => {
                    changed += 1;
                    self.hub.publish_trade(trade);
                }
                Ok(None) => {}
                Err(e) => warn!(trade_id = %report.id, "reconcile failed: {}", e),
            }
        }

        if changed > 0 {
            info!(account = %account.id, changed, reported = batch.trades.len(), "🔄 Reconciled");
        }
        self.hub.publish_orders(batch.clone());
        Ok(changed)
    }

    fn reconcile_one(&self, account: &Account, report: &TradeReport) -> Result<Option<Trade>> {
        self.trade_locks.with(&report.id, || -> Result<Option<Trade>> {
            let Some(mut trade) = self.stored_trade(report.id)? else {
                let trade = trade_from_report(account, report);
                self.trades.save(&trade)?;
                self.audit.record(
                    account.user_id,
                    "ReconcileTrade",
                    "Trade created from venue order stream",
                    json!({ "trade_id": trade.id, "status": trade.status, "symbol": trade.symbol }),
                );
                return Ok(Some(trade));
            };

            if trade.status.is_terminal() {
                return Ok(None);
            }
            if trade.account_id != account.id {
                warn!(trade_id = %trade.id, "reported under a different account, skipped");
                return Ok(None);
            }

            let before = trade.clone();
            trade.volume = report.volume;
            let mut refund = Decimal::ZERO;
            let mut payout = Decimal::ZERO;

            match (trade.status, report.status) {
                (TradeStatus::Pending, TradeStatus::Open) => trade.status = TradeStatus::Open,
                (TradeStatus::Pending, TradeStatus::Closed | TradeStatus::Expired) => {
                    trade.status = report.status;
                    trade.close_time = Some(Utc::now());
                    trade.close_reason = Some("RECONCILED".to_string());
                    refund = trade.reserved();
                }
                (TradeStatus::Open, TradeStatus::Closed | TradeStatus::Expired) => {
                    let price = report.close_price.unwrap_or(trade.entry_price);
                    let Some((pnl, settled)) = self.settle(&trade, price, report.profit)? else {
                        error!(trade_id = %trade.id, close_price = %price, "reported close out of range, skipped");
                        return Err(Error::InvalidState(format!(
                            "reported close of trade {} out of range",
                            trade.id
                        )));
                    };
                    trade.status = TradeStatus::Closed;
                    trade.close_price = Some(price);
                    trade.close_time = Some(Utc::now());
                    trade.close_reason = Some("RECONCILED".to_string());
                    trade.profit = Some(pnl);
                    payout = settled;
                }
                // no backwards transitions
                _ => {}
            }

            if trade == before {
                return Ok(None);
            }
            self.trades.save(&trade)?;
            self.refund(&trade, refund);
            self.pay_out(&trade, payout);
            Ok(Some(trade))
        })
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    /// Expire one PENDING trade if its expiration has passed. Returns the
    /// trade as it stands afterwards.
    pub fn expire_if_due(&self, id: TradeId) -> Result<Trade> {
        self.expire_at(id, Utc::now())
    }

    pub(crate) fn expire_at(&self, id: TradeId, now: DateTime<Utc>) -> Result<Trade> {
        let (trade, expired) = self.trade_locks.with(&id, || -> Result<(Trade, bool)> {
            let mut trade = self.load_trade(id)?;
            let due = trade.status == TradeStatus::Pending && trade.expiration.is_some_and(|e| e <= now);
            if !due {
                return Ok((trade, false));
            }
            trade.status = TradeStatus::Expired;
            trade.close_time = Some(now);
            trade.close_reason = Some("EXPIRED".to_string());
            self.trades.save(&trade)?;
            self.refund(&trade, trade.reserved());
            Ok((trade, true))
        })?;

        if expired {
            info!(trade_id = %id, "⌛ Pending trade expired");
            self.hub.publish_trade(trade.clone());
        }
        Ok(trade)
    }

    /// Expire every overdue PENDING trade. Returns how many expired.
    pub fn sweep_expired(&self) -> Result<usize> {
        self.retry_unsaved();
        let pending = self.trades.list_by(&TradeFilter {
            account_id: None,
            status: Some(TradeStatus::Pending),
        })?;
        let now = Utc::now();

        let mut expired = 0;
        for trade in pending.iter().filter(|t| t.expiration.is_some_and(|e| e <= now)) {
            match self.expire_at(trade.id, now) {
                Ok(t) if t.status == TradeStatus::Expired => expired += 1,
                Ok(_) => {}
                Err(e) => warn!(trade_id = %trade.id, "expiry failed: {}", e),
            }
        }
        Ok(expired)
    }
}

fn close_time(venue_ts: Option<f64>) -> DateTime<Utc> {
    venue_ts
        .filter(|ts| *ts > 0.0)
        .and_then(|ts| DateTime::from_timestamp(ts.trunc() as i64, (ts.fract() * 1e9) as u32))
        .unwrap_or_else(Utc::now)
}

/// A trade the venue knows and the bridge does not. No margin is held for it.
fn trade_from_report(account: &Account, report: &TradeReport) -> Trade {
    let open_time = report
        .open_time
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);
    let terminal = report.status.is_terminal();

    Trade {
        id: report.id,
        account_id: account.id,
        user_id: account.user_id,
        account_type: account.account_type,
        symbol: report.symbol.clone(),
        side: report.trade_type,
        order_kind: report.order_type,
        leverage: report.leverage.unwrap_or(1),
        volume: report.volume,
        entry_price: report.entry_price,
        stop_loss: report.stop_loss,
        take_profit: report.take_profit,
        expiration: None,
        open_time,
        close_time: terminal.then_some(open_time),
        close_price: report.close_price,
        close_reason: terminal.then(|| "RECONCILED".to_string()),
        profit: report.profit,
        margin: Decimal::ZERO,
        commission: Decimal::ZERO,
        matched_trade_id: None,
        status: report.status,
    }
}

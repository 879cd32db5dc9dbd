//! Copy-trade mirroring
//!
//! Leader placements arrive on a channel fed by the engine. Each one is
//! mirrored in its own task, and each follower is placed independently.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::*;
use crate::execution::{Origin, PlaceOrder, TradeEngine};

/// Decimal places kept on a computed follower volume
const VOLUME_DP: u32 = 8;

pub struct Mirror {
    engine: Arc<TradeEngine>,
    accounts: Arc<dyn AccountStore>,
    copy_trades: Arc<dyn CopyTradeStore>,
    audit: Arc<dyn AuditSink>,
}

impl Mirror {
    pub fn new(
        engine: Arc<TradeEngine>,
        accounts: Arc<dyn AccountStore>,
        copy_trades: Arc<dyn CopyTradeStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            engine,
            accounts,
            copy_trades,
            audit,
        }
    }

    /// Consume leader trades until the engine side of the channel closes.
    pub async fn run(self: Arc<Self>, leaders: flume::Receiver<Trade>) {
        while let Ok(leader) = leaders.recv_async().await {
            let mirror = self.clone();
            tokio::spawn(async move {
                if let Err(e) = mirror.mirror(&leader).await {
                    warn!(leader_trade = %leader.id, "mirror pass aborted: {}", e);
                }
            });
        }
        debug!("mirror feed closed");
    }

    /// Follow `leader` with a new subscription. The follower must be able
    /// to cover the allocation today.
    pub async fn subscribe(
        &self,
        caller: UserId,
        follower_account: AccountId,
        leader_account: AccountId,
        allocated_amount: Decimal,
    ) -> Result<Subscription> {
        if allocated_amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(allocated_amount));
        }
        let follower = self
            .accounts
            .get(follower_account)?
            .ok_or(ValidationError::AccountNotFound(follower_account))?;
        if follower.user_id != caller {
            return Err(ValidationError::AccountNotOwned(follower_account).into());
        }
        let leader = self
            .accounts
            .get(leader_account)?
            .ok_or(ValidationError::AccountNotFound(leader_account))?;
        if leader.account_type != follower.account_type {
            return Err(Error::InvalidState(format!(
                "leader account is {}, follower account is {}",
                leader.account_type, follower.account_type
            )));
        }

        let available = self.engine.account_balance(&follower).await?;
        if available < allocated_amount {
            return Err(Error::InsufficientFunds {
                required: allocated_amount,
                available,
            });
        }

        let subscription = Subscription {
            id: Uuid::new_v4(),
            follower_account,
            leader_account,
            allocated_amount,
            account_type: follower.account_type,
            active: true,
            created_at: Utc::now(),
        };
        self.copy_trades.save_subscription(&subscription)?;
        self.audit.record(
            caller,
            "CreateCopySubscription",
            "Copy trade subscription created",
            json!({
                "subscription_id": subscription.id,
                "follower_account": follower_account,
                "leader_account": leader_account,
                "allocated_amount": allocated_amount,
            }),
        );
        Ok(subscription)
    }

    /// One mirror pass over every active follower of the leader's account.
    /// Fails only when the pass cannot start; follower failures are skipped.
    pub async fn mirror(&self, leader: &Trade) -> Result<Vec<CopyTradeRecord>> {
        let subscriptions = self
            .copy_trades
            .active_for_leader(leader.account_id, leader.account_type)?;
        if subscriptions.is_empty() {
            return Ok(Vec::new());
        }

        let leader_account = self
            .accounts
            .get(leader.account_id)?
            .ok_or(ValidationError::AccountNotFound(leader.account_id))?;
        let leader_balance = self.engine.account_balance(&leader_account).await?;
        if leader_balance <= Decimal::ZERO {
            return Err(Error::InvalidState(format!(
                "leader balance {} leaves no ratio to mirror",
                leader_balance
            )));
        }
        let ratio = leader.volume / leader_balance;

        info!(
            leader_trade = %leader.id,
            followers = subscriptions.len(),
            %ratio,
            "🪞 Mirroring leader trade"
        );

        let passes = subscriptions
            .iter()
            .map(|sub| self.mirror_one(leader, sub, ratio));
        let records = futures::future::join_all(passes)
            .await
            .into_iter()
            .zip(subscriptions.iter())
            .filter_map(|(result, sub)| match result {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(subscription = %sub.id, follower = %sub.follower_account, "follower skipped: {}", e);
                    None
                }
            })
            .collect();
        Ok(records)
    }

    async fn mirror_one(&self, leader: &Trade, sub: &Subscription, ratio: Decimal) -> Result<CopyTradeRecord> {
        let follower = self
            .accounts
            .get(sub.follower_account)?
            .ok_or(ValidationError::AccountNotFound(sub.follower_account))?;
        let balance = self.engine.account_balance(&follower).await?;
        let volume = (sub.allocated_amount.min(balance) * ratio).round_dp(VOLUME_DP);

        let order = PlaceOrder {
            account_id: follower.id,
            symbol: leader.symbol.clone(),
            side: leader.side,
            order_kind: leader.order_kind,
            leverage: leader.leverage,
            volume,
            entry_price: (!leader.order_kind.is_market()).then_some(leader.entry_price),
            stop_loss: leader.stop_loss,
            take_profit: leader.take_profit,
            expiration: leader.expiration,
        };
        let placed = self.engine.place(follower.user_id, order, Origin::Mirror).await?;

        let record = CopyTradeRecord {
            id: Uuid::new_v4(),
            subscription_id: sub.id,
            leader_trade_id: leader.id,
            follower_trade_id: placed.id,
            follower_volume: volume,
            created_at: Utc::now(),
        };
        self.copy_trades.save_record(&record)?;
        self.audit.record(
            follower.user_id,
            "MirrorTrade",
            "Leader trade mirrored",
            json!({
                "subscription_id": sub.id,
                "leader_trade_id": leader.id,
                "follower_trade_id": placed.id,
                "follower_volume": volume,
            }),
        );
        Ok(record)
    }
}

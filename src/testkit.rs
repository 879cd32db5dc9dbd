//! Shared fixtures for engine and mirror tests

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::core::config::{StreamConfig, Timeouts, TradingConfig};
use crate::core::*;
use crate::correlation::Correlator;
use crate::execution::{EngineDeps, PlaceOrder, TradeEngine};
use crate::hub::{StreamHub, Subscribers};
use crate::store::{MemoryAccountStore, MemoryCopyTradeStore, MemorySymbolStore, MemoryTradeStore};
use crate::transport::dispatch::MessageHandler;
use crate::transport::message::{TradeResponse, VenueMessage};

pub const ROUTE: &str = "venue-1#1";

/// Venue stand-in: everything the engine sends lands on a channel.
pub struct ScriptedVenue {
    tx: flume::Sender<VenueMessage>,
    pub reachable: AtomicBool,
}

impl VenueGateway for ScriptedVenue {
    fn send(&self, message: &VenueMessage) -> Result<String> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::VenueUnreachable);
        }
        self.tx
            .send(message.clone())
            .map_err(|_| Error::VenueUnreachable)?;
        Ok(ROUTE.to_string())
    }
}

/// Trade store whose writes can be switched off.
#[derive(Default)]
pub struct FlakyTradeStore {
    inner: MemoryTradeStore,
    pub fail_saves: AtomicBool,
}

impl TradeStore for FlakyTradeStore {
    fn get(&self, id: TradeId) -> Result<Option<Trade>> {
        self.inner.get(id)
    }

    fn save(&self, trade: &Trade) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Storage("write refused".to_string()));
        }
        self.inner.save(trade)
    }

    fn list_by(&self, filter: &TradeFilter) -> Result<Vec<Trade>> {
        self.inner.list_by(filter)
    }
}

/// Audit sink that keeps actions for assertions.
#[derive(Default)]
pub struct RecordingAudit {
    pub actions: Mutex<Vec<String>>,
}

impl AuditSink for RecordingAudit {
    fn record(&self, _actor: Uuid, action: &str, _description: &str, _metadata: serde_json::Value) {
        self.actions.lock().push(action.to_string());
    }
}

pub struct Harness {
    pub engine: Arc<TradeEngine>,
    pub venue: Arc<ScriptedVenue>,
    pub requests: flume::Receiver<VenueMessage>,
    pub accounts: Arc<MemoryAccountStore>,
    pub trades: Arc<FlakyTradeStore>,
    pub symbols: Arc<MemorySymbolStore>,
    pub copy_trades: Arc<MemoryCopyTradeStore>,
    pub audit: Arc<RecordingAudit>,
    pub correlator: Arc<Correlator<VenueMessage>>,
    pub subscribers: Subscribers,
    pub user: UserId,
    pub account: AccountId,
}

pub fn symbol(name: &str) -> Symbol {
    Symbol {
        name: name.to_string(),
        leverage: 100,
        min_volume: dec!(0.01),
        max_volume: dec!(10),
        commission: Decimal::ZERO,
        trading_hours: TradingHours::unlimited(),
        is_trading_open: true,
        denied_account_types: vec![],
    }
}

pub fn short_timeouts() -> Timeouts {
    Timeouts {
        placement: Duration::from_millis(300),
        close: Duration::from_millis(300),
        modify: Duration::from_millis(300),
        balance: Duration::from_millis(300),
    }
}

impl Harness {
    /// One DEMO account holding `balance`; EURUSD listed with zero commission.
    pub fn new(balance: Decimal) -> Self {
        Self::with_config(balance, AccountType::Demo, TradingConfig::default(), short_timeouts(), None)
    }

    pub fn with_config(
        balance: Decimal,
        account_type: AccountType,
        trading: TradingConfig,
        timeouts: Timeouts,
        mirror: Option<flume::Sender<Trade>>,
    ) -> Self {
        let (tx, requests) = flume::unbounded();
        let venue = Arc::new(ScriptedVenue {
            tx,
            reachable: AtomicBool::new(true),
        });
        let accounts = Arc::new(MemoryAccountStore::default());
        let trades = Arc::new(FlakyTradeStore::default());
        let symbols = Arc::new(MemorySymbolStore::default());
        let copy_trades = Arc::new(MemoryCopyTradeStore::default());
        let audit = Arc::new(RecordingAudit::default());
        let correlator = Arc::new(Correlator::new());

        let (hub, publisher) = StreamHub::new(&StreamConfig::default());
        let subscribers = hub.subscribers();
        tokio::spawn(hub.run());

        symbols.save(&symbol("EURUSD")).unwrap();
        let user = Uuid::new_v4();
        let account = Account::new(user, account_type, balance);
        accounts.save(&account).unwrap();

        let mut engine = TradeEngine::new(
            EngineDeps {
                accounts: accounts.clone(),
                trades: trades.clone(),
                symbols: symbols.clone(),
                audit: audit.clone(),
                venue: venue.clone(),
                correlator: correlator.clone(),
                hub: publisher,
            },
            &trading,
        )
        .with_timeouts(timeouts);
        if let Some(tx) = mirror {
            engine = engine.with_mirror(tx);
        }

        Self {
            engine: Arc::new(engine),
            venue,
            requests,
            accounts,
            trades,
            symbols,
            copy_trades,
            audit,
            correlator,
            subscribers,
            user,
            account: account.id,
        }
    }

    /// Another account, for a fresh user.
    pub fn add_account(&self, account_type: AccountType, balance: Decimal) -> Account {
        let account = Account::new(Uuid::new_v4(), account_type, balance);
        self.accounts.save(&account).unwrap();
        account
    }

    pub fn quote(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.engine.apply_price_tick(PriceTick {
            symbol: symbol.to_string(),
            bid,
            ask,
            timestamp: 0,
        });
    }

    pub fn balance(&self, account: AccountId) -> Decimal {
        self.engine.ledger().balance(account).unwrap()
    }

    pub fn trade(&self, id: TradeId) -> Trade {
        self.trades.get(id).unwrap().unwrap()
    }

    pub fn all_trades(&self) -> Vec<Trade> {
        self.trades.list_by(&TradeFilter::default()).unwrap()
    }

    /// Next message the engine sent to the venue.
    pub async fn next_request(&self) -> VenueMessage {
        tokio::time::timeout(Duration::from_secs(2), self.requests.recv_async())
            .await
            .expect("engine sent nothing")
            .expect("venue channel closed")
    }

    /// Deliver a venue message as the dispatcher would.
    pub async fn deliver(&self, message: VenueMessage) {
        self.engine.handle("venue-1", message).await.unwrap();
    }

    /// Answer every trade request with `status` until the channel closes.
    pub fn auto_respond(&self, status: &'static str) -> tokio::task::JoinHandle<()> {
        let engine = self.engine.clone();
        let requests = self.requests.clone();
        tokio::spawn(async move {
            while let Ok(message) = requests.recv_async().await {
                if let VenueMessage::TradeRequest(req) = message {
                    let resp = TradeResponse::new(req.trade_id, status);
                    engine
                        .handle("venue-1", VenueMessage::TradeResponse(resp))
                        .await
                        .unwrap();
                }
            }
        })
    }
}

pub fn market(account_id: AccountId, side: Side, volume: Decimal, leverage: u32) -> PlaceOrder {
    PlaceOrder {
        account_id,
        symbol: "EURUSD".to_string(),
        side,
        order_kind: OrderKind::Market,
        leverage,
        volume,
        entry_price: None,
        stop_loss: Decimal::ZERO,
        take_profit: Decimal::ZERO,
        expiration: None,
    }
}

pub fn limit(account_id: AccountId, volume: Decimal, price: Decimal, leverage: u32) -> PlaceOrder {
    PlaceOrder {
        order_kind: OrderKind::BuyLimit,
        entry_price: Some(price),
        ..market(account_id, Side::Buy, volume, leverage)
    }
}

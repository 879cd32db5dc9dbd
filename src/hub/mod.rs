//! Streaming distribution hub
//!
//! Four producer inputs (price, trade, balance, orders) feed one dispatch
//! loop that fans every event out to the subscribers holding its key.
//! Price events are keyed by symbol name, the rest by `accountId:accountType`.
//! Each subscriber owns a small bounded buffer; when it is full the newest
//! event is dropped for that subscriber only.

pub mod session;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::core::config::StreamConfig;
use crate::core::{BalanceSnapshot, PriceTick, Trade};
use crate::transport::message::OrderStreamResponse;

/// Event pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum StreamEvent {
    Price(PriceTick),
    Trade(Trade),
    Balance(BalanceSnapshot),
    Orders(OrderStreamResponse),
}

impl StreamEvent {
    pub fn key(&self) -> String {
        match self {
            StreamEvent::Price(tick) => tick.symbol.clone(),
            StreamEvent::Trade(trade) => trade.stream_key(),
            StreamEvent::Balance(snapshot) => snapshot.stream_key(),
            StreamEvent::Orders(batch) => batch.stream_key(),
        }
    }
}

/// Producer side of the hub. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct HubPublisher {
    price: flume::Sender<PriceTick>,
    trade: flume::Sender<Trade>,
    balance: flume::Sender<BalanceSnapshot>,
    orders: flume::Sender<OrderStreamResponse>,
}

fn offer<T>(tx: &flume::Sender<T>, channel: &str, value: T) {
    match tx.try_send(value) {
        Ok(()) => {}
        Err(flume::TrySendError::Full(_)) => warn!(channel, "hub input full, event dropped"),
        Err(flume::TrySendError::Disconnected(_)) => debug!(channel, "hub stopped, event dropped"),
    }
}

impl HubPublisher {
    pub fn publish_price(&self, tick: PriceTick) {
        offer(&self.price, "price", tick);
    }

    pub fn publish_trade(&self, trade: Trade) {
        offer(&self.trade, "trade", trade);
    }

    pub fn publish_balance(&self, snapshot: BalanceSnapshot) {
        offer(&self.balance, "balance", snapshot);
    }

    pub fn publish_orders(&self, batch: OrderStreamResponse) {
        offer(&self.orders, "orders", batch);
    }
}

struct Entry {
    keys: HashSet<String>,
    tx: flume::Sender<StreamEvent>,
}

/// Subscriber table, shared between the dispatch loop and the session server.
#[derive(Clone)]
pub struct Subscribers {
    table: Arc<RwLock<HashMap<u64, Entry>>>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl Subscribers {
    fn new(buffer: usize) -> Self {
        Self {
            table: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        }
    }

    /// New subscriber with no keys yet.
    pub fn register(&self) -> StreamSubscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::bounded(self.buffer);
        self.table.write().insert(
            id,
            Entry {
                keys: HashSet::new(),
                tx,
            },
        );
        debug!(subscriber = id, "subscriber registered");
        StreamSubscriber {
            id,
            subscribers: self.clone(),
            rx,
        }
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    fn fan_out(&self, event: StreamEvent) {
        let key = event.key();
        let mut dead = Vec::new();

        for (id, entry) in self.table.read().iter() {
            if !entry.keys.contains(&key) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(flume::TrySendError::Full(_)) => {
                    warn!(subscriber = id, key = %key, "subscriber buffer full, dropping newest")
                }
                Err(flume::TrySendError::Disconnected(_)) => dead.push(*id),
            }
        }

        if !dead.is_empty() {
            let mut table = self.table.write();
            for id in dead {
                table.remove(&id);
            }
        }
    }
}

/// One subscriber. Dropping it cancels the subscription and frees its buffer.
pub struct StreamSubscriber {
    id: u64,
    subscribers: Subscribers,
    rx: flume::Receiver<StreamEvent>,
}

impl StreamSubscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscribe(&self, key: impl Into<String>) {
        if let Some(entry) = self.subscribers.table.write().get_mut(&self.id) {
            entry.keys.insert(key.into());
        }
    }

    pub fn unsubscribe(&self, key: &str) -> bool {
        self.subscribers
            .table
            .write()
            .get_mut(&self.id)
            .is_some_and(|e| e.keys.remove(key))
    }

    pub fn keys(&self) -> Vec<String> {
        self.subscribers
            .table
            .read()
            .get(&self.id)
            .map(|e| e.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Next event, or `None` once the hub is gone.
    pub async fn recv(&self) -> Option<StreamEvent> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for StreamSubscriber {
    fn drop(&mut self) {
        self.subscribers.table.write().remove(&self.id);
        debug!(subscriber = self.id, "subscriber cancelled");
    }
}

/// Dispatch loop owner.
pub struct StreamHub {
    price: flume::Receiver<PriceTick>,
    trade: flume::Receiver<Trade>,
    balance: flume::Receiver<BalanceSnapshot>,
    orders: flume::Receiver<OrderStreamResponse>,
    subscribers: Subscribers,
}

impl StreamHub {
    pub fn new(config: &StreamConfig) -> (Self, HubPublisher) {
        let cap = config.channel_capacity.max(1);
        let (price_tx, price) = flume::bounded(cap);
        let (trade_tx, trade) = flume::bounded(cap);
        let (balance_tx, balance) = flume::bounded(cap);
        let (orders_tx, orders) = flume::bounded(cap);

        let hub = Self {
            price,
            trade,
            balance,
            orders,
            subscribers: Subscribers::new(config.subscriber_buffer),
        };
        let publisher = HubPublisher {
            price: price_tx,
            trade: trade_tx,
            balance: balance_tx,
            orders: orders_tx,
        };
        (hub, publisher)
    }

    pub fn subscribers(&self) -> Subscribers {
        self.subscribers.clone()
    }

    /// Runs until every publisher is dropped.
    pub async fn run(self) {
        info!("📣 Stream hub running");
        loop {
            tokio::select! {
                Ok(tick) = self.price.recv_async() => self.subscribers.fan_out(StreamEvent::Price(tick)),
                Ok(trade) = self.trade.recv_async() => self.subscribers.fan_out(StreamEvent::Trade(trade)),
                Ok(snapshot) = self.balance.recv_async() => self.subscribers.fan_out(StreamEvent::Balance(snapshot)),
                Ok(batch) = self.orders.recv_async() => self.subscribers.fan_out(StreamEvent::Orders(batch)),
                else => break,
            }
        }
        info!("Stream hub stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AccountType;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use uuid::Uuid;

    fn tick(symbol: &str) -> PriceTick {
        PriceTick {
            symbol: symbol.into(),
            bid: dec!(1.1),
            ask: dec!(1.2),
            timestamp: 0,
        }
    }

    fn hub(buffer: usize) -> (Subscribers, HubPublisher) {
        let config = StreamConfig {
            subscriber_buffer: buffer,
            ..StreamConfig::default()
        };
        let (hub, publisher) = StreamHub::new(&config);
        let subscribers = hub.subscribers();
        tokio::spawn(hub.run());
        (subscribers, publisher)
    }

    async fn next(sub: &StreamSubscriber) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_routes_by_key() {
        let (subscribers, publisher) = hub(8);
        let eur = subscribers.register();
        eur.subscribe("EURUSD");
        let account = Uuid::new_v4();
        let wallet = subscribers.register();
        wallet.subscribe(crate::core::stream_key(account, AccountType::Demo));

        publisher.publish_price(tick("GBPUSD"));
        publisher.publish_price(tick("EURUSD"));
        publisher.publish_balance(BalanceSnapshot {
            account_id: account,
            account_type: AccountType::Demo,
            balance: dec!(990),
            timestamp: 0,
        });

        assert!(matches!(next(&eur).await, StreamEvent::Price(t) if t.symbol == "EURUSD"));
        assert!(matches!(next(&wallet).await, StreamEvent::Balance(b) if b.balance == dec!(990)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(eur.try_recv().is_none());
        assert!(wallet.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_newest() {
        let (subscribers, publisher) = hub(2);
        let slow = subscribers.register();
        slow.subscribe("XAUUSD");
        let fast = subscribers.register();
        fast.subscribe("XAUUSD");

        for i in 0..5 {
            let mut t = tick("XAUUSD");
            t.timestamp = i;
            publisher.publish_price(t);
            // fast consumer keeps up
            assert!(matches!(next(&fast).await, StreamEvent::Price(p) if p.timestamp == i));
        }

        let kept: Vec<i64> = std::iter::from_fn(|| slow.try_recv())
            .map(|e| match e {
                StreamEvent::Price(p) => p.timestamp,
                _ => -1,
            })
            .collect();
        assert_eq!(kept, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_cancel() {
        let (subscribers, publisher) = hub(8);
        let sub = subscribers.register();
        sub.subscribe("EURUSD");
        assert!(sub.unsubscribe("EURUSD"));
        assert!(!sub.unsubscribe("EURUSD"));

        publisher.publish_price(tick("EURUSD"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sub.try_recv().is_none());

        assert_eq!(subscribers.len(), 1);
        drop(sub);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_string(&StreamEvent::Price(tick("EURUSD"))).unwrap();
        assert!(json.starts_with(r#"{"type":"Price","payload":{"symbol":"EURUSD""#));
    }
}

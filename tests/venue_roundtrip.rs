//! End-to-end: a scripted venue terminal over TCP, the engine on the other side.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use uuid::Uuid;

use venue_bridge::core::config::{StreamConfig, TradingConfig, VenueConfig};
use venue_bridge::core::*;
use venue_bridge::correlation::Correlator;
use venue_bridge::execution::{EngineDeps, PlaceOrder, TradeEngine};
use venue_bridge::hub::StreamHub;
use venue_bridge::store::audit::TracingAudit;
use venue_bridge::store::{MemoryAccountStore, MemorySymbolStore, MemoryTradeStore};
use venue_bridge::transport::{ConnectionRegistry, Dispatcher, MessageKind, VenueServer};

struct Bridge {
    addr: SocketAddr,
    engine: Arc<TradeEngine>,
    registry: Arc<ConnectionRegistry>,
    user: UserId,
    account: AccountId,
}

async fn start_bridge(balance: Decimal) -> Bridge {
    let accounts = Arc::new(MemoryAccountStore::default());
    let symbols = Arc::new(MemorySymbolStore::default());
    let registry = Arc::new(ConnectionRegistry::new());
    let correlator = Arc::new(Correlator::new());
    let (hub, publisher) = StreamHub::new(&StreamConfig::default());
    tokio::spawn(hub.run());

    symbols
        .save(&Symbol {
            name: "EURUSD".into(),
            leverage: 100,
            min_volume: dec!(0.01),
            max_volume: dec!(10),
            commission: Decimal::ZERO,
            trading_hours: TradingHours::unlimited(),
            is_trading_open: true,
            denied_account_types: vec![],
        })
        .unwrap();
    let user = Uuid::new_v4();
    let account = Account::new(user, AccountType::Demo, balance);
    accounts.save(&account).unwrap();

    let engine = Arc::new(TradeEngine::new(
        EngineDeps {
            accounts,
            trades: Arc::new(MemoryTradeStore::default()),
            symbols,
            audit: Arc::new(TracingAudit),
            venue: registry.clone(),
            correlator: correlator.clone(),
            hub: publisher,
        },
        &TradingConfig {
            placement_timeout_secs: 2,
            close_timeout_secs: 2,
            ..TradingConfig::default()
        },
    ));

    let mut dispatcher = Dispatcher::new();
    dispatcher.register_all(&MessageKind::APPLICATION_INBOUND, engine.clone());
    let server = VenueServer::bind(
        VenueConfig {
            listen_addr: "127.0.0.1:0".into(),
            ..VenueConfig::default()
        },
        registry.clone(),
        dispatcher,
        correlator,
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    Bridge {
        addr,
        engine,
        registry,
        user,
        account: account.id,
    }
}

/// Scripted venue terminal
struct Terminal {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Terminal {
    async fn connect(addr: SocketAddr, identity: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, writer) = stream.into_split();
        let mut terminal = Self {
            lines: BufReader::new(r).lines(),
            writer,
        };
        terminal
            .send(json!({ "type": "handshake", "client_id": identity, "version": "1.0" }))
            .await;
        let ack = terminal.recv().await;
        assert_eq!(ack["type"], "handshake_response");
        assert_eq!(ack["status"], "success");
        terminal
    }

    async fn send(&mut self, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Next message of `kind`, skipping keepalive traffic.
    async fn expect(&mut self, kind: &str) -> Value {
        loop {
            let message = self.recv().await;
            if message["type"] == "ping" {
                self.send(json!({ "type": "pong" })).await;
                continue;
            }
            assert_eq!(message["type"], kind, "unexpected {}", message);
            return message;
        }
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn market_buy(account_id: AccountId, volume: Decimal, leverage: u32) -> PlaceOrder {
    PlaceOrder {
        account_id,
        symbol: "EURUSD".into(),
        side: Side::Buy,
        order_kind: OrderKind::Market,
        leverage,
        volume,
        entry_price: None,
        stop_loss: Decimal::ZERO,
        take_profit: Decimal::ZERO,
        expiration: None,
    }
}

#[tokio::test]
async fn test_place_and_close_over_tcp() {
    let bridge = start_bridge(dec!(1000)).await;
    let mut venue = Terminal::connect(bridge.addr, "mt5-demo").await;
    wait_until(|| bridge.registry.len() == 1).await;

    venue
        .send(json!({ "type": "price_tick", "symbol": "EURUSD", "bid": 100, "ask": 100, "timestamp": 1 }))
        .await;
    let engine = bridge.engine.clone();
    wait_until(|| engine.quote("EURUSD").is_some()).await;

    let engine = bridge.engine.clone();
    let (user, account) = (bridge.user, bridge.account);
    let placing = tokio::spawn(async move { engine.place_trade(user, market_buy(account, dec!(1), 10)).await });

    let request = venue.expect("trade_request").await;
    assert_eq!(request["symbol"], "EURUSD");
    assert_eq!(request["trade_type"], "BUY");
    assert!(request.get("entry_price").is_none());
    let trade_id = request["trade_id"].as_str().unwrap().to_string();
    venue
        .send(json!({
            "type": "trade_response",
            "trade_id": trade_id,
            "status": "MATCHED",
            "matched_trade_id": "555001",
        }))
        .await;

    let trade = placing.await.unwrap().unwrap();
    assert_eq!(trade.status, TradeStatus::Open);
    assert_eq!(trade.matched_trade_id.as_deref(), Some("555001"));
    assert_eq!(bridge.engine.ledger().balance(account).unwrap(), dec!(990));

    let engine = bridge.engine.clone();
    let closing = tokio::spawn(async move { engine.close_trade(user, account, trade.id).await });
    let request = venue.expect("close_trade_request").await;
    assert_eq!(request["trade_id"].as_str(), Some(trade_id.as_str()));
    venue
        .send(json!({
            "type": "close_trade_response",
            "trade_id": trade_id,
            "status": "SUCCESS",
            "close_price": 110,
        }))
        .await;

    let closed = closing.await.unwrap().unwrap();
    assert_eq!(closed.status, TradeStatus::Closed);
    assert_eq!(closed.profit, Some(dec!(10)));
    assert_eq!(bridge.engine.ledger().balance(account).unwrap(), dec!(1010));
}

#[tokio::test]
async fn test_terminal_drop_fails_placement_fast() {
    let bridge = start_bridge(dec!(1000)).await;
    let mut venue = Terminal::connect(bridge.addr, "mt5-demo").await;
    wait_until(|| bridge.registry.len() == 1).await;

    venue
        .send(json!({ "type": "price_tick", "symbol": "EURUSD", "bid": 100, "ask": 100, "timestamp": 1 }))
        .await;
    let engine = bridge.engine.clone();
    wait_until(|| engine.quote("EURUSD").is_some()).await;

    let engine = bridge.engine.clone();
    let (user, account) = (bridge.user, bridge.account);
    let placing = tokio::spawn(async move { engine.place_trade(user, market_buy(account, dec!(1), 10)).await });
    venue.expect("trade_request").await;
    drop(venue);

    let err = placing.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::VenueDisconnected(_)), "got {:?}", err);
    assert_eq!(bridge.engine.ledger().balance(account).unwrap(), dec!(1000));
    wait_until(|| bridge.registry.is_empty()).await;
}

#[tokio::test]
async fn test_no_terminal_is_unreachable() {
    let bridge = start_bridge(dec!(1000)).await;
    let err = bridge
        .engine
        .request_order_stream(bridge.account)
        .unwrap_err();
    assert!(matches!(err, Error::VenueUnreachable));
}

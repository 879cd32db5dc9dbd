//! Venue transport
//!
//! TCP server for execution-venue terminals. Each accepted socket gets a
//! reader loop, a writer task draining its outbound queue, and (after the
//! handshake) a keepalive task. Frames are newline-delimited JSON.

pub mod dispatch;
pub mod message;
pub mod registry;

pub use dispatch::{Dispatcher, MessageHandler};
pub use message::{MessageKind, VenueMessage};
pub use registry::{ConnectionHandle, ConnectionRegistry};

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::core::config::VenueConfig;
use crate::core::{Error, Result};
use crate::correlation::Correlator;
use message::Frame;

/// Accepts venue terminals and feeds their messages to the dispatcher.
pub struct VenueServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

struct Shared {
    config: VenueConfig,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    correlator: Arc<Correlator<VenueMessage>>,
    next_conn: AtomicU64,
}

impl VenueServer {
    /// Bind the listener. The dispatcher is validated here so a missing
    /// handler fails at startup.
    pub async fn bind(
        config: VenueConfig,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Dispatcher,
        correlator: Arc<Correlator<VenueMessage>>,
    ) -> Result<Self> {
        dispatcher.validate()?;
        let listener = TcpListener::bind(&config.listen_addr).await?;
        info!("🔌 Venue server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                registry,
                dispatcher: Arc::new(dispatcher),
                correlator,
                next_conn: AtomicU64::new(1),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.shared.registry.clone()
    }

    /// Accept loop. Runs until the task is dropped.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        shared.serve(stream, peer).await;
                    });
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

enum ReadOutcome {
    Line(String),
    Eof,
}

impl Shared {
    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            debug!(conn = conn_id, "set_nodelay failed: {}", e);
        }
        info!(conn = conn_id, %peer, "🆕 Venue connection accepted");

        let (read_half, write_half) = stream.into_split();
        let (handle, outbound) =
            ConnectionHandle::new(conn_id, peer.to_string(), self.config.outbound_buffer);

        let writer = tokio::spawn(write_loop(
            write_half,
            outbound,
            handle.clone(),
            self.config.write_timeout(),
        ));

        let identity = self.read_loop(read_half, &handle).await;

        handle.close();
        if let Some(identity) = identity {
            if self.registry.remove(&identity, conn_id) {
                info!(identity = %identity, conn = conn_id, "🔌 Venue disconnected");
            }
            self.correlator.abandon_route(&registry::label(&identity, conn_id));
        }
        if let Err(e) = writer.await {
            debug!(conn = conn_id, "writer task ended abnormally: {}", e);
        }
    }

    /// Returns the connection's identity if it ever completed a handshake.
    async fn read_loop(&self, read_half: OwnedReadHalf, handle: &ConnectionHandle) -> Option<String> {
        let mut reader = BufReader::new(read_half);
        let mut closed = handle.close_signal();
        let mut identity: Option<String> = None;

        loop {
            let outcome = tokio::select! {
                _ = closed.wait_for(|c| *c) => break,
                r = tokio::time::timeout(
                    self.config.read_timeout(),
                    read_frame(&mut reader, self.config.max_message_bytes),
                ) => r,
            };

            let line = match outcome {
                Ok(Ok(ReadOutcome::Line(line))) => line,
                Ok(Ok(ReadOutcome::Eof)) => {
                    debug!(conn = handle.id(), "peer closed");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(conn = handle.id(), "read failed: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(conn = handle.id(), "⏱️ read deadline expired, closing");
                    break;
                }
            };

            handle.touch();
            let message = match message::decode(&line) {
                Ok(Frame::Message(m)) => m,
                Ok(Frame::UnknownTag(tag)) => {
                    warn!(conn = handle.id(), tag = %tag, "unknown message type, dropping");
                    continue;
                }
                Err(e) => {
                    warn!(conn = handle.id(), "malformed frame dropped: {}", e);
                    continue;
                }
            };

            match message {
                VenueMessage::Handshake { client_id, version } => {
                    if identity.is_some() {
                        warn!(conn = handle.id(), "repeated handshake ignored");
                        continue;
                    }
                    if client_id.trim().is_empty() {
                        warn!(conn = handle.id(), "handshake without identity rejected");
                        continue;
                    }
                    info!(
                        conn = handle.id(),
                        identity = %client_id,
                        version = version.as_deref().unwrap_or("-"),
                        "🤝 Venue handshake"
                    );
                    self.registry.upsert(&client_id, handle.clone());
                    let ack = VenueMessage::HandshakeResponse {
                        status: "success".to_string(),
                        server: self.config.server_name.clone(),
                        version: self.config.protocol_version.clone(),
                        timestamp: message::now_secs(),
                    };
                    if let Err(e) = handle.send_message(&ack) {
                        warn!(conn = handle.id(), "handshake ack not queued: {}", e);
                    }
                    tokio::spawn(keepalive(
                        handle.clone(),
                        self.config.ping_interval(),
                        self.config.max_missed_pongs,
                    ));
                    identity = Some(client_id);
                }
                other if identity.is_none() => warn!(
                    conn = handle.id(),
                    kind = %other.kind(),
                    "message before handshake rejected"
                ),
                VenueMessage::Ping { .. } => {
                    handle.record_pong();
                    if let Err(e) = handle.send_message(&VenueMessage::pong()) {
                        debug!(conn = handle.id(), "pong not queued: {}", e);
                    }
                }
                VenueMessage::Pong { .. } => handle.record_pong(),
                VenueMessage::Disconnect { reason, .. } => {
                    info!(conn = handle.id(), reason = %reason, "venue requested disconnect");
                    break;
                }
                other => {
                    if let Some(id) = identity.as_deref() {
                        self.dispatcher.dispatch(id, other).await;
                    }
                }
            }
        }
        identity
    }
}

/// Read one newline-terminated frame of at most `max` bytes.
async fn read_frame(reader: &mut BufReader<OwnedReadHalf>, max: usize) -> Result<ReadOutcome> {
    loop {
        let mut buf = Vec::new();
        let n = (&mut *reader).take(max as u64 + 1).read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        if buf.last() != Some(&b'\n') && buf.len() > max {
            return Err(Error::InvalidState(format!("frame exceeds {} bytes", max)));
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if !line.is_empty() {
            return Ok(ReadOutcome::Line(line.to_string()));
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    outbound: flume::Receiver<String>,
    handle: ConnectionHandle,
    write_timeout: std::time::Duration,
) {
    let mut closed = handle.close_signal();

    loop {
        let frame = tokio::select! {
            f = outbound.recv_async() => f.ok(),
            _ = closed.wait_for(|c| *c) => None,
        };
        let Some(frame) = frame else { break };

        if let Err(e) = write_frame(&mut write_half, &frame, write_timeout).await {
            warn!(conn = handle.id(), "write failed, closing: {}", e);
            handle.close();
            return;
        }
    }

    // flush what was queued before the close, e.g. a disconnect notice
    while let Ok(frame) = outbound.try_recv() {
        if write_frame(&mut write_half, &frame, write_timeout).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn write_frame(
    write_half: &mut OwnedWriteHalf,
    frame: &str,
    write_timeout: std::time::Duration,
) -> Result<()> {
    let mut bytes = Vec::with_capacity(frame.len() + 1);
    bytes.extend_from_slice(frame.as_bytes());
    bytes.push(b'\n');

    match tokio::time::timeout(write_timeout, write_half.write_all(&bytes)).await {
        Ok(r) => Ok(r?),
        Err(_) => Err(Error::Timeout("venue write".to_string())),
    }
}

/// Probe the peer every `interval`; give up after `max_missed` silent rounds.
async fn keepalive(handle: ConnectionHandle, interval: std::time::Duration, max_missed: u32) {
    let mut closed = handle.close_signal();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closed.wait_for(|c| *c) => break,
            _ = ticker.tick() => {}
        }

        if handle.missed_pongs() >= max_missed {
            warn!(
                conn = handle.id(),
                missed = handle.missed_pongs(),
                idle_ms = handle.idle_for().as_millis() as u64,
                "💀 Keepalive exhausted, dropping connection"
            );
            handle.close();
            break;
        }

        handle.record_ping();
        if let Err(e) = handle.send_message(&VenueMessage::ping()) {
            debug!(conn = handle.id(), "ping not queued: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::AsyncBufReadExt;

    #[derive(Default)]
    struct Recorder {
        seen: parking_lot::Mutex<Vec<MessageKind>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, _identity: &str, message: VenueMessage) -> Result<()> {
            self.seen.lock().push(message.kind());
            Ok(())
        }
    }

    async fn start(config: VenueConfig) -> (SocketAddr, Arc<ConnectionRegistry>, Arc<Correlator<VenueMessage>>) {
        let (addr, registry, correlator, _) = start_recording(config).await;
        (addr, registry, correlator)
    }

    async fn start_recording(
        config: VenueConfig,
    ) -> (SocketAddr, Arc<ConnectionRegistry>, Arc<Correlator<VenueMessage>>, Arc<Recorder>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let correlator = Arc::new(Correlator::new());
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_all(&MessageKind::APPLICATION_INBOUND, recorder.clone());

        let server = VenueServer::bind(config, registry.clone(), dispatcher, correlator.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, registry, correlator, recorder)
    }

    fn test_config() -> VenueConfig {
        VenueConfig {
            listen_addr: "127.0.0.1:0".into(),
            ..VenueConfig::default()
        }
    }

    async fn connect(addr: SocketAddr, identity: &str) -> (tokio::io::Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, mut w) = stream.into_split();
        let hello = format!("{{\"type\":\"handshake\",\"client_id\":\"{}\"}}\n", identity);
        w.write_all(hello.as_bytes()).await.unwrap();
        let mut lines = BufReader::new(r).lines();
        let ack = lines.next_line().await.unwrap().unwrap();
        assert!(ack.contains("handshake_response"));
        (lines, w)
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

    #[tokio::test]
    async fn test_same_identity_replaces_connection() {
        let (addr, registry, _) = start(test_config()).await;

        let (mut first, _w1) = connect(addr, "mt5-a").await;
        wait_until(|| registry.len() == 1).await;
        let first_id = registry.get("mt5-a").unwrap().id();

        let (_second, _w2) = connect(addr, "mt5-a").await;
        wait_until(|| registry.get("mt5-a").is_some_and(|h| h.id() != first_id)).await;
        assert_eq!(registry.len(), 1);

        // old socket sees the notice, then EOF
        let notice = first.next_line().await.unwrap().unwrap();
        assert!(notice.contains("disconnect"));
        assert!(first.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missed_pongs_drop_connection() {
        let (handle, _rx) = ConnectionHandle::new(1, "peer", 64);
        tokio::spawn(keepalive(handle.clone(), Duration::from_millis(10), 3));
        wait_until(|| handle.is_closed()).await;
        assert!(handle.missed_pongs() >= 3);
    }

    #[tokio::test]
    async fn test_disconnect_abandons_bound_waiters() {
        let (addr, registry, correlator) = start(test_config()).await;
        let (_lines, mut w) = connect(addr, "mt5-b").await;
        wait_until(|| registry.len() == 1).await;

        let route = crate::core::VenueGateway::send(registry.as_ref(), &VenueMessage::ping()).unwrap();
        let waiter = correlator.register("trade:x").unwrap();
        correlator.bind("trade:x", route);

        w.write_all(b"{\"type\":\"disconnect\",\"reason\":\"bye\"}\n").await.unwrap();
        let err = waiter.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::VenueDisconnected(_)));
        wait_until(|| registry.is_empty()).await;
    }

    #[tokio::test]
    async fn test_messages_before_handshake_are_rejected() {
        let (addr, registry, _, recorder) = start_recording(test_config()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, mut w) = stream.into_split();
        w.write_all(b"{\"type\":\"ping\"}\n").await.unwrap();
        w.write_all(b"{\"type\":\"price_tick\",\"symbol\":\"X\",\"bid\":1,\"ask\":2}\n{\"type\":\"mystery\"}\n")
            .await
            .unwrap();
        w.write_all(b"{\"type\":\"handshake\",\"client_id\":\"late\"}\n").await.unwrap();

        // no pong ahead of the ack
        let mut lines = BufReader::new(r).lines();
        let ack = lines.next_line().await.unwrap().unwrap();
        assert!(ack.contains("handshake_response"));
        wait_until(|| registry.get("late").is_some()).await;
        assert!(recorder.seen.lock().is_empty());

        w.write_all(b"{\"type\":\"price_tick\",\"symbol\":\"Y\",\"bid\":1,\"ask\":2}\n")
            .await
            .unwrap();
        wait_until(|| !recorder.seen.lock().is_empty()).await;
        assert_eq!(*recorder.seen.lock(), vec![MessageKind::PriceTick]);
    }
}

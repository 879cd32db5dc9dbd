//! Subscriber sessions over TCP
//!
//! Platform clients send newline-delimited JSON commands and receive
//! [`StreamEvent`]s on the same socket.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::core::config::StreamConfig;
use crate::core::{AccountId, AccountType, Error, Result, stream_key};
use crate::hub::{StreamSubscriber, Subscribers};

/// Client command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe {
        symbol: String,
    },
    SubscribeAccount {
        account_id: AccountId,
        account_type: AccountType,
    },
    Unsubscribe {
        #[serde(default)]
        symbol: Option<String>,
        #[serde(default)]
        account_id: Option<AccountId>,
        #[serde(default)]
        account_type: Option<AccountType>,
    },
}

/// Reply to a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReply {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    fn ok(status: &'static str, key: String) -> Self {
        Self { status, key: Some(key), error: None }
    }

    fn error(message: impl Into<String>) -> Self {
        Self { status: "error", key: None, error: Some(message.into()) }
    }
}

/// Apply one command line to `subscriber`.
pub fn apply(subscriber: &StreamSubscriber, line: &str) -> CommandReply {
    let command: ClientCommand = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => return CommandReply::error(format!("invalid command: {}", e)),
    };

    match command {
        ClientCommand::Subscribe { symbol } => {
            subscriber.subscribe(symbol.clone());
            CommandReply::ok("subscribed", symbol)
        }
        ClientCommand::SubscribeAccount { account_id, account_type } => {
            let key = stream_key(account_id, account_type);
            subscriber.subscribe(key.clone());
            CommandReply::ok("subscribed", key)
        }
        ClientCommand::Unsubscribe { symbol, account_id, account_type } => {
            let key = match (symbol, account_id, account_type) {
                (Some(symbol), _, _) => symbol,
                (None, Some(id), Some(kind)) => stream_key(id, kind),
                _ => return CommandReply::error("unsubscribe needs a symbol or account_id and account_type"),
            };
            if subscriber.unsubscribe(&key) {
                CommandReply::ok("unsubscribed", key)
            } else {
                CommandReply::error(format!("not subscribed to {}", key))
            }
        }
    }
}

pub struct SessionServer {
    listener: TcpListener,
    subscribers: Subscribers,
    max_command_bytes: usize,
}

impl SessionServer {
    pub async fn bind(config: &StreamConfig, subscribers: Subscribers) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        info!("📡 Stream server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            subscribers,
            max_command_bytes: config.max_command_bytes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let subscriber = self.subscribers.register();
                    let max = self.max_command_bytes;
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, subscriber, max).await {
                            debug!(%peer, "stream session ended: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("stream accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve(stream: TcpStream, subscriber: StreamSubscriber, max_command_bytes: usize) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();

    loop {
        tokio::select! {
            line = read_command(&mut reader, &mut buf, max_command_bytes) => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(subscriber = subscriber.id(), "closing session: {}", e);
                        write_json(&mut write_half, &CommandReply::error(e.to_string())).await?;
                        break;
                    }
                };
                let reply = apply(&subscriber, &line);
                if reply.status == "error" {
                    warn!(subscriber = subscriber.id(), "rejected command: {:?}", reply.error);
                }
                write_json(&mut write_half, &reply).await?;
            }
            event = subscriber.recv() => {
                let Some(event) = event else { break };
                write_json(&mut write_half, &event).await?;
            }
        }
    }
    // dropping the subscriber cancels it
    Ok(())
}

/// Next non-blank command line of at most `max` bytes. Partial input stays
/// in `buf`, so a read cancelled by an outgoing event resumes where it was.
async fn read_command(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
    max: usize,
) -> Result<Option<String>> {
    loop {
        let limit = (max + 1).saturating_sub(buf.len()) as u64;
        let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
        if buf.last() == Some(&b'\n') {
            let line = String::from_utf8_lossy(buf).trim().to_string();
            buf.clear();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(line));
        }
        if buf.len() > max {
            return Err(Error::InvalidState(format!("command exceeds {} bytes", max)));
        }
        if n == 0 {
            return Ok(None);
        }
    }
}

async fn write_json<T: Serialize>(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    value: &T,
) -> Result<()> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    write_half.write_all(&bytes).await?;
    Ok(())
}

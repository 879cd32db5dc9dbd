//! Tag → handler dispatch for inbound venue messages

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::{Error, Result};
use crate::transport::message::{MessageKind, VenueMessage};

/// Application-level consumer of one or more inbound message kinds.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// `identity` is the handshake identity of the originating connection.
    async fn handle(&self, identity: &str, message: VenueMessage) -> Result<()>;
}

/// Registration table, frozen once the server starts.
#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) -> &mut Self {
        if self.handlers.insert(kind, handler).is_some() {
            warn!(%kind, "handler replaced");
        }
        self
    }

    /// Register one handler for several kinds.
    pub fn register_all(&mut self, kinds: &[MessageKind], handler: Arc<dyn MessageHandler>) -> &mut Self {
        for kind in kinds {
            self.register(*kind, handler.clone());
        }
        self
    }

    /// Startup check: every application message the venue sends has a handler,
    /// and nothing tries to shadow the connection-level kinds.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = MessageKind::APPLICATION_INBOUND
            .iter()
            .filter(|k| !self.handlers.contains_key(k))
            .map(|k| k.tag())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!("no handler for {}", missing.join(", "))));
        }

        for kind in [
            MessageKind::Handshake,
            MessageKind::Ping,
            MessageKind::Pong,
            MessageKind::Disconnect,
        ] {
            if self.handlers.contains_key(&kind) {
                return Err(Error::Config(format!("{} is handled by the transport", kind)));
            }
        }
        Ok(())
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Route one message. Handler failures are logged, never propagated to
    /// the connection.
    pub async fn dispatch(&self, identity: &str, message: VenueMessage) {
        let kind = message.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            warn!(identity, %kind, "no handler registered, dropping");
            return;
        };

        debug!(identity, %kind, "⬅️ dispatch");
        if let Err(e) = handler.handle(identity, message).await {
            warn!(identity, %kind, "handler failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, MessageKind)>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, identity: &str, message: VenueMessage) -> Result<()> {
            self.seen.lock().push((identity.to_string(), message.kind()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_all(&MessageKind::APPLICATION_INBOUND, recorder.clone());
        dispatcher.validate().unwrap();

        dispatcher
            .dispatch("mt5-a", VenueMessage::PriceTick(crate::core::PriceTick {
                symbol: "EURUSD".into(),
                bid: Default::default(),
                ask: Default::default(),
                timestamp: 0,
            }))
            .await;
        // outbound-only kind: logged and dropped
        dispatcher.dispatch("mt5-a", VenueMessage::ping()).await;

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], ("mt5-a".to_string(), MessageKind::PriceTick));
    }

    #[test]
    fn test_validate_reports_missing_and_shadowed() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(MessageKind::TradeResponse, recorder.clone());
        assert!(matches!(dispatcher.validate(), Err(Error::Config(_))));

        dispatcher.register_all(&MessageKind::APPLICATION_INBOUND, recorder.clone());
        dispatcher.register(MessageKind::Ping, recorder);
        assert!(matches!(dispatcher.validate(), Err(Error::Config(_))));
    }
}

//! Inbound command decoding and dispatch.
//!
//! A message carries an ordered batch of commands. Dispatch applies them one by one and stops
//! at the first command it cannot run; commands already applied stay applied.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::UserId;
use crate::metrics::Metrics;
use crate::models::{Envelope, InboundMessage, RawCommand, SubscriptionNotice};
use crate::ws_registry::ConnectionRegistry;

pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";

/// Resolved command. Tags other than the known ones become `Unrecognized`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Unrecognized(String),
}

impl TryFrom<RawCommand> for Command {
    type Error = DispatchError;

    /// Fails only when a known tag carries a payload that is not a list of market ids.
    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        Ok(match raw.kind.as_str() {
            SUBSCRIBE => Command::Subscribe(markets(SUBSCRIBE, raw.payload)?),
            UNSUBSCRIBE => Command::Unsubscribe(markets(UNSUBSCRIBE, raw.payload)?),
            _ => Command::Unrecognized(raw.kind),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown command type {0:?}")]
    UnknownCommand(String),
    #[error("invalid payload for {command}: {source}")]
    InvalidPayload {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub fn decode_message(text: &str) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_str(text)
}

fn markets(command: &'static str, payload: serde_json::Value) -> Result<Vec<String>, DispatchError> {
    serde_json::from_value(payload).map_err(|source| DispatchError::InvalidPayload { command, source })
}

/// Business side of the known commands.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn subscribe(&self, user_id: UserId, markets: Vec<String>);
    async fn unsubscribe(&self, user_id: UserId, markets: Vec<String>);
}

pub struct Dispatcher {
    handler: Arc<dyn CommandHandler>,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn CommandHandler>) -> Self {
        Self { handler }
    }

    /// Run the batch in order. Returns how many commands were applied, or the error that
    /// stopped the batch.
    pub async fn dispatch(&self, user_id: UserId, message: InboundMessage) -> Result<usize, DispatchError> {
        let mut applied = 0;
        for raw in message.commands {
            match Command::try_from(raw)? {
                Command::Subscribe(markets) => self.handler.subscribe(user_id, markets).await,
                Command::Unsubscribe(markets) => self.handler.unsubscribe(user_id, markets).await,
                Command::Unrecognized(kind) => return Err(DispatchError::UnknownCommand(kind)),
            }
            applied += 1;
        }
        Ok(applied)
    }
}

/// Default handler. Market subscriptions are not tracked yet; both commands are logged, and
/// `subscribe` optionally announces itself to every connection.
pub struct MarketCommands {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    announce_subscriptions: bool,
}

impl MarketCommands {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<Metrics>, announce_subscriptions: bool) -> Self {
        Self {
            registry,
            metrics,
            announce_subscriptions,
        }
    }
}

#[async_trait]
impl CommandHandler for MarketCommands {
    async fn subscribe(&self, user_id: UserId, markets: Vec<String>) {
        tracing::info!(user_id, ?markets, "subscribing to markets");
        if !self.announce_subscriptions {
            return;
        }
        let notice = SubscriptionNotice {
            user_id,
            markets: &markets,
        };
        let envelope = match Envelope::encode("subscribed", &notice) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "failed to encode subscription notice");
                return;
            }
        };
        let report = self.registry.broadcast(&envelope).await;
        self.metrics.record_broadcast(&report);
        tracing::debug!(user_id, delivered = report.delivered, failed = report.failed, "subscription announced");
    }

    async fn unsubscribe(&self, user_id: UserId, markets: Vec<String>) {
        tracing::info!(user_id, ?markets, "unsubscribing from markets");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_connection, RecordingHandler};
    use serde_json::json;

    fn dispatcher() -> (Dispatcher, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        (Dispatcher::new(handler.clone()), handler)
    }

    fn message(json: &str) -> InboundMessage {
        decode_message(json).unwrap()
    }

    fn raw(kind: &str, payload: serde_json::Value) -> RawCommand {
        RawCommand {
            kind: kind.into(),
            payload,
        }
    }

    #[test]
    fn command_from_raw() {
        assert_eq!(
            Command::try_from(raw("subscribe", json!(["A"]))).unwrap(),
            Command::Subscribe(vec!["A".into()])
        );
        assert_eq!(
            Command::try_from(raw("unsubscribe", json!([]))).unwrap(),
            Command::Unsubscribe(vec![])
        );
        // tags are case sensitive; unknown tags keep their payload unchecked
        assert_eq!(
            Command::try_from(raw("SUBSCRIBE", json!(null))).unwrap(),
            Command::Unrecognized("SUBSCRIBE".into())
        );
        assert!(Command::try_from(raw("subscribe", json!(null))).is_err());
    }

    #[tokio::test]
    async fn subscribe_passes_markets_through() {
        let (d, h) = dispatcher();
        let applied = d
            .dispatch(3, message(r#"{"commands":[{"type":"subscribe","payload":["BTC-USD"]}]}"#))
            .await
            .unwrap();
        assert_eq!(applied, 1);
        assert_eq!(h.calls(), vec![("subscribe", 3, vec!["BTC-USD".to_string()])]);
    }

    #[tokio::test]
    async fn unknown_command_aborts_after_earlier_commands_ran() {
        let (d, h) = dispatcher();
        let err = d
            .dispatch(
                3,
                message(
                    r#"{"commands":[
                        {"type":"subscribe","payload":["BTC-USD"]},
                        {"type":"bogus","payload":[]},
                        {"type":"unsubscribe","payload":["BTC-USD"]}
                    ]}"#,
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownCommand(ref k) if k == "bogus"));
        // subscribe ran before the abort, unsubscribe never did
        assert_eq!(h.calls(), vec![("subscribe", 3, vec!["BTC-USD".to_string()])]);
    }

    #[tokio::test]
    async fn commands_run_in_order() {
        let (d, h) = dispatcher();
        let applied = d
            .dispatch(
                1,
                message(
                    r#"{"commands":[
                        {"type":"unsubscribe","payload":["ETH-USD"]},
                        {"type":"subscribe","payload":["BTC-USD","SOL-USD"]}
                    ]}"#,
                ),
            )
            .await
            .unwrap();
        assert_eq!(applied, 2);
        let calls = h.calls();
        assert_eq!(calls[0].0, "unsubscribe");
        assert_eq!(calls[1].2, vec!["BTC-USD".to_string(), "SOL-USD".to_string()]);
    }

    #[tokio::test]
    async fn invalid_payload_aborts_batch() {
        let (d, h) = dispatcher();
        let err = d
            .dispatch(
                1,
                message(
                    r#"{"commands":[
                        {"type":"subscribe","payload":"BTC-USD"},
                        {"type":"subscribe","payload":["ETH-USD"]}
                    ]}"#,
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPayload { command: SUBSCRIBE, .. }));
        assert!(h.calls().is_empty());

        let err = d
            .dispatch(1, message(r#"{"commands":[{"type":"unsubscribe","payload":[1,2]}]}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPayload { command: UNSUBSCRIBE, .. }));
    }

    #[tokio::test]
    async fn empty_batch_is_ok() {
        let (d, h) = dispatcher();
        assert_eq!(d.dispatch(1, message("{}")).await.unwrap(), 0);
        assert!(h.calls().is_empty());
    }

    #[tokio::test]
    async fn market_commands_announce_when_enabled() {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let (conn, probe) = test_connection(8);
        registry.add(8, conn);

        let quiet = MarketCommands::new(registry.clone(), metrics.clone(), false);
        quiet.subscribe(2, vec!["BTC-USD".into()]).await;
        assert!(probe.texts().is_empty());

        let loud = MarketCommands::new(registry.clone(), metrics.clone(), true);
        loud.subscribe(2, vec!["BTC-USD".into()]).await;
        loud.unsubscribe(2, vec!["BTC-USD".into()]).await;
        let texts = probe.texts();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0], r#"{"type":"subscribed","payload":{"user_id":"2","markets":["BTC-USD"]}}"#);
        assert_eq!(metrics.broadcast_failures(), 0);
    }

    #[tokio::test]
    async fn failed_announcement_writes_are_counted() {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let (ok, _pok) = test_connection(1);
        let (bad, pbad) = test_connection(2);
        pbad.fail_writes();
        registry.add(1, ok);
        registry.add(2, bad);

        let handler = MarketCommands::new(registry, metrics.clone(), true);
        handler.subscribe(1, vec!["BTC-USD".into()]).await;
        assert_eq!(metrics.broadcast_failures(), 1);
    }

    #[test]
    fn error_messages() {
        let e = DispatchError::UnknownCommand("bogus".into());
        assert_eq!(e.to_string(), r#"unknown command type "bogus""#);
    }
}

//! One bidirectional stream, e.g. the assistant chat.
//!
//! Shares the connection lifecycle of the multiplexed manager but holds a
//! single latest payload instead of a keyed map, and can send.

use crate::config::{ConfigError, StreamConfig};
use crate::connection::{ConnectionEvent, KeyedEvent, StreamConnection};
use crate::dedup::dedupe;
use crate::error::ErrorKind;
use crate::metrics::Metrics;
use crate::payload::{ChatResponse, Payload};
use crate::state::{ConnectionState, LogicalKey};
use crate::transport::Connector;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// What to do with a payload equal to the one already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Deliver it anyway; repeated replies are meaningful in a conversation
    #[default]
    Deliver,
    /// Absorb it, as the multiplexed manager does
    Suppress,
}

/// Configuration for a [`SingleChannelClient`]
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Name used in logs and metrics
    pub name: String,
    pub stream: StreamConfig,
    pub duplicate_policy: DuplicatePolicy,
    /// How long shutdown waits for the connection task before aborting it
    pub close_grace_period: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "chat".to_string(),
            stream: StreamConfig::chat(),
            duplicate_policy: DuplicatePolicy::default(),
            close_grace_period: Duration::from_secs(2),
        }
    }
}

/// Last error reported by the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Observable state of a [`SingleChannelClient`].
#[derive(Debug, Clone)]
pub struct ChannelState<P> {
    /// Most recent delivered payload
    pub latest: Option<P>,
    pub state: ConnectionState,
    /// Cleared when the connection opens again
    pub last_error: Option<ChannelError>,
    /// Payloads delivered so far
    pub received: u64,
}

impl<P> Default for ChannelState<P> {
    fn default() -> Self {
        Self {
            latest: None,
            state: ConnectionState::Idle,
            last_error: None,
            received: 0,
        }
    }
}

impl<P> ChannelState<P> {
    pub fn is_connected(&self) -> bool {
        self.state.is_open()
    }
}

/// Client for a single stream that can also send.
///
/// # Example
///
/// ```ignore
/// use ws_stream_mux::{ChannelConfig, ChatRequest, Endpoints, SingleChannelClient, WsConnector};
///
/// let endpoints = Endpoints::from_env()?;
/// let mut chat: SingleChannelClient = SingleChannelClient::connect(
///     endpoints.chat_address(),
///     ChannelConfig::default(),
///     WsConnector::new(),
/// )?;
///
/// if !chat.send(&ChatRequest::new("How busy is Road 1?")) {
///     println!("not connected: {:?}", chat.last_error());
/// }
/// chat.shutdown().await;
/// ```
pub struct SingleChannelClient<P: Payload = ChatResponse> {
    name: LogicalKey,
    connection: Option<StreamConnection>,
    state_rx: watch::Receiver<ChannelState<P>>,
    pump: Option<JoinHandle<()>>,
    metrics: Arc<Metrics>,
    close_grace_period: Duration,
}

impl<P: Payload> SingleChannelClient<P> {
    /// Start connecting to `address`.
    ///
    /// Must be called from within a tokio runtime. Fails without spawning
    /// anything if the stream settings do not validate.
    pub fn connect<C: Connector>(
        address: impl Into<String>,
        config: ChannelConfig,
        connector: C,
    ) -> Result<Self, ConfigError> {
        config.stream.validate()?;

        let name = LogicalKey::from(config.name);
        let metrics = Arc::new(Metrics::new());
        metrics.register_key(&name);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::default());

        let connection = StreamConnection::spawn(
            name.clone(),
            0,
            address.into(),
            Arc::new(connector),
            config.stream,
            metrics.clone(),
            event_tx,
        );
        let pump = tokio::spawn(pump_events(
            event_rx,
            state_tx,
            config.duplicate_policy,
            metrics.clone(),
        ));

        Ok(Self {
            name,
            connection: Some(connection),
            state_rx,
            pump: Some(pump),
            metrics,
            close_grace_period: config.close_grace_period,
        })
    }

    /// Serialize `message` as JSON and send it.
    ///
    /// Returns false, without queuing anything, if the channel is not open
    /// or the message cannot be serialized.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        let Some(connection) = self.connection.as_ref().filter(|c| c.is_open()) else {
            self.metrics.record_send_rejected();
            debug!("[STREAM {}] Not connected, message not sent", self.name);
            return false;
        };

        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                self.metrics.record_send_rejected();
                warn!("[STREAM {}] Failed to serialize message: {}", self.name, e);
                return false;
            }
        };

        if connection.try_send(Message::Text(text)) {
            true
        } else {
            self.metrics.record_send_rejected();
            false
        }
    }

    /// Most recent delivered payload
    pub fn latest(&self) -> Option<P> {
        self.state_rx.borrow().latest.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(StreamConnection::is_open)
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().state
    }

    pub fn last_error(&self) -> Option<ChannelError> {
        self.state_rx.borrow().last_error.clone()
    }

    /// A receiver for state changes, starting from the current state.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState<P>> {
        self.state_rx.clone()
    }

    /// Get the metrics for this channel
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Close the connection and wait for its task to exit. Idempotent.
    pub async fn shutdown(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        info!("[STREAM {}] Shutting down", self.name);
        connection.join(self.close_grace_period).await;

        // The event sender lived in the connection task, so the pump drains and ends
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        self.metrics.clear_keys();
    }
}

impl<P: Payload> Drop for SingleChannelClient<P> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.dispose();
        }
    }
}

/// Fold connection events into the observable channel state.
async fn pump_events<P: Payload>(
    mut events: mpsc::UnboundedReceiver<KeyedEvent<P>>,
    state_tx: watch::Sender<ChannelState<P>>,
    policy: DuplicatePolicy,
    metrics: Arc<Metrics>,
) {
    while let Some(KeyedEvent { key, event, .. }) = events.recv().await {
        match event {
            ConnectionEvent::State(state) => {
                state_tx.send_if_modified(|current| {
                    let mut changed = current.state != state;
                    current.state = state;
                    if state.is_open() {
                        changed |= current.last_error.take().is_some();
                    }
                    changed
                });
            }
            ConnectionEvent::Payload(payload) => {
                let delivered = state_tx.send_if_modified(|current| {
                    let next = match policy {
                        DuplicatePolicy::Deliver => Some(payload),
                        DuplicatePolicy::Suppress => dedupe(current.latest.as_ref(), payload),
                    };
                    match next {
                        Some(payload) => {
                            current.latest = Some(payload);
                            current.received += 1;
                            true
                        }
                        None => false,
                    }
                });

                if delivered {
                    metrics.record_payload_delivered();
                } else {
                    metrics.record_duplicate_suppressed();
                    debug!("[STREAM {}] Duplicate payload suppressed", key);
                }
            }
            ConnectionEvent::Error { kind, message } => {
                state_tx.send_modify(|current| {
                    current.last_error = Some(ChannelError { kind, message });
                });
            }
        }
    }

    // The connection task is gone; a settled Failed stays, anything else is Closed
    state_tx.send_if_modified(|current| match current.state {
        ConnectionState::Closed | ConnectionState::Failed => false,
        _ => {
            current.state = ConnectionState::Closed;
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::ChatRequest;
    use crate::testing::{Attempt, MockConnector};
    use tokio::time::timeout;

    const ADDR: &str = "mock://chat";

    fn config(policy: DuplicatePolicy) -> ChannelConfig {
        ChannelConfig {
            stream: StreamConfig::fixed(Duration::from_millis(100), 2),
            duplicate_policy: policy,
            ..ChannelConfig::default()
        }
    }

    async fn wait_until<P: Payload>(
        client: &SingleChannelClient<P>,
        condition: impl FnMut(&ChannelState<P>) -> bool,
    ) {
        let mut rx = client.subscribe();
        timeout(Duration::from_secs(60), rx.wait_for(condition))
            .await
            .expect("condition within timeout")
            .expect("channel running");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    const REPLY: &str = r#"{"message":"Road 1 is congested","image":null}"#;

    #[tokio::test(start_paused = true)]
    async fn test_send_and_receive() {
        let mock = MockConnector::new();
        let mut chat: SingleChannelClient =
            SingleChannelClient::connect(ADDR, config(DuplicatePolicy::Deliver), mock.clone())
                .expect("valid config");

        wait_until(&chat, ChannelState::is_connected).await;
        assert!(chat.is_connected());
        assert!(chat.send(&ChatRequest::new("How is Road 1?")));
        settle().await;
        assert_eq!(
            mock.received(ADDR),
            vec![Message::Text(r#"{"message":"How is Road 1?"}"#.to_string())]
        );

        mock.push_text(ADDR, REPLY);
        wait_until(&chat, |s| s.latest.is_some()).await;
        assert_eq!(
            chat.latest().map(|r| r.message),
            Some("Road 1 is congested".to_string())
        );

        chat.shutdown().await;
        assert!(!chat.is_connected());
        assert!(!mock.is_connected(ADDR));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected() {
        let mock = MockConnector::new();
        mock.script(ADDR, [Attempt::Hang]);
        let chat: SingleChannelClient =
            SingleChannelClient::connect(ADDR, config(DuplicatePolicy::Deliver), mock.clone())
                .expect("valid config");

        settle().await;
        assert_eq!(chat.state(), ConnectionState::Connecting);
        assert!(!chat.send(&ChatRequest::new("hello?")));
        assert_eq!(chat.metrics().send_rejections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_delivered_by_default() {
        let mock = MockConnector::new();
        let chat: SingleChannelClient =
            SingleChannelClient::connect(ADDR, config(DuplicatePolicy::Deliver), mock.clone())
                .expect("valid config");
        wait_until(&chat, ChannelState::is_connected).await;

        mock.push_text(ADDR, REPLY);
        mock.push_text(ADDR, REPLY);
        wait_until(&chat, |s| s.received == 2).await;
        assert_eq!(chat.metrics().duplicates_suppressed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_suppressed_on_request() {
        let mock = MockConnector::new();
        let chat: SingleChannelClient =
            SingleChannelClient::connect(ADDR, config(DuplicatePolicy::Suppress), mock.clone())
                .expect("valid config");
        wait_until(&chat, ChannelState::is_connected).await;

        mock.push_text(ADDR, REPLY);
        mock.push_text(ADDR, REPLY);
        settle().await;
        assert_eq!(chat.subscribe().borrow().received, 1);
        assert_eq!(chat.metrics().duplicates_suppressed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_recorded_and_cleared_on_reopen() {
        let mock = MockConnector::new();
        mock.script(ADDR, [Attempt::Refuse, Attempt::Accept]);
        let chat: SingleChannelClient =
            SingleChannelClient::connect(ADDR, config(DuplicatePolicy::Deliver), mock.clone())
                .expect("valid config");

        wait_until(&chat, |s| s.last_error.is_some()).await;
        assert_eq!(
            chat.last_error().map(|e| e.kind),
            Some(ErrorKind::ConnectionFailed)
        );
        assert!(!chat.is_connected());

        wait_until(&chat, ChannelState::is_connected).await;
        assert!(chat.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settles_failed_after_retries() {
        let mock = MockConnector::new();
        mock.otherwise(ADDR, Attempt::Refuse);
        let chat: SingleChannelClient =
            SingleChannelClient::connect(ADDR, config(DuplicatePolicy::Deliver), mock.clone())
                .expect("valid config");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mock.attempts(ADDR), 3);
        assert_eq!(chat.state(), ConnectionState::Failed);
        assert_eq!(
            chat.last_error().map(|e| e.kind),
            Some(ErrorKind::RetriesExhausted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let mock = MockConnector::new();
        let mut chat: SingleChannelClient =
            SingleChannelClient::connect(ADDR, config(DuplicatePolicy::Deliver), mock.clone())
                .expect("valid config");
        wait_until(&chat, ChannelState::is_connected).await;

        chat.shutdown().await;
        chat.shutdown().await;
        assert!(!chat.send(&ChatRequest::new("anyone?")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_publishes_closed() {
        let mock = MockConnector::new();
        let mut chat: SingleChannelClient =
            SingleChannelClient::connect(ADDR, config(DuplicatePolicy::Deliver), mock.clone())
                .expect("valid config");
        let subscriber = chat.subscribe();
        wait_until(&chat, ChannelState::is_connected).await;
        assert!(subscriber.borrow().is_connected());

        chat.shutdown().await;
        assert!(!chat.is_connected());
        assert_eq!(chat.state(), ConnectionState::Closed);
        assert!(!subscriber.borrow().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_publishes_closed() {
        let mock = MockConnector::new();
        let chat: SingleChannelClient =
            SingleChannelClient::connect(ADDR, config(DuplicatePolicy::Deliver), mock.clone())
                .expect("valid config");
        let mut subscriber = chat.subscribe();
        wait_until(&chat, ChannelState::is_connected).await;

        drop(chat);
        timeout(
            Duration::from_secs(60),
            subscriber.wait_for(|s| s.state == ConnectionState::Closed),
        )
        .await
        .expect("closed within timeout")
        .expect("final state published");
        assert!(!mock.is_connected(ADDR));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_notice_recorded_as_error() {
        let mock = MockConnector::new();
        let chat: SingleChannelClient =
            SingleChannelClient::connect(ADDR, config(DuplicatePolicy::Deliver), mock.clone())
                .expect("valid config");
        wait_until(&chat, ChannelState::is_connected).await;

        mock.push_text(ADDR, r#"{"detail":"Unauthorized"}"#);
        wait_until(&chat, |s| s.last_error.is_some()).await;
        assert_eq!(
            chat.last_error(),
            Some(ChannelError {
                kind: ErrorKind::Decode,
                message: "Unauthorized".to_string(),
            })
        );
        assert!(chat.latest().is_none());
        assert!(chat.is_connected());
        assert_eq!(mock.attempts(ADDR), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_stream_config_rejected() {
        let mock = MockConnector::new();
        let mut invalid = config(DuplicatePolicy::Deliver);
        invalid.stream.connect_timeout = Duration::ZERO;

        let result = SingleChannelClient::<ChatResponse>::connect(ADDR, invalid, mock.clone());
        assert!(matches!(result, Err(ConfigError::InvalidTimeout(_))));

        settle().await;
        assert_eq!(mock.attempts(ADDR), 0);
    }
}

use crate::config::StreamConfig;
use crate::error::{DecodeError, Error, ErrorKind};
use crate::metrics::Metrics;
use crate::payload::Payload;
use crate::state::{ConnectionState, LogicalKey};
use crate::transport::{redact_address, Connector, Transport};
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Capacity of each connection's command channel
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Commands that can be sent to a connection
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    /// Send a message
    Send(Message),
    /// Gracefully close the connection
    Close,
}

/// Something a connection reports to its owner.
#[derive(Debug)]
pub(crate) enum ConnectionEvent<P> {
    State(ConnectionState),
    Payload(P),
    Error { kind: ErrorKind, message: String },
}

/// An event tagged with the connection that produced it.
#[derive(Debug)]
pub(crate) struct KeyedEvent<P> {
    pub key: LogicalKey,
    pub connection_id: u64,
    pub event: ConnectionEvent<P>,
}

/// Where a connection task delivers its events.
pub(crate) trait EventSink: Clone + Send + 'static {
    type Payload: Payload;

    /// Returns false once the receiving side is gone.
    fn emit(&self, event: KeyedEvent<Self::Payload>) -> bool;
}

impl<P: Payload> EventSink for mpsc::UnboundedSender<KeyedEvent<P>> {
    type Payload = P;

    fn emit(&self, event: KeyedEvent<P>) -> bool {
        self.send(event).is_ok()
    }
}

/// Owner's handle to one connection task.
///
/// Dropping the handle disposes the connection.
pub(crate) struct StreamConnection {
    key: LogicalKey,
    id: u64,
    alive: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
    command_tx: mpsc::Sender<ConnectionCommand>,
    task: JoinHandle<()>,
}

impl StreamConnection {
    /// Start connecting `address` in a new task.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn<C, S>(
        key: LogicalKey,
        id: u64,
        address: String,
        connector: Arc<C>,
        config: StreamConfig,
        metrics: Arc<Metrics>,
        sink: S,
    ) -> Self
    where
        C: Connector,
        S: EventSink,
    {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let alive = Arc::new(AtomicBool::new(true));
        let open = Arc::new(AtomicBool::new(false));

        let connection = Connection {
            key: key.clone(),
            id,
            address,
            connector,
            config,
            metrics,
            command_rx,
            sink,
            alive: alive.clone(),
            open: open.clone(),
        };
        let task = tokio::spawn(connection.run_with_recovery());

        Self {
            key,
            id,
            alive,
            open,
            command_tx,
            task,
        }
    }

    pub(crate) fn key(&self) -> &LogicalKey {
        &self.key
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Whether the transport is open and the handle not disposed.
    pub(crate) fn is_open(&self) -> bool {
        self.alive.load(Ordering::Acquire) && self.open.load(Ordering::Acquire)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the connection. Idempotent.
    ///
    /// After this returns the task emits no further events and schedules
    /// no further attempts, even if a reconnect timer is already running.
    pub(crate) fn dispose(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.open.store(false, Ordering::Release);
        debug!("[STREAM {}#{}] Disposing connection", self.key, self.id);

        if self.command_tx.try_send(ConnectionCommand::Close).is_err() {
            // Command queue full or task already gone
            self.task.abort();
        }
    }

    /// Queue a message for the open transport. Never queues while disconnected.
    pub(crate) fn try_send(&self, message: Message) -> bool {
        self.is_open()
            && self
                .command_tx
                .try_send(ConnectionCommand::Send(message))
                .is_ok()
    }

    /// Wait for the task to exit, aborting it after `grace`.
    pub(crate) async fn join(mut self, grace: Duration) {
        self.dispose();
        if timeout(grace, &mut self.task).await.is_err() {
            warn!(
                "[STREAM {}#{}] Connection did not close within {:?}, aborting",
                self.key, self.id, grace
            );
            self.task.abort();
            let _ = (&mut self.task).await;
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// How one connected session ended.
enum Outcome {
    /// Close requested by the owner
    Stopped,
    /// Transport closed by the peer; reconnect
    Disconnected,
}

/// Task side of a connection: connect, read, reconnect.
struct Connection<C: Connector, S: EventSink> {
    key: LogicalKey,
    id: u64,
    address: String,
    connector: Arc<C>,
    config: StreamConfig,
    metrics: Arc<Metrics>,
    command_rx: mpsc::Receiver<ConnectionCommand>,
    sink: S,
    alive: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
}

impl<C: Connector, S: EventSink> Connection<C, S> {
    /// Run the connection loop, reporting a panic as `Failed` instead of
    /// leaving the key stuck in its last state.
    async fn run_with_recovery(self) {
        let key = self.key.clone();
        let id = self.id;
        let sink = self.sink.clone();
        let alive = self.alive.clone();
        let open = self.open.clone();
        let metrics = self.metrics.clone();

        match AssertUnwindSafe(self.run()).catch_unwind().await {
            Ok(()) => {
                debug!("[STREAM {}#{}] Connection task finished", key, id);
            }
            Err(panic_err) => {
                let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!("[STREAM {}#{}] Connection task PANICKED: {}", key, id, panic_msg);
                metrics.record_error();
                open.store(false, Ordering::Release);

                if alive.load(Ordering::Acquire) {
                    metrics.record_state(&key, ConnectionState::Failed);
                    sink.emit(KeyedEvent {
                        key: key.clone(),
                        connection_id: id,
                        event: ConnectionEvent::Error {
                            kind: ErrorKind::ConnectionFailed,
                            message: format!("connection task panicked: {}", panic_msg),
                        },
                    });
                    sink.emit(KeyedEvent {
                        key,
                        connection_id: id,
                        event: ConnectionEvent::State(ConnectionState::Failed),
                    });
                }
            }
        }
    }

    /// Reconnects until closed or out of attempts.
    ///
    /// Between two successful opens at most `1 + max_reconnect_attempts`
    /// connection attempts are made.
    async fn run(mut self) {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut reconnect_attempt = 0u32;

        loop {
            if !self.is_alive() {
                return;
            }

            self.report(ConnectionState::Connecting);
            self.metrics.record_connect_attempt(&self.key);

            match self.connect_and_run(&mut reconnect_attempt).await {
                Ok(Outcome::Stopped) => {
                    info!("[STREAM {}#{}] Connection closed", self.key, self.id);
                    return;
                }
                Ok(Outcome::Disconnected) => {
                    self.report(ConnectionState::Closed);
                }
                Err(e) => {
                    self.metrics.record_error();
                    warn!(
                        "[STREAM {}#{}] Connection error: {} (attempt {}/{})",
                        self.key,
                        self.id,
                        e,
                        reconnect_attempt + 1,
                        max_attempts + 1
                    );
                    self.report_error(&e);
                    self.report(ConnectionState::Failed);
                }
            }

            if reconnect_attempt >= max_attempts {
                error!(
                    "[STREAM {}#{}] Max reconnection attempts ({}) reached",
                    self.key, self.id, max_attempts
                );
                self.metrics.record_retries_exhausted();
                self.report_error(&Error::RetriesExhausted {
                    attempts: reconnect_attempt + 1,
                });
                self.report(ConnectionState::Failed);
                return;
            }

            let delay = self.config.backoff.delay_for_attempt(reconnect_attempt);
            reconnect_attempt += 1;
            debug!(
                "[STREAM {}#{}] Reconnecting in {:?} (attempt {}/{})",
                self.key, self.id, delay, reconnect_attempt, max_attempts
            );

            if !self.sleep_unless_closed(delay).await {
                return;
            }
            // A timer that outlives dispose must not reconnect
            if !self.is_alive() {
                trace!(
                    "[STREAM {}#{}] Reconnect timer fired after dispose",
                    self.key,
                    self.id
                );
                return;
            }
            self.metrics.record_reconnection();
        }
    }

    /// Connect and run until disconnection.
    async fn connect_and_run(&mut self, reconnect_attempt: &mut u32) -> Result<Outcome, Error> {
        let connector = self.connector.clone();
        let address = self.address.clone();
        let connect_timeout = self.config.connect_timeout;

        debug!(
            "[STREAM {}#{}] Connecting to {}",
            self.key,
            self.id,
            redact_address(&address)
        );

        let connect = async move { timeout(connect_timeout, connector.connect(&address)).await };
        tokio::pin!(connect);

        // Stay responsive to close while the handshake is in flight
        let transport = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(Ok(transport)) => break transport,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(Error::ConnectTimeout(connect_timeout)),
                },
                cmd = self.command_rx.recv() => match cmd {
                    Some(ConnectionCommand::Send(_)) => self.reject_send(),
                    Some(ConnectionCommand::Close) | None => return Ok(Outcome::Stopped),
                },
            }
        };

        if !self.is_alive() {
            return Ok(Outcome::Stopped);
        }

        *reconnect_attempt = 0;
        self.open.store(true, Ordering::Release);
        self.metrics.record_connection(&self.key);
        info!(
            "[STREAM {}#{}] Connected to {}",
            self.key,
            self.id,
            redact_address(&self.address)
        );
        self.report(ConnectionState::Open);

        let outcome = self.message_loop(transport).await;

        self.open.store(false, Ordering::Release);
        if self.is_alive() {
            self.metrics.record_disconnect(&self.key);
        }
        outcome
    }

    async fn message_loop(&mut self, transport: Transport) -> Result<Outcome, Error> {
        let Transport {
            mut sink,
            mut stream,
        } = transport;

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(message)) => match message {
                        Message::Ping(data) => {
                            trace!("[STREAM {}#{}] Received ping, sending pong", self.key, self.id);
                            sink.send(Message::Pong(data)).await?;
                        }
                        Message::Pong(_) => {}
                        Message::Close(frame) => {
                            info!("[STREAM {}#{}] Received close frame: {:?}", self.key, self.id, frame);
                            return Ok(Outcome::Disconnected);
                        }
                        Message::Frame(_) => {}
                        data => self.handle_data(&data),
                    },
                    Some(Err(e)) => {
                        warn!("[STREAM {}#{}] WebSocket error: {}", self.key, self.id, e);
                        return Err(Error::WebSocket(e));
                    }
                    None => {
                        info!("[STREAM {}#{}] WebSocket stream ended", self.key, self.id);
                        return Ok(Outcome::Disconnected);
                    }
                },
                cmd = self.command_rx.recv() => match cmd {
                    Some(ConnectionCommand::Send(message)) => {
                        sink.send(message).await?;
                        self.metrics.record_message_sent();
                    }
                    Some(ConnectionCommand::Close) | None => {
                        debug!("[STREAM {}#{}] Received close command", self.key, self.id);
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            trace!("[STREAM {}#{}] Close frame not sent: {}", self.key, self.id, e);
                        }
                        return Ok(Outcome::Stopped);
                    }
                },
            }
        }
    }

    /// Decode a data frame. Failures drop the frame, never the connection.
    fn handle_data(&self, message: &Message) {
        self.metrics.record_message_received(&self.key);

        match <S::Payload as Payload>::decode(message) {
            Ok(payload) => self.emit(ConnectionEvent::Payload(payload)),
            Err(DecodeError::Rejected(detail)) => {
                self.metrics.record_decode_failure();
                warn!("[STREAM {}#{}] Server rejected stream: {}", self.key, self.id, detail);
                self.emit(ConnectionEvent::Error {
                    kind: ErrorKind::Decode,
                    message: detail,
                });
            }
            Err(e) => {
                self.metrics.record_decode_failure();
                warn!(
                    "[STREAM {}#{}] Dropping undecodable message ({} bytes): {}",
                    self.key,
                    self.id,
                    message.len(),
                    e
                );
            }
        }
    }

    /// Sleep for `delay`. Returns false if a close arrived first.
    async fn sleep_unless_closed(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.command_rx.recv() => match cmd {
                    Some(ConnectionCommand::Send(_)) => self.reject_send(),
                    Some(ConnectionCommand::Close) | None => return false,
                },
            }
        }
    }

    fn reject_send(&self) {
        self.metrics.record_send_rejected();
        debug!(
            "[STREAM {}#{}] Dropping outbound message, not connected",
            self.key, self.id
        );
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn report(&self, state: ConnectionState) {
        if self.is_alive() {
            self.metrics.record_state(&self.key, state);
        }
        self.emit(ConnectionEvent::State(state));
    }

    fn report_error(&self, error: &Error) {
        self.emit(ConnectionEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn emit(&self, event: ConnectionEvent<S::Payload>) {
        if !self.is_alive() {
            return;
        }
        let delivered = self.sink.emit(KeyedEvent {
            key: self.key.clone(),
            connection_id: self.id,
            event,
        });
        if !delivered {
            trace!("[STREAM {}#{}] Event receiver gone", self.key, self.id);
        }
    }
}

use crate::config::ManagerConfig;
use crate::connection::{ConnectionEvent, EventSink, KeyedEvent, StreamConnection};
use crate::dedup::dedupe;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::payload::Payload;
use crate::reconciler::{self, normalize_keys, ReconcileReport};
use crate::state::{ConnectionState, LogicalKey};
use crate::status::AggregateStatus;
use crate::transport::{redact_address, Connector};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Maps a logical key to the address its connection dials.
type AddressResolver = Box<dyn Fn(&LogicalKey) -> String + Send + Sync>;

/// Everything a consumer can observe about the managed keys.
///
/// Every key in the desired set has a `states` entry; `payloads` only holds
/// keys that delivered at least one payload. `revision` increases on every
/// change that is published.
#[derive(Debug, Clone)]
pub struct Snapshot<P> {
    pub payloads: HashMap<LogicalKey, P>,
    pub states: HashMap<LogicalKey, ConnectionState>,
    pub any_connected: bool,
    pub all_connected: bool,
    pub revision: u64,
}

impl<P> Default for Snapshot<P> {
    fn default() -> Self {
        Self {
            payloads: HashMap::new(),
            states: HashMap::new(),
            any_connected: false,
            all_connected: false,
            revision: 0,
        }
    }
}

impl<P> Snapshot<P> {
    /// Latest payload for a key
    pub fn payload(&self, key: &str) -> Option<&P> {
        self.payloads.get(key)
    }

    /// Connection state for a key, `None` if the key is not managed
    pub fn state(&self, key: &str) -> Option<ConnectionState> {
        self.states.get(key).copied()
    }

    /// Whether a key's connection is open
    pub fn is_connected(&self, key: &str) -> bool {
        self.state(key).is_some_and(ConnectionState::is_open)
    }

    pub fn status(&self) -> AggregateStatus {
        AggregateStatus {
            any_connected: self.any_connected,
            all_connected: self.all_connected,
        }
    }

    /// Recompute the aggregate flags. Returns true if either changed.
    fn refresh_status(&mut self) -> bool {
        let status = AggregateStatus::from_states(self.states.values());
        let changed = status != self.status();
        self.any_connected = status.any_connected;
        self.all_connected = status.all_connected;
        changed
    }
}

/// Work for the driver task. Commands and connection events share one
/// queue, so they are applied strictly in arrival order.
enum Task<P> {
    Reconcile {
        keys: Vec<LogicalKey>,
        ack: Option<oneshot::Sender<ReconcileReport>>,
    },
    Teardown {
        ack: Option<oneshot::Sender<()>>,
    },
    Event(KeyedEvent<P>),
}

struct TaskQueue<P>(mpsc::UnboundedSender<Task<P>>);

impl<P> Clone for TaskQueue<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P: Payload> EventSink for TaskQueue<P> {
    type Payload = P;

    fn emit(&self, event: KeyedEvent<P>) -> bool {
        self.0.send(Task::Event(event)).is_ok()
    }
}

/// Keeps one live connection per desired key and merges their payloads
/// into a single observable [`Snapshot`].
///
/// All bookkeeping happens on one driver task; the handle only posts work
/// to it. Dropping the handle tears everything down.
///
/// # Example
///
/// ```ignore
/// use ws_stream_mux::{Endpoints, ManagerConfig, MultiplexedStreamManager, VehicleCountUpdate, WsConnector};
///
/// let endpoints = Endpoints::from_env()?;
/// let manager: MultiplexedStreamManager<VehicleCountUpdate> = MultiplexedStreamManager::new(
///     ManagerConfig::default(),
///     WsConnector::new(),
///     move |road| endpoints.info_address(road),
/// );
///
/// let mut snapshots = manager.observe(["Road 1", "Road 2"]);
/// while snapshots.changed().await.is_ok() {
///     let snapshot = snapshots.borrow_and_update();
///     println!("all connected: {}", snapshot.all_connected);
/// }
/// ```
pub struct MultiplexedStreamManager<P: Payload> {
    queue: mpsc::UnboundedSender<Task<P>>,
    snapshot_rx: watch::Receiver<Snapshot<P>>,
    metrics: Arc<Metrics>,
    driver: Option<JoinHandle<()>>,
}

impl<P: Payload> MultiplexedStreamManager<P> {
    /// Create a manager and start its driver task. No connections are made
    /// until the first key set arrives.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<C, F>(config: ManagerConfig, connector: C, resolve: F) -> Self
    where
        C: Connector,
        F: Fn(&LogicalKey) -> String + Send + Sync + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
        let metrics = Arc::new(Metrics::new());

        let registry = Registry {
            config,
            connector: Arc::new(connector),
            resolve: Box::new(resolve),
            connections: HashMap::new(),
            retiring: Vec::new(),
            next_connection_id: 0,
            queue: TaskQueue(queue_tx.clone()),
            snapshot_tx,
            metrics: metrics.clone(),
        };
        let driver = tokio::spawn(registry.run(queue_rx));

        Self {
            queue: queue_tx,
            snapshot_rx,
            metrics,
            driver: Some(driver),
        }
    }

    /// Make `desired` the managed key set and return a receiver for
    /// snapshots.
    ///
    /// Duplicate keys collapse to one (first occurrence wins). Keys already
    /// live are left untouched.
    pub fn observe<I, K>(&self, desired: I) -> watch::Receiver<Snapshot<P>>
    where
        I: IntoIterator<Item = K>,
        K: Into<LogicalKey>,
    {
        let keys = normalize_keys(desired);
        if self.queue.send(Task::Reconcile { keys, ack: None }).is_err() {
            warn!("observe called after teardown, key set ignored");
        }
        self.subscribe()
    }

    /// Like [`observe`](Self::observe), but waits for the reconciliation
    /// pass and reports what it did.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] after teardown.
    pub async fn set_keys<I, K>(&self, desired: I) -> Result<ReconcileReport, Error>
    where
        I: IntoIterator<Item = K>,
        K: Into<LogicalKey>,
    {
        let keys = normalize_keys(desired);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.queue
            .send(Task::Reconcile {
                keys,
                ack: Some(ack_tx),
            })
            .map_err(|_| Error::ShuttingDown)?;
        ack_rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// A receiver for snapshots, starting from the current one.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot<P>> {
        self.snapshot_rx.clone()
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> Snapshot<P> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn status(&self) -> AggregateStatus {
        self.snapshot_rx.borrow().status()
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Time since a key last received data.
    ///
    /// Returns `None` if the key is not managed or not connected.
    pub fn freshness(&self, key: &str) -> Option<Duration> {
        self.metrics.freshness(key)
    }

    /// Check if a key received data within `max_age`
    pub fn is_fresh(&self, key: &str, max_age: Duration) -> bool {
        self.freshness(key).is_some_and(|age| age <= max_age)
    }

    /// Check if the driver task is still running
    pub fn is_running(&self) -> bool {
        self.driver.as_ref().is_some_and(|d| !d.is_finished())
    }

    /// Dispose every connection and stop the driver. Idempotent.
    ///
    /// Waits up to the configured grace period per connection for its task
    /// to exit.
    pub async fn teardown(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.queue.send(Task::Teardown { ack: Some(ack_tx) }).is_ok() {
            let _ = ack_rx.await;
        }

        if let Err(e) = driver.await {
            if e.is_panic() {
                error!("Stream manager driver panicked: {:?}", e);
            }
        }
    }
}

impl<P: Payload> Drop for MultiplexedStreamManager<P> {
    fn drop(&mut self) {
        if self.driver.take().is_some() {
            // Driver finishes teardown on its own
            let _ = self.queue.send(Task::Teardown { ack: None });
        }
    }
}

/// Driver-owned state: live connections and the published snapshot.
struct Registry<C: Connector, P: Payload> {
    config: ManagerConfig,
    connector: Arc<C>,
    resolve: AddressResolver,
    connections: HashMap<LogicalKey, StreamConnection>,
    /// Disposed connections whose tasks may still be exiting
    retiring: Vec<StreamConnection>,
    next_connection_id: u64,
    queue: TaskQueue<P>,
    snapshot_tx: watch::Sender<Snapshot<P>>,
    metrics: Arc<Metrics>,
}

impl<C: Connector, P: Payload> Registry<C, P> {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Task<P>>) {
        info!("Stream manager started");

        while let Some(task) = queue.recv().await {
            match task {
                Task::Reconcile { keys, ack } => {
                    let report = self.reconcile(keys);
                    if let Some(ack) = ack {
                        let _ = ack.send(report);
                    }
                }
                Task::Event(event) => self.apply(event),
                Task::Teardown { ack } => {
                    self.teardown().await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
        }

        info!("Stream manager stopped");
    }

    /// Bring the live connections in line with `desired`.
    fn reconcile(&mut self, desired: Vec<LogicalKey>) -> ReconcileReport {
        self.retiring.retain(|conn| !conn.is_finished());

        let plan = reconciler::plan(self.connections.keys(), &desired);
        if plan.is_empty() {
            trace!("Key set unchanged ({} keys)", desired.len());
            return ReconcileReport {
                live: self.live_keys(),
                ..ReconcileReport::default()
            };
        }

        for key in &plan.to_close {
            if let Some(conn) = self.connections.remove(key) {
                conn.dispose();
                self.metrics.remove_key(key);
                self.retiring.push(conn);
            }
        }

        for key in &plan.to_open {
            self.open(key.clone());
        }

        self.snapshot_tx.send_if_modified(|snapshot| {
            let mut changed = false;
            for key in &plan.to_close {
                changed |= snapshot.payloads.remove(key).is_some();
                changed |= snapshot.states.remove(key).is_some();
            }
            for key in &plan.to_open {
                snapshot.states.insert(key.clone(), ConnectionState::Idle);
                changed = true;
            }
            changed |= snapshot.refresh_status();
            if changed {
                snapshot.revision += 1;
            }
            changed
        });

        let live = self.live_keys();
        info!(
            "Reconciled keys: {} opened, {} closed, {} live",
            plan.to_open.len(),
            plan.to_close.len(),
            live.len()
        );

        ReconcileReport {
            opened: plan.to_open,
            closed: plan.to_close,
            live,
        }
    }

    fn open(&mut self, key: LogicalKey) {
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let address = (self.resolve)(&key);
        debug!(
            "[STREAM {}#{}] Opening connection to {}",
            key,
            id,
            redact_address(&address)
        );

        self.metrics.register_key(&key);
        let conn = StreamConnection::spawn(
            key.clone(),
            id,
            address,
            self.connector.clone(),
            self.config.stream.clone(),
            self.metrics.clone(),
            self.queue.clone(),
        );
        self.connections.insert(key, conn);
    }

    /// Apply one connection event. Events from connections that are no
    /// longer the live one for their key are dropped.
    fn apply(&mut self, event: KeyedEvent<P>) {
        let KeyedEvent {
            key,
            connection_id,
            event,
        } = event;

        let is_current = self
            .connections
            .get(&key)
            .is_some_and(|conn| conn.id() == connection_id);
        if !is_current {
            trace!(
                "[STREAM {}#{}] Discarding event from retired connection",
                key,
                connection_id
            );
            return;
        }

        match event {
            ConnectionEvent::State(state) => {
                self.snapshot_tx.send_if_modified(|snapshot| {
                    let previous = snapshot.states.insert(key.clone(), state);
                    let mut changed = previous != Some(state);
                    changed |= snapshot.refresh_status();
                    if changed {
                        snapshot.revision += 1;
                    }
                    changed
                });
            }
            ConnectionEvent::Payload(payload) => {
                let delivered = self.snapshot_tx.send_if_modified(|snapshot| {
                    match dedupe(snapshot.payloads.get(&key), payload) {
                        Some(payload) => {
                            snapshot.payloads.insert(key.clone(), payload);
                            snapshot.revision += 1;
                            true
                        }
                        None => false,
                    }
                });

                if delivered {
                    self.metrics.record_payload_delivered();
                } else {
                    self.metrics.record_duplicate_suppressed();
                    trace!(
                        "[STREAM {}#{}] Duplicate payload suppressed",
                        key,
                        connection_id
                    );
                }
            }
            ConnectionEvent::Error { kind, message } => {
                debug!(
                    "[STREAM {}#{}] {:?}: {}",
                    key, connection_id, kind, message
                );
            }
        }
    }

    fn live_keys(&self) -> Vec<LogicalKey> {
        let mut keys: Vec<LogicalKey> = self.connections.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn teardown(&mut self) {
        let mut connections: Vec<StreamConnection> =
            self.connections.drain().map(|(_, conn)| conn).collect();
        info!("Tearing down {} stream connections", connections.len());

        for conn in &connections {
            conn.dispose();
        }
        connections.append(&mut self.retiring);

        let grace = self.config.close_grace_period;
        join_all(connections.into_iter().map(|conn| {
            trace!("[STREAM {}#{}] Waiting for exit", conn.key(), conn.id());
            conn.join(grace)
        }))
        .await;

        self.metrics.clear_keys();
        self.snapshot_tx.send_if_modified(|snapshot| {
            let changed = !snapshot.states.is_empty() || !snapshot.payloads.is_empty();
            snapshot.states.clear();
            snapshot.payloads.clear();
            snapshot.refresh_status();
            if changed {
                snapshot.revision += 1;
            }
            changed
        });
    }
}

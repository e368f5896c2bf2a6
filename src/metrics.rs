use crate::state::{ConnectionState, LogicalKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters are global to one manager (or one channel client); per-key
/// gauges exist only while the key is part of the managed set.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
/// println!("Payloads delivered: {}", metrics.payloads_delivered());
/// println!("Duplicates absorbed: {}", metrics.duplicates_suppressed());
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connect_attempts_total: AtomicU64,
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    messages_received_total: AtomicU64,
    payloads_delivered_total: AtomicU64,
    duplicates_suppressed_total: AtomicU64,
    decode_failures_total: AtomicU64,
    messages_sent_total: AtomicU64,
    send_rejections_total: AtomicU64,
    errors_total: AtomicU64,
    retries_exhausted_total: AtomicU64,

    /// Per-key metrics
    key_metrics: RwLock<HashMap<LogicalKey, KeyMetrics>>,
}

/// Metrics for a single logical key
#[derive(Debug, Clone)]
pub struct KeyMetrics {
    /// Key identifier
    pub key: LogicalKey,
    /// Last reported connection state
    pub state: ConnectionState,
    /// Connection attempts made for this key
    pub connect_attempts: u64,
    /// Data frames received for this key (before decoding)
    pub messages_received: u64,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since last message received (None if no messages)
    pub time_since_last_message: Option<Duration>,
    /// Total time spent connected
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_message_at: Option<Instant>,
}

impl KeyMetrics {
    fn new(key: LogicalKey) -> Self {
        Self {
            key,
            state: ConnectionState::Idle,
            connect_attempts: 0,
            messages_received: 0,
            time_since_connected: None,
            time_since_last_message: None,
            total_uptime: Duration::ZERO,
            last_connected_at: None,
            last_message_at: None,
        }
    }

    /// Create a snapshot with computed durations
    fn snapshot(&self) -> KeyMetrics {
        let mut total_uptime = self.total_uptime;
        if self.state.is_open() {
            if let Some(connected_at) = self.last_connected_at {
                total_uptime += connected_at.elapsed();
            }
        }

        KeyMetrics {
            total_uptime,
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_message: self.last_message_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total connection attempts
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts_total.load(Ordering::Relaxed)
    }

    /// Get total connections established
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnections scheduled
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Get total data frames received
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Get total payloads written to a snapshot
    pub fn payloads_delivered(&self) -> u64 {
        self.payloads_delivered_total.load(Ordering::Relaxed)
    }

    /// Get total payloads absorbed as duplicates
    pub fn duplicates_suppressed(&self) -> u64 {
        self.duplicates_suppressed_total.load(Ordering::Relaxed)
    }

    /// Get total frames dropped because they failed to decode
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures_total.load(Ordering::Relaxed)
    }

    /// Get total messages sent
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Get total sends refused because the channel was not open
    pub fn send_rejections(&self) -> u64 {
        self.send_rejections_total.load(Ordering::Relaxed)
    }

    /// Get total transport errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Get total connections that gave up reconnecting
    pub fn retries_exhausted(&self) -> u64 {
        self.retries_exhausted_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connect_attempt(&self, key: &LogicalKey) {
        self.connect_attempts_total.fetch_add(1, Ordering::Relaxed);
        self.update_key(key, |k| k.connect_attempts += 1);
    }

    pub(crate) fn record_connection(&self, key: &LogicalKey) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.update_key(key, |k| {
            k.state = ConnectionState::Open;
            k.last_connected_at = Some(Instant::now());
        });
    }

    pub(crate) fn record_disconnect(&self, key: &LogicalKey) {
        self.update_key(key, |k| {
            if k.state.is_open() {
                if let Some(connected_at) = k.last_connected_at {
                    k.total_uptime += connected_at.elapsed();
                }
            }
            k.state = ConnectionState::Closed;
        });
    }

    pub(crate) fn record_state(&self, key: &LogicalKey, state: ConnectionState) {
        self.update_key(key, |k| k.state = state);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self, key: &LogicalKey) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
        self.update_key(key, |k| {
            k.messages_received += 1;
            k.last_message_at = Some(Instant::now());
        });
    }

    pub(crate) fn record_payload_delivered(&self) {
        self.payloads_delivered_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate_suppressed(&self) {
        self.duplicates_suppressed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_rejected(&self) {
        self.send_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retries_exhausted(&self) {
        self.retries_exhausted_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Start tracking a key. Updates for unregistered keys are ignored, so
    /// a connection retired mid-update cannot resurrect its entry.
    pub(crate) fn register_key(&self, key: &LogicalKey) {
        self.key_metrics
            .write()
            .insert(key.clone(), KeyMetrics::new(key.clone()));
    }

    /// Stop tracking a key
    pub(crate) fn remove_key(&self, key: &LogicalKey) {
        self.key_metrics.write().remove(key);
    }

    /// Stop tracking every key
    pub(crate) fn clear_keys(&self) {
        let mut keys = self.key_metrics.write();
        keys.clear();
        keys.shrink_to_fit();
    }

    fn update_key(&self, key: &LogicalKey, update_fn: impl FnOnce(&mut KeyMetrics)) {
        if let Some(entry) = self.key_metrics.write().get_mut(key) {
            update_fn(entry);
        }
    }

    /// Get a snapshot of one key's metrics with computed durations
    pub fn key_metrics(&self, key: &str) -> Option<KeyMetrics> {
        self.key_metrics.read().get(key).map(KeyMetrics::snapshot)
    }

    /// Time since the last data frame on an open connection.
    ///
    /// Falls back to time since connecting when nothing was received yet.
    /// Returns `None` for unknown or disconnected keys.
    pub fn freshness(&self, key: &str) -> Option<Duration> {
        let keys = self.key_metrics.read();
        let entry = keys.get(key)?;
        if !entry.state.is_open() {
            return None;
        }
        entry
            .last_message_at
            .or(entry.last_connected_at)
            .map(|t| t.elapsed())
    }

    /// Get current open connection count
    pub fn active_connections(&self) -> usize {
        self.key_metrics
            .read()
            .values()
            .filter(|k| k.state.is_open())
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the key lock once to ensure consistency
        let keys = self.key_metrics.read();
        let mut key_snapshots: Vec<KeyMetrics> = keys.values().map(KeyMetrics::snapshot).collect();
        key_snapshots.sort_by(|a, b| a.key.cmp(&b.key));

        MetricsSnapshot {
            connect_attempts_total: self.connect_attempts_total.load(Ordering::Acquire),
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            payloads_delivered_total: self.payloads_delivered_total.load(Ordering::Acquire),
            duplicates_suppressed_total: self.duplicates_suppressed_total.load(Ordering::Acquire),
            decode_failures_total: self.decode_failures_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            send_rejections_total: self.send_rejections_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            retries_exhausted_total: self.retries_exhausted_total.load(Ordering::Acquire),
            active_connections: key_snapshots.iter().filter(|k| k.state.is_open()).count(),
            keys: key_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connect_attempts_total: u64,
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub messages_received_total: u64,
    pub payloads_delivered_total: u64,
    pub duplicates_suppressed_total: u64,
    pub decode_failures_total: u64,
    pub messages_sent_total: u64,
    pub send_rejections_total: u64,
    pub errors_total: u64,
    pub retries_exhausted_total: u64,
    pub active_connections: usize,
    /// Per-key metrics, sorted by key
    pub keys: Vec<KeyMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();
        let key = LogicalKey::from("A");
        metrics.register_key(&key);

        metrics.record_connect_attempt(&key);
        metrics.record_connect_attempt(&key);
        metrics.record_connection(&key);
        metrics.record_reconnection();

        assert_eq!(metrics.connect_attempts(), 2);
        assert_eq!(metrics.connections(), 1);
        assert_eq!(metrics.reconnections(), 1);
        assert_eq!(metrics.key_metrics("A").map(|k| k.connect_attempts), Some(2));
    }

    #[test]
    fn test_unregistered_key_is_ignored() {
        let metrics = Metrics::new();
        let key = LogicalKey::from("ghost");

        metrics.record_connection(&key);

        // Global counter moves, but no per-key entry appears
        assert_eq!(metrics.connections(), 1);
        assert!(metrics.key_metrics("ghost").is_none());
        assert_eq!(metrics.active_connections(), 0);
    }

    #[test]
    fn test_removed_key_disappears() {
        let metrics = Metrics::new();
        let a = LogicalKey::from("A");
        let b = LogicalKey::from("B");
        metrics.register_key(&a);
        metrics.register_key(&b);
        metrics.record_connection(&a);
        metrics.record_connection(&b);
        assert_eq!(metrics.active_connections(), 2);

        metrics.remove_key(&b);
        assert_eq!(metrics.active_connections(), 1);
        assert!(metrics.key_metrics("B").is_none());
    }

    #[test]
    fn test_freshness() {
        let metrics = Metrics::new();
        let key = LogicalKey::from("A");
        metrics.register_key(&key);

        // Not connected yet
        assert!(metrics.freshness("A").is_none());

        metrics.record_connection(&key);
        metrics.record_message_received(&key);
        let freshness = metrics.freshness("A").expect("open key");
        assert!(freshness < Duration::from_secs(1));

        metrics.record_disconnect(&key);
        assert!(metrics.freshness("A").is_none());
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();
        let b = LogicalKey::from("B");
        let a = LogicalKey::from("A");
        metrics.register_key(&b);
        metrics.register_key(&a);

        metrics.record_connection(&a);
        metrics.record_payload_delivered();
        metrics.record_duplicate_suppressed();
        metrics.record_decode_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.payloads_delivered_total, 1);
        assert_eq!(snapshot.duplicates_suppressed_total, 1);
        assert_eq!(snapshot.decode_failures_total, 1);
        assert_eq!(
            snapshot.keys.iter().map(|k| k.key.as_str()).collect::<Vec<_>>(),
            vec!["A", "B"]
        );
    }
}

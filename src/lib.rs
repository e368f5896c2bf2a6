//! # ws-stream-mux
//!
//! Keeps one live WebSocket stream per logical key (e.g. one per road) and
//! merges them into a single observable snapshot.
//!
//! ## Features
//!
//! - **Key-set reconciliation**: change the desired keys at any time; only
//!   the difference is opened or closed
//! - **Bounded reconnection** per key, fixed or exponential backoff
//! - **Duplicate suppression**: structurally equal payloads never publish
//! - **Aggregate status**: "any connected" and "all connected" across keys
//! - **Single-channel client** for a bidirectional stream such as chat
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use ws_stream_mux::{
//!     Endpoints, ManagerConfig, MultiplexedStreamManager, StreamConfig, VehicleCountUpdate,
//!     WsConnector,
//! };
//!
//! let endpoints = Endpoints::from_env()?;
//! let config = ManagerConfig::builder()
//!     .stream(StreamConfig::traffic_info())
//!     .build()?;
//!
//! let mut manager: MultiplexedStreamManager<VehicleCountUpdate> =
//!     MultiplexedStreamManager::new(config, WsConnector::new(), move |road| {
//!         endpoints.info_address(road)
//!     });
//!
//! let report = manager.set_keys(["Road 1", "Road 2"]).await?;
//! println!("opened {:?}", report.opened);
//!
//! let snapshot = manager.snapshot();
//! println!("any connected: {}", snapshot.any_connected);
//! manager.teardown().await;
//! ```

mod channel;
mod config;
mod connection;
mod dedup;
mod error;
mod manager;
mod metrics;
mod payload;
mod reconciler;
mod state;
mod status;
mod transport;

#[cfg(test)]
mod testing;

pub use channel::{ChannelConfig, ChannelError, ChannelState, DuplicatePolicy, SingleChannelClient};
pub use config::{
    BackoffConfig, ConfigError, Endpoints, ManagerConfig, ManagerConfigBuilder, StreamConfig,
    ENV_API_PREFIX, ENV_TOKEN, ENV_WS_BASE,
};
pub use dedup::dedupe;
pub use error::{DecodeError, Error, ErrorKind};
pub use manager::{MultiplexedStreamManager, Snapshot};
pub use metrics::{KeyMetrics, Metrics, MetricsSnapshot};
pub use payload::{ChatRequest, ChatResponse, FrameUpdate, Payload, VehicleCountUpdate};
pub use reconciler::{normalize_keys, plan, ReconcilePlan, ReconcileReport};
pub use state::{ConnectionState, LogicalKey};
pub use status::AggregateStatus;
pub use transport::{redact_address, Connector, FrameSink, FrameStream, Transport, WsConnector};

// Re-export http types for WsConnector::with_header
pub use http::{HeaderName, HeaderValue};

// Re-export the frame type so custom payloads and connectors need no direct dependency
pub use tokio_tungstenite::tungstenite::Message;

/// Result type for ws-stream-mux operations
pub type Result<T> = std::result::Result<T, Error>;

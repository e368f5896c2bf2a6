use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Identifies one independent stream (e.g. a road name).
///
/// Keys are compared by exact value; any Unicode content is valid.
/// Cloning is cheap, the string is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalKey(Arc<str>);

impl LogicalKey {
    /// Create a key from any string.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for LogicalKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for LogicalKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl From<&String> for LogicalKey {
    fn from(key: &String) -> Self {
        Self::new(key)
    }
}

impl Borrow<str> for LogicalKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for LogicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of one key's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Created, no attempt made yet
    #[default]
    Idle,
    /// Connection attempt in progress
    Connecting,
    /// Transport open, messages flowing
    Open,
    /// Transport closed cleanly; a reconnect may be pending
    Closed,
    /// Transport error, or retries exhausted
    Failed,
}

impl ConnectionState {
    /// Whether the transport is currently open.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.pad(s)
    }
}

//! In-memory connector for driving connections without a network.

use crate::error::Error;
use crate::transport::{Connector, Transport};
use futures_util::{sink, stream};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// How one connection attempt behaves.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Attempt {
    Accept,
    AcceptAfter(Duration),
    Refuse,
    /// Never completes
    Hang,
}

struct Server {
    to_client: mpsc::UnboundedSender<Result<Message, WsError>>,
    received: Arc<Mutex<Vec<Message>>>,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<Attempt>>,
    fallback: HashMap<String, Attempt>,
    attempts: HashMap<String, u32>,
    servers: HashMap<String, Server>,
}

/// Scripted connector. Unscripted addresses accept immediately.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    inner: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue behaviors for the next attempts against `address`.
    pub(crate) fn script(&self, address: &str, attempts: impl IntoIterator<Item = Attempt>) {
        self.inner
            .lock()
            .scripts
            .entry(address.to_string())
            .or_default()
            .extend(attempts);
    }

    /// Behavior once the script for `address` runs out.
    pub(crate) fn otherwise(&self, address: &str, attempt: Attempt) {
        self.inner
            .lock()
            .fallback
            .insert(address.to_string(), attempt);
    }

    pub(crate) fn attempts(&self, address: &str) -> u32 {
        self.inner.lock().attempts.get(address).copied().unwrap_or(0)
    }

    /// Whether the client still holds the latest transport for `address`.
    pub(crate) fn is_connected(&self, address: &str) -> bool {
        self.inner
            .lock()
            .servers
            .get(address)
            .is_some_and(|s| !s.to_client.is_closed())
    }

    /// Deliver a frame to the client. Returns false if nobody is listening.
    pub(crate) fn push(&self, address: &str, message: Message) -> bool {
        self.inner
            .lock()
            .servers
            .get(address)
            .is_some_and(|s| s.to_client.send(Ok(message)).is_ok())
    }

    pub(crate) fn push_text(&self, address: &str, text: &str) -> bool {
        self.push(address, Message::Text(text.to_string()))
    }

    /// End the inbound stream, as a clean server-side close.
    pub(crate) fn close(&self, address: &str) {
        self.inner.lock().servers.remove(address);
    }

    /// Break the transport with an I/O error.
    pub(crate) fn fail(&self, address: &str) {
        if let Some(server) = self.inner.lock().servers.remove(address) {
            let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
            let _ = server.to_client.send(Err(WsError::Io(reset)));
        }
    }

    /// Frames the client sent on the latest transport.
    pub(crate) fn received(&self, address: &str) -> Vec<Message> {
        self.inner
            .lock()
            .servers
            .get(address)
            .map(|s| s.received.lock().clone())
            .unwrap_or_default()
    }

    fn open(&self, address: &str) -> Transport {
        let (to_client, from_server) = mpsc::unbounded_channel();
        let received = Arc::new(Mutex::new(Vec::new()));

        self.inner.lock().servers.insert(
            address.to_string(),
            Server {
                to_client,
                received: received.clone(),
            },
        );

        let inbound = stream::unfold(from_server, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let outbound = sink::unfold(received, |received, message: Message| async move {
            received.lock().push(message);
            Ok::<_, WsError>(received)
        });

        Transport::new(outbound, inbound)
    }
}

impl Connector for MockConnector {
    async fn connect(&self, address: &str) -> Result<Transport, Error> {
        let attempt = {
            let mut state = self.inner.lock();
            *state.attempts.entry(address.to_string()).or_default() += 1;
            let scripted = state.scripts.get_mut(address).and_then(VecDeque::pop_front);
            scripted
                .or_else(|| state.fallback.get(address).copied())
                .unwrap_or(Attempt::Accept)
        };

        match attempt {
            Attempt::Accept => Ok(self.open(address)),
            Attempt::AcceptAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.open(address))
            }
            Attempt::Refuse => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            }),
            Attempt::Hang => std::future::pending().await,
        }
    }
}

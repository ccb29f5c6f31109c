//! Service events and the listener registry.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::transport::conn_pool::ConnId;
use crate::utils::BroadcastError;

/// Something that happened to the service or one of its connections.
#[derive(Debug)]
pub enum Event<'a> {
    /// A consumer completed the WebSocket handshake.
    Connect {
        conn: ConnId,
        peer: Option<SocketAddr>,
    },
    Disconnect {
        conn: ConnId,
    },
    Join {
        conn: ConnId,
        topics: &'a [String],
    },
    Leave {
        conn: ConnId,
        topics: &'a [String],
    },
    /// A connection failed. `conn` is `None` when the handshake itself failed.
    Error {
        conn: Option<ConnId>,
        error: &'a BroadcastError,
    },
    /// The broker reported a failure of its own.
    BrokerError {
        error: &'a BroadcastError,
    },
}

pub type Listener = Arc<dyn Fn(&Event<'_>) + Send + Sync>;

/// Ordered, shareable list of listeners.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<Listener>>>,
}

impl Listeners {
    pub fn add(&self, listener: Listener) {
        self.inner.write().push(listener);
    }

    /// Call every listener in registration order.
    pub fn emit(&self, event: &Event<'_>) {
        // snapshot so a listener may register another without deadlocking
        let listeners = self.inner.read().clone();
        for listener in &listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Listener that writes every event to the log.
pub fn log_listener() -> Listener {
    Arc::new(|event: &Event<'_>| match event {
        Event::Connect { conn, peer } => debug!(conn = %conn, peer = ?peer, "Connected"),
        Event::Disconnect { conn } => debug!(conn = %conn, "Disconnected"),
        Event::Join { conn, topics } => debug!(conn = %conn, topics = ?topics, "Joined"),
        Event::Leave { conn, topics } => debug!(conn = %conn, topics = ?topics, "Left"),
        Event::Error { conn, error } => warn!(conn = ?conn, error = %error, "Connection error"),
        Event::BrokerError { error } => warn!(error = %error, "Broker error"),
    })
}

//! Connection fan-out pool.
//!
//! Every registered connection gets its own bounded delivery channel and a
//! drain task that owns the write half of the socket. The router only ever
//! waits on that channel, so a slow socket never holds up anybody else beyond
//! the channel's capacity.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::Upstream;
use crate::broker::message::Message;
use crate::utils::BroadcastError;

pub type ConnId = Uuid;

/// Invoked when writing to a connection fails.
pub type PoolErrorHandler = Arc<dyn Fn(ConnId, &BroadcastError) + Send + Sync>;

pub struct ConnPool {
    capacity: usize,
    conns: Mutex<HashMap<ConnId, oneshot::Sender<()>>>,
    on_error: PoolErrorHandler,
}

impl ConnPool {
    pub fn new(capacity: usize, on_error: PoolErrorHandler) -> Self {
        Self {
            capacity: capacity.max(1),
            conns: Mutex::new(HashMap::new()),
            on_error,
        }
    }

    /// Register a connection's write half and hand back its delivery channel.
    pub fn connect<S>(&self, sink: S) -> (ConnId, Upstream)
    where
        S: Sink<WsMessage> + Unpin + Send + 'static,
        S::Error: Display,
    {
        let id = Uuid::new_v4();
        let (upstream, messages) = mpsc::channel(self.capacity);
        let (shutdown, closed) = oneshot::channel();

        self.conns.lock().insert(id, shutdown);
        tokio::spawn(drain(id, sink, messages, closed, self.on_error.clone()));

        debug!(conn = %id, "Connection registered");
        (id, upstream)
    }

    /// Remove a connection and close its socket. Returns `false` when it was
    /// already gone.
    pub fn disconnect(&self, id: ConnId) -> bool {
        let Some(shutdown) = self.conns.lock().remove(&id) else {
            return false;
        };
        let _ = shutdown.send(());
        debug!(conn = %id, "Connection removed");
        true
    }

    /// Disconnect every registered connection.
    pub fn close_all(&self) {
        let conns: Vec<_> = self.conns.lock().drain().collect();
        for (id, shutdown) in conns {
            let _ = shutdown.send(());
            trace!(conn = %id, "Connection closed with pool");
        }
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn drain<S>(
    id: ConnId,
    mut sink: S,
    mut messages: mpsc::Receiver<Message>,
    mut closed: oneshot::Receiver<()>,
    on_error: PoolErrorHandler,
) where
    S: Sink<WsMessage> + Unpin + Send + 'static,
    S::Error: Display,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = &mut closed => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                // a broken payload costs this message only
                on_error(id, &BroadcastError::Protocol(e));
                continue;
            }
        };

        if let Err(e) = sink.send(WsMessage::text(text)).await {
            on_error(id, &BroadcastError::Connection(e.to_string()));
            break;
        }
    }

    let _ = sink.close().await;
    trace!(conn = %id, "Drain task finished");
}

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::broker::message::Message;
use crate::broker::owner::until_stopped;
use crate::broker::{Broker, Upstream};
use crate::utils::{BroadcastError, Result};

#[derive(Debug, Default)]
struct State {
    topics: Vec<String>,
    closed: bool,
}

/// An in-process subscriber.
///
/// Each client owns one delivery channel registered with the broker and keeps
/// track of the topics it joined, so repeated subscriptions only reach the
/// broker for topics that are new to this client.
pub struct Client {
    /// Unique identifier, used in logs.
    pub id: String,
    broker: Arc<dyn Broker>,
    upstream: Upstream,
    messages: Mutex<mpsc::Receiver<Message>>,
    state: Mutex<State>,
    closed: watch::Sender<bool>,
}

impl Client {
    /// Create a client whose delivery channel buffers `capacity` messages.
    pub fn new(broker: Arc<dyn Broker>, capacity: usize) -> Self {
        let (upstream, messages) = mpsc::channel(capacity.max(1));
        Self {
            id: format!("client-{}", Uuid::new_v4()),
            broker,
            upstream,
            messages: Mutex::new(messages),
            state: Mutex::new(State::default()),
            closed: watch::channel(false).0,
        }
    }

    /// Join topics. Topics already joined are skipped.
    pub async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BroadcastError::ClientClosed);
        }

        let mut fresh: Vec<String> = Vec::new();
        for topic in topics {
            if !state.topics.contains(topic) && !fresh.contains(topic) {
                fresh.push(topic.clone());
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }

        // A remote failure still leaves the local join in place, so the topics
        // are tracked and released on unsubscribe or close.
        let joined = self.broker.subscribe(&self.upstream, &fresh).await;
        if matches!(joined, Err(BroadcastError::Stopped)) {
            return joined;
        }
        debug!(client = %self.id, topics = ?fresh, "Subscribed");
        state.topics.extend(fresh);
        joined
    }

    /// Leave topics. Topics not joined are skipped.
    pub async fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BroadcastError::ClientClosed);
        }

        let joined: Vec<String> = topics
            .iter()
            .filter(|topic| state.topics.contains(topic))
            .cloned()
            .collect();
        if joined.is_empty() {
            return Ok(());
        }

        state.topics.retain(|topic| !joined.contains(topic));
        self.broker.unsubscribe(&self.upstream, &joined).await?;
        debug!(client = %self.id, topics = ?joined, "Unsubscribed");
        Ok(())
    }

    pub async fn publish(&self, messages: &[Message]) -> Result<()> {
        if self.state.lock().await.closed {
            return Err(BroadcastError::ClientClosed);
        }
        self.broker.publish(messages).await
    }

    /// Snapshot of the joined topics.
    pub async fn topics(&self) -> Vec<String> {
        self.state.lock().await.topics.clone()
    }

    /// Next delivered message, or `None` once the client is closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        let closed = until_stopped(self.closed.subscribe());
        let mut messages = self.messages.lock().await;
        tokio::select! {
            biased;
            message = messages.recv() => return message,
            _ = closed => {}
        }
        messages.try_recv().ok()
    }

    /// Leave every joined topic and stop receiving. Safe to call twice.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let topics = std::mem::take(&mut state.topics);
        let released = self.broker.unsubscribe(&self.upstream, &topics).await;
        self.closed.send_replace(true);
        debug!(client = %self.id, "Closed");
        released
    }
}

//! In-memory stand-in for a Redis server, shared by the test suites.
//!
//! Records every command, loops published messages back to the broker's
//! inbound stream and can be told to refuse commands.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use futures::stream::BoxStream;
use globset::Glob;
use parking_lot::Mutex;
use redis::{ErrorKind, RedisError, RedisResult};

use super::redis::{Inbound, RemotePublisher, RemoteSubscriptions};
use super::{BrokerErrorHandler, RedisBroker};

#[derive(Default)]
struct RemoteState {
    log: Vec<String>,
    channels: HashSet<String>,
    patterns: HashSet<String>,
    fail: bool,
    refused: HashSet<String>,
}

#[derive(Clone)]
pub struct Loopback {
    state: Arc<Mutex<RemoteState>>,
    inbound: UnboundedSender<Inbound>,
}

pub fn loopback() -> (Loopback, BoxStream<'static, Inbound>) {
    let (inbound, incoming) = unbounded();
    let remote = Loopback {
        state: Arc::new(Mutex::new(RemoteState::default())),
        inbound,
    };
    (remote, incoming.boxed())
}

/// A Redis broker wired to a fresh loopback remote.
pub fn redis_broker(on_error: Option<BrokerErrorHandler>) -> (Arc<RedisBroker>, Loopback) {
    let (remote, incoming) = loopback();
    let broker = RedisBroker::with_transport(
        remote.clone(),
        incoming,
        remote.clone(),
        Some(Duration::from_millis(200)),
        on_error,
    );
    (Arc::new(broker), remote)
}

impl Loopback {
    fn command(&self, name: &str, key: &str) -> RedisResult<()> {
        let mut state = self.state.lock();
        if state.fail || state.refused.contains(key) {
            return Err(RedisError::from((ErrorKind::IoError, "loopback unavailable")));
        }
        state.log.push(format!("{name} {key}"));
        Ok(())
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Fail every command while `fail` is set.
    pub fn set_failing(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    /// Fail commands naming `key` until [`Loopback::accept`] is called.
    pub fn refuse(&self, key: &str) {
        self.state.lock().refused.insert(key.to_string());
    }

    pub fn accept(&self, key: &str) {
        self.state.lock().refused.remove(key);
    }

    /// Push a frame as if Redis had delivered it, whatever the remote state.
    pub fn deliver(&self, inbound: Inbound) {
        let _ = self.inbound.unbounded_send(inbound);
    }

    /// Replace the outgoing stream, e.g. with a sender whose receiver is gone.
    pub fn with_inbound(&self, inbound: UnboundedSender<Inbound>) -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState::default())),
            inbound,
        }
    }
}

#[async_trait]
impl RemoteSubscriptions for Loopback {
    async fn subscribe(&mut self, topic: &str) -> RedisResult<()> {
        self.command("SUBSCRIBE", topic)?;
        self.state.lock().channels.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> RedisResult<()> {
        self.command("UNSUBSCRIBE", topic)?;
        self.state.lock().channels.remove(topic);
        Ok(())
    }

    async fn psubscribe(&mut self, pattern: &str) -> RedisResult<()> {
        self.command("PSUBSCRIBE", pattern)?;
        self.state.lock().patterns.insert(pattern.to_string());
        Ok(())
    }

    async fn punsubscribe(&mut self, pattern: &str) -> RedisResult<()> {
        self.command("PUNSUBSCRIBE", pattern)?;
        self.state.lock().patterns.remove(pattern);
        Ok(())
    }
}

#[async_trait]
impl RemotePublisher for Loopback {
    async fn publish(&self, topic: &str, payload: &[u8]) -> RedisResult<()> {
        self.command("PUBLISH", topic)?;

        let state = self.state.lock();
        if state.channels.contains(topic) {
            self.deliver(Inbound {
                topic: topic.to_string(),
                pattern: None,
                payload: Bytes::copy_from_slice(payload),
            });
        }
        for pattern in &state.patterns {
            let matches = Glob::new(pattern)
                .map(|glob| glob.compile_matcher().is_match(topic))
                .unwrap_or(false);
            if matches {
                self.deliver(Inbound {
                    topic: topic.to_string(),
                    pattern: Some(pattern.clone()),
                    payload: Bytes::copy_from_slice(payload),
                });
            }
        }
        Ok(())
    }
}

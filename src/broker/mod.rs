//! The `broker` module routes published messages to subscribers.
//!
//! Two backends implement the [`Broker`] trait:
//!
//! - [`MemoryBroker`] keeps everything in-process.
//! - [`RedisBroker`] bridges the local routing table to Redis Pub/Sub so that
//!   several nodes share topics.
//!
//! Both own a single [`router::Router`] inside their `serve` task; every other
//! method talks to that task through an [`owner::Mailbox`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::utils::{BroadcastError, Result};

pub mod memory;
pub mod message;
pub mod owner;
pub mod redis;
pub mod router;

pub use memory::MemoryBroker;
pub use message::{Command, Message};
pub use self::redis::RedisBroker;
pub use router::Router;

/// Delivery channel a subscriber registers with. Identity is channel identity.
pub type Upstream = mpsc::Sender<Message>;

/// Callback invoked for failures that happen inside a broker.
pub type BrokerErrorHandler = Arc<dyn Fn(&BroadcastError) + Send + Sync>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Run the owner loop until [`Broker::stop`] is called.
    async fn serve(&self) -> Result<()>;

    /// Stop serving. Safe to call more than once.
    fn stop(&self);

    async fn subscribe(&self, upstream: &Upstream, topics: &[String]) -> Result<()>;

    async fn subscribe_pattern(&self, upstream: &Upstream, pattern: &str) -> Result<()>;

    async fn unsubscribe(&self, upstream: &Upstream, topics: &[String]) -> Result<()>;

    async fn unsubscribe_pattern(&self, upstream: &Upstream, pattern: &str) -> Result<()>;

    /// Publish messages in order. Returns once each message has been handed on.
    async fn publish(&self, messages: &[Message]) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod loopback;

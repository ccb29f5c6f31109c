//! Redis-backed broker.
//!
//! Local subscribers are kept in a [`Router`] exactly like the in-memory
//! broker. Redis only learns about a topic when its first local subscriber
//! arrives and forgets it when the last one leaves, so the node holds one
//! remote subscription per live key no matter how many local connections share
//! it.
//!
//! Publishing never touches the local table: a message goes to Redis and comes
//! back through the Pub/Sub connection like everybody else's, which keeps
//! ordering identical for local and remote subscribers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::{Client, Msg, RedisResult};
use tracing::{debug, error, info};

use crate::broker::message::Message;
use crate::broker::owner::{Interest, Mailbox, Request, reply, until_stopped};
use crate::broker::router::Router;
use crate::broker::{Broker, BrokerErrorHandler, Upstream};
use crate::config::RedisSettings;
use crate::utils::{BroadcastError, Result};

/// Subscription side of the Redis Pub/Sub connection.
#[async_trait]
pub trait RemoteSubscriptions: Send {
    async fn subscribe(&mut self, topic: &str) -> RedisResult<()>;
    async fn unsubscribe(&mut self, topic: &str) -> RedisResult<()>;
    async fn psubscribe(&mut self, pattern: &str) -> RedisResult<()>;
    async fn punsubscribe(&mut self, pattern: &str) -> RedisResult<()>;
}

/// Command connection used for PUBLISH.
#[async_trait]
pub trait RemotePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> RedisResult<()>;
}

/// A message received from Redis. `pattern` is set for `pmessage` deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub pattern: Option<String>,
    pub payload: Bytes,
}

#[async_trait]
impl RemoteSubscriptions for PubSubSink {
    async fn subscribe(&mut self, topic: &str) -> RedisResult<()> {
        PubSubSink::subscribe(self, topic).await
    }

    async fn unsubscribe(&mut self, topic: &str) -> RedisResult<()> {
        PubSubSink::unsubscribe(self, topic).await
    }

    async fn psubscribe(&mut self, pattern: &str) -> RedisResult<()> {
        PubSubSink::psubscribe(self, pattern).await
    }

    async fn punsubscribe(&mut self, pattern: &str) -> RedisResult<()> {
        PubSubSink::punsubscribe(self, pattern).await
    }
}

#[async_trait]
impl RemotePublisher for ConnectionManager {
    async fn publish(&self, topic: &str, payload: &[u8]) -> RedisResult<()> {
        let mut conn = self.clone();
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }
}

fn inbound(msg: Msg) -> Inbound {
    let pattern = if msg.from_pattern() {
        msg.get_pattern::<String>().ok()
    } else {
        None
    };
    Inbound {
        topic: msg.get_channel_name().to_string(),
        pattern,
        payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
    }
}

struct Remote {
    subscriptions: Box<dyn RemoteSubscriptions>,
    incoming: BoxStream<'static, Inbound>,
}

pub struct RedisBroker {
    mailbox: Mailbox,
    remote: Mutex<Option<Remote>>,
    publisher: Arc<dyn RemotePublisher>,
    send_timeout: Option<Duration>,
    on_error: Option<BrokerErrorHandler>,
}

impl RedisBroker {
    /// Open the Pub/Sub and command connections and verify the server answers.
    pub async fn connect(
        settings: &RedisSettings,
        send_timeout: Option<Duration>,
        on_error: Option<BrokerErrorHandler>,
    ) -> Result<Self> {
        info!(addr = %settings.addr, db = settings.db, "Connecting to Redis");

        let client = Client::open(settings.connection_info()?)?;
        let (sink, stream) = client.get_async_pubsub().await?.split();

        let mut publisher = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<String>(&mut publisher).await?;

        info!(addr = %settings.addr, "Connected to Redis");
        Ok(Self::with_transport(
            sink,
            stream.map(inbound).boxed(),
            publisher,
            send_timeout,
            on_error,
        ))
    }

    /// Build a broker over an arbitrary remote transport.
    pub fn with_transport(
        subscriptions: impl RemoteSubscriptions + 'static,
        incoming: BoxStream<'static, Inbound>,
        publisher: impl RemotePublisher + 'static,
        send_timeout: Option<Duration>,
        on_error: Option<BrokerErrorHandler>,
    ) -> Self {
        Self {
            mailbox: Mailbox::new(),
            remote: Mutex::new(Some(Remote {
                subscriptions: Box::new(subscriptions),
                incoming,
            })),
            publisher: Arc::new(publisher),
            send_timeout,
            on_error,
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn serve(&self) -> Result<()> {
        let mut inbox = self.mailbox.take_inbox()?;
        let Some(Remote {
            subscriptions,
            mut incoming,
        }) = self.remote.lock().take()
        else {
            return Err(BroadcastError::AlreadyServing);
        };

        let mut bridge = Bridge {
            router: Router::new(self.send_timeout),
            subscriptions,
            on_error: self.on_error.clone(),
        };

        let stopped = until_stopped(self.mailbox.stopped());
        tokio::pin!(stopped);

        info!("Redis broker serving");
        loop {
            let step = tokio::select! {
                biased;
                _ = &mut stopped => break,
                request = inbox.recv() => match request {
                    Some(request) => Step::Request(request),
                    None => break,
                },
                received = incoming.next() => match received {
                    Some(received) => Step::Inbound(received),
                    None => {
                        let err = BroadcastError::Connection("redis pub/sub stream closed".into());
                        bridge.report(&err);
                        return Err(err);
                    }
                },
            };

            tokio::select! {
                biased;
                _ = &mut stopped => break,
                _ = bridge.step(step) => {}
            }
        }

        debug!(
            topics = bridge.router.topics().count(),
            patterns = bridge.router.patterns().count(),
            "Redis broker stopped"
        );
        Ok(())
    }

    fn stop(&self) {
        self.mailbox.stop();
    }

    async fn subscribe(&self, upstream: &Upstream, topics: &[String]) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        self.mailbox
            .call(|done| Request::Join {
                upstream: upstream.clone(),
                interest: Interest::Topics(topics.to_vec()),
                done,
            })
            .await
    }

    async fn subscribe_pattern(&self, upstream: &Upstream, pattern: &str) -> Result<()> {
        self.mailbox
            .call(|done| Request::Join {
                upstream: upstream.clone(),
                interest: Interest::Pattern(pattern.to_string()),
                done,
            })
            .await
    }

    async fn unsubscribe(&self, upstream: &Upstream, topics: &[String]) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        self.mailbox
            .call(|done| Request::Leave {
                upstream: upstream.clone(),
                interest: Interest::Topics(topics.to_vec()),
                done,
            })
            .await
    }

    async fn unsubscribe_pattern(&self, upstream: &Upstream, pattern: &str) -> Result<()> {
        self.mailbox
            .call(|done| Request::Leave {
                upstream: upstream.clone(),
                interest: Interest::Pattern(pattern.to_string()),
                done,
            })
            .await
    }

    async fn publish(&self, messages: &[Message]) -> Result<()> {
        if self.mailbox.is_stopped() {
            return Err(BroadcastError::Stopped);
        }
        for message in messages {
            if let Err(e) = self
                .publisher
                .publish(message.topic(), message.payload())
                .await
            {
                let err = BroadcastError::from(e);
                report(&self.on_error, &err);
                return Err(err);
            }
        }
        Ok(())
    }
}

enum Step {
    Request(Request),
    Inbound(Inbound),
}

/// State owned by the serve loop.
struct Bridge {
    router: Router,
    subscriptions: Box<dyn RemoteSubscriptions>,
    on_error: Option<BrokerErrorHandler>,
}

impl Bridge {
    async fn step(&mut self, step: Step) {
        match step {
            Step::Request(request) => self.handle(request).await,
            Step::Inbound(received) => {
                let message = Message::new(received.topic, received.payload);
                let delivered = match received.pattern {
                    Some(pattern) => self.router.dispatch_pattern(&pattern, &message).await,
                    None => self.router.dispatch_topic(&message).await,
                };
                debug!(topic = %message.topic(), delivered, "Relayed from Redis");
            }
        }
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Join {
                upstream,
                interest,
                done,
            } => {
                let result = match interest {
                    Interest::Topics(topics) => {
                        let live = self.router.join(&upstream, &topics);
                        self.remote_subscribe(&live).await
                    }
                    Interest::Pattern(pattern) => {
                        match self.router.join_pattern(&upstream, &pattern) {
                            Ok(live) => self.remote_psubscribe(&live).await,
                            Err(e) => Err(e),
                        }
                    }
                };
                reply(done, result);
            }
            Request::Leave {
                upstream,
                interest,
                done,
            } => {
                let result = match interest {
                    Interest::Topics(topics) => {
                        let dead = self.router.leave(&upstream, &topics);
                        self.remote_unsubscribe(&dead).await
                    }
                    Interest::Pattern(pattern) => {
                        let dead = self.router.leave_pattern(&upstream, &pattern);
                        self.remote_punsubscribe(&dead).await
                    }
                };
                reply(done, result);
            }
            Request::Dispatch { messages, done } => {
                for message in &messages {
                    self.router.dispatch(message).await;
                }
                reply(done, Ok(()));
            }
        }
    }

    // Every key is attempted and the first error returned. The local table
    // keeps the join or leave regardless of the outcome.

    async fn remote_subscribe(&mut self, topics: &[String]) -> Result<()> {
        let mut result = Ok(());
        for topic in topics {
            debug!(topic = %topic, "SUBSCRIBE");
            let outcome = self.subscriptions.subscribe(topic).await;
            result = result.and(self.check(outcome));
        }
        result
    }

    async fn remote_unsubscribe(&mut self, topics: &[String]) -> Result<()> {
        let mut result = Ok(());
        for topic in topics {
            debug!(topic = %topic, "UNSUBSCRIBE");
            let outcome = self.subscriptions.unsubscribe(topic).await;
            result = result.and(self.check(outcome));
        }
        result
    }

    async fn remote_psubscribe(&mut self, patterns: &[String]) -> Result<()> {
        let mut result = Ok(());
        for pattern in patterns {
            debug!(pattern = %pattern, "PSUBSCRIBE");
            let outcome = self.subscriptions.psubscribe(pattern).await;
            result = result.and(self.check(outcome));
        }
        result
    }

    async fn remote_punsubscribe(&mut self, patterns: &[String]) -> Result<()> {
        let mut result = Ok(());
        for pattern in patterns {
            debug!(pattern = %pattern, "PUNSUBSCRIBE");
            let outcome = self.subscriptions.punsubscribe(pattern).await;
            result = result.and(self.check(outcome));
        }
        result
    }

    fn check(&self, outcome: RedisResult<()>) -> Result<()> {
        outcome.map_err(|e| {
            let err = BroadcastError::from(e);
            self.report(&err);
            err
        })
    }

    fn report(&self, err: &BroadcastError) {
        report(&self.on_error, err);
    }
}

fn report(on_error: &Option<BrokerErrorHandler>, err: &BroadcastError) {
    error!(error = %err, "Redis broker error");
    if let Some(handler) = on_error {
        handler(err);
    }
}

//! Subscription router
//!
//! The `Router` maps exact topics and glob patterns to the upstream channels
//! interested in them. It is a plain data structure with no locking: every
//! broker keeps exactly one router inside its owner task and applies requests
//! to it one at a time.
//!
//! `join`/`leave` report the keys whose subscriber set transitioned from or to
//! empty. The Redis broker uses those deltas as its reference count: a remote
//! SUBSCRIBE is needed only for newly-live keys, an UNSUBSCRIBE only for
//! now-dead ones.
//!
//! Delivery awaits each subscriber's bounded channel in table order. With a
//! send timeout configured, a subscriber that stays full for longer than the
//! timeout loses that one message and the router moves on.

use std::collections::HashMap;
use std::time::Duration;

use globset::{Glob, GlobMatcher};
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{trace, warn};

use crate::broker::Upstream;
use crate::broker::message::Message;
use crate::utils::{BroadcastError, Result};

#[derive(Debug)]
struct PatternRoute {
    matcher: GlobMatcher,
    upstreams: Vec<Upstream>,
}

#[derive(Debug, Default)]
pub struct Router {
    routes: HashMap<String, Vec<Upstream>>,
    patterns: HashMap<String, PatternRoute>,
    send_timeout: Option<Duration>,
}

impl Router {
    /// Create an empty router. `send_timeout` of `None` makes delivery block
    /// until each subscriber has room.
    pub fn new(send_timeout: Option<Duration>) -> Self {
        Self {
            routes: HashMap::new(),
            patterns: HashMap::new(),
            send_timeout,
        }
    }

    /// Add `upstream` to every topic in `topics`. Returns the topics that had
    /// no subscriber before this call.
    pub fn join(&mut self, upstream: &Upstream, topics: &[String]) -> Vec<String> {
        let mut live = Vec::new();
        for topic in topics {
            let upstreams = self.routes.entry(topic.clone()).or_default();
            if upstreams.is_empty() {
                live.push(topic.clone());
            }
            insert(upstreams, upstream);
        }
        live
    }

    /// Remove `upstream` from every topic in `topics`. Returns the topics left
    /// without subscribers; those keys are dropped from the table.
    pub fn leave(&mut self, upstream: &Upstream, topics: &[String]) -> Vec<String> {
        let mut dead = Vec::new();
        for topic in topics {
            let Some(upstreams) = self.routes.get_mut(topic) else {
                continue;
            };
            remove(upstreams, upstream);
            if upstreams.is_empty() {
                self.routes.remove(topic);
                dead.push(topic.clone());
            }
        }
        dead
    }

    /// Pattern counterpart of [`Router::join`]. The pattern is validated before
    /// the table is touched.
    pub fn join_pattern(&mut self, upstream: &Upstream, pattern: &str) -> Result<Vec<String>> {
        if let Some(route) = self.patterns.get_mut(pattern) {
            insert(&mut route.upstreams, upstream);
            return Ok(Vec::new());
        }

        let matcher = Glob::new(pattern)
            .map_err(|source| BroadcastError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?
            .compile_matcher();

        self.patterns.insert(
            pattern.to_string(),
            PatternRoute {
                matcher,
                upstreams: vec![upstream.clone()],
            },
        );
        Ok(vec![pattern.to_string()])
    }

    /// Pattern counterpart of [`Router::leave`].
    pub fn leave_pattern(&mut self, upstream: &Upstream, pattern: &str) -> Vec<String> {
        let Some(route) = self.patterns.get_mut(pattern) else {
            return Vec::new();
        };
        remove(&mut route.upstreams, upstream);
        if route.upstreams.is_empty() {
            self.patterns.remove(pattern);
            return vec![pattern.to_string()];
        }
        Vec::new()
    }

    /// Deliver to exact subscribers of the message topic and to every pattern
    /// matching it. Returns the number of channels that accepted the message.
    pub async fn dispatch(&self, message: &Message) -> usize {
        let mut delivered = self.dispatch_topic(message).await;
        for route in self.patterns.values() {
            if route.matcher.is_match(message.topic()) {
                delivered += self.deliver_all(&route.upstreams, message).await;
            }
        }
        delivered
    }

    /// Deliver to exact subscribers of the message topic only.
    pub async fn dispatch_topic(&self, message: &Message) -> usize {
        match self.routes.get(message.topic()) {
            Some(upstreams) => self.deliver_all(upstreams, message).await,
            None => 0,
        }
    }

    /// Deliver to subscribers of `pattern` only. The caller has already matched
    /// the topic, so the local matcher is not consulted.
    pub async fn dispatch_pattern(&self, pattern: &str, message: &Message) -> usize {
        match self.patterns.get(pattern) {
            Some(route) => self.deliver_all(&route.upstreams, message).await,
            None => 0,
        }
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.keys().map(String::as_str)
    }

    /// Number of channels subscribed to exactly `topic`.
    pub fn subscribers(&self, topic: &str) -> usize {
        self.routes.get(topic).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.patterns.is_empty()
    }

    async fn deliver_all(&self, upstreams: &[Upstream], message: &Message) -> usize {
        let mut delivered = 0;
        for upstream in upstreams {
            if self.deliver(upstream, message).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn deliver(&self, upstream: &Upstream, message: &Message) -> bool {
        let Some(limit) = self.send_timeout else {
            return upstream.send(message.clone()).await.is_ok();
        };

        match upstream.send_timeout(message.clone(), limit).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    topic = %message.topic(),
                    timeout_ms = limit.as_millis() as u64,
                    "Subscriber stalled, message dropped"
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                trace!(topic = %message.topic(), "Subscriber channel closed");
                false
            }
        }
    }
}

fn insert(upstreams: &mut Vec<Upstream>, upstream: &Upstream) {
    if !upstreams.iter().any(|up| up.same_channel(upstream)) {
        upstreams.push(upstream.clone());
    }
}

fn remove(upstreams: &mut Vec<Upstream>, upstream: &Upstream) {
    upstreams.retain(|up| !up.same_channel(upstream));
}

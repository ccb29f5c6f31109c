use std::net::SocketAddr;

use crate::broker::Upstream;
use crate::transport::conn_pool::ConnId;

/// State of one consumer connection, owned by the task reading from it.
#[derive(Debug, Clone)]
pub struct ConnContext {
    id: ConnId,
    /// Channel the connection's messages are pushed into.
    pub upstream: Upstream,
    pub peer: Option<SocketAddr>,
    topics: Vec<String>,
}

impl ConnContext {
    pub fn new(id: ConnId, upstream: Upstream, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            upstream,
            peer,
            topics: Vec::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Topics currently joined, in join order.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Record topics as joined. Already-joined topics are skipped.
    pub fn add_topics(&mut self, topics: &[String]) {
        for topic in topics {
            if !self.topics.contains(topic) {
                self.topics.push(topic.clone());
            }
        }
    }

    /// Forget topics. Unknown topics are ignored.
    pub fn drop_topics(&mut self, topics: &[String]) {
        self.topics.retain(|joined| !topics.contains(joined));
    }
}

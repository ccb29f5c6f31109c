use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::broker::message::Message;
use crate::broker::owner::{Interest, Mailbox, Request, reply, until_stopped};
use crate::broker::router::Router;
use crate::broker::{Broker, Upstream};
use crate::utils::Result;

/// Single-node broker. All state lives in the router owned by `serve`.
#[derive(Debug)]
pub struct MemoryBroker {
    mailbox: Mailbox,
    send_timeout: Option<Duration>,
}

impl MemoryBroker {
    pub fn new(send_timeout: Option<Duration>) -> Self {
        Self {
            mailbox: Mailbox::new(),
            send_timeout,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn serve(&self) -> Result<()> {
        let mut inbox = self.mailbox.take_inbox()?;
        let mut router = Router::new(self.send_timeout);

        let stopped = until_stopped(self.mailbox.stopped());
        tokio::pin!(stopped);

        info!("In-memory broker serving");
        loop {
            let request = tokio::select! {
                biased;
                _ = &mut stopped => break,
                request = inbox.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            // a dispatch stuck on a stalled subscriber must not outlive stop
            tokio::select! {
                biased;
                _ = &mut stopped => break,
                _ = handle(&mut router, request) => {}
            }
        }

        debug!(topics = router.topics().count(), "In-memory broker stopped");
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
        if messages.is_empty() {
            return Ok(());
        }
        self.mailbox
            .call(|done| Request::Dispatch {
                messages: messages.to_vec(),
                done,
            })
            .await
    }
}

async fn handle(router: &mut Router, request: Request) {
    match request {
        Request::Join {
            upstream,
            interest,
            done,
        } => {
            let result = match interest {
                Interest::Topics(topics) => {
                    router.join(&upstream, &topics);
                    Ok(())
                }
                Interest::Pattern(pattern) => router.join_pattern(&upstream, &pattern).map(|_| ()),
            };
            reply(done, result);
        }
        Request::Leave {
            upstream,
            interest,
            done,
        } => {
            match interest {
                Interest::Topics(topics) => {
                    router.leave(&upstream, &topics);
                }
                Interest::Pattern(pattern) => {
                    router.leave_pattern(&upstream, &pattern);
                }
            }
            reply(done, Ok(()));
        }
        Request::Dispatch { messages, done } => {
            for message in &messages {
                let delivered = router.dispatch(message).await;
                debug!(topic = %message.topic(), delivered, "Dispatched");
            }
            reply(done, Ok(()));
        }
    }
}

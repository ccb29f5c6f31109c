//! Request mailbox shared by the broker owner tasks.
//!
//! Every broker funnels subscription changes and dispatches through a bounded
//! request queue consumed by exactly one task (`serve`). Callers build a request
//! carrying a `oneshot` reply sender and suspend until the owner answers. The
//! stop flag is a `watch` channel so any number of waiters observe it.

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::broker::Upstream;
use crate::broker::message::Message;
use crate::utils::{BroadcastError, Result};

/// Requests queued ahead of the owner before callers start to wait.
pub const REQUEST_BUFFER: usize = 32;

pub type Reply = oneshot::Sender<Result<()>>;

/// What an upstream joins or leaves.
#[derive(Debug, Clone)]
pub enum Interest {
    Topics(Vec<String>),
    Pattern(String),
}

#[derive(Debug)]
pub enum Request {
    Join {
        upstream: Upstream,
        interest: Interest,
        done: Reply,
    },
    Leave {
        upstream: Upstream,
        interest: Interest,
        done: Reply,
    },
    Dispatch {
        messages: Vec<Message>,
        done: Reply,
    },
}

#[derive(Debug)]
pub struct Mailbox {
    sender: mpsc::Sender<Request>,
    inbox: Mutex<Option<mpsc::Receiver<Request>>>,
    stop: watch::Sender<bool>,
}

impl Mailbox {
    pub fn new() -> Self {
        let (sender, inbox) = mpsc::channel(REQUEST_BUFFER);
        let (stop, _) = watch::channel(false);
        Self {
            sender,
            inbox: Mutex::new(Some(inbox)),
            stop,
        }
    }

    /// Submit a request and wait for the owner's answer.
    ///
    /// Fails with `Stopped` when the broker is stopped before or while the
    /// request is pending.
    pub async fn call<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(Reply) -> Request,
    {
        if self.is_stopped() {
            return Err(BroadcastError::Stopped);
        }

        let (done, reply) = oneshot::channel();
        let request = build(done);

        tokio::select! {
            sent = self.sender.send(request) => {
                sent.map_err(|_| BroadcastError::Stopped)?;
            }
            _ = until_stopped(self.stopped()) => return Err(BroadcastError::Stopped),
        }

        tokio::select! {
            answer = reply => answer.map_err(|_| BroadcastError::Stopped)?,
            _ = until_stopped(self.stopped()) => Err(BroadcastError::Stopped),
        }
    }

    /// Hand the request queue to the owner task. Only one caller ever gets it.
    pub fn take_inbox(&self) -> Result<mpsc::Receiver<Request>> {
        if self.is_stopped() {
            return Err(BroadcastError::Stopped);
        }
        self.inbox.lock().take().ok_or(BroadcastError::AlreadyServing)
    }

    /// Raise the stop flag. Idempotent.
    pub fn stop(&self) {
        self.stop.send_replace(true);
        // nobody will serve an untaken queue; close it so senders fail fast
        self.inbox.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the stop flag is raised.
pub async fn until_stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Answer a request. The caller may have given up waiting; that is not an error.
pub fn reply(done: Reply, result: Result<()>) {
    let _ = done.send(result);
}

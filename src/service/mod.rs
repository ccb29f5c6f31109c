//! The `service` module wires a broker, the connection pool and the WebSocket
//! transport into one runnable unit.
//!
//! The backend is chosen once, when the service is built: a `[broadcast.redis]`
//! section selects [`RedisBroker`], otherwise [`MemoryBroker`] is used.

pub mod event;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::message::{Command, Message};
use crate::broker::{Broker, BrokerErrorHandler, MemoryBroker, RedisBroker};
use crate::client::Client;
use crate::config::BroadcastSettings;
use crate::transport::conn_context::ConnContext;
use crate::transport::conn_pool::{ConnId, ConnPool, PoolErrorHandler};
use crate::transport::websocket::start_websocket_server;
use crate::utils::{BroadcastError, Result};

pub use event::{Event, Listener, Listeners, log_listener};

/// Handler for a custom connection command.
pub type CommandHandler = Arc<dyn Fn(&mut ConnContext, &Command) + Send + Sync>;

pub struct Service {
    settings: BroadcastSettings,
    broker: Arc<dyn Broker>,
    pool: ConnPool,
    listeners: Listeners,
    commands: RwLock<HashMap<String, CommandHandler>>,
}

impl Service {
    /// Build the service with the backend selected by `settings`.
    ///
    /// For Redis this connects right away, so an unreachable server fails here.
    pub async fn new(settings: BroadcastSettings) -> Result<Self> {
        let listeners = Listeners::default();

        let broker: Arc<dyn Broker> = match &settings.redis {
            Some(redis) => {
                let events = listeners.clone();
                let on_error: BrokerErrorHandler = Arc::new(move |error: &BroadcastError| {
                    events.emit(&Event::BrokerError { error })
                });
                let broker =
                    RedisBroker::connect(redis, settings.send_timeout(), Some(on_error)).await?;
                Arc::new(broker)
            }
            None => Arc::new(MemoryBroker::new(settings.send_timeout())),
        };

        Ok(Self::assemble(settings, broker, listeners))
    }

    /// Build the service around an existing broker.
    pub fn with_broker(settings: BroadcastSettings, broker: Arc<dyn Broker>) -> Self {
        Self::assemble(settings, broker, Listeners::default())
    }

    fn assemble(
        settings: BroadcastSettings,
        broker: Arc<dyn Broker>,
        listeners: Listeners,
    ) -> Self {
        let events = listeners.clone();
        let on_error: PoolErrorHandler = Arc::new(move |conn: ConnId, error: &BroadcastError| {
            events.emit(&Event::Error {
                conn: Some(conn),
                error,
            })
        });

        Self {
            pool: ConnPool::new(settings.upstream_capacity, on_error),
            settings,
            broker,
            listeners,
            commands: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &BroadcastSettings {
        &self.settings
    }

    /// URL path WebSocket upgrades are accepted on.
    pub fn path(&self) -> &str {
        &self.settings.path
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn pool(&self) -> &ConnPool {
        &self.pool
    }

    pub fn add_listener(&self, listener: Listener) {
        self.listeners.add(listener);
    }

    /// Register a handler for connection commands named `name`. A later
    /// registration under the same name replaces the earlier one.
    pub fn add_command(&self, name: impl Into<String>, handler: CommandHandler) {
        self.commands.write().insert(name.into(), handler);
    }

    pub fn command(&self, name: &str) -> Option<CommandHandler> {
        self.commands.read().get(name).cloned()
    }

    /// In-process subscriber sharing this service's broker.
    pub fn client(&self) -> Client {
        Client::new(self.broker.clone(), self.settings.upstream_capacity)
    }

    /// Publish and wait until the broker has taken the messages.
    pub async fn publish(&self, messages: &[Message]) -> Result<()> {
        self.broker.publish(messages).await
    }

    /// Publish in the background. Failures are logged; the handle carries them too.
    pub fn publish_async(&self, messages: Vec<Message>) -> JoinHandle<Result<()>> {
        let broker = self.broker.clone();
        tokio::spawn(async move {
            let result = broker.publish(&messages).await;
            if let Err(e) = &result {
                warn!(error = %e, count = messages.len(), "Background publish failed");
            }
            result
        })
    }

    /// Run the broker and accept WebSocket connections on `listener` until
    /// [`Service::stop`] is called or either side fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let broker = self.broker.clone();
        let result = tokio::select! {
            served = broker.serve() => served,
            accepted = start_websocket_server(self.clone(), listener) => accepted,
        };

        broker.stop();
        self.pool.close_all();
        info!("Broadcast service stopped");
        result
    }

    pub fn stop(&self) {
        self.broker.stop();
    }

    pub fn throw(&self, event: &Event<'_>) {
        self.listeners.emit(event);
    }

    pub fn handle_error(&self, conn: Option<ConnId>, error: &BroadcastError) {
        self.throw(&Event::Error { conn, error });
    }
}

#[cfg(test)]
mod tests;

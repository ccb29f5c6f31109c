//! The `transport` module is responsible for handling network communication
//! with consumers, via WebSockets.
//!
//! It keeps the per-connection state, the fan-out pool that writes broker
//! messages to sockets, and the server loop that decodes consumer commands
//! and forwards them to the broker.

pub mod conn_context;
pub mod conn_pool;
pub mod websocket;

pub use conn_context::ConnContext;
pub use conn_pool::{ConnId, ConnPool};

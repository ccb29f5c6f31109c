//! # PopCast
//!
//! `popcast` is a topic-based publish/subscribe broadcaster. Producers publish
//! JSON messages tagged with a topic; consumers connect over WebSockets (or
//! in-process through [`client::Client`]) and receive a live stream of every
//! message on the topics or glob patterns they joined.
//!
//! ## Core Modules
//!
//! - `broker`: the routing table and the two backends, in-memory and Redis.
//! - `client`: in-process subscriber facade.
//! - `config`: loading and validating settings.
//! - `service`: wires broker, connection pool and transport together; events.
//! - `transport`: WebSocket server, per-connection state and fan-out pool.
//! - `utils`: shared error type and logging setup.
//!
//! ## Wire protocol
//!
//! Consumers send commands and receive messages as JSON text frames:
//!
//! ```text
//! -> {"cmd": "join", "args": ["chat"]}
//! <- {"topic": "@join", "payload": ["chat"]}
//! <- {"topic": "chat", "payload": {"text": "hi"}}
//! -> {"cmd": "leave", "args": ["chat"]}
//! <- {"topic": "@leave", "payload": ["chat"]}
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod service;
pub mod transport;
pub mod utils;

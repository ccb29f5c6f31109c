//! The `client` module provides the in-process subscriber facade.
//!
//! A `Client` owns its delivery channel and the list of topics it joined, and
//! talks to whichever broker backend the service runs.

pub mod pubsub_client;
pub use pubsub_client::Client;

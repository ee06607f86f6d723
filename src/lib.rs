//! # tempstream
//!
//! `tempstream` is the event-streaming gateway of a small IoT/edge stack. It
//! holds a single connection to the shared pub/sub broker and streams topic
//! messages to any number of downstream consumers over Server-Sent Events,
//! streaming JSON and WebSockets.
//!
//! ## Core Modules
//!
//! - `broker`: the broker client interface, a WebSocket client for it and an in-memory mock.
//! - `mux`: the topic subscription multiplexer (one broker subscription per topic, fan-out, reconnects).
//! - `transport`: the HTTP and WebSocket adapters consumers connect to.
//! - `config`: loading and merging gateway configuration.
//! - `utils`: the service error type and logging setup.

pub mod broker;
pub mod config;
pub mod mux;
pub mod transport;
pub mod utils;

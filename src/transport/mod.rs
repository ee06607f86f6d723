//! The `transport` module exposes the multiplexer to downstream consumers.
//!
//! - `websocket`: raw WebSocket server; the request path names the topic and
//!   every message is sent as one text frame.
//! - `http`: axum router with Server-Sent Events, newline-delimited JSON
//!   streaming, health and per-topic stats.
//!
//! Both adapters map `/<group>/<device>/<channel>` onto the broker topic
//! `group.device.channel` (see `message`).

pub mod http;
pub mod message;
pub mod websocket;

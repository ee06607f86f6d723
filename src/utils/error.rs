//! Top-level error type for the gateway service.
//!
//! Library components carry their own narrower errors (`BrokerError`,
//! `MuxError`); this type is what `main` and the server entry points return.

use config::ConfigError;

use crate::broker::BrokerError;
use crate::mux::MuxError;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

use std::time::Duration;

use serde::Deserialize;

use crate::mux::{BackoffSequence, MuxSettings, RetryPolicy};

/// Top-level configuration settings for the gateway.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub gateway: GatewaySettings,
}

/// Where the HTTP and WebSocket adapters listen.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub http_port: u16,
    pub ws_port: u16,
}

/// Upstream broker address and reconnect policy.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub url: String,
    pub token: Option<String>,
    pub max_retries: u32,
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub backoff: BackoffSequence,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GatewaySettings {
    /// Messages buffered per consumer before drops start.
    pub mailbox_capacity: usize,
    /// Messages buffered per topic between the broker and fan-out.
    pub event_buffer: usize,
    pub log_level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub gateway: Option<PartialGatewaySettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub http_port: Option<u16>,
    pub ws_port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub url: Option<String>,
    pub token: Option<String>,
    pub max_retries: Option<u32>,
    pub base_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub backoff: Option<BackoffSequence>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialGatewaySettings {
    pub mailbox_capacity: Option<usize>,
    pub event_buffer: Option<usize>,
    pub log_level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                http_port: 7777,
                ws_port: 7778,
            },
            broker: BrokerSettings {
                url: "ws://127.0.0.1:8080".to_string(),
                token: None,
                max_retries: 20,
                base_interval_ms: 1,
                max_interval_ms: 10_000,
                connect_timeout_ms: 5_000,
                backoff: BackoffSequence::Fibonacci,
            },
            gateway: GatewaySettings {
                mailbox_capacity: 64,
                event_buffer: 256,
                log_level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Overlay whatever `partial` specifies on top of the defaults.
    pub fn merged(partial: PartialSettings) -> Self {
        let default = Self::default();
        let server = partial.server.unwrap_or_default();
        let broker = partial.broker.unwrap_or_default();
        let gateway = partial.gateway.unwrap_or_default();

        Self {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                http_port: server.http_port.unwrap_or(default.server.http_port),
                ws_port: server.ws_port.unwrap_or(default.server.ws_port),
            },
            broker: BrokerSettings {
                url: broker.url.unwrap_or(default.broker.url),
                token: broker.token.filter(|t| !t.is_empty()),
                max_retries: broker.max_retries.unwrap_or(default.broker.max_retries),
                base_interval_ms: broker
                    .base_interval_ms
                    .unwrap_or(default.broker.base_interval_ms),
                max_interval_ms: broker
                    .max_interval_ms
                    .unwrap_or(default.broker.max_interval_ms),
                connect_timeout_ms: broker
                    .connect_timeout_ms
                    .unwrap_or(default.broker.connect_timeout_ms),
                backoff: broker.backoff.unwrap_or(default.broker.backoff),
            },
            gateway: GatewaySettings {
                mailbox_capacity: gateway
                    .mailbox_capacity
                    .unwrap_or(default.gateway.mailbox_capacity),
                event_buffer: gateway
                    .event_buffer
                    .unwrap_or(default.gateway.event_buffer),
                log_level: gateway.log_level.unwrap_or(default.gateway.log_level),
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            sequence: self.broker.backoff,
            base_interval: Duration::from_millis(self.broker.base_interval_ms),
            max_interval: Duration::from_millis(self.broker.max_interval_ms),
            max_retries: self.broker.max_retries,
            attempt_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
        }
    }

    pub fn mux_settings(&self) -> MuxSettings {
        MuxSettings {
            address: self.broker.url.clone(),
            retry: self.retry_policy(),
            mailbox_capacity: self.gateway.mailbox_capacity,
            event_buffer: self.gateway.event_buffer,
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.ws_port)
    }
}

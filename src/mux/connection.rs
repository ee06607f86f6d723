//! The single shared broker connection.
//!
//! `BrokerConnection::run` owns the connect / wait-for-loss / reconnect
//! cycle. Every change is published on a watch channel; subscriptions hold
//! the receivers and resubscribe whenever a new link appears there.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::MuxError;
use super::backoff::RetryPolicy;
use crate::broker::{BrokerClient, BrokerError, BrokerLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
    /// Retries were exhausted. Terminal.
    Failed,
}

/// What subscriptions see of the connection.
///
/// `epoch` increases with every successful connect, so a subscription can
/// tell a fresh link from the one it already subscribed on.
#[derive(Clone)]
pub(crate) struct LinkStatus {
    pub(crate) state: ConnectionState,
    pub(crate) epoch: u64,
    pub(crate) link: Option<Arc<dyn BrokerLink>>,
}

impl LinkStatus {
    fn without_link(state: ConnectionState, epoch: u64) -> Self {
        Self {
            state,
            epoch,
            link: None,
        }
    }
}

pub struct BrokerConnection {
    client: Arc<dyn BrokerClient>,
    address: String,
    policy: RetryPolicy,
    status: watch::Sender<LinkStatus>,
}

impl BrokerConnection {
    pub fn new(client: Arc<dyn BrokerClient>, address: &str, policy: RetryPolicy) -> Self {
        let (status, _) = watch::channel(LinkStatus::without_link(ConnectionState::Disconnected, 0));
        Self {
            client,
            address: address.to_string(),
            policy,
            status,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn watch(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    fn publish(&self, status: LinkStatus) {
        debug!(state = ?status.state, epoch = status.epoch, "connection state changed");
        self.status.send_replace(status);
    }

    /// Connect, stay connected, reconnect on loss. Returns `Ok` on shutdown
    /// and `RetriesExhausted` when the broker stays unreachable.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), MuxError> {
        let mut epoch = 0u64;

        loop {
            self.publish(LinkStatus::without_link(ConnectionState::Connecting, epoch));

            let link = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.connect_with_retry() => match result {
                    Ok(link) => link,
                    Err(e) => {
                        error!(address = %self.address, error = %e, "giving up on broker");
                        self.publish(LinkStatus::without_link(ConnectionState::Failed, epoch));
                        return Err(e);
                    }
                }
            };

            epoch += 1;
            let (lost_tx, lost_rx) = oneshot::channel();
            link.on_disconnect(Box::new(move |reason| {
                // Nobody listening means the loop already moved on.
                let _ = lost_tx.send(reason);
            }));

            info!(address = %self.address, epoch, "connected to broker");
            self.publish(LinkStatus {
                state: ConnectionState::Connected,
                epoch,
                link: Some(link),
            });

            tokio::select! {
                _ = shutdown.cancelled() => break,
                reason = lost_rx => {
                    let reason = reason.unwrap_or_else(|_| {
                        BrokerError::Disconnected("link dropped its disconnect handler".to_string())
                    });
                    warn!(address = %self.address, %reason, "broker connection lost, reconnecting");
                    self.publish(LinkStatus::without_link(ConnectionState::Disconnected, epoch));
                }
            }
        }

        self.publish(LinkStatus::without_link(ConnectionState::ShuttingDown, epoch));
        debug!(address = %self.address, "connection loop stopped");
        Ok(())
    }

    async fn connect_with_retry(&self) -> Result<Arc<dyn BrokerLink>, MuxError> {
        let mut delays = self.policy.delays();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let last = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.client.connect(&self.address),
            )
            .await
            {
                Ok(Ok(link)) => return Ok(link),
                Ok(Err(e)) => e,
                Err(_) => BrokerError::Timeout(self.policy.attempt_timeout),
            };

            let Some(delay) = delays.next() else {
                return Err(MuxError::RetriesExhausted { attempts, last });
            };
            warn!(
                address = %self.address,
                attempt = attempts,
                error = %last,
                retry_in = ?delay,
                "broker connect failed"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

//! WebSocket broker client
//!
//! Speaks the JSON pub/sub protocol (`subscribe` / `unsubscribe` / `auth`
//! frames out, `message` / `error` frames in) over a single WebSocket.
//! Responsibilities:
//! - Open the socket and optionally authenticate with a bearer token
//! - Route inbound `message` frames to the callback registered for the topic
//! - Skip malformed frames without tearing the link down
//! - Report the loss of the socket to registered disconnect handlers
//!
//! One link carries at most one route per topic; the multiplexer above it
//! guarantees a single subscription per topic anyway.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use super::message::{ClientFrame, ServerFrame};
use super::{
    BrokerClient, BrokerError, BrokerLink, BrokerMessage, DisconnectHandler, DisconnectNotifier,
    MessageCallback, Result, TopicHandle, lock,
};

/// Connects to a broker that speaks the JSON pub/sub protocol.
#[derive(Debug, Clone, Default)]
pub struct WsBrokerClient {
    token: Option<String>,
}

impl WsBrokerClient {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl BrokerClient for WsBrokerClient {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerLink>> {
        let (ws_stream, _response) = connect_async(address)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        if let Some(token) = &self.token {
            let auth = encode_frame(&ClientFrame::Auth {
                token: token.clone(),
            })?;
            ws_sender
                .send(auth)
                .await
                .map_err(|e| BrokerError::Connect(e.to_string()))?;
            await_authenticated(&mut ws_receiver).await?;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let shared = Arc::new(LinkShared {
            outbound: tx,
            routes: Mutex::new(HashMap::new()),
            notifier: DisconnectNotifier::default(),
        });

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = ws_sender.send(msg).await {
                    debug!(error = %e, "broker send loop stopped");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        tokio::spawn(read_loop(ws_receiver, Arc::clone(&shared)));

        info!(%address, "connected to broker");
        Ok(Arc::new(WsLink { shared }))
    }
}

/// State shared between the link, its topic handles and the reader task.
struct LinkShared {
    outbound: mpsc::UnboundedSender<WsMessage>,
    routes: Mutex<HashMap<String, MessageCallback>>,
    notifier: DisconnectNotifier,
}

impl LinkShared {
    fn send(&self, frame: &ClientFrame) -> Result<()> {
        let msg = encode_frame(frame)?;
        self.outbound
            .send(msg)
            .map_err(|_| BrokerError::Disconnected("broker send loop closed".to_string()))
    }

    fn dispatch(&self, msg: &WsMessage) {
        let frame = match decode_frame(msg) {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(error = %e, "skipping malformed broker frame");
                return;
            }
            None => return,
        };

        match frame {
            ServerFrame::Message {
                topic,
                payload,
                timestamp,
                ..
            } => {
                let callback = lock(&self.routes).get(&topic).cloned();
                match callback {
                    Some(callback) => callback(BrokerMessage::stamped(timestamp, payload)),
                    None => debug!(%topic, "message for a topic with no route"),
                }
            }
            ServerFrame::Error { message } => warn!(%message, "broker reported an error"),
            ServerFrame::Authenticated {} => debug!("broker confirmed authentication"),
        }
    }
}

struct WsLink {
    shared: Arc<LinkShared>,
}

#[async_trait]
impl BrokerLink for WsLink {
    async fn subscribe_topic(
        &self,
        topic: &str,
        on_message: MessageCallback,
    ) -> Result<Box<dyn TopicHandle>> {
        if self.shared.notifier.is_lost() {
            return Err(BrokerError::Disconnected("link already lost".to_string()));
        }

        {
            let mut routes = lock(&self.shared.routes);
            if routes.contains_key(topic) {
                return Err(BrokerError::Subscribe {
                    topic: topic.to_string(),
                    reason: "topic already subscribed on this link".to_string(),
                });
            }
            routes.insert(topic.to_string(), on_message);
        }

        if let Err(e) = self.shared.send(&ClientFrame::Subscribe {
            topic: topic.to_string(),
        }) {
            lock(&self.shared.routes).remove(topic);
            return Err(e);
        }

        debug!(%topic, "subscribed on broker link");
        Ok(Box::new(WsTopicHandle {
            topic: topic.to_string(),
            shared: Arc::clone(&self.shared),
            active: true,
        }))
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        self.shared.notifier.register(handler);
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        // Last owner gone: close the socket so the reader task ends too.
        let _ = self.shared.outbound.send(WsMessage::Close(None));
    }
}

struct WsTopicHandle {
    topic: String,
    shared: Arc<LinkShared>,
    active: bool,
}

#[async_trait]
impl TopicHandle for WsTopicHandle {
    async fn unsubscribe(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        lock(&self.shared.routes).remove(&self.topic);

        // Nothing to undo on a broker we are no longer connected to.
        if self.shared.notifier.is_lost() {
            return Ok(());
        }
        self.shared
            .send(&ClientFrame::Unsubscribe {
                topic: self.topic.clone(),
            })
            .map_err(|e| BrokerError::Unsubscribe {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })
    }
}

async fn read_loop<S>(mut stream: S, shared: Arc<LinkShared>)
where
    S: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Close(_))) | None => {
                break BrokerError::Disconnected("broker closed the connection".to_string());
            }
            Some(Err(e)) => break BrokerError::Disconnected(e.to_string()),
            Some(Ok(msg)) => shared.dispatch(&msg),
        }
    };
    warn!(error = %reason, "broker link lost");
    lock(&shared.routes).clear();
    shared.notifier.notify(reason);
}

async fn await_authenticated<S>(stream: &mut S) -> Result<()>
where
    S: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        let msg = msg.map_err(|e| BrokerError::Connect(e.to_string()))?;
        match decode_frame(&msg) {
            Some(Ok(ServerFrame::Authenticated {})) => return Ok(()),
            Some(Ok(ServerFrame::Error { message })) => return Err(BrokerError::Connect(message)),
            Some(Ok(other)) => debug!(?other, "ignoring frame before authentication"),
            Some(Err(e)) => return Err(BrokerError::Protocol(e.to_string())),
            None => {}
        }
    }
    Err(BrokerError::Connect(
        "connection closed during authentication".to_string(),
    ))
}

pub(crate) fn encode_frame(frame: &ClientFrame) -> Result<WsMessage> {
    serde_json::to_string(frame)
        .map(WsMessage::text)
        .map_err(|e| BrokerError::Protocol(e.to_string()))
}

/// Decode a data frame. Control frames (ping, pong, close) yield `None`.
pub(crate) fn decode_frame(
    msg: &WsMessage,
) -> Option<std::result::Result<ServerFrame, serde_json::Error>> {
    match msg {
        WsMessage::Text(text) => Some(serde_json::from_str(text.as_str())),
        WsMessage::Binary(data) => Some(serde_json::from_slice(data)),
        _ => None,
    }
}

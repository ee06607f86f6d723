use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::mux::Multiplexer;
use crate::transport::message::topic_from_path;
use crate::utils::error::Result;

/// Bind `addr` and serve WebSocket sessions until `shutdown` fires.
pub async fn start_websocket_server(
    addr: String,
    mux: Arc<Multiplexer>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve_websocket(listener, mux, shutdown).await
}

/// Accept loop over an already bound listener.
///
/// Returns once `shutdown` fires and every open session has said goodbye.
pub async fn serve_websocket(
    listener: TcpListener,
    mux: Arc<Multiplexer>,
    shutdown: CancellationToken,
) -> Result<()> {
    let sessions = TaskTracker::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "WebSocket accept failed");
                    continue;
                }
            }
        };

        let mux = Arc::clone(&mux);
        let shutdown = shutdown.clone();
        sessions.spawn(async move {
            if let Err(e) = handle_connection(stream, peer, mux, shutdown).await {
                debug!(%peer, error = %e, "WebSocket session ended with error");
            }
        });
    }

    sessions.close();
    sessions.wait().await;
    debug!("WebSocket server stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    mux: Arc<Multiplexer>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut requested = None;
    let ws_stream = accept_hdr_async(stream, |req: &Request, resp: Response| {
        match topic_from_path(req.uri().path()) {
            Some(topic) => {
                requested = Some(topic);
                Ok(resp)
            }
            None => Err(not_found(req.uri().path())),
        }
    })
    .await?;
    let Some(topic) = requested else {
        return Ok(());
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut session = match mux.subscribe(&topic) {
        Ok(session) => session,
        Err(e) => {
            warn!(%peer, %topic, error = %e, "subscribe refused");
            ws_sender.send(close(CloseCode::Again, e.to_string())).await?;
            return Ok(());
        }
    };
    info!(%peer, %topic, session = %session.id(), "WebSocket client subscribed");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Best effort; the peer may already be gone.
                let _ = ws_sender.send(close(CloseCode::Away, "server shutting down")).await;
                break;
            }
            next = session.recv() => match next {
                Some(msg) => {
                    if let Err(e) = ws_sender.send(WsMessage::text(msg.to_json())).await {
                        debug!(%peer, error = %e, "failed to send frame");
                        break;
                    }
                }
                None => {
                    let reason = session
                        .error()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "subscription closed".to_string());
                    // Best effort; the peer may already be gone.
                    let _ = ws_sender.send(close(CloseCode::Error, reason)).await;
                    break;
                }
            },
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "WebSocket read failed");
                    break;
                }
                // Consumers have nothing to say; pings are answered by tungstenite.
                Some(Ok(_)) => {}
            },
        }
    }

    info!(%peer, %topic, dropped = session.dropped(), "WebSocket client disconnected");
    session.close();
    Ok(())
}

fn close(code: CloseCode, reason: impl Into<String>) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.into().into(),
    }))
}

fn not_found(path: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(format!(
        "no topic at '{path}', expected /<group>/<device>/<channel>"
    )));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

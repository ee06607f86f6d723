//! HTTP adapter.
//!
//! Endpoints:
//! - `GET /healthz`: broker connectivity, 200 when connected and 503 otherwise
//! - `GET /stats`: per-topic counters
//! - `GET /stream/:group/:device/:channel`: Server-Sent Events, one `message` event per broker message
//! - `GET /events/:group/:device/:channel`: newline-delimited JSON, one envelope per line

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{Stream, StreamExt, stream};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::BrokerMessage;
use crate::mux::{ClientSession, ConnectionState, Multiplexer, MuxError, TopicStats};
use crate::transport::message::topic_name;
use crate::utils::error::Result;

#[derive(Clone)]
struct AppState {
    mux: Arc<Multiplexer>,
    shutdown: CancellationToken,
}

/// Start the HTTP server on `addr`; returns after `shutdown` fires and
/// open streams have ended.
pub async fn start_http_server(
    addr: String,
    mux: Arc<Multiplexer>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(mux, shutdown.clone()))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(mux: Arc<Multiplexer>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/stats", get(stats))
        .route("/stream/:group/:device/:channel", get(stream_sse))
        .route("/events/:group/:device/:channel", get(stream_json))
        .with_state(AppState { mux, shutdown })
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let broker = state.mux.status();
    let (code, status) = match broker {
        ConnectionState::Connected => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };
    let body = json!({
        "status": status,
        "broker": broker,
        "topics": state.mux.registry().len(),
    });
    (code, Json(body))
}

async fn stats(State(state): State<AppState>) -> Json<Vec<TopicStats>> {
    Json(state.mux.stats().await)
}

async fn stream_sse(
    State(state): State<AppState>,
    Path((group, device, channel)): Path<(String, String, String)>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, ApiError>
{
    let session = open_session(&state, &group, &device, &channel)?;
    let events = session_items(session, state.shutdown.clone()).map(|item| {
        Ok(match item {
            Item::Message(msg) => Event::default().event("message").data(msg.to_json()),
            Item::Failed(err) => Event::default().event("error").data(err.to_string()),
        })
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn stream_json(
    State(state): State<AppState>,
    Path((group, device, channel)): Path<(String, String, String)>,
) -> std::result::Result<Response, ApiError> {
    let session = open_session(&state, &group, &device, &channel)?;
    let lines = session_items(session, state.shutdown.clone()).map(|item| {
        let line = match item {
            Item::Message(msg) => msg.to_json(),
            Item::Failed(err) => json!({ "error": err.to_string() }).to_string(),
        };
        Ok::<_, Infallible>(format!("{line}\n"))
    });
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

fn open_session(
    state: &AppState,
    group: &str,
    device: &str,
    channel: &str,
) -> std::result::Result<ClientSession, ApiError> {
    let topic = topic_name(group, device, channel)
        .ok_or_else(|| MuxError::InvalidTopic(format!("{group}/{device}/{channel}")))?;
    let session = state.mux.subscribe(&topic)?;
    info!(%topic, session = %session.id(), "HTTP client subscribed");
    Ok(session)
}

enum Item {
    Message(Arc<BrokerMessage>),
    /// Last item of a session that ended abnormally.
    Failed(MuxError),
}

/// The session's messages, followed by its error if it has one, cut off
/// when the server shuts down. Dropping the stream (client went away)
/// closes the session.
fn session_items(
    session: ClientSession,
    shutdown: CancellationToken,
) -> impl Stream<Item = Item> + Send + 'static {
    stream::unfold(Some(session), |session| async move {
        let mut session = session?;
        match session.recv().await {
            Some(msg) => Some((Item::Message(msg), Some(session))),
            None => session.error().cloned().map(|err| (Item::Failed(err), None)),
        }
    })
    .take_until(shutdown.cancelled_owned())
}

struct ApiError(MuxError);

impl From<MuxError> for ApiError {
    fn from(err: MuxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self.0 {
            MuxError::InvalidTopic(_) => StatusCode::BAD_REQUEST,
            MuxError::SubscribeFailed { .. } => StatusCode::BAD_GATEWAY,
            MuxError::ShuttingDown | MuxError::RetriesExhausted { .. } | MuxError::Broker(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        warn!(error = %self.0, status = %code, "stream request refused");
        (code, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

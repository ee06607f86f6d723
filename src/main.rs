//! CLI for tempstream
//!
//! Subcommands:
//! - `serve`: run the gateway (HTTP + WebSocket adapters over one broker connection)
//! - `tail`: connect to a gateway WebSocket endpoint and print every frame

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use futures_util::StreamExt;
use tempstream::broker::WsBrokerClient;
use tempstream::config::load_config;
use tempstream::mux::Multiplexer;
use tempstream::transport::http::start_http_server;
use tempstream::transport::websocket::start_websocket_server;
use tempstream::utils::error::Result;
use tempstream::utils::logging;
use tokio::task::JoinSet;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "tempstream")]
enum Command {
    /// Run the gateway
    Serve,
    /// Print the frames streamed by a gateway WebSocket endpoint
    Tail {
        /// Endpoint to connect to, e.g. ws://127.0.0.1:7778/home/smoker-1/temperature
        #[arg(long)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let result = match cmd {
        Command::Serve => run_server().await,
        Command::Tail { url } => {
            logging::init("info");
            run_tail(&url).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server() -> Result<()> {
    let config = load_config()?;
    logging::init(&config.gateway.log_level);

    let client = Arc::new(WsBrokerClient::new(config.broker.token.clone()));
    let mux = Arc::new(Multiplexer::start(client, config.mux_settings()));

    let adapters = CancellationToken::new();
    let mut servers = JoinSet::new();
    servers.spawn(start_http_server(
        config.http_addr(),
        mux.clone(),
        adapters.clone(),
    ));
    servers.spawn(start_websocket_server(
        config.ws_addr(),
        mux.clone(),
        adapters.clone(),
    ));

    let outcome: Result<()> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
        err = mux.closed() => {
            error!(error = %err, "broker connection failed for good");
            Err(err.into())
        }
        exited = servers.join_next() => match exited {
            Some(Ok(Ok(()))) | None => {
                error!("Server exited unexpectedly.");
                Ok(())
            }
            Some(Ok(Err(e))) => Err(e),
            Some(Err(e)) => Err(e.into()),
        }
    };

    // consumers first, then subscriptions, then the broker connection
    adapters.cancel();
    while let Some(exited) = servers.join_next().await {
        match exited {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "server stopped with error"),
            Err(e) => warn!(error = %e, "server task failed"),
        }
    }
    mux.shutdown().await;

    outcome
}

async fn run_tail(url: &str) -> Result<()> {
    let (mut ws_stream, _response) = connect_async(url).await?;
    info!("Connected to {}", url);

    while let Some(frame) = ws_stream.next().await {
        match frame? {
            WsMessage::Text(text) => println!("{text}"),
            WsMessage::Close(frame) => {
                if let Some(frame) = frame {
                    info!("Closed by gateway: {} {}", u16::from(frame.code), frame.reason);
                }
                break;
            }
            _ => {}
        }
    }

    Ok(())
}

//! CLI for PopCast
//!
//! Subcommands:
//! - `server`: run the broadcast service
//! - `client`: join topics on a running server and print what arrives

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use popcast::config::{Settings, load_config, load_config_from};
use popcast::service::{Service, log_listener};
use popcast::utils::logging;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "popcast")]
enum Command {
    /// Start the broadcast server
    Server {
        /// Configuration file; defaults to config/default.* when present
        #[arg(long, env = "POPCAST_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Join topics and print every message received
    Client {
        /// WebSocket URL of the server
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,
        /// Topics to join
        #[arg(required = true)]
        topics: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    match Command::parse() {
        Command::Server { config } => {
            if let Err(e) = run_server(config).await {
                // no-op when settings were loaded and logging is already up
                logging::init("info");
                error!("Server failed: {}", e);
                std::process::exit(1);
            }
        }
        Command::Client { url, topics } => {
            logging::init("info");
            if let Err(e) = run_client(&url, topics).await {
                error!("Client failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run_server(config: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let settings: Settings = match config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    logging::init(&settings.log.level);

    let listener = TcpListener::bind(settings.server.addr()).await?;
    let service = Arc::new(Service::new(settings.broadcast.clone()).await?);
    if logging::is_verbose(&settings.log.level) {
        service.add_listener(log_listener());
    }

    let serving = service.clone().serve(listener);
    tokio::pin!(serving);
    tokio::select! {
        served = &mut serving => return Ok(served?),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            service.stop();
        }
    }

    // let serve close the open connections before exiting
    serving.await?;
    Ok(())
}

async fn run_client(url: &str, topics: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let (mut ws_stream, _response) = connect_async(url).await?;
    info!(%url, topics = ?topics, "Connected");

    let join = json!({ "cmd": "join", "args": topics });
    ws_stream
        .send(WsMessage::Text(join.to_string().into()))
        .await?;

    while let Some(frame) = ws_stream.next().await {
        match frame? {
            WsMessage::Text(text) => println!("{text}"),
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}

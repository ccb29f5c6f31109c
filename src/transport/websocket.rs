use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{Command, Message};
use crate::service::{Event, Service};
use crate::transport::conn_context::ConnContext;
use crate::utils::{BroadcastError, Result};

/// Accept connections on `listener` and serve each one on its own task.
///
/// Only returns when accepting fails.
pub async fn start_websocket_server(service: Arc<Service>, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, path = %service.path(), "WebSocket server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            accept_connection(service, stream, peer).await;
        });
    }
}

async fn accept_connection(service: Arc<Service>, stream: TcpStream, peer: SocketAddr) {
    let path = service.path().to_string();
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == path {
            return Ok(response);
        }
        let mut rejection = ErrorResponse::new(Some("not found".to_string()));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    };

    let ws_stream = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "WebSocket handshake failed");
            service.handle_error(None, &BroadcastError::from(e));
            return;
        }
    };

    let (sink, frames) = ws_stream.split();
    let (id, upstream) = service.pool().connect(sink);
    service.throw(&Event::Connect {
        conn: id,
        peer: Some(peer),
    });

    let mut ctx = ConnContext::new(id, upstream, Some(peer));
    serve_conn(&service, &mut ctx, frames).await;
}

/// Read commands until the connection ends, then release everything it held.
pub async fn serve_conn<F>(service: &Service, ctx: &mut ConnContext, frames: F)
where
    F: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    if let Err(e) = read_commands(service, ctx, frames).await {
        debug!(conn = %ctx.id(), error = %e, "Connection terminated");
        service.handle_error(Some(ctx.id()), &e);
    }

    service.throw(&Event::Disconnect { conn: ctx.id() });

    let broker = service.broker();
    if let Err(e) = broker.unsubscribe(&ctx.upstream, ctx.topics()).await {
        warn!(conn = %ctx.id(), error = %e, "Failed to release topics");
    }
    service.pool().disconnect(ctx.id());
}

async fn read_commands<F>(service: &Service, ctx: &mut ConnContext, mut frames: F) -> Result<()>
where
    F: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = frames.next().await {
        let command: Command = match frame? {
            WsMessage::Text(text) => serde_json::from_str(text.as_str())?,
            WsMessage::Binary(data) => serde_json::from_slice(&data)?,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        handle_command(service, ctx, &command).await?;
    }
    Ok(())
}

/// Apply one command. An error ends the connection.
pub async fn handle_command(
    service: &Service,
    ctx: &mut ConnContext,
    command: &Command,
) -> Result<()> {
    match command.name() {
        "join" => {
            let topics: Vec<String> = command.unmarshal()?;
            if topics.is_empty() {
                return Ok(());
            }

            let joined = service.broker().subscribe(&ctx.upstream, &topics).await;
            if !matches!(joined, Err(BroadcastError::Stopped)) {
                ctx.add_topics(&topics);
            }
            joined?;
            echo(ctx, "@join", &topics).await?;
            service.throw(&Event::Join {
                conn: ctx.id(),
                topics: &topics,
            });
        }
        "leave" => {
            let topics: Vec<String> = command.unmarshal()?;
            if topics.is_empty() {
                return Ok(());
            }

            ctx.drop_topics(&topics);
            service.broker().unsubscribe(&ctx.upstream, &topics).await?;
            echo(ctx, "@leave", &topics).await?;
            service.throw(&Event::Leave {
                conn: ctx.id(),
                topics: &topics,
            });
        }
        name => match service.command(name) {
            Some(handler) => handler(ctx, command),
            None => debug!(conn = %ctx.id(), command = name, "Ignoring unknown command"),
        },
    }
    Ok(())
}

async fn echo(ctx: &ConnContext, topic: &str, topics: &[String]) -> Result<()> {
    let message = Message::json(topic, topics)?;
    ctx.upstream
        .send(message)
        .await
        .map_err(|_| BroadcastError::Connection(format!("connection {} is closed", ctx.id())))
}

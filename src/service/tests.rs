use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;

use super::{Event, Service};
use crate::broker::MemoryBroker;
use crate::broker::loopback::redis_broker;
use crate::broker::message::{Command, Message};
use crate::config::{BroadcastSettings, RedisSettings, Settings};
use crate::transport::conn_context::ConnContext;
use crate::utils::Result;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn settings() -> BroadcastSettings {
    let mut settings = Settings::default().broadcast;
    settings.send_timeout_ms = 500;
    settings
}

async fn start(settings: BroadcastSettings) -> (Arc<Service>, String, JoinHandle<Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let broker = Arc::new(MemoryBroker::new(settings.send_timeout()));
    let url = format!("ws://{addr}{}", settings.path);

    let service = Arc::new(Service::with_broker(settings, broker));
    let serving = tokio::spawn(service.clone().serve(listener));
    (service, url, serving)
}

async fn connect(url: &str) -> Ws {
    let (ws, _response) = connect_async(url).await.expect("WebSocket handshake failed");
    ws
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(WsMessage::text(value.to_string()))
        .await
        .expect("send frame");
}

async fn read(ws: &mut Ws) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(1), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .expect("read frame");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("frame is JSON");
        }
    }
}

async fn assert_quiet(ws: &mut Ws) {
    let waited = tokio::time::timeout(Duration::from_millis(100), ws.next()).await;
    assert!(waited.is_err(), "unexpected frame: {waited:?}");
}

async fn assert_closed(ws: &mut Ws) {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(1), ws.next())
            .await
            .expect("connection stayed open");
        match frame {
            None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => return,
            Some(Ok(WsMessage::Text(text))) => panic!("unexpected frame: {text}"),
            Some(Ok(_)) => continue,
        }
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

fn record_events(service: &Service) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    service.add_listener(Arc::new(move |event: &Event<'_>| {
        let name = match event {
            Event::Connect { .. } => "connect".to_string(),
            Event::Disconnect { .. } => "disconnect".to_string(),
            Event::Join { topics, .. } => format!("join {}", topics.join(",")),
            Event::Leave { topics, .. } => format!("leave {}", topics.join(",")),
            Event::Error { conn, .. } => format!("error conn={}", conn.is_some()),
            Event::BrokerError { .. } => "broker error".to_string(),
        };
        sink.lock().push(name);
    }));
    seen
}

#[tokio::test]
async fn test_join_publish_leave() {
    let (service, url, _serving) = start(settings()).await;
    let mut ws = connect(&url).await;

    send(&mut ws, json!({ "cmd": "join", "args": ["topic"] })).await;
    assert_eq!(read(&mut ws).await, json!({ "topic": "@join", "payload": ["topic"] }));

    // joining twice is fine and still delivers once
    send(&mut ws, json!({ "cmd": "join", "args": ["topic"] })).await;
    assert_eq!(read(&mut ws).await, json!({ "topic": "@join", "payload": ["topic"] }));

    let hello = Message::json("topic", "hello2").unwrap();
    service.publish(&[hello]).await.unwrap();
    assert_eq!(read(&mut ws).await, json!({ "topic": "topic", "payload": "hello2" }));
    assert_quiet(&mut ws).await;

    send(&mut ws, json!({ "cmd": "leave", "args": ["topic"] })).await;
    assert_eq!(read(&mut ws).await, json!({ "topic": "@leave", "payload": ["topic"] }));

    service
        .publish(&[Message::json("topic", "hello3").unwrap()])
        .await
        .unwrap();
    assert_quiet(&mut ws).await;
}

#[tokio::test]
async fn test_subscribers_are_isolated() {
    let (service, url, _serving) = start(settings()).await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;

    send(&mut a, json!({ "cmd": "join", "args": ["a"] })).await;
    read(&mut a).await;
    send(&mut b, json!({ "cmd": "join", "args": ["b"] })).await;
    read(&mut b).await;

    service
        .publish(&[Message::new("a", "1"), Message::new("b", "2")])
        .await
        .unwrap();

    assert_eq!(read(&mut a).await, json!({ "topic": "a", "payload": 1 }));
    assert_eq!(read(&mut b).await, json!({ "topic": "b", "payload": 2 }));
    assert_quiet(&mut a).await;
    assert_quiet(&mut b).await;
}

#[tokio::test]
async fn test_broken_payload_does_not_stop_delivery() {
    let (service, url, _serving) = start(settings()).await;
    let mut ws = connect(&url).await;
    let events = record_events(&service);

    send(&mut ws, json!({ "cmd": "join", "args": ["topic"] })).await;
    read(&mut ws).await;

    service
        .publish(&[Message::new("topic", "{broken"), Message::new("topic", "\"ok\"")])
        .await
        .unwrap();
    assert_eq!(read(&mut ws).await, json!({ "topic": "topic", "payload": "ok" }));
    assert!(events.lock().contains(&"error conn=true".to_string()));
}

#[tokio::test]
async fn test_malformed_command_closes_connection() {
    let (service, url, _serving) = start(settings()).await;
    let events = record_events(&service);

    let mut ws = connect(&url).await;
    ws.send(WsMessage::text("not json")).await.unwrap();
    assert_closed(&mut ws).await;

    let mut ws = connect(&url).await;
    send(&mut ws, json!({ "cmd": "join", "args": "topic" })).await;
    assert_closed(&mut ws).await;

    eventually("both connections released", || service.pool().is_empty()).await;
    let errors = events
        .lock()
        .iter()
        .filter(|name| *name == "error conn=true")
        .count();
    assert_eq!(errors, 2);
}

#[tokio::test]
async fn test_empty_and_unknown_commands_are_ignored() {
    let (_service, url, _serving) = start(settings()).await;
    let mut ws = connect(&url).await;

    send(&mut ws, json!({ "cmd": "join", "args": [] })).await;
    send(&mut ws, json!({ "cmd": "leave", "args": [] })).await;
    send(&mut ws, json!({ "cmd": "unknown", "args": { "x": 1 } })).await;
    assert_quiet(&mut ws).await;

    send(&mut ws, json!({ "cmd": "join", "args": ["topic"] })).await;
    assert_eq!(read(&mut ws).await, json!({ "topic": "@join", "payload": ["topic"] }));
}

#[tokio::test]
async fn test_custom_command() {
    let (service, url, _serving) = start(settings()).await;
    service.add_command(
        "ping",
        Arc::new(|ctx: &mut ConnContext, cmd: &Command| {
            let _ = ctx
                .upstream
                .try_send(Message::new("@pong", cmd.args().clone()));
        }),
    );

    let mut ws = connect(&url).await;
    send(&mut ws, json!({ "cmd": "ping", "args": { "x": 1 } })).await;
    assert_eq!(read(&mut ws).await, json!({ "topic": "@pong", "payload": { "x": 1 } }));
}

#[tokio::test]
async fn test_events_follow_connection_lifecycle() {
    let (service, url, _serving) = start(settings()).await;
    let events = record_events(&service);

    let mut ws = connect(&url).await;
    send(&mut ws, json!({ "cmd": "join", "args": ["a", "b"] })).await;
    read(&mut ws).await;
    send(&mut ws, json!({ "cmd": "leave", "args": ["a"] })).await;
    read(&mut ws).await;
    ws.close(None).await.unwrap();

    eventually("disconnect event", || {
        events.lock().last().map(String::as_str) == Some("disconnect")
    })
    .await;
    assert_eq!(
        *events.lock(),
        vec!["connect", "join a,b", "leave a", "disconnect"]
    );
    eventually("connection released", || service.pool().is_empty()).await;
}

#[tokio::test]
async fn test_disconnect_releases_subscriptions() {
    let (service, url, _serving) = start(settings()).await;
    let client = service.client();
    client.subscribe(&["shared".to_string()]).await.unwrap();

    let mut ws = connect(&url).await;
    send(&mut ws, json!({ "cmd": "join", "args": ["shared"] })).await;
    read(&mut ws).await;
    drop(ws);

    eventually("connection released", || service.pool().is_empty()).await;

    // the remaining subscriber still gets everything, nothing blocks on the dead socket
    for n in 0..5 {
        service.publish(&[Message::new("shared", n.to_string())]).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Message::new("shared", n.to_string()));
    }
}

#[tokio::test]
async fn test_failed_join_is_released_on_disconnect() {
    let (broker, remote) = redis_broker(None);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let url = format!("ws://{addr}{}", settings().path);
    let service = Arc::new(Service::with_broker(settings(), broker));
    let _serving = tokio::spawn(service.clone().serve(listener));

    remote.set_failing(true);
    let mut ws = connect(&url).await;
    send(&mut ws, json!({ "cmd": "join", "args": ["t"] })).await;
    assert_closed(&mut ws).await;
    eventually("connection released", || service.pool().is_empty()).await;
    remote.set_failing(false);

    // the dead connection no longer holds the topic, so Redis hears about it again
    let client = service.client();
    client.subscribe(&["t".to_string()]).await.unwrap();
    assert_eq!(remote.log(), vec!["SUBSCRIBE t".to_string()]);

    service.publish(&[Message::new("t", "1")]).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(1), client.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, Message::new("t", "1"));
}

#[tokio::test]
async fn test_wrong_path_is_rejected() {
    let (service, url, _serving) = start(settings()).await;
    let events = record_events(&service);

    let wrong = url.replace("/ws", "/other");
    assert!(connect_async(wrong.as_str()).await.is_err());
    eventually("handshake error event", || {
        events.lock().contains(&"error conn=false".to_string())
    })
    .await;
    assert!(service.pool().is_empty());
}

#[tokio::test]
async fn test_publish_async() {
    let (service, url, _serving) = start(settings()).await;
    let mut ws = connect(&url).await;
    send(&mut ws, json!({ "cmd": "join", "args": ["bg"] })).await;
    read(&mut ws).await;

    service
        .publish_async(vec![Message::new("bg", "true")])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read(&mut ws).await, json!({ "topic": "bg", "payload": true }));
}

#[tokio::test]
async fn test_stop_closes_connections() {
    let (service, url, serving) = start(settings()).await;
    let mut ws = connect(&url).await;
    send(&mut ws, json!({ "cmd": "join", "args": ["topic"] })).await;
    read(&mut ws).await;

    service.stop();
    tokio::time::timeout(Duration::from_secs(1), serving)
        .await
        .expect("serve did not return")
        .unwrap()
        .unwrap();
    assert_closed(&mut ws).await;
    assert!(service.publish(&[Message::new("topic", "1")]).await.is_err());
}

#[tokio::test]
async fn test_new_selects_backend() {
    let service = Service::new(settings()).await.expect("memory backend");
    assert_eq!(service.path(), "/ws");

    let mut redis = settings();
    redis.redis = Some(RedisSettings::new("127.0.0.1:1"));
    assert!(Service::new(redis).await.is_err());
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use wicket_dispatch::{handler_fn, Dispatcher, DispatcherConfig};
use wicket_gateway::{
    ConnId, Connection, ConnectionError, EventHandler, Gateway, GatewayConfig, GatewayError,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct Events {
    veto: AtomicBool,
    opened: Mutex<Vec<ConnId>>,
    disconnected: Mutex<Vec<ConnId>>,
    errors: Mutex<Vec<String>>,
}

impl EventHandler for Events {
    fn on_connect(&self, _id: ConnId, _remote: SocketAddr) -> Result<(), GatewayError> {
        if self.veto.load(Ordering::SeqCst) {
            return Err(GatewayError::Refused("not welcome".to_string()));
        }
        Ok(())
    }

    fn on_open(&self, conn: &Arc<Connection>) {
        self.opened.lock().push(conn.id());
    }

    fn on_text(&self, conn: &Arc<Connection>, text: String) {
        let _ = conn.write_text(text);
    }

    fn on_binary(&self, conn: &Arc<Connection>, data: Vec<u8>) {
        let _ = conn.write_binary(data);
    }

    fn on_error(&self, _conn: &Arc<Connection>, error: &ConnectionError) {
        self.errors.lock().push(error.to_string());
    }

    fn on_disconnect(&self, id: ConnId) {
        self.disconnected.lock().push(id);
    }
}

struct Harness {
    gateway: Gateway,
    events: Arc<Events>,
    addr: SocketAddr,
    server: JoinHandle<wicket_gateway::Result<()>>,
}

/// Clients in these tests do not always answer a close promptly
fn config() -> GatewayConfig {
    GatewayConfig {
        close_timeout_ms: 200,
        ..Default::default()
    }
}

async fn start(config: GatewayConfig) -> Harness {
    start_with(config, |gateway| gateway).await
}

async fn start_with(config: GatewayConfig, build: impl FnOnce(Gateway) -> Gateway) -> Harness {
    let events = Arc::new(Events::default());
    let gateway = build(
        Gateway::new(config)
            .unwrap()
            .with_handler_arc(events.clone()),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.serve(listener).await })
    };

    Harness {
        gateway,
        events,
        addr,
        server,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    connect_path(addr, "/").await.unwrap()
}

async fn connect_path(addr: SocketAddr, path: &str) -> Result<Client, WsError> {
    connect_async(format!("ws://{}{}", addr, path))
        .await
        .map(|(client, _)| client)
}

async fn recv(client: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("read failed")
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_echo_text_and_binary() {
    let h = start(config()).await;
    let mut client = connect(h.addr).await;

    let frames = vec![
        Message::Text("hello".into()),
        Message::Text(String::new()),
        Message::Text("héllo wörld".into()),
        Message::Binary(vec![0xff, 0xfe, 0x00, 0x80]),
        Message::Binary(Vec::new()),
    ];
    for frame in &frames {
        client.send(frame.clone()).await.unwrap();
    }
    for frame in frames {
        assert_eq!(recv(&mut client).await, frame);
    }

    assert_eq!(h.gateway.len(), 1);
    assert!(h.events.errors.lock().is_empty());
}

#[tokio::test]
async fn test_connection_ceiling_refuses_with_503() {
    let h = start(GatewayConfig {
        max_connections: 2,
        ..config()
    })
    .await;

    let _first = connect(h.addr).await;
    let _second = connect(h.addr).await;
    wait_until("two connections", || h.gateway.len() == 2).await;

    match connect_path(h.addr, "/").await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 503),
        other => panic!("expected 503, got {:?}", other.map(|_| ())),
    }
    assert_eq!(h.gateway.len(), 2);
    assert_eq!(h.events.opened.lock().len(), 2);
}

#[tokio::test]
async fn test_slot_is_released_on_disconnect() {
    let h = start(GatewayConfig {
        max_connections: 1,
        ..config()
    })
    .await;

    let mut first = connect(h.addr).await;
    wait_until("first connection", || h.gateway.len() == 1).await;
    first.close(None).await.unwrap();
    wait_until("first disconnect", || h.events.disconnected.lock().len() == 1).await;

    let mut second = connect(h.addr).await;
    second.send(Message::Text("again".into())).await.unwrap();
    assert_eq!(recv(&mut second).await, Message::Text("again".into()));
}

#[tokio::test]
async fn test_path_mismatch_is_404() {
    let h = start(GatewayConfig {
        path: Some("/ws".to_string()),
        ..config()
    })
    .await;

    match connect_path(h.addr, "/other").await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected 404, got {:?}", other.map(|_| ())),
    }
    assert!(connect_path(h.addr, "/ws").await.is_ok());
}

#[tokio::test]
async fn test_vetoed_connection_is_never_registered() {
    let h = start(config()).await;
    h.events.veto.store(true, Ordering::SeqCst);

    let mut client = connect(h.addr).await;
    match recv(&mut client).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected close, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.gateway.len(), 0);
    assert!(h.events.opened.lock().is_empty());
    assert!(h.events.disconnected.lock().is_empty());
}

#[tokio::test]
async fn test_push_and_kick_by_id() {
    let h = start(config()).await;
    let mut client = connect(h.addr).await;
    wait_until("registration", || h.events.opened.lock().len() == 1).await;
    let id = h.events.opened.lock()[0];

    assert!(h.gateway.send_text(id, "pushed"));
    assert!(h.gateway.send_binary(id, vec![1, 2, 3]));
    assert_eq!(recv(&mut client).await, Message::Text("pushed".into()));
    assert_eq!(recv(&mut client).await, Message::Binary(vec![1, 2, 3]));

    assert!(h.gateway.kick(id));
    assert!(!h.gateway.kick(id));
    assert!(matches!(recv(&mut client).await, Message::Close(_)));

    wait_until("disconnect", || h.events.disconnected.lock().len() == 1).await;
    assert_eq!(*h.events.disconnected.lock(), vec![id]);
    assert!(!h.gateway.registry().contains(id));
    assert!(!h.gateway.send_text(id, "gone"));
}

#[tokio::test]
async fn test_disconnect_fires_exactly_once() {
    let h = start(config()).await;
    let mut graceful = connect(h.addr).await;
    let abrupt = connect(h.addr).await;
    wait_until("two connections", || h.gateway.len() == 2).await;

    graceful.close(None).await.unwrap();
    drop(abrupt);

    wait_until("both disconnects", || h.events.disconnected.lock().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut disconnected = h.events.disconnected.lock().clone();
    disconnected.sort();
    disconnected.dedup();
    assert_eq!(disconnected.len(), 2);
    assert_eq!(h.events.disconnected.lock().len(), 2);
    assert!(h.gateway.is_empty());
}

#[tokio::test]
async fn test_broadcast_reaches_every_connection() {
    let h = start(config()).await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(h.addr).await);
    }
    wait_until("three connections", || h.gateway.len() == 3).await;

    assert_eq!(h.gateway.broadcast_text("news"), 3);
    for client in &mut clients {
        assert_eq!(recv(client).await, Message::Text("news".into()));
    }
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let h = start(config()).await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(h.addr).await);
    }
    wait_until("three connections", || h.gateway.len() == 3).await;

    assert_eq!(h.gateway.shutdown(), 3);
    assert_eq!(h.gateway.shutdown(), 0);

    for client in &mut clients {
        assert!(matches!(recv(client).await, Message::Close(_)));
    }
    tokio::time::timeout(Duration::from_secs(5), h.gateway.wait_closed())
        .await
        .expect("connections did not drain");

    assert!(h.gateway.is_empty());
    wait_until("three disconnects", || h.events.disconnected.lock().len() == 3).await;
    h.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_routed_mode_dispatches_to_handlers() {
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()).unwrap());
    dispatcher
        .handle(
            "upper",
            handler_fn(|msg: wicket_dispatch::Message| async move {
                let text: String = msg.payload_json().unwrap_or_default();
                let _ = msg.reply_text(text.to_uppercase());
            }),
        )
        .unwrap();
    dispatcher.start().unwrap();

    let h = start_with(config(), |gateway| {
        gateway.with_dispatcher(dispatcher.clone())
    })
    .await;
    let mut client = connect(h.addr).await;

    client
        .send(Message::Text(r#"{"name":"upper","payload":"abc"}"#.into()))
        .await
        .unwrap();
    assert_eq!(recv(&mut client).await, Message::Text("ABC".into()));

    // A bad frame is reported and the connection keeps working
    client.send(Message::Text("not json".into())).await.unwrap();
    client
        .send(Message::Binary(br#"{"name":"upper","payload":"def"}"#.to_vec()))
        .await
        .unwrap();
    assert_eq!(recv(&mut client).await, Message::Text("DEF".into()));
    assert_eq!(h.events.errors.lock().len(), 1);

    h.gateway.shutdown();
    h.gateway.wait_closed().await;
    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_plain_http_request_gets_400() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let h = start(config()).await;
    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("no response to plain GET")
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(
        response.starts_with("HTTP/1.1 400 "),
        "unexpected response: {:?}",
        response
    );
    assert!(h.gateway.is_empty());
    assert!(h.events.opened.lock().is_empty());

    // Real upgrades still go through
    let mut client = connect(h.addr).await;
    client.send(Message::Text("after".into())).await.unwrap();
    assert_eq!(recv(&mut client).await, Message::Text("after".into()));
}

#[tokio::test]
async fn test_kick_finishes_when_client_stops_reading() {
    let h = start(config()).await;
    let _client = connect(h.addr).await;
    wait_until("registration", || h.events.opened.lock().len() == 1).await;
    let id = h.events.opened.lock()[0];

    // Fills the socket buffers; the client never reads
    for _ in 0..64 {
        assert!(h.gateway.send_binary(id, vec![0u8; 1024 * 1024]));
    }
    wait_until("writer to stall", || {
        h.gateway
            .registry()
            .apply(id, |conn| conn.pending() > 0)
            .unwrap_or(false)
    })
    .await;

    assert!(h.gateway.kick(id));
    wait_until("disconnect", || h.events.disconnected.lock().len() == 1).await;
    assert!(!h.gateway.registry().contains(id));
}

#[tokio::test]
async fn test_shutdown_finishes_when_client_stops_reading() {
    let h = start(config()).await;
    let _client = connect(h.addr).await;
    wait_until("registration", || h.events.opened.lock().len() == 1).await;

    for _ in 0..64 {
        h.gateway.broadcast_binary(vec![0u8; 1024 * 1024]);
    }
    assert_eq!(h.gateway.shutdown(), 1);
    tokio::time::timeout(Duration::from_secs(5), h.gateway.wait_closed())
        .await
        .expect("connection did not drain");
    wait_until("disconnect", || h.events.disconnected.lock().len() == 1).await;
}

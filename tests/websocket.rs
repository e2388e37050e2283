#![cfg(feature = "ws")]
#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use ws_rpc_transport::error::Kind;
use ws_rpc_transport::rpc::{ErrorValue, RpcTransportConfig, Value, create_rpc_options};
use ws_rpc_transport::ws::config::{ChannelConfig, ReconnectConfig};
use ws_rpc_transport::ws::socket::WebSocketChannel;
use ws_rpc_transport::ws::{
    Channel as _,
    ChannelEvent, EventKind, EventSource as _, MessageSink as _, ReconnectionManager, Supervisor,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Control {
    /// Close every connection with 1001 "going away"
    CloseAll,
}

/// Mock WebSocket server that echoes every text message back.
struct MockWsServer {
    addr: SocketAddr,
    control_tx: broadcast::Sender<Control>,
    /// Receives every text message sent by clients
    received_rx: mpsc::UnboundedReceiver<String>,
    connections: Arc<AtomicUsize>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (control_tx, _) = broadcast::channel::<Control>(16);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<String>();
        let connections = Arc::new(AtomicUsize::new(0));

        let control = control_tx.clone();
        let accepted = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let received_tx = received_tx.clone();
                let mut control_rx = control.subscribe();

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(received_tx.send(text.to_string()));
                                        if write.send(Message::Text(text)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            cmd = control_rx.recv() => {
                                match cmd {
                                    Ok(Control::CloseAll) => {
                                        let frame = CloseFrame {
                                            code: CloseCode::Away,
                                            reason: "going away".into(),
                                        };
                                        drop(write.send(Message::Close(Some(frame))).await);
                                        break;
                                    }
                                    Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            control_tx,
            received_rx,
            connections,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/rpc", self.addr)
    }

    fn close_all(&self) {
        drop(self.control_tx.send(Control::CloseAll));
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    async fn recv(&mut self) -> Option<String> {
        timeout(WAIT, self.received_rx.recv()).await.ok().flatten()
    }
}

fn on_close(channel: &WebSocketChannel) -> oneshot::Receiver<ChannelEvent> {
    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    channel.on(
        EventKind::Close,
        Arc::new(move |event: &ChannelEvent| {
            if let Some(tx) = tx.lock().unwrap().take() {
                drop(tx.send(event.clone()));
            }
        }),
    );
    rx
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn ws_manager(url: String) -> ReconnectionManager<WebSocketChannel> {
    let config = ReconnectConfig::builder()
        .interval(Duration::from_millis(50))
        .timeout(Duration::from_secs(2))
        .build();
    ReconnectionManager::new(
        config,
        move || WebSocketChannel::connect(&url, ChannelConfig::default()),
        |_channel: &Arc<WebSocketChannel>| {},
    )
    .unwrap()
}

#[test]
fn non_websocket_scheme_is_rejected() {
    let error = WebSocketChannel::connect("http://127.0.0.1/rpc", ChannelConfig::default())
        .unwrap_err();

    assert_eq!(error.kind(), Kind::Validation);
}

#[test]
fn malformed_endpoint_is_rejected() {
    let error = WebSocketChannel::connect("not a url", ChannelConfig::default()).unwrap_err();

    assert_eq!(error.kind(), Kind::Validation);
}

#[tokio::test]
async fn serialized_payload_round_trips_through_server() {
    let mut server = MockWsServer::start().await;
    let manager = ws_manager(server.ws_url());
    let channel = timeout(WAIT, manager.initiate_connection())
        .await
        .unwrap()
        .unwrap();

    let options = create_rpc_options(RpcTransportConfig::for_channel(&channel));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    options.on(move |text| drop(reply_tx.send(text.to_owned())));

    let payload = Value::object_from([
        ("method", Value::from("ping")),
        (
            "error",
            ErrorValue::new("RangeError", "out of range")
                .with_field("code", 42_i64)
                .into(),
        ),
    ]);
    options.post(options.serialize(&payload).unwrap()).unwrap();

    let sent = server.recv().await.unwrap();
    let echoed = timeout(WAIT, reply_rx.recv()).await.unwrap().unwrap();
    assert_eq!(sent, echoed);

    let decoded = options.deserialize(&echoed).unwrap();
    assert_eq!(decoded.get("method").unwrap().as_str(), Some("ping"));
    let error = ErrorValue::from_encoded(&decoded.get("error").unwrap()).unwrap();
    assert_eq!(error.message, "out of range");
    assert_eq!(error.fields.get("code").unwrap().as_i64(), Some(42));

    channel.close();
}

#[tokio::test]
async fn server_close_emits_close_event() {
    let server = MockWsServer::start().await;
    let channel = WebSocketChannel::connect(&server.ws_url(), ChannelConfig::default()).unwrap();
    let closed = on_close(&channel);

    // Wait for the handshake before asking the server to close
    wait_until(|| server.connections() > 0).await;
    server.close_all();

    let event = timeout(WAIT, closed).await.unwrap().unwrap();
    assert_eq!(
        event,
        ChannelEvent::Close {
            code: Some(1001),
            reason: "going away".to_owned(),
        }
    );
    assert!(channel.is_closed());
    assert!(channel.send("late".to_owned()).is_err());
}

#[tokio::test]
async fn unreachable_endpoint_emits_error_then_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let channel =
        WebSocketChannel::connect(&format!("ws://{addr}"), ChannelConfig::default()).unwrap();
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    channel.on(
        EventKind::Error,
        Arc::new(move |_: &ChannelEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let closed = on_close(&channel);

    let event = timeout(WAIT, closed).await.unwrap().unwrap();

    assert!(matches!(event, ChannelEvent::Close { .. }));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(!channel.is_open());
}

#[tokio::test]
async fn supervisor_reconnects_after_server_close() {
    let mut server = MockWsServer::start().await;
    let supervisor = Supervisor::new(ws_manager(server.ws_url()));
    let mut current = supervisor.channel_receiver();

    let first = timeout(WAIT, supervisor.start()).await.unwrap().unwrap();
    server.close_all();

    let second = timeout(WAIT, async {
        loop {
            current.changed().await.unwrap();
            let channel = current.borrow_and_update().clone();
            if let Some(channel) = channel {
                if !Arc::ptr_eq(&channel, &first) {
                    return channel;
                }
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(server.connections(), 2);
    second.send("again".to_owned()).unwrap();
    assert_eq!(server.recv().await.as_deref(), Some("again"));

    supervisor.shutdown();
}

#[tokio::test]
async fn heartbeat_keeps_healthy_connection_open() {
    let server = MockWsServer::start().await;
    let config = ChannelConfig::builder()
        .heartbeat_interval(Duration::from_millis(20))
        .heartbeat_timeout(Duration::from_millis(500))
        .build();
    let channel = WebSocketChannel::connect(&server.ws_url(), config).unwrap();

    wait_until(|| channel.is_open()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(channel.is_open());
    assert!(!channel.is_closed());
}

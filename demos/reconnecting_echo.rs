//! Reconnecting RPC transport against a flaky local echo server.
//!
//! The server echoes every message and drops each connection after three of them.
//! The supervisor notices the close, waits for the retry interval and connects again;
//! every new channel gets fresh RPC options.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,ws_rpc_transport=debug cargo run --example reconnecting_echo --features ws,tracing
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ws_rpc_transport::rpc::{ErrorValue, RpcTransportConfig, Value, create_rpc_options};
use ws_rpc_transport::ws::config::{ChannelConfig, ReconnectConfig};
use ws_rpc_transport::ws::socket::WebSocketChannel;
use ws_rpc_transport::ws::{ReconnectionManager, Supervisor};

const MESSAGES_PER_CONNECTION: usize = 3;
const CONNECTIONS: usize = 3;

async fn flaky_echo_server() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(mut ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            tokio::spawn(async move {
                let mut echoed = 0;
                while let Some(Ok(message)) = ws_stream.next().await {
                    if !message.is_text() {
                        continue;
                    }
                    if ws_stream.send(message).await.is_err() {
                        return;
                    }
                    echoed += 1;
                    if echoed == MESSAGES_PER_CONNECTION {
                        drop(ws_stream.close(None).await);
                        return;
                    }
                }
            });
        }
    });

    Ok(addr)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr = flaky_echo_server().await?;
    let endpoint = format!("ws://{addr}/rpc");
    info!(%endpoint, "echo server listening");

    let config = ReconnectConfig::builder()
        .interval(Duration::from_millis(250))
        .backoff_multiplier(2.0)
        .max_interval(Duration::from_secs(2))
        .timeout(Duration::from_secs(2))
        .build();
    let channel_config = ChannelConfig::builder()
        .heartbeat_interval(Duration::from_secs(5))
        .build();

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let manager = ReconnectionManager::new(
        config,
        move || WebSocketChannel::connect(&endpoint, channel_config.clone()),
        |channel: &Arc<WebSocketChannel>| info!(endpoint = %channel.endpoint(), "channel created"),
    )?;
    let supervisor = Supervisor::new(manager);
    let mut current = supervisor.channel_receiver();
    supervisor.start().await?;

    for connection in 1..=CONNECTIONS {
        let channel = loop {
            if let Some(channel) = current.borrow_and_update().clone() {
                break channel;
            }
            current.changed().await?;
        };
        info!(connection, state = ?supervisor.manager().state(), "connected");

        let options = create_rpc_options(RpcTransportConfig::for_channel(&channel));
        let replies = reply_tx.clone();
        options.on(move |text| drop(replies.send(text.to_owned())));

        for seq in 0..MESSAGES_PER_CONNECTION {
            let request = Value::object_from([
                ("connection", Value::from(connection as u64)),
                ("seq", Value::from(seq as u64)),
                (
                    "error",
                    ErrorValue::new("DemoError", "not really an error")
                        .with_field("code", 42_i64)
                        .into(),
                ),
            ]);
            options.post(options.serialize(&request)?)?;

            match timeout(Duration::from_secs(2), reply_rx.recv()).await {
                Ok(Some(text)) => {
                    let reply = options.deserialize(&text)?;
                    info!(reply = %reply.to_json()?, "echo");
                }
                _ => warn!(connection, seq, "no reply"),
            }
        }

        // The server drops the connection now; wait for the supervisor to notice
        while current.borrow().is_some() {
            current.changed().await?;
        }
        info!(
            attempts_remaining = supervisor.manager().attempts_remaining(),
            "connection lost"
        );
    }

    supervisor.shutdown();
    if let Some(channel) = supervisor.channel() {
        channel.close();
    }
    Ok(())
}

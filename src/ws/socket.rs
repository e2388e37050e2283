//! WebSocket [`Channel`] backed by `tokio-tungstenite`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::ChannelConfig;
use super::error::WsError;
use super::traits::{Channel, ChannelEvent, EventKind, EventSource, Handler, Listeners, MessageSink};
use crate::Result;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const NORMAL_CLOSURE: u16 = 1000;
const ABNORMAL_CLOSURE: u16 = 1006;

/// A WebSocket connection adapted to [`Channel`].
///
/// [`WebSocketChannel::connect`] returns immediately; the handshake runs in a
/// background task which emits `open` once it completes. Outgoing messages sent before
/// that are queued and flushed after the handshake. Failures emit `error` followed by
/// `close`; a failed channel never reopens.
///
/// With a heartbeat interval configured, a PING frame is sent periodically and the
/// connection is dropped when no PONG arrives within the heartbeat timeout. The check
/// runs on heartbeat ticks, so detection may take up to one extra interval.
pub struct WebSocketChannel {
    endpoint: Url,
    open: AtomicBool,
    closed: AtomicBool,
    listeners: Listeners,
    sender_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl WebSocketChannel {
    /// Start connecting to `endpoint`, a `ws://` or `wss://` URL.
    pub fn connect(endpoint: &str, config: ChannelConfig) -> Result<Arc<Self>> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported WebSocket scheme: {}",
                endpoint.scheme()
            )));
        }

        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let channel = Arc::new(Self {
            endpoint: endpoint.clone(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            listeners: Listeners::new(),
            sender_tx,
            cancel: cancel.clone(),
        });

        tokio::spawn(Self::connection_task(
            Arc::downgrade(&channel),
            endpoint,
            config,
            sender_rx,
            cancel,
        ));

        Ok(channel)
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Close the connection. Emits `close` once the socket task has stopped.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connection_task(
        channel: Weak<Self>,
        endpoint: Url,
        config: ChannelConfig,
        mut sender_rx: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        let connected = tokio::select! {
            () = cancel.cancelled() => {
                Self::finish(&channel, Some(NORMAL_CLOSURE), "closed before open");
                return;
            }
            result = connect_async(endpoint.as_str()) => result,
        };

        let ws_stream = match connected {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%endpoint, error = %e, "Unable to connect");
                let reason = e.to_string();
                Self::emit(&channel, &ChannelEvent::Error(reason.clone()));
                Self::finish(&channel, Some(ABNORMAL_CLOSURE), &reason);
                return;
            }
        };

        if let Some(channel) = channel.upgrade() {
            channel.open.store(true, Ordering::SeqCst);
            channel.listeners.emit(&ChannelEvent::Open);
        }

        let (code, reason) =
            Self::handle_connection(&channel, ws_stream, &config, &mut sender_rx, &cancel).await;

        #[cfg(feature = "tracing")]
        tracing::debug!(%endpoint, ?code, %reason, "WebSocket channel closed");

        Self::finish(&channel, code, &reason);
    }

    /// Pump frames until the connection ends; returns the close code and reason.
    async fn handle_connection(
        channel: &Weak<Self>,
        ws_stream: WsStream,
        config: &ChannelConfig,
        sender_rx: &mut mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> (Option<u16>, String) {
        let (mut write, mut read) = ws_stream.split();

        let mut heartbeat = config.heartbeat_interval.map(|period| {
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks
        });
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    _ = write.send(Message::Close(None)).await;
                    return (Some(NORMAL_CLOSURE), "closed by client".to_owned());
                }

                // Handle incoming messages
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(text = %text.as_str(), "Received WebSocket text message");
                            Self::emit(channel, &ChannelEvent::Message(text.as_str().to_owned()));
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            // RPC payloads are text; binary frames are accepted when they are UTF-8
                            if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                                Self::emit(channel, &ChannelEvent::Message(text));
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            awaiting_pong = None;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return frame.map_or((None, String::new()), |frame| {
                                (Some(u16::from(frame.code)), frame.reason.as_str().to_owned())
                            });
                        }
                        Some(Ok(_)) => {
                            // PING replies are sent by tungstenite itself
                        }
                        Some(Err(e)) => {
                            let reason = e.to_string();
                            Self::emit(channel, &ChannelEvent::Error(reason.clone()));
                            return (Some(ABNORMAL_CLOSURE), reason);
                        }
                        None => return (Some(ABNORMAL_CLOSURE), "connection reset".to_owned()),
                    }
                }

                // Handle outgoing messages
                outgoing = sender_rx.recv() => {
                    let Some(text) = outgoing else {
                        // Every handle to the channel is gone
                        _ = write.send(Message::Close(None)).await;
                        return (Some(NORMAL_CLOSURE), "channel dropped".to_owned());
                    };
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        let reason = e.to_string();
                        Self::emit(channel, &ChannelEvent::Error(reason.clone()));
                        return (Some(ABNORMAL_CLOSURE), reason);
                    }
                }

                () = next_heartbeat(heartbeat.as_mut()) => {
                    if let Some(sent) = awaiting_pong {
                        if sent.elapsed() >= config.heartbeat_timeout {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(
                                "Heartbeat timeout: no PONG received within {:?}",
                                config.heartbeat_timeout
                            );
                            let reason = "heartbeat timeout".to_owned();
                            Self::emit(channel, &ChannelEvent::Error(reason.clone()));
                            return (Some(ABNORMAL_CLOSURE), reason);
                        }
                    } else if write.send(Message::Ping(Vec::new().into())).await.is_ok() {
                        awaiting_pong = Some(Instant::now());
                    }
                }
            }
        }
    }

    fn emit(channel: &Weak<Self>, event: &ChannelEvent) {
        if let Some(channel) = channel.upgrade() {
            channel.listeners.emit(event);
        }
    }

    fn finish(channel: &Weak<Self>, code: Option<u16>, reason: &str) {
        let Some(channel) = channel.upgrade() else {
            return;
        };
        channel.open.store(false, Ordering::SeqCst);
        if !channel.closed.swap(true, Ordering::SeqCst) {
            channel.listeners.emit(&ChannelEvent::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }
}

async fn next_heartbeat(heartbeat: Option<&mut Interval>) {
    match heartbeat {
        Some(ticks) => {
            ticks.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl MessageSink for WebSocketChannel {
    fn send(&self, message: String) -> Result<()> {
        if self.is_closed() {
            return Err(WsError::ConnectionClosed.into());
        }
        self.sender_tx
            .send(message)
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }
}

impl EventSource for WebSocketChannel {
    fn on(&self, kind: EventKind, handler: Handler) {
        self.listeners.add(kind, handler);
    }
}

impl Channel for WebSocketChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for WebSocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketChannel")
            .field("endpoint", &self.endpoint.as_str())
            .field("open", &self.is_open())
            .field("closed", &self.is_closed())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

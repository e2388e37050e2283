use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use super::codec;
use super::value::Value;
use crate::Result;
use crate::serde_helpers::{TimeoutMillis, UNBOUNDED_TIMEOUT_MILLIS};
use crate::ws::traits::{Channel, ChannelEvent, EventKind, EventSource, MessageSink};

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a single RPC call waits for its response.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTimeout {
    Bounded(Duration),
    /// Wait forever; `-1` on the wire
    Unbounded,
}

impl RpcTimeout {
    /// Milliseconds as the RPC engine expects them, `-1` for [`RpcTimeout::Unbounded`].
    #[must_use]
    pub fn as_millis(self) -> i64 {
        match self {
            Self::Bounded(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
            Self::Unbounded => UNBOUNDED_TIMEOUT_MILLIS,
        }
    }

    #[must_use]
    pub const fn as_duration(self) -> Option<Duration> {
        match self {
            Self::Bounded(duration) => Some(duration),
            Self::Unbounded => None,
        }
    }
}

impl Default for RpcTimeout {
    fn default() -> Self {
        Self::Bounded(DEFAULT_RPC_TIMEOUT)
    }
}

/// How to wire a channel to an RPC engine.
///
/// # Example
///
/// ```ignore
/// let config = RpcTransportConfig::builder()
///     .sender(sink)
///     .receiver(events)
///     .event_names(vec!["onCollected".to_owned(), "onFinished".to_owned()])
///     .timeout(RpcTimeout::Unbounded)
///     .build();
/// ```
#[non_exhaustive]
#[derive(Clone, Builder)]
pub struct RpcTransportConfig {
    /// Send capability of the channel
    pub sender: Arc<dyn MessageSink>,
    /// Event registration capability of the channel
    pub receiver: Arc<dyn EventSource>,
    /// Event names the RPC engine broadcasts; order is kept as given
    pub event_names: Option<Vec<String>>,
    /// Per-call response timeout
    #[builder(default)]
    pub timeout: RpcTimeout,
}

impl RpcTransportConfig {
    /// Use both halves of `channel`, with no event names and the default timeout.
    #[must_use]
    pub fn for_channel<C: Channel>(channel: &Arc<C>) -> Self {
        let sender: Arc<dyn MessageSink> = Arc::<C>::clone(channel);
        let receiver: Arc<dyn EventSource> = Arc::<C>::clone(channel);
        Self {
            sender,
            receiver,
            event_names: None,
            timeout: RpcTimeout::default(),
        }
    }
}

impl fmt::Debug for RpcTransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcTransportConfig")
            .field("event_names", &self.event_names)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Settings passed through to the RPC engine.
///
/// `eventNames` is omitted entirely when absent: an engine may treat a missing key
/// differently from an empty list.
#[serde_as]
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcSettings {
    #[serde_as(as = "TimeoutMillis")]
    pub timeout: RpcTimeout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_names: Option<Vec<String>>,
}

type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything an RPC engine needs to run over one channel.
///
/// Clones share the message handler set with [`RpcOptions::on`].
#[derive(Clone)]
pub struct RpcOptions {
    sender: Arc<dyn MessageSink>,
    receiver: Arc<dyn EventSource>,
    settings: RpcSettings,
    handler: Arc<Mutex<Option<MessageHandler>>>,
}

impl RpcOptions {
    /// Forward an already-serialized message to the channel. No buffering.
    pub fn post(&self, message: String) -> Result<()> {
        self.sender.send(message)
    }

    /// Set `handler` as the receiver of the channel's `message` events.
    ///
    /// Options hold a single handler: a later call replaces the earlier one, and each
    /// message reaches only the latest. Channels are replaced on reconnect, so options
    /// are rebuilt and `on` called again for every new channel.
    pub fn on<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let previous = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::new(handler));
        if previous.is_some() {
            // Already listening on the channel
            return;
        }

        let slot = Arc::clone(&self.handler);
        self.receiver.on(
            EventKind::Message,
            Arc::new(move |event: &ChannelEvent| {
                if let ChannelEvent::Message(text) = event {
                    let handler = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
                    if let Some(handler) = handler {
                        handler(text);
                    }
                }
            }),
        );
    }

    pub fn serialize(&self, data: &Value) -> Result<String> {
        codec::serialize(data)
    }

    pub fn deserialize(&self, text: &str) -> Result<Value> {
        codec::deserialize(text)
    }

    #[must_use]
    pub fn timeout(&self) -> RpcTimeout {
        self.settings.timeout
    }

    #[must_use]
    pub fn event_names(&self) -> Option<&[String]> {
        self.settings.event_names.as_deref()
    }

    #[must_use]
    pub fn settings(&self) -> &RpcSettings {
        &self.settings
    }
}

impl fmt::Debug for RpcOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcOptions")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Build the option block for an RPC engine from `config`.
#[must_use]
pub fn create_rpc_options(config: RpcTransportConfig) -> RpcOptions {
    RpcOptions {
        sender: config.sender,
        receiver: config.receiver,
        settings: RpcSettings {
            timeout: config.timeout,
            event_names: config.event_names,
        },
        handler: Arc::default(),
    }
}

//! Core traits for message channels.
//!
//! A channel is anything that can send text messages and report events through
//! registered handlers. Implementations adapt a concrete socket to [`Channel`] once,
//! so neither the reconnection manager nor the RPC options probe for capabilities.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::Result;

/// Callback invoked for every event of the kind it was registered for.
pub type Handler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Event names a handler can be registered for.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Open,
    Message,
    Close,
    Error,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is ready to send and receive
    Open,
    /// An incoming text message
    Message(String),
    /// The channel was closed by either side
    Close {
        /// Close code, when the transport provides one
        code: Option<u16>,
        /// Close reason, possibly empty
        reason: String,
    },
    /// A transport error; usually followed by [`ChannelEvent::Close`]
    Error(String),
}

impl ChannelEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Message(_) => EventKind::Message,
            Self::Close { .. } => EventKind::Close,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// Send half of a channel.
pub trait MessageSink: Send + Sync + 'static {
    /// Forward an already-serialized message. Flow control belongs to the channel.
    fn send(&self, message: String) -> Result<()>;
}

/// Event half of a channel.
pub trait EventSource: Send + Sync + 'static {
    /// Register `handler` for every future event of `kind`.
    fn on(&self, kind: EventKind, handler: Handler);
}

/// A bidirectional message channel.
pub trait Channel: MessageSink + EventSource {
    /// Whether the channel is open right now.
    ///
    /// Checked right after creation so that a channel which is already open never
    /// waits for an [`EventKind::Open`] event that has already been emitted.
    fn is_open(&self) -> bool;
}

/// Handler registry for [`EventSource`] implementations.
///
/// Handlers are cloned out of the registry before being invoked, so a handler may
/// register further handlers without deadlocking.
#[derive(Default)]
pub struct Listeners {
    handlers: DashMap<EventKind, Vec<Handler>>,
}

impl Listeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: EventKind, handler: Handler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Invoke every handler registered for the event's kind, in registration order.
    pub fn emit(&self, event: &ChannelEvent) {
        let handlers = self
            .handlers
            .get(&event.kind())
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        for handler in handlers {
            handler(event);
        }
    }

    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, |entry| entry.len())
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("open", &self.count(EventKind::Open))
            .field("message", &self.count(EventKind::Message))
            .field("close", &self.count(EventKind::Close))
            .field("error", &self.count(EventKind::Error))
            .finish()
    }
}

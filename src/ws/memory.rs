//! In-process channel.
//!
//! [`MemoryChannel`]s come in linked pairs: a message sent on one side is delivered
//! synchronously as a `message` event on the other. Opening and closing are driven
//! explicitly, which makes the type suitable for same-process links and for testing
//! the connection lifecycle without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use super::error::WsError;
use super::traits::{Channel, ChannelEvent, EventKind, EventSource, Handler, Listeners, MessageSink};
use crate::Result;

#[derive(Debug, Default)]
pub struct MemoryChannel {
    open: AtomicBool,
    closed: AtomicBool,
    listeners: Listeners,
    peer: OnceLock<Weak<MemoryChannel>>,
}

impl MemoryChannel {
    /// A channel with no peer. It opens only when [`MemoryChannel::open`] is called,
    /// and sends fail even then.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Two linked channels, neither open yet.
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let left = Self::new();
        let right = Self::new();
        _ = left.peer.set(Arc::downgrade(&right));
        _ = right.peer.set(Arc::downgrade(&left));
        (left, right)
    }

    /// Two linked channels that are open from the start.
    #[must_use]
    pub fn open_pair() -> (Arc<Self>, Arc<Self>) {
        let (left, right) = Self::pair();
        left.open.store(true, Ordering::SeqCst);
        right.open.store(true, Ordering::SeqCst);
        (left, right)
    }

    /// Mark this side open and emit `open`. No-op once open or closed.
    pub fn open(&self) {
        if self.closed.load(Ordering::SeqCst) || self.open.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listeners.emit(&ChannelEvent::Open);
    }

    /// Close this side and its peer, emitting `close` on each. Idempotent.
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        self.listeners.emit(&ChannelEvent::Close {
            code: Some(code),
            reason: reason.to_owned(),
        });

        if let Some(peer) = self.peer() {
            peer.close(code, reason);
        }
    }

    /// Emit `error` with `message`, leaving the channel state unchanged.
    pub fn fail(&self, message: &str) {
        self.listeners.emit(&ChannelEvent::Error(message.to_owned()));
    }

    /// Emit an incoming `message` on this side, as if the peer had sent it.
    pub fn deliver(&self, message: String) {
        self.listeners.emit(&ChannelEvent::Message(message));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.count(kind)
    }

    fn peer(&self) -> Option<Arc<Self>> {
        self.peer.get().and_then(Weak::upgrade)
    }
}

impl MessageSink for MemoryChannel {
    fn send(&self, message: String) -> Result<()> {
        if !self.is_open() {
            return Err(WsError::ConnectionClosed.into());
        }
        let peer = self.peer().ok_or(WsError::ConnectionClosed)?;
        peer.deliver(message);
        Ok(())
    }
}

impl EventSource for MemoryChannel {
    fn on(&self, kind: EventKind, handler: Handler) {
        self.listeners.add(kind, handler);
    }
}

impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Kind;

    fn record(channel: &MemoryChannel) -> Arc<Mutex<Vec<ChannelEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            EventKind::Open,
            EventKind::Message,
            EventKind::Close,
            EventKind::Error,
        ] {
            let events = Arc::clone(&events);
            channel.on(
                kind,
                Arc::new(move |event: &ChannelEvent| events.lock().unwrap().push(event.clone())),
            );
        }
        events
    }

    #[test]
    fn send_delivers_to_peer() {
        let (left, right) = MemoryChannel::open_pair();
        let events = record(&right);

        left.send("hello".to_owned()).unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![ChannelEvent::Message("hello".to_owned())]
        );
    }

    #[test]
    fn send_before_open_fails() {
        let (left, _right) = MemoryChannel::pair();

        let error = left.send("early".to_owned()).unwrap_err();

        assert_eq!(error.kind(), Kind::Connection);
    }

    #[test]
    fn send_without_peer_fails() {
        let channel = MemoryChannel::new();
        channel.open();

        assert!(channel.send("nobody".to_owned()).is_err());
    }

    #[test]
    fn open_emits_once() {
        let (left, _right) = MemoryChannel::pair();
        let events = record(&left);

        left.open();
        left.open();

        assert!(left.is_open());
        assert_eq!(*events.lock().unwrap(), vec![ChannelEvent::Open]);
    }

    #[test]
    fn close_propagates_to_peer_once() {
        let (left, right) = MemoryChannel::open_pair();
        let left_events = record(&left);
        let right_events = record(&right);

        left.close(1001, "going away");
        right.close(1000, "again");

        let expected = vec![ChannelEvent::Close {
            code: Some(1001),
            reason: "going away".to_owned(),
        }];
        assert_eq!(*left_events.lock().unwrap(), expected);
        assert_eq!(*right_events.lock().unwrap(), expected);
        assert!(!left.is_open());
        assert!(right.is_closed());
    }

    #[test]
    fn closed_channel_does_not_reopen() {
        let channel = MemoryChannel::new();
        channel.close(1000, "");

        channel.open();

        assert!(!channel.is_open());
    }
}

#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use ws_rpc_transport::Result;
use ws_rpc_transport::ws::config::ReconnectConfig;
use ws_rpc_transport::ws::memory::MemoryChannel;
use ws_rpc_transport::ws::{ChannelEvent, EventKind, EventSource as _, ReconnectionManager, WsError};

/// The scenario from the reconnect policy docs: short retries, short connect timeout.
#[must_use]
pub fn fast_config() -> ReconnectConfig {
    ReconnectConfig::builder()
        .interval(Duration::from_millis(100))
        .max_attempts(3)
        .timeout(Duration::from_millis(50))
        .build()
}

/// How the next channels produced by a [`ChannelFactory`] behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Channels are created closed and open only when the test says so
    Pending,
    /// Channels are already open when returned
    Open,
    /// The factory returns an error
    Fail,
}

/// Channel factory that keeps every channel it creates, along with its peer.
#[derive(Debug, Clone)]
pub struct ChannelFactory {
    mode: Arc<Mutex<Mode>>,
    created: Arc<Mutex<Vec<(Arc<MemoryChannel>, Arc<MemoryChannel>)>>>,
    calls: Arc<AtomicUsize>,
}

impl ChannelFactory {
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            mode: Arc::new(Mutex::new(mode)),
            created: Arc::default(),
            calls: Arc::default(),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn create(&self) -> Result<Arc<MemoryChannel>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = match *self.mode.lock().unwrap() {
            Mode::Pending => MemoryChannel::pair(),
            Mode::Open => MemoryChannel::open_pair(),
            Mode::Fail => return Err(WsError::ConnectionClosed.into()),
        };
        self.created
            .lock()
            .unwrap()
            .push((Arc::clone(&local), remote));
        Ok(local)
    }

    /// Number of times the factory was called, failures included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recently created channel.
    #[must_use]
    pub fn latest(&self) -> Arc<MemoryChannel> {
        let created = self.created.lock().unwrap();
        Arc::clone(&created.last().unwrap().0)
    }

    /// The far side of the most recently created channel.
    #[must_use]
    pub fn latest_peer(&self) -> Arc<MemoryChannel> {
        let created = self.created.lock().unwrap();
        Arc::clone(&created.last().unwrap().1)
    }
}

/// Build a manager over `factory`; the returned counter tracks handler registrations.
pub fn manager(
    config: ReconnectConfig,
    factory: &ChannelFactory,
) -> (ReconnectionManager<MemoryChannel>, Arc<AtomicUsize>) {
    let registrations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&registrations);
    let factory = factory.clone();
    let manager = ReconnectionManager::new(
        config,
        move || factory.create(),
        move |_channel: &Arc<MemoryChannel>| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();
    (manager, registrations)
}

/// Forward every incoming message on `channel` to the returned receiver.
pub fn messages(channel: &MemoryChannel) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.on(
        EventKind::Message,
        Arc::new(move |event: &ChannelEvent| {
            if let ChannelEvent::Message(text) = event {
                drop(tx.send(text.clone()));
            }
        }),
    );
    rx
}

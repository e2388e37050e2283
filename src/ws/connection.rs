#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::config::ReconnectConfig;
use super::error::WsError;
use super::traits::{Channel, ChannelEvent, EventKind};
use crate::Result;
use crate::error::Error;

type SocketFactory<C> = Box<dyn Fn() -> Result<Arc<C>> + Send + Sync>;
type HandlerRegistration<C> = Box<dyn Fn(&Arc<C>) + Send + Sync>;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No attempt made yet
    Idle,
    /// Waiting for a freshly created channel to open
    Connecting {
        /// Sequence number of the attempt, starting at 1
        attempt: u64,
    },
    /// The latest channel is open
    Open {
        /// When the channel opened
        since: Instant,
    },
    /// The connection was lost or an attempt failed
    Disconnected {
        /// Retries left before the manager gives up
        attempts_remaining: u32,
    },
    /// Every retry was used; disconnects are ignored until [`ReconnectionManager::reset`]
    Exhausted,
    /// [`ReconnectionManager::cleanup`] was called
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// What [`ReconnectionManager::handle_disconnect`] did with a disconnect.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// A retry is pending, replacing any earlier one
    Scheduled {
        /// Retry number since the last successful open, starting at 1
        attempt: u32,
        /// Delay before the retry callback runs
        delay: Duration,
    },
    /// Reconnection is disabled by configuration
    Disabled,
    /// No attempts remain
    Exhausted,
}

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Attempts {
    remaining: u32,
    backoff: ExponentialBackoff,
    timer: Option<PendingTimer>,
    timer_generation: u64,
    sequence: u64,
}

struct Inner<C> {
    config: ReconnectConfig,
    create_socket: SocketFactory<C>,
    register_handlers: HandlerRegistration<C>,
    attempts: Mutex<Attempts>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Owns the lifecycle of one logical connection.
///
/// The manager creates channels through the caller's factory, races each one against
/// the connection timeout, and counts retries. It never closes channels: a superseded
/// channel is simply dropped, and closing it is up to the caller.
///
/// Handles are cheap to clone and share the same state. All methods that start work
/// in the background must be called from within a Tokio runtime.
///
/// # Example
///
/// ```ignore
/// let manager = ReconnectionManager::new(
///     ReconnectConfig::default(),
///     || WebSocketChannel::connect("wss://example.com/rpc", ChannelConfig::default()),
///     |channel: &Arc<WebSocketChannel>| {
///         channel.on(EventKind::Message, Arc::new(|event: &ChannelEvent| { /* ... */ }));
///     },
/// )?;
///
/// let channel = manager.initiate_connection().await?;
/// ```
pub struct ReconnectionManager<C: Channel> {
    inner: Arc<Inner<C>>,
}

impl<C: Channel> Clone for ReconnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Channel> fmt::Debug for ReconnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectionManager")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .field("attempts_remaining", &self.attempts_remaining())
            .finish_non_exhaustive()
    }
}

impl<C: Channel> ReconnectionManager<C> {
    /// Create a manager for one logical connection.
    ///
    /// `create_socket` is called once per attempt. `register_handlers` runs right after
    /// each new channel is created, so it sees every channel exactly once.
    pub fn new<F, R>(config: ReconnectConfig, create_socket: F, register_handlers: R) -> Result<Self>
    where
        F: Fn() -> Result<Arc<C>> + Send + Sync + 'static,
        R: Fn(&Arc<C>) + Send + Sync + 'static,
    {
        config.validate()?;

        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let attempts = Attempts {
            remaining: config.max_attempts,
            backoff: config.clone().into(),
            timer: None,
            timer_generation: 0,
            sequence: 0,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                create_socket: Box::new(create_socket),
                register_handlers: Box::new(register_handlers),
                attempts: Mutex::new(attempts),
                state_tx,
            }),
        })
    }

    /// Start a connection attempt.
    ///
    /// Creates a channel, registers the caller's handlers on it and resolves once the
    /// channel opens, or fails with a [`Kind::Timeout`](crate::error::Kind::Timeout)
    /// error after the configured timeout. A timeout does not schedule a retry.
    ///
    /// The attempt runs in the background: it makes progress, and updates the
    /// manager, even if the returned future is dropped.
    pub fn initiate_connection(&self) -> ConnectionAttempt<C> {
        self.initiate_connection_with(|_channel| {})
    }

    /// [`initiate_connection`](Self::initiate_connection), running `watch` on the new
    /// channel before any handler is registered or the open state is checked.
    pub(crate) fn initiate_connection_with<W>(&self, watch: W) -> ConnectionAttempt<C>
    where
        W: FnOnce(&Arc<C>),
    {
        let attempt = {
            let mut attempts = self.lock();
            attempts.sequence = attempts.sequence.wrapping_add(1);
            attempts.sequence
        };
        self.set_state(ConnectionState::Connecting { attempt });

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, "initiating connection");

        let channel = match (self.inner.create_socket)() {
            Ok(channel) => channel,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, error = %e, "unable to create channel");
                self.attempt_failed(attempt);
                return ConnectionAttempt {
                    attempt,
                    channel: None,
                    outcome: Outcome::Failed(Some(e)),
                };
            }
        };

        watch(&channel);

        let (open_tx, open_rx) = oneshot::channel();
        let open_tx = Arc::new(Mutex::new(Some(open_tx)));
        let signal = {
            let open_tx = Arc::clone(&open_tx);
            move || {
                if let Some(tx) = open_tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    _ = tx.send(());
                }
            }
        };
        let on_open = signal.clone();
        channel.on(
            EventKind::Open,
            Arc::new(move |_event: &ChannelEvent| on_open()),
        );

        (self.inner.register_handlers)(&channel);

        // The open event may already have been emitted before our listener existed
        if channel.is_open() {
            signal();
        }

        let manager = self.clone();
        let limit = self.inner.config.timeout;
        let opened = Arc::clone(&channel);
        let handle = tokio::spawn(async move {
            match timeout(limit, open_rx).await {
                Ok(Ok(())) => {
                    manager.attempt_opened(attempt);
                    Ok(opened)
                }
                Ok(Err(_)) => {
                    manager.attempt_failed(attempt);
                    Err(WsError::ConnectionClosed.into())
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(attempt, timeout = ?limit, "connection attempt timed out");
                    manager.attempt_failed(attempt);
                    Err(WsError::Timeout { after: limit }.into())
                }
            }
        });

        ConnectionAttempt {
            attempt,
            channel: Some(channel),
            outcome: Outcome::Pending(handle),
        }
    }

    /// React to a lost connection.
    ///
    /// Unless reconnection is disabled or no attempts remain, uses up one attempt and
    /// schedules `on_reconnect` after the retry delay. A pending retry is cancelled and
    /// replaced, so a burst of disconnects yields a single retry. `on_reconnect` is
    /// expected to call [`ReconnectionManager::initiate_connection`].
    pub fn handle_disconnect<F, Fut>(&self, on_reconnect: F) -> DisconnectOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.inner.config.enabled {
            return DisconnectOutcome::Disabled;
        }

        let mut attempts = self.lock();
        if attempts.remaining == 0 {
            drop(attempts);
            if self.set_state(ConnectionState::Exhausted) {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    max_attempts = self.inner.config.max_attempts,
                    "reconnection attempts exhausted, giving up"
                );
            }
            return DisconnectOutcome::Exhausted;
        }

        attempts.remaining -= 1;
        let remaining = attempts.remaining;
        let attempt = self.inner.config.max_attempts.saturating_sub(remaining);
        let delay = attempts
            .backoff
            .next_backoff()
            .unwrap_or(self.inner.config.interval);

        if let Some(previous) = attempts.timer.take() {
            previous.handle.abort();
        }
        attempts.timer_generation = attempts.timer_generation.wrapping_add(1);
        let generation = attempts.timer_generation;

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            // Detach before running so that cleanup cannot abort an in-flight reconnect
            if manager.claim_timer(generation) {
                on_reconnect().await;
            }
        });
        attempts.timer = Some(PendingTimer { generation, handle });
        drop(attempts);

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, remaining, ?delay, "reconnect scheduled");

        self.set_state(ConnectionState::Disconnected {
            attempts_remaining: remaining,
        });
        DisconnectOutcome::Scheduled { attempt, delay }
    }

    /// Restore the full attempt budget. Pending timers and attempts are untouched.
    pub fn reset(&self) {
        let max = self.inner.config.max_attempts;
        {
            let mut attempts = self.lock();
            attempts.remaining = max;
            attempts.backoff.reset();
        }
        self.inner.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Exhausted {
                *state = ConnectionState::Disconnected {
                    attempts_remaining: max,
                };
                true
            } else {
                false
            }
        });
    }

    /// Cancel any pending retry. Idempotent.
    ///
    /// Open channels stay open and an in-flight attempt is not aborted.
    pub fn cleanup(&self) {
        if let Some(timer) = self.lock().timer.take() {
            timer.handle.abort();
        }
        self.set_state(ConnectionState::Closed);

        #[cfg(feature = "tracing")]
        tracing::debug!("reconnection manager cleaned up");
    }

    #[must_use]
    pub fn attempts_remaining(&self) -> u32 {
        self.lock().remaining
    }

    /// Whether the retry budget is used up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.lock().remaining == 0
    }

    /// Whether a retry is currently scheduled.
    #[must_use]
    pub fn has_pending_reconnect(&self) -> bool {
        self.lock().timer.is_some()
    }

    #[must_use]
    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    fn attempt_opened(&self, attempt: u64) {
        let latest = {
            let mut attempts = self.lock();
            attempts.remaining = self.inner.config.max_attempts;
            attempts.backoff.reset();
            attempts.sequence == attempt
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, "connection open");

        if latest {
            self.set_state(ConnectionState::Open {
                since: Instant::now(),
            });
        }
    }

    fn attempt_failed(&self, attempt: u64) {
        let (latest, remaining) = {
            let attempts = self.lock();
            (attempts.sequence == attempt, attempts.remaining)
        };
        if latest {
            self.set_state(ConnectionState::Disconnected {
                attempts_remaining: remaining,
            });
        }
    }

    /// Take ownership of the pending timer if it is still the one for `generation`.
    fn claim_timer(&self, generation: u64) -> bool {
        let mut attempts = self.lock();
        if attempts
            .timer
            .as_ref()
            .is_some_and(|timer| timer.generation == generation)
        {
            attempts.timer = None;
            true
        } else {
            false
        }
    }

    /// Returns whether the state changed.
    fn set_state(&self, next: ConnectionState) -> bool {
        self.inner.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Attempts> {
        self.inner
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

enum Outcome<C> {
    Pending(JoinHandle<Result<Arc<C>>>),
    Failed(Option<Error>),
}

/// One connection attempt; resolves to the opened channel.
///
/// Every call to [`ReconnectionManager::initiate_connection`] returns a fresh attempt.
#[must_use = "the outcome of an attempt is only observed by awaiting it"]
pub struct ConnectionAttempt<C> {
    attempt: u64,
    channel: Option<Arc<C>>,
    outcome: Outcome<C>,
}

impl<C> ConnectionAttempt<C> {
    /// Sequence number of this attempt within its manager.
    #[must_use]
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// The channel created for this attempt, before it has opened.
    ///
    /// `None` when the channel factory failed.
    #[must_use]
    pub fn channel(&self) -> Option<&Arc<C>> {
        self.channel.as_ref()
    }
}

impl<C> fmt::Debug for ConnectionAttempt<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAttempt")
            .field("attempt", &self.attempt)
            .field("has_channel", &self.channel.is_some())
            .finish_non_exhaustive()
    }
}

impl<C> Future for ConnectionAttempt<C> {
    type Output = Result<Arc<C>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.outcome {
            Outcome::Pending(handle) => match ready!(Pin::new(handle).poll(cx)) {
                Ok(result) => Poll::Ready(result),
                Err(join) => Poll::Ready(Err(join.into())),
            },
            Outcome::Failed(error) => Poll::Ready(Err(error
                .take()
                .unwrap_or_else(|| Error::validation("connection attempt polled after completion")))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::Kind;
    use crate::ws::memory::MemoryChannel;

    fn manager(
        config: ReconnectConfig,
    ) -> (ReconnectionManager<MemoryChannel>, Arc<AtomicUsize>) {
        let registrations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&registrations);
        let manager = ReconnectionManager::new(
            config,
            || Ok(MemoryChannel::open_pair().0),
            move |_channel: &Arc<MemoryChannel>| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        (manager, registrations)
    }

    #[test]
    fn starts_idle_with_full_budget() {
        let (manager, _) = manager(ReconnectConfig::builder().max_attempts(3).build());

        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(manager.attempts_remaining(), 3);
        assert!(!manager.is_exhausted());
        assert!(!manager.has_pending_reconnect());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ReconnectConfig::builder().backoff_multiplier(f64::NAN).build();

        let error = ReconnectionManager::<MemoryChannel>::new(
            config,
            || Ok(MemoryChannel::new()),
            |_channel: &Arc<MemoryChannel>| {},
        )
        .unwrap_err();

        assert_eq!(error.kind(), Kind::Validation);
    }

    #[tokio::test]
    async fn registers_handlers_once_per_attempt() {
        let (manager, registrations) = manager(ReconnectConfig::default());

        for _ in 0..3 {
            manager.initiate_connection().await.unwrap();
        }

        assert_eq!(registrations.load(Ordering::SeqCst), 3);
        assert!(manager.state().is_open());
    }

    #[tokio::test]
    async fn watch_runs_before_handlers_are_registered() {
        let registrations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&registrations);
        let manager = ReconnectionManager::new(
            ReconnectConfig::default(),
            || Ok(MemoryChannel::open_pair().0),
            move |_channel: &Arc<MemoryChannel>| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let observed = Arc::clone(&seen);
        let registered = Arc::clone(&registrations);
        manager
            .initiate_connection_with(move |channel| {
                observed.store(registered.load(Ordering::SeqCst), Ordering::SeqCst);
                assert_eq!(channel.listener_count(EventKind::Open), 0);
            })
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(registrations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_policy_never_schedules() {
        let (manager, _) = manager(ReconnectConfig::builder().enabled(false).build());

        let outcome = manager.handle_disconnect(|| async {});

        assert_eq!(outcome, DisconnectOutcome::Disabled);
        assert!(!manager.has_pending_reconnect());
        assert_eq!(manager.attempts_remaining(), 5);
    }

    #[tokio::test]
    async fn zero_budget_is_exhausted_immediately() {
        let (manager, _) = manager(ReconnectConfig::builder().max_attempts(0).build());

        assert_eq!(
            manager.handle_disconnect(|| async {}),
            DisconnectOutcome::Exhausted
        );
        assert_eq!(manager.state(), ConnectionState::Exhausted);
    }

    #[tokio::test]
    async fn reset_leaves_exhausted_state() {
        let (manager, _) = manager(ReconnectConfig::builder().max_attempts(1).build());
        _ = manager.handle_disconnect(|| async {});
        _ = manager.handle_disconnect(|| async {});
        assert_eq!(manager.state(), ConnectionState::Exhausted);

        manager.reset();

        assert_eq!(
            manager.state(),
            ConnectionState::Disconnected {
                attempts_remaining: 1
            }
        );
        assert!(!manager.is_exhausted());
        manager.cleanup();
    }
}

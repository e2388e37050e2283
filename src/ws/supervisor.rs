//! Automatic reconnection on top of [`ReconnectionManager`].
//!
//! The manager only reacts to disconnects it is told about. [`Supervisor`] does the
//! telling: it listens for `close` on every channel it starts, treats a failed
//! attempt as a disconnect too, and re-runs the attempt from the retry callback.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::watch;

use super::connection::{DisconnectOutcome, ReconnectionManager};
use super::error::WsError;
use super::traits::{Channel, ChannelEvent, EventKind};
use crate::Result;

type AttemptFuture<C> = Pin<Box<dyn Future<Output = Result<Arc<C>>> + Send>>;

struct Inner<C: Channel> {
    manager: ReconnectionManager<C>,
    current_tx: watch::Sender<Option<Arc<C>>>,
    /// Generation of the latest attempt
    generation: AtomicU64,
    /// Highest generation already reported lost
    lost: AtomicU64,
    stopped: AtomicBool,
}

/// Keeps one logical connection alive.
///
/// # Example
///
/// ```ignore
/// let supervisor = Supervisor::new(manager);
/// supervisor.start().await?;
///
/// let mut current = supervisor.channel_receiver();
/// while current.changed().await.is_ok() {
///     if let Some(channel) = current.borrow_and_update().clone() {
///         // a new channel is open: rebuild RPC options for it
///     }
/// }
/// ```
pub struct Supervisor<C: Channel> {
    inner: Arc<Inner<C>>,
}

impl<C: Channel> Clone for Supervisor<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Channel> fmt::Debug for Supervisor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("manager", &self.inner.manager)
            .field("connected", &self.inner.current_tx.borrow().is_some())
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl<C: Channel> Supervisor<C> {
    #[must_use]
    pub fn new(manager: ReconnectionManager<C>) -> Self {
        let (current_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                manager,
                current_tx,
                generation: AtomicU64::new(0),
                lost: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Run the first connection attempt.
    ///
    /// Supervision starts regardless of the outcome: a failed first attempt is
    /// retried like any later disconnect.
    pub async fn start(&self) -> Result<Arc<C>> {
        Inner::attempt(Arc::clone(&self.inner)).await
    }

    /// The currently open channel, if any.
    #[must_use]
    pub fn channel(&self) -> Option<Arc<C>> {
        self.inner.current_tx.borrow().clone()
    }

    /// Subscribe to channel changes: `Some` when a channel opens, `None` when it is lost.
    #[must_use]
    pub fn channel_receiver(&self) -> watch::Receiver<Option<Arc<C>>> {
        self.inner.current_tx.subscribe()
    }

    #[must_use]
    pub fn manager(&self) -> &ReconnectionManager<C> {
        &self.inner.manager
    }

    /// Stop reconnecting. The current channel is forgotten but not closed.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.manager.cleanup();
        self.inner.current_tx.send_replace(None);
    }
}

impl<C: Channel> Inner<C> {
    fn attempt(this: Arc<Self>) -> AttemptFuture<C> {
        Box::pin(async move {
            if this.stopped.load(Ordering::SeqCst) {
                return Err(WsError::ConnectionClosed.into());
            }

            let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
            // Watch for close before the channel can be seen open
            let watcher = Arc::downgrade(&this);
            let attempt = this.manager.initiate_connection_with(move |channel| {
                channel.on(
                    EventKind::Close,
                    Arc::new(move |_event: &ChannelEvent| {
                        if let Some(this) = Weak::upgrade(&watcher) {
                            Self::connection_lost(&this, generation);
                        }
                    }),
                );
            });

            match attempt.await {
                Ok(channel) => {
                    this.publish(generation, &channel);
                    Ok(channel)
                }
                Err(e) => {
                    Self::connection_lost(&this, generation);
                    Err(e)
                }
            }
        })
    }

    /// Make `channel` current unless `generation` was superseded or already lost.
    fn publish(&self, generation: u64, channel: &Arc<C>) {
        self.current_tx.send_if_modified(|current| {
            if !self.is_current(generation) || self.lost.load(Ordering::SeqCst) >= generation {
                return false;
            }
            *current = Some(Arc::clone(channel));
            true
        });
    }

    /// Report the loss of `generation` to the manager, at most once per generation.
    fn connection_lost(this: &Arc<Self>, generation: u64) {
        if !this.is_current(generation)
            || this.lost.fetch_max(generation, Ordering::SeqCst) >= generation
        {
            return;
        }
        this.current_tx.send_replace(None);

        let next = Arc::clone(this);
        let outcome = this.manager.handle_disconnect(move || async move {
            // Failures are reported through `connection_lost` again
            drop(Self::attempt(next).await);
        });

        #[cfg(feature = "tracing")]
        match outcome {
            DisconnectOutcome::Scheduled { attempt, delay } => {
                tracing::info!(attempt, ?delay, "connection lost, reconnecting");
            }
            _ => tracing::warn!(?outcome, "connection lost, not reconnecting"),
        }
        #[cfg(not(feature = "tracing"))]
        let _: DisconnectOutcome = outcome;
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.stopped.load(Ordering::SeqCst)
            && self.generation.load(Ordering::SeqCst) == generation
    }
}

//! Change feed plumbing.
//!
//! A [`Subscription`] is fed in one of two ways. An in-process
//! [`ChangeFeed`] pushes one [`ChangeEvent`] per committed write to every
//! subscriber of the event's matrix. A [`ChangeSource`] is pulled instead:
//! backends shared between processes hand out a source that reads committed
//! changes from storage each time the subscription is drained. Either way the
//! subscription is filtered by matrix id when it is opened, yields events in
//! commit order, and releases its registration when closed or dropped.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::{ChangeEvent, DecisionError};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Pull side of a subscription. Each call returns the changes committed
/// since the previous call, oldest first.
pub trait ChangeSource: Send {
    /// # Errors
    /// Returns [`DecisionError::Backend`] when pending changes cannot be read.
    fn poll_changes(&mut self) -> Result<Vec<ChangeEvent>, DecisionError>;
}

#[derive(Debug, Default)]
struct Registry {
    subscribers: BTreeMap<u64, Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
    matrix_id: String,
    sender: Sender<ChangeEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeFeed {
    registry: Arc<Mutex<Registry>>,
}

impl ChangeFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn subscribe(&self, matrix_id: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel();
        let id = next_subscription_id();
        lock(&self.registry).subscribers.insert(
            id,
            Subscriber {
                matrix_id: matrix_id.to_string(),
                sender,
            },
        );

        tracing::info!(subscription_id = id, matrix_id, "change feed subscription opened");

        Subscription {
            id,
            matrix_id: matrix_id.to_string(),
            inbox: Inbox::Channel {
                receiver,
                registry: Arc::downgrade(&self.registry),
            },
            disconnected: false,
        }
    }

    /// Delivers `event` to every subscriber of the event's matrix and returns
    /// how many received it.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let registry = lock(&self.registry);
        let mut delivered = 0_usize;
        for subscriber in registry.subscribers.values() {
            if subscriber.matrix_id == event.record.matrix_id
                && subscriber.sender.send(event.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        drop(registry);

        tracing::debug!(
            kind = event.kind.as_str(),
            decision_id = %event.record.id,
            matrix_id = %event.record.matrix_id,
            delivered,
            "published change event"
        );
        delivered
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.registry).subscribers.len()
    }
}

enum Inbox {
    Channel {
        receiver: Receiver<ChangeEvent>,
        registry: Weak<Mutex<Registry>>,
    },
    Polled {
        source: Box<dyn ChangeSource>,
        pending: VecDeque<ChangeEvent>,
    },
}

/// Receiving end of a change-feed registration.
pub struct Subscription {
    id: u64,
    matrix_id: String,
    inbox: Inbox,
    disconnected: bool,
}

impl Subscription {
    /// Wraps a pull-based source. The source is dropped with the
    /// subscription.
    #[must_use]
    pub fn polled(matrix_id: &str, source: Box<dyn ChangeSource>) -> Self {
        let id = next_subscription_id();
        tracing::info!(subscription_id = id, matrix_id, "polled subscription opened");

        Self {
            id,
            matrix_id: matrix_id.to_string(),
            inbox: Inbox::Polled {
                source,
                pending: VecDeque::new(),
            },
            disconnected: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn matrix_id(&self) -> &str {
        &self.matrix_id
    }

    /// True once the publishing feed has gone away. A disconnected
    /// subscription never yields another event.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Next pending event, or `None` when nothing is queued. A failed poll is
    /// logged and retried on the next call.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        match &mut self.inbox {
            Inbox::Channel { receiver, .. } => match receiver.try_recv() {
                Ok(event) => Some(event),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => {
                    if !self.disconnected {
                        self.disconnected = true;
                        tracing::warn!(
                            subscription_id = self.id,
                            matrix_id = %self.matrix_id,
                            "change feed disconnected; no further events will arrive"
                        );
                    }
                    None
                }
            },
            Inbox::Polled { source, pending } => {
                if pending.is_empty() {
                    match source.poll_changes() {
                        Ok(events) => pending.extend(events),
                        Err(err) => {
                            tracing::warn!(
                                subscription_id = self.id,
                                matrix_id = %self.matrix_id,
                                error = %err,
                                "change poll failed"
                            );
                        }
                    }
                }
                pending.pop_front()
            }
        }
    }

    /// Takes every queued event in delivery order.
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    pub fn close(self) {}
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inbox {
            Inbox::Channel { .. } => "channel",
            Inbox::Polled { .. } => "polled",
        };
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("matrix_id", &self.matrix_id)
            .field("kind", &kind)
            .field("disconnected", &self.disconnected)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Inbox::Channel { registry, .. } = &self.inbox {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            lock(&registry).subscribers.remove(&self.id);
        }
        tracing::info!(
            subscription_id = self.id,
            matrix_id = %self.matrix_id,
            "change feed subscription closed"
        );
    }
}

fn next_subscription_id() -> u64 {
    NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed)
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

use std::sync::{Mutex, PoisonError};

use flagplane_lib::{DistributionEvent, VersionTracker};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// What a subscriber gets from [`Subscription::next`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(DistributionEvent),
    /// The subscriber fell behind and `n` events were dropped. It should
    /// resync from a full snapshot.
    Lagged(u64),
    /// The bus shut down.
    Closed,
}

/// In-process fan-out of `flag.published` events.
///
/// Constructed once at startup and shared through the app state. Delivery
/// is best effort: only subscribers registered at publish time see an
/// event, and a subscriber that drops its [`Subscription`] is deregistered
/// immediately.
pub struct DistributionBus {
    tx: broadcast::Sender<DistributionEvent>,
    shutdown: watch::Sender<bool>,
    published: Mutex<VersionTracker>,
}

impl DistributionBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            tx,
            shutdown,
            published: Mutex::new(VersionTracker::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let subscription = Subscription {
            rx: self.tx.subscribe(),
            shutdown: self.shutdown.subscribe(),
        };
        debug!(subscribers = self.subscriber_count(), "bus subscriber added");
        subscription
    }

    /// Fans `event` out to current subscribers. Returns how many received
    /// it, or `None` if an event with the same or a newer version for the
    /// flag was already published.
    pub fn publish(&self, event: DistributionEvent) -> Option<usize> {
        let fresh = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(&event);
        if !fresh {
            debug!(
                tenant_id = %event.tenant_id,
                flag_key = %event.flag_key,
                version = event.version,
                "duplicate event not redistributed"
            );
            return None;
        }

        let delivered = self.tx.send(event.clone()).unwrap_or(0);
        info!(
            tenant_id = %event.tenant_id,
            flag_key = %event.flag_key,
            version = event.version,
            delivered,
            "flag.published distributed"
        );
        Some(delivered)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Wakes every subscriber with [`Delivery::Closed`]. Subscriptions made
    /// afterwards are closed from the start.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// A registered listener. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<DistributionEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Subscription {
    pub async fn next(&mut self) -> Delivery {
        if *self.shutdown.borrow() {
            return Delivery::Closed;
        }
        tokio::select! {
            result = self.rx.recv() => match result {
                Ok(event) => Delivery::Event(event),
                Err(broadcast::error::RecvError::Lagged(n)) => Delivery::Lagged(n),
                Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
            },
            _ = self.shutdown.changed() => Delivery::Closed,
        }
    }
}

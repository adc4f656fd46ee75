//! Fan-out of pipeline events to every subscriber.
//!
//! Replaces `tokio::sync::broadcast` to prevent silent event loss from lagging
//! receivers. Each subscriber gets a dedicated `mpsc` channel; sends happen under one
//! lock, so all subscribers observe events in the order they were published.
//!
//! Events from transport sessions are gated by an epoch. Every session is handed the
//! epoch that was live when it started; [`EventDistributor::advance_epoch`] invalidates
//! it. Because the epoch check and the sends share the lock, once `advance_epoch`
//! returns no event of the superseded session can reach a subscriber.

use crate::events::TelemetryEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;

struct Registry {
    subscribers: Vec<mpsc::UnboundedSender<TelemetryEvent>>,
    epoch: u64,
}

impl Registry {
    fn send(&mut self, event: TelemetryEvent) {
        // Closed receivers are removed on the way.
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Multi-subscriber event fan-out with epoch gating.
pub struct EventDistributor {
    registry: Mutex<Registry>,
}

impl EventDistributor {
    /// Distributor with no subscribers at epoch 0.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                subscribers: Vec::new(),
                epoch: 0,
            }),
        }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TelemetryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.lock().subscribers.push(tx);
        rx
    }

    /// Publish an event that does not belong to a session (pipeline status, scans).
    pub fn publish(&self, event: TelemetryEvent) {
        self.registry.lock().send(event);
    }

    /// Publish on behalf of the session started at `epoch`.
    ///
    /// Returns false, and drops the event, if that session has been superseded.
    pub fn publish_from(&self, epoch: u64, event: TelemetryEvent) -> bool {
        let mut registry = self.registry.lock();
        if registry.epoch != epoch {
            return false;
        }
        registry.send(event);
        true
    }

    /// Run `f` under the distributor lock if `epoch` is live.
    ///
    /// Everything `f` publishes through the [`Publisher`] is delivered contiguously,
    /// and no concurrent epoch change can interleave. Returns `None` without calling
    /// `f` if the epoch is stale.
    pub fn transact<R, F>(&self, epoch: u64, f: F) -> Option<R>
    where
        F: FnOnce(&mut Publisher<'_>) -> R,
    {
        let mut registry = self.registry.lock();
        if registry.epoch != epoch {
            return None;
        }
        Some(f(&mut Publisher {
            registry: &mut *registry,
        }))
    }

    /// Invalidate the current epoch and return the new one.
    pub fn advance_epoch(&self) -> u64 {
        let mut registry = self.registry.lock();
        registry.epoch += 1;
        registry.epoch
    }

    /// The live epoch.
    pub fn current_epoch(&self) -> u64 {
        self.registry.lock().epoch
    }

    /// Whether `epoch` is still live.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == epoch
    }

    /// Returns the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }
}

/// Publishing handle valid inside [`EventDistributor::transact`].
pub struct Publisher<'a> {
    registry: &'a mut Registry,
}

impl Publisher<'_> {
    /// Deliver `event` to every subscriber.
    pub fn send(&mut self, event: TelemetryEvent) {
        self.registry.send(event);
    }

    /// Invalidate the epoch the transaction was opened for. Returns the new epoch.
    pub fn advance_epoch(&mut self) -> u64 {
        self.registry.epoch += 1;
        self.registry.epoch
    }
}

impl Default for EventDistributor {
    fn default() -> Self {
        Self::new()
    }
}

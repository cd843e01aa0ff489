// MIT License - Copyright (c) 2026 Peter Wright
// Decides when the device state is published

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::{Duration, Instant};

/// "State changed since the last publication" marker.
///
/// Cloned into device listeners, which run outside the bridge lock.
#[derive(Debug, Clone, Default)]
pub struct DirtyFlag(Arc<AtomicBool>);

impl DirtyFlag {
    pub fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Publish when the state is dirty or the periodic interval has elapsed.
#[derive(Debug)]
pub struct PublicationScheduler {
    dirty: DirtyFlag,
    last_published_at: Option<Instant>,
    interval: Duration,
}

impl PublicationScheduler {
    /// Starts dirty so the first dispatch turn publishes.
    pub fn new(interval: Duration) -> Self {
        let dirty = DirtyFlag::default();
        dirty.mark();
        Self {
            dirty,
            last_published_at: None,
            interval,
        }
    }

    pub fn dirty_flag(&self) -> DirtyFlag {
        self.dirty.clone()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_published_at(&self) -> Option<Instant> {
        self.last_published_at
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.dirty.is_set()
            || self
                .last_published_at
                .is_none_or(|at| now.duration_since(at) >= self.interval)
    }

    /// Restart the periodic interval.
    ///
    /// The dirty flag is left alone: the publisher clears it before reading
    /// the state, so a change made while the publication is in flight stays
    /// marked.
    pub fn record_publish(&mut self, now: Instant) {
        self.last_published_at = Some(now);
    }
}

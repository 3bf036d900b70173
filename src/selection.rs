use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct SelectionState {
    len: usize,
    current: AtomicUsize,
    epoch: Instant,
    last_reset_nanos: AtomicU64,
}

impl SelectionState {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            current: AtomicUsize::new(0),
            epoch: Instant::now(),
            last_reset_nanos: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn set(&self, index: usize) {
        self.current.store(index % self.len, Ordering::SeqCst);
    }

    pub fn advance_from(&self, from: usize) -> usize {
        let next = (from + 1) % self.len;
        self.current.store(next, Ordering::SeqCst);
        next
    }

    pub fn reset(&self) {
        self.current.store(0, Ordering::SeqCst);
        self.last_reset_nanos.store(self.nanos_since_epoch(), Ordering::SeqCst);
    }

    pub fn last_reset_at(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.last_reset_nanos.load(Ordering::SeqCst))
    }

    pub fn reset_if_due(&self, interval: Option<Duration>) -> bool {
        let Some(interval) = interval else {
            return false;
        };
        if Instant::now().duration_since(self.last_reset_at()) < interval {
            return false;
        }

        let previous = self.current();
        self.reset();
        debug!(previous, "selection reset to primary backend");
        true
    }

    fn nanos_since_epoch(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter meter.
///
/// Handed out as `Arc<Counter>` by a [`FlyweightRegistry`](super::FlyweightRegistry),
/// so every caller asking for the same id and labels increments the same cell.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

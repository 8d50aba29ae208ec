//! Replica selection for the invoker.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Cycles through replicas in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Selects the next item, or `None` if `items` is empty.
    pub fn select<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        match items.len() {
            0 => None,
            1 => items.first(),
            len => items.get(self.counter.fetch_add(1, Ordering::Relaxed) % len),
        }
    }
}

//! Per-cell generation counter used as a cancellation token
//!
//! Every invalidation of a cell bumps its generation. Work captures the
//! value at submission time and is stale as soon as the counter moves on.
//! Cancellation is cooperative: nothing is interrupted, late results are
//! simply refused.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Monotonically increasing per-cell counter
///
/// Owned by exactly one orchestrator and shared read-only (through
/// [`Staleness`]) with the jobs it submits.
///
/// # Example
///
/// ```
/// use danmaku_scheduler::Generation;
///
/// let generation = Generation::new();
/// let captured = generation.bump();
/// assert!(generation.is_current(captured));
///
/// generation.bump();
/// assert!(!generation.is_current(captured));
/// ```
#[derive(Debug, Default)]
pub struct Generation {
    value: AtomicU64,
}

impl Generation {
    /// Create a counter starting at zero
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Atomically increment and return the new value
    ///
    /// Concurrent bumps never observe the same result.
    pub fn bump(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Latest value written by any bump
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Whether `captured` is still the latest generation
    pub fn is_current(&self, captured: u64) -> bool {
        self.current() == captured
    }
}

/// The "is this draw still wanted?" predicate
///
/// Pairs a captured generation with the live counter. Handed to workers
/// and to draw callbacks so they can bail out of expensive drawing once
/// the cell has moved on.
#[derive(Debug, Clone)]
pub struct Staleness {
    generation: Arc<Generation>,
    captured: u64,
}

impl Staleness {
    /// Capture the counter's current value
    pub fn capture(generation: &Arc<Generation>) -> Self {
        Self {
            generation: generation.clone(),
            captured: generation.current(),
        }
    }

    /// The generation this predicate was captured at
    pub fn captured(&self) -> u64 {
        self.captured
    }

    pub fn is_stale(&self) -> bool {
        !self.generation.is_current(self.captured)
    }

    pub fn is_valid(&self) -> bool {
        !self.is_stale()
    }
}

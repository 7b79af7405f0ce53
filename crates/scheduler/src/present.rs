//! Presentation handoff from draw workers to the producer thread
//!
//! Workers never touch a cell's visible content. When a job completes the
//! worker posts a [`Handoff`] to the presenter's queue; the producer thread
//! (the one driving animation and input) applies handoffs in arrival order
//! by calling one of the `Presenter::drain*` methods once per frame.
//!
//! Applying a handoff re-checks the cell's generation one last time, so a
//! result superseded while it sat in the queue is still refused.

use crate::frame_budget::FrameBudget;
use crate::job::{guard_callback, RenderOutcome};
use crate::orchestrator::{CellContent, CellShared};
use crate::pool::CellKey;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A finished job on its way back to the producer thread
pub(crate) struct Handoff {
    pub(crate) cell: Arc<CellShared>,
    pub(crate) content: Arc<dyn CellContent>,
    pub(crate) generation: u64,
    pub(crate) outcome: RenderOutcome,
}

impl Handoff {
    /// Apply on the producer thread; returns whether the result was presented
    fn apply(self) -> bool {
        let Handoff {
            cell,
            content,
            generation,
            outcome,
        } = self;
        let key = cell.key();

        if !cell.is_alive() {
            tracing::trace!(cell = %key, generation, "dropping handoff for torn-down cell");
            return false;
        }

        match outcome {
            RenderOutcome::Finished(image) if cell.generation().is_current(generation) => {
                tracing::trace!(cell = %key, generation, "presenting");
                cell.present(generation, image);
                guard_callback(key, "did_draw", || content.did_draw(true));
                true
            }
            outcome => {
                tracing::debug!(cell = %key, generation, outcome = outcome.kind(), "discarding");
                cell.discard(generation);
                guard_callback(key, "did_draw", || content.did_draw(false));
                false
            }
        }
    }

    fn key(&self) -> CellKey {
        self.cell.key()
    }
}

/// Sending side of the presentation queue, held by orchestrators
#[derive(Clone)]
pub struct PresentHandle {
    sender: Sender<Handoff>,
}

impl PresentHandle {
    pub(crate) fn send(&self, handoff: Handoff) {
        let key = handoff.key();
        if self.sender.send(handoff).is_err() {
            tracing::debug!(cell = %key, "presenter gone, dropping handoff");
        }
    }
}

/// Receiving side of the presentation queue, owned by the producer thread
///
/// # Example
///
/// ```
/// use danmaku_scheduler::Presenter;
/// use std::time::Duration;
///
/// let presenter = Presenter::new();
/// let handle = presenter.handle();
/// // give `handle` to every DrawOrchestrator, then once per frame:
/// assert_eq!(presenter.drain(), 0);
/// assert_eq!(presenter.wait(Duration::from_millis(1)), 0);
/// # drop(handle);
/// ```
pub struct Presenter {
    sender: Sender<Handoff>,
    receiver: Receiver<Handoff>,
}

impl Presenter {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    /// A handle for orchestrators to route their results here
    pub fn handle(&self) -> PresentHandle {
        PresentHandle {
            sender: self.sender.clone(),
        }
    }

    /// Number of handoffs waiting to be applied
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Apply every queued handoff without blocking
    ///
    /// Returns the number of handoffs applied.
    pub fn drain(&self) -> usize {
        let mut applied = 0;
        while let Ok(handoff) = self.receiver.try_recv() {
            handoff.apply();
            applied += 1;
        }
        applied
    }

    /// Apply queued handoffs until the queue is empty or the budget is spent
    ///
    /// At least one handoff is applied when any is queued, so a tight budget
    /// still makes progress.
    pub fn drain_within(&self, budget: &FrameBudget) -> usize {
        let mut applied = 0;
        while let Ok(handoff) = self.receiver.try_recv() {
            handoff.apply();
            applied += 1;
            if budget.should_yield() {
                break;
            }
        }
        applied
    }

    /// Block for up to `timeout` until at least one handoff arrives, then drain
    pub fn wait(&self, timeout: Duration) -> usize {
        match self.receiver.recv_timeout(timeout) {
            Ok(handoff) => {
                handoff.apply();
                1 + self.drain()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Apply handoffs as they arrive until `done` returns true or `timeout` passes
    ///
    /// Returns whether `done` was satisfied.
    pub fn drain_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain();
            if done() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if let Ok(handoff) = self.receiver.recv_timeout(remaining) {
                handoff.apply();
            }
        }
    }
}

impl Default for Presenter {
    fn default() -> Self {
        Self::new()
    }
}

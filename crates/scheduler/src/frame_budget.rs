//! Frame budget for the presentation thread
//!
//! Presenting finished cells happens on the thread that also drives
//! animation and input. A [`FrameBudget`] caps how long one frame may spend
//! applying handoffs so a burst of completions cannot stall the frame.

use std::time::{Duration, Instant};

/// Frame time at 60 FPS
pub const FRAME_BUDGET_60FPS: Duration = Duration::from_micros(16_667);

/// Frame time at 120 FPS
pub const FRAME_BUDGET_120FPS: Duration = Duration::from_micros(8_333);

/// Part of every frame left to event processing
pub const EVENT_PROCESSING_RESERVE: Duration = Duration::from_millis(5);

/// Deadline for presentation work within the current frame
///
/// # Example
///
/// ```
/// use danmaku_scheduler::frame_budget::FrameBudget;
/// use danmaku_scheduler::Presenter;
///
/// let presenter = Presenter::new();
/// let mut budget = FrameBudget::for_120fps();
/// presenter.drain_within(&budget);
/// budget.reset();
/// ```
#[derive(Debug, Clone)]
pub struct FrameBudget {
    frame: Duration,
    reserve: Duration,
    deadline: Instant,
}

impl FrameBudget {
    /// Start a budget of `frame` minus [`EVENT_PROCESSING_RESERVE`], from now
    pub fn new(frame: Duration) -> Self {
        Self::with_reserve(frame, EVENT_PROCESSING_RESERVE)
    }

    /// Start a budget of `frame` minus `reserve`, from now
    pub fn with_reserve(frame: Duration, reserve: Duration) -> Self {
        Self {
            frame,
            reserve,
            deadline: Instant::now() + frame.saturating_sub(reserve),
        }
    }

    pub fn for_60fps() -> Self {
        Self::new(FRAME_BUDGET_60FPS)
    }

    pub fn for_120fps() -> Self {
        Self::new(FRAME_BUDGET_120FPS)
    }

    /// Move the deadline to one frame from now
    pub fn reset(&mut self) {
        *self = Self::with_reserve(self.frame, self.reserve);
    }

    /// Time left before the frame should yield
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn should_yield(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

impl Default for FrameBudget {
    fn default() -> Self {
        Self::for_60fps()
    }
}

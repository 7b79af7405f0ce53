//! Danmaku Draw Scheduler
//!
//! Asynchronous, cancellable rendering for danmaku cells.
//!
//! Each visible cell owns a [`DrawOrchestrator`]. Asking a cell to redraw
//! bumps its generation counter and queues a [`RenderJob`] on a fixed-size
//! [`WorkerPool`]; all jobs of one cell land on the same worker, in order.
//! Finished images travel back through a [`Presenter`] that the producer
//! thread drains once per frame. A result is presented only if its
//! generation is still current at that point, so superseded work is
//! dropped without ever blocking the producer.
//!
//! # Example
//!
//! ```
//! use danmaku_scheduler::{
//!     content_fn, CellGeometry, DrawOrchestrator, Presenter, Size, WorkerPool,
//! };
//! use std::time::Duration;
//!
//! let pool = WorkerPool::new(4).unwrap();
//! let presenter = Presenter::new();
//!
//! let mut cell = DrawOrchestrator::new(pool.clone(), presenter.handle());
//! cell.set_geometry(CellGeometry::new(Size::new(120.0, 24.0)));
//! cell.set_content(content_fn(|surface, size, staleness| {
//!     surface.fill_rect(0.0, 0.0, size.width, size.height, image::Rgba([0, 0, 0, 160]));
//!     if staleness.is_stale() {
//!         return Err(danmaku_scheduler::DrawError::Cancelled);
//!     }
//!     Ok(())
//! }));
//!
//! cell.set_needs_display();
//!
//! // once per frame on the producer thread
//! presenter.drain_until(Duration::from_secs(5), || cell.contents().is_some());
//! assert!(cell.contents().is_some());
//!
//! pool.shutdown();
//! ```

mod config;
mod error;
pub mod frame_budget;
mod generation;
mod job;
mod orchestrator;
mod pool;
mod present;
mod surface;

// Re-export public API
pub use config::{SchedulerConfig, ENV_DRAW_MODE, ENV_WORKERS};
pub use error::{ConfigError, DrawError, PoolError};
pub use frame_budget::FrameBudget;
pub use generation::{Generation, Staleness};
pub use job::{RenderJob, RenderOutcome};
pub use orchestrator::{
    content_fn, CellContent, CellGeometry, DrawMode, DrawOrchestrator, DrawState,
};
pub use pool::{
    CellKey, JobListener, PoolStats, WorkerPool, DEFAULT_THREAD_NAME, DEFAULT_WORKER_COUNT,
};
pub use present::{PresentHandle, Presenter};
pub use surface::{PresentedImage, Size, Surface, OPAQUE_UNDERFILL};

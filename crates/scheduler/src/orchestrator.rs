//! Per-cell draw orchestration
//!
//! A [`DrawOrchestrator`] owns one cell's render lifecycle:
//!
//! ```text
//! Idle -> Scheduled -> Rendering -> Presented | Discarded
//!   \---- (sync) ----> Rendering -> Presented
//! ```
//!
//! Every invalidation bumps the cell's generation. Jobs already in flight
//! are never interrupted; their results are simply judged stale when they
//! come back. Several jobs of one cell may race, at most one of them (the
//! one holding the latest generation at its final check) gets presented,
//! and it is fine for none of them to win.

use crate::error::DrawError;
use crate::generation::{Generation, Staleness};
use crate::job::{guard_callback, RenderJob, RenderOutcome};
use crate::pool::{CellKey, JobListener, WorkerPool};
use crate::present::{Handoff, PresentHandle};
use crate::surface::{PresentedImage, Size, Surface};
use image::Rgba;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

/// Content of a cell: draws itself and hears about the draw lifecycle
///
/// `will_draw` and `draw` run on a draw worker in async mode and on the
/// calling thread in sync mode. `did_draw` always runs on the presentation
/// thread.
pub trait CellContent: Send + Sync {
    /// About to draw
    fn will_draw(&self) {}

    /// Paint into `surface`
    ///
    /// Long draws should poll `staleness` and return
    /// [`DrawError::Cancelled`] once the cell has moved on.
    fn draw(&self, surface: &mut Surface, size: Size, staleness: &Staleness)
        -> Result<(), DrawError>;

    /// The draw finished; `finished` is false if nothing was presented
    fn did_draw(&self, _finished: bool) {}
}

impl<F> CellContent for F
where
    F: Fn(&mut Surface, Size, &Staleness) -> Result<(), DrawError> + Send + Sync,
{
    fn draw(
        &self,
        surface: &mut Surface,
        size: Size,
        staleness: &Staleness,
    ) -> Result<(), DrawError> {
        self(surface, size, staleness)
    }
}

/// Wrap a draw closure as cell content
pub fn content_fn<F>(draw: F) -> Arc<dyn CellContent>
where
    F: Fn(&mut Surface, Size, &Staleness) -> Result<(), DrawError> + Send + Sync + 'static,
{
    Arc::new(draw)
}

/// Geometry supplied by the placement layer when a redraw is requested
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellGeometry {
    /// Logical size of the cell
    pub size: Size,

    /// Device pixel scale
    pub scale: f32,

    /// Whether the cell covers everything beneath it
    pub opaque: bool,

    /// Background fill, only used for opaque cells
    pub background: Option<Rgba<u8>>,
}

impl CellGeometry {
    pub fn new(size: Size) -> Self {
        Self {
            size,
            scale: 1.0,
            opaque: false,
            background: None,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_opaque(mut self, opaque: bool) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn with_background(mut self, background: Rgba<u8>) -> Self {
        self.background = Some(background);
        self
    }
}

impl Default for CellGeometry {
    fn default() -> Self {
        Self::new(Size::ZERO)
    }
}

/// Where rasterization happens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawMode {
    /// On a pool worker; results are presented by the presenter
    #[default]
    Async,

    /// Inline on the calling thread, presented before the call returns
    Sync,
}

impl FromStr for DrawMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "async" => Ok(DrawMode::Async),
            "sync" => Ok(DrawMode::Sync),
            other => Err(format!("unknown draw mode {other:?}")),
        }
    }
}

/// Lifecycle state of a cell's latest draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawState {
    /// Nothing requested yet, or the last request needed no rasterization
    Idle,

    /// Job queued on a worker
    Scheduled,

    /// A worker is executing the latest job
    Rendering,

    /// The latest job's image is the cell's content
    Presented,

    /// The latest job produced nothing presentable
    Discarded,
}

#[derive(Debug)]
struct StateSlot {
    generation: u64,
    state: DrawState,
}

/// Cell state shared between the orchestrator, its jobs and the presenter
///
/// Contents are only written on the presentation thread, the lock is
/// uncontended. Freshness checks go through the lock-free generation.
pub(crate) struct CellShared {
    key: CellKey,
    generation: Arc<Generation>,
    alive: AtomicBool,
    contents: Mutex<Option<PresentedImage>>,
    slot: Mutex<StateSlot>,
}

impl CellShared {
    pub(crate) fn new(key: CellKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            generation: Arc::new(Generation::new()),
            alive: AtomicBool::new(true),
            contents: Mutex::new(None),
            slot: Mutex::new(StateSlot {
                generation: 0,
                state: DrawState::Idle,
            }),
        })
    }

    pub(crate) fn key(&self) -> CellKey {
        self.key
    }

    pub(crate) fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn contents(&self) -> Option<PresentedImage> {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_contents(&self, contents: Option<PresentedImage>) {
        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = contents;
    }

    fn state(&self) -> DrawState {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Start tracking a new generation
    fn enter(&self, generation: u64, state: DrawState) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.generation = generation;
        slot.state = state;
    }

    /// Move the tracked generation along, ignoring stale generations
    fn advance(&self, generation: u64, from: Option<DrawState>, to: DrawState) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.generation == generation && from.map_or(true, |from| slot.state == from) {
            slot.state = to;
        }
    }

    pub(crate) fn begin_rendering(&self, generation: u64) {
        self.advance(generation, Some(DrawState::Scheduled), DrawState::Rendering);
    }

    /// Make `image` the visible content (presentation thread only)
    pub(crate) fn present(&self, generation: u64, image: PresentedImage) {
        self.set_contents(Some(image));
        self.advance(generation, None, DrawState::Presented);
    }

    pub(crate) fn discard(&self, generation: u64) {
        self.advance(generation, None, DrawState::Discarded);
    }

    /// Invalidate everything in flight and drop the visible content
    pub(crate) fn tear_down(&self) {
        self.alive.store(false, Ordering::Release);
        let generation = self.generation.bump();
        self.enter(generation, DrawState::Idle);
        self.set_contents(None);
    }
}

/// Routes a job's lifecycle back to its cell
struct DrawTicket {
    cell: Arc<CellShared>,
    content: Arc<dyn CellContent>,
    presenter: PresentHandle,
}

impl JobListener for DrawTicket {
    fn started(&self, job: &RenderJob) {
        self.cell.begin_rendering(job.generation());
    }

    fn completed(self: Box<Self>, job: &RenderJob, outcome: RenderOutcome) {
        let DrawTicket {
            cell,
            content,
            presenter,
        } = *self;
        presenter.send(Handoff {
            cell,
            content,
            generation: job.generation(),
            outcome,
        });
    }
}

/// Owns the render lifecycle of one visible cell
///
/// Lives on the presentation thread. Dropping it tears the cell down: any
/// job still in flight is invalidated and will never present.
///
/// # Example
///
/// ```
/// use danmaku_scheduler::{
///     content_fn, CellGeometry, DrawMode, DrawOrchestrator, Presenter, Size, WorkerPool,
/// };
///
/// let pool = WorkerPool::new(2).unwrap();
/// let presenter = Presenter::new();
///
/// let mut cell = DrawOrchestrator::new(pool, presenter.handle());
/// cell.set_geometry(CellGeometry::new(Size::new(40.0, 12.0)).with_scale(2.0));
/// cell.set_content(content_fn(|surface, _size, _staleness| {
///     surface.fill(image::Rgba([255, 255, 255, 255]));
///     Ok(())
/// }));
///
/// cell.set_draw_mode(DrawMode::Sync);
/// cell.set_needs_display();
/// assert_eq!(cell.contents().unwrap().width(), 80);
/// ```
pub struct DrawOrchestrator {
    cell: Arc<CellShared>,
    pool: WorkerPool,
    presenter: PresentHandle,
    content: Option<Arc<dyn CellContent>>,
    geometry: CellGeometry,
    mode: DrawMode,
}

impl DrawOrchestrator {
    pub fn new(pool: WorkerPool, presenter: PresentHandle) -> Self {
        Self::with_key(CellKey::next(), pool, presenter)
    }

    /// Use a host-chosen cell identity for worker routing
    pub fn with_key(key: CellKey, pool: WorkerPool, presenter: PresentHandle) -> Self {
        Self {
            cell: CellShared::new(key),
            pool,
            presenter,
            content: None,
            geometry: CellGeometry::default(),
            mode: DrawMode::default(),
        }
    }

    pub fn key(&self) -> CellKey {
        self.cell.key()
    }

    pub fn set_content(&mut self, content: Arc<dyn CellContent>) {
        self.content = Some(content);
    }

    pub fn clear_content(&mut self) {
        self.content = None;
    }

    pub fn set_geometry(&mut self, geometry: CellGeometry) {
        self.geometry = geometry;
    }

    pub fn geometry(&self) -> CellGeometry {
        self.geometry
    }

    pub fn set_draw_mode(&mut self, mode: DrawMode) {
        self.mode = mode;
    }

    pub fn draw_mode(&self) -> DrawMode {
        self.mode
    }

    /// The cell's visible content
    pub fn contents(&self) -> Option<PresentedImage> {
        self.cell.contents()
    }

    pub fn state(&self) -> DrawState {
        self.cell.state()
    }

    /// Whether a draw is queued or running for the latest generation
    pub fn is_drawing(&self) -> bool {
        matches!(self.state(), DrawState::Scheduled | DrawState::Rendering)
    }

    pub fn generation(&self) -> u64 {
        self.cell.generation().current()
    }

    /// Content is invalid: supersede in-flight work and draw again
    pub fn set_needs_display(&mut self) {
        let generation = self.cell.generation().bump();

        let content = match &self.content {
            Some(content) if !self.geometry.size.is_degenerate() => content.clone(),
            content => {
                self.skip_draw(generation, content.clone());
                return;
            }
        };

        match self.mode {
            DrawMode::Sync => self.draw_inline(generation, content),
            DrawMode::Async => self.schedule(generation, content),
        }
    }

    /// Same as [`set_needs_display`](Self::set_needs_display)
    pub fn redraw(&mut self) {
        self.set_needs_display();
    }

    /// Get the cell ready to show different content
    ///
    /// In-flight jobs are invalidated and the visible content is cleared,
    /// but the cell stays alive.
    pub fn prepare_for_reuse(&mut self) {
        let generation = self.cell.generation().bump();
        self.cell.enter(generation, DrawState::Idle);
        self.cell.set_contents(None);
    }

    /// Nothing to rasterize: clear and report success immediately
    fn skip_draw(&self, generation: u64, content: Option<Arc<dyn CellContent>>) {
        let key = self.key();
        if let Some(content) = &content {
            guard_callback(key, "will_draw", || content.will_draw());
        }
        self.cell.enter(generation, DrawState::Idle);
        self.cell.set_contents(None);
        if let Some(content) = &content {
            guard_callback(key, "did_draw", || content.did_draw(true));
        }
    }

    fn draw_inline(&self, generation: u64, content: Arc<dyn CellContent>) {
        self.cell.enter(generation, DrawState::Rendering);
        let job = self.job(content.clone());

        match job.execute() {
            RenderOutcome::Finished(image) => {
                self.cell.present(generation, image);
                guard_callback(self.key(), "did_draw", || content.did_draw(true));
            }
            outcome => {
                tracing::debug!(
                    cell = %self.key(),
                    generation,
                    outcome = outcome.kind(),
                    "inline draw failed"
                );
                self.cell.set_contents(None);
                self.cell.discard(generation);
                guard_callback(self.key(), "did_draw", || content.did_draw(false));
            }
        }
    }

    fn schedule(&self, generation: u64, content: Arc<dyn CellContent>) {
        self.cell.enter(generation, DrawState::Scheduled);
        let ticket = DrawTicket {
            cell: self.cell.clone(),
            content: content.clone(),
            presenter: self.presenter.clone(),
        };

        if let Err(err) = self.pool.submit(self.key(), self.job(content.clone()), ticket) {
            tracing::warn!(cell = %self.key(), generation, %err, "failed to queue draw job");
            self.cell.discard(generation);
            guard_callback(self.key(), "did_draw", || content.did_draw(false));
        }
    }

    fn job(&self, content: Arc<dyn CellContent>) -> RenderJob {
        RenderJob::new(
            self.key(),
            Staleness::capture(self.cell.generation()),
            self.geometry,
            content,
        )
    }
}

impl Drop for DrawOrchestrator {
    fn drop(&mut self) {
        self.cell.tear_down();
    }
}

impl fmt::Debug for DrawOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrawOrchestrator")
            .field("key", &self.key())
            .field("generation", &self.generation())
            .field("state", &self.state())
            .field("mode", &self.mode)
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::present::Presenter;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

    #[derive(Default)]
    struct Tracker {
        will_draw: AtomicUsize,
        finished: Mutex<Vec<bool>>,
    }

    impl CellContent for Tracker {
        fn will_draw(&self) {
            self.will_draw.fetch_add(1, Ordering::SeqCst);
        }

        fn draw(&self, surface: &mut Surface, _: Size, _: &Staleness) -> Result<(), DrawError> {
            surface.fill(WHITE);
            Ok(())
        }

        fn did_draw(&self, finished: bool) {
            self.finished.lock().unwrap().push(finished);
        }
    }

    fn cell(mode: DrawMode) -> (DrawOrchestrator, Presenter, Arc<Tracker>) {
        let presenter = Presenter::new();
        let mut cell = DrawOrchestrator::new(WorkerPool::new(2).unwrap(), presenter.handle());
        let tracker = Arc::new(Tracker::default());
        cell.set_content(tracker.clone());
        cell.set_geometry(CellGeometry::new(Size::new(10.0, 5.0)));
        cell.set_draw_mode(mode);
        (cell, presenter, tracker)
    }

    #[test]
    fn test_new_cell_is_idle() {
        let presenter = Presenter::new();
        let cell = DrawOrchestrator::new(WorkerPool::default(), presenter.handle());
        assert_eq!(cell.state(), DrawState::Idle);
        assert_eq!(cell.generation(), 0);
        assert!(cell.contents().is_none());
        assert_eq!(cell.draw_mode(), DrawMode::Async);
        assert!(!cell.is_drawing());
    }

    #[test]
    fn test_sync_draw_presents_before_returning() {
        let (mut cell, presenter, tracker) = cell(DrawMode::Sync);
        cell.set_needs_display();

        assert_eq!(cell.state(), DrawState::Presented);
        assert_eq!(*tracker.finished.lock().unwrap(), vec![true]);
        assert_eq!(tracker.will_draw.load(Ordering::SeqCst), 1);
        let image = cell.contents().unwrap();
        assert_eq!((image.width(), image.height()), (10, 5));
        assert_eq!(presenter.pending(), 0);
        assert!(!cell.pool.is_started());
    }

    #[test]
    fn test_sync_draw_failure_clears_content() {
        let (mut cell, _presenter, _tracker) = cell(DrawMode::Sync);
        cell.set_needs_display();
        assert!(cell.contents().is_some());

        cell.set_content(content_fn(|_, _, _| Err(DrawError::failed("broken"))));
        cell.set_needs_display();
        assert!(cell.contents().is_none());
        assert_eq!(cell.state(), DrawState::Discarded);
    }

    #[test]
    fn test_async_draw_goes_through_presenter() {
        let (mut cell, presenter, tracker) = cell(DrawMode::Async);
        cell.set_needs_display();
        assert!(cell.is_drawing() || presenter.pending() > 0);

        assert!(presenter.drain_until(Duration::from_secs(5), || {
            !tracker.finished.lock().unwrap().is_empty()
        }));
        assert_eq!(*tracker.finished.lock().unwrap(), vec![true]);
        assert_eq!(cell.state(), DrawState::Presented);
        assert!(cell.contents().is_some());
    }

    #[test]
    fn test_degenerate_size_finishes_immediately() {
        let (mut cell, presenter, tracker) = cell(DrawMode::Async);
        cell.set_geometry(CellGeometry::new(Size::ZERO));
        cell.set_needs_display();

        assert_eq!(*tracker.finished.lock().unwrap(), vec![true]);
        assert_eq!(tracker.will_draw.load(Ordering::SeqCst), 1);
        assert!(cell.contents().is_none());
        assert_eq!(cell.state(), DrawState::Idle);
        assert_eq!(presenter.pending(), 0);
        assert!(!cell.pool.is_started());
    }

    #[test]
    fn test_missing_content_clears_and_bumps() {
        let (mut cell, _presenter, _tracker) = cell(DrawMode::Sync);
        cell.set_needs_display();
        assert!(cell.contents().is_some());

        cell.clear_content();
        cell.set_needs_display();
        assert!(cell.contents().is_none());
        assert_eq!(cell.generation(), 2);
    }

    #[test]
    fn test_prepare_for_reuse_invalidates() {
        let (mut cell, presenter, tracker) = cell(DrawMode::Async);
        cell.set_needs_display();
        let before = cell.generation();
        cell.prepare_for_reuse();
        assert!(cell.generation() > before);
        assert_eq!(cell.state(), DrawState::Idle);

        assert!(presenter.drain_until(Duration::from_secs(5), || {
            !tracker.finished.lock().unwrap().is_empty()
        }));
        assert_eq!(*tracker.finished.lock().unwrap(), vec![false]);
        assert!(cell.contents().is_none());
        assert_eq!(cell.state(), DrawState::Idle);
    }

    #[test]
    fn test_submit_failure_reports_not_finished() {
        let (mut cell, _presenter, tracker) = cell(DrawMode::Async);
        cell.pool.shutdown();
        cell.set_needs_display();
        assert_eq!(*tracker.finished.lock().unwrap(), vec![false]);
        assert_eq!(cell.state(), DrawState::Discarded);
    }

    #[test]
    fn test_sync_draw_of_huge_cell_reports_failure() {
        let (mut cell, _presenter, tracker) = cell(DrawMode::Sync);
        cell.set_needs_display();
        assert!(cell.contents().is_some());

        cell.set_geometry(CellGeometry::new(Size::new(1.0e10, 1.0e10)));
        cell.set_needs_display();

        assert_eq!(*tracker.finished.lock().unwrap(), vec![true, false]);
        assert!(cell.contents().is_none());
        assert_eq!(cell.state(), DrawState::Discarded);
    }

    struct Panicky;

    impl CellContent for Panicky {
        fn will_draw(&self) {
            panic!("will_draw bug");
        }

        fn draw(&self, _: &mut Surface, _: Size, _: &Staleness) -> Result<(), DrawError> {
            Ok(())
        }

        fn did_draw(&self, _finished: bool) {
            panic!("did_draw bug");
        }
    }

    #[test]
    fn test_panicking_callbacks_stay_on_the_cell() {
        let presenter = Presenter::new();
        let mut cell = DrawOrchestrator::new(WorkerPool::new(1).unwrap(), presenter.handle());
        cell.set_content(Arc::new(Panicky));

        // degenerate path calls both hooks on this thread
        cell.set_needs_display();
        assert_eq!(cell.state(), DrawState::Idle);

        cell.set_geometry(CellGeometry::new(Size::new(4.0, 4.0)));
        cell.set_draw_mode(DrawMode::Sync);
        cell.set_needs_display();
        assert_eq!(cell.state(), DrawState::Discarded);
        assert!(cell.contents().is_none());
    }

    #[test]
    fn test_draw_mode_parsing() {
        assert_eq!("async".parse::<DrawMode>(), Ok(DrawMode::Async));
        assert_eq!(" SYNC ".parse::<DrawMode>(), Ok(DrawMode::Sync));
        assert!("later".parse::<DrawMode>().is_err());
    }

    #[test]
    fn test_geometry_builders() {
        let geometry = CellGeometry::new(Size::new(1.0, 2.0))
            .with_scale(3.0)
            .with_opaque(true)
            .with_background(WHITE);
        assert_eq!(geometry.scale, 3.0);
        assert!(geometry.opaque);
        assert_eq!(geometry.background, Some(WHITE));
        assert_eq!(CellGeometry::default().size, Size::ZERO);
    }

    #[test]
    fn test_debug_includes_state() {
        let (cell, _presenter, _tracker) = cell(DrawMode::Sync);
        let text = format!("{cell:?}");
        assert!(text.contains("Idle"));
        assert!(text.contains("Sync"));
    }
}

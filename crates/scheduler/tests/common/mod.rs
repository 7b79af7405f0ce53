//! Shared helpers for the scheduler integration tests.

#![allow(dead_code)]

use crossbeam_channel::{Receiver, Sender};
use danmaku_scheduler::{
    CellContent, CellGeometry, DrawError, DrawOrchestrator, Presenter, Size, Staleness, Surface,
    WorkerPool,
};
use image::Rgba;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn geometry() -> CellGeometry {
    CellGeometry::new(Size::new(32.0, 8.0)).with_scale(2.0)
}

/// Content that records its lifecycle
#[derive(Default)]
pub struct Recorder {
    pub will_draw: AtomicUsize,
    /// Generations seen by `draw`, in call order
    pub drawn: Mutex<Vec<u64>>,
    /// `did_draw` flags, in call order
    pub finished: Mutex<Vec<bool>>,
    /// Upper bound for a random pause inside `draw`, in microseconds
    pub jitter_micros: u64,
}

impl Recorder {
    pub fn with_jitter(jitter_micros: u64) -> Self {
        Self {
            jitter_micros,
            ..Self::default()
        }
    }

    pub fn finished(&self) -> Vec<bool> {
        self.finished.lock().unwrap().clone()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.lock().unwrap().len()
    }

    pub fn successes(&self) -> usize {
        self.finished().into_iter().filter(|ok| *ok).count()
    }

    pub fn drawn(&self) -> Vec<u64> {
        self.drawn.lock().unwrap().clone()
    }
}

impl CellContent for Recorder {
    fn will_draw(&self) {
        self.will_draw.fetch_add(1, Ordering::SeqCst);
    }

    fn draw(
        &self,
        surface: &mut Surface,
        _size: Size,
        staleness: &Staleness,
    ) -> Result<(), DrawError> {
        self.drawn.lock().unwrap().push(staleness.captured());
        if self.jitter_micros > 0 {
            let pause = rand::thread_rng().gen_range(0..self.jitter_micros);
            std::thread::sleep(Duration::from_micros(pause));
        }
        if staleness.is_stale() {
            return Err(DrawError::Cancelled);
        }
        surface.fill(Rgba([255, 255, 255, 255]));
        Ok(())
    }

    fn did_draw(&self, finished: bool) {
        self.finished.lock().unwrap().push(finished);
    }
}

/// Content that holds its worker until the gate is opened
pub struct Blocker {
    gate: Receiver<()>,
    pub finished: Mutex<Vec<bool>>,
}

impl CellContent for Blocker {
    fn draw(&self, _: &mut Surface, _: Size, _: &Staleness) -> Result<(), DrawError> {
        // returns once the sender is dropped
        let _ = self.gate.recv();
        Ok(())
    }

    fn did_draw(&self, finished: bool) {
        self.finished.lock().unwrap().push(finished);
    }
}

/// Occupy the single worker of `pool` until the returned sender is dropped
pub fn block_worker(
    pool: &WorkerPool,
    presenter: &Presenter,
) -> (DrawOrchestrator, Arc<Blocker>, Sender<()>) {
    assert_eq!(pool.worker_count(), 1);
    let (open, gate) = crossbeam_channel::bounded(0);
    let blocker = Arc::new(Blocker {
        gate,
        finished: Mutex::new(Vec::new()),
    });

    let mut cell = DrawOrchestrator::new(pool.clone(), presenter.handle());
    cell.set_geometry(geometry());
    cell.set_content(blocker.clone());
    cell.set_needs_display();
    (cell, blocker, open)
}

pub fn cell_with(
    pool: &WorkerPool,
    presenter: &Presenter,
    content: Arc<dyn CellContent>,
) -> DrawOrchestrator {
    let mut cell = DrawOrchestrator::new(pool.clone(), presenter.handle());
    cell.set_geometry(geometry());
    cell.set_content(content);
    cell
}

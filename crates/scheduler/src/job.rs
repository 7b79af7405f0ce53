//! Render jobs: one rasterization request for one cell
//!
//! A job captures everything it needs at submission time and is never
//! mutated afterwards. Execution re-checks the captured generation between
//! every step so superseded work stops as early as possible.

use crate::generation::Staleness;
use crate::orchestrator::{CellContent, CellGeometry};
use crate::pool::CellKey;
use crate::surface::{PresentedImage, Size, Surface};
use image::Rgba;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Result of executing a [`RenderJob`]
#[derive(Debug, Clone)]
pub enum RenderOutcome {
    /// Drawn and still current at the final check
    Finished(PresentedImage),

    /// Drawn, but superseded before the final check; must not be presented
    Stale(PresentedImage),

    /// No usable surface: went stale mid-draw, or the draw callback failed
    Aborted,
}

impl RenderOutcome {
    pub fn is_presentable(&self) -> bool {
        matches!(self, RenderOutcome::Finished(_))
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            RenderOutcome::Finished(_) => "finished",
            RenderOutcome::Stale(_) => "stale",
            RenderOutcome::Aborted => "aborted",
        }
    }
}

/// One rasterization request
pub struct RenderJob {
    key: CellKey,
    staleness: Staleness,
    geometry: CellGeometry,
    content: Arc<dyn CellContent>,
}

impl RenderJob {
    pub fn new(
        key: CellKey,
        staleness: Staleness,
        geometry: CellGeometry,
        content: Arc<dyn CellContent>,
    ) -> Self {
        Self {
            key,
            staleness,
            geometry,
            content,
        }
    }

    pub fn key(&self) -> CellKey {
        self.key
    }

    /// Generation captured when the job was built
    pub fn generation(&self) -> u64 {
        self.staleness.captured()
    }

    pub fn staleness(&self) -> &Staleness {
        &self.staleness
    }

    pub fn size(&self) -> Size {
        self.geometry.size
    }

    pub fn scale(&self) -> f32 {
        self.geometry.scale
    }

    pub fn is_opaque(&self) -> bool {
        self.geometry.opaque
    }

    pub fn background(&self) -> Option<Rgba<u8>> {
        self.geometry.background
    }

    pub fn content(&self) -> &Arc<dyn CellContent> {
        &self.content
    }

    /// Rasterize the cell
    ///
    /// Steps, each gated on the job still being current:
    /// 1. `will_draw` notification
    /// 2. allocate the surface and apply the opaque background
    /// 3. run the content's draw callback with the staleness predicate
    /// 4. drop the surface if the draw went stale
    /// 5. finalize the surface into an image
    /// 6. final check: finished cleanly, or finished but stale
    ///
    /// Panics and errors from the content, and surfaces too large to
    /// allocate, are reported as [`RenderOutcome::Aborted`].
    pub fn execute(&self) -> RenderOutcome {
        if self.staleness.is_stale() {
            return RenderOutcome::Aborted;
        }
        if !guard_callback(self.key, "will_draw", || self.content.will_draw()) {
            return RenderOutcome::Aborted;
        }

        if self.staleness.is_stale() {
            return RenderOutcome::Aborted;
        }
        let Some(mut surface) = Surface::with_background(
            self.geometry.size,
            self.geometry.scale,
            self.geometry.opaque,
            self.geometry.background,
        ) else {
            tracing::warn!(
                cell = %self.key,
                size = ?self.geometry.size,
                scale = self.geometry.scale,
                "surface too large to allocate"
            );
            return RenderOutcome::Aborted;
        };

        if self.staleness.is_stale() {
            return RenderOutcome::Aborted;
        }
        let drawn = panic::catch_unwind(AssertUnwindSafe(|| {
            self.content
                .draw(&mut surface, self.geometry.size, &self.staleness)
        }));
        match drawn {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(
                    cell = %self.key,
                    generation = self.generation(),
                    %err,
                    "draw aborted"
                );
                return RenderOutcome::Aborted;
            }
            Err(payload) => {
                tracing::warn!(cell = %self.key, panic = %panic_message(&payload), "draw panicked");
                return RenderOutcome::Aborted;
            }
        }

        if self.staleness.is_stale() {
            return RenderOutcome::Aborted;
        }
        let image = surface.finish();

        if self.staleness.is_stale() {
            RenderOutcome::Stale(image)
        } else {
            RenderOutcome::Finished(image)
        }
    }
}

impl fmt::Debug for RenderJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderJob")
            .field("key", &self.key)
            .field("generation", &self.generation())
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

/// Run a content lifecycle callback, containing any panic
///
/// Returns false if the callback panicked.
pub(crate) fn guard_callback(key: CellKey, callback: &str, f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            tracing::warn!(
                cell = %key,
                callback,
                panic = %panic_message(&payload),
                "content callback panicked"
            );
            false
        }
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

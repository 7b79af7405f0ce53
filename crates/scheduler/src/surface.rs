//! Off-screen drawing surfaces and the images they finalize into.

use image::{Pixel, Rgba, RgbaImage};
use std::sync::Arc;

/// Fill used under opaque cells when the host gives no fully opaque background.
pub const OPAQUE_UNDERFILL: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Largest width or height, in pixels, a surface may have
pub const MAX_SURFACE_DIMENSION: u32 = 16_384;

/// Logical size of a cell, in points (before pixel scale)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub const ZERO: Size = Size {
        width: 0.0,
        height: 0.0,
    };

    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// True when there is nothing to rasterize
    ///
    /// Zero, negative and non-finite dimensions all count as degenerate.
    pub fn is_degenerate(&self) -> bool {
        !(self.width.is_finite() && self.height.is_finite())
            || self.width <= 0.0
            || self.height <= 0.0
    }

    /// Pixel dimensions at the given scale (truncating)
    pub fn to_pixels(&self, scale: f32) -> (u32, u32) {
        (
            (self.width * scale).floor().max(0.0) as u32,
            (self.height * scale).floor().max(0.0) as u32,
        )
    }
}

/// RGBA8 raster a cell draws into
///
/// Drawing helpers take logical coordinates and apply the pixel scale.
/// Raw pixel access is available through [`Surface::image_mut`] for content
/// that rasterizes on its own.
pub struct Surface {
    image: RgbaImage,
    size: Size,
    scale: f32,
    opaque: bool,
}

impl Surface {
    /// Allocate a transparent surface of `size × scale` pixels
    ///
    /// Returns `None` when either pixel dimension exceeds
    /// [`MAX_SURFACE_DIMENSION`] or the buffer would not fit in memory.
    pub fn new(size: Size, scale: f32) -> Option<Self> {
        let (width, height) = size.to_pixels(scale);
        if width > MAX_SURFACE_DIMENSION || height > MAX_SURFACE_DIMENSION {
            return None;
        }
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(4)?;

        Some(Self {
            image: RgbaImage::new(width, height),
            size,
            scale,
            opaque: false,
        })
    }

    /// Allocate a surface and apply the background rule for opaque cells
    ///
    /// Opaque surfaces get a white underfill unless `background` is fully
    /// opaque, then `background` (if any) is blended over it. Returns `None`
    /// when the surface cannot be allocated.
    pub fn with_background(
        size: Size,
        scale: f32,
        opaque: bool,
        background: Option<Rgba<u8>>,
    ) -> Option<Self> {
        let mut surface = Self::new(size, scale)?;
        if opaque {
            surface.opaque = true;
            let needs_underfill = background.map_or(true, |bg| bg[3] < u8::MAX);
            if needs_underfill {
                surface.fill(OPAQUE_UNDERFILL);
            }
            if let Some(bg) = background {
                surface.fill(bg);
            }
        }
        Some(surface)
    }

    pub fn logical_size(&self) -> Size {
        self.size
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    /// Pixel dimensions `(width, height)`
    pub fn pixel_size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbaImage {
        &mut self.image
    }

    /// Blend `color` over the whole surface
    pub fn fill(&mut self, color: Rgba<u8>) {
        for pixel in self.image.pixels_mut() {
            pixel.blend(&color);
        }
    }

    /// Blend `color` over a rectangle given in logical units
    ///
    /// The rectangle is clipped to the surface.
    pub fn fill_rect(&mut self, x: f32, y: f32, width: f32, height: f32, color: Rgba<u8>) {
        let (max_x, max_y) = self.image.dimensions();
        let clamp = |v: f32, max: u32| (v * self.scale).round().clamp(0.0, max as f32) as u32;

        let x0 = clamp(x, max_x);
        let y0 = clamp(y, max_y);
        let x1 = clamp(x + width, max_x);
        let y1 = clamp(y + height, max_y);

        for py in y0..y1 {
            for px in x0..x1 {
                self.image.get_pixel_mut(px, py).blend(&color);
            }
        }
    }

    /// Finalize into a presentable image
    ///
    /// Opaque surfaces have their alpha channel forced to 255.
    pub fn finish(mut self) -> PresentedImage {
        if self.opaque {
            for pixel in self.image.pixels_mut() {
                pixel[3] = u8::MAX;
            }
        }
        PresentedImage {
            pixels: Arc::new(self.image),
            scale: self.scale,
        }
    }
}

/// Immutable rasterized content of a cell
///
/// Cheap to clone; the pixel buffer is shared.
#[derive(Debug, Clone)]
pub struct PresentedImage {
    pixels: Arc<RgbaImage>,
    scale: f32,
}

impl PresentedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Whether two handles share the same pixel buffer
    pub fn ptr_eq(&self, other: &PresentedImage) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

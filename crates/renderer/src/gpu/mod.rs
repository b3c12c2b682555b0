//! Capability interface the pipeline consumes from a graphics backend.
//!
//! Every submission returns a [`CompletionToken`]; textures are owned through
//! [`GpuTexture`], and a backend only frees memory when handed a [`Retired`]
//! proof that all tracked uses have resolved.

use std::time::{Duration, Instant};

use color::{ChromaSiting, ConversionModel, FieldSelect};
use image::RgbaImage;
use media_io::ChromaFormat;

use crate::deinterlace::FieldSync;
use crate::geometry::{Rect, RectF};
use crate::RendererError;

mod completion;
pub mod headless;
mod texture;
pub mod wgpu_device;

pub use completion::{completion_pair, CompletionSignal, CompletionToken};
pub use headless::{HeadlessConfig, HeadlessDevice, PresentRecord};
pub use texture::{GpuTexture, ReleaseQueue, Retired};
pub use wgpu_device::WgpuDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    R8,
    Rgba8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rgba8 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupTableIds {
    pub luma: TextureId,
    pub chroma_coarse: TextureId,
    pub chroma_error: TextureId,
}

/// Three plane textures plus everything needed to turn them into RGB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneSource {
    pub planes: [TextureId; 3],
    pub width: u32,
    pub height: u32,
    pub chroma: ChromaFormat,
    pub field: FieldSelect,
    pub model: ConversionModel,
    pub siting: ChromaSiting,
    /// `None` selects direct per-pixel compute.
    pub tables: Option<LookupTableIds>,
}

impl PlaneSource {
    /// Size of the image this source yields once the field is applied.
    pub fn image_size(&self) -> (u32, u32) {
        (self.width, self.field.rows(self.height))
    }
}

/// Converts a planar source into an RGBA target of matching size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvertPass {
    pub source: PlaneSource,
    pub target: TextureId,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawSource {
    Converted(TextureId),
    /// Convert while compositing, without an intermediate target.
    Planes(PlaneSource),
}

/// Display rows a draw may touch. `Odd` is rows 0, 2, 4...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineMask {
    #[default]
    All,
    Odd,
    Even,
}

impl LineMask {
    pub fn allows(self, row: u32) -> bool {
        match self {
            LineMask::All => true,
            LineMask::Odd => row % 2 == 0,
            LineMask::Even => row % 2 == 1,
        }
    }

    fn index(self) -> u32 {
        match self {
            LineMask::All => 0,
            LineMask::Odd => 1,
            LineMask::Even => 2,
        }
    }
}

/// Composites `src` (in source image pixels) into `dst` (display pixels).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawPass {
    pub source: DrawSource,
    pub src: RectF,
    pub dst: Rect,
    pub lines: LineMask,
    pub alpha: u8,
}

/// Field the display is currently scanning out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanField {
    Progressive,
    Odd,
    Even,
}

pub trait GpuDevice: Send + Sync {
    fn name(&self) -> &str;

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId, RendererError>;

    /// Frees a texture. Only reachable through [`GpuTexture`].
    fn destroy_texture(&self, retired: Retired);

    fn write_texture(
        &self,
        id: TextureId,
        data: &[u8],
        bytes_per_row: u32,
    ) -> Result<CompletionToken, RendererError>;

    fn fill_texture(&self, id: TextureId, value: [u8; 4]) -> Result<CompletionToken, RendererError>;

    fn convert(&self, pass: &ConvertPass) -> Result<CompletionToken, RendererError>;

    fn draw(&self, pass: &DrawPass) -> Result<CompletionToken, RendererError>;

    fn configure_display(&self, width: u32, height: u32) -> Result<(), RendererError>;

    fn display_size(&self) -> Option<(u32, u32)>;

    fn clear_display(&self, rgb: [u8; 3]) -> Result<CompletionToken, RendererError>;

    /// Blends a solid colour over the whole display.
    fn shade_display(&self, rgba: [u8; 4]) -> Result<CompletionToken, RendererError>;

    fn present(&self, field: FieldSync) -> Result<CompletionToken, RendererError>;

    fn read_display(&self) -> Result<RgbaImage, RendererError>;

    fn scan_field(&self) -> ScanField;

    /// Returns false if no vertical blank arrived within `timeout`.
    fn wait_for_vblank(&self, timeout: Duration) -> bool;

    fn wait_for(&self, token: &CompletionToken, timeout: Duration) -> bool {
        token.wait_timeout(timeout)
    }

    /// Binds the device to the calling thread before it submits work.
    fn make_current(&self) {}
}

/// Virtual refresh clock for backends without a physical scanout.
#[derive(Debug, Clone, Copy)]
pub struct VblankClock {
    epoch: Instant,
    period: Duration,
}

impl VblankClock {
    pub fn new(refresh_hz: f64) -> Self {
        let hz = if refresh_hz > 0.0 { refresh_hz } else { 60.0 };
        Self {
            epoch: Instant::now(),
            period: Duration::from_secs_f64(1.0 / hz),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn tick(&self, at: Instant) -> u128 {
        at.duration_since(self.epoch).as_nanos() / self.period.as_nanos().max(1)
    }

    pub fn wait_for_vblank(&self, timeout: Duration) -> bool {
        let now = Instant::now();
        let next = self.epoch + self.period * (self.tick(now) as u32 + 1);
        let wait = next.saturating_duration_since(now);
        if wait > timeout {
            std::thread::sleep(timeout);
            return false;
        }
        std::thread::sleep(wait);
        true
    }

    /// Alternates Odd/Even per refresh when `interlaced`.
    pub fn field(&self, interlaced: bool) -> ScanField {
        if !interlaced {
            return ScanField::Progressive;
        }
        if self.tick(Instant::now()) % 2 == 0 {
            ScanField::Odd
        } else {
            ScanField::Even
        }
    }
}

/// Clips a draw to a `width x height` target, shrinking the source rect in
/// proportion. Returns `None` when nothing is visible.
pub fn clip_to_target(src: RectF, dst: Rect, width: u32, height: u32) -> Option<(RectF, Rect)> {
    if dst.width == 0 || dst.height == 0 {
        return None;
    }
    let x0 = dst.x.max(0) as i64;
    let y0 = dst.y.max(0) as i64;
    let x1 = (dst.x as i64 + dst.width as i64).min(width as i64);
    let y1 = (dst.y as i64 + dst.height as i64).min(height as i64);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    let sx = src.width() / dst.width as f32;
    let sy = src.height() / dst.height as f32;
    let clipped_src = RectF {
        x0: src.x0 + (x0 - dst.x as i64) as f32 * sx,
        y0: src.y0 + (y0 - dst.y as i64) as f32 * sy,
        x1: src.x0 + (x1 - dst.x as i64) as f32 * sx,
        y1: src.y0 + (y1 - dst.y as i64) as f32 * sy,
    };
    let clipped_dst = Rect {
        x: x0 as i32,
        y: y0 as i32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    };
    Some((clipped_src, clipped_dst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_keeps_source_proportional() {
        let src = RectF::new(0.0, 0.0, 720.0, 480.0);
        let dst = Rect {
            x: -360,
            y: 0,
            width: 1440,
            height: 960,
        };
        let (s, d) = clip_to_target(src, dst, 720, 480).expect("visible");
        assert_eq!((d.x, d.y, d.width, d.height), (0, 0, 720, 480));
        assert!((s.x0 - 180.0).abs() < 1e-3 && (s.x1 - 540.0).abs() < 1e-3);
        assert!((s.y1 - 240.0).abs() < 1e-3);
    }

    #[test]
    fn offscreen_draw_is_dropped() {
        let src = RectF::new(0.0, 0.0, 10.0, 10.0);
        let dst = Rect {
            x: 800,
            y: 0,
            width: 10,
            height: 10,
        };
        assert!(clip_to_target(src, dst, 720, 480).is_none());
    }

    #[test]
    fn line_masks_pick_alternate_rows() {
        assert!(LineMask::Odd.allows(0) && !LineMask::Odd.allows(1));
        assert!(LineMask::Even.allows(3) && !LineMask::Even.allows(4));
        assert!(LineMask::All.allows(7));
    }

    #[test]
    fn vblank_wait_respects_timeout() {
        let clock = VblankClock::new(1.0);
        assert!(!clock.wait_for_vblank(Duration::from_millis(10)));
        assert_eq!(clock.field(false), ScanField::Progressive);
    }
}

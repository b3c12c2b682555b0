//! Video frame rendering pipeline: buffers decoded planar frames, converts
//! them to RGB on a graphics device, and paces their presentation, including
//! field-accurate output of interlaced sources.

use thiserror::Error;

pub mod context;
pub mod conversion;
pub mod deinterlace;
pub mod geometry;
pub mod gpu;
pub mod manager;
pub mod resources;
pub mod ring;
pub mod settings;
pub mod video_renderer;

pub use context::{DisplayGuard, DisplayMode, RenderingContext};
pub use conversion::{
    ConversionStrategy, LookupTableConversion, LowMemoryConversion, RenderMethod,
    SoftwareConversion,
};
pub use deinterlace::{DeinterlaceScheduler, FieldParity, FieldSync, InterlaceMethod, PresentStrategy};
pub use geometry::{DisplayCaps, Rect, RectF, Resolution, ResolutionClass, ViewMode};
pub use gpu::{GpuDevice, HeadlessConfig, HeadlessDevice, WgpuDevice};
pub use manager::{PresentStats, RenderManager};
pub use resources::GpuResourceManager;
pub use ring::{FrameBufferRing, SlotState};
pub use settings::RenderSettings;
pub use video_renderer::{ConfigureParams, OverlayRenderer, RenderFlags, VideoRenderer};

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("renderer is not configured")]
    NotConfigured,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("slot {0} is still in use by the presenter")]
    SlotBusy(usize),
    #[error("exclusive renderer access requested while holding the display lock")]
    LockOrder,
    #[error("unknown texture {0:?}")]
    UnknownTexture(gpu::TextureId),
    #[error("no suitable graphics adapter found")]
    NoAdapter,
    #[error("request device error: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
    #[error("buffer async error")]
    BufferAsync,
    #[error(transparent)]
    Color(#[from] color::ColorError),
    #[error(transparent)]
    Media(#[from] media_io::MediaError),
}

impl RendererError {
    /// Failures that leave a lower-capability rendering path available.
    pub fn is_allocation(&self) -> bool {
        matches!(
            self,
            RendererError::Allocation(_) | RendererError::Color(color::ColorError::Allocation { .. })
        )
    }
}

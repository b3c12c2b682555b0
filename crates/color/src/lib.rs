/// YUV to RGB conversion core
///
/// Two interchangeable per-pixel converters share one numeric contract:
/// [`DirectConverter`] evaluates the float transform, [`LookupTables`]
/// reconstructs it from coarse and error tables the GPU kernel samples.
use bytemuck::{Pod, Zeroable};
use media_io::MediaError;
use thiserror::Error;

pub mod coefficients;
pub mod direct;
pub mod frame;
pub mod lookup;
pub mod siting;

pub use coefficients::{CoefficientModel, ConversionModel, RangeModel, YuvCoefficients, YuvRange};
pub use direct::DirectConverter;
pub use frame::convert_frame;
pub use lookup::{LookupTables, SplitSample};
pub use siting::{ChromaSiting, FieldSelect};

#[derive(Debug, Error)]
pub enum ColorError {
    #[error("lookup table allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },
    #[error("invalid value range: {0}")]
    InvalidRange(String),
    #[error("lookup table holds {got} entries, {expected} required")]
    TableSize { expected: usize, got: usize },
    #[error("output buffer holds {got} bytes, {needed} required")]
    BufferTooSmall { needed: usize, got: usize },
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// One RGBA8 texel as uploaded to the GPU.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Texel {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Texel {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }
}

/// Per-pixel YUV to RGB mapping.
pub trait PixelConverter: Send + Sync {
    fn convert(&self, y: u8, u: u8, v: u8) -> [u8; 3];

    fn model(&self) -> ConversionModel;
}

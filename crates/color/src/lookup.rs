use glam::Vec3;
use tracing::debug;

use crate::coefficients::ConversionModel;
use crate::direct::{quantize_rgb, TransformParams};
use crate::{ColorError, PixelConverter, Texel};

/// Value represented by one coarse step.
pub const COARSE_STEP: f32 = 3.0;
/// Divisor applied to the error byte on reconstruction.
pub const ERROR_SCALE: f32 = 85.0;
/// The residual is quantized to this many levels per unit.
pub const ERROR_LEVELS: f32 = 8.0;
pub const LUMA_BIAS: i32 = 64;
pub const CHROMA_BIAS: i32 = 128;

pub const LUMA_ENTRIES: usize = 256;
pub const CHROMA_ENTRIES: usize = 256 * 256;

/// A value split into a coarse byte and a fractional error byte.
///
/// `value ≈ COARSE_STEP * (coarse - bias) + error / ERROR_SCALE`, with the
/// reconstruction never more than `1/ERROR_LEVELS` (plus rounding) below the
/// original and never meaningfully above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSample {
    pub coarse: u8,
    pub error: u8,
}

impl SplitSample {
    pub fn encode(value: f32, bias: i32) -> Self {
        let coarse = ((value / COARSE_STEP).floor() as i32 + bias).clamp(0, 255);
        let base = COARSE_STEP * (coarse - bias) as f32;
        let max_residual = COARSE_STEP - 1.0 / ERROR_LEVELS;
        let residual = (value - base).clamp(0.0, max_residual);
        let stepped = (residual * ERROR_LEVELS).floor() / ERROR_LEVELS;
        Self {
            coarse: coarse as u8,
            error: (stepped * ERROR_SCALE).round() as u8,
        }
    }

    pub fn decode(&self, bias: i32) -> f32 {
        COARSE_STEP * (self.coarse as i32 - bias) as f32 + self.error as f32 / ERROR_SCALE
    }
}

/// Luma and chroma contribution tables for one [`ConversionModel`].
///
/// The luma table is 256x1 with `(coarse, error)` in the red and green
/// channels. The two chroma tables are 256x256, indexed `v * 256 + u`, holding
/// the coarse and error parts of the R, G and B contributions.
#[derive(Debug, Clone)]
pub struct LookupTables {
    model: ConversionModel,
    luma: Vec<Texel>,
    chroma_coarse: Vec<Texel>,
    chroma_error: Vec<Texel>,
}

fn reserve(entries: usize) -> Result<Vec<Texel>, ColorError> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(entries)
        .map_err(|_| ColorError::Allocation {
            bytes: entries * std::mem::size_of::<Texel>(),
        })?;
    Ok(table)
}

impl LookupTables {
    pub const BYTES: usize = (LUMA_ENTRIES + 2 * CHROMA_ENTRIES) * std::mem::size_of::<Texel>();

    pub fn build(model: ConversionModel) -> Result<Self, ColorError> {
        model.range.range().validate()?;
        let params = TransformParams::new(model);

        let mut luma = reserve(LUMA_ENTRIES)?;
        let mut chroma_coarse = reserve(CHROMA_ENTRIES)?;
        let mut chroma_error = reserve(CHROMA_ENTRIES)?;

        for y in 0..LUMA_ENTRIES {
            let split = SplitSample::encode(params.luma_term(y as f32), LUMA_BIAS);
            luma.push(Texel::new(split.coarse, split.error, 0));
        }
        for v in 0..256 {
            for u in 0..256 {
                let terms = params.chroma_terms(u as f32, v as f32);
                let r = SplitSample::encode(terms.x, CHROMA_BIAS);
                let g = SplitSample::encode(terms.y, CHROMA_BIAS);
                let b = SplitSample::encode(terms.z, CHROMA_BIAS);
                chroma_coarse.push(Texel::new(r.coarse, g.coarse, b.coarse));
                chroma_error.push(Texel::new(r.error, g.error, b.error));
            }
        }

        debug!(
            model = model.coefficients.name(),
            range = ?model.range,
            bytes = Self::BYTES,
            "[lut] tables built"
        );
        Ok(Self {
            model,
            luma,
            chroma_coarse,
            chroma_error,
        })
    }

    /// Reassembles tables read back from texture storage.
    pub fn from_parts(
        model: ConversionModel,
        luma: Vec<Texel>,
        chroma_coarse: Vec<Texel>,
        chroma_error: Vec<Texel>,
    ) -> Result<Self, ColorError> {
        for (expected, got) in [
            (LUMA_ENTRIES, luma.len()),
            (CHROMA_ENTRIES, chroma_coarse.len()),
            (CHROMA_ENTRIES, chroma_error.len()),
        ] {
            if expected != got {
                return Err(ColorError::TableSize { expected, got });
            }
        }
        Ok(Self {
            model,
            luma,
            chroma_coarse,
            chroma_error,
        })
    }

    pub fn luma(&self) -> &[Texel] {
        &self.luma
    }

    pub fn chroma_coarse(&self) -> &[Texel] {
        &self.chroma_coarse
    }

    pub fn chroma_error(&self) -> &[Texel] {
        &self.chroma_error
    }

    pub fn luma_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.luma)
    }

    pub fn chroma_coarse_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.chroma_coarse)
    }

    pub fn chroma_error_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.chroma_error)
    }

    pub fn decode_luma(&self, y: u8) -> f32 {
        let t = self.luma[y as usize];
        SplitSample {
            coarse: t.r,
            error: t.g,
        }
        .decode(LUMA_BIAS)
    }

    pub fn decode_chroma(&self, u: u8, v: u8) -> Vec3 {
        let index = v as usize * 256 + u as usize;
        let c = self.chroma_coarse[index];
        let e = self.chroma_error[index];
        let part = |coarse, error| SplitSample { coarse, error }.decode(CHROMA_BIAS);
        Vec3::new(part(c.r, e.r), part(c.g, e.g), part(c.b, e.b))
    }
}

impl PixelConverter for LookupTables {
    fn convert(&self, y: u8, u: u8, v: u8) -> [u8; 3] {
        quantize_rgb(self.decode_luma(y), self.decode_chroma(u, v))
    }

    fn model(&self) -> ConversionModel {
        self.model
    }
}

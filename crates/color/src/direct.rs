use glam::Vec3;

use crate::coefficients::{ConversionModel, YuvCoefficients};
use crate::PixelConverter;

/// Constants of the per-pixel transform, resolved once per model.
#[derive(Debug, Clone, Copy)]
pub struct TransformParams {
    pub y_min: f32,
    pub u_min: f32,
    pub v_min: f32,
    pub y_span: f32,
    pub uv_span: f32,
    pub coefficients: YuvCoefficients,
}

impl TransformParams {
    pub fn new(model: ConversionModel) -> Self {
        let range = model.range.range();
        Self {
            y_min: range.y_min as f32,
            u_min: range.u_min as f32,
            v_min: range.v_min as f32,
            y_span: range.y_max as f32 - range.y_min as f32,
            uv_span: range.u_max as f32 - range.u_min as f32,
            coefficients: model.coefficients.coefficients(),
        }
    }

    /// `Y' = (Y - y_min) * Y_SCALE`, evaluated as `* 255 / span` so nominal
    /// white lands exactly on 255.
    pub fn luma_term(&self, y: f32) -> f32 {
        (y - self.y_min) * 255.0 / self.y_span
    }

    /// RGB contributions of a chroma pair.
    pub fn chroma_terms(&self, u: f32, v: f32) -> Vec3 {
        let u = (u - self.u_min) * 255.0 / self.uv_span - 127.5;
        let v = (v - self.v_min) * 255.0 / self.uv_span - 127.5;
        let c = &self.coefficients;
        Vec3::new(
            c.r_u * u + c.r_v * v,
            c.g_u * u + c.g_v * v,
            c.b_u * u + c.b_v * v,
        )
    }
}

/// Truncates after clamping to the displayable range.
pub fn quantize(value: f32) -> u8 {
    value.clamp(0.0, 255.0).floor() as u8
}

pub fn quantize_rgb(luma: f32, chroma: Vec3) -> [u8; 3] {
    let rgb = chroma + Vec3::splat(luma);
    [quantize(rgb.x), quantize(rgb.y), quantize(rgb.z)]
}

/// Float evaluation of the transform; the software fallback path.
#[derive(Debug, Clone, Copy)]
pub struct DirectConverter {
    model: ConversionModel,
    params: TransformParams,
}

impl DirectConverter {
    pub fn new(model: ConversionModel) -> Self {
        Self {
            model,
            params: TransformParams::new(model),
        }
    }

    pub fn params(&self) -> &TransformParams {
        &self.params
    }

    /// Converts with chroma already interpolated to a fractional value.
    pub fn convert_f32(&self, y: u8, u: f32, v: f32) -> [u8; 3] {
        quantize_rgb(self.params.luma_term(y as f32), self.params.chroma_terms(u, v))
    }
}

impl PixelConverter for DirectConverter {
    fn convert(&self, y: u8, u: u8, v: u8) -> [u8; 3] {
        self.convert_f32(y, u as f32, v as f32)
    }

    fn model(&self) -> ConversionModel {
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CoefficientModel, RangeModel};

    #[test]
    fn limited_range_white_and_black() {
        let conv = DirectConverter::new(ConversionModel::default());
        assert_eq!(conv.convert(235, 128, 128), [255, 255, 255]);
        assert_eq!(conv.convert(16, 128, 128), [0, 0, 0]);
    }

    #[test]
    fn neutral_chroma_is_grey() {
        let conv = DirectConverter::new(ConversionModel::new(
            CoefficientModel::Bt709,
            RangeModel::Full,
        ));
        let [r, g, b] = conv.convert(100, 128, 128);
        // 127.5 neutral point leaves a half-step tilt on every channel
        assert!(r.abs_diff(100) <= 1 && g.abs_diff(100) <= 1 && b.abs_diff(100) <= 1);
    }

    #[test]
    fn out_of_range_inputs_clamp() {
        for model in [
            CoefficientModel::Bt601,
            CoefficientModel::Bt709,
            CoefficientModel::Ebu,
            CoefficientModel::Smpte240m,
        ] {
            let conv = DirectConverter::new(ConversionModel::new(model, RangeModel::Limited));
            for (y, u, v) in [(0, 0, 0), (255, 255, 255), (0, 255, 0), (255, 0, 255)] {
                // u8 output cannot leave [0,255]; check saturation direction instead
                let rgb = conv.convert(y, u, v);
                if y == 255 && u == 255 && v == 255 {
                    assert_eq!(rgb[0], 255);
                }
                if y == 0 && u == 0 && v == 0 {
                    assert_eq!(rgb[2], 0);
                }
            }
        }
    }

    #[test]
    fn quantize_truncates() {
        assert_eq!(quantize(12.99), 12);
        assert_eq!(quantize(-40.0), 0);
        assert_eq!(quantize(300.0), 255);
    }
}

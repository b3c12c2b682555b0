use serde::{Deserialize, Serialize};

use crate::ColorError;

/// Chroma weights in the order `{R_Up, R_Vp, G_Up, G_Vp, B_Up, B_Vp}`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YuvCoefficients {
    pub r_u: f32,
    pub r_v: f32,
    pub g_u: f32,
    pub g_v: f32,
    pub b_u: f32,
    pub b_v: f32,
}

impl YuvCoefficients {
    const fn from_array(c: [f32; 6]) -> Self {
        Self {
            r_u: c[0],
            r_v: c[1],
            g_u: c[2],
            g_v: c[3],
            b_u: c[4],
            b_v: c[5],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoefficientModel {
    #[default]
    Bt601,
    Bt709,
    Ebu,
    Smpte240m,
}

impl CoefficientModel {
    pub fn coefficients(self) -> YuvCoefficients {
        match self {
            Self::Bt601 => YuvCoefficients::from_array([0.0, 1.403, -0.344, -0.714, 1.773, 0.0]),
            Self::Bt709 => {
                YuvCoefficients::from_array([0.0, 1.5701, -0.1870, -0.4664, 1.8556, 0.0])
            }
            Self::Ebu => YuvCoefficients::from_array([0.0, 1.140, -0.396, -0.581, 2.029, 0.0]),
            Self::Smpte240m => {
                YuvCoefficients::from_array([0.0, 1.5756, -0.2253, -0.5000, 1.8270, 0.0])
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Bt601 => "BT.601",
            Self::Bt709 => "BT.709",
            Self::Ebu => "EBU",
            Self::Smpte240m => "SMPTE 240M",
        }
    }
}

/// Nominal code value range of each channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YuvRange {
    pub y_min: u8,
    pub y_max: u8,
    pub u_min: u8,
    pub u_max: u8,
    pub v_min: u8,
    pub v_max: u8,
}

impl YuvRange {
    pub fn validate(&self) -> Result<(), ColorError> {
        if self.y_max <= self.y_min || self.u_max <= self.u_min || self.v_max <= self.v_min {
            return Err(ColorError::InvalidRange(format!("{self:?}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RangeModel {
    #[default]
    Limited,
    Full,
}

impl RangeModel {
    pub fn range(self) -> YuvRange {
        match self {
            Self::Limited => YuvRange {
                y_min: 16,
                y_max: 235,
                u_min: 16,
                u_max: 240,
                v_min: 16,
                v_max: 240,
            },
            Self::Full => YuvRange {
                y_min: 0,
                y_max: 255,
                u_min: 0,
                u_max: 255,
                v_min: 0,
                v_max: 255,
            },
        }
    }
}

/// The coefficient/range pair that fully determines a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConversionModel {
    pub coefficients: CoefficientModel,
    pub range: RangeModel,
}

impl ConversionModel {
    pub fn new(coefficients: CoefficientModel, range: RangeModel) -> Self {
        Self {
            coefficients,
            range,
        }
    }

    pub fn y_scale(&self) -> f32 {
        let r = self.range.range();
        255.0 / (r.y_max as f32 - r.y_min as f32)
    }

    pub fn uv_scale(&self) -> f32 {
        let r = self.range.range();
        255.0 / (r.u_max as f32 - r.u_min as f32)
    }

    /// The YUV encoding of black, used to clear freshly allocated planes.
    pub fn black(&self) -> [u8; 3] {
        [self.range.range().y_min, 128, 128]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limited_range_scales() {
        let model = ConversionModel::default();
        assert!((model.y_scale() - 255.0 / 219.0).abs() < 1e-6);
        assert!((model.uv_scale() - 255.0 / 224.0).abs() < 1e-6);
        assert_eq!(model.black(), [16, 128, 128]);
    }

    #[test]
    fn full_range_is_identity_scale() {
        let model = ConversionModel::new(CoefficientModel::Bt709, RangeModel::Full);
        assert_eq!(model.y_scale(), 1.0);
        assert_eq!(model.black(), [0, 128, 128]);
        assert!(model.range.range().validate().is_ok());
    }

    #[test]
    fn models_round_trip_through_json() {
        let model = ConversionModel::new(CoefficientModel::Smpte240m, RangeModel::Full);
        let json = serde_json::to_string(&model).expect("serialize");
        assert!(json.contains("smpte240m"));
        let back: ConversionModel = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, model);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut range = RangeModel::Limited.range();
        range.y_max = range.y_min;
        assert!(matches!(range.validate(), Err(ColorError::InvalidRange(_))));
    }
}

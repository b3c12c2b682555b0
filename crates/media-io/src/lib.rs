use serde::{Deserialize, Serialize};
use thiserror::Error;

mod pattern;
mod planar;

pub use pattern::{DecodedFrame, FrameSource, PatternKind, TestPatternSource};
pub use planar::{ChromaFormat, Plane, PlaneKind, PlanarFrame, SliceExtent, SliceRef};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("invalid frame geometry: {0}")]
    InvalidGeometry(String),
    #[error("slice out of bounds: {0}")]
    SliceOutOfBounds(String),
    #[error("allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },
    #[error("source exhausted")]
    Exhausted,
}

/// Field layout declared by the decoder for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FieldOrder {
    #[default]
    Progressive,
    TopFirst,
    BottomFirst,
}

impl FieldOrder {
    pub fn is_interlaced(self) -> bool {
        !matches!(self, FieldOrder::Progressive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const PAL: FrameRate = FrameRate { num: 25, den: 1 };
    pub const NTSC: FrameRate = FrameRate {
        num: 30000,
        den: 1001,
    };

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    pub fn frame_duration_secs(&self) -> f64 {
        let fps = self.as_f64();
        if fps > 0.0 {
            1.0 / fps
        } else {
            1.0 / 25.0
        }
    }
}

impl std::str::FromStr for FrameRate {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_rate(s)
            .map(|(num, den)| FrameRate { num, den })
            .ok_or_else(|| MediaError::InvalidGeometry(format!("unparseable frame rate '{s}'")))
    }
}

/// Parses `30000/1001`, `25/1` or a bare integer rate.
pub fn parse_rate(s: &str) -> Option<(u32, u32)> {
    let s = s.trim();
    if s == "0/0" || s == "0" || s.is_empty() {
        return None;
    }
    if let Some((a, b)) = s.split_once('/') {
        let num = a.trim().parse().ok()?;
        let den = b.trim().parse().ok()?;
        if den == 0 {
            return None;
        }
        return Some((num, den));
    }
    let v: u32 = s.parse().ok()?;
    Some((v, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fractional_and_integer_rates() {
        assert_eq!(parse_rate("30000/1001"), Some((30000, 1001)));
        assert_eq!(parse_rate(" 25 "), Some((25, 1)));
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("24/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }

    #[test]
    fn frame_duration_falls_back_for_zero_rate() {
        let rate = FrameRate { num: 0, den: 1 };
        assert!((rate.frame_duration_secs() - 0.04).abs() < 1e-9);
        let ntsc: FrameRate = "30000/1001".parse().expect("rate");
        assert!((ntsc.as_f64() - 29.97).abs() < 0.01);
    }
}

use tracing::debug;

use crate::planar::{ChromaFormat, PlaneKind, PlanarFrame};
use crate::{FieldOrder, FrameRate, MediaError};

/// 75% colour bars, BT.601 limited range.
const BARS: [[u8; 3]; 7] = [
    [180, 128, 128],
    [162, 44, 142],
    [131, 156, 44],
    [112, 72, 58],
    [84, 184, 198],
    [65, 100, 212],
    [35, 212, 114],
];

/// A decoded picture plus the timing the decoder attached to it.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame: PlanarFrame,
    pub pts: f64,
    pub field: FieldOrder,
}

/// Anything that produces decoded YUV frames in presentation order.
pub trait FrameSource: Send {
    fn format(&self) -> (u32, u32, ChromaFormat);
    fn rate(&self) -> FrameRate;
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, MediaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    ColourBars,
    /// A single YUV triple across the frame.
    Flat([u8; 3]),
}

/// Synthetic decoder used by the harness and tests.
///
/// Colour bars carry a moving white box so successive frames differ; when the
/// source is interlaced the box in the second field is drawn half a step
/// further along, so each field has distinct content.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    chroma: ChromaFormat,
    rate: FrameRate,
    field: FieldOrder,
    kind: PatternKind,
    remaining: Option<u64>,
    index: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, rate: FrameRate, kind: PatternKind) -> Self {
        Self {
            width,
            height,
            chroma: ChromaFormat::YUV420,
            rate,
            field: FieldOrder::Progressive,
            kind,
            remaining: None,
            index: 0,
        }
    }

    pub fn with_field_order(mut self, field: FieldOrder) -> Self {
        self.field = field;
        self
    }

    pub fn with_chroma(mut self, chroma: ChromaFormat) -> Self {
        self.chroma = chroma;
        self
    }

    pub fn with_limit(mut self, frames: u64) -> Self {
        self.remaining = Some(frames);
        self
    }

    fn render(&self) -> Result<PlanarFrame, MediaError> {
        let mut frame = PlanarFrame::new(self.width, self.height, self.chroma)?;
        match self.kind {
            PatternKind::Flat([y, u, v]) => frame.fill(y, u, v),
            PatternKind::ColourBars => {
                self.draw_bars(&mut frame);
                self.draw_box(&mut frame);
            }
        }
        Ok(frame)
    }

    fn draw_bars(&self, frame: &mut PlanarFrame) {
        for kind in PlaneKind::ALL {
            let plane = frame.plane_mut(kind);
            let width = plane.width();
            for y in 0..plane.height() {
                for (x, px) in plane.row_mut(y).iter_mut().enumerate() {
                    let bar = (x as u32 * BARS.len() as u32 / width) as usize;
                    *px = BARS[bar.min(BARS.len() - 1)][kind.index()];
                }
            }
        }
    }

    fn draw_box(&self, frame: &mut PlanarFrame) {
        let size = (self.height / 8).max(2);
        let travel = self.width.saturating_sub(size).max(1);
        let step = (self.width / 64).max(2) as u64;
        let luma = frame.plane_mut(PlaneKind::Luma);
        let top = (self.height - size.min(self.height)) / 2;
        for y in top..(top + size).min(self.height) {
            let late_field = match self.field {
                FieldOrder::Progressive => false,
                FieldOrder::TopFirst => y % 2 == 1,
                FieldOrder::BottomFirst => y % 2 == 0,
            };
            let pos = self.index * step * 2 + if late_field { step } else { 0 };
            let left = (pos % travel as u64) as u32;
            let row = luma.row_mut(y);
            for px in &mut row[left as usize..(left + size).min(self.width) as usize] {
                *px = 235;
            }
        }
    }
}

impl FrameSource for TestPatternSource {
    fn format(&self) -> (u32, u32, ChromaFormat) {
        (self.width, self.height, self.chroma)
    }

    fn rate(&self) -> FrameRate {
        self.rate
    }

    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, MediaError> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }
        let frame = self.render()?;
        let pts = self.index as f64 * self.rate.frame_duration_secs();
        debug!(index = self.index, pts, "[pattern] frame generated");
        self.index += 1;
        Ok(Some(DecodedFrame {
            frame,
            pts,
            field: self.field,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bars_start_white_and_end_blue() {
        let mut src = TestPatternSource::new(140, 80, FrameRate::PAL, PatternKind::ColourBars);
        let frame = src.next_frame().expect("frame").expect("some").frame;
        assert_eq!(frame.pixel(0, 0), BARS[0]);
        assert_eq!(frame.pixel(139, 0), BARS[6]);
    }

    #[test]
    fn limit_exhausts_source() {
        let mut src =
            TestPatternSource::new(32, 16, FrameRate::NTSC, PatternKind::Flat([16, 128, 128]))
                .with_limit(2);
        let first = src.next_frame().expect("first").expect("some");
        assert_eq!(first.frame.pixel(5, 5), [16, 128, 128]);
        let second = src.next_frame().expect("second").expect("some");
        assert!(second.pts > first.pts);
        assert!(src.next_frame().expect("third").is_none());
    }

    #[test]
    fn interlaced_fields_differ() {
        let mut src = TestPatternSource::new(256, 64, FrameRate::PAL, PatternKind::ColourBars)
            .with_field_order(FieldOrder::TopFirst);
        let decoded = src.next_frame().expect("frame").expect("some");
        let luma = decoded.frame.plane(PlaneKind::Luma);
        let mid = 32 - (32 % 2);
        assert_ne!(luma.row(mid), luma.row(mid + 1));
        assert_eq!(decoded.field, FieldOrder::TopFirst);
    }
}

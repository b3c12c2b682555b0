use media_io::{ChromaFormat, Plane};
use serde::{Deserialize, Serialize};

/// Which rows of the source a conversion reads.
///
/// `Odd` is the field made of rows 0, 2, 4... (first line counted as 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FieldSelect {
    #[default]
    Full,
    Odd,
    Even,
}

impl FieldSelect {
    /// Number of output rows for a source of `height` rows.
    pub fn rows(self, height: u32) -> u32 {
        match self {
            FieldSelect::Full => height,
            FieldSelect::Odd => (height + 1) / 2,
            FieldSelect::Even => height / 2,
        }
    }

    /// Source row for output row `row`.
    pub fn source_row(self, row: u32) -> u32 {
        match self {
            FieldSelect::Full => row,
            FieldSelect::Odd => row * 2,
            FieldSelect::Even => row * 2 + 1,
        }
    }
}

/// Chroma re-centering offsets, in chroma samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChromaSiting {
    pub horizontal: f32,
    pub field_vertical: f32,
}

impl Default for ChromaSiting {
    fn default() -> Self {
        Self {
            horizontal: 0.25,
            field_vertical: 0.125,
        }
    }
}

impl ChromaSiting {
    /// Position of the chroma sample for luma pixel `(x, row)` in texel
    /// space, where texel `i` is centred on `i + 0.5`.
    pub fn chroma_position(
        &self,
        format: ChromaFormat,
        field: FieldSelect,
        x: u32,
        row: u32,
    ) -> (f32, f32) {
        let mut cx = (x as f32 + 0.5) / (1u32 << format.shift_x) as f32;
        if format.shift_x > 0 {
            cx += self.horizontal;
        }
        let mut cy = (row as f32 + 0.5) / (1u32 << format.shift_y) as f32;
        if format.shift_y > 0 {
            cy += match field {
                FieldSelect::Full => 0.0,
                FieldSelect::Odd => self.field_vertical,
                FieldSelect::Even => -self.field_vertical,
            };
        }
        (cx, cy)
    }
}

/// Bilinear sample with edge clamping, rounded to the nearest code value.
pub fn sample_bilinear(plane: &Plane, cx: f32, cy: f32) -> u8 {
    let tx = cx - 0.5;
    let ty = cy - 0.5;
    let x0 = tx.floor();
    let y0 = ty.floor();
    let fx = tx - x0;
    let fy = ty - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);
    let s = |x, y| plane.sample(x, y) as f32;
    let top = s(x0, y0) * (1.0 - fx) + s(x0 + 1, y0) * fx;
    let bottom = s(x0, y0 + 1) * (1.0 - fx) + s(x0 + 1, y0 + 1) * fx;
    let value = top * (1.0 - fy) + bottom * fy;
    (value + 0.5).floor().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_luma_columns_are_cosited() {
        let siting = ChromaSiting::default();
        let (cx, _) = siting.chroma_position(ChromaFormat::YUV420, FieldSelect::Full, 4, 0);
        assert_eq!(cx, 2.5);
        let (cx, _) = siting.chroma_position(ChromaFormat::YUV420, FieldSelect::Full, 5, 0);
        assert_eq!(cx, 3.0);
    }

    #[test]
    fn field_offsets_move_in_opposite_directions() {
        let siting = ChromaSiting::default();
        let (_, full) = siting.chroma_position(ChromaFormat::YUV420, FieldSelect::Full, 0, 4);
        let (_, odd) = siting.chroma_position(ChromaFormat::YUV420, FieldSelect::Odd, 0, 4);
        let (_, even) = siting.chroma_position(ChromaFormat::YUV420, FieldSelect::Even, 0, 4);
        assert!((odd - full - 0.125).abs() < 1e-6);
        assert!((full - even - 0.125).abs() < 1e-6);
    }

    #[test]
    fn no_offsets_without_subsampling() {
        let siting = ChromaSiting::default();
        let pos = siting.chroma_position(ChromaFormat::YUV444, FieldSelect::Odd, 3, 3);
        assert_eq!(pos, (3.5, 3.5));
    }

    #[test]
    fn bilinear_midpoint_rounds() {
        let mut plane = Plane::new(2, 1).expect("plane");
        plane.row_mut(0).copy_from_slice(&[10, 21]);
        assert_eq!(sample_bilinear(&plane, 1.0, 0.5), 16);
        assert_eq!(sample_bilinear(&plane, 0.5, 0.5), 10);
        assert_eq!(sample_bilinear(&plane, -3.0, 9.0), 10);
    }

    #[test]
    fn field_rows_partition_the_frame() {
        assert_eq!(FieldSelect::Odd.rows(481) + FieldSelect::Even.rows(481), 481);
        assert_eq!(FieldSelect::Even.source_row(2), 5);
    }
}

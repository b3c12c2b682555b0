use serde::{Deserialize, Serialize};

use crate::MediaError;

/// Row alignment applied to every plane allocation.
pub const PLANE_ALIGNMENT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaneKind {
    Luma,
    ChromaU,
    ChromaV,
}

impl PlaneKind {
    pub const ALL: [PlaneKind; 3] = [PlaneKind::Luma, PlaneKind::ChromaU, PlaneKind::ChromaV];

    pub fn index(self) -> usize {
        match self {
            PlaneKind::Luma => 0,
            PlaneKind::ChromaU => 1,
            PlaneKind::ChromaV => 2,
        }
    }

    pub fn is_chroma(self) -> bool {
        !matches!(self, PlaneKind::Luma)
    }
}

/// Chroma subsampling expressed as right shifts of the luma dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChromaFormat {
    pub shift_x: u8,
    pub shift_y: u8,
}

impl ChromaFormat {
    pub const YUV420: ChromaFormat = ChromaFormat {
        shift_x: 1,
        shift_y: 1,
    };
    pub const YUV422: ChromaFormat = ChromaFormat {
        shift_x: 1,
        shift_y: 0,
    };
    pub const YUV444: ChromaFormat = ChromaFormat {
        shift_x: 0,
        shift_y: 0,
    };

    /// Dimensions of `kind` for a `width x height` frame. Odd sizes round up.
    pub fn plane_size(self, kind: PlaneKind, width: u32, height: u32) -> (u32, u32) {
        if kind.is_chroma() {
            (
                shift_ceil(width, self.shift_x),
                shift_ceil(height, self.shift_y),
            )
        } else {
            (width, height)
        }
    }
}

impl Default for ChromaFormat {
    fn default() -> Self {
        ChromaFormat::YUV420
    }
}

fn shift_ceil(value: u32, shift: u8) -> u32 {
    let mask = (1u32 << shift) - 1;
    (value + mask) >> shift
}

/// One 8-bit sample plane with row padding.
#[derive(Debug, Clone)]
pub struct Plane {
    data: Vec<u8>,
    stride: usize,
    width: u32,
    height: u32,
}

impl Plane {
    pub fn new(width: u32, height: u32) -> Result<Self, MediaError> {
        if width == 0 || height == 0 {
            return Err(MediaError::InvalidGeometry(format!(
                "plane {width}x{height} has a zero dimension"
            )));
        }
        let stride = align_up(width as usize, PLANE_ALIGNMENT);
        let bytes = stride * height as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| MediaError::Allocation { bytes })?;
        data.resize(bytes, 0);
        Ok(Self {
            data,
            stride,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.width as usize]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride;
        let width = self.width as usize;
        &mut self.data[start..start + width]
    }

    /// Sample with edge clamping.
    pub fn sample(&self, x: i64, y: i64) -> u8 {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.data[y * self.stride + x]
    }

    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }

    /// Copies `w x h` samples from `src` (rows `src_stride` apart) to `(x, y)`.
    pub fn copy_rows(
        &mut self,
        src: &[u8],
        src_stride: usize,
        w: u32,
        h: u32,
        x: u32,
        y: u32,
    ) -> Result<(), MediaError> {
        if w == 0 || h == 0 {
            return Ok(());
        }
        if x + w > self.width || y + h > self.height {
            return Err(MediaError::SliceOutOfBounds(format!(
                "{w}x{h} at ({x},{y}) exceeds plane {}x{}",
                self.width, self.height
            )));
        }
        let needed = (h as usize - 1) * src_stride + w as usize;
        if src_stride < w as usize || src.len() < needed {
            return Err(MediaError::SliceOutOfBounds(format!(
                "source holds {} bytes, {needed} required (stride {src_stride})",
                src.len()
            )));
        }
        for row in 0..h as usize {
            let s = row * src_stride;
            let d = (y as usize + row) * self.stride + x as usize;
            self.data[d..d + w as usize].copy_from_slice(&src[s..s + w as usize]);
        }
        Ok(())
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

/// A horizontal band of decoded samples handed over by the decoder.
#[derive(Debug, Clone, Copy)]
pub struct SliceRef<'a> {
    pub planes: [&'a [u8]; 3],
    pub strides: [usize; 3],
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

/// Luma rows touched by a slice copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceExtent {
    pub first_row: u32,
    pub end_row: u32,
}

impl SliceExtent {
    pub fn reaches(&self, height: u32) -> bool {
        self.end_row >= height
    }
}

/// Three-plane YUV image owned by a frame buffer slot.
#[derive(Debug, Clone)]
pub struct PlanarFrame {
    planes: [Plane; 3],
    width: u32,
    height: u32,
    chroma: ChromaFormat,
}

impl PlanarFrame {
    pub fn new(width: u32, height: u32, chroma: ChromaFormat) -> Result<Self, MediaError> {
        if width == 0 || height == 0 {
            return Err(MediaError::InvalidGeometry(format!(
                "frame {width}x{height} has a zero dimension"
            )));
        }
        let (cw, ch) = chroma.plane_size(PlaneKind::ChromaU, width, height);
        Ok(Self {
            planes: [
                Plane::new(width, height)?,
                Plane::new(cw, ch)?,
                Plane::new(cw, ch)?,
            ],
            width,
            height,
            chroma,
        })
    }

    /// Builds a frame filled with a single YUV triple.
    pub fn solid(
        width: u32,
        height: u32,
        chroma: ChromaFormat,
        yuv: [u8; 3],
    ) -> Result<Self, MediaError> {
        let mut frame = Self::new(width, height, chroma)?;
        frame.fill(yuv[0], yuv[1], yuv[2]);
        Ok(frame)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chroma(&self) -> ChromaFormat {
        self.chroma
    }

    pub fn plane(&self, kind: PlaneKind) -> &Plane {
        &self.planes[kind.index()]
    }

    pub fn plane_mut(&mut self, kind: PlaneKind) -> &mut Plane {
        &mut self.planes[kind.index()]
    }

    pub fn fill(&mut self, y: u8, u: u8, v: u8) {
        self.planes[0].fill(y);
        self.planes[1].fill(u);
        self.planes[2].fill(v);
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let cx = (x >> self.chroma.shift_x) as i64;
        let cy = (y >> self.chroma.shift_y) as i64;
        [
            self.planes[0].sample(x as i64, y as i64),
            self.planes[1].sample(cx, cy),
            self.planes[2].sample(cx, cy),
        ]
    }

    /// Copies a decoder slice into the frame. Chroma coordinates are derived
    /// from the luma rectangle through the subsampling shifts.
    pub fn draw_slice(&mut self, slice: &SliceRef<'_>) -> Result<SliceExtent, MediaError> {
        if slice.x + slice.width > self.width || slice.y + slice.height > self.height {
            return Err(MediaError::SliceOutOfBounds(format!(
                "slice {}x{} at ({},{}) exceeds frame {}x{}",
                slice.width, slice.height, slice.x, slice.y, self.width, self.height
            )));
        }
        self.planes[0].copy_rows(
            slice.planes[0],
            slice.strides[0],
            slice.width,
            slice.height,
            slice.x,
            slice.y,
        )?;

        let cx0 = slice.x >> self.chroma.shift_x;
        let cy0 = slice.y >> self.chroma.shift_y;
        let cx1 = shift_ceil(slice.x + slice.width, self.chroma.shift_x);
        let cy1 = shift_ceil(slice.y + slice.height, self.chroma.shift_y);
        for kind in [PlaneKind::ChromaU, PlaneKind::ChromaV] {
            let plane = &mut self.planes[kind.index()];
            let cw = cx1.min(plane.width()) - cx0;
            let ch = cy1.min(plane.height()) - cy0;
            plane.copy_rows(
                slice.planes[kind.index()],
                slice.strides[kind.index()],
                cw,
                ch,
                cx0,
                cy0,
            )?;
        }

        Ok(SliceExtent {
            first_row: slice.y,
            end_row: slice.y + slice.height,
        })
    }

    /// Borrows rows `y..y+h` of every plane as a slice, as a decoder would
    /// deliver them.
    pub fn slice(&self, y: u32, h: u32) -> SliceRef<'_> {
        let h = h.min(self.height.saturating_sub(y));
        let cy = (y >> self.chroma.shift_y) as usize;
        let offsets = [
            y as usize * self.planes[0].stride(),
            cy * self.planes[1].stride(),
            cy * self.planes[2].stride(),
        ];
        SliceRef {
            planes: [
                &self.planes[0].data()[offsets[0]..],
                &self.planes[1].data()[offsets[1]..],
                &self.planes[2].data()[offsets[2]..],
            ],
            strides: [
                self.planes[0].stride(),
                self.planes[1].stride(),
                self.planes[2].stride(),
            ],
            width: self.width,
            height: h,
            x: 0,
            y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420_chroma_planes_round_up() {
        let frame = PlanarFrame::new(721, 481, ChromaFormat::YUV420).expect("frame");
        assert_eq!(frame.plane(PlaneKind::ChromaU).width(), 361);
        assert_eq!(frame.plane(PlaneKind::ChromaV).height(), 241);
        assert_eq!(frame.plane(PlaneKind::Luma).stride() % PLANE_ALIGNMENT, 0);
    }

    #[test]
    fn zero_sized_frame_is_rejected() {
        assert!(matches!(
            PlanarFrame::new(0, 480, ChromaFormat::YUV420),
            Err(MediaError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn slices_reassemble_the_source() {
        let mut src = PlanarFrame::new(64, 32, ChromaFormat::YUV420).expect("src");
        for y in 0..32 {
            for (x, px) in src.plane_mut(PlaneKind::Luma).row_mut(y).iter_mut().enumerate() {
                *px = (x as u32 * 3 + y) as u8;
            }
        }
        src.plane_mut(PlaneKind::ChromaU).fill(90);
        src.plane_mut(PlaneKind::ChromaV).fill(200);

        let mut dst = PlanarFrame::new(64, 32, ChromaFormat::YUV420).expect("dst");
        let mut last = None;
        for y in (0..32).step_by(8) {
            last = Some(dst.draw_slice(&src.slice(y, 8)).expect("slice"));
        }
        assert!(last.expect("extent").reaches(32));
        for y in 0..32 {
            assert_eq!(
                src.plane(PlaneKind::Luma).row(y),
                dst.plane(PlaneKind::Luma).row(y)
            );
        }
        assert_eq!(dst.pixel(10, 10), [src.pixel(10, 10)[0], 90, 200]);
    }

    #[test]
    fn slice_past_the_bottom_edge_fails() {
        let src = PlanarFrame::new(16, 16, ChromaFormat::YUV420).expect("src");
        let mut dst = PlanarFrame::new(16, 8, ChromaFormat::YUV420).expect("dst");
        let err = dst.draw_slice(&src.slice(0, 16)).unwrap_err();
        assert!(matches!(err, MediaError::SliceOutOfBounds(_)));
    }

    #[test]
    fn short_source_buffer_is_reported() {
        let mut plane = Plane::new(8, 4).expect("plane");
        let err = plane.copy_rows(&[0u8; 10], 8, 8, 4, 0, 0).unwrap_err();
        assert!(matches!(err, MediaError::SliceOutOfBounds(_)));
    }
}

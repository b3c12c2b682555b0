use media_io::{PlaneKind, PlanarFrame};

use crate::siting::{sample_bilinear, ChromaSiting, FieldSelect};
use crate::{ColorError, PixelConverter};

/// Converts `frame` into tightly packed RGBA8 rows in `out`.
///
/// Field selections produce a half-height image from the rows of that field.
/// Returns the output dimensions.
pub fn convert_frame(
    frame: &PlanarFrame,
    converter: &dyn PixelConverter,
    field: FieldSelect,
    siting: &ChromaSiting,
    out: &mut [u8],
) -> Result<(u32, u32), ColorError> {
    let width = frame.width();
    let rows = field.rows(frame.height());
    let needed = width as usize * rows as usize * 4;
    if out.len() < needed {
        return Err(ColorError::BufferTooSmall {
            needed,
            got: out.len(),
        });
    }

    let luma = frame.plane(PlaneKind::Luma);
    let u_plane = frame.plane(PlaneKind::ChromaU);
    let v_plane = frame.plane(PlaneKind::ChromaV);
    let format = frame.chroma();

    for (row, dst) in out[..needed]
        .chunks_exact_mut(width as usize * 4)
        .enumerate()
    {
        let src_row = field.source_row(row as u32);
        let luma_row = luma.row(src_row);
        for (x, px) in dst.chunks_exact_mut(4).enumerate() {
            let (cx, cy) = siting.chroma_position(format, field, x as u32, src_row);
            let u = sample_bilinear(u_plane, cx, cy);
            let v = sample_bilinear(v_plane, cx, cy);
            let [r, g, b] = converter.convert(luma_row[x], u, v);
            px.copy_from_slice(&[r, g, b, 255]);
        }
    }
    Ok((width, rows))
}

//! CPU backend. Composites into an in-memory display and records what the
//! pipeline asked of it, which makes it the device of choice for tests and
//! for the harness when no adapter is available.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use color::{
    convert_frame, DirectConverter, LookupTables, PixelConverter, Texel,
};
use image::{Rgba, RgbaImage};
use media_io::{PlaneKind, PlanarFrame};
use parking_lot::Mutex;
use tracing::{error, trace};

use super::{
    clip_to_target, completion_pair, CompletionSignal, CompletionToken, ConvertPass, DrawPass,
    DrawSource, GpuDevice, PlaneSource, Retired, ScanField, TextureDesc, TextureFormat,
    TextureId, VblankClock,
};
use crate::deinterlace::FieldSync;
use crate::RendererError;

#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub refresh_hz: f64,
    /// Report alternating scan fields, as an interlaced TV output would.
    pub interlaced_scan: bool,
    /// Pin the reported scan field, e.g. to provoke field-sync timeouts.
    pub stuck_field: Option<ScanField>,
    /// Never deliver a vertical blank.
    pub vblank_stalled: bool,
    /// Fail any single allocation larger than this.
    pub max_texture_bytes: Option<usize>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            refresh_hz: 50.0,
            interlaced_scan: false,
            stuck_field: None,
            vblank_stalled: false,
            max_texture_bytes: None,
        }
    }
}

/// Present records kept for inspection; older ones are dropped.
pub const PRESENT_HISTORY: usize = 1024;

#[derive(Debug, Clone)]
pub struct PresentRecord {
    pub sequence: u64,
    pub field: FieldSync,
    pub at: Instant,
    /// Display pixel at the centre when the present was issued.
    pub centre: [u8; 4],
}

struct HostTexture {
    desc: TextureDesc,
    data: Vec<u8>,
    uses: Vec<CompletionToken>,
}

#[derive(Default)]
struct HeadlessState {
    next_id: u64,
    textures: HashMap<TextureId, HostTexture>,
    display: Option<RgbaImage>,
    presents: VecDeque<PresentRecord>,
    present_count: u64,
    deferred: Vec<CompletionSignal>,
    defer: bool,
    destroyed: usize,
    violations: usize,
}

impl HeadlessState {
    fn token(&mut self) -> CompletionToken {
        if self.defer {
            let (signal, token) = completion_pair();
            self.deferred.push(signal);
            token
        } else {
            CompletionToken::completed()
        }
    }

    fn texture(&self, id: TextureId) -> Result<&HostTexture, RendererError> {
        self.textures
            .get(&id)
            .ok_or(RendererError::UnknownTexture(id))
    }

    fn texture_mut(&mut self, id: TextureId) -> Result<&mut HostTexture, RendererError> {
        self.textures
            .get_mut(&id)
            .ok_or(RendererError::UnknownTexture(id))
    }

    fn track(&mut self, ids: &[TextureId], token: &CompletionToken) {
        if token.is_complete() {
            return;
        }
        for id in ids {
            if let Some(texture) = self.textures.get_mut(id) {
                texture.uses.retain(|t| !t.is_complete());
                texture.uses.push(token.clone());
            }
        }
    }

    fn display_mut(&mut self) -> Result<&mut RgbaImage, RendererError> {
        self.display
            .as_mut()
            .ok_or_else(|| RendererError::InvalidConfiguration("display not configured".into()))
    }

    fn planar_frame(&self, source: &PlaneSource) -> Result<PlanarFrame, RendererError> {
        let mut frame = PlanarFrame::new(source.width, source.height, source.chroma)?;
        for kind in PlaneKind::ALL {
            let texture = self.texture(source.planes[kind.index()])?;
            let plane = frame.plane_mut(kind);
            let (w, h) = (plane.width(), plane.height());
            if texture.desc.width != w || texture.desc.height != h {
                return Err(RendererError::InvalidConfiguration(format!(
                    "{kind:?} texture is {}x{}, frame needs {w}x{h}",
                    texture.desc.width, texture.desc.height
                )));
            }
            plane.copy_rows(&texture.data, w as usize, w, h, 0, 0)?;
        }
        Ok(frame)
    }

    fn tables(&self, source: &PlaneSource) -> Result<Option<LookupTables>, RendererError> {
        let Some(ids) = source.tables else {
            return Ok(None);
        };
        let texels = |id| -> Result<Vec<Texel>, RendererError> {
            let texture = self.texture(id)?;
            bytemuck::try_cast_slice::<u8, Texel>(&texture.data)
                .map(|t| t.to_vec())
                .map_err(|e| RendererError::InvalidConfiguration(format!("table texture: {e}")))
        };
        let tables = LookupTables::from_parts(
            source.model,
            texels(ids.luma)?,
            texels(ids.chroma_coarse)?,
            texels(ids.chroma_error)?,
        )?;
        Ok(Some(tables))
    }

    /// Converts a planar source into packed RGBA.
    fn render_source(&self, source: &PlaneSource) -> Result<(u32, u32, Vec<u8>), RendererError> {
        let frame = self.planar_frame(source)?;
        let (width, rows) = source.image_size();
        let mut out = vec![0u8; width as usize * rows as usize * 4];
        let direct;
        let tables = self.tables(source)?;
        let converter: &dyn PixelConverter = match &tables {
            Some(tables) => tables,
            None => {
                direct = DirectConverter::new(source.model);
                &direct
            }
        };
        convert_frame(&frame, converter, source.field, &source.siting, &mut out)?;
        Ok((width, rows, out))
    }

    fn source_ids(source: &DrawSource) -> Vec<TextureId> {
        match source {
            DrawSource::Converted(id) => vec![*id],
            DrawSource::Planes(planes) => planes.planes.to_vec(),
        }
    }
}

fn blend(dst: &mut Rgba<u8>, src: [u8; 3], alpha: u8) {
    let a = alpha as u32;
    for ch in 0..3 {
        let value = src[ch] as u32 * a + dst.0[ch] as u32 * (255 - a);
        dst.0[ch] = ((value + 127) / 255) as u8;
    }
    dst.0[3] = 255;
}

pub struct HeadlessDevice {
    config: Mutex<HeadlessConfig>,
    state: Mutex<HeadlessState>,
    clock: VblankClock,
    make_current_calls: AtomicUsize,
}

impl HeadlessDevice {
    pub fn new(config: HeadlessConfig) -> Self {
        let clock = VblankClock::new(config.refresh_hz);
        Self {
            config: Mutex::new(config),
            state: Mutex::new(HeadlessState {
                next_id: 1,
                ..Default::default()
            }),
            clock,
            make_current_calls: AtomicUsize::new(0),
        }
    }

    /// Holds back completion of all subsequent work until
    /// [`HeadlessDevice::complete_deferred`].
    pub fn set_deferred(&self, defer: bool) {
        self.state.lock().defer = defer;
    }

    pub fn complete_deferred(&self) -> usize {
        let signals = std::mem::take(&mut self.state.lock().deferred);
        for signal in &signals {
            signal.complete();
        }
        signals.len()
    }

    pub fn outstanding_signals(&self) -> usize {
        self.state
            .lock()
            .deferred
            .iter()
            .filter(|s| !s.is_complete())
            .count()
    }

    pub fn set_stuck_field(&self, field: Option<ScanField>) {
        self.config.lock().stuck_field = field;
    }

    pub fn set_vblank_stalled(&self, stalled: bool) {
        self.config.lock().vblank_stalled = stalled;
    }

    pub fn set_max_texture_bytes(&self, limit: Option<usize>) {
        self.config.lock().max_texture_bytes = limit;
    }

    /// The most recent presents, oldest first, at most [`PRESENT_HISTORY`].
    pub fn presents(&self) -> Vec<PresentRecord> {
        self.state.lock().presents.iter().cloned().collect()
    }

    pub fn present_count(&self) -> u64 {
        self.state.lock().present_count
    }

    pub fn live_textures(&self) -> usize {
        self.state.lock().textures.len()
    }

    pub fn destroyed_textures(&self) -> usize {
        self.state.lock().destroyed
    }

    /// Destroys issued while the texture still had an unresolved use.
    pub fn destroy_violations(&self) -> usize {
        self.state.lock().violations
    }

    pub fn make_current_calls(&self) -> usize {
        self.make_current_calls.load(Ordering::Relaxed)
    }

    pub fn texture_data(&self, id: TextureId) -> Option<Vec<u8>> {
        self.state.lock().textures.get(&id).map(|t| t.data.clone())
    }
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId, RendererError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RendererError::InvalidConfiguration(format!(
                "texture '{}' has a zero dimension",
                desc.label
            )));
        }
        let bytes = desc.bytes();
        if let Some(limit) = self.config.lock().max_texture_bytes {
            if bytes > limit {
                return Err(RendererError::Allocation(format!(
                    "'{}' needs {bytes} bytes, limit {limit}",
                    desc.label
                )));
            }
        }
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| RendererError::Allocation(format!("'{}' ({bytes} bytes)", desc.label)))?;
        data.resize(bytes, 0);

        let mut state = self.state.lock();
        let id = TextureId(state.next_id);
        state.next_id += 1;
        state.textures.insert(
            id,
            HostTexture {
                desc: *desc,
                data,
                uses: Vec::new(),
            },
        );
        trace!(id = id.0, label = desc.label, bytes, "[headless] texture created");
        Ok(id)
    }

    fn destroy_texture(&self, retired: Retired) {
        let mut state = self.state.lock();
        match state.textures.remove(&retired.id()) {
            Some(texture) => {
                state.destroyed += 1;
                if texture.uses.iter().any(|t| !t.is_complete()) {
                    state.violations += 1;
                    error!(
                        id = retired.id().0,
                        label = texture.desc.label,
                        "[headless] texture destroyed with outstanding completion"
                    );
                }
            }
            None => error!(id = retired.id().0, "[headless] destroy of unknown texture"),
        }
    }

    fn write_texture(
        &self,
        id: TextureId,
        data: &[u8],
        bytes_per_row: u32,
    ) -> Result<CompletionToken, RendererError> {
        let mut state = self.state.lock();
        let texture = state.texture_mut(id)?;
        let row_bytes = (texture.desc.width * texture.desc.format.bytes_per_pixel()) as usize;
        let rows = texture.desc.height as usize;
        let stride = bytes_per_row as usize;
        let needed = (rows - 1) * stride + row_bytes;
        if stride < row_bytes || data.len() < needed {
            return Err(RendererError::InvalidConfiguration(format!(
                "write to '{}' needs {needed} bytes at stride {stride}, got {}",
                texture.desc.label,
                data.len()
            )));
        }
        for row in 0..rows {
            texture.data[row * row_bytes..(row + 1) * row_bytes]
                .copy_from_slice(&data[row * stride..row * stride + row_bytes]);
        }
        let token = state.token();
        state.track(&[id], &token);
        Ok(token)
    }

    fn fill_texture(&self, id: TextureId, value: [u8; 4]) -> Result<CompletionToken, RendererError> {
        let mut state = self.state.lock();
        let texture = state.texture_mut(id)?;
        let bpp = texture.desc.format.bytes_per_pixel() as usize;
        for px in texture.data.chunks_exact_mut(bpp) {
            px.copy_from_slice(&value[..bpp]);
        }
        let token = state.token();
        state.track(&[id], &token);
        Ok(token)
    }

    fn convert(&self, pass: &ConvertPass) -> Result<CompletionToken, RendererError> {
        let mut state = self.state.lock();
        let (width, rows, pixels) = state.render_source(&pass.source)?;
        let target = state.texture_mut(pass.target)?;
        if target.desc.format != TextureFormat::Rgba8
            || target.desc.width != width
            || target.desc.height != rows
        {
            return Err(RendererError::InvalidConfiguration(format!(
                "target '{}' is {}x{} {:?}, conversion yields {width}x{rows} RGBA",
                target.desc.label, target.desc.width, target.desc.height, target.desc.format
            )));
        }
        target.data.copy_from_slice(&pixels);
        let token = state.token();
        let mut ids = pass.source.planes.to_vec();
        ids.push(pass.target);
        if let Some(tables) = pass.source.tables {
            ids.extend([tables.luma, tables.chroma_coarse, tables.chroma_error]);
        }
        state.track(&ids, &token);
        Ok(token)
    }

    fn draw(&self, pass: &DrawPass) -> Result<CompletionToken, RendererError> {
        let mut state = self.state.lock();
        let (src_w, src_h, pixels) = match &pass.source {
            DrawSource::Converted(id) => {
                let texture = state.texture(*id)?;
                if texture.desc.format != TextureFormat::Rgba8 {
                    return Err(RendererError::InvalidConfiguration(format!(
                        "draw source '{}' is not RGBA",
                        texture.desc.label
                    )));
                }
                (texture.desc.width, texture.desc.height, texture.data.clone())
            }
            DrawSource::Planes(source) => state.render_source(source)?,
        };

        let display = state.display_mut()?;
        if let Some((src, dst)) = clip_to_target(pass.src, pass.dst, display.width(), display.height()) {
            let sx = src.width() / dst.width as f32;
            let sy = src.height() / dst.height as f32;
            for dy in 0..dst.height {
                let y = dst.y as u32 + dy;
                if !pass.lines.allows(y) {
                    continue;
                }
                let fy = src.y0 + (dy as f32 + 0.5) * sy;
                let row = (fy.floor().max(0.0) as u32).min(src_h - 1) as usize;
                for dx in 0..dst.width {
                    let fx = src.x0 + (dx as f32 + 0.5) * sx;
                    let col = (fx.floor().max(0.0) as u32).min(src_w - 1) as usize;
                    let offset = (row * src_w as usize + col) * 4;
                    let rgb = [pixels[offset], pixels[offset + 1], pixels[offset + 2]];
                    blend(display.get_pixel_mut(dst.x as u32 + dx, y), rgb, pass.alpha);
                }
            }
        }

        let token = state.token();
        state.track(&HeadlessState::source_ids(&pass.source), &token);
        Ok(token)
    }

    fn configure_display(&self, width: u32, height: u32) -> Result<(), RendererError> {
        if width == 0 || height == 0 {
            return Err(RendererError::InvalidConfiguration(format!(
                "display {width}x{height} has a zero dimension"
            )));
        }
        let mut state = self.state.lock();
        let keep = matches!(&state.display, Some(d) if d.width() == width && d.height() == height);
        if !keep {
            state.display = Some(RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255])));
        }
        Ok(())
    }

    fn display_size(&self) -> Option<(u32, u32)> {
        self.state
            .lock()
            .display
            .as_ref()
            .map(|d| (d.width(), d.height()))
    }

    fn clear_display(&self, rgb: [u8; 3]) -> Result<CompletionToken, RendererError> {
        let mut state = self.state.lock();
        let display = state.display_mut()?;
        for px in display.pixels_mut() {
            *px = Rgba([rgb[0], rgb[1], rgb[2], 255]);
        }
        Ok(state.token())
    }

    fn shade_display(&self, rgba: [u8; 4]) -> Result<CompletionToken, RendererError> {
        let mut state = self.state.lock();
        let display = state.display_mut()?;
        for px in display.pixels_mut() {
            blend(px, [rgba[0], rgba[1], rgba[2]], rgba[3]);
        }
        Ok(state.token())
    }

    fn present(&self, field: FieldSync) -> Result<CompletionToken, RendererError> {
        let mut state = self.state.lock();
        let Some(display) = &state.display else {
            return Err(RendererError::InvalidConfiguration(
                "present without a display".into(),
            ));
        };
        let centre = display.get_pixel(display.width() / 2, display.height() / 2).0;
        let sequence = state.present_count;
        state.present_count += 1;
        if state.presents.len() == PRESENT_HISTORY {
            state.presents.pop_front();
        }
        state.presents.push_back(PresentRecord {
            sequence,
            field,
            at: Instant::now(),
            centre,
        });
        trace!(sequence, ?field, "[headless] present");
        Ok(state.token())
    }

    fn read_display(&self) -> Result<RgbaImage, RendererError> {
        self.state
            .lock()
            .display
            .clone()
            .ok_or_else(|| RendererError::InvalidConfiguration("display not configured".into()))
    }

    fn scan_field(&self) -> ScanField {
        let config = self.config.lock();
        config
            .stuck_field
            .unwrap_or_else(|| self.clock.field(config.interlaced_scan))
    }

    fn wait_for_vblank(&self, timeout: Duration) -> bool {
        if self.config.lock().vblank_stalled {
            std::thread::sleep(timeout);
            return false;
        }
        self.clock.wait_for_vblank(timeout)
    }

    fn make_current(&self) {
        self.make_current_calls.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Rect, RectF};
    use crate::gpu::LineMask;

    fn rgba_texture(device: &HeadlessDevice, w: u32, h: u32, px: [u8; 4]) -> TextureId {
        let id = device
            .create_texture(&TextureDesc {
                label: "rgba",
                width: w,
                height: h,
                format: TextureFormat::Rgba8,
            })
            .expect("texture");
        device.fill_texture(id, px).expect("fill");
        id
    }

    #[test]
    fn draw_scales_and_masks_lines() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        device.configure_display(8, 4).expect("display");
        let red = rgba_texture(&device, 2, 2, [255, 0, 0, 255]);
        device
            .draw(&DrawPass {
                source: DrawSource::Converted(red),
                src: RectF::new(0.0, 0.0, 2.0, 2.0),
                dst: Rect {
                    x: 0,
                    y: 0,
                    width: 8,
                    height: 4,
                },
                lines: LineMask::Even,
                alpha: 255,
            })
            .expect("draw");
        let image = device.read_display().expect("image");
        assert_eq!(image.get_pixel(3, 0).0, [0, 0, 0, 255]);
        assert_eq!(image.get_pixel(3, 1).0, [255, 0, 0, 255]);
    }

    #[test]
    fn half_alpha_blends() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        device.configure_display(2, 2).expect("display");
        device.clear_display([0, 0, 200]).expect("clear");
        device.shade_display([0, 0, 0, 128]).expect("shade");
        let image = device.read_display().expect("image");
        assert_eq!(image.get_pixel(0, 0).0[2], 100);
    }

    #[test]
    fn allocation_limit_fails_large_textures() {
        let device = HeadlessDevice::new(HeadlessConfig {
            max_texture_bytes: Some(1024),
            ..Default::default()
        });
        let err = device
            .create_texture(&TextureDesc {
                label: "big",
                width: 64,
                height: 64,
                format: TextureFormat::Rgba8,
            })
            .unwrap_err();
        assert!(matches!(err, RendererError::Allocation(_)));
    }

    #[test]
    fn present_history_is_bounded() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        device.configure_display(2, 2).expect("display");
        device.clear_display([0, 200, 0]).expect("clear");
        let total = PRESENT_HISTORY + 10;
        for _ in 0..total {
            device.present(FieldSync::None).expect("present");
        }
        let presents = device.presents();
        assert_eq!(presents.len(), PRESENT_HISTORY);
        assert_eq!(device.present_count(), total as u64);
        assert_eq!(presents[0].sequence, 10);
        assert_eq!(presents[PRESENT_HISTORY - 1].sequence, total as u64 - 1);
        assert_eq!(presents[0].centre, [0, 200, 0, 255]);
    }

    #[test]
    fn deferred_tokens_resolve_on_demand() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        device.configure_display(2, 2).expect("display");
        device.set_deferred(true);
        let token = device.present(FieldSync::None).expect("present");
        assert!(!token.is_complete());
        assert_eq!(device.outstanding_signals(), 1);
        assert_eq!(device.complete_deferred(), 1);
        assert!(token.is_complete());
    }
}

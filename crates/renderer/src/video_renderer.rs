//! The single renderer type: ring, device resources and the active
//! conversion strategy, driven by the presentation controller.

use std::ops::BitOr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color::{ChromaSiting, ConversionModel, FieldSelect};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use media_io::{ChromaFormat, FieldOrder, FrameRate, SliceRef};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::context::{DisplayMode, RenderingContext};
use crate::conversion::{create_strategy, degrade_to_low_memory, ConversionStrategy, RenderMethod};
use crate::deinterlace::{DeinterlaceScheduler, FieldParity, FieldSync, InterlaceMethod, PlanStep};
use crate::geometry::{
    choose_best_resolution, cropped_aspect_ratio, display_geometry, source_frame_ratio,
    view_scale, DisplayGeometry, RectF, ViewInputs,
};
use crate::gpu::{DrawPass, LineMask};
use crate::resources::{GpuResourceManager, TargetLayout};
use crate::ring::{FrameBufferRing, FrameSlot, RingConfig};
use crate::settings::RenderSettings;
use crate::RendererError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfigureParams {
    pub width: u32,
    pub height: u32,
    /// Size the decoder wants the picture shown at.
    pub display_width: u32,
    pub display_height: u32,
    pub frame_rate: FrameRate,
    pub field_order: FieldOrder,
    pub chroma: ChromaFormat,
    pub model: ConversionModel,
    pub fullscreen: bool,
}

impl ConfigureParams {
    pub fn new(
        width: u32,
        height: u32,
        display_width: u32,
        display_height: u32,
        frame_rate: FrameRate,
    ) -> Self {
        Self {
            width,
            height,
            display_width,
            display_height,
            frame_rate,
            field_order: FieldOrder::Progressive,
            chroma: ChromaFormat::YUV420,
            model: ConversionModel::default(),
            fullscreen: false,
        }
    }
}

/// Options for [`VideoRenderer::render_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderFlags(u8);

impl RenderFlags {
    pub const NONE: RenderFlags = RenderFlags(0);
    /// Draw the odd field. Together with `EVEN` the fields are woven.
    pub const ODD: RenderFlags = RenderFlags(1);
    pub const EVEN: RenderFlags = RenderFlags(2);
    /// Repeat the field presented last.
    pub const LAST: RenderFlags = RenderFlags(4);
    pub const NO_OSD: RenderFlags = RenderFlags(8);

    pub fn contains(self, other: RenderFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RenderFlags {
    type Output = RenderFlags;

    fn bitor(self, rhs: RenderFlags) -> RenderFlags {
        RenderFlags(self.0 | rhs.0)
    }
}

/// Draws on-screen display and subtitles over a captured composite.
pub trait OverlayRenderer: Send + Sync {
    fn render(&self, image: &mut RgbaImage);
}

/// Result of presenting one flipped frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentOutcome {
    pub slot: usize,
    pub fields: Vec<FieldSync>,
}

#[derive(Debug, Default)]
struct Pacing {
    last_present: Option<Instant>,
    last_field: Option<FieldParity>,
}

/// Source needs one half-height image per field for `method`.
fn needs_field_targets(method: InterlaceMethod, order: FieldOrder) -> bool {
    order.is_interlaced()
        && !matches!(
            method,
            InterlaceMethod::None | InterlaceMethod::Weave | InterlaceMethod::WeaveInverted
        )
}

/// Maps a frame-space rectangle into the rows of one field.
fn field_rect(src: RectF, field: Option<FieldParity>) -> RectF {
    match field {
        None => src,
        Some(_) => RectF::new(src.x0, src.y0 / 2.0, src.x1, src.y1 / 2.0),
    }
}

pub struct VideoRenderer {
    context: Arc<RenderingContext>,
    settings: RenderSettings,
    resources: GpuResourceManager,
    ring: FrameBufferRing,
    strategy: Option<Box<dyn ConversionStrategy>>,
    scheduler: Mutex<DeinterlaceScheduler>,
    pacing: Mutex<Pacing>,
    params: Option<ConfigureParams>,
    siting: ChromaSiting,
    fielded: bool,
    dim_level: AtomicU8,
}

impl VideoRenderer {
    pub fn new(context: Arc<RenderingContext>, settings: RenderSettings) -> Self {
        let settings = settings.sanitized();
        let resources = GpuResourceManager::new(
            context.device().clone(),
            settings.timeouts.texture_release(),
        );
        let scheduler = DeinterlaceScheduler::new(
            settings.interlace_method,
            context.resolution().class(),
        );
        Self {
            dim_level: AtomicU8::new(settings.dim_level),
            context,
            resources,
            ring: FrameBufferRing::new(),
            strategy: None,
            scheduler: Mutex::new(scheduler),
            pacing: Mutex::new(Pacing::default()),
            params: None,
            siting: ChromaSiting::default(),
            fielded: false,
            settings,
        }
    }

    pub fn context(&self) -> &Arc<RenderingContext> {
        &self.context
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn ring(&self) -> &FrameBufferRing {
        &self.ring
    }

    pub fn resources(&self) -> &GpuResourceManager {
        &self.resources
    }

    pub fn params(&self) -> Option<&ConfigureParams> {
        self.params.as_ref()
    }

    pub fn is_configured(&self) -> bool {
        self.params.is_some() && self.strategy.is_some()
    }

    pub fn render_method(&self) -> Option<RenderMethod> {
        self.strategy.as_ref().map(|s| s.method())
    }

    pub fn interlace_method(&self) -> InterlaceMethod {
        self.scheduler.lock().method()
    }

    pub fn set_interlace_method(&mut self, method: InterlaceMethod) {
        self.settings.interlace_method = method;
        self.scheduler.lock().set_method(method);
    }

    pub fn set_dim_level(&self, percent: u8) {
        self.dim_level.store(percent.min(100), Ordering::Relaxed);
    }

    /// Sizes the ring, targets and tables for `params`. Reconfiguring with
    /// identical parameters leaves every resource in place; returns whether
    /// anything changed.
    pub fn configure(&mut self, params: ConfigureParams) -> Result<bool, RendererError> {
        if params.width == 0 || params.height == 0 {
            return Err(RendererError::InvalidConfiguration(format!(
                "frame size {}x{}",
                params.width, params.height
            )));
        }
        if self.params == Some(params) && self.strategy.is_some() {
            debug!("[video] configure with unchanged parameters");
            return Ok(false);
        }

        let mode = if params.fullscreen {
            DisplayMode::FullscreenVideo
        } else {
            DisplayMode::Windowed
        };
        if params.fullscreen {
            let ratio = source_frame_ratio(
                params.width,
                params.height,
                params.display_width,
                params.display_height,
            );
            let resolution = self.settings.resolution.unwrap_or_else(|| {
                choose_best_resolution(
                    params.frame_rate.as_f64(),
                    ratio,
                    params.width,
                    params.height,
                    &self.settings.display,
                )
            });
            self.context.set_resolution(resolution)?;
        }
        self.context.set_display_mode(mode);
        {
            let mut scheduler = self.scheduler.lock();
            scheduler.set_method(self.settings.interlace_method);
            scheduler.set_resolution_class(self.context.resolution().class());
        }

        let rebuild = match (&self.strategy, &self.params) {
            (Some(_), Some(old)) => old.model != params.model,
            _ => true,
        };
        if rebuild {
            self.strategy = Some(create_strategy(
                self.settings.render_method,
                &self.resources,
                params.model,
            )?);
        }
        self.fielded = needs_field_targets(self.settings.interlace_method, params.field_order);
        self.apply_target_layout(mode, &params)?;

        let config = RingConfig {
            width: params.width,
            height: params.height,
            chroma: params.chroma,
            count: self.settings.buffers.for_mode(params.fullscreen),
            black: params.model.black(),
        };
        if self.ring.config().is_some_and(|c| c != config) {
            self.drain_ring();
        }
        let resources = &self.resources;
        self.ring
            .configure(config, |_, slot| resources.create_frame_textures(slot, config.black))?;

        self.params = Some(params);
        info!(
            width = params.width,
            height = params.height,
            buffers = config.count,
            method = ?self.render_method(),
            ?mode,
            "[video] configured"
        );
        Ok(true)
    }

    fn apply_target_layout(
        &mut self,
        mode: DisplayMode,
        params: &ConfigureParams,
    ) -> Result<(), RendererError> {
        let Some(strategy) = &self.strategy else {
            return Err(RendererError::NotConfigured);
        };
        let layout = strategy.target_layout(mode, self.fielded);
        match self
            .resources
            .ensure_target_layout(layout, params.width, params.height)
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_allocation() => {
                warn!(error = %err, "[video] conversion targets unavailable, compositing directly");
                self.resources
                    .ensure_target_layout(TargetLayout::None, params.width, params.height)?;
                self.strategy = Some(degrade_to_low_memory(&self.resources, params.model)?);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn drain_ring(&self) {
        for mut slot in self.ring.teardown() {
            self.resources.destroy_frame_textures(&mut slot);
        }
    }

    /// Switches between windowed and exclusive output, resizing the ring
    /// and dropping conversion targets the new mode does not use.
    pub fn apply_display_mode(&mut self, mode: DisplayMode) -> Result<bool, RendererError> {
        let Some(mut params) = self.params else {
            self.context.set_display_mode(mode);
            return Ok(false);
        };
        params.fullscreen = mode == DisplayMode::FullscreenVideo;
        self.configure(params)
    }

    /// Releases every resource; the renderer must be configured again
    /// before further use.
    pub fn uninit(&mut self) {
        self.drain_ring();
        self.strategy = None;
        self.params = None;
        let leaked = self.resources.shutdown();
        *self.pacing.lock() = Pacing::default();
        debug!(leaked, "[video] released");
    }

    pub fn acquire_decode_slot(&self) -> Result<usize, RendererError> {
        self.ring.acquire_decode_slot(self.settings.timeouts.flip_ack())
    }

    /// Copies a decoded band into the decode slot. Returns true once the
    /// frame is complete and uploaded.
    pub fn draw_slice(&self, slice: &SliceRef<'_>) -> Result<bool, RendererError> {
        if !self.is_configured() {
            return Err(RendererError::NotConfigured);
        }
        let committed = self.ring.draw_slice(slice, self.settings.timeouts.flip_ack(), |slot| {
            self.resources.upload_frame(slot)
        })?;
        Ok(committed.is_some())
    }

    pub fn release_decode_slot(&self, field: FieldSync) -> Result<usize, RendererError> {
        self.ring
            .release_decode_slot(field, |slot| self.resources.upload_frame(slot))
    }

    /// Current picture placement for the configured source.
    pub fn display_geometry(&self) -> Option<DisplayGeometry> {
        let params = self.params.as_ref()?;
        let view = &self.settings.view;
        let resolution = self.context.resolution();
        let viewport = self.context.viewport();
        let ratio = source_frame_ratio(
            params.width,
            params.height,
            params.display_width,
            params.display_height,
        );
        let aspect = cropped_aspect_ratio(ratio, params.width, params.height, &view.crop);
        let scale = view_scale(&ViewInputs {
            mode: view.view_mode,
            custom: view.custom(),
            resolution,
            screen: viewport,
            aspect,
            cropped_height: params.height.saturating_sub(view.crop.top + view.crop.bottom) as f32,
        });
        Some(display_geometry(
            viewport,
            params.width,
            params.height,
            &view.crop,
            aspect * scale.pixel_ratio,
            scale.zoom,
            resolution.pixel_ratio(),
            resolution.is_interlaced(),
        ))
    }

    fn wait_uploaded(&self, slot: &FrameSlot) -> bool {
        match &slot.uploaded {
            Some(token) => self
                .context
                .device()
                .wait_for(token, self.settings.timeouts.texture_release()),
            None => true,
        }
    }

    fn clear(&self) -> Result<(), RendererError> {
        let grey = self.settings.black_bar_colour;
        self.context.device().clear_display([grey, grey, grey])?;
        Ok(())
    }

    fn dim(&self) -> Result<(), RendererError> {
        let level = self.dim_level.load(Ordering::Relaxed);
        if level > 0 {
            let alpha = (level as u32 * 255 / 100) as u8;
            self.context.device().shade_display([0, 0, 0, alpha])?;
        }
        Ok(())
    }

    /// Composites `field` of the frame in `slot` (the whole frame for
    /// `None`) into the display.
    fn draw_frame(
        &self,
        slot: &FrameSlot,
        geometry: &DisplayGeometry,
        field: Option<FieldParity>,
        lines: LineMask,
        alpha: u8,
    ) -> Result<(), RendererError> {
        let strategy = self.strategy.as_ref().ok_or(RendererError::NotConfigured)?;
        let select = field.map_or(FieldSelect::Full, FieldParity::select);
        let converted = strategy.convert(&self.resources, slot, select, self.siting)?;
        let token = self.context.device().draw(&DrawPass {
            source: converted.source,
            src: field_rect(geometry.src, field),
            dst: geometry.dst,
            lines,
            alpha,
        })?;
        if let Some(textures) = &slot.textures {
            textures.mark_used(&token);
        }
        self.resources
            .mark_used(converted.target, converted.uses_tables, &token);
        Ok(())
    }

    /// Holds until the display scans `parity`, giving up after the field
    /// sync timeout.
    fn await_scan(&self, parity: FieldParity) -> bool {
        let device = self.context.device();
        let deadline = Instant::now() + self.settings.timeouts.field_sync();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !device.wait_for_vblank(remaining) {
                return false;
            }
            if parity.matches(device.scan_field()) {
                return true;
            }
        }
    }

    fn record_present(&self, field: FieldSync) -> Result<(), RendererError> {
        self.context.device().present(field)?;
        let now = Instant::now();
        let mut pacing = self.pacing.lock();
        if let Some(previous) = pacing.last_present.replace(now) {
            self.scheduler.lock().budget_mut().debit(now - previous);
        }
        pacing.last_field = match field {
            FieldSync::Odd => Some(FieldParity::Odd),
            FieldSync::Even => Some(FieldParity::Even),
            FieldSync::Both | FieldSync::None => pacing.last_field,
        };
        Ok(())
    }

    /// Presents the newest ready frame with the deinterlacing strategy for
    /// `sync`, crediting `delay` to the presentation budget.
    #[instrument(name = "present.frame", skip_all, fields(field = ?sync))]
    pub fn present_frame(
        &self,
        sync: FieldSync,
        delay: Duration,
    ) -> Result<Option<PresentOutcome>, RendererError> {
        if !self.is_configured() {
            return Err(RendererError::NotConfigured);
        }
        let Some(index) = self.ring.begin_render() else {
            trace!("[present] nothing to show");
            return Ok(None);
        };
        self.present_slot(index, sync, delay).map(Some)
    }

    /// Binds the newest committed frame to a flip so later frames cannot
    /// replace it before [`VideoRenderer::present_flip`] shows it.
    pub fn flip_frame(&self) -> Option<usize> {
        self.ring.flip()
    }

    /// Presents the frame bound to a flip. A flip that carried no new frame
    /// repeats the one on screen.
    #[instrument(name = "present.flip", skip_all, fields(slot = ?slot, field = ?sync))]
    pub fn present_flip(
        &self,
        slot: Option<usize>,
        sync: FieldSync,
        delay: Duration,
    ) -> Result<Option<PresentOutcome>, RendererError> {
        if !self.is_configured() {
            return Err(RendererError::NotConfigured);
        }
        let index = match slot {
            Some(index) => self.ring.begin_render_slot(index),
            None => self
                .ring
                .begin_render_last()
                .or_else(|| self.ring.begin_render()),
        };
        let Some(index) = index else {
            if let Some(slot) = slot {
                warn!(slot, "[present] flipped frame no longer available");
            }
            return Ok(None);
        };
        self.present_slot(index, sync, delay).map(Some)
    }

    fn present_slot(
        &self,
        index: usize,
        sync: FieldSync,
        delay: Duration,
    ) -> Result<PresentOutcome, RendererError> {
        let result = self
            .ring
            .with_slot(index, |slot| self.run_plan(slot, sync, delay))
            .and_then(|r| r);
        self.ring.end_render(index);
        let fields = result?;
        Ok(PresentOutcome {
            slot: index,
            fields,
        })
    }

    fn run_plan(
        &self,
        slot: &mut FrameSlot,
        sync: FieldSync,
        delay: Duration,
    ) -> Result<Vec<FieldSync>, RendererError> {
        slot.field = sync;
        if !self.wait_uploaded(slot) {
            warn!(sequence = slot.sequence, "[present] upload not finished, presenting anyway");
        }
        let geometry = self.display_geometry().ok_or(RendererError::NotConfigured)?;
        let plan = self.scheduler.lock().plan(sync, delay);
        trace!(strategy = ?plan.strategy, steps = plan.steps.len(), "[present] plan");

        let mut presented = Vec::new();
        let mut fresh = true;
        for step in plan.steps {
            match step {
                PlanStep::Draw { field, lines, alpha } => {
                    if fresh {
                        self.clear()?;
                        fresh = false;
                    }
                    self.draw_frame(slot, &geometry, field, lines, alpha)?;
                }
                PlanStep::AwaitScan(parity) => {
                    if !self.await_scan(parity) {
                        error!(?parity, "[present] timed out waiting for field sync");
                    }
                }
                PlanStep::Present(label) => {
                    self.dim()?;
                    self.record_present(label)?;
                    presented.push(label);
                    fresh = true;
                }
                PlanStep::Pace(wait) => {
                    if !wait.is_zero() {
                        std::thread::sleep(wait);
                    }
                }
            }
        }
        Ok(presented)
    }

    /// Renders for a UI-driven refresh. `flags` pick the field(s) to show;
    /// a frame whose upload has not finished is replaced by the previously
    /// displayed one. Returns false when there was nothing to draw.
    pub fn render_update(&self, clear: bool, flags: RenderFlags, alpha: u8) -> Result<bool, RendererError> {
        if !self.is_configured() {
            return Err(RendererError::NotConfigured);
        }
        let mut index = match self.ring.begin_render() {
            Some(index) => index,
            None => {
                if clear {
                    self.clear()?;
                }
                return Ok(false);
            }
        };
        let uploaded = self.ring.with_slot(index, |slot| self.wait_uploaded(slot))?;
        if !uploaded {
            let fallback = self.ring.last_displayed().filter(|&last| last != index);
            if fallback.is_some() {
                self.ring.cancel_render(index);
                match self.ring.begin_render_last() {
                    Some(last) => {
                        warn!(skipped = index, shown = last, "[video] frame not uploaded, showing last good frame");
                        index = last;
                    }
                    None => return Ok(false),
                }
            } else {
                warn!(index, "[video] frame not uploaded, drawing it anyway");
            }
        }

        let result = self
            .ring
            .with_slot(index, |slot| self.compose_update(slot, clear, flags, alpha))
            .and_then(|r| r);
        self.ring.end_render(index);
        result.map(|_| true)
    }

    fn compose_update(
        &self,
        slot: &FrameSlot,
        clear: bool,
        flags: RenderFlags,
        alpha: u8,
    ) -> Result<(), RendererError> {
        let geometry = self.display_geometry().ok_or(RendererError::NotConfigured)?;
        if clear {
            self.clear()?;
        }
        let odd = flags.contains(RenderFlags::ODD);
        let even = flags.contains(RenderFlags::EVEN);
        let label = if flags.contains(RenderFlags::LAST) {
            let field = self.pacing.lock().last_field;
            match field {
                Some(parity) => {
                    self.draw_frame(slot, &geometry, Some(parity), LineMask::All, alpha)?;
                    parity.sync()
                }
                None => {
                    self.draw_frame(slot, &geometry, None, LineMask::All, alpha)?;
                    FieldSync::None
                }
            }
        } else if odd && even {
            self.draw_frame(slot, &geometry, None, LineMask::Odd, alpha)?;
            self.draw_frame(slot, &geometry, None, LineMask::Even, alpha)?;
            FieldSync::Both
        } else if odd || even {
            let parity = if odd { FieldParity::Odd } else { FieldParity::Even };
            self.draw_frame(slot, &geometry, Some(parity), LineMask::All, alpha)?;
            parity.sync()
        } else {
            self.draw_frame(slot, &geometry, None, LineMask::All, alpha)?;
            FieldSync::None
        };
        self.dim()?;
        self.record_present(label)
    }

    /// Clears the display to the bar colour and presents it.
    pub fn render_blank(&self) -> Result<(), RendererError> {
        self.clear()?;
        self.context.device().present(FieldSync::None)?;
        Ok(())
    }

    /// Periodic refresh from the UI. When paused the last frame is redrawn
    /// so overlays stay current.
    pub fn update(&self, paused: bool) -> Result<bool, RendererError> {
        self.resources.collect_garbage();
        if !self.is_configured() {
            return Ok(false);
        }
        if paused {
            return self.render_update(true, RenderFlags::NONE, 255);
        }
        Ok(true)
    }

    /// Renders the current frame and captures the composite, with overlays
    /// drawn on top when a renderer is supplied.
    pub fn screenshot(&self, overlay: Option<&dyn OverlayRenderer>) -> Result<RgbaImage, RendererError> {
        let index = self.ring.begin_render_last();
        if let Some(index) = index {
            let result = self
                .ring
                .with_slot(index, |slot| self.compose_update(slot, true, RenderFlags::NO_OSD, 255))
                .and_then(|r| r);
            self.ring.end_render(index);
            result?;
        }
        let mut image = self.context.device().read_display()?;
        if let Some(overlay) = overlay {
            overlay.render(&mut image);
        }
        Ok(image)
    }

    pub fn create_thumbnail(&self, width: u32, height: u32) -> Result<RgbaImage, RendererError> {
        if width == 0 || height == 0 {
            return Err(RendererError::InvalidConfiguration(format!(
                "thumbnail {width}x{height}"
            )));
        }
        let image = self.screenshot(None)?;
        Ok(imageops::resize(&image, width, height, FilterType::Triangle))
    }
}

impl Drop for VideoRenderer {
    fn drop(&mut self) {
        if self.params.is_some() {
            self.uninit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Resolution;
    use crate::gpu::{GpuDevice, HeadlessConfig, HeadlessDevice};
    use media_io::PlanarFrame;

    fn renderer(settings: RenderSettings) -> (Arc<HeadlessDevice>, VideoRenderer) {
        let headless = Arc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let device: Arc<dyn GpuDevice> = headless.clone();
        let context = RenderingContext::new(device, Resolution::Ntsc4x3).expect("context");
        (headless, VideoRenderer::new(context, settings))
    }

    fn feed(renderer: &VideoRenderer, yuv: [u8; 3]) {
        let params = renderer.params().expect("configured");
        let frame = PlanarFrame::solid(params.width, params.height, params.chroma, yuv).expect("frame");
        assert!(renderer.draw_slice(&frame.slice(0, params.height)).expect("slice"));
    }

    #[test]
    fn per_frame_calls_before_configure_fail() {
        let (_headless, renderer) = renderer(RenderSettings::default());
        assert!(matches!(
            renderer.present_frame(FieldSync::None, Duration::ZERO),
            Err(RendererError::NotConfigured)
        ));
        assert!(!renderer.update(false).expect("update"));
    }

    #[test]
    fn zero_sized_frame_is_rejected() {
        let (_headless, mut renderer) = renderer(RenderSettings::default());
        let params = ConfigureParams::new(0, 480, 720, 480, FrameRate::NTSC);
        assert!(renderer.configure(params).is_err());
        assert!(!renderer.is_configured());
    }

    #[test]
    fn dim_darkens_the_composite() {
        let (headless, mut renderer) = renderer(RenderSettings::default());
        renderer
            .configure(ConfigureParams::new(720, 480, 720, 480, FrameRate::NTSC))
            .expect("configure");
        feed(&renderer, [235, 128, 128]);
        renderer.set_dim_level(50);
        assert!(renderer.render_update(true, RenderFlags::NONE, 255).expect("render"));
        let image = headless.read_display().expect("display");
        let px = image.get_pixel(360, 240);
        assert!((125..=130).contains(&px[0]), "dimmed to {:?}", px);
    }

    #[test]
    fn woven_update_draws_both_fields() {
        let (headless, mut renderer) = renderer(RenderSettings::default());
        renderer
            .configure(ConfigureParams::new(720, 480, 720, 480, FrameRate::NTSC))
            .expect("configure");
        feed(&renderer, [235, 128, 128]);
        renderer
            .render_update(true, RenderFlags::ODD | RenderFlags::EVEN, 255)
            .expect("render");
        let image = headless.read_display().expect("display");
        assert!(image.get_pixel(100, 240)[1] >= 253);
        assert!(image.get_pixel(100, 241)[1] >= 253);
        let last = headless.presents().pop().expect("present");
        assert_eq!(last.field, FieldSync::Both);
    }

    #[test]
    fn thumbnail_is_resized_composite() {
        let (_headless, mut renderer) = renderer(RenderSettings::default());
        renderer
            .configure(ConfigureParams::new(720, 480, 720, 480, FrameRate::NTSC))
            .expect("configure");
        feed(&renderer, [235, 128, 128]);
        renderer
            .present_frame(FieldSync::None, Duration::ZERO)
            .expect("present");
        let thumb = renderer.create_thumbnail(90, 60).expect("thumbnail");
        assert_eq!(thumb.dimensions(), (90, 60));
        assert!(thumb.get_pixel(45, 30)[0] >= 250);
    }

    #[test]
    fn field_targets_follow_interlace_method() {
        assert!(needs_field_targets(InterlaceMethod::Auto, FieldOrder::TopFirst));
        assert!(!needs_field_targets(InterlaceMethod::Weave, FieldOrder::TopFirst));
        assert!(!needs_field_targets(InterlaceMethod::Bob, FieldOrder::Progressive));
    }
}

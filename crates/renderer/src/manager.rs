//! Presentation controller: owns the active renderer, serialises access to
//! it and paces frame delivery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::RgbaImage;
use media_io::SliceRef;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::context::{DisplayMode, RenderingContext};
use crate::deinterlace::FieldSync;
use crate::settings::RenderSettings;
use crate::video_renderer::{ConfigureParams, OverlayRenderer, RenderFlags, VideoRenderer};
use crate::RendererError;

const STOP_POLL: Duration = Duration::from_millis(100);

/// Presentation counters, readable at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PresentStats {
    pub flips: u64,
    pub frames_presented: u64,
    pub fields_presented: u64,
    /// Flips admitted after the acknowledgement wait ran out.
    pub late_acks: u64,
    pub present_errors: u64,
    /// Smoothed time from a flip being queued to its present completing.
    pub latency_ms: f64,
    pub latency_samples: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingFlip {
    /// Ring slot bound when the flip was accepted.
    slot: Option<usize>,
    delay: Duration,
    field: FieldSync,
    queued: Instant,
}

#[derive(Debug, Default)]
struct Queue {
    flips: VecDeque<PendingFlip>,
    /// Accepting flips; cleared before the presenter drains and exits.
    running: bool,
    stop: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    /// Raised when a flip is queued or the presenter should stop.
    wake: Condvar,
    /// Raised whenever a queued flip has been presented.
    acked: Condvar,
    stats: Mutex<PresentStats>,
    smoothing: f64,
}

impl Shared {
    fn record(&self, queued: Instant, fields: usize, ok: bool) {
        let sample = queued.elapsed().as_secs_f64() * 1000.0;
        let mut stats = self.stats.lock();
        if ok {
            stats.frames_presented += u64::from(fields > 0);
            stats.fields_presented += fields as u64;
        } else {
            stats.present_errors += 1;
        }
        stats.latency_ms = if stats.latency_samples == 0 {
            sample
        } else {
            stats.latency_ms + (sample - stats.latency_ms) * self.smoothing
        };
        stats.latency_samples += 1;
    }
}

type SharedRenderer = Arc<RwLock<Option<VideoRenderer>>>;

/// Owns the single [`VideoRenderer`]. Configuration takes exclusive access,
/// per-frame calls share it. In exclusive display mode presents run on a
/// dedicated thread.
pub struct RenderManager {
    context: Arc<RenderingContext>,
    settings: RenderSettings,
    renderer: SharedRenderer,
    shared: Arc<Shared>,
    presenter: Mutex<Option<JoinHandle<()>>>,
}

impl RenderManager {
    pub fn new(context: Arc<RenderingContext>, settings: RenderSettings) -> Self {
        let settings = settings.sanitized();
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
            acked: Condvar::new(),
            stats: Mutex::new(PresentStats::default()),
            smoothing: settings.latency_smoothing,
        });
        Self {
            context,
            settings,
            renderer: Arc::new(RwLock::new(None)),
            shared,
            presenter: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<RenderingContext> {
        &self.context
    }

    /// Exclusive access must never be requested under the display lock.
    fn check_lock_order(&self, operation: &str) -> Result<(), RendererError> {
        if RenderingContext::holds_display_lock() {
            error!(operation, "[present] exclusive access requested while holding the display lock");
            return Err(RendererError::LockOrder);
        }
        Ok(())
    }

    /// Creates the renderer instance without configuring it.
    pub fn pre_init(&self) -> bool {
        if self.check_lock_order("pre_init").is_err() {
            return false;
        }
        let mut renderer = self.renderer.write();
        if renderer.is_none() {
            *renderer = Some(VideoRenderer::new(self.context.clone(), self.settings.clone()));
            debug!("[present] renderer created");
        }
        true
    }

    pub fn configure(&self, params: ConfigureParams) -> bool {
        if self.check_lock_order("configure").is_err() {
            return false;
        }
        self.stop_presenter();
        let result = {
            let mut guard = self.renderer.write();
            let renderer = guard
                .get_or_insert_with(|| VideoRenderer::new(self.context.clone(), self.settings.clone()));
            renderer.configure(params)
        };
        match result {
            Ok(changed) => {
                debug!(changed, "[present] configure accepted");
                self.sync_presenter();
                true
            }
            Err(err) => {
                error!(error = %err, "[present] configure failed");
                false
            }
        }
    }

    /// Switches display ownership, starting or stopping the presenter.
    pub fn set_display_mode(&self, mode: DisplayMode) -> bool {
        if self.check_lock_order("set_display_mode").is_err() {
            return false;
        }
        self.stop_presenter();
        let result = match self.renderer.write().as_mut() {
            Some(renderer) => renderer.apply_display_mode(mode).map(|_| ()),
            None => {
                self.context.set_display_mode(mode);
                Ok(())
            }
        };
        if let Err(err) = result {
            error!(error = %err, ?mode, "[present] display mode switch failed");
            return false;
        }
        self.sync_presenter();
        true
    }

    /// Stops the presenter and releases the renderer.
    pub fn uninit(&self) {
        if self.check_lock_order("uninit").is_err() {
            return;
        }
        self.stop_presenter();
        if let Some(mut renderer) = self.renderer.write().take() {
            renderer.uninit();
        }
        info!("[present] uninitialised");
    }

    fn sync_presenter(&self) {
        let exclusive = self.context.display_mode() == DisplayMode::FullscreenVideo;
        if exclusive && self.settings.present_thread {
            self.start_presenter();
        }
    }

    fn start_presenter(&self) {
        let mut presenter = self.presenter.lock();
        if presenter.is_some() {
            return;
        }
        {
            let mut queue = self.shared.queue.lock();
            queue.stop = false;
            queue.running = true;
        }
        let shared = self.shared.clone();
        let renderer = self.renderer.clone();
        let context = self.context.clone();
        let handle = std::thread::Builder::new()
            .name("video-present".into())
            .spawn(move || present_loop(shared, renderer, context));
        match handle {
            Ok(handle) => {
                debug!("[present] presenter thread started");
                *presenter = Some(handle);
            }
            Err(err) => {
                self.shared.queue.lock().running = false;
                error!(error = %err, "[present] could not start presenter thread");
            }
        }
    }

    /// Stops accepting flips and joins the presenter once it has shown
    /// every flip already accepted.
    fn stop_presenter(&self) {
        let Some(handle) = self.presenter.lock().take() else {
            return;
        };
        let pending = {
            let mut queue = self.shared.queue.lock();
            queue.running = false;
            queue.stop = true;
            self.shared.wake.notify_all();
            queue.flips.len()
        };
        debug!(pending, "[present] stopping presenter");
        if handle.join().is_err() {
            error!("[present] presenter thread panicked");
        }
        let mut queue = self.shared.queue.lock();
        let dropped = queue.flips.len();
        queue.flips.clear();
        queue.stop = false;
        self.shared.acked.notify_all();
        if dropped > 0 {
            error!(dropped, "[present] presenter exited with flips pending");
        }
        debug!("[present] presenter thread stopped");
    }

    pub fn is_presenter_running(&self) -> bool {
        self.presenter.lock().is_some()
    }

    /// Signals that the last committed frame is complete. Waits (bounded) for
    /// the previous flip to be acknowledged, then either hands the frame to
    /// the presenter or, without one, blocks until `delay` has elapsed. In
    /// exclusive mode the frame is bound to the flip so it is the one shown.
    pub fn flip_page(&self, delay: Duration, field: FieldSync) -> bool {
        let configured = self
            .renderer
            .read()
            .as_ref()
            .is_some_and(VideoRenderer::is_configured);
        if !configured {
            warn!("[present] flip before configure");
            return false;
        }
        let deadline = Instant::now() + delay;
        self.shared.stats.lock().flips += 1;

        let exclusive = self.context.display_mode() == DisplayMode::FullscreenVideo;
        if self.shared.queue.lock().running {
            self.admit();
        }
        let slot = if exclusive {
            self.inspect(VideoRenderer::flip_frame).flatten()
        } else {
            None
        };
        {
            let mut queue = self.shared.queue.lock();
            if queue.running {
                queue.flips.push_back(PendingFlip {
                    slot,
                    delay,
                    field,
                    queued: Instant::now(),
                });
                self.shared.wake.notify_one();
                trace!(?slot, ?field, "[present] flip queued");
                return true;
            }
        }

        // Without a presenter the UI renders windowed output; exclusive
        // output is presented from the caller's thread.
        if exclusive {
            let queued = Instant::now();
            let outcome = {
                let _display = self.context.lock_display();
                let guard = self.renderer.read();
                match guard.as_ref() {
                    Some(renderer) => renderer.present_flip(slot, field, delay),
                    None => Err(RendererError::NotConfigured),
                }
            };
            match outcome {
                Ok(outcome) => self
                    .shared
                    .record(queued, outcome.map_or(0, |o| o.fields.len()), true),
                Err(err) => {
                    error!(error = %err, "[present] present failed");
                    self.shared.record(queued, 0, false);
                }
            }
        }

        let wait = deadline.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        true
    }

    /// Bounded wait for every queued flip to be presented.
    fn admit(&self) {
        let timeout = self.settings.timeouts.flip_ack();
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        while !queue.flips.is_empty() {
            if self.shared.acked.wait_until(&mut queue, deadline).timed_out() {
                if !queue.flips.is_empty() {
                    warn!(
                        pending = queue.flips.len(),
                        timeout_ms = timeout.as_millis() as u64,
                        "[present] previous flip not acknowledged"
                    );
                    self.shared.stats.lock().late_acks += 1;
                }
                return;
            }
        }
    }

    /// Waits until every queued flip has been presented.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        while !queue.flips.is_empty() {
            if self.shared.acked.wait_until(&mut queue, deadline).timed_out() {
                return queue.flips.is_empty();
            }
        }
        true
    }

    fn with_renderer<R>(&self, f: impl FnOnce(&VideoRenderer) -> Result<R, RendererError>) -> Option<R> {
        let guard = self.renderer.read();
        let Some(renderer) = guard.as_ref() else {
            warn!("[present] renderer used before pre_init");
            return None;
        };
        match f(renderer) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, "[present] renderer call failed");
                None
            }
        }
    }

    pub fn acquire_decode_slot(&self) -> Option<usize> {
        self.with_renderer(|r| r.acquire_decode_slot())
    }

    pub fn draw_slice(&self, slice: &SliceRef<'_>) -> bool {
        self.with_renderer(|r| r.draw_slice(slice)).is_some()
    }

    pub fn release_decode_slot(&self, field: FieldSync) -> Option<usize> {
        self.with_renderer(|r| r.release_decode_slot(field))
    }

    pub fn update(&self, paused: bool) -> bool {
        self.with_renderer(|r| r.update(paused)).unwrap_or(false)
    }

    pub fn render_update(&self, clear: bool, flags: RenderFlags, alpha: u8) -> bool {
        let _display = self.context.lock_display();
        self.with_renderer(|r| r.render_update(clear, flags, alpha))
            .unwrap_or(false)
    }

    pub fn render_blank(&self) -> bool {
        let _display = self.context.lock_display();
        self.with_renderer(|r| r.render_blank()).is_some()
    }

    /// Still image of the current composite, overlays included.
    pub fn setup_screenshot(&self, overlay: Option<&dyn OverlayRenderer>) -> Option<RgbaImage> {
        let _display = self.context.lock_display();
        self.with_renderer(|r| r.screenshot(overlay))
    }

    pub fn create_thumbnail(&self, width: u32, height: u32) -> Option<RgbaImage> {
        let _display = self.context.lock_display();
        self.with_renderer(|r| r.create_thumbnail(width, height))
    }

    pub fn set_dim_level(&self, percent: u8) {
        self.with_renderer(|r| {
            r.set_dim_level(percent);
            Ok(())
        });
    }

    /// Runs `f` against the renderer under shared access.
    pub fn inspect<R>(&self, f: impl FnOnce(&VideoRenderer) -> R) -> Option<R> {
        self.renderer.read().as_ref().map(f)
    }

    pub fn stats(&self) -> PresentStats {
        *self.shared.stats.lock()
    }
}

impl Drop for RenderManager {
    fn drop(&mut self) {
        self.stop_presenter();
    }
}

fn present_loop(shared: Arc<Shared>, renderer: SharedRenderer, context: Arc<RenderingContext>) {
    loop {
        let flip = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(flip) = queue.flips.front().copied() {
                    break flip;
                }
                if queue.stop {
                    return;
                }
                shared.wake.wait_for(&mut queue, STOP_POLL);
            }
        };

        let outcome = {
            let _display = context.lock_display();
            let guard = renderer.read();
            match guard.as_ref() {
                Some(renderer) => renderer.present_flip(flip.slot, flip.field, flip.delay),
                None => Err(RendererError::NotConfigured),
            }
        };
        match &outcome {
            Ok(Some(outcome)) => {
                trace!(slot = outcome.slot, fields = outcome.fields.len(), "[present] frame shown")
            }
            Ok(None) => trace!("[present] flip with no ready frame"),
            Err(err) => error!(error = %err, "[present] present failed"),
        }
        shared.record(
            flip.queued,
            outcome.as_ref().ok().and_then(|o| o.as_ref()).map_or(0, |o| o.fields.len()),
            outcome.is_ok(),
        );

        let mut queue = shared.queue.lock();
        queue.flips.pop_front();
        shared.acked.notify_all();
    }
}

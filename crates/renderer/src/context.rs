//! Shared rendering context: the device, the display lock and the current
//! output layout. Built once by the application and handed to the manager.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::{RectF, Resolution};
use crate::gpu::GpuDevice;
use crate::RendererError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayMode {
    /// Composited into the application window; the UI drives rendering.
    #[default]
    Windowed,
    /// The pipeline owns the display exclusively.
    FullscreenVideo,
}

thread_local! {
    static DISPLAY_LOCKS_HELD: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Clone, Copy)]
struct Output {
    mode: DisplayMode,
    resolution: Resolution,
    viewport: RectF,
}

pub struct RenderingContext {
    device: Arc<dyn GpuDevice>,
    display: Mutex<()>,
    output: Mutex<Output>,
}

impl RenderingContext {
    pub fn new(device: Arc<dyn GpuDevice>, resolution: Resolution) -> Result<Arc<Self>, RendererError> {
        let (width, height) = resolution.size();
        device.configure_display(width, height)?;
        Ok(Arc::new(Self {
            device,
            display: Mutex::new(()),
            output: Mutex::new(Output {
                mode: DisplayMode::Windowed,
                resolution,
                viewport: RectF::new(0.0, 0.0, width as f32, height as f32),
            }),
        }))
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Takes the display lock and binds the device to this thread.
    pub fn lock_display(&self) -> DisplayGuard<'_> {
        let guard = self.display.lock();
        DISPLAY_LOCKS_HELD.with(|held| held.set(held.get() + 1));
        self.device.make_current();
        DisplayGuard {
            context: self,
            guard: Some(guard),
        }
    }

    /// Whether the calling thread holds a display lock.
    pub fn holds_display_lock() -> bool {
        DISPLAY_LOCKS_HELD.with(|held| held.get() > 0)
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.output.lock().mode
    }

    pub fn set_display_mode(&self, mode: DisplayMode) {
        let mut output = self.output.lock();
        if output.mode != mode {
            debug!(?mode, "[context] display mode");
            output.mode = mode;
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.output.lock().resolution
    }

    /// Switches the output resolution and resets the viewport to cover it.
    pub fn set_resolution(&self, resolution: Resolution) -> Result<(), RendererError> {
        let (width, height) = resolution.size();
        let mut output = self.output.lock();
        if output.resolution == resolution && self.device.display_size() == Some((width, height)) {
            return Ok(());
        }
        self.device.configure_display(width, height)?;
        output.resolution = resolution;
        output.viewport = RectF::new(0.0, 0.0, width as f32, height as f32);
        debug!(?resolution, width, height, "[context] output resolution");
        Ok(())
    }

    pub fn viewport(&self) -> RectF {
        self.output.lock().viewport
    }

    /// Restricts drawing to part of the display, e.g. a window's video area.
    pub fn set_viewport(&self, viewport: RectF) {
        self.output.lock().viewport = viewport;
    }
}

/// Held display lock. Dropping it releases the lock.
pub struct DisplayGuard<'a> {
    context: &'a RenderingContext,
    guard: Option<MutexGuard<'a, ()>>,
}

impl DisplayGuard<'_> {
    /// Runs `f` with the display lock released, reacquiring it afterwards.
    /// Exclusive renderer access must be taken this way.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        if self.guard.take().is_some() {
            DISPLAY_LOCKS_HELD.with(|held| held.set(held.get().saturating_sub(1)));
        }
        let result = f();
        self.guard = Some(self.context.display.lock());
        DISPLAY_LOCKS_HELD.with(|held| held.set(held.get() + 1));
        self.context.device.make_current();
        result
    }
}

impl Drop for DisplayGuard<'_> {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            DISPLAY_LOCKS_HELD.with(|held| held.set(held.get().saturating_sub(1)));
        }
    }
}

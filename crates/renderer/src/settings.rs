use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::conversion::RenderMethod;
use crate::deinterlace::InterlaceMethod;
use crate::geometry::{CropRect, DisplayCaps, Resolution, ViewMode, ViewScale};

/// Ring sizes per display mode, each clamped to `1..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferCounts {
    pub windowed: usize,
    pub fullscreen: usize,
}

impl Default for BufferCounts {
    fn default() -> Self {
        Self {
            windowed: 2,
            fullscreen: 2,
        }
    }
}

impl BufferCounts {
    pub fn for_mode(&self, fullscreen: bool) -> usize {
        let n = if fullscreen { self.fullscreen } else { self.windowed };
        n.clamp(1, 3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Admission wait for the previous present to be acknowledged.
    pub flip_ack_ms: u64,
    /// Wait for the scan field matching a woven frame's parity.
    pub field_sync_ms: u64,
    /// Wait for a texture's outstanding work before parking it.
    pub texture_release_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            flip_ack_ms: 1000,
            field_sync_ms: 500,
            texture_release_ms: 500,
        }
    }
}

impl Timeouts {
    pub fn flip_ack(&self) -> Duration {
        Duration::from_millis(self.flip_ack_ms)
    }

    pub fn field_sync(&self) -> Duration {
        Duration::from_millis(self.field_sync_ms)
    }

    pub fn texture_release(&self) -> Duration {
        Duration::from_millis(self.texture_release_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewSettings {
    pub crop: CropRect,
    pub view_mode: ViewMode,
    pub custom_zoom: f32,
    pub custom_pixel_ratio: f32,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            crop: CropRect::default(),
            view_mode: ViewMode::Normal,
            custom_zoom: 1.0,
            custom_pixel_ratio: 1.0,
        }
    }
}

impl ViewSettings {
    pub fn custom(&self) -> ViewScale {
        ViewScale {
            zoom: self.custom_zoom,
            pixel_ratio: self.custom_pixel_ratio,
        }
    }
}

/// Renderer configuration supplied by the application's settings store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub render_method: RenderMethod,
    pub interlace_method: InterlaceMethod,
    pub view: ViewSettings,
    /// Screensaver dim, percent.
    pub dim_level: u8,
    /// Grey level of the bars around the picture.
    pub black_bar_colour: u8,
    pub buffers: BufferCounts,
    pub timeouts: Timeouts,
    pub present_thread: bool,
    /// Weight of each new sample in the present latency average.
    pub latency_smoothing: f64,
    pub display: DisplayCaps,
    /// Fixed output resolution; `None` picks one per source.
    pub resolution: Option<Resolution>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            render_method: RenderMethod::Auto,
            interlace_method: InterlaceMethod::Auto,
            view: ViewSettings::default(),
            dim_level: 0,
            black_bar_colour: 0,
            buffers: BufferCounts::default(),
            timeouts: Timeouts::default(),
            present_thread: true,
            latency_smoothing: 0.01,
            display: DisplayCaps::default(),
            resolution: None,
        }
    }
}

impl RenderSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading render settings {}", path.display()))?;
        let settings: Self = serde_json::from_str(&json)
            .with_context(|| format!("parsing render settings {}", path.display()))?;
        Ok(settings.sanitized())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing render settings {}", path.display()))?;
        Ok(())
    }

    /// Pulls out-of-range values back into their valid ranges.
    pub fn sanitized(mut self) -> Self {
        self.dim_level = self.dim_level.min(100);
        self.buffers.windowed = self.buffers.windowed.clamp(1, 3);
        self.buffers.fullscreen = self.buffers.fullscreen.clamp(1, 3);
        if !(self.latency_smoothing > 0.0 && self.latency_smoothing <= 1.0) {
            self.latency_smoothing = 0.01;
        }
        self
    }
}

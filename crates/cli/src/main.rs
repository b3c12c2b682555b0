use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use media_io::{FieldOrder, FrameRate, FrameSource, PatternKind, TestPatternSource};
use renderer::gpu::GpuDevice;
use renderer::{
    ConfigureParams, FieldSync, HeadlessConfig, HeadlessDevice, InterlaceMethod, PresentStats,
    RenderFlags, RenderManager, RenderMethod, RenderSettings, RenderingContext, Resolution,
    WgpuDevice,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "playback-harness")]
#[command(about = "Pumps synthetic video through the frame renderer and reports presentation statistics")]
#[command(version)]
struct Cli {
    /// Render settings JSON file
    #[arg(short, long)]
    settings: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "headless")]
    backend: Backend,

    /// Number of frames to decode
    #[arg(short, long, default_value = "50")]
    frames: u64,

    #[arg(long, default_value = "720")]
    width: u32,

    #[arg(long, default_value = "576")]
    height: u32,

    /// Frame rate (e.g., 25, 30000/1001)
    #[arg(long, default_value = "25")]
    rate: FrameRate,

    #[arg(long, value_enum, default_value = "progressive")]
    scan: Scan,

    /// Solid luma level instead of colour bars
    #[arg(long)]
    flat: Option<u8>,

    /// Override the interlace method (none, auto, bob, bob-inverted, weave, weave-inverted, blend)
    #[arg(long, value_parser = parse_kebab::<InterlaceMethod>)]
    interlace: Option<InterlaceMethod>,

    /// Override the render method (auto, lookup-table, software, low-memory)
    #[arg(long, value_parser = parse_kebab::<RenderMethod>)]
    method: Option<RenderMethod>,

    /// Take over the display instead of rendering into a window
    #[arg(long)]
    fullscreen: bool,

    /// Present as fast as possible instead of at the frame rate
    #[arg(long)]
    no_pace: bool,

    /// Display refresh rate used by the backend
    #[arg(long, default_value = "50")]
    refresh: f64,

    /// Write the final composite as PNG
    #[arg(long)]
    screenshot: Option<PathBuf>,

    /// Write a 160x120 thumbnail of the final composite as PNG
    #[arg(long)]
    thumbnail: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
enum Backend {
    Headless,
    Wgpu,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scan {
    Progressive,
    TopFirst,
    BottomFirst,
}

impl From<Scan> for FieldOrder {
    fn from(scan: Scan) -> Self {
        match scan {
            Scan::Progressive => FieldOrder::Progressive,
            Scan::TopFirst => FieldOrder::TopFirst,
            Scan::BottomFirst => FieldOrder::BottomFirst,
        }
    }
}

#[derive(Serialize)]
struct Report {
    backend: Backend,
    frames: u64,
    elapsed_ms: u64,
    render_method: Option<RenderMethod>,
    interlace_method: Option<InterlaceMethod>,
    stats: PresentStats,
}

fn parse_kebab<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = load_settings(&cli)?;
    let device = open_device(cli.backend, cli.refresh)?;
    let initial = if cli.fullscreen {
        settings.resolution.unwrap_or(Resolution::Pal4x3)
    } else {
        Resolution::Desktop {
            width: cli.width,
            height: cli.height,
        }
    };
    let context = RenderingContext::new(device, initial).context("creating rendering context")?;
    let manager = RenderManager::new(context, settings);

    let order = FieldOrder::from(cli.scan);
    let mut params = ConfigureParams::new(cli.width, cli.height, cli.width, cli.height, cli.rate);
    params.field_order = order;
    params.fullscreen = cli.fullscreen;
    if !manager.configure(params) {
        bail!("renderer rejected {}x{} at {} fps", cli.width, cli.height, cli.rate.as_f64());
    }
    info!(
        width = cli.width,
        height = cli.height,
        fps = cli.rate.as_f64(),
        ?order,
        presenter = manager.is_presenter_running(),
        "[harness] configured"
    );

    let kind = match cli.flat {
        Some(luma) => PatternKind::Flat([luma, 128, 128]),
        None => PatternKind::ColourBars,
    };
    let mut source = TestPatternSource::new(cli.width, cli.height, cli.rate, kind)
        .with_field_order(order)
        .with_limit(cli.frames);

    let started = Instant::now();
    let mut frames = 0;
    while let Some(decoded) = source.next_frame().context("generating frame")? {
        let height = decoded.frame.height();
        let rows = 16.min(height);
        for y in (0..height).step_by(rows as usize) {
            if !manager.draw_slice(&decoded.frame.slice(y, rows.min(height - y))) {
                warn!(pts = decoded.pts, row = y, "[harness] slice dropped");
            }
        }
        frames += 1;

        let fields = flip_fields(decoded.field);
        let delay = if cli.no_pace {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(source.rate().frame_duration_secs() / fields.len() as f64)
        };
        for &field in fields {
            if !manager.flip_page(delay, field) {
                warn!(pts = decoded.pts, ?field, "[harness] flip refused");
                continue;
            }
            if !cli.fullscreen {
                manager.render_update(true, render_flags(field), 255);
            }
        }
        debug!(pts = decoded.pts, "[harness] frame flipped");
    }
    if !manager.wait_idle(Duration::from_secs(5)) {
        warn!("[harness] presenter still busy");
    }
    let elapsed = started.elapsed();

    if let Some(path) = &cli.screenshot {
        let image = manager
            .setup_screenshot(None)
            .context("no composite to capture")?;
        save_png(&image, path)?;
    }
    if let Some(path) = &cli.thumbnail {
        let image = manager
            .create_thumbnail(160, 120)
            .context("no composite to capture")?;
        save_png(&image, path)?;
    }

    let report = Report {
        backend: cli.backend,
        frames,
        elapsed_ms: elapsed.as_millis() as u64,
        render_method: manager.inspect(|r| r.render_method()).flatten(),
        interlace_method: manager.inspect(|r| r.interlace_method()),
        stats: manager.stats(),
    };
    manager.uninit();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<RenderSettings> {
    let mut settings = match &cli.settings {
        Some(path) => RenderSettings::load(path)?,
        None => RenderSettings::default(),
    };
    if let Some(method) = cli.interlace {
        settings.interlace_method = method;
    }
    if let Some(method) = cli.method {
        settings.render_method = method;
    }
    Ok(settings.sanitized())
}

fn open_device(backend: Backend, refresh_hz: f64) -> Result<Arc<dyn GpuDevice>> {
    Ok(match backend {
        Backend::Headless => Arc::new(HeadlessDevice::new(HeadlessConfig {
            refresh_hz,
            ..Default::default()
        })),
        Backend::Wgpu => Arc::new(WgpuDevice::new(refresh_hz).context("opening wgpu device")?),
    })
}

/// Flips per decoded frame: interlaced frames are flipped once per field,
/// earliest field first.
fn flip_fields(order: FieldOrder) -> &'static [FieldSync] {
    match order {
        FieldOrder::Progressive => &[FieldSync::None],
        FieldOrder::TopFirst => &[FieldSync::Odd, FieldSync::Even],
        FieldOrder::BottomFirst => &[FieldSync::Even, FieldSync::Odd],
    }
}

fn render_flags(field: FieldSync) -> RenderFlags {
    match field {
        FieldSync::Odd => RenderFlags::ODD,
        FieldSync::Even => RenderFlags::EVEN,
        FieldSync::Both => RenderFlags::ODD | RenderFlags::EVEN,
        FieldSync::None => RenderFlags::NONE,
    }
}

fn save_png(image: &image::RgbaImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), width = image.width(), height = image.height(), "[harness] image written");
    Ok(())
}

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color::{ConversionModel, DirectConverter, PixelConverter};
use media_io::{ChromaFormat, FieldOrder, FrameRate, PlanarFrame};
use renderer::gpu::{GpuDevice, ScanField};
use renderer::settings::Timeouts;
use renderer::{
    ConfigureParams, FieldSync, HeadlessConfig, HeadlessDevice, InterlaceMethod, RenderFlags,
    RenderManager, RenderMethod, RenderSettings, RenderingContext, Resolution, VideoRenderer,
};

fn headless() -> (Arc<HeadlessDevice>, Arc<RenderingContext>) {
    let headless = Arc::new(HeadlessDevice::new(HeadlessConfig::default()));
    let device: Arc<dyn GpuDevice> = headless.clone();
    let context = RenderingContext::new(device, Resolution::Ntsc4x3).expect("context");
    (headless, context)
}

fn params(width: u32, height: u32) -> ConfigureParams {
    ConfigureParams::new(width, height, width, height, FrameRate::NTSC)
}

fn feed(renderer: &VideoRenderer, yuv: [u8; 3]) {
    let p = *renderer.params().expect("configured");
    let frame = PlanarFrame::solid(p.width, p.height, ChromaFormat::YUV420, yuv).expect("frame");
    assert!(renderer.draw_slice(&frame.slice(0, p.height)).expect("slice"));
}

#[test]
fn synthetic_frame_reaches_the_display() {
    let (headless, context) = headless();
    let manager = RenderManager::new(context, RenderSettings::default());
    assert!(manager.configure(params(720, 480)));
    assert_eq!(manager.inspect(|r| r.ring().count()), Some(2));
    assert_eq!(manager.inspect(|r| r.ring().decode_index()), Some(0));

    let frame = PlanarFrame::solid(720, 480, ChromaFormat::YUV420, [235, 128, 128]).expect("frame");
    for y in (0..480).step_by(32) {
        assert!(manager.draw_slice(&frame.slice(y, 32)));
        let expected = if y + 32 >= 480 { 1 } else { 0 };
        assert_eq!(manager.inspect(|r| r.ring().decode_index()), Some(expected));
    }

    assert!(manager.flip_page(Duration::from_millis(5), FieldSync::None));
    assert!(manager.render_update(true, RenderFlags::NONE, 255));
    assert_eq!(manager.inspect(|r| r.ring().last_displayed()), Some(Some(0)));

    let reference = DirectConverter::new(ConversionModel::default()).convert(235, 128, 128);
    let image = headless.read_display().expect("display");
    let pixel = image.get_pixel(360, 240);
    for channel in 0..3 {
        let diff = (pixel[channel] as i32 - reference[channel] as i32).abs();
        assert!(diff <= 2, "channel {channel}: {:?} vs {:?}", pixel, reference);
    }
    assert!(pixel[0] >= 253);
}

#[test]
fn decode_and_render_never_share_a_slot() {
    let (_headless, context) = headless();
    let mut renderer = VideoRenderer::new(context, RenderSettings::default());
    renderer.configure(params(64, 48)).expect("configure");
    let renderer = Arc::new(renderer);
    let done = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let watcher = {
        let renderer = renderer.clone();
        let done = done.clone();
        let overlaps = overlaps.clone();
        std::thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                if let (Some(decoding), Some(rendering)) = renderer.ring().in_progress() {
                    if decoding == rendering {
                        overlaps.fetch_add(1, Ordering::Relaxed);
                    }
                }
                std::thread::yield_now();
            }
        })
    };
    let presenter = {
        let renderer = renderer.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            let mut shown = 0;
            while !done.load(Ordering::Relaxed) {
                if renderer
                    .present_frame(FieldSync::None, Duration::ZERO)
                    .expect("present")
                    .is_some()
                {
                    shown += 1;
                }
            }
            shown
        })
    };

    let source = PlanarFrame::solid(64, 48, ChromaFormat::YUV420, [120, 100, 150]).expect("frame");
    let mut decoded = 0;
    for _ in 0..200 {
        for y in (0..48).step_by(16) {
            if let Ok(true) = renderer.draw_slice(&source.slice(y, 16)) {
                decoded += 1;
            }
        }
    }
    done.store(true, Ordering::Relaxed);
    watcher.join().expect("watcher");
    let shown = presenter.join().expect("presenter");

    assert_eq!(overlaps.load(Ordering::Relaxed), 0);
    assert!(decoded > 0);
    assert!(shown > 0);
}

#[test]
fn bob_alternates_fields_in_declared_order() {
    let (headless, context) = headless();
    let settings = RenderSettings {
        interlace_method: InterlaceMethod::Bob,
        ..Default::default()
    };
    let mut renderer = VideoRenderer::new(context, settings);
    let mut p = params(64, 48);
    p.field_order = FieldOrder::TopFirst;
    renderer.configure(p).expect("configure");

    for index in 0..6 {
        feed(&renderer, [180, 128, 128]);
        let declared = if index % 2 == 0 { FieldSync::Odd } else { FieldSync::Even };
        renderer
            .present_frame(declared, Duration::ZERO)
            .expect("present")
            .expect("frame shown");
    }
    for _ in 0..3 {
        feed(&renderer, [180, 128, 128]);
        renderer
            .present_frame(FieldSync::Both, Duration::ZERO)
            .expect("present")
            .expect("frame shown");
    }

    let fields: Vec<_> = headless.presents().iter().map(|p| p.field).collect();
    assert_eq!(fields.len(), 12);
    for (index, field) in fields.iter().enumerate() {
        let expected = if index % 2 == 0 { FieldSync::Odd } else { FieldSync::Even };
        assert_eq!(*field, expected, "present {index} of {fields:?}");
    }
}

#[test]
fn teardown_waits_for_outstanding_work() {
    let (headless, context) = headless();
    let settings = RenderSettings {
        timeouts: Timeouts {
            texture_release_ms: 2000,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut renderer = VideoRenderer::new(context, settings);
    renderer.configure(params(64, 48)).expect("configure");
    let live = headless.live_textures();

    headless.set_deferred(true);
    let frame = PlanarFrame::solid(64, 48, ChromaFormat::YUV420, [90, 60, 200]).expect("frame");
    renderer.draw_slice(&frame.slice(0, 48)).expect("slice");
    assert!(headless.outstanding_signals() > 0);

    let completer = {
        let headless = headless.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            headless.complete_deferred()
        })
    };
    renderer.uninit();
    assert!(completer.join().expect("completer") > 0);

    assert_eq!(headless.destroy_violations(), 0);
    assert_eq!(headless.live_textures(), 0);
    assert!(headless.destroyed_textures() >= live);
}

#[test]
fn unresolved_work_leaks_instead_of_freeing() {
    let (headless, context) = headless();
    let settings = RenderSettings {
        timeouts: Timeouts {
            texture_release_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut renderer = VideoRenderer::new(context, settings);
    renderer.configure(params(32, 16)).expect("configure");
    headless.set_deferred(true);
    feed(&renderer, [50, 128, 128]);
    renderer.uninit();

    assert_eq!(headless.destroy_violations(), 0);
    assert!(headless.live_textures() > 0);
}

#[test]
fn identical_configure_keeps_resources() {
    let (headless, context) = headless();
    let manager = RenderManager::new(context, RenderSettings::default());
    assert!(manager.configure(params(320, 240)));
    let live = headless.live_textures();
    let created = live + headless.destroyed_textures();

    assert!(manager.configure(params(320, 240)));
    assert_eq!(headless.live_textures(), live);
    assert_eq!(headless.live_textures() + headless.destroyed_textures(), created);
    assert_eq!(manager.inspect(|r| r.ring().count()), Some(2));
    assert_eq!(
        manager.inspect(|r| r.ring().config().map(|c| (c.width, c.height))),
        Some(Some((320, 240)))
    );
}

#[test]
fn weave_gives_up_on_a_stuck_field() {
    let (headless, context) = headless();
    headless.set_stuck_field(Some(ScanField::Odd));
    let settings = RenderSettings {
        interlace_method: InterlaceMethod::Weave,
        timeouts: Timeouts {
            field_sync_ms: 60,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut renderer = VideoRenderer::new(context, settings);
    renderer.configure(params(64, 48)).expect("configure");
    feed(&renderer, [200, 128, 128]);

    let start = Instant::now();
    let outcome = renderer
        .present_frame(FieldSync::Even, Duration::ZERO)
        .expect("present")
        .expect("frame shown");
    let elapsed = start.elapsed();
    assert_eq!(outcome.fields, vec![FieldSync::Even]);
    assert!(elapsed >= Duration::from_millis(60), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
}

#[test]
fn missing_lookup_memory_falls_back_to_software() {
    let (headless, context) = headless();
    headless.set_max_texture_bytes(Some(200_000));
    let mut renderer = VideoRenderer::new(context, RenderSettings::default());
    renderer.configure(params(64, 48)).expect("configure");
    assert_eq!(renderer.render_method(), Some(RenderMethod::Software));

    feed(&renderer, [235, 128, 128]);
    assert!(renderer.render_update(true, RenderFlags::NONE, 255).expect("render"));
    let image = headless.read_display().expect("display");
    assert!(image.get_pixel(360, 240)[0] >= 254);
}

#[test]
fn missing_target_memory_composites_directly() {
    let (headless, context) = headless();
    headless.set_max_texture_bytes(Some(1_000_000));
    let settings = RenderSettings {
        resolution: Some(Resolution::Ntsc4x3),
        present_thread: false,
        ..Default::default()
    };
    let mut renderer = VideoRenderer::new(context, settings);
    let mut p = params(720, 480);
    p.fullscreen = true;
    renderer.configure(p).expect("configure");
    assert_eq!(renderer.render_method(), Some(RenderMethod::LowMemory));

    feed(&renderer, [235, 128, 128]);
    renderer
        .present_frame(FieldSync::None, Duration::ZERO)
        .expect("present")
        .expect("frame shown");
    let image = headless.read_display().expect("display");
    assert!(image.get_pixel(360, 240)[1] >= 253);
}

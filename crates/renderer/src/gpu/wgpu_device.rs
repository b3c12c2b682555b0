use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::mpsc::channel;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use image::RgbaImage;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};
use wgpu::util::DeviceExt;

use super::{
    clip_to_target, completion_pair, CompletionToken, ConvertPass, DrawPass, DrawSource,
    GpuDevice, PlaneSource, Retired, ScanField, TextureDesc, TextureFormat, TextureId,
    VblankClock,
};
use crate::deinterlace::FieldSync;
use crate::geometry::{Rect, RectF};
use crate::RendererError;

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct PassUniforms {
    src_rect: [f32; 4],
    frame: [f32; 4],
    siting: [f32; 4],
    range: [f32; 4],
    coeff_a: [f32; 4],
    coeff_b: [f32; 4],
    tint: [f32; 4],
    control: [u32; 4],
}

impl PassUniforms {
    fn for_planes(source: &PlaneSource, src: RectF, lines: u32, alpha: u8) -> Self {
        let params = color::direct::TransformParams::new(source.model);
        let c = params.coefficients;
        let chroma = source.chroma;
        let (cw, ch) = chroma.plane_size(media_io::PlaneKind::ChromaU, source.width, source.height);
        let h_off = if chroma.shift_x > 0 {
            source.siting.horizontal
        } else {
            0.0
        };
        let v_off = if chroma.shift_y > 0 {
            match source.field {
                color::FieldSelect::Full => 0.0,
                color::FieldSelect::Odd => source.siting.field_vertical,
                color::FieldSelect::Even => -source.siting.field_vertical,
            }
        } else {
            0.0
        };
        let (row_offset, row_step) = match source.field {
            color::FieldSelect::Full => (0.0, 1.0),
            color::FieldSelect::Odd => (0.0, 2.0),
            color::FieldSelect::Even => (1.0, 2.0),
        };
        Self {
            src_rect: [src.x0, src.y0, src.x1, src.y1],
            frame: [cw as f32, ch as f32, chroma.shift_x as f32, chroma.shift_y as f32],
            siting: [h_off, v_off, row_offset, row_step],
            range: [params.y_min, params.u_min, params.v_min, params.y_span],
            coeff_a: [c.r_u, c.r_v, c.g_u, c.g_v],
            coeff_b: [c.b_u, c.b_v, params.uv_span, 0.0],
            tint: [0.0, 0.0, 0.0, alpha as f32 / 255.0],
            control: [lines, 0, 0, 0],
        }
    }

    fn for_image(src: RectF, lines: u32, alpha: u8) -> Self {
        Self {
            src_rect: [src.x0, src.y0, src.x1, src.y1],
            tint: [0.0, 0.0, 0.0, alpha as f32 / 255.0],
            control: [lines, 0, 0, 0],
            ..Default::default()
        }
    }

    fn solid(rgba: [u8; 4]) -> Self {
        Self {
            tint: rgba.map(|c| c as f32 / 255.0),
            ..Default::default()
        }
    }
}

struct DeviceTexture {
    desc: TextureDesc,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct DisplayTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

#[derive(Default)]
struct WgpuState {
    next_id: u64,
    textures: HashMap<TextureId, DeviceTexture>,
    display: Option<DisplayTarget>,
    presents: u64,
}

impl WgpuState {
    fn view(&self, id: TextureId) -> Result<&wgpu::TextureView, RendererError> {
        self.textures
            .get(&id)
            .map(|t| &t.view)
            .ok_or(RendererError::UnknownTexture(id))
    }
}

/// Backend on a real adapter. The display is an offscreen RGBA target that
/// `present` submits and `read_display` copies back.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    pipelines: Pipelines,
    state: Mutex<WgpuState>,
    clock: VblankClock,
}

impl WgpuDevice {
    pub async fn request(refresh_hz: f64) -> Result<Self, RendererError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(RendererError::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("video-renderer.device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        let adapter_name = adapter.get_info().name;
        info!(adapter = %adapter_name, "[wgpu] device ready");
        let pipelines = Pipelines::new(&device);
        Ok(Self {
            device,
            queue,
            adapter_name,
            pipelines,
            state: Mutex::new(WgpuState {
                next_id: 1,
                ..Default::default()
            }),
            clock: VblankClock::new(refresh_hz),
        })
    }

    /// Blocking variant of [`WgpuDevice::request`].
    pub fn new(refresh_hz: f64) -> Result<Self, RendererError> {
        pollster::block_on(Self::request(refresh_hz))
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) -> CompletionToken {
        self.queue.submit(std::iter::once(encoder.finish()));
        self.track_submitted()
    }

    /// Token for everything submitted so far, including staged writes.
    fn track_submitted(&self) -> CompletionToken {
        let (signal, token) = completion_pair();
        self.queue.on_submitted_work_done(move || signal.complete());
        self.device.poll(wgpu::Maintain::Poll);
        token
    }

    fn encoder(&self, label: &'static str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn uniform_buffer(&self, uniforms: &PassUniforms) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("video-renderer.pass-uniforms"),
                contents: bytemuck::bytes_of(uniforms),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    fn plane_bind_groups(
        &self,
        state: &WgpuState,
        source: &PlaneSource,
        uniforms: &wgpu::Buffer,
    ) -> Result<(wgpu::BindGroup, Option<wgpu::BindGroup>), RendererError> {
        let view = |id: TextureId| state.view(id);
        let planes = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("video-renderer.planes.bind_group"),
            layout: &self.pipelines.planes_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view(source.planes[0])?),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(view(source.planes[1])?),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(view(source.planes[2])?),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.pipelines.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        });
        let tables = match source.tables {
            Some(ids) => Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("video-renderer.tables.bind_group"),
                layout: &self.pipelines.tables_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(view(ids.luma)?),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(view(ids.chroma_coarse)?),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(view(ids.chroma_error)?),
                    },
                ],
            })),
            None => None,
        };
        Ok((planes, tables))
    }

    fn image_bind_group(
        &self,
        view: &wgpu::TextureView,
        uniforms: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("video-renderer.image.bind_group"),
            layout: &self.pipelines.image_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        })
    }

    fn run_pass(
        &self,
        label: &'static str,
        target: &wgpu::TextureView,
        viewport: Rect,
        pipeline: &wgpu::RenderPipeline,
        groups: &[&wgpu::BindGroup],
        clear: Option<wgpu::Color>,
    ) -> CompletionToken {
        let mut encoder = self.encoder(label);
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(label),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_viewport(
                viewport.x as f32,
                viewport.y as f32,
                viewport.width as f32,
                viewport.height as f32,
                0.0,
                1.0,
            );
            pass.set_pipeline(pipeline);
            for (index, group) in groups.iter().enumerate() {
                pass.set_bind_group(index as u32, group, &[]);
            }
            pass.set_vertex_buffer(0, self.pipelines.vertex_buffer.slice(..));
            pass.set_index_buffer(
                self.pipelines.index_buffer.slice(..),
                wgpu::IndexFormat::Uint16,
            );
            pass.draw_indexed(0..6, 0, 0..1);
        }
        self.submit(encoder)
    }

    fn display_view(state: &WgpuState) -> Result<(&wgpu::TextureView, u32, u32), RendererError> {
        state
            .display
            .as_ref()
            .map(|d| (&d.view, d.width, d.height))
            .ok_or_else(|| RendererError::InvalidConfiguration("display not configured".into()))
    }

    fn map_to_cpu(
        &self,
        staging: &wgpu::Buffer,
        row_pitch: u32,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, RendererError> {
        let slice = staging.slice(..row_pitch as u64 * height as u64);
        let (tx, rx) = channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => return Err(RendererError::BufferAsync),
        }

        let mapped = slice.get_mapped_range();
        let row_stride = width as usize * 4;
        let mut pixels = vec![0u8; row_stride * height as usize];
        for row in 0..height as usize {
            let src = row * row_pitch as usize;
            pixels[row * row_stride..(row + 1) * row_stride]
                .copy_from_slice(&mapped[src..src + row_stride]);
        }
        drop(mapped);
        staging.unmap();

        RgbaImage::from_raw(width, height, pixels).ok_or(RendererError::BufferAsync)
    }
}

impl GpuDevice for WgpuDevice {
    fn name(&self) -> &str {
        &self.adapter_name
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId, RendererError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RendererError::InvalidConfiguration(format!(
                "texture '{}' has a zero dimension",
                desc.label
            )));
        }
        let limit = self.device.limits().max_texture_dimension_2d;
        if desc.width > limit || desc.height > limit {
            return Err(RendererError::Allocation(format!(
                "'{}' is {}x{}, device limit {limit}",
                desc.label, desc.width, desc.height
            )));
        }

        let format = match desc.format {
            TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
            TextureFormat::Rgba8 => TARGET_FORMAT,
        };
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(RendererError::Allocation(format!("'{}': {err}", desc.label)));
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut state = self.state.lock();
        let id = TextureId(state.next_id);
        state.next_id += 1;
        state.textures.insert(
            id,
            DeviceTexture {
                desc: *desc,
                texture,
                view,
            },
        );
        debug!(id = id.0, label = desc.label, "[wgpu] texture created");
        Ok(id)
    }

    fn destroy_texture(&self, retired: Retired) {
        if let Some(texture) = self.state.lock().textures.remove(&retired.id()) {
            texture.texture.destroy();
        }
    }

    fn write_texture(
        &self,
        id: TextureId,
        data: &[u8],
        bytes_per_row: u32,
    ) -> Result<CompletionToken, RendererError> {
        {
            let state = self.state.lock();
            let texture = state
                .textures
                .get(&id)
                .ok_or(RendererError::UnknownTexture(id))?;
            let desc = texture.desc;
            let row_bytes = desc.width * desc.format.bytes_per_pixel();
            let needed = (desc.height as usize - 1) * bytes_per_row as usize + row_bytes as usize;
            if bytes_per_row < row_bytes || data.len() < needed {
                return Err(RendererError::InvalidConfiguration(format!(
                    "write to '{}' needs {needed} bytes at stride {bytes_per_row}, got {}",
                    desc.label,
                    data.len()
                )));
            }
            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &texture.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                data,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(desc.height),
                },
                wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
            );
        }
        self.queue.submit(std::iter::empty());
        Ok(self.track_submitted())
    }

    fn fill_texture(&self, id: TextureId, value: [u8; 4]) -> Result<CompletionToken, RendererError> {
        let desc = self
            .state
            .lock()
            .textures
            .get(&id)
            .map(|t| t.desc)
            .ok_or(RendererError::UnknownTexture(id))?;
        let bpp = desc.format.bytes_per_pixel() as usize;
        let data: Vec<u8> = value[..bpp]
            .iter()
            .copied()
            .cycle()
            .take(desc.bytes())
            .collect();
        self.write_texture(id, &data, desc.width * bpp as u32)
    }

    #[instrument(name = "wgpu.convert", skip_all, fields(width = pass.source.width, height = pass.source.height))]
    fn convert(&self, pass: &ConvertPass) -> Result<CompletionToken, RendererError> {
        let state = self.state.lock();
        let (width, rows) = pass.source.image_size();
        let target = state
            .textures
            .get(&pass.target)
            .ok_or(RendererError::UnknownTexture(pass.target))?;
        if target.desc.format != TextureFormat::Rgba8
            || target.desc.width != width
            || target.desc.height != rows
        {
            return Err(RendererError::InvalidConfiguration(format!(
                "target '{}' is {}x{}, conversion yields {width}x{rows} RGBA",
                target.desc.label, target.desc.width, target.desc.height
            )));
        }
        let src = RectF::new(0.0, 0.0, width as f32, rows as f32);
        let uniforms = self.uniform_buffer(&PassUniforms::for_planes(&pass.source, src, 0, 255));
        let (planes, tables) = self.plane_bind_groups(&state, &pass.source, &uniforms)?;
        let viewport = Rect {
            x: 0,
            y: 0,
            width,
            height: rows,
        };
        let token = match &tables {
            Some(tables) => self.run_pass(
                "video-renderer.convert.lookup",
                &target.view,
                viewport,
                &self.pipelines.lookup,
                &[&planes, tables],
                None,
            ),
            None => self.run_pass(
                "video-renderer.convert.direct",
                &target.view,
                viewport,
                &self.pipelines.direct,
                &[&planes],
                None,
            ),
        };
        Ok(token)
    }

    #[instrument(name = "wgpu.draw", skip_all, fields(alpha = pass.alpha))]
    fn draw(&self, pass: &DrawPass) -> Result<CompletionToken, RendererError> {
        let state = self.state.lock();
        let (display, width, height) = Self::display_view(&state)?;
        let Some((src, dst)) = clip_to_target(pass.src, pass.dst, width, height) else {
            return Ok(CompletionToken::completed());
        };
        let lines = pass.lines.index();
        let token = match &pass.source {
            DrawSource::Converted(id) => {
                let texture = state
                    .textures
                    .get(id)
                    .ok_or(RendererError::UnknownTexture(*id))?;
                let uniforms = self.uniform_buffer(&PassUniforms::for_image(src, lines, pass.alpha));
                let group = self.image_bind_group(&texture.view, &uniforms);
                self.run_pass(
                    "video-renderer.draw.image",
                    display,
                    dst,
                    &self.pipelines.image,
                    &[&group],
                    None,
                )
            }
            DrawSource::Planes(source) => {
                let uniforms =
                    self.uniform_buffer(&PassUniforms::for_planes(source, src, lines, pass.alpha));
                let (planes, tables) = self.plane_bind_groups(&state, source, &uniforms)?;
                match &tables {
                    Some(tables) => self.run_pass(
                        "video-renderer.draw.lookup",
                        display,
                        dst,
                        &self.pipelines.lookup,
                        &[&planes, tables],
                        None,
                    ),
                    None => self.run_pass(
                        "video-renderer.draw.direct",
                        display,
                        dst,
                        &self.pipelines.direct,
                        &[&planes],
                        None,
                    ),
                }
            }
        };
        Ok(token)
    }

    fn configure_display(&self, width: u32, height: u32) -> Result<(), RendererError> {
        if width == 0 || height == 0 {
            return Err(RendererError::InvalidConfiguration(format!(
                "display {width}x{height} has a zero dimension"
            )));
        }
        let mut state = self.state.lock();
        if matches!(&state.display, Some(d) if d.width == width && d.height == height) {
            return Ok(());
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("video-renderer.display"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        state.display = Some(DisplayTarget {
            texture,
            view,
            width,
            height,
        });
        drop(state);
        self.clear_display([0, 0, 0]).map(|_| ())
    }

    fn display_size(&self) -> Option<(u32, u32)> {
        self.state
            .lock()
            .display
            .as_ref()
            .map(|d| (d.width, d.height))
    }

    fn clear_display(&self, rgb: [u8; 3]) -> Result<CompletionToken, RendererError> {
        let state = self.state.lock();
        let (display, width, height) = Self::display_view(&state)?;
        let uniforms = self.uniform_buffer(&PassUniforms::solid([rgb[0], rgb[1], rgb[2], 0]));
        let group = self.image_bind_group(&self.pipelines.blank_view, &uniforms);
        let color = wgpu::Color {
            r: rgb[0] as f64 / 255.0,
            g: rgb[1] as f64 / 255.0,
            b: rgb[2] as f64 / 255.0,
            a: 1.0,
        };
        Ok(self.run_pass(
            "video-renderer.clear",
            display,
            Rect {
                x: 0,
                y: 0,
                width,
                height,
            },
            &self.pipelines.solid,
            &[&group],
            Some(color),
        ))
    }

    fn shade_display(&self, rgba: [u8; 4]) -> Result<CompletionToken, RendererError> {
        let state = self.state.lock();
        let (display, width, height) = Self::display_view(&state)?;
        let uniforms = self.uniform_buffer(&PassUniforms::solid(rgba));
        let group = self.image_bind_group(&self.pipelines.blank_view, &uniforms);
        Ok(self.run_pass(
            "video-renderer.shade",
            display,
            Rect {
                x: 0,
                y: 0,
                width,
                height,
            },
            &self.pipelines.solid,
            &[&group],
            None,
        ))
    }

    fn present(&self, field: FieldSync) -> Result<CompletionToken, RendererError> {
        let mut state = self.state.lock();
        if state.display.is_none() {
            return Err(RendererError::InvalidConfiguration(
                "present without a display".into(),
            ));
        }
        state.presents += 1;
        debug!(sequence = state.presents, ?field, "[wgpu] present");
        drop(state);
        self.queue.submit(std::iter::empty());
        Ok(self.track_submitted())
    }

    fn read_display(&self) -> Result<RgbaImage, RendererError> {
        let state = self.state.lock();
        let display = state
            .display
            .as_ref()
            .ok_or_else(|| RendererError::InvalidConfiguration("display not configured".into()))?;
        let (width, height) = (display.width, display.height);
        let row_pitch = align_to(width * 4, COPY_ALIGNMENT);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("video-renderer.readback"),
            size: row_pitch as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self.encoder("video-renderer.readback");
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &display.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(row_pitch),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        drop(state);
        self.queue.submit(std::iter::once(encoder.finish()));
        self.map_to_cpu(&staging, row_pitch, width, height)
    }

    fn scan_field(&self) -> ScanField {
        self.clock.field(false)
    }

    fn wait_for_vblank(&self, timeout: Duration) -> bool {
        self.clock.wait_for_vblank(timeout)
    }

    fn wait_for(&self, token: &CompletionToken, timeout: Duration) -> bool {
        if token.is_complete() {
            return true;
        }
        // Callbacks only fire from poll; Wait drains everything submitted so far.
        self.device.poll(wgpu::Maintain::Wait);
        token.wait_timeout(timeout)
    }
}

struct Pipelines {
    sampler: wgpu::Sampler,
    planes_layout: wgpu::BindGroupLayout,
    tables_layout: wgpu::BindGroupLayout,
    image_layout: wgpu::BindGroupLayout,
    direct: wgpu::RenderPipeline,
    lookup: wgpu::RenderPipeline,
    image: wgpu::RenderPipeline,
    solid: wgpu::RenderPipeline,
    /// Bound in place of an image for solid fills.
    blank_view: wgpu::TextureView,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl Pipelines {
    fn new(device: &wgpu::Device) -> Self {
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("video-renderer.chroma-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let yuv_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("video-renderer.yuv.shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("../shaders/yuv.wgsl"))),
        });
        let draw_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("video-renderer.draw.shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("../shaders/draw.wgsl"))),
        });

        let planes_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("video-renderer.planes.layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                uniform_entry(4),
            ],
        });
        let tables_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("video-renderer.tables.layout"),
            entries: &[texture_entry(0), texture_entry(1), texture_entry(2)],
        });
        let image_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("video-renderer.image.layout"),
            entries: &[texture_entry(0), uniform_entry(1)],
        });

        let pipeline = |label: &'static str,
                        module: &wgpu::ShaderModule,
                        entry_point: &'static str,
                        layouts: &[&wgpu::BindGroupLayout]| {
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: layouts,
                push_constant_ranges: &[],
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: "vs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[quad_vertex_layout()],
                },
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: TARGET_FORMAT,
                        blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };

        let direct = pipeline(
            "video-renderer.direct.pipeline",
            &yuv_shader,
            "fs_direct",
            &[&planes_layout],
        );
        let lookup = pipeline(
            "video-renderer.lookup.pipeline",
            &yuv_shader,
            "fs_lookup",
            &[&planes_layout, &tables_layout],
        );
        let image = pipeline(
            "video-renderer.image.pipeline",
            &draw_shader,
            "fs_draw",
            &[&image_layout],
        );
        let solid = pipeline(
            "video-renderer.solid.pipeline",
            &draw_shader,
            "fs_solid",
            &[&image_layout],
        );

        let blank = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("video-renderer.blank"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let blank_view = blank.create_view(&wgpu::TextureViewDescriptor::default());

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("video-renderer.vertex-buffer"),
            contents: bytemuck::cast_slice(&QUAD_VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("video-renderer.index-buffer"),
            contents: bytemuck::cast_slice(&QUAD_INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        Self {
            sampler,
            planes_layout,
            tables_layout,
            image_layout,
            direct,
            lookup,
            image,
            solid,
            blank_view,
            vertex_buffer,
            index_buffer,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct VertexPacked {
    position: [f32; 2],
    tex_coords: [f32; 2],
}

const QUAD_VERTICES: [VertexPacked; 4] = [
    VertexPacked {
        position: [-1.0, -1.0],
        tex_coords: [0.0, 1.0],
    },
    VertexPacked {
        position: [1.0, -1.0],
        tex_coords: [1.0, 1.0],
    },
    VertexPacked {
        position: [1.0, 1.0],
        tex_coords: [1.0, 0.0],
    },
    VertexPacked {
        position: [-1.0, 1.0],
        tex_coords: [0.0, 0.0],
    },
];

const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

const QUAD_VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 2] = [
    wgpu::VertexAttribute {
        offset: 0,
        shader_location: 0,
        format: wgpu::VertexFormat::Float32x2,
    },
    wgpu::VertexAttribute {
        offset: std::mem::size_of::<[f32; 2]>() as u64,
        shader_location: 1,
        format: wgpu::VertexFormat::Float32x2,
    },
];

fn quad_vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<VertexPacked>() as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &QUAD_VERTEX_ATTRIBUTES,
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    if value == 0 {
        return alignment;
    }
    ((value + alignment - 1) / alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::LineMask;
    use color::{ChromaSiting, ConversionModel, FieldSelect};
    use media_io::ChromaFormat;

    fn init_device() -> Option<WgpuDevice> {
        match WgpuDevice::new(60.0) {
            Ok(device) => Some(device),
            Err(err) => {
                eprintln!("skipping GPU test: {err}");
                None
            }
        }
    }

    #[test]
    fn align_rounds_up_to_copy_pitch() {
        assert_eq!(align_to(720 * 4, COPY_ALIGNMENT), 3072);
        assert_eq!(align_to(0, COPY_ALIGNMENT), COPY_ALIGNMENT);
    }

    #[test]
    fn uniforms_pick_field_rows() {
        let source = PlaneSource {
            planes: [TextureId(1), TextureId(2), TextureId(3)],
            width: 8,
            height: 6,
            chroma: ChromaFormat::YUV420,
            field: FieldSelect::Even,
            model: ConversionModel::default(),
            siting: ChromaSiting::default(),
            tables: None,
        };
        let u = PassUniforms::for_planes(&source, RectF::new(0.0, 0.0, 8.0, 3.0), 0, 255);
        assert_eq!(u.siting, [0.25, -0.125, 1.0, 2.0]);
        assert_eq!(&u.frame[..2], &[4.0, 3.0]);
    }

    #[test]
    fn grey_frame_reaches_display() {
        let Some(device) = init_device() else {
            return;
        };
        let planes: Vec<TextureId> = [(4, 4, 126u8), (2, 2, 128), (2, 2, 128)]
            .into_iter()
            .map(|(w, h, value)| {
                let id = device
                    .create_texture(&TextureDesc {
                        label: "test.plane",
                        width: w,
                        height: h,
                        format: TextureFormat::R8,
                    })
                    .expect("plane");
                device.fill_texture(id, [value; 4]).expect("fill");
                id
            })
            .collect();
        device.configure_display(4, 4).expect("display");
        let source = PlaneSource {
            planes: [planes[0], planes[1], planes[2]],
            width: 4,
            height: 4,
            chroma: ChromaFormat::YUV420,
            field: FieldSelect::Full,
            model: ConversionModel::default(),
            siting: ChromaSiting::default(),
            tables: None,
        };
        device
            .draw(&DrawPass {
                source: DrawSource::Planes(source),
                src: RectF::new(0.0, 0.0, 4.0, 4.0),
                dst: Rect {
                    x: 0,
                    y: 0,
                    width: 4,
                    height: 4,
                },
                lines: LineMask::All,
                alpha: 255,
            })
            .expect("draw");
        let image = device.read_display().expect("readback");
        let px = image.get_pixel(1, 1).0;
        for ch in &px[..3] {
            assert!((*ch as i32 - 127).abs() <= 2, "pixel {px:?}");
        }
    }
}

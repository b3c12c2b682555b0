//! Device textures for frame planes, conversion targets and lookup tables.

use std::sync::Arc;
use std::time::Duration;

use color::{ConversionModel, FieldSelect, LookupTables};
use media_io::PlaneKind;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::gpu::{
    CompletionToken, GpuDevice, GpuTexture, LookupTableIds, ReleaseQueue, TextureDesc,
    TextureFormat, TextureId,
};
use crate::ring::FrameSlot;
use crate::RendererError;

const PLANE_LABELS: [&str; 3] = ["plane.y", "plane.u", "plane.v"];

/// Luma, U and V textures of one ring slot.
#[derive(Debug)]
pub struct FrameTextures {
    planes: [GpuTexture; 3],
}

impl FrameTextures {
    pub fn ids(&self) -> [TextureId; 3] {
        [self.planes[0].id(), self.planes[1].id(), self.planes[2].id()]
    }

    pub fn mark_used(&self, token: &CompletionToken) {
        for plane in &self.planes {
            plane.mark_used(token);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.planes.iter().map(GpuTexture::outstanding).sum()
    }
}

/// How many RGBA conversion targets the active strategy renders through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetLayout {
    /// Planes are converted while compositing.
    #[default]
    None,
    /// One full-height target.
    Full,
    /// One half-height target per field.
    Fields,
}

impl TargetLayout {
    pub fn count(self) -> usize {
        match self {
            TargetLayout::None => 0,
            TargetLayout::Full => 1,
            TargetLayout::Fields => 2,
        }
    }
}

#[derive(Debug, Default)]
struct Targets {
    layout: TargetLayout,
    width: u32,
    height: u32,
    full: Option<GpuTexture>,
    odd: Option<GpuTexture>,
    even: Option<GpuTexture>,
}

impl Targets {
    fn get(&self, field: FieldSelect) -> Option<&GpuTexture> {
        match (self.layout, field) {
            (TargetLayout::Full, FieldSelect::Full) => self.full.as_ref(),
            (TargetLayout::Fields, FieldSelect::Odd) => self.odd.as_ref(),
            (TargetLayout::Fields, FieldSelect::Even) => self.even.as_ref(),
            _ => None,
        }
    }

    fn take_all(&mut self) -> Vec<GpuTexture> {
        let taken = [self.full.take(), self.odd.take(), self.even.take()];
        self.layout = TargetLayout::None;
        taken.into_iter().flatten().collect()
    }
}

#[derive(Debug)]
struct TableSet {
    model: ConversionModel,
    luma: GpuTexture,
    chroma_coarse: GpuTexture,
    chroma_error: GpuTexture,
}

impl TableSet {
    fn ids(&self) -> LookupTableIds {
        LookupTableIds {
            luma: self.luma.id(),
            chroma_coarse: self.chroma_coarse.id(),
            chroma_error: self.chroma_error.id(),
        }
    }

    fn into_textures(self) -> [GpuTexture; 3] {
        [self.luma, self.chroma_coarse, self.chroma_error]
    }
}

/// Creates, clears and retires device textures in step with configuration
/// changes. A texture is only freed once every submission that touched it
/// has signalled completion; anything still busy after the release timeout
/// waits on a release queue.
pub struct GpuResourceManager {
    device: Arc<dyn GpuDevice>,
    release_timeout: Duration,
    parked: ReleaseQueue,
    targets: Mutex<Targets>,
    tables: Mutex<Option<TableSet>>,
}

impl GpuResourceManager {
    pub fn new(device: Arc<dyn GpuDevice>, release_timeout: Duration) -> Self {
        Self {
            device,
            release_timeout,
            parked: ReleaseQueue::new(),
            targets: Mutex::new(Targets::default()),
            tables: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn set_release_timeout(&mut self, timeout: Duration) {
        self.release_timeout = timeout;
    }

    /// Allocates plane textures for `slot` and clears them to the YUV
    /// encoding of black.
    pub fn create_frame_textures(
        &self,
        slot: &mut FrameSlot,
        black: [u8; 3],
    ) -> Result<(), RendererError> {
        if let Some(old) = slot.textures.take() {
            self.destroy_textures(old.planes);
        }
        let (width, height, chroma) = (slot.frame.width(), slot.frame.height(), slot.frame.chroma());
        let mut created = Vec::with_capacity(3);
        for kind in PlaneKind::ALL {
            let (w, h) = chroma.plane_size(kind, width, height);
            let texture = GpuTexture::create(
                &self.device,
                TextureDesc {
                    label: PLANE_LABELS[kind.index()],
                    width: w,
                    height: h,
                    format: TextureFormat::R8,
                },
            )?;
            let value = black[kind.index()];
            let token = self.device.fill_texture(texture.id(), [value, 0, 0, 0])?;
            texture.mark_used(&token);
            created.push(texture);
        }
        let planes: [GpuTexture; 3] = created
            .try_into()
            .map_err(|_| RendererError::Allocation("plane texture set".into()))?;
        slot.textures = Some(FrameTextures { planes });
        slot.uploaded = None;
        Ok(())
    }

    /// Retires the plane textures of `slot`. Textures whose work has not
    /// completed within the release timeout are parked, never freed early.
    pub fn destroy_frame_textures(&self, slot: &mut FrameSlot) {
        slot.uploaded = None;
        if let Some(textures) = slot.textures.take() {
            self.destroy_textures(textures.planes);
        }
    }

    /// Uploads the slot's planes into its textures.
    pub fn upload_frame(&self, slot: &mut FrameSlot) -> Result<(), RendererError> {
        let textures = slot.textures.as_ref().ok_or(RendererError::NotConfigured)?;
        let mut last = None;
        for kind in PlaneKind::ALL {
            let plane = slot.frame.plane(kind);
            let texture = &textures.planes[kind.index()];
            let token = self
                .device
                .write_texture(texture.id(), plane.data(), plane.stride() as u32)?;
            texture.mark_used(&token);
            last = Some(token);
        }
        slot.uploaded = last;
        Ok(())
    }

    /// Rebuilds the conversion tables when `model` differs from the cached
    /// one. Returns whether new tables were built.
    pub fn rebuild_lookup_tables(&self, model: ConversionModel) -> Result<bool, RendererError> {
        let mut tables = self.tables.lock();
        if tables.as_ref().map(|t| t.model) == Some(model) {
            return Ok(false);
        }
        if let Some(old) = tables.take() {
            self.destroy_textures(old.into_textures());
        }

        let built = LookupTables::build(model)?;
        let luma = self.table_texture("lut.luma", 256, 1, built.luma_bytes())?;
        let chroma_coarse = self.table_texture("lut.chroma", 256, 256, built.chroma_coarse_bytes())?;
        let chroma_error = self.table_texture("lut.error", 256, 256, built.chroma_error_bytes())?;
        info!(model = ?model, "[resources] lookup tables rebuilt");
        *tables = Some(TableSet {
            model,
            luma,
            chroma_coarse,
            chroma_error,
        });
        Ok(true)
    }

    fn table_texture(
        &self,
        label: &'static str,
        width: u32,
        height: u32,
        bytes: &[u8],
    ) -> Result<GpuTexture, RendererError> {
        let texture = GpuTexture::create(
            &self.device,
            TextureDesc {
                label,
                width,
                height,
                format: TextureFormat::Rgba8,
            },
        )?;
        let token = self.device.write_texture(texture.id(), bytes, width * 4)?;
        texture.mark_used(&token);
        Ok(texture)
    }

    pub fn lookup_table_ids(&self) -> Option<LookupTableIds> {
        self.tables.lock().as_ref().map(TableSet::ids)
    }

    pub fn lookup_model(&self) -> Option<ConversionModel> {
        self.tables.lock().as_ref().map(|t| t.model)
    }

    pub fn drop_lookup_tables(&self) {
        if let Some(old) = self.tables.lock().take() {
            self.destroy_textures(old.into_textures());
        }
    }

    /// Makes the conversion targets match `layout` for a `width x height`
    /// source. Unneeded targets are retired immediately. Returns whether
    /// anything was (re)allocated.
    pub fn ensure_target_layout(
        &self,
        layout: TargetLayout,
        width: u32,
        height: u32,
    ) -> Result<bool, RendererError> {
        let mut targets = self.targets.lock();
        if targets.layout == layout && targets.width == width && targets.height == height {
            return Ok(false);
        }
        let old = targets.take_all();
        self.destroy_textures(old);
        targets.width = width;
        targets.height = height;

        let create = |label, rows| {
            GpuTexture::create(
                &self.device,
                TextureDesc {
                    label,
                    width,
                    height: rows,
                    format: TextureFormat::Rgba8,
                },
            )
        };
        match layout {
            TargetLayout::None => {}
            TargetLayout::Full => {
                targets.full = Some(create("target.full", height)?);
            }
            TargetLayout::Fields => {
                let odd = create("target.odd", FieldSelect::Odd.rows(height))?;
                let even = match create("target.even", FieldSelect::Even.rows(height)) {
                    Ok(even) => even,
                    Err(err) => {
                        self.destroy_textures(vec![odd]);
                        return Err(err);
                    }
                };
                targets.odd = Some(odd);
                targets.even = Some(even);
            }
        }
        targets.layout = layout;
        debug!(?layout, width, height, "[resources] conversion targets ready");
        Ok(true)
    }

    pub fn target_layout(&self) -> TargetLayout {
        self.targets.lock().layout
    }

    /// Target that holds `field` of the converted frame.
    pub fn target(&self, field: FieldSelect) -> Option<TextureId> {
        self.targets.lock().get(field).map(GpuTexture::id)
    }

    /// Records that `token` reads or writes the target of `field` and,
    /// when `tables` is set, the lookup tables.
    pub fn mark_used(&self, field: Option<FieldSelect>, tables: bool, token: &CompletionToken) {
        if let Some(field) = field {
            if let Some(texture) = self.targets.lock().get(field) {
                texture.mark_used(token);
            }
        }
        if tables {
            if let Some(set) = self.tables.lock().as_ref() {
                set.luma.mark_used(token);
                set.chroma_coarse.mark_used(token);
                set.chroma_error.mark_used(token);
            }
        }
    }

    fn destroy_textures(&self, textures: impl IntoIterator<Item = GpuTexture>) {
        for texture in textures {
            if let Err(texture) = texture.release(self.release_timeout) {
                self.parked.park(texture);
            }
        }
    }

    /// Frees parked textures that have gone idle.
    pub fn collect_garbage(&self) -> usize {
        if self.parked.is_empty() {
            return 0;
        }
        self.parked.collect()
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// Retires every texture the manager owns. Returns how many had to be
    /// leaked because their work never completed.
    pub fn shutdown(&self) -> usize {
        let targets = self.targets.lock().take_all();
        self.destroy_textures(targets);
        self.drop_lookup_tables();
        let leaked = self.parked.drain(self.release_timeout);
        if leaked > 0 {
            warn!(leaked, "[resources] textures leaked at shutdown");
        }
        leaked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deinterlace::FieldSync;
    use crate::gpu::{HeadlessConfig, HeadlessDevice};
    use crate::ring::RingConfig;
    use media_io::{ChromaFormat, PlanarFrame};

    fn setup() -> (Arc<HeadlessDevice>, GpuResourceManager) {
        let headless = Arc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let device: Arc<dyn GpuDevice> = headless.clone();
        (headless, GpuResourceManager::new(device, Duration::from_millis(10)))
    }

    fn slot(width: u32, height: u32) -> FrameSlot {
        let config = RingConfig {
            width,
            height,
            chroma: ChromaFormat::YUV420,
            count: 1,
            black: [16, 128, 128],
        };
        FrameSlot {
            frame: PlanarFrame::solid(config.width, config.height, config.chroma, config.black)
                .expect("frame"),
            textures: None,
            field: FieldSync::None,
            sequence: 0,
            uploaded: None,
        }
    }

    #[test]
    fn frame_textures_start_as_yuv_black() {
        let (headless, resources) = setup();
        let mut slot = slot(8, 4);
        resources
            .create_frame_textures(&mut slot, [16, 128, 128])
            .expect("textures");
        let ids = slot.textures.as_ref().expect("attached").ids();
        assert_eq!(headless.texture_data(ids[0]).expect("luma"), vec![16; 32]);
        assert_eq!(headless.texture_data(ids[2]).expect("v"), vec![128; 8]);
    }

    #[test]
    fn destroy_waits_for_outstanding_work() {
        let (headless, resources) = setup();
        let mut slot = slot(8, 4);
        resources
            .create_frame_textures(&mut slot, [16, 128, 128])
            .expect("textures");
        headless.set_deferred(true);
        resources.upload_frame(&mut slot).expect("upload");
        resources.destroy_frame_textures(&mut slot);
        assert_eq!(resources.parked(), 3);
        assert_eq!(headless.live_textures(), 3);

        headless.complete_deferred();
        assert_eq!(resources.collect_garbage(), 3);
        assert_eq!(headless.live_textures(), 0);
        assert_eq!(headless.destroy_violations(), 0);
    }

    #[test]
    fn tables_rebuild_only_on_model_change() {
        let (headless, resources) = setup();
        let model = ConversionModel::default();
        assert!(resources.rebuild_lookup_tables(model).expect("first"));
        assert!(!resources.rebuild_lookup_tables(model).expect("cached"));
        assert_eq!(headless.live_textures(), 3);
        let ids = resources.lookup_table_ids().expect("tables");
        let luma = headless.texture_data(ids.luma).expect("luma");
        assert_eq!(luma.len(), 256 * 4);

        let other = ConversionModel::new(color::CoefficientModel::Bt709, color::RangeModel::Full);
        assert!(resources.rebuild_lookup_tables(other).expect("changed"));
        assert_eq!(headless.live_textures(), 3);
    }

    #[test]
    fn field_targets_split_odd_heights() {
        let (_headless, resources) = setup();
        resources
            .ensure_target_layout(TargetLayout::Fields, 8, 5)
            .expect("targets");
        assert!(resources.target(FieldSelect::Odd).is_some());
        assert!(resources.target(FieldSelect::Full).is_none());
        assert!(!resources
            .ensure_target_layout(TargetLayout::Fields, 8, 5)
            .expect("unchanged"));
        resources
            .ensure_target_layout(TargetLayout::None, 8, 5)
            .expect("windowed");
        assert!(resources.target(FieldSelect::Odd).is_none());
    }

    #[test]
    fn failed_field_pair_releases_the_odd_target() {
        let (headless, resources) = setup();
        let live = headless.live_textures();
        // A single row leaves the even field empty.
        assert!(resources
            .ensure_target_layout(TargetLayout::Fields, 8, 1)
            .is_err());
        assert_eq!(resources.target_layout(), TargetLayout::None);
        assert!(resources.target(FieldSelect::Odd).is_none());
        assert_eq!(resources.parked(), 0);
        assert_eq!(headless.live_textures(), live);
        assert_eq!(headless.destroy_violations(), 0);
    }

    #[test]
    fn allocation_failure_surfaces_as_allocation() {
        let (headless, resources) = setup();
        headless.set_max_texture_bytes(Some(1024));
        let err = resources
            .rebuild_lookup_tables(ConversionModel::default())
            .expect_err("too large");
        assert!(err.is_allocation());
        assert!(resources.lookup_table_ids().is_none());
    }
}

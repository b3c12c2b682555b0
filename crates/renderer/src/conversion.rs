//! Strategies that turn a slot's planes into something the compositor can
//! draw. The renderer holds exactly one, chosen at configuration time.

use color::{
    convert_frame, ChromaSiting, ConversionModel, DirectConverter, FieldSelect, PixelConverter,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::context::DisplayMode;
use crate::gpu::{ConvertPass, DrawSource, PlaneSource};
use crate::resources::{GpuResourceManager, TargetLayout};
use crate::ring::FrameSlot;
use crate::RendererError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderMethod {
    /// Lookup tables, falling back to software conversion.
    #[default]
    Auto,
    LookupTable,
    Software,
    /// Convert while compositing, no intermediate targets.
    LowMemory,
}

/// Source for one draw, plus the resources it reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Converted {
    pub source: DrawSource,
    /// Conversion target holding the image, if one was used.
    pub target: Option<FieldSelect>,
    pub uses_tables: bool,
}

pub trait ConversionStrategy: Send + Sync {
    fn method(&self) -> RenderMethod;

    /// Builds whatever depends on the conversion model.
    fn prepare(
        &mut self,
        resources: &GpuResourceManager,
        model: ConversionModel,
    ) -> Result<(), RendererError>;

    /// Conversion targets worth keeping in `mode`.
    fn target_layout(&self, mode: DisplayMode, fielded: bool) -> TargetLayout;

    /// Produces the image of `field` of the frame held by `slot`.
    fn convert(
        &self,
        resources: &GpuResourceManager,
        slot: &FrameSlot,
        field: FieldSelect,
        siting: ChromaSiting,
    ) -> Result<Converted, RendererError>;
}

fn plane_source(
    slot: &FrameSlot,
    field: FieldSelect,
    model: ConversionModel,
    siting: ChromaSiting,
    resources: &GpuResourceManager,
    with_tables: bool,
) -> Result<PlaneSource, RendererError> {
    let textures = slot.textures.as_ref().ok_or(RendererError::NotConfigured)?;
    Ok(PlaneSource {
        planes: textures.ids(),
        width: slot.frame.width(),
        height: slot.frame.height(),
        chroma: slot.frame.chroma(),
        field,
        model,
        siting,
        tables: if with_tables {
            resources.lookup_table_ids()
        } else {
            None
        },
    })
}

fn composite_planes(source: PlaneSource) -> Converted {
    Converted {
        uses_tables: source.tables.is_some(),
        source: DrawSource::Planes(source),
        target: None,
    }
}

fn target_layout_for(fielded: bool) -> TargetLayout {
    if fielded {
        TargetLayout::Fields
    } else {
        TargetLayout::Full
    }
}

/// Split coarse/error lookup tables sampled on the device.
#[derive(Debug, Default)]
pub struct LookupTableConversion {
    model: ConversionModel,
}

impl LookupTableConversion {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversionStrategy for LookupTableConversion {
    fn method(&self) -> RenderMethod {
        RenderMethod::LookupTable
    }

    fn prepare(
        &mut self,
        resources: &GpuResourceManager,
        model: ConversionModel,
    ) -> Result<(), RendererError> {
        resources.rebuild_lookup_tables(model)?;
        self.model = model;
        Ok(())
    }

    fn target_layout(&self, mode: DisplayMode, fielded: bool) -> TargetLayout {
        match mode {
            DisplayMode::Windowed => TargetLayout::None,
            DisplayMode::FullscreenVideo => target_layout_for(fielded),
        }
    }

    fn convert(
        &self,
        resources: &GpuResourceManager,
        slot: &FrameSlot,
        field: FieldSelect,
        siting: ChromaSiting,
    ) -> Result<Converted, RendererError> {
        let source = plane_source(slot, field, self.model, siting, resources, true)?;
        let Some(target) = resources.target(field) else {
            return Ok(composite_planes(source));
        };
        if source.tables.is_none() {
            return Err(RendererError::NotConfigured);
        }
        let token = resources.device().convert(&ConvertPass { source, target })?;
        if let Some(textures) = &slot.textures {
            textures.mark_used(&token);
        }
        resources.mark_used(Some(field), true, &token);
        Ok(Converted {
            source: DrawSource::Converted(target),
            target: Some(field),
            uses_tables: false,
        })
    }
}

/// Converts on the CPU and uploads the RGBA result.
#[derive(Debug)]
pub struct SoftwareConversion {
    converter: DirectConverter,
}

impl Default for SoftwareConversion {
    fn default() -> Self {
        Self {
            converter: DirectConverter::new(ConversionModel::default()),
        }
    }
}

impl SoftwareConversion {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversionStrategy for SoftwareConversion {
    fn method(&self) -> RenderMethod {
        RenderMethod::Software
    }

    fn prepare(
        &mut self,
        _resources: &GpuResourceManager,
        model: ConversionModel,
    ) -> Result<(), RendererError> {
        self.converter = DirectConverter::new(model);
        Ok(())
    }

    fn target_layout(&self, _mode: DisplayMode, fielded: bool) -> TargetLayout {
        target_layout_for(fielded)
    }

    fn convert(
        &self,
        resources: &GpuResourceManager,
        slot: &FrameSlot,
        field: FieldSelect,
        siting: ChromaSiting,
    ) -> Result<Converted, RendererError> {
        let model = self.converter.model();
        let Some(target) = resources.target(field) else {
            trace!(?field, "[convert] no target for field, compositing planes");
            let source = plane_source(slot, field, model, siting, resources, false)?;
            return Ok(composite_planes(source));
        };
        let frame = &slot.frame;
        let mut rgba = vec![0u8; frame.width() as usize * field.rows(frame.height()) as usize * 4];
        let (width, _) = convert_frame(frame, &self.converter, field, &siting, &mut rgba)?;
        let token = resources.device().write_texture(target, &rgba, width * 4)?;
        resources.mark_used(Some(field), false, &token);
        Ok(Converted {
            source: DrawSource::Converted(target),
            target: Some(field),
            uses_tables: false,
        })
    }
}

/// Direct per-pixel compute while compositing.
#[derive(Debug, Default)]
pub struct LowMemoryConversion {
    model: ConversionModel,
}

impl LowMemoryConversion {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversionStrategy for LowMemoryConversion {
    fn method(&self) -> RenderMethod {
        RenderMethod::LowMemory
    }

    fn prepare(
        &mut self,
        resources: &GpuResourceManager,
        model: ConversionModel,
    ) -> Result<(), RendererError> {
        resources.drop_lookup_tables();
        self.model = model;
        Ok(())
    }

    fn target_layout(&self, _mode: DisplayMode, _fielded: bool) -> TargetLayout {
        TargetLayout::None
    }

    fn convert(
        &self,
        resources: &GpuResourceManager,
        slot: &FrameSlot,
        field: FieldSelect,
        siting: ChromaSiting,
    ) -> Result<Converted, RendererError> {
        let source = plane_source(slot, field, self.model, siting, resources, false)?;
        Ok(composite_planes(source))
    }
}

/// Instantiates and prepares the strategy for `method`. Lookup tables that
/// cannot be allocated fall back to software conversion.
pub fn create_strategy(
    method: RenderMethod,
    resources: &GpuResourceManager,
    model: ConversionModel,
) -> Result<Box<dyn ConversionStrategy>, RendererError> {
    let mut strategy: Box<dyn ConversionStrategy> = match method {
        RenderMethod::Auto | RenderMethod::LookupTable => Box::new(LookupTableConversion::new()),
        RenderMethod::Software => Box::new(SoftwareConversion::new()),
        RenderMethod::LowMemory => Box::new(LowMemoryConversion::new()),
    };
    match strategy.prepare(resources, model) {
        Ok(()) => {}
        Err(err) if err.is_allocation() => {
            warn!(error = %err, "[convert] lookup tables unavailable, using software conversion");
            resources.drop_lookup_tables();
            strategy = Box::new(SoftwareConversion::new());
            strategy.prepare(resources, model)?;
        }
        Err(err) => return Err(err),
    }
    debug!(method = ?strategy.method(), "[convert] strategy ready");
    Ok(strategy)
}

/// Replaces `strategy` with the low-memory one after a target allocation
/// failure.
pub fn degrade_to_low_memory(
    resources: &GpuResourceManager,
    model: ConversionModel,
) -> Result<Box<dyn ConversionStrategy>, RendererError> {
    let mut strategy: Box<dyn ConversionStrategy> = Box::new(LowMemoryConversion::new());
    strategy.prepare(resources, model)?;
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::deinterlace::FieldSync;
    use crate::gpu::{GpuDevice, HeadlessConfig, HeadlessDevice};
    use media_io::{ChromaFormat, PlanarFrame};

    fn setup() -> (Arc<HeadlessDevice>, GpuResourceManager) {
        let headless = Arc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let device: Arc<dyn GpuDevice> = headless.clone();
        (headless, GpuResourceManager::new(device, Duration::from_millis(10)))
    }

    fn uploaded_slot(resources: &GpuResourceManager, yuv: [u8; 3]) -> FrameSlot {
        let mut slot = FrameSlot {
            frame: PlanarFrame::solid(8, 4, ChromaFormat::YUV420, yuv).expect("frame"),
            textures: None,
            field: FieldSync::None,
            sequence: 0,
            uploaded: None,
        };
        resources
            .create_frame_textures(&mut slot, [16, 128, 128])
            .expect("textures");
        resources.upload_frame(&mut slot).expect("upload");
        slot
    }

    #[test]
    fn method_names_are_kebab_case() {
        let json = serde_json::to_string(&RenderMethod::LookupTable).expect("json");
        assert_eq!(json, "\"lookup-table\"");
        let parsed: RenderMethod = serde_json::from_str("\"low-memory\"").expect("parse");
        assert_eq!(parsed, RenderMethod::LowMemory);
    }

    #[test]
    fn lookup_falls_back_to_software_when_tables_do_not_fit() {
        let (headless, resources) = setup();
        headless.set_max_texture_bytes(Some(64 * 1024));
        let strategy =
            create_strategy(RenderMethod::Auto, &resources, ConversionModel::default()).expect("strategy");
        assert_eq!(strategy.method(), RenderMethod::Software);
        assert!(resources.lookup_table_ids().is_none());
    }

    #[test]
    fn windowed_lookup_composites_planes() {
        let (_headless, resources) = setup();
        let strategy =
            create_strategy(RenderMethod::LookupTable, &resources, ConversionModel::default())
                .expect("strategy");
        assert_eq!(
            strategy.target_layout(DisplayMode::Windowed, false),
            TargetLayout::None
        );
        let slot = uploaded_slot(&resources, [235, 128, 128]);
        let converted = strategy
            .convert(&resources, &slot, FieldSelect::Full, ChromaSiting::default())
            .expect("convert");
        assert!(converted.uses_tables);
        assert!(matches!(converted.source, DrawSource::Planes(_)));
    }

    #[test]
    fn software_writes_white_into_target() {
        let (headless, resources) = setup();
        let strategy =
            create_strategy(RenderMethod::Software, &resources, ConversionModel::default())
                .expect("strategy");
        resources
            .ensure_target_layout(strategy.target_layout(DisplayMode::FullscreenVideo, false), 8, 4)
            .expect("targets");
        let slot = uploaded_slot(&resources, [235, 128, 128]);
        let converted = strategy
            .convert(&resources, &slot, FieldSelect::Full, ChromaSiting::default())
            .expect("convert");
        let DrawSource::Converted(target) = converted.source else {
            panic!("expected a converted target");
        };
        let pixels = headless.texture_data(target).expect("target");
        assert_eq!(&pixels[..4], &[255, 255, 255, 255]);
    }

    #[test]
    fn lookup_fields_convert_into_half_height_targets() {
        let (headless, resources) = setup();
        let strategy =
            create_strategy(RenderMethod::LookupTable, &resources, ConversionModel::default())
                .expect("strategy");
        resources
            .ensure_target_layout(strategy.target_layout(DisplayMode::FullscreenVideo, true), 8, 4)
            .expect("targets");
        let slot = uploaded_slot(&resources, [16, 128, 128]);
        let converted = strategy
            .convert(&resources, &slot, FieldSelect::Even, ChromaSiting::default())
            .expect("convert");
        let DrawSource::Converted(target) = converted.source else {
            panic!("expected a converted target");
        };
        let pixels = headless.texture_data(target).expect("target");
        assert_eq!(pixels.len(), 8 * 2 * 4);
        assert!(pixels[..3].iter().all(|&c| c <= 1));
    }
}

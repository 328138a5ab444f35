//! Request orchestration and stage wiring.
//!
//! A request runs the resolution preparer, then the position encoder and the
//! structural path (wireframe, refiner, upsampler) side by side on blocking
//! tasks, then the compositor. The padded frame is cropped back and blended
//! with the caller's image at the end.

use std::sync::Arc;

use image::{GrayImage, RgbImage};
use ndarray::{Array2, s};
use tracing::{debug, info, instrument};

use crate::{
    PipelineError,
    config::PipelineSettings,
    inference::{SharedStage, StageSet},
    raster,
};

pub mod composite;
pub mod position;
pub mod prepare;
pub mod refine;
pub mod upsample;
pub mod wireframe;

use self::{
    composite::Compositor,
    position::PositionEncoding,
    prepare::{STRUCTURE_SIZE, ResolutionSet},
    refine::{IterationStats, RefineParams, StructuralMaps, StructuralRefiner},
    upsample::StructureUpsampler,
    wireframe::WireframeDetector,
};

/// Everything the compositor reads for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingBatch {
    pub resolutions: Arc<ResolutionSet>,
    pub position: PositionEncoding,
    pub structure: StructuralMaps,
}

/// Result of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct InpaintOutput {
    /// Composited image at the request size.
    pub image: RgbImage,
    /// Edge map handed to the compositor, cropped to the request size.
    pub edge: Array2<f32>,
    /// Line map handed to the compositor, cropped to the request size.
    pub line: Array2<f32>,
    /// Set when the wireframe detector failed and ran without lines.
    pub degraded: bool,
    /// Refinement iterations, empty when the structural path was skipped.
    pub trace: Vec<IterationStats>,
}

/// Output of the structural path.
#[derive(Debug, Clone, PartialEq)]
struct StructurePrior {
    maps: StructuralMaps,
    degraded: bool,
    trace: Vec<IterationStats>,
}

/// A configured pipeline bound to its four stages.
#[derive(Debug, Clone)]
pub struct InpaintPipeline {
    stages: StageSet,
    settings: PipelineSettings,
}

impl InpaintPipeline {
    pub fn new(stages: StageSet, settings: PipelineSettings) -> Self {
        Self { stages, settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn stages(&self) -> &StageSet {
        &self.stages
    }

    /// Inpaints with the structural prior as configured.
    pub async fn inpaint(
        &self,
        image: &RgbImage,
        mask: &GrayImage,
    ) -> Result<InpaintOutput, PipelineError> {
        self.inpaint_with(image, mask, self.settings.structure.enabled)
            .await
    }

    /// Inpaints `image` inside `mask` (> 127 = hole). With `structure_enabled`
    /// unset the edge and line maps stay zero and only the compositor runs.
    #[instrument(
        skip_all,
        fields(width = image.width(), height = image.height(), structure_enabled = structure_enabled)
    )]
    pub async fn inpaint_with(
        &self,
        image: &RgbImage,
        mask: &GrayImage,
        structure_enabled: bool,
    ) -> Result<InpaintOutput, PipelineError> {
        self.settings.validate()?;
        prepare::validate_request(image, mask, &self.settings.limits)?;

        let padded = prepare::pad_frame(image, mask, &self.settings.padding);
        let sigma = self.settings.structure.canny_sigma;
        let frame = padded.clone();
        let resolutions = Arc::new(
            tokio::task::spawn_blocking(move || {
                prepare::prepare(&frame.image, &frame.mask, sigma)
            })
            .await??,
        );
        debug!(
            padded_width = resolutions.width,
            padded_height = resolutions.height,
            "resolutions prepared"
        );

        let position_task = {
            let resolutions = Arc::clone(&resolutions);
            tokio::task::spawn_blocking(move || position::encode(&resolutions.mask))
        };
        let structure_task = {
            let resolutions = Arc::clone(&resolutions);
            let stages = self.stages.clone();
            let settings = self.settings.clone();
            tokio::task::spawn_blocking(move || {
                if structure_enabled {
                    structure_prior(&stages, &settings, &resolutions)
                } else {
                    Ok(StructurePrior {
                        maps: StructuralMaps::zeros(resolutions.height, resolutions.width),
                        degraded: false,
                        trace: Vec::new(),
                    })
                }
            })
        };
        let (position, prior) = tokio::join!(position_task, structure_task);
        let position = position?;
        let prior = prior??;
        debug!(rounds = position.rounds, degraded = prior.degraded, "conditioning ready");

        let batch = WorkingBatch {
            resolutions,
            position,
            structure: prior.maps,
        };
        let compositor: SharedStage = Arc::clone(&self.stages.compositor);
        let (composited, batch) = tokio::task::spawn_blocking(move || {
            let composited = Compositor::new(compositor.as_ref()).composite(
                &batch.resolutions.image,
                &batch.resolutions.mask,
                &batch.structure,
                &batch.position,
            );
            (composited, batch)
        })
        .await?;
        let composited = composited?;

        let (height, width) = (padded.original_height, padded.original_width);
        let image = blend(image, &padded.mask, &composited, width, height);
        let maps = composite::align(
            &batch.structure,
            batch.resolutions.height,
            batch.resolutions.width,
        );
        let crop = s![..height as usize, ..width as usize];
        info!(
            iterations = prior.trace.len(),
            degraded = prior.degraded,
            "request inpainted"
        );

        Ok(InpaintOutput {
            image,
            edge: maps.edge.slice(crop).to_owned(),
            line: maps.line.slice(crop).to_owned(),
            degraded: prior.degraded,
            trace: prior.trace,
        })
    }
}

/// Wireframe seed, refinement at the working scale, then upsampling to the
/// frame's shorter side.
fn structure_prior(
    stages: &StageSet,
    settings: &PipelineSettings,
    resolutions: &ResolutionSet,
) -> Result<StructurePrior, PipelineError> {
    let structure = &settings.structure;
    let line_map = WireframeDetector::new(stages.wireframe.as_ref())
        .with_threshold(structure.wireframe_threshold)
        .line_map(
            &resolutions.image_512,
            &resolutions.mask_512,
            STRUCTURE_SIZE,
            STRUCTURE_SIZE,
        );

    let params = RefineParams {
        iterations: structure.iterations,
        add_v: structure.line_add,
        mul_v: structure.line_mul,
    };
    let refinement = StructuralRefiner::new(stages.edge_line.as_ref(), params).refine(
        &resolutions.image_256,
        &resolutions.edge_256,
        &line_map.map,
        &resolutions.mask_256,
    )?;

    let target = resolutions.height.min(resolutions.width);
    let upsampled = StructureUpsampler::new(stages.upsampler.as_ref())
        .upsample(refinement.maps, target)?;
    debug!(side = target, rounds = upsampled.rounds, "structure upsampled to frame");

    Ok(StructurePrior {
        maps: upsampled.maps,
        degraded: line_map.degraded,
        trace: refinement.trace,
    })
}

/// Takes hole pixels from the composited frame and everything else from the
/// caller's image.
fn blend(
    original: &RgbImage,
    padded_mask: &GrayImage,
    composited: &RgbImage,
    width: u32,
    height: u32,
) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        if padded_mask.get_pixel(x, y)[0] > raster::MASK_THRESHOLD {
            *composited.get_pixel(x, y)
        } else {
            *original.get_pixel(x, y)
        }
    })
}

//! Core library for the inpaintforge structural inpainting pipeline.
//!
//! The crate exposes the six pipeline stages (resolution preparation, position
//! encoding, wireframe detection, structural refinement, structure upsampling
//! and compositing), the narrow [`inference::InferenceStage`] seam through
//! which the four neural back-ends are injected, configuration loading, and the
//! orchestration entry point used by the CLI application.

pub mod config;
pub mod inference;
pub mod pipeline;
pub mod raster;

use image::{GrayImage, RgbImage};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{inference::StageSet, pipeline::InpaintPipeline};

/// Errors returned by the pipeline and its stages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("wireframe failure: {0}")]
    Wireframe(String),
    #[error("edge/line failure: {0}")]
    EdgeLine(String),
    #[error("upsample failure: {0}")]
    Upsample(String),
    #[error("composite failure: {0}")]
    Composite(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("task join failure: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}

/// Result alias used across the pipeline stages.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Reads the request images, runs the pipeline with the reference stages and
/// writes the composited result.
#[instrument(skip_all, fields(image = %config.cli.image.display()))]
pub async fn run(config: config::AppConfig) -> Result<(), PipelineError> {
    if config.cli.check_models {
        let missing = config.models.missing_artifacts();
        if missing.is_empty() {
            info!("all stage artifacts present");
        } else {
            for record in &missing {
                warn!(
                    stage = %record.name,
                    path = %record.path.display(),
                    "stage artifact missing"
                );
            }
        }
    }

    let image = load_rgb(&config.cli.image).await?;
    let mask = load_gray(&config.cli.mask).await?;

    let stages = StageSet::reference();
    if !stages.is_ready() {
        return Err(PipelineError::Config(format!(
            "inference stages not ready: {}",
            stages.unready().join(", ")
        )));
    }

    let pipeline = InpaintPipeline::new(stages, config.settings.clone());
    let output = pipeline.inpaint(&image, &mask).await?;
    if output.degraded {
        warn!("structural prior degraded, output produced without wireframe lines");
    }

    let path = config.cli.output.clone();
    tokio::task::spawn_blocking(move || {
        output
            .image
            .save(&path)
            .map_err(|err| PipelineError::Io(format!("{}: {err}", path.display())))
    })
    .await??;

    info!(output = %config.cli.output.display(), "inpainting complete");
    Ok(())
}

async fn load_rgb(path: &std::path::Path) -> Result<RgbImage, PipelineError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        image::open(&path)
            .map(|decoded| decoded.into_rgb8())
            .map_err(|err| PipelineError::Io(format!("{}: {err}", path.display())))
    })
    .await?
}

async fn load_gray(path: &std::path::Path) -> Result<GrayImage, PipelineError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        image::open(&path)
            .map(|decoded| decoded.into_luma8())
            .map_err(|err| PipelineError::Io(format!("{}: {err}", path.display())))
    })
    .await?
}

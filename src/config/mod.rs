//! Configuration loading and validation utilities.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use tokio::fs;
use tracing::instrument;

use crate::PipelineError;

/// Stage names every model registry must provide.
pub const REQUIRED_STAGES: [&str; 4] = ["wireframe", "edge_line", "structure_upsample", "inpaint"];

/// Command-line arguments used to bootstrap the runtime.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Structure-guided image inpainting")]
pub struct CliArgs {
    /// RGB image to inpaint.
    #[arg(long, value_name = "PATH")]
    pub image: PathBuf,
    /// Hole mask; pixels brighter than 127 are reconstructed.
    #[arg(long, value_name = "PATH")]
    pub mask: PathBuf,
    /// Destination of the inpainted image.
    #[arg(long, value_name = "PATH", default_value = "inpainted.png")]
    pub output: PathBuf,
    /// Location of the pipeline settings document.
    #[arg(long, value_name = "PATH", default_value = "pipeline.toml")]
    pub config: PathBuf,
    /// Location of the model registry document.
    #[arg(long, value_name = "PATH", default_value = "models.toml")]
    pub models: PathBuf,
    /// Skip the wireframe and edge/line structural path.
    #[arg(long, env = "INPAINTFORGE_NO_STRUCTURE")]
    pub no_structure: bool,
    /// Progressive unmasking iteration override.
    #[arg(long, value_name = "N", env = "INPAINTFORGE_ITERATIONS")]
    pub iterations: Option<usize>,
    /// Wireframe confidence threshold override.
    #[arg(long, value_name = "SCORE", env = "INPAINTFORGE_WIREFRAME_THRESHOLD")]
    pub wireframe_threshold: Option<f32>,
    /// Report which registered stage artifacts are missing before running.
    #[arg(long)]
    pub check_models: bool,
}

/// Input bounds enforced per request.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct InputLimits {
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_width: 4096,
            max_height: 4096,
        }
    }
}

/// Knobs of the wireframe and edge/line structural path.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StructureConfig {
    pub enabled: bool,
    pub iterations: usize,
    pub line_add: f32,
    pub line_mul: f32,
    pub wireframe_threshold: f32,
    pub canny_sigma: f32,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            iterations: 1,
            line_add: 0.05,
            line_mul: 4.0,
            wireframe_threshold: 0.85,
            canny_sigma: 3.0,
        }
    }
}

/// Frame padding applied before the stages run.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PaddingConfig {
    pub modulo: u32,
    pub min_size: u32,
    pub square: bool,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            modulo: 32,
            min_size: 256,
            square: true,
        }
    }
}

/// Settings document driving a pipeline instance.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PipelineSettings {
    pub limits: InputLimits,
    pub structure: StructureConfig,
    pub padding: PaddingConfig,
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.limits.max_width == 0 || self.limits.max_height == 0 {
            return Err(PipelineError::Config(
                "input limits must be positive".to_string(),
            ));
        }
        if self.structure.iterations == 0 {
            return Err(PipelineError::Config(
                "structure iterations must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.structure.wireframe_threshold) {
            return Err(PipelineError::Config(format!(
                "wireframe threshold {} outside [0, 1)",
                self.structure.wireframe_threshold
            )));
        }
        if self.structure.canny_sigma <= 0.0 {
            return Err(PipelineError::Config(
                "canny sigma must be positive".to_string(),
            ));
        }
        if self.padding.modulo == 0 {
            return Err(PipelineError::Config(
                "padding modulo must be positive".to_string(),
            ));
        }
        if self.padding.min_size % self.padding.modulo != 0 {
            return Err(PipelineError::Config(format!(
                "padding min_size {} is not a multiple of modulo {}",
                self.padding.min_size, self.padding.modulo
            )));
        }
        Ok(())
    }
}

/// Registered model metadata.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ModelRegistry {
    pub models: Vec<ModelRecord>,
}

/// A single model entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ModelRecord {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    #[serde(rename = "checksum_sha256")]
    pub checksum: String,
}

impl ModelRegistry {
    pub fn validate(&self) -> Result<(), PipelineError> {
        for model in &self.models {
            if model.checksum.len() != 64
                || !model
                    .checksum
                    .chars()
                    .all(|c| matches!(c, '0'..='9' | 'a'..='f' | 'A'..='F'))
            {
                return Err(PipelineError::Config(format!(
                    "invalid checksum for model {}:{}",
                    model.name, model.version
                )));
            }
            if model.path.as_os_str().is_empty() {
                return Err(PipelineError::Config(format!(
                    "model {}:{} missing artifact path",
                    model.name, model.version
                )));
            }
        }
        for stage in REQUIRED_STAGES {
            if self.record(stage).is_none() {
                return Err(PipelineError::Config(format!(
                    "model registry has no entry for stage '{stage}'"
                )));
            }
        }
        Ok(())
    }

    /// Looks up the record registered for a stage.
    pub fn record(&self, stage: &str) -> Option<&ModelRecord> {
        self.models.iter().find(|model| model.name == stage)
    }

    /// Records whose artifact is not present on disk.
    pub fn missing_artifacts(&self) -> Vec<&ModelRecord> {
        self.models
            .iter()
            .filter(|model| !model.path.exists())
            .collect()
    }
}

/// Fully merged configuration set.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub cli: CliArgs,
    pub settings: PipelineSettings,
    pub models: ModelRegistry,
}

impl AppConfig {
    #[instrument(skip_all)]
    pub async fn load(cli: CliArgs) -> Result<Self, PipelineError> {
        let settings_raw = fs::read_to_string(&cli.config)
            .await
            .map_err(|err| PipelineError::Config(format!("failed to read settings: {err}")))?;
        let mut settings: PipelineSettings = toml::from_str(&settings_raw)
            .map_err(|err| PipelineError::Config(format!("invalid settings document: {err}")))?;

        let models_raw = fs::read_to_string(&cli.models)
            .await
            .map_err(|err| PipelineError::Config(format!("failed to read models: {err}")))?;
        let models: ModelRegistry = toml::from_str(&models_raw)
            .map_err(|err| PipelineError::Config(format!("invalid models document: {err}")))?;
        models.validate()?;

        if cli.no_structure {
            settings.structure.enabled = false;
        }
        if let Some(iterations) = cli.iterations {
            settings.structure.iterations = iterations;
        }
        if let Some(threshold) = cli.wireframe_threshold {
            settings.structure.wireframe_threshold = threshold;
        }
        settings.validate()?;

        Ok(Self {
            cli,
            settings,
            models,
        })
    }
}

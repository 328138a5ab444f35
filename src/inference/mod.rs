//! Narrow seam between the pipeline and the four neural inference stages.
//!
//! Every stage is a pure function from a named set of tensors to another named
//! set of tensors. The pipeline never sees weights or runtimes; a back-end is
//! anything implementing [`InferenceStage`].

pub mod reference;

use std::{collections::BTreeMap, sync::Arc};

use ndarray::{Array2, ArrayD};
use thiserror::Error;

/// Tensor names exchanged with the stages.
pub mod names {
    pub const IMAGE: &str = "image";
    pub const MASK: &str = "mask";
    pub const EDGE: &str = "edge";
    pub const LINE: &str = "line";
    pub const EDGE_LOGITS: &str = "edge_logits";
    pub const LINE_LOGITS: &str = "line_logits";
    pub const STRUCTURE: &str = "structure";
    pub const REL_POS: &str = "rel_pos";
    pub const DIRECTION: &str = "direction";
    pub const NUM_PROPOSALS: &str = "num_proposals";
    pub const LINES_PRED: &str = "lines_pred";
    pub const LINES_SCORE: &str = "lines_score";
}

/// Errors reported by stage implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("missing tensor '{0}'")]
    MissingTensor(String),
    #[error("tensor '{name}' rejected: {detail}")]
    Shape { name: String, detail: String },
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("stage unavailable: {0}")]
    Unavailable(String),
}

impl StageError {
    pub fn shape(name: &str, detail: impl Into<String>) -> Self {
        Self::Shape {
            name: name.to_string(),
            detail: detail.into(),
        }
    }
}

/// A single tensor value.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    Float(ArrayD<f32>),
    Int(ArrayD<i64>),
}

impl From<ArrayD<f32>> for Tensor {
    fn from(array: ArrayD<f32>) -> Self {
        Tensor::Float(array)
    }
}

impl From<ArrayD<i64>> for Tensor {
    fn from(array: ArrayD<i64>) -> Self {
        Tensor::Int(array)
    }
}

/// Named tensors passed to and returned from a stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tensors {
    entries: BTreeMap<String, Tensor>,
}

impl Tensors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, tensor: impl Into<Tensor>) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn insert(&mut self, name: &str, tensor: impl Into<Tensor>) {
        self.entries.insert(name.to_string(), tensor.into());
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.get(name)
    }

    /// Borrows a float tensor, rejecting integer payloads.
    pub fn float(&self, name: &str) -> Result<&ArrayD<f32>, StageError> {
        match self.get(name) {
            Some(Tensor::Float(array)) => Ok(array),
            Some(Tensor::Int(_)) => Err(StageError::shape(name, "expected f32 tensor")),
            None => Err(StageError::MissingTensor(name.to_string())),
        }
    }

    /// Borrows an integer tensor, rejecting float payloads.
    pub fn int(&self, name: &str) -> Result<&ArrayD<i64>, StageError> {
        match self.get(name) {
            Some(Tensor::Int(array)) => Ok(array),
            Some(Tensor::Float(_)) => Err(StageError::shape(name, "expected i64 tensor")),
            None => Err(StageError::MissingTensor(name.to_string())),
        }
    }

    /// Reads a float tensor holding exactly one `height x width` plane, whatever
    /// its leading singleton axes.
    pub fn plane(&self, name: &str, height: usize, width: usize) -> Result<Array2<f32>, StageError> {
        let array = self.float(name)?;
        plane_from(name, array, height, width)
    }
}

/// Reshapes a tensor into a single `height x width` plane.
pub fn plane_from(
    name: &str,
    array: &ArrayD<f32>,
    height: usize,
    width: usize,
) -> Result<Array2<f32>, StageError> {
    if array.len() != height * width {
        return Err(StageError::shape(
            name,
            format!("{:?} does not hold a {height}x{width} plane", array.shape()),
        ));
    }
    Array2::from_shape_vec((height, width), array.iter().copied().collect())
        .map_err(|err| StageError::shape(name, err.to_string()))
}

/// Trait implemented by every inference back-end.
pub trait InferenceStage: Send + Sync {
    /// Human readable stage label used in diagnostics.
    fn name(&self) -> &str;

    /// Whether the back-end is loaded and callable.
    fn is_ready(&self) -> bool {
        true
    }

    fn infer(&self, inputs: Tensors) -> Result<Tensors, StageError>;
}

/// Shared handle to an injected stage.
pub type SharedStage = Arc<dyn InferenceStage>;

/// The four stages a pipeline needs.
#[derive(Clone)]
pub struct StageSet {
    pub wireframe: SharedStage,
    pub edge_line: SharedStage,
    pub upsampler: SharedStage,
    pub compositor: SharedStage,
}

impl StageSet {
    pub fn new<W, E, U, C>(wireframe: W, edge_line: E, upsampler: U, compositor: C) -> Self
    where
        W: InferenceStage + 'static,
        E: InferenceStage + 'static,
        U: InferenceStage + 'static,
        C: InferenceStage + 'static,
    {
        Self {
            wireframe: Arc::new(wireframe),
            edge_line: Arc::new(edge_line),
            upsampler: Arc::new(upsampler),
            compositor: Arc::new(compositor),
        }
    }

    /// Deterministic CPU stand-ins, see [`reference`].
    pub fn reference() -> Self {
        Self::new(
            reference::EmptyWireframe,
            reference::DiffusingEdgeLine,
            reference::NearestUpsampler,
            reference::DiffusionCompositor::default(),
        )
    }

    fn all(&self) -> [&SharedStage; 4] {
        [
            &self.wireframe,
            &self.edge_line,
            &self.upsampler,
            &self.compositor,
        ]
    }

    /// True when all four stages report ready.
    pub fn is_ready(&self) -> bool {
        self.all().iter().all(|stage| stage.is_ready())
    }

    /// Names of the stages that are not ready.
    pub fn unready(&self) -> Vec<String> {
        self.all()
            .iter()
            .filter(|stage| !stage.is_ready())
            .map(|stage| stage.name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSet")
            .field("wireframe", &self.wireframe.name())
            .field("edge_line", &self.edge_line.name())
            .field("upsampler", &self.upsampler.name())
            .field("compositor", &self.compositor.name())
            .finish()
    }
}

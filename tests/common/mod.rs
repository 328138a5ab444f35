#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use image::{GrayImage, Luma, Rgb, RgbImage};
use inpaintforge::inference::{InferenceStage, StageError, Tensors, names};
use ndarray::{Array2, ArrayD, Axis, IxDyn};

/// Gradient test frame.
pub fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) % 256) as u8,
        ])
    })
}

/// Byte mask with a `side x side` hole whose top-left corner is `(left, top)`.
pub fn square_hole(width: u32, height: u32, left: u32, top: u32, side: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let inside = (left..left + side).contains(&x) && (top..top + side).contains(&y);
        Luma([if inside { 255 } else { 0 }])
    })
}

/// `{0, 1}` plane with the same square hole.
pub fn square_plane(size: usize, left: usize, top: usize, side: usize) -> Array2<f32> {
    Array2::from_shape_fn((size, size), |(y, x)| {
        if (left..left + side).contains(&x) && (top..top + side).contains(&y) {
            1.0
        } else {
            0.0
        }
    })
}

fn batched(plane: Array2<f32>) -> ArrayD<f32> {
    plane.insert_axis(Axis(0)).insert_axis(Axis(0)).into_dyn()
}

fn mask_dim(inputs: &Tensors) -> Result<(usize, usize), StageError> {
    let shape = inputs.float(names::MASK)?.shape().to_vec();
    Ok((shape[shape.len() - 2], shape[shape.len() - 1]))
}

/// Always fails with a back-end error.
pub struct FailingStage(pub &'static str);

impl InferenceStage for FailingStage {
    fn name(&self) -> &str {
        self.0
    }

    fn infer(&self, _inputs: Tensors) -> Result<Tensors, StageError> {
        Err(StageError::Backend(format!("{} exploded", self.0)))
    }
}

/// Counts calls forwarded to an inner stage.
pub struct CountingStage<S> {
    pub inner: S,
    pub calls: Arc<AtomicUsize>,
}

impl<S> CountingStage<S> {
    pub fn new(inner: S) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

impl<S: InferenceStage> InferenceStage for CountingStage<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn infer(&self, inputs: Tensors) -> Result<Tensors, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.infer(inputs)
    }
}

/// Edge logits striped by column, line logits striped by row, period 8.
pub struct StripedEdgeLine;

impl InferenceStage for StripedEdgeLine {
    fn name(&self) -> &str {
        "striped-edge-line"
    }

    fn infer(&self, inputs: Tensors) -> Result<Tensors, StageError> {
        let (height, width) = mask_dim(&inputs)?;
        let stripe = |i: usize| if i % 8 < 4 { 6.0 } else { -6.0 };
        let edge = Array2::from_shape_fn((height, width), |(_, x)| stripe(x));
        let line = Array2::from_shape_fn((height, width), |(y, _)| stripe(y));
        Ok(Tensors::new()
            .with(names::EDGE_LOGITS, batched(edge))
            .with(names::LINE_LOGITS, batched(line)))
    }
}

/// Emits NaN logits everywhere.
pub struct NanEdgeLine;

impl InferenceStage for NanEdgeLine {
    fn name(&self) -> &str {
        "nan-edge-line"
    }

    fn infer(&self, inputs: Tensors) -> Result<Tensors, StageError> {
        let (height, width) = mask_dim(&inputs)?;
        let nan = Array2::from_elem((height, width), f32::NAN);
        Ok(Tensors::new()
            .with(names::EDGE_LOGITS, batched(nan.clone()))
            .with(names::LINE_LOGITS, batched(nan)))
    }
}

/// Upsampler that returns its input unchanged.
pub struct StalledUpsampler;

impl InferenceStage for StalledUpsampler {
    fn name(&self) -> &str {
        "stalled-upsampler"
    }

    fn infer(&self, inputs: Tensors) -> Result<Tensors, StageError> {
        let structure = inputs.float(names::STRUCTURE)?.clone();
        Ok(Tensors::new().with(names::STRUCTURE, structure))
    }
}

/// Wireframe detector reporting fixed normalized segments.
pub struct FixedWireframe {
    /// `[x0, y0, x1, y1, score]` per segment.
    pub segments: Vec<[f32; 5]>,
}

impl InferenceStage for FixedWireframe {
    fn name(&self) -> &str {
        "fixed-wireframe"
    }

    fn infer(&self, inputs: Tensors) -> Result<Tensors, StageError> {
        inputs.float(names::IMAGE)?;
        let count = self.segments.len();
        let lines: Vec<f32> = self.segments.iter().flat_map(|s| s[..4].to_vec()).collect();
        let scores: Vec<f32> = self.segments.iter().map(|s| s[4]).collect();
        let lines = ArrayD::from_shape_vec(IxDyn(&[count, 4]), lines)
            .map_err(|err| StageError::Backend(err.to_string()))?;
        let scores = ArrayD::from_shape_vec(IxDyn(&[count]), scores)
            .map_err(|err| StageError::Backend(err.to_string()))?;
        Ok(Tensors::new()
            .with(
                names::NUM_PROPOSALS,
                ArrayD::from_elem(IxDyn(&[1]), count as i64),
            )
            .with(names::LINES_PRED, lines)
            .with(names::LINES_SCORE, scores))
    }
}

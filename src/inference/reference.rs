//! Deterministic CPU stages.
//!
//! They stand in for the neural back-ends in dry runs: the outputs have the
//! shapes and value ranges the pipeline expects, with no learned content.

use ndarray::{Array1, Array2, Array3, ArrayD, ArrayView2, Axis, IxDyn};

use super::{InferenceStage, StageError, Tensors, names};

const PROBABILITY_FLOOR: f32 = 1e-4;

fn logit(p: f32) -> f32 {
    let p = p.clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR);
    (p / (1.0 - p)).ln()
}

/// Trailing `[H, W]` of a tensor.
fn spatial(name: &str, array: &ArrayD<f32>) -> Result<(usize, usize), StageError> {
    let shape = array.shape();
    if shape.len() < 2 {
        return Err(StageError::shape(name, format!("{shape:?} has no spatial axes")));
    }
    Ok((shape[shape.len() - 2], shape[shape.len() - 1]))
}

/// Reads a `[1, 3, H, W]` (or `[3, H, W]`) image.
fn chw(inputs: &Tensors, name: &str) -> Result<Array3<f32>, StageError> {
    let array = inputs.float(name)?;
    let (height, width) = spatial(name, array)?;
    if array.len() != 3 * height * width {
        return Err(StageError::shape(name, format!("{:?} is not a 3-channel image", array.shape())));
    }
    Array3::from_shape_vec((3, height, width), array.iter().copied().collect())
        .map_err(|err| StageError::shape(name, err.to_string()))
}

fn batched_plane(plane: Array2<f32>) -> ArrayD<f32> {
    plane.insert_axis(Axis(0)).insert_axis(Axis(0)).into_dyn()
}

/// Wireframe detector that never proposes a line.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyWireframe;

impl InferenceStage for EmptyWireframe {
    fn name(&self) -> &str {
        "reference-wireframe"
    }

    fn infer(&self, inputs: Tensors) -> Result<Tensors, StageError> {
        inputs.float(names::IMAGE)?;
        Ok(Tensors::new()
            .with(names::NUM_PROPOSALS, ArrayD::<i64>::zeros(IxDyn(&[1])))
            .with(names::LINES_PRED, ArrayD::<f32>::zeros(IxDyn(&[0, 4])))
            .with(names::LINES_SCORE, Array1::<f32>::zeros(0).into_dyn()))
    }
}

/// Edge/line predictor that spreads the known structure one pixel per call:
/// each pixel predicts the mean of the known values in its 3x3 neighbourhood.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffusingEdgeLine;

impl DiffusingEdgeLine {
    fn diffuse(map: &Array2<f32>, mask: &Array2<f32>) -> Array2<f32> {
        let (height, width) = map.dim();
        Array2::from_shape_fn((height, width), |(y, x)| {
            let mut sum = 0.0;
            let mut count = 0usize;
            for sy in y.saturating_sub(1)..(y + 2).min(height) {
                for sx in x.saturating_sub(1)..(x + 2).min(width) {
                    if mask[[sy, sx]] < 0.5 {
                        sum += map[[sy, sx]];
                        count += 1;
                    }
                }
            }
            if count == 0 { 0.0 } else { sum / count as f32 }
        })
    }
}

impl InferenceStage for DiffusingEdgeLine {
    fn name(&self) -> &str {
        "reference-edge-line"
    }

    fn infer(&self, inputs: Tensors) -> Result<Tensors, StageError> {
        let (height, width) = spatial(names::MASK, inputs.float(names::MASK)?)?;
        let mask = inputs.plane(names::MASK, height, width)?;
        let edge = inputs.plane(names::EDGE, height, width)?;
        let line = inputs.plane(names::LINE, height, width)?;

        let edge_logits = Self::diffuse(&edge, &mask).mapv(logit);
        // Undo the default line calibration so the refiner sees the diffused value.
        let line_logits = Self::diffuse(&line, &mask).mapv(|p| logit(p) / 4.0 - 0.05);
        Ok(Tensors::new()
            .with(names::EDGE_LOGITS, batched_plane(edge_logits))
            .with(names::LINE_LOGITS, batched_plane(line_logits)))
    }
}

/// 2x nearest-neighbour upsampler emitting values before the `(x + 2) * 2`
/// sigmoid recalibration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestUpsampler;

impl InferenceStage for NearestUpsampler {
    fn name(&self) -> &str {
        "reference-upsampler"
    }

    fn infer(&self, inputs: Tensors) -> Result<Tensors, StageError> {
        let (height, width) = spatial(names::STRUCTURE, inputs.float(names::STRUCTURE)?)?;
        let map = inputs.plane(names::STRUCTURE, height, width)?;
        let grown = Array2::from_shape_fn((height * 2, width * 2), |(y, x)| {
            logit(map[[y / 2, x / 2]]) / 2.0 - 2.0
        });
        Ok(Tensors::new().with(names::STRUCTURE, batched_plane(grown)))
    }
}

/// Compositor that seeds the hole with the mean known colour and relaxes it
/// towards its boundary by Jacobi averaging over the 4-neighbourhood.
#[derive(Debug, Clone, Copy)]
pub struct DiffusionCompositor {
    pub iterations: usize,
}

impl Default for DiffusionCompositor {
    fn default() -> Self {
        Self { iterations: 64 }
    }
}

impl InferenceStage for DiffusionCompositor {
    fn name(&self) -> &str {
        "reference-compositor"
    }

    fn infer(&self, inputs: Tensors) -> Result<Tensors, StageError> {
        let mut image = chw(&inputs, names::IMAGE)?;
        let (_, height, width) = image.dim();
        let mask = inputs.plane(names::MASK, height, width)?;
        for name in [names::EDGE, names::LINE] {
            inputs.plane(name, height, width)?;
        }
        for name in [names::REL_POS, names::DIRECTION] {
            inputs.int(name)?;
        }

        let hole: Vec<(usize, usize)> = mask
            .indexed_iter()
            .filter(|(_, m)| **m > 0.5)
            .map(|(index, _)| index)
            .collect();
        let known = height * width - hole.len();

        for mut channel in image.outer_iter_mut() {
            let mean = if known == 0 {
                0.5
            } else {
                known_mean(channel.view(), &mask, known)
            };
            for &(y, x) in &hole {
                channel[[y, x]] = mean;
            }
            for _ in 0..self.iterations {
                let previous = channel.to_owned();
                for &(y, x) in &hole {
                    let up = previous[[y.saturating_sub(1), x]];
                    let down = previous[[(y + 1).min(height - 1), x]];
                    let left = previous[[y, x.saturating_sub(1)]];
                    let right = previous[[y, (x + 1).min(width - 1)]];
                    channel[[y, x]] = (up + down + left + right) / 4.0;
                }
            }
        }

        Ok(Tensors::new().with(names::IMAGE, image.insert_axis(Axis(0)).into_dyn()))
    }
}

fn known_mean(channel: ArrayView2<'_, f32>, mask: &Array2<f32>, known: usize) -> f32 {
    let sum: f32 = channel
        .iter()
        .zip(mask.iter())
        .filter(|(_, m)| **m < 0.5)
        .map(|(v, _)| *v)
        .sum();
    sum / known as f32
}

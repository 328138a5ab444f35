//! Structural refinement by progressive unmasking.
//!
//! Each iteration asks the edge/line stage for predictions over the whole
//! frame, folds them into the running maps under the still-unresolved pixels,
//! then commits the most confident fraction of those pixels as resolved. The
//! schedule commits `floor((i + 1) / N)` of what is left at iteration `i`, so
//! the last iteration resolves everything.

use ndarray::{Array2, Array3, Zip};
use tracing::{debug, instrument};

use crate::{
    PipelineError,
    inference::{InferenceStage, StageError, Tensors, names},
    raster::{self, sigmoid},
};

/// Accumulated edge values at or above this become 1, the rest 0.
pub const EDGE_THRESHOLD: f32 = 0.25;
const POSITIVE_BONUS: f32 = 0.5;
const RESOLVED_PENALTY: f32 = -100.0;

/// Refinement schedule and line calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineParams {
    pub iterations: usize,
    /// Offset added to line logits before scaling.
    pub add_v: f32,
    /// Scale applied to offset line logits before the sigmoid.
    pub mul_v: f32,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            iterations: 1,
            add_v: 0.05,
            mul_v: 4.0,
        }
    }
}

/// Edge and line confidence maps at one working resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralMaps {
    pub edge: Array2<f32>,
    pub line: Array2<f32>,
}

impl StructuralMaps {
    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            edge: Array2::zeros((height, width)),
            line: Array2::zeros((height, width)),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.edge.dim()
    }
}

/// Bookkeeping of one refinement iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationStats {
    pub iteration: usize,
    pub unresolved_before: usize,
    pub committed: usize,
    pub unresolved_after: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub maps: StructuralMaps,
    pub trace: Vec<IterationStats>,
}

pub struct StructuralRefiner<'a> {
    stage: &'a dyn InferenceStage,
    params: RefineParams,
}

impl<'a> StructuralRefiner<'a> {
    pub fn new(stage: &'a dyn InferenceStage, params: RefineParams) -> Self {
        Self { stage, params }
    }

    /// Refines the edge and line seeds inside `mask` (1 = unresolved).
    #[instrument(skip_all, fields(iterations = self.params.iterations))]
    pub fn refine(
        &self,
        image: &Array3<f32>,
        edge_seed: &Array2<f32>,
        line_seed: &Array2<f32>,
        mask: &Array2<f32>,
    ) -> Result<Refinement, PipelineError> {
        let iterations = self.params.iterations;
        if iterations == 0 {
            return Err(PipelineError::Config(
                "refinement needs at least one iteration".to_string(),
            ));
        }
        let (height, width) = mask.dim();
        if image.dim() != (3, height, width)
            || edge_seed.dim() != (height, width)
            || line_seed.dim() != (height, width)
        {
            return Err(PipelineError::Input(format!(
                "refiner context {:?}/{:?}/{:?} does not match mask {:?}",
                image.shape(),
                edge_seed.shape(),
                line_seed.shape(),
                mask.shape()
            )));
        }

        let mut mask = raster::binarize(mask);
        let mut image = image.clone();
        let mut edge = edge_seed.clone();
        let mut line = line_seed.clone();
        let mut trace = Vec::with_capacity(iterations);

        for iteration in 0..iterations {
            let unresolved_before = unresolved(&mask);

            for mut channel in image.outer_iter_mut() {
                Zip::from(&mut channel).and(&mask).for_each(|v, &m| *v *= 1.0 - m);
            }
            Zip::from(&mut edge).and(&mask).for_each(|v, &m| *v *= 1.0 - m);
            Zip::from(&mut line).and(&mask).for_each(|v, &m| *v *= 1.0 - m);

            let (edge_logits, line_logits) = self.predict(&image, &edge, &line, &mask)?;
            let edge_prob = edge_logits.mapv(sigmoid);
            let (add_v, mul_v) = (self.params.add_v, self.params.mul_v);
            let line_prob = line_logits.mapv(|l| sigmoid((l + add_v) * mul_v));

            Zip::from(&mut edge)
                .and(&edge_prob)
                .and(&mask)
                .for_each(|e, &p, &m| {
                    let accumulated = *e + p * m;
                    *e = if accumulated >= EDGE_THRESHOLD { 1.0 } else { 0.0 };
                });
            Zip::from(&mut line)
                .and(&line_prob)
                .and(&mask)
                .for_each(|l, &p, &m| *l += p * m);

            let scores = confidence(&edge_prob, &line_prob, &mask);
            let keep = (iteration + 1) * unresolved_before / iterations;
            commit_most_confident(&mut mask, &scores, keep)?;

            let unresolved_after = unresolved(&mask);
            if unresolved_before - unresolved_after != keep {
                return Err(PipelineError::Invariant(format!(
                    "iteration {iteration}: expected to resolve {keep} pixels, resolved {}",
                    unresolved_before - unresolved_after
                )));
            }

            Zip::from(&mut edge).and(&mask).for_each(|v, &m| *v *= 1.0 - m);
            Zip::from(&mut line).and(&mask).for_each(|v, &m| *v *= 1.0 - m);

            debug!(iteration, unresolved_before, keep, unresolved_after, "refinement step");
            trace.push(IterationStats {
                iteration,
                unresolved_before,
                committed: keep,
                unresolved_after,
            });
        }

        Ok(Refinement {
            maps: StructuralMaps { edge, line },
            trace,
        })
    }

    fn predict(
        &self,
        image: &Array3<f32>,
        edge: &Array2<f32>,
        line: &Array2<f32>,
        mask: &Array2<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>), PipelineError> {
        let (height, width) = mask.dim();
        let inputs = Tensors::new()
            .with(names::IMAGE, raster::chw_tensor(image.clone()))
            .with(names::EDGE, raster::plane_tensor(edge.clone()))
            .with(names::LINE, raster::plane_tensor(line.clone()))
            .with(names::MASK, raster::plane_tensor(mask.clone()));
        let stage_error =
            |err: StageError| PipelineError::EdgeLine(format!("{}: {err}", self.stage.name()));
        let outputs = self.stage.infer(inputs).map_err(stage_error)?;
        let edge_logits = outputs
            .plane(names::EDGE_LOGITS, height, width)
            .map_err(stage_error)?;
        let line_logits = outputs
            .plane(names::LINE_LOGITS, height, width)
            .map_err(stage_error)?;
        Ok((edge_logits, line_logits))
    }
}

fn unresolved(mask: &Array2<f32>) -> usize {
    mask.iter().filter(|&&m| m > 0.5).count()
}

/// Two-class confidence of each prediction with a bonus on the positive
/// class, pushed far down on already resolved pixels, summed over edge and
/// line.
pub fn confidence(
    edge_prob: &Array2<f32>,
    line_prob: &Array2<f32>,
    mask: &Array2<f32>,
) -> Array2<f32> {
    let score = |p: f32, m: f32| (1.0 - p).max(p + POSITIVE_BONUS) + (1.0 - m) * RESOLVED_PENALTY;
    Zip::from(edge_prob)
        .and(line_prob)
        .and(mask)
        .map_collect(|&e, &l, &m| score(e, m) + score(l, m))
}

/// Clears the `keep` highest-confidence pixels of `mask`. Every one of them
/// must still be unresolved; anything else means the ranking and the mask
/// disagree and the step is rejected.
pub fn commit_most_confident(
    mask: &mut Array2<f32>,
    confidence: &Array2<f32>,
    keep: usize,
) -> Result<(), PipelineError> {
    if mask.dim() != confidence.dim() {
        return Err(PipelineError::Invariant(format!(
            "confidence {:?} does not match mask {:?}",
            confidence.shape(),
            mask.shape()
        )));
    }
    let width = mask.ncols();
    let scores: Vec<f32> = confidence.iter().copied().collect();
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let selected = &order[..keep.min(order.len())];
    let still_masked = selected
        .iter()
        .filter(|&&index| mask[[index / width, index % width]] > 0.5)
        .count();
    if still_masked != keep {
        return Err(PipelineError::Invariant(format!(
            "top {keep} confidence ranks hold {still_masked} unresolved pixels"
        )));
    }
    for &index in selected {
        mask[[index / width, index % width]] = 0.0;
    }
    Ok(())
}

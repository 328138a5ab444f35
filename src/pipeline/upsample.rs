//! Structure upsampling from the 256 working scale to the frame's shorter side.

use ndarray::Array2;
use tracing::{debug, instrument};

use crate::{
    PipelineError,
    inference::{InferenceStage, Tensors, names, plane_from},
    pipeline::{prepare::STRUCTURE_SIZE, refine::StructuralMaps},
    raster::{self, sigmoid},
};

/// Recalibration applied to every upsampler output.
fn recalibrate(x: f32) -> f32 {
    sigmoid((x + 2.0) * 2.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upsampled {
    pub maps: StructuralMaps,
    /// Upsampler invocations per map.
    pub rounds: usize,
}

pub struct StructureUpsampler<'a> {
    stage: &'a dyn InferenceStage,
}

impl<'a> StructureUpsampler<'a> {
    pub fn new(stage: &'a dyn InferenceStage) -> Self {
        Self { stage }
    }

    /// Grows `maps` until they reach `target`, then resizes them to exactly
    /// `target x target`. Targets at or below the working scale leave the maps
    /// untouched.
    #[instrument(skip_all, fields(side = target))]
    pub fn upsample(&self, maps: StructuralMaps, target: usize) -> Result<Upsampled, PipelineError> {
        if target <= STRUCTURE_SIZE {
            return Ok(Upsampled { maps, rounds: 0 });
        }

        let StructuralMaps { mut edge, mut line } = maps;
        let mut rounds = 0;
        while edge.nrows() < target {
            let before = edge.nrows();
            edge = self.round(&edge)?;
            line = self.round(&line)?;
            rounds += 1;
            if edge.nrows() <= before {
                return Err(PipelineError::Upsample(format!(
                    "{} did not grow the map past {before}",
                    self.stage.name()
                )));
            }
            debug!(round = rounds, size = edge.nrows(), "structure upsampled");
        }

        Ok(Upsampled {
            maps: StructuralMaps {
                edge: raster::resize_bilinear(edge.view(), target, target),
                line: raster::resize_bilinear(line.view(), target, target),
            },
            rounds,
        })
    }

    fn round(&self, map: &Array2<f32>) -> Result<Array2<f32>, PipelineError> {
        let stage_error = |detail: String| {
            PipelineError::Upsample(format!("{}: {detail}", self.stage.name()))
        };
        let inputs = Tensors::new().with(names::STRUCTURE, raster::plane_tensor(map.clone()));
        let outputs = self
            .stage
            .infer(inputs)
            .map_err(|err| stage_error(err.to_string()))?;
        let output = outputs
            .float(names::STRUCTURE)
            .map_err(|err| stage_error(err.to_string()))?;
        let shape = output.shape();
        if shape.len() < 2 || shape[..shape.len() - 2].iter().any(|&axis| axis != 1) {
            return Err(stage_error(format!("unexpected output shape {shape:?}")));
        }
        let (height, width) = (shape[shape.len() - 2], shape[shape.len() - 1]);
        let plane = plane_from(names::STRUCTURE, output, height, width)
            .map_err(|err| stage_error(err.to_string()))?;
        Ok(plane.mapv(recalibrate))
    }
}

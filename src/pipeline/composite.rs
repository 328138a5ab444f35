//! Final compositing through the inpainting stage.

use image::{Rgb, RgbImage};
use ndarray::{Array2, Array3, Axis};

use crate::{
    PipelineError,
    inference::{InferenceStage, Tensors, names},
    pipeline::{position::PositionEncoding, refine::StructuralMaps},
    raster,
};

pub struct Compositor<'a> {
    stage: &'a dyn InferenceStage,
}

impl<'a> Compositor<'a> {
    pub fn new(stage: &'a dyn InferenceStage) -> Self {
        Self { stage }
    }

    /// Runs the inpainting stage once over the frame. Structural maps that do
    /// not match the frame are resized to it first.
    pub fn composite(
        &self,
        image: &Array3<f32>,
        mask: &Array2<f32>,
        maps: &StructuralMaps,
        position: &PositionEncoding,
    ) -> Result<RgbImage, PipelineError> {
        let (channels, height, width) = image.dim();
        if channels != 3 || mask.dim() != (height, width) {
            return Err(PipelineError::Input(format!(
                "compositor image {:?} does not match mask {:?}",
                image.shape(),
                mask.shape()
            )));
        }
        if (position.height(), position.width()) != (height, width) {
            return Err(PipelineError::Input(format!(
                "position encoding {}x{} does not match frame {width}x{height}",
                position.width(),
                position.height()
            )));
        }
        let maps = align(maps, height, width);

        let inputs = Tensors::new()
            .with(names::IMAGE, raster::chw_tensor(image.clone()))
            .with(names::MASK, raster::plane_tensor(mask.clone()))
            .with(names::EDGE, raster::plane_tensor(maps.edge))
            .with(names::LINE, raster::plane_tensor(maps.line))
            .with(
                names::REL_POS,
                position.relative_bucket.clone().insert_axis(Axis(0)).into_dyn(),
            )
            .with(
                names::DIRECTION,
                position.direction.clone().insert_axis(Axis(0)).into_dyn(),
            );

        let stage_error =
            |detail: String| PipelineError::Composite(format!("{}: {detail}", self.stage.name()));
        let outputs = self
            .stage
            .infer(inputs)
            .map_err(|err| stage_error(err.to_string()))?;
        let output = outputs
            .float(names::IMAGE)
            .map_err(|err| stage_error(err.to_string()))?;
        if output.len() != 3 * height * width {
            return Err(stage_error(format!(
                "output {:?} is not a 3x{height}x{width} image",
                output.shape()
            )));
        }
        let values: Vec<f32> = output.iter().copied().collect();
        let plane = height * width;
        Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let offset = y as usize * width + x as usize;
            Rgb(std::array::from_fn(|c| to_byte(values[c * plane + offset])))
        }))
    }
}

fn to_byte(value: f32) -> u8 {
    (value * 255.0).clamp(0.0, 255.0) as u8
}

/// Brings structural maps to the compositor's frame size.
pub fn align(maps: &StructuralMaps, height: usize, width: usize) -> StructuralMaps {
    if maps.dim() == (height, width) {
        return maps.clone();
    }
    StructuralMaps {
        edge: raster::resize_bilinear(maps.edge.view(), height, width),
        line: raster::resize_bilinear(maps.line.view(), height, width),
    }
}

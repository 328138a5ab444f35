//! Wireframe stage: masked line detection rasterized into a line map.

use image::{ImageBuffer, Luma};
use imageproc::drawing::draw_antialiased_line_segment_mut;
use ndarray::{Array2, Array3, ArrayD};
use tracing::{debug, warn};

use crate::{
    PipelineError,
    inference::{InferenceStage, StageError, Tensor, Tensors, names},
    raster,
};

/// Confidence threshold when the detector is used on its own.
pub const DEFAULT_THRESHOLD: f32 = 0.925;
/// Confidence threshold used when seeding the structural refiner.
pub const REFINER_THRESHOLD: f32 = 0.85;

const LCNN_MEAN: [f32; 3] = [109.730, 103.832, 98.681];
const LCNN_STD: [f32; 3] = [22.275, 22.124, 23.229];
/// Neutral gray painted into the hole before detection.
const HOLE_FILL: f32 = 127.5;

/// A detected segment in pixel coordinates of the requested output size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSegment {
    /// `(x, y)` of the first endpoint.
    pub start: (i32, i32),
    /// `(x, y)` of the second endpoint.
    pub end: (i32, i32),
    pub score: f32,
}

/// Segments returned by one detector call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireframeLines {
    pub segments: Vec<LineSegment>,
}

impl WireframeLines {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments strictly above `threshold`.
    pub fn confident(&self, threshold: f32) -> impl Iterator<Item = &LineSegment> {
        self.segments
            .iter()
            .filter(move |segment| segment.score > threshold)
    }
}

/// Line map handed to the refiner.
#[derive(Debug, Clone, PartialEq)]
pub struct LineMap {
    pub map: Array2<f32>,
    /// Set when the detector failed and the map is blank.
    pub degraded: bool,
}

pub struct WireframeDetector<'a> {
    stage: &'a dyn InferenceStage,
    threshold: f32,
}

impl<'a> WireframeDetector<'a> {
    pub fn new(stage: &'a dyn InferenceStage) -> Self {
        Self {
            stage,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Runs the detector on a 512 image/mask pair and scales the segments to
    /// `height x width`.
    pub fn detect(
        &self,
        image: &Array3<f32>,
        mask: &Array2<f32>,
        height: usize,
        width: usize,
    ) -> Result<WireframeLines, PipelineError> {
        let inputs = Tensors::new().with(names::IMAGE, masked_input(image, mask)?);
        let outputs = self
            .stage
            .infer(inputs)
            .map_err(|err| PipelineError::Wireframe(format!("{}: {err}", self.stage.name())))?;
        parse_lines(&outputs, height, width)
            .map_err(|err| PipelineError::Wireframe(err.to_string()))
    }

    /// Detects and rasterizes. A failing detector yields a blank map.
    pub fn line_map(
        &self,
        image: &Array3<f32>,
        mask: &Array2<f32>,
        height: usize,
        width: usize,
    ) -> LineMap {
        match self.detect(image, mask, height, width) {
            Ok(lines) => {
                let map = rasterize(&lines, self.threshold, height, width);
                debug!(
                    proposals = lines.segments.len(),
                    kept = lines.confident(self.threshold).count(),
                    "wireframe rasterized"
                );
                LineMap {
                    map,
                    degraded: false,
                }
            }
            Err(error) => {
                warn!(error = %error, "wireframe detection failed, continuing without lines");
                LineMap {
                    map: Array2::zeros((height, width)),
                    degraded: true,
                }
            }
        }
    }
}

/// Paints the hole gray and applies the detector's normalization.
fn masked_input(image: &Array3<f32>, mask: &Array2<f32>) -> Result<ArrayD<f32>, PipelineError> {
    let (channels, height, width) = image.dim();
    if channels != 3 || mask.dim() != (height, width) {
        return Err(PipelineError::Input(format!(
            "wireframe input {:?} does not match mask {:?}",
            image.shape(),
            mask.shape()
        )));
    }
    let normalized = Array3::from_shape_fn((channels, height, width), |(c, y, x)| {
        let hole = mask[[y, x]];
        let value = image[[c, y, x]] * 255.0 * (1.0 - hole) + HOLE_FILL * hole;
        (value - LCNN_MEAN[c]) / LCNN_STD[c]
    });
    Ok(raster::chw_tensor(normalized))
}

fn proposal_count(outputs: &Tensors) -> Result<usize, StageError> {
    let count = match outputs.get(names::NUM_PROPOSALS) {
        Some(Tensor::Int(array)) => array.iter().next().copied().unwrap_or(0).max(0) as usize,
        Some(Tensor::Float(array)) => array.iter().next().copied().unwrap_or(0.0).max(0.0) as usize,
        None => return Err(StageError::MissingTensor(names::NUM_PROPOSALS.to_string())),
    };
    Ok(count)
}

/// Reads `lines_pred` (`[K, 4]`, normalized `x0, y0, x1, y1`) and
/// `lines_score` (`[K]`).
fn parse_lines(outputs: &Tensors, height: usize, width: usize) -> Result<WireframeLines, StageError> {
    if proposal_count(outputs)? == 0 {
        return Ok(WireframeLines::default());
    }
    let lines = outputs.float(names::LINES_PRED)?;
    let scores = outputs.float(names::LINES_SCORE)?;
    if lines.len() % 4 != 0 {
        return Err(StageError::shape(
            names::LINES_PRED,
            format!("{:?} is not a list of 4-vectors", lines.shape()),
        ));
    }
    if lines.len() / 4 != scores.len() {
        return Err(StageError::shape(
            names::LINES_SCORE,
            format!("{} scores for {} lines", scores.len(), lines.len() / 4),
        ));
    }

    let coords: Vec<f32> = lines.iter().copied().collect();
    let segments = coords
        .chunks_exact(4)
        .zip(scores.iter())
        .map(|(line, &score)| LineSegment {
            start: ((line[0] * width as f32) as i32, (line[1] * height as f32) as i32),
            end: ((line[2] * width as f32) as i32, (line[3] * height as f32) as i32),
            score,
        })
        .collect();
    Ok(WireframeLines { segments })
}

/// Draws every segment above `threshold` anti-aliased, keeping the maximum
/// coverage where segments cross, then quantizes to 8-bit levels.
pub fn rasterize(lines: &WireframeLines, threshold: f32, height: usize, width: usize) -> Array2<f32> {
    let mut canvas: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::new(width as u32, height as u32);
    for segment in lines.confident(threshold) {
        draw_antialiased_line_segment_mut(
            &mut canvas,
            segment.start,
            segment.end,
            Luma([1.0f32]),
            |_, original: Luma<f32>, weight: f32| Luma([original[0].max(weight)]),
        );
    }
    Array2::from_shape_fn((height, width), |(y, x)| {
        let level = (canvas.get_pixel(x as u32, y as u32)[0] * 255.0).clamp(0.0, 255.0) as u8;
        f32::from(level) / 255.0
    })
}

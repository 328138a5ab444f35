//! Resolution preparation: frame padding plus the 256, 512 and native
//! representations every later stage reads from.

use image::{GrayImage, Luma, RgbImage};
use ndarray::{Array2, Array3};
use tracing::debug;

use crate::{
    PipelineError,
    config::{InputLimits, PaddingConfig},
    raster,
};

/// Working side of the structural path.
pub const STRUCTURE_SIZE: usize = 256;
/// Working side of the wireframe detector.
pub const WIREFRAME_SIZE: usize = 512;

/// Every representation of one request frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionSet {
    /// Native image, `[3, H, W]` in [0, 1].
    pub image: Array3<f32>,
    /// Native mask in {0, 1}.
    pub mask: Array2<f32>,
    /// 256 image normalized to [-1, 1].
    pub image_256: Array3<f32>,
    pub mask_256: Array2<f32>,
    /// Canny seed of the 256 image, in {0, 1}.
    pub edge_256: Array2<f32>,
    /// 512 image in [0, 1].
    pub image_512: Array3<f32>,
    pub mask_512: Array2<f32>,
    pub height: usize,
    pub width: usize,
}

/// A request frame padded to the stage-friendly size.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedFrame {
    pub image: RgbImage,
    /// Thresholded mask, 0 or 255.
    pub mask: GrayImage,
    pub original_width: u32,
    pub original_height: u32,
}

/// Rejects requests no stage can process.
pub fn validate_request(
    image: &RgbImage,
    mask: &GrayImage,
    limits: &InputLimits,
) -> Result<(), PipelineError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(PipelineError::Input("image is empty".to_string()));
    }
    if mask.dimensions() != image.dimensions() {
        return Err(PipelineError::Input(format!(
            "mask {}x{} does not match image {}x{}",
            mask.width(),
            mask.height(),
            width,
            height
        )));
    }
    if width > limits.max_width || height > limits.max_height {
        return Err(PipelineError::Input(format!(
            "resolution {}x{} exceeds limit {}x{}",
            width, height, limits.max_width, limits.max_height
        )));
    }
    Ok(())
}

fn ceil_modulo(value: u32, modulo: u32) -> u32 {
    value.div_ceil(modulo) * modulo
}

/// Mirror index including the edge pixel (`abc|cba|abc`).
fn symmetric_index(index: u32, len: u32) -> u32 {
    let period = 2 * len;
    let folded = index % period;
    if folded < len {
        folded
    } else {
        period - 1 - folded
    }
}

/// Pads bottom and right with symmetric reflection so that both sides are
/// multiples of `modulo`, at least `min_size`, and equal when `square` is set.
/// The mask is thresholded on the way.
pub fn pad_frame(image: &RgbImage, mask: &GrayImage, padding: &PaddingConfig) -> PaddedFrame {
    let (width, height) = image.dimensions();
    let mut out_width = ceil_modulo(width, padding.modulo).max(padding.min_size);
    let mut out_height = ceil_modulo(height, padding.modulo).max(padding.min_size);
    if padding.square {
        let side = out_width.max(out_height);
        out_width = side;
        out_height = side;
    }
    debug!(width, height, out_width, out_height, "padding frame");

    let padded_image = RgbImage::from_fn(out_width, out_height, |x, y| {
        *image.get_pixel(symmetric_index(x, width), symmetric_index(y, height))
    });
    let padded_mask = GrayImage::from_fn(out_width, out_height, |x, y| {
        let value = mask.get_pixel(symmetric_index(x, width), symmetric_index(y, height))[0];
        Luma([if value > raster::MASK_THRESHOLD { 255 } else { 0 }])
    });

    PaddedFrame {
        image: padded_image,
        mask: padded_mask,
        original_width: width,
        original_height: height,
    }
}

/// Builds the 256, 512 and native representations of a frame.
pub fn prepare(
    image: &RgbImage,
    mask: &GrayImage,
    canny_sigma: f32,
) -> Result<ResolutionSet, PipelineError> {
    validate_request(image, mask, &InputLimits {
        max_width: u32::MAX,
        max_height: u32::MAX,
    })?;
    let (width, height) = image.dimensions();
    let (width, height) = (width as usize, height as usize);

    let native = raster::rgb_to_chw(image);
    let native_mask = raster::binary_mask(mask);

    let image_256 = raster::resize_image(native.view(), STRUCTURE_SIZE, STRUCTURE_SIZE);
    let gray_256 = raster::luminance(image_256.view());
    let edge_256 = raster::canny_edges(gray_256.view(), canny_sigma);
    let image_512 = raster::resize_image(native.view(), WIREFRAME_SIZE, WIREFRAME_SIZE);

    let mask_256 = raster::binarize(&raster::resize_area(
        native_mask.view(),
        STRUCTURE_SIZE,
        STRUCTURE_SIZE,
    ));
    let mask_512 = raster::binarize(&raster::resize_area(
        native_mask.view(),
        WIREFRAME_SIZE,
        WIREFRAME_SIZE,
    ));

    Ok(ResolutionSet {
        image: native,
        mask: native_mask,
        image_256: image_256.mapv(|v| (v - 0.5) / 0.5),
        mask_256,
        edge_256,
        image_512,
        mask_512,
        height,
        width,
    })
}

//! Raster helpers shared by the stages: conversions between byte images and
//! channel-first float arrays, resampling kernels and the Canny edge seed.

use image::{GrayImage, Luma, RgbImage};
use imageproc::{edges::canny, filter::gaussian_blur_f32};
use ndarray::{Array2, Array3, ArrayD, ArrayView2, ArrayView3, Axis};

/// Mask intensity above which a pixel belongs to the hole.
pub const MASK_THRESHOLD: u8 = 127;

/// imageproc's canny smooths with this sigma before computing gradients.
const CANNY_INTRINSIC_SIGMA: f32 = 1.4;
/// Hysteresis thresholds, 0.1 and 0.2 of the unit intensity range.
const CANNY_LOW: f32 = 0.1 * 255.0;
const CANNY_HIGH: f32 = 0.2 * 255.0;

const LUMA_WEIGHTS: [f32; 3] = [0.2125, 0.7154, 0.0721];

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Converts an RGB byte image into a `[3, H, W]` array scaled to [0, 1].
pub fn rgb_to_chw(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
        f32::from(image.get_pixel(x as u32, y as u32)[c]) / 255.0
    })
}

/// Thresholds a byte mask into a `{0, 1}` array, 1 marking the hole.
pub fn binary_mask(mask: &GrayImage) -> Array2<f32> {
    let (width, height) = mask.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        if mask.get_pixel(x as u32, y as u32)[0] > MASK_THRESHOLD {
            1.0
        } else {
            0.0
        }
    })
}

/// Any non-zero coverage becomes hole.
pub fn binarize(map: &Array2<f32>) -> Array2<f32> {
    map.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
}

/// Adds the batch axis to a `[C, H, W]` array.
pub fn chw_tensor(array: Array3<f32>) -> ArrayD<f32> {
    array.insert_axis(Axis(0)).into_dyn()
}

/// Adds batch and channel axes to a plane.
pub fn plane_tensor(array: Array2<f32>) -> ArrayD<f32> {
    array.insert_axis(Axis(0)).insert_axis(Axis(0)).into_dyn()
}

/// Area (box-coverage) resampling. Every output pixel averages the source
/// pixels its footprint covers, weighted by overlap.
pub fn resize_area(src: ArrayView2<'_, f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = src.dim();
    if (in_h, in_w) == (out_h, out_w) {
        return src.to_owned();
    }
    let rows = area_taps(in_h, out_h);
    let cols = area_taps(in_w, out_w);
    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let mut acc = 0.0;
        for &(sy, wy) in &rows[y] {
            for &(sx, wx) in &cols[x] {
                acc += src[[sy, sx]] * wy * wx;
            }
        }
        acc
    })
}

fn area_taps(input: usize, output: usize) -> Vec<Vec<(usize, f32)>> {
    let scale = input as f64 / output as f64;
    (0..output)
        .map(|o| {
            let start = o as f64 * scale;
            let end = start + scale;
            let mut taps = Vec::new();
            let mut s = start.floor() as usize;
            while (s as f64) < end && s < input {
                let lo = start.max(s as f64);
                let hi = end.min(s as f64 + 1.0);
                if hi > lo {
                    taps.push((s, ((hi - lo) / scale) as f32));
                }
                s += 1;
            }
            taps
        })
        .collect()
}

/// Bilinear resampling with half-pixel centres (no corner alignment).
pub fn resize_bilinear(src: ArrayView2<'_, f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = src.dim();
    if (in_h, in_w) == (out_h, out_w) {
        return src.to_owned();
    }
    let rows = linear_taps(in_h, out_h);
    let cols = linear_taps(in_w, out_w);
    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let (y0, y1, fy) = rows[y];
        let (x0, x1, fx) = cols[x];
        let top = src[[y0, x0]] * (1.0 - fx) + src[[y0, x1]] * fx;
        let bottom = src[[y1, x0]] * (1.0 - fx) + src[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

fn linear_taps(input: usize, output: usize) -> Vec<(usize, usize, f32)> {
    let scale = input as f32 / output as f32;
    (0..output)
        .map(|o| {
            let pos = ((o as f32 + 0.5) * scale - 0.5).max(0.0);
            let i0 = (pos.floor() as usize).min(input - 1);
            let i1 = (i0 + 1).min(input - 1);
            let frac = (pos - i0 as f32).clamp(0.0, 1.0);
            (i0, i1, frac)
        })
        .collect()
}

/// Nearest-neighbour resampling, source index `floor(dst * in / out)`.
pub fn resize_nearest<T: Copy>(src: ArrayView2<'_, T>, out_h: usize, out_w: usize) -> Array2<T> {
    let (in_h, in_w) = src.dim();
    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let sy = (y * in_h / out_h).min(in_h - 1);
        let sx = (x * in_w / out_w).min(in_w - 1);
        src[[sy, sx]]
    })
}

/// Resizes a `[C, H, W]` image: area kernel when both sides shrink, bilinear
/// otherwise.
pub fn resize_image(src: ArrayView3<'_, f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (channels, in_h, in_w) = src.dim();
    let shrinking = in_h > out_h && in_w > out_w;
    let mut out = Array3::zeros((channels, out_h, out_w));
    for (c, plane) in src.axis_iter(Axis(0)).enumerate() {
        let resized = if shrinking {
            resize_area(plane, out_h, out_w)
        } else {
            resize_bilinear(plane, out_h, out_w)
        };
        out.index_axis_mut(Axis(0), c).assign(&resized);
    }
    out
}

/// Luma of a `[3, H, W]` image in [0, 1].
pub fn luminance(image: ArrayView3<'_, f32>) -> Array2<f32> {
    let (_, height, width) = image.dim();
    Array2::from_shape_fn((height, width), |(y, x)| {
        LUMA_WEIGHTS
            .iter()
            .enumerate()
            .map(|(c, weight)| image[[c, y, x]] * weight)
            .sum()
    })
}

/// Binary Canny edge map of a grayscale plane in [0, 1], smoothed with an
/// overall Gaussian of `sigma`.
pub fn canny_edges(gray: ArrayView2<'_, f32>, sigma: f32) -> Array2<f32> {
    let (height, width) = gray.dim();
    let bytes = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let value = gray[[y as usize, x as usize]].clamp(0.0, 1.0);
        Luma([(value * 255.0).round() as u8])
    });
    // canny blurs again internally; the two Gaussians compose in quadrature.
    let residual = (sigma * sigma - CANNY_INTRINSIC_SIGMA * CANNY_INTRINSIC_SIGMA)
        .max(0.0)
        .sqrt();
    let smoothed = if residual > f32::EPSILON {
        gaussian_blur_f32(&bytes, residual)
    } else {
        bytes
    };
    let edges = canny(&smoothed, CANNY_LOW, CANNY_HIGH);
    Array2::from_shape_fn((height, width), |(y, x)| {
        if edges.get_pixel(x as u32, y as u32)[0] > 0 {
            1.0
        } else {
            0.0
        }
    })
}

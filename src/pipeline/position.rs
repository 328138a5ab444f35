//! Masked position encoding.
//!
//! The hole is peeled ring by ring from its boundary: each round dilates the
//! known region with a 3x3 box, stamps the newly reached ring with the round
//! index, and records which of four 2x2 quadrant elements reached each pixel.
//! The round index is the absolute distance; the relative bucket quantizes it
//! against half the working frame.

use ndarray::{Array2, Array3, Axis, s};
use tracing::debug;

use crate::raster;

/// Side of the working frame the distances are measured on.
pub const WORKING_SIZE: usize = 256;
/// Number of relative distance buckets.
pub const BUCKET_COUNT: i64 = 128;
/// Direction channels, one per quadrant element.
pub const DIRECTION_CHANNELS: usize = 4;

type Element = &'static [(isize, isize)];

const BOX: Element = &[
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 0),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

/// Quadrant elements as `(dy, dx)` offsets sampled around the pixel:
/// up-left, down-left, up-right, down-right.
const QUADRANTS: [Element; DIRECTION_CHANNELS] = [
    &[(-1, -1), (-1, 0), (0, -1), (0, 0)],
    &[(0, -1), (0, 0), (1, -1), (1, 0)],
    &[(-1, 0), (-1, 1), (0, 0), (0, 1)],
    &[(0, 0), (0, 1), (1, 0), (1, 1)],
];

/// Per-pixel positional conditioning of a hole.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionEncoding {
    /// Quantized distance in `0..BUCKET_COUNT`, zero outside the hole.
    pub relative_bucket: Array2<i64>,
    /// Dilation round that reached the pixel.
    pub absolute_distance: Array2<i64>,
    /// `[H, W, 4]` flags, one per quadrant element.
    pub direction: Array3<i64>,
    /// Dilation rounds run on the working frame.
    pub rounds: usize,
}

impl PositionEncoding {
    pub fn height(&self) -> usize {
        self.relative_bucket.nrows()
    }

    pub fn width(&self) -> usize {
        self.relative_bucket.ncols()
    }
}

/// How samples outside the working frame are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Border {
    /// `dcb|abcd|cba`, edge pixel not repeated.
    Reflect101,
    /// Everything outside the frame counts as known.
    Known,
}

fn reflect_101(index: isize, len: usize) -> usize {
    let len = len as isize;
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let folded = index.rem_euclid(period);
    (if folded < len { folded } else { period - folded }) as usize
}

fn reached(known: &Array2<bool>, y: usize, x: usize, element: Element, border: Border) -> bool {
    let (height, width) = known.dim();
    element.iter().any(|&(dy, dx)| {
        let sy = y as isize + dy;
        let sx = x as isize + dx;
        let inside = sy >= 0 && sx >= 0 && (sy as usize) < height && (sx as usize) < width;
        match (inside, border) {
            (true, _) => known[[sy as usize, sx as usize]],
            (false, Border::Known) => true,
            (false, Border::Reflect101) => {
                known[[reflect_101(sy, height), reflect_101(sx, width)]]
            }
        }
    })
}

/// Encodes a native-resolution `{0, 1}` mask (1 = hole).
pub fn encode(mask: &Array2<f32>) -> PositionEncoding {
    let working = raster::binarize(&raster::resize_area(
        mask.view(),
        WORKING_SIZE,
        WORKING_SIZE,
    ));
    let mut known = working.mapv(|v| v == 0.0);
    // A frame with no known pixel is entered from its border.
    let border = if known.iter().any(|&k| k) {
        Border::Reflect101
    } else {
        Border::Known
    };

    let mut distance = Array2::<i64>::zeros((WORKING_SIZE, WORKING_SIZE));
    let mut direction = Array3::<i64>::zeros((WORKING_SIZE, WORKING_SIZE, DIRECTION_CHANNELS));
    let mut pending: Vec<(usize, usize)> = known
        .indexed_iter()
        .filter(|(_, k)| !**k)
        .map(|(index, _)| index)
        .collect();

    let mut rounds = 0usize;
    while !pending.is_empty() {
        rounds += 1;
        let mut ring = Vec::new();
        for &(y, x) in &pending {
            if !reached(&known, y, x, BOX, border) {
                continue;
            }
            distance[[y, x]] = rounds as i64;
            for (channel, element) in QUADRANTS.iter().enumerate() {
                if reached(&known, y, x, *element, border) {
                    direction[[y, x, channel]] = 1;
                }
            }
            ring.push((y, x));
        }
        if ring.is_empty() {
            break;
        }
        for &(y, x) in &ring {
            known[[y, x]] = true;
        }
        pending.retain(|&(y, x)| !known[[y, x]]);
    }
    debug!(rounds, ?border, "position encoding converged");

    let half = (WORKING_SIZE / 2) as f32;
    let relative = distance.mapv(|d| {
        ((d as f32 / half) * BUCKET_COUNT as f32)
            .round()
            .clamp(0.0, (BUCKET_COUNT - 1) as f32) as i64
    });

    let (height, width) = mask.dim();
    if (height, width) == (WORKING_SIZE, WORKING_SIZE) {
        return PositionEncoding {
            relative_bucket: relative,
            absolute_distance: distance,
            direction,
            rounds,
        };
    }

    let inside = |y: usize, x: usize| mask[[y, x]] > 0.0;
    let mut relative_bucket = raster::resize_nearest(relative.view(), height, width);
    let mut absolute_distance = raster::resize_nearest(distance.view(), height, width);
    let mut native_direction = Array3::<i64>::zeros((height, width, DIRECTION_CHANNELS));
    for (channel, plane) in direction.axis_iter(Axis(2)).enumerate() {
        let resized = raster::resize_nearest(plane, height, width);
        native_direction
            .index_axis_mut(Axis(2), channel)
            .assign(&resized);
    }
    for ((y, x), value) in relative_bucket.indexed_iter_mut() {
        if !inside(y, x) {
            *value = 0;
            absolute_distance[[y, x]] = 0;
            native_direction.slice_mut(s![y, x, ..]).fill(0);
        }
    }

    PositionEncoding {
        relative_bucket,
        absolute_distance,
        direction: native_direction,
        rounds,
    }
}

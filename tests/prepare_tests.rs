mod common;

use image::{GrayImage, Luma};
use inpaintforge::{
    config::{PaddingConfig, PipelineSettings},
    inference::StageSet,
    pipeline::{
        InpaintPipeline,
        composite,
        prepare::{self, STRUCTURE_SIZE, WIREFRAME_SIZE},
        refine::StructuralMaps,
    },
    raster,
};
use ndarray::{Array2, Array3, Axis, array};

fn is_binary(map: &Array2<f32>) -> bool {
    map.iter().all(|&v| v == 0.0 || v == 1.0)
}

#[test]
fn bilinear_uses_half_pixel_centres() {
    let src = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as f32);
    let out = raster::resize_bilinear(src.view(), 2, 2);
    assert_eq!(out, array![[2.5, 4.5], [10.5, 12.5]]);
}

#[test]
fn area_resize_weights_partial_coverage() {
    let src = Array2::from_shape_fn((4, 4), |(_, x)| x as f32);
    let out = raster::resize_area(src.view(), 3, 3);
    for row in out.rows() {
        for (value, expected) in row.iter().zip([0.25, 1.5, 2.75]) {
            assert!((value - expected).abs() < 1e-5, "{value} != {expected}");
        }
    }

    let mask = Array2::from_shape_fn((4, 4), |(_, x)| if x == 3 { 1.0 } else { 0.0 });
    let coverage = raster::resize_area(mask.view(), 3, 3);
    assert!((coverage[[0, 2]] - 0.75).abs() < 1e-5);
    assert_eq!(coverage[[0, 1]], 0.0);
    assert_eq!(raster::binarize(&coverage).row(1).to_vec(), vec![0.0, 0.0, 1.0]);
}

#[test]
fn image_resize_picks_area_only_when_both_sides_shrink() {
    let src = Array3::from_shape_fn((1, 4, 4), |(_, _, x)| x as f32);
    let plane = src.index_axis(Axis(0), 0);

    let shrunk = raster::resize_image(src.view(), 3, 3);
    let area = raster::resize_area(plane, 3, 3);
    assert_eq!(shrunk.index_axis(Axis(0), 0), area);

    let mixed = raster::resize_image(src.view(), 3, 8);
    let bilinear = raster::resize_bilinear(plane, 3, 8);
    assert_eq!(mixed.index_axis(Axis(0), 0), bilinear);
}

#[test]
fn padding_mirrors_non_square_frames_to_a_square() {
    let image = common::gradient(300, 200);
    let mask = GrayImage::from_fn(300, 200, |x, _| Luma([if x < 10 { 200 } else { 100 }]));
    let padded = prepare::pad_frame(&image, &mask, &PaddingConfig::default());

    assert_eq!(padded.image.dimensions(), (320, 320));
    assert_eq!(padded.mask.dimensions(), (320, 320));
    assert_eq!((padded.original_width, padded.original_height), (300, 200));
    assert_eq!(padded.image.get_pixel(300, 0), image.get_pixel(299, 0));
    assert_eq!(padded.image.get_pixel(5, 205), image.get_pixel(5, 194));
    assert!(padded.mask.pixels().all(|p| p[0] == 0 || p[0] == 255));
    assert_eq!(padded.mask.get_pixel(3, 3)[0], 255);
    assert_eq!(padded.mask.get_pixel(50, 3)[0], 0);
}

#[test]
fn padding_keeps_aspect_when_square_is_off() {
    let image = common::gradient(600, 300);
    let mask = common::square_hole(600, 300, 200, 100, 40);
    let padding = PaddingConfig {
        square: false,
        ..PaddingConfig::default()
    };
    let padded = prepare::pad_frame(&image, &mask, &padding);
    assert_eq!(padded.image.dimensions(), (608, 320));

    let small = prepare::pad_frame(&common::gradient(10, 10), &GrayImage::new(10, 10), &padding);
    assert_eq!(small.image.dimensions(), (256, 256));
}

#[test]
fn prepared_resolutions_have_expected_shapes_and_binary_masks() {
    let image = common::gradient(320, 320);
    let mask = common::square_hole(320, 320, 150, 150, 7);
    let set = prepare::prepare(&image, &mask, 3.0).expect("prepare");

    assert_eq!((set.height, set.width), (320, 320));
    assert_eq!(set.image.dim(), (3, 320, 320));
    assert_eq!(set.image_256.dim(), (3, STRUCTURE_SIZE, STRUCTURE_SIZE));
    assert_eq!(set.image_512.dim(), (3, WIREFRAME_SIZE, WIREFRAME_SIZE));
    assert_eq!(set.edge_256.dim(), (STRUCTURE_SIZE, STRUCTURE_SIZE));
    assert!(set.image_256.iter().all(|&v| (-1.0 - 1e-5..=1.0 + 1e-5).contains(&v)));
    assert!(set.image_512.iter().all(|&v| (-1e-5..=1.0 + 1e-5).contains(&v)));

    for plane in [&set.mask, &set.mask_256, &set.mask_512, &set.edge_256] {
        assert!(is_binary(plane));
    }
    assert_eq!(set.mask.sum(), 49.0);
    assert!(set.mask_256.sum() > 0.0);
    assert!(set.mask_512.sum() >= set.mask.sum());
}

#[test]
fn structural_maps_align_to_non_square_frames() {
    let maps = StructuralMaps {
        edge: Array2::ones((STRUCTURE_SIZE, STRUCTURE_SIZE)),
        line: Array2::from_elem((STRUCTURE_SIZE, STRUCTURE_SIZE), 0.5),
    };
    let aligned = composite::align(&maps, 320, 608);
    assert_eq!(aligned.dim(), (320, 608));
    assert_eq!(aligned.line.dim(), (320, 608));
    assert!(aligned.edge.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    assert!(aligned.line.iter().all(|&v| (v - 0.5).abs() < 1e-6));
}

async fn assert_round_trip(width: u32, height: u32, padding: PaddingConfig) {
    let image = common::gradient(width, height);
    let (left, top, side) = (width / 3, height / 3, 40);
    let mask = common::square_hole(width, height, left, top, side);
    let settings = PipelineSettings {
        padding,
        ..PipelineSettings::default()
    };
    let pipeline = InpaintPipeline::new(StageSet::reference(), settings);
    let output = pipeline.inpaint(&image, &mask).await.expect("inpaint");

    assert_eq!(output.image.dimensions(), (width, height));
    assert_eq!(output.edge.dim(), (height as usize, width as usize));
    assert_eq!(output.line.dim(), (height as usize, width as usize));
    for (x, y, pixel) in output.image.enumerate_pixels() {
        let inside = (left..left + side).contains(&x) && (top..top + side).contains(&y);
        if !inside {
            assert_eq!(pixel, image.get_pixel(x, y), "pixel ({x}, {y}) changed");
        }
    }
}

#[tokio::test]
async fn non_square_request_is_cropped_back() {
    assert_round_trip(300, 200, PaddingConfig::default()).await;
}

#[tokio::test]
async fn unpadded_aspect_request_is_cropped_back() {
    let padding = PaddingConfig {
        square: false,
        ..PaddingConfig::default()
    };
    assert_round_trip(600, 300, padding).await;
}

mod common;

use std::sync::atomic::Ordering;

use common::{CountingStage, FailingStage, FixedWireframe, StalledUpsampler};
use inpaintforge::{
    PipelineError,
    inference::reference::{EmptyWireframe, NearestUpsampler},
    pipeline::{
        refine::StructuralMaps,
        upsample::StructureUpsampler,
        wireframe::{self, LineSegment, WireframeDetector, WireframeLines},
    },
};
use ndarray::{Array2, Array3};

fn striped_maps(side: usize) -> StructuralMaps {
    StructuralMaps {
        edge: Array2::from_shape_fn((side, side), |(_, x)| if x % 16 < 8 { 1.0 } else { 0.0 }),
        line: Array2::from_shape_fn((side, side), |(y, _)| if y % 16 < 8 { 0.9 } else { 0.1 }),
    }
}

fn wireframe_inputs() -> (Array3<f32>, Array2<f32>) {
    (
        Array3::from_elem((3, 512, 512), 0.5),
        common::square_plane(512, 200, 200, 100),
    )
}

#[test]
fn upsampler_skips_targets_within_working_scale() {
    let (stage, calls) = CountingStage::new(NearestUpsampler);
    let maps = striped_maps(256);
    for target in [128, 256] {
        let upsampled = StructureUpsampler::new(&stage)
            .upsample(maps.clone(), target)
            .expect("skip");
        assert_eq!(upsampled.rounds, 0);
        assert_eq!(upsampled.maps, maps);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn upsampler_reaches_exact_target() {
    let (stage, calls) = CountingStage::new(NearestUpsampler);
    let upsampled = StructureUpsampler::new(&stage)
        .upsample(striped_maps(256), 600)
        .expect("upsample");
    // 256 -> 512 -> 1024, edge and line each round.
    assert_eq!(upsampled.rounds, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(upsampled.maps.dim(), (600, 600));
    assert_eq!(upsampled.maps.line.dim(), (600, 600));
    assert!(upsampled.maps.edge.iter().all(|&v| (0.0..=1.0).contains(&v)));
    // The recalibration undoes the reference stage's pre-sigmoid encoding.
    assert!(upsampled.maps.edge[[300, 2]] > 0.99);
    assert!(upsampled.maps.edge[[300, 28]] < 0.01);
}

#[test]
fn upsampler_rejects_rounds_that_do_not_grow() {
    let err = StructureUpsampler::new(&StalledUpsampler)
        .upsample(striped_maps(256), 512)
        .expect_err("stalled");
    assert!(matches!(err, PipelineError::Upsample(_)));
}

#[test]
fn upsampler_failure_propagates() {
    let stage = FailingStage("upsampler");
    let err = StructureUpsampler::new(&stage)
        .upsample(striped_maps(256), 512)
        .expect_err("failing upsampler");
    assert!(matches!(err, PipelineError::Upsample(_)));
}

#[test]
fn failing_wireframe_degrades_to_blank_map() {
    let (image, mask) = wireframe_inputs();
    let stage = FailingStage("wireframe");
    let detector = WireframeDetector::new(&stage).with_threshold(wireframe::REFINER_THRESHOLD);
    assert!(detector.detect(&image, &mask, 256, 256).is_err());

    let line_map = detector.line_map(&image, &mask, 256, 256);
    assert!(line_map.degraded);
    assert_eq!(line_map.map.dim(), (256, 256));
    assert!(line_map.map.iter().all(|&v| v == 0.0));
}

#[test]
fn zero_proposals_give_empty_lines() {
    let (image, mask) = wireframe_inputs();
    let detector = WireframeDetector::new(&EmptyWireframe);
    assert!((detector.threshold() - wireframe::DEFAULT_THRESHOLD).abs() < 1e-6);
    let lines = detector.detect(&image, &mask, 256, 256).expect("detect");
    assert!(lines.is_empty());
    let line_map = detector.line_map(&image, &mask, 256, 256);
    assert!(!line_map.degraded);
    assert!(line_map.map.iter().all(|&v| v == 0.0));
}

#[test]
fn detected_segments_are_scaled_to_the_output_size() {
    let (image, mask) = wireframe_inputs();
    let stage = FixedWireframe {
        segments: vec![[0.1, 0.2, 0.5, 0.2, 0.95], [0.0, 0.0, 1.0, 1.0, 0.5]],
    };
    let detector = WireframeDetector::new(&stage).with_threshold(0.85);
    let lines = detector.detect(&image, &mask, 256, 256).expect("detect");
    assert_eq!(lines.segments.len(), 2);
    assert_eq!(lines.segments[0].start, (25, 51));
    assert_eq!(lines.segments[0].end, (128, 51));
    assert_eq!(lines.confident(0.85).count(), 1);

    let line_map = detector.line_map(&image, &mask, 256, 256);
    assert_eq!(line_map.map[[51, 60]], 1.0);
    // The low-score diagonal is dropped.
    assert_eq!(line_map.map[[200, 200]], 0.0);
}

#[test]
fn rasterize_keeps_only_segments_above_threshold() {
    let lines = WireframeLines {
        segments: vec![LineSegment {
            start: (10, 20),
            end: (50, 20),
            score: 0.9,
        }],
    };
    let map = wireframe::rasterize(&lines, 0.85, 64, 64);
    assert_eq!(map[[20, 30]], 1.0);
    assert_eq!(map[[40, 30]], 0.0);

    let map = wireframe::rasterize(&lines, 0.9, 64, 64);
    assert!(map.iter().all(|&v| v == 0.0));
}

use criterion::{Criterion, criterion_group, criterion_main};
use inpaintforge::pipeline::position;
use ndarray::Array2;

fn square_hole(size: usize, side: usize) -> Array2<f32> {
    let start = (size - side) / 2;
    Array2::from_shape_fn((size, size), |(y, x)| {
        let inside = (start..start + side).contains(&y) && (start..start + side).contains(&x);
        if inside { 1.0 } else { 0.0 }
    })
}

fn bench_position(c: &mut Criterion) {
    let mut group = c.benchmark_group("position_encoding");
    for &side in &[32, 96, 160] {
        let mask = square_hole(512, side);
        group.bench_function(format!("hole_{side}"), |b| b.iter(|| position::encode(&mask)));
    }
    group.finish();
}

criterion_group!(benches, bench_position);
criterion_main!(benches);

//! Criterion benchmarks for the matvec kernels.

use bitnet_runtime::kernels::{
    matvec, matvec_i2s, matvec_i2s_i8, matvec_i2s_i8_par, matvec_i2s_i8_ref, matvec_t,
    matvec_t_par, I2sView,
};
use bitnet_runtime::quantization::{pack_i2s, quantize_row, ActRow};
use bitnet_runtime::Code3Mode;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ROWS: usize = 512;
const COLS: usize = 1024;

fn inputs() -> (Vec<f32>, Vec<u8>, Vec<f32>) {
    let mut rng = StdRng::seed_from_u64(7);
    let dense: Vec<f32> = (0..ROWS * COLS).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let ternary: Vec<i8> = (0..ROWS * COLS).map(|_| rng.gen_range(-1i8..=1)).collect();
    let x: Vec<f32> = (0..COLS).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    (dense, pack_i2s(&ternary, 0.5), x)
}

fn bench_dense(c: &mut Criterion) {
    let (dense, _, x) = inputs();
    let mut out = vec![0.0f32; COLS];
    let pool = rayon::ThreadPoolBuilder::new().build().unwrap();

    c.bench_function("matvec_f32_512x1024", |b| {
        b.iter(|| matvec(black_box(&mut out), black_box(&dense), ROWS, COLS, black_box(&x)))
    });
    // Transposed view of the same buffer: COLS × ROWS, input of length COLS.
    c.bench_function("matvec_t_f32_1024x512", |b| {
        b.iter(|| matvec_t(black_box(&mut out), black_box(&dense), COLS, ROWS, black_box(&x)))
    });
    c.bench_function("matvec_t_par_f32_1024x512", |b| {
        b.iter(|| matvec_t_par(&pool, black_box(&mut out), black_box(&dense), COLS, ROWS, black_box(&x)))
    });
}

fn bench_ternary(c: &mut Criterion) {
    let (_, packed, x) = inputs();
    let view = I2sView::new(&packed, ROWS, COLS, 0.5);
    let (q, scale, sum) = quantize_row(&x);
    let act = ActRow { q: &q, scale, sum };
    let mut out = vec![0.0f32; ROWS];
    let pool = rayon::ThreadPoolBuilder::new().build().unwrap();

    c.bench_function("i2s_f32_512x1024", |b| {
        b.iter(|| matvec_i2s(black_box(&mut out), view, black_box(&x), Code3Mode::Zero))
    });
    c.bench_function("i2s_i8_ref_512x1024", |b| {
        b.iter(|| matvec_i2s_i8_ref(black_box(&mut out), view, act, Code3Mode::Zero))
    });
    c.bench_function("i2s_i8_fast_512x1024", |b| {
        b.iter(|| matvec_i2s_i8(black_box(&mut out), view, act, Code3Mode::Zero))
    });
    c.bench_function("i2s_i8_par_512x1024", |b| {
        b.iter(|| matvec_i2s_i8_par(&pool, black_box(&mut out), view, act, Code3Mode::Zero))
    });
    c.bench_function("quantize_row_i8_1024", |b| b.iter(|| quantize_row(black_box(&x))));
}

criterion_group!(benches, bench_dense, bench_ternary);
criterion_main!(benches);

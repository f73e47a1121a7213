//! Dense f32 / f16 kernels over GGML column-major matrices.
//!
//! A `rows × cols` matrix stores element `(r, c)` at `r + rows * c`.
//! Kernels return without writing when a slice is shorter than the shape needs.

#![allow(clippy::needless_range_loop)]

use rayon::prelude::*;

use crate::model::dequant::f16_to_f32;

/// Dot product with f64 accumulation.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| x as f64 * y as f64)
        .sum::<f64>() as f32
}

/// Dot product accumulated in f32, left to right.
#[inline]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (&x, &y) in a.iter().zip(b) {
        sum += x * y;
    }
    sum
}

/// `dot` or `dot_f32` depending on `match_ggml`.
#[inline]
pub fn dot_with(a: &[f32], b: &[f32], match_ggml: bool) -> f32 {
    if match_ggml {
        dot_f32(a, b)
    } else {
        dot(a, b)
    }
}

/// ggml's f32 dot: 32-wide steps split into four 8-lane partial sums, four
/// accumulators reduced at the end, then the tail.
pub fn dot_ggml(a: &[f32], b: &[f32]) -> f32 {
    const STEP: usize = 32;
    const EPR: usize = 8;
    let n = a.len().min(b.len());
    let np = n & !(STEP - 1);
    let mut acc = [0.0f32; STEP / EPR];
    for i in (0..np).step_by(STEP) {
        for (j, slot) in acc.iter_mut().enumerate() {
            let base = i + j * EPR;
            let mut s = 0.0f32;
            for k in 0..EPR {
                s += a[base + k] * b[base + k];
            }
            *slot += s;
        }
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for i in np..n {
        sum += a[i] * b[i];
    }
    sum
}

/// `dst[i] += src[i] * scale`.
#[inline]
pub fn add_scaled(dst: &mut [f32], src: &[f32], scale: f32) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d += s * scale;
    }
}

/// Index of the first maximum, or -1 for an empty slice. Seeded with element 0,
/// so a row whose leading value is NaN (or an all-NaN row) yields 0.
pub fn argmax(v: &[f32]) -> i32 {
    let Some(&first) = v.first() else {
        return -1;
    };
    let mut best = 0usize;
    let mut best_val = first;
    for (i, &x) in v.iter().enumerate().skip(1) {
        if x > best_val {
            best = i;
            best_val = x;
        }
    }
    best as i32
}

#[inline]
fn shape_ok(mat_len: usize, rows: usize, cols: usize) -> bool {
    rows > 0 && cols > 0 && rows.checked_mul(cols).is_some_and(|n| mat_len >= n)
}

/// `dst[r] = Σ_c mat[r + rows·c] · x[c]`, f64 accumulation.
pub fn matvec(dst: &mut [f32], mat: &[f32], rows: usize, cols: usize, x: &[f32]) {
    if !shape_ok(mat.len(), rows, cols) || dst.len() < rows || x.len() < cols {
        return;
    }
    for r in 0..rows {
        let mut sum = 0.0f64;
        for c in 0..cols {
            sum += mat[r + rows * c] as f64 * x[c] as f64;
        }
        dst[r] = sum as f32;
    }
}

/// `dst[c] = Σ_r mat[r + rows·c] · x[r]`, f64 accumulation.
pub fn matvec_t(dst: &mut [f32], mat: &[f32], rows: usize, cols: usize, x: &[f32]) {
    if !shape_ok(mat.len(), rows, cols) || dst.len() < cols || x.len() < rows {
        return;
    }
    for c in 0..cols {
        dst[c] = dot(&mat[rows * c..rows * (c + 1)], &x[..rows]);
    }
}

/// Parallel [`matvec`]: output rows are split across the pool.
pub fn matvec_par(
    pool: &rayon::ThreadPool,
    dst: &mut [f32],
    mat: &[f32],
    rows: usize,
    cols: usize,
    x: &[f32],
) {
    if !shape_ok(mat.len(), rows, cols) || dst.len() < rows || x.len() < cols {
        return;
    }
    pool.install(|| {
        dst[..rows].par_iter_mut().enumerate().for_each(|(r, out)| {
            let mut sum = 0.0f64;
            for c in 0..cols {
                sum += mat[r + rows * c] as f64 * x[c] as f64;
            }
            *out = sum as f32;
        });
    });
}

/// Parallel [`matvec_t`]: output columns are split across the pool.
pub fn matvec_t_par(
    pool: &rayon::ThreadPool,
    dst: &mut [f32],
    mat: &[f32],
    rows: usize,
    cols: usize,
    x: &[f32],
) {
    if !shape_ok(mat.len(), rows, cols) || dst.len() < cols || x.len() < rows {
        return;
    }
    pool.install(|| {
        dst[..cols].par_iter_mut().enumerate().for_each(|(c, out)| {
            *out = dot(&mat[rows * c..rows * (c + 1)], &x[..rows]);
        });
    });
}

/// [`matvec`] over raw f16 storage.
pub fn matvec_f16(dst: &mut [f32], mat: &[u16], rows: usize, cols: usize, x: &[f32]) {
    if !shape_ok(mat.len(), rows, cols) || dst.len() < rows || x.len() < cols {
        return;
    }
    for r in 0..rows {
        let mut sum = 0.0f64;
        for c in 0..cols {
            sum += f16_to_f32(mat[r + rows * c]) as f64 * x[c] as f64;
        }
        dst[r] = sum as f32;
    }
}

/// [`matvec_t`] over raw f16 storage.
pub fn matvec_t_f16(dst: &mut [f32], mat: &[u16], rows: usize, cols: usize, x: &[f32]) {
    if !shape_ok(mat.len(), rows, cols) || dst.len() < cols || x.len() < rows {
        return;
    }
    for c in 0..cols {
        let col = &mat[rows * c..rows * (c + 1)];
        let mut sum = 0.0f64;
        for (&h, &v) in col.iter().zip(x) {
            sum += f16_to_f32(h) as f64 * v as f64;
        }
        dst[c] = sum as f32;
    }
}

/// Column `c` of a raw f16 matrix decoded into `dst` (embedding rows).
pub fn f16_column(dst: &mut [f32], mat: &[u16], rows: usize, c: usize) {
    let Some(col) = mat.get(rows * c..rows * (c + 1)) else {
        return;
    };
    for (d, &h) in dst.iter_mut().zip(col) {
        *d = f16_to_f32(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// [[1,2,3],[4,5,6]] stored column-major.
    const MAT: [f32; 6] = [1.0, 4.0, 2.0, 5.0, 3.0, 6.0];

    #[test]
    fn matvec_orientation() {
        let mut out = [0f32; 2];
        matvec(&mut out, &MAT, 2, 3, &[2.0, -1.0, 0.5]);
        assert_eq!(out, [1.5, 6.0]);

        let mut out_t = [0f32; 3];
        matvec_t(&mut out_t, &MAT, 2, 3, &[1.0, 1.0]);
        assert_eq!(out_t, [5.0, 7.0, 9.0]);
    }

    #[test]
    fn f16_variants_match_f32() {
        let bits: Vec<u16> = MAT.iter().map(|&v| half::f16::from_f32(v).to_bits()).collect();
        let mut a = [0f32; 2];
        matvec_f16(&mut a, &bits, 2, 3, &[2.0, -1.0, 0.5]);
        assert_eq!(a, [1.5, 6.0]);
        let mut b = [0f32; 3];
        matvec_t_f16(&mut b, &bits, 2, 3, &[1.0, 1.0]);
        assert_eq!(b, [5.0, 7.0, 9.0]);
        let mut col = [0f32; 2];
        f16_column(&mut col, &bits, 2, 1);
        assert_eq!(col, [2.0, 5.0]);
    }

    #[test]
    fn parallel_matches_serial() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let (rows, cols) = (33, 70);
        let mat: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let x: Vec<f32> = (0..cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let mut a = vec![0f32; rows];
        let mut b = vec![0f32; rows];
        matvec(&mut a, &mat, rows, cols, &x);
        matvec_par(&pool, &mut b, &mat, rows, cols, &x);
        assert_eq!(a, b);

        let xt: Vec<f32> = (0..rows).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let mut at = vec![0f32; cols];
        let mut bt = vec![0f32; cols];
        matvec_t(&mut at, &mat, rows, cols, &xt);
        matvec_t_par(&pool, &mut bt, &mat, rows, cols, &xt);
        assert_eq!(at, bt);
    }

    #[test]
    fn argmax_first_max_wins() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]), 1);
        assert_eq!(argmax(&[]), -1);
        assert_eq!(argmax(&[-5.0]), 0);
        assert_eq!(argmax(&[f32::NEG_INFINITY, f32::NEG_INFINITY]), 0);
    }

    #[test]
    fn argmax_nan_rows_fall_back_to_first() {
        assert_eq!(argmax(&[f32::NAN; 4]), 0);
        assert_eq!(argmax(&[f32::NAN, 1.0, 2.0]), 0);
    }

    #[test]
    fn dot_variants_agree_on_small_ints() {
        let a: Vec<f32> = (0..70).map(|i| (i % 7) as f32).collect();
        let b: Vec<f32> = (0..70).map(|i| (i % 5) as f32 - 2.0).collect();
        let expect = dot(&a, &b);
        assert_eq!(dot_f32(&a, &b), expect);
        assert_eq!(dot_ggml(&a, &b), expect);
        assert_eq!(dot_with(&a, &b, true), expect);
    }

    #[test]
    fn add_scaled_accumulates() {
        let mut d = [1.0f32, 2.0];
        add_scaled(&mut d, &[2.0, 4.0], 0.5);
        assert_eq!(d, [2.0, 4.0]);
    }

    #[test]
    fn short_inputs_leave_dst_untouched() {
        let mut out = [7f32; 2];
        matvec(&mut out, &MAT[..5], 2, 3, &[1.0, 1.0, 1.0]);
        assert_eq!(out, [7.0, 7.0]);
    }
}

//! Ternary weight system for 1.58-bit I2_S tensors.
//!
//! I2_S packs 4 codes per byte in 128-element super-blocks of 32 bytes:
//! - 00 = MinusOne
//! - 01 = Zero
//! - 10 = PlusOne
//! - 11 = unused (Zero, or PlusOne in the compatibility mode)
//!
//! Matrices are column-major: element `(r, c)` is code `r + rows * c`.

#![allow(clippy::needless_range_loop)]

use std::fmt;

use rayon::prelude::*;

use crate::config::Code3Mode;
use crate::model::dequant::{i2s_code_at, i2s_code_value, i2s_packed_len};
use crate::quantization::ActRow;
use crate::utils::memory_pool::i32_pool;

/// Ternary weight value: -1, 0, or +1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TernaryWeight {
    /// Weight value -1
    MinusOne,
    /// Weight value 0
    Zero,
    /// Weight value +1
    PlusOne,
}

impl TernaryWeight {
    #[inline]
    pub fn to_f32(self) -> f32 {
        self.to_i8() as f32
    }

    #[inline]
    pub fn to_i8(self) -> i8 {
        match self {
            TernaryWeight::MinusOne => -1,
            TernaryWeight::Zero => 0,
            TernaryWeight::PlusOne => 1,
        }
    }

    /// Sign with threshold at 0.
    #[inline]
    pub fn from_f32(value: f32) -> Self {
        if value > 0.0 {
            TernaryWeight::PlusOne
        } else if value < 0.0 {
            TernaryWeight::MinusOne
        } else {
            TernaryWeight::Zero
        }
    }

    #[inline]
    pub fn from_i8(value: i8) -> Self {
        match value.signum() {
            1 => TernaryWeight::PlusOne,
            -1 => TernaryWeight::MinusOne,
            _ => TernaryWeight::Zero,
        }
    }

    /// 2-bit I2_S code.
    #[inline]
    pub fn to_code(self) -> u8 {
        match self {
            TernaryWeight::MinusOne => 0b00,
            TernaryWeight::Zero => 0b01,
            TernaryWeight::PlusOne => 0b10,
        }
    }

    #[inline]
    pub fn from_code(code: u8, mode: Code3Mode) -> Self {
        Self::from_i8(i2s_code_value(code, mode))
    }
}

impl fmt::Display for TernaryWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f32())
    }
}

/// Borrowed view of a packed I2_S matrix.
#[derive(Debug, Clone, Copy)]
pub struct I2sView<'a> {
    pub packed: &'a [u8],
    pub rows: usize,
    pub cols: usize,
    pub scale: f32,
}

impl<'a> I2sView<'a> {
    pub fn new(packed: &'a [u8], rows: usize, cols: usize, scale: f32) -> Self {
        Self {
            packed,
            rows,
            cols,
            scale,
        }
    }

    /// Whether the packed slab covers `rows * cols` codes.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0 && self.packed.len() >= i2s_packed_len(self.rows * self.cols)
    }

    #[inline]
    pub fn code(&self, r: usize, c: usize) -> u8 {
        i2s_code_at(self.packed, r + self.rows * c)
    }

    /// Decoded weight `(r, c)` without the scale.
    #[inline]
    pub fn value(&self, r: usize, c: usize, mode: Code3Mode) -> i8 {
        i2s_code_value(self.code(r, c), mode)
    }
}

/// Code → `value + 1`, so that `Σ lut[code]·q - Σq = Σ value·q`.
#[inline]
fn offset_lut(mode: Code3Mode) -> [i32; 4] {
    match mode {
        Code3Mode::Zero => [0, 1, 2, 1],
        Code3Mode::PlusOne => [0, 1, 2, 2],
    }
}

/// `dst = W · x` with float activations; W is `rows × cols`.
pub fn matvec_i2s(dst: &mut [f32], w: I2sView<'_>, x: &[f32], mode: Code3Mode) {
    if !w.is_valid() || dst.len() < w.rows || x.len() < w.cols {
        return;
    }
    for r in 0..w.rows {
        let mut sum = 0.0f32;
        for c in 0..w.cols {
            sum += w.value(r, c, mode) as f32 * w.scale * x[c];
        }
        dst[r] = sum;
    }
}

/// `dst = Wᵀ · x` with float activations.
pub fn matvec_t_i2s(dst: &mut [f32], w: I2sView<'_>, x: &[f32], mode: Code3Mode) {
    if !w.is_valid() || dst.len() < w.cols || x.len() < w.rows {
        return;
    }
    for c in 0..w.cols {
        let mut sum = 0.0f32;
        for r in 0..w.rows {
            sum += w.value(r, c, mode) as f32 * w.scale * x[r];
        }
        dst[c] = sum;
    }
}

/// Reference ternary×i8: `Σ value·q · weight_scale / act_scale`.
pub fn matvec_i2s_i8_ref(dst: &mut [f32], w: I2sView<'_>, act: ActRow<'_>, mode: Code3Mode) {
    if !w.is_valid() || dst.len() < w.rows || act.q.len() < w.cols {
        return;
    }
    let k = dequant_factor(w.scale, act.scale);
    for r in 0..w.rows {
        let mut sum = 0i32;
        for c in 0..w.cols {
            sum += w.value(r, c, mode) as i32 * act.q[c] as i32;
        }
        dst[r] = sum as f32 * k;
    }
}

pub fn matvec_t_i2s_i8_ref(dst: &mut [f32], w: I2sView<'_>, act: ActRow<'_>, mode: Code3Mode) {
    if !w.is_valid() || dst.len() < w.cols || act.q.len() < w.rows {
        return;
    }
    let k = dequant_factor(w.scale, act.scale);
    for c in 0..w.cols {
        let mut sum = 0i32;
        for r in 0..w.rows {
            sum += w.value(r, c, mode) as i32 * act.q[r] as i32;
        }
        dst[c] = sum as f32 * k;
    }
}

#[inline]
fn dequant_factor(weight_scale: f32, act_scale: f32) -> f32 {
    if act_scale == 0.0 {
        0.0
    } else {
        weight_scale / act_scale
    }
}

/// Adds `Σ_c lut[code(r, c)] · q[c]` for `c` in `cols` into `partial[r]`.
#[inline]
fn accumulate_columns(
    partial: &mut [i32],
    w: &I2sView<'_>,
    q: &[i8],
    lut: &[i32; 4],
    cols: std::ops::Range<usize>,
) {
    for c in cols {
        let qc = q[c] as i32;
        if qc == 0 {
            continue;
        }
        for r in 0..w.rows {
            partial[r] += lut[w.code(r, c) as usize] * qc;
        }
    }
}

/// Fast ternary×i8 with the offset correction: raw codes are summed, then
/// `act.sum` is subtracted once per output.
pub fn matvec_i2s_i8(dst: &mut [f32], w: I2sView<'_>, act: ActRow<'_>, mode: Code3Mode) {
    if !w.is_valid() || dst.len() < w.rows || act.q.len() < w.cols {
        return;
    }
    let lut = offset_lut(mode);
    let mut partial = i32_pool().acquire(w.rows);
    accumulate_columns(&mut partial, &w, act.q, &lut, 0..w.cols);
    finish_rows(dst, &partial, w.scale, act);
}

fn finish_rows(dst: &mut [f32], raw: &[i32], weight_scale: f32, act: ActRow<'_>) {
    let k = dequant_factor(weight_scale, act.scale);
    for (d, &s) in dst.iter_mut().zip(raw) {
        *d = (s - act.sum) as f32 * k;
    }
}

#[inline]
fn column_dot(w: &I2sView<'_>, q: &[i8], lut: &[i32; 4], c: usize) -> i32 {
    let mut sum = 0i32;
    for r in 0..w.rows {
        sum += lut[w.code(r, c) as usize] * q[r] as i32;
    }
    sum
}

pub fn matvec_t_i2s_i8(dst: &mut [f32], w: I2sView<'_>, act: ActRow<'_>, mode: Code3Mode) {
    if !w.is_valid() || dst.len() < w.cols || act.q.len() < w.rows {
        return;
    }
    let lut = offset_lut(mode);
    let k = dequant_factor(w.scale, act.scale);
    for c in 0..w.cols {
        dst[c] = (column_dot(&w, act.q, &lut, c) - act.sum) as f32 * k;
    }
}

/// Parallel [`matvec_i2s_i8`]: columns are split across workers, each worker
/// fills its own row-sized i32 partial, partials are summed and the
/// correction is applied once.
pub fn matvec_i2s_i8_par(
    pool: &rayon::ThreadPool,
    dst: &mut [f32],
    w: I2sView<'_>,
    act: ActRow<'_>,
    mode: Code3Mode,
) {
    if !w.is_valid() || dst.len() < w.rows || act.q.len() < w.cols {
        return;
    }
    let workers = pool.current_num_threads().clamp(1, w.cols);
    let chunk = w.cols.div_ceil(workers);
    let lut = offset_lut(mode);

    let partials: Vec<Vec<i32>> = pool.install(|| {
        (0..workers)
            .into_par_iter()
            .map(|i| {
                let start = i * chunk;
                let end = (start + chunk).min(w.cols);
                let mut partial = i32_pool().acquire(w.rows);
                accumulate_columns(&mut partial, &w, act.q, &lut, start..end);
                partial.take()
            })
            .collect()
    });

    let mut total = i32_pool().acquire(w.rows);
    for partial in &partials {
        for (t, &p) in total.iter_mut().zip(partial) {
            *t += p;
        }
    }
    finish_rows(dst, &total, w.scale, act);
}

/// Parallel [`matvec_t_i2s_i8`]: output columns are split across workers.
pub fn matvec_t_i2s_i8_par(
    pool: &rayon::ThreadPool,
    dst: &mut [f32],
    w: I2sView<'_>,
    act: ActRow<'_>,
    mode: Code3Mode,
) {
    if !w.is_valid() || dst.len() < w.cols || act.q.len() < w.rows {
        return;
    }
    let lut = offset_lut(mode);
    let k = dequant_factor(w.scale, act.scale);
    pool.install(|| {
        dst[..w.cols].par_iter_mut().enumerate().for_each(|(c, out)| {
            *out = (column_dot(&w, act.q, &lut, c) - act.sum) as f32 * k;
        });
    });
}

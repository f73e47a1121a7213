//! Compute kernels: dense f32/f16, packed ternary, normalization.
//!
//! [`KernelContext`] owns the kernel switches and the worker pool and picks
//! the reference, serial or parallel variant for each call.

pub mod dense;
pub mod norm;
pub mod ternary;

pub use dense::{
    add_scaled, argmax, dot, dot_f32, dot_ggml, dot_with, f16_column, matvec, matvec_f16,
    matvec_par, matvec_t, matvec_t_f16, matvec_t_par,
};
pub use norm::{mul_relu2, mul_silu, rms_norm, rms_norm_in_place, softmax_in_place};
pub use ternary::{
    matvec_i2s, matvec_i2s_i8, matvec_i2s_i8_par, matvec_i2s_i8_ref, matvec_t_i2s,
    matvec_t_i2s_i8, matvec_t_i2s_i8_par, matvec_t_i2s_i8_ref, I2sView, TernaryWeight,
};

use crate::config::KernelConfig;
use crate::quantization::{quantize_row_i8s, ActRow};
use crate::utils::memory_pool::i8_pool;
use tracing::warn;

/// Kernel switches plus the dedicated worker pool.
pub struct KernelContext {
    config: KernelConfig,
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelContext")
            .field("config", &self.config)
            .field("workers", &self.pool.as_ref().map_or(1, |p| p.current_num_threads()))
            .finish()
    }
}

impl Default for KernelContext {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

impl KernelContext {
    pub fn new(config: KernelConfig) -> Self {
        let workers = config.worker_count();
        let pool = if workers > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("bitnet-kernel-{i}"))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "kernel pool unavailable, running serially");
                    None
                }
            }
        } else {
            None
        };
        Self { config, pool }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// f32 accumulation in dots and norms. Strict parity implies it.
    pub fn match_ggml(&self) -> bool {
        self.config.match_ggml || self.config.strict_parity
    }

    fn parallel_pool(&self, elements: usize) -> Option<&rayon::ThreadPool> {
        self.pool
            .as_ref()
            .filter(|_| self.config.use_parallel(elements))
    }

    pub fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        dot_with(a, b, self.match_ggml())
    }

    /// Query·key dot used by attention.
    pub fn attention_dot(&self, a: &[f32], b: &[f32]) -> f32 {
        if self.match_ggml() {
            dot_ggml(a, b)
        } else {
            dot(a, b)
        }
    }

    pub fn rms_norm(&self, dst: &mut [f32], x: &[f32], weight: &[f32], eps: f32) {
        rms_norm(dst, x, weight, eps, self.match_ggml());
    }

    pub fn rms_norm_in_place(&self, x: &mut [f32], weight: &[f32], eps: f32) {
        rms_norm_in_place(x, weight, eps, self.match_ggml());
    }

    pub fn matvec(&self, dst: &mut [f32], mat: &[f32], rows: usize, cols: usize, x: &[f32]) {
        match self.parallel_pool(rows * cols) {
            Some(pool) => matvec_par(pool, dst, mat, rows, cols, x),
            None => matvec(dst, mat, rows, cols, x),
        }
    }

    pub fn matvec_t(&self, dst: &mut [f32], mat: &[f32], rows: usize, cols: usize, x: &[f32]) {
        match self.parallel_pool(rows * cols) {
            Some(pool) => matvec_t_par(pool, dst, mat, rows, cols, x),
            None => matvec_t(dst, mat, rows, cols, x),
        }
    }

    /// Ternary matvec (`transposed` computes `Wᵀ·x`).
    ///
    /// With quantized activations the input row is first quantized to i8; strict
    /// parity then runs the reference kernel, otherwise the offset-corrected
    /// kernel runs serially or on the pool depending on size.
    pub fn i2s_matvec(&self, dst: &mut [f32], w: I2sView<'_>, x: &[f32], transposed: bool) {
        let mode = self.config.i2s_code3;
        if !self.config.i2s_quantized_activations {
            if transposed {
                matvec_t_i2s(dst, w, x, mode);
            } else {
                matvec_i2s(dst, w, x, mode);
            }
            return;
        }

        let mut scratch = i8_pool().acquire(x.len());
        let (scale, sum) = quantize_row_i8s(&mut scratch, x);
        let act = ActRow {
            q: &scratch,
            scale,
            sum,
        };
        if self.config.strict_parity {
            if transposed {
                matvec_t_i2s_i8_ref(dst, w, act, mode);
            } else {
                matvec_i2s_i8_ref(dst, w, act, mode);
            }
            return;
        }
        match (self.parallel_pool(w.rows * w.cols), transposed) {
            (Some(pool), true) => matvec_t_i2s_i8_par(pool, dst, w, act, mode),
            (Some(pool), false) => matvec_i2s_i8_par(pool, dst, w, act, mode),
            (None, true) => matvec_t_i2s_i8(dst, w, act, mode),
            (None, false) => matvec_i2s_i8(dst, w, act, mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::pack_i2s;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn every_i2s_route_agrees() {
        let mut rng = StdRng::seed_from_u64(42);
        let (rows, cols) = (40, 96);
        let t: Vec<i8> = (0..rows * cols).map(|_| rng.gen_range(-1i8..=1)).collect();
        let bytes = pack_i2s(&t, 0.5);
        let view = I2sView::new(&bytes, rows, cols, 0.5);
        let x: Vec<f32> = (0..cols).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let parallel = KernelContext::new(KernelConfig {
            threads: 4,
            parallel_min_elements: 0,
            ..KernelConfig::default()
        });
        let serial = KernelContext::new(KernelConfig {
            threads: 1,
            ..KernelConfig::default()
        });
        let strict = KernelContext::new(KernelConfig::strict());

        let run = |ctx: &KernelContext| {
            let mut out = vec![0f32; rows];
            ctx.i2s_matvec(&mut out, view, &x, false);
            out
        };
        let a = run(&parallel);
        assert_eq!(a, run(&serial));
        assert_eq!(a, run(&strict));
    }

    #[test]
    fn float_activation_route() {
        let bytes = pack_i2s(&[1, -1, 0, 1], 2.0);
        let view = I2sView::new(&bytes, 2, 2, 2.0);
        let ctx = KernelContext::new(KernelConfig {
            i2s_quantized_activations: false,
            threads: 1,
            ..KernelConfig::default()
        });
        // column-major [[1, 0], [-1, 1]]
        let mut out = [0f32; 2];
        ctx.i2s_matvec(&mut out, view, &[1.0, 3.0], false);
        assert_eq!(out, [2.0, 4.0]);
        ctx.i2s_matvec(&mut out, view, &[1.0, 3.0], true);
        assert_eq!(out, [-4.0, 6.0]);
    }
}

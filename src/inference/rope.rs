//! Rotary position embedding with linear and YaRN scaling.

use crate::model::config::{RopeConfig, RopeScaling};

/// Per-head rotary embedding for a fixed head width.
#[derive(Debug, Clone)]
pub struct Rope {
    head_dim: usize,
    rope_dim: usize,
    neox: bool,
    scale: f32,
    scaling: RopeScaling,
    /// `base^(-2/rope_dim)`
    theta_scale: f64,
    ext_factor: f32,
    attn_factor: f32,
    corr_low: f32,
    corr_high: f32,
}

impl Rope {
    pub fn new(cfg: &RopeConfig, head_dim: usize) -> Self {
        let rope_dim = if cfg.dim == 0 || cfg.dim > head_dim {
            head_dim
        } else {
            cfg.dim
        };
        let base = if cfg.freq_base > 0.0 { cfg.freq_base } else { 10_000.0 };
        let (corr_low, corr_high) = corr_dims(cfg, rope_dim, base);
        Self {
            head_dim,
            rope_dim,
            neox: cfg.neox,
            scale: cfg.scale,
            scaling: cfg.scaling,
            theta_scale: (base as f64).powf(-2.0 / rope_dim.max(1) as f64),
            ext_factor: cfg.ext_factor,
            attn_factor: if cfg.attn_factor == 0.0 { 1.0 } else { cfg.attn_factor },
            corr_low,
            corr_high,
        }
    }

    pub fn rope_dim(&self) -> usize {
        self.rope_dim
    }

    /// Number of rotated pairs per head.
    pub fn pairs(&self) -> usize {
        self.rope_dim / 2
    }

    /// `(cos, sin)` for every pair at `pos`.
    pub fn angles(&self, pos: usize, out: &mut Vec<(f32, f32)>) {
        out.clear();
        let pairs = self.pairs();
        match self.scaling {
            RopeScaling::Linear => {
                let mut theta = pos as f64;
                if self.scale > 0.0 && self.scale != 1.0 {
                    theta /= self.scale as f64;
                }
                for _ in 0..pairs {
                    let (s, c) = theta.sin_cos();
                    out.push((c as f32, s as f32));
                    theta *= self.theta_scale;
                }
            }
            RopeScaling::Yarn => {
                let freq_scale = if self.scale != 0.0 { 1.0 / self.scale } else { 1.0 };
                let mut theta_extrap = pos as f64;
                for pair in 0..pairs {
                    out.push(self.yarn_cos_sin(theta_extrap as f32, freq_scale, pair));
                    theta_extrap *= self.theta_scale;
                }
            }
        }
    }

    fn yarn_cos_sin(&self, theta_extrap: f32, freq_scale: f32, pair: usize) -> (f32, f32) {
        let theta_interp = freq_scale * theta_extrap;
        let mut theta = theta_interp;
        let mut mscale = self.attn_factor;
        if self.ext_factor != 0.0 {
            let mix = ramp(self.corr_low, self.corr_high, pair) * self.ext_factor;
            theta = theta_interp * (1.0 - mix) + theta_extrap * mix;
            mscale *= 1.0 + 0.1 * (1.0 / freq_scale).ln();
        }
        let (s, c) = (theta as f64).sin_cos();
        (c as f32 * mscale, s as f32 * mscale)
    }

    /// Rotate every head of `x` in place with precomputed `angles`.
    pub fn rotate(&self, x: &mut [f32], heads: usize, angles: &[(f32, f32)]) {
        let half = self.rope_dim / 2;
        for h in 0..heads {
            let Some(head) = x.get_mut(h * self.head_dim..(h + 1) * self.head_dim) else {
                return;
            };
            for (p, &(c, s)) in angles.iter().enumerate().take(half) {
                let (i, j) = if self.neox { (p, p + half) } else { (2 * p, 2 * p + 1) };
                let (x0, x1) = (head[i], head[j]);
                head[i] = x0 * c - x1 * s;
                head[j] = x0 * s + x1 * c;
            }
        }
    }

    /// Convenience for one-off rotations.
    pub fn apply(&self, x: &mut [f32], heads: usize, pos: usize) {
        let mut angles = Vec::with_capacity(self.pairs());
        self.angles(pos, &mut angles);
        self.rotate(x, heads, &angles);
    }
}

/// `1 - clamp((pair - low) / max(high - low, 0.001), 0, 1)`
fn ramp(low: f32, high: f32, pair: usize) -> f32 {
    let y = (pair as f32 - low) / (high - low).max(0.001);
    1.0 - y.clamp(0.0, 1.0)
}

/// Correction range of rotary pairs. With an original context length the
/// ggml formula is used; otherwise the betas are taken as pair indices.
fn corr_dims(cfg: &RopeConfig, rope_dim: usize, base: f32) -> (f32, f32) {
    if cfg.original_context > 0.0 && cfg.beta_fast > 0.0 && cfg.beta_slow > 0.0 {
        let n_dims = rope_dim as f32;
        let corr_dim = |beta: f32| {
            n_dims * (cfg.original_context / (beta * 2.0 * std::f32::consts::PI)).ln()
                / (2.0 * base.ln())
        };
        let low = corr_dim(cfg.beta_fast).floor().max(0.0);
        let high = corr_dim(cfg.beta_slow).ceil().min(n_dims - 1.0);
        return (low, high.max(low));
    }
    let low = cfg.beta_slow.max(0.0);
    (low, cfg.beta_fast.max(low))
}

//! RMS normalization, gated activations and softmax.

/// `dst[i] = x[i] · w[i] / sqrt(mean(x²) + eps)`.
///
/// The mean of squares accumulates in f64, or in f32 when `match_ggml` is set.
pub fn rms_norm(dst: &mut [f32], x: &[f32], weight: &[f32], eps: f32, match_ggml: bool) {
    let n = dst.len().min(x.len()).min(weight.len());
    if n == 0 {
        return;
    }
    let sum = if match_ggml {
        x[..n].iter().map(|&v| v * v).sum::<f32>() as f64
    } else {
        x[..n].iter().map(|&v| v as f64 * v as f64).sum::<f64>()
    };
    let inv = (1.0 / (sum / n as f64 + eps as f64).sqrt()) as f32;
    for ((d, &v), &w) in dst[..n].iter_mut().zip(x).zip(weight) {
        *d = v * inv * w;
    }
}

/// In-place variant for buffers that are normalized where they live.
pub fn rms_norm_in_place(x: &mut [f32], weight: &[f32], eps: f32, match_ggml: bool) {
    let n = x.len().min(weight.len());
    if n == 0 {
        return;
    }
    let sum = if match_ggml {
        x[..n].iter().map(|&v| v * v).sum::<f32>() as f64
    } else {
        x[..n].iter().map(|&v| v as f64 * v as f64).sum::<f64>()
    };
    let inv = (1.0 / (sum / n as f64 + eps as f64).sqrt()) as f32;
    for (v, &w) in x[..n].iter_mut().zip(weight) {
        *v = *v * inv * w;
    }
}

/// SwiGLU gate: `dst[i] = silu(gate[i]) · up[i]`.
pub fn mul_silu(dst: &mut [f32], gate: &[f32], up: &[f32]) {
    for ((d, &g), &u) in dst.iter_mut().zip(gate).zip(up) {
        *d = g / (1.0 + (-g).exp()) * u;
    }
}

/// Squared-ReLU gate: `dst[i] = max(gate[i], 0)² · up[i]`.
pub fn mul_relu2(dst: &mut [f32], gate: &[f32], up: &[f32]) {
    for ((d, &g), &u) in dst.iter_mut().zip(gate).zip(up) {
        let r = g.max(0.0);
        *d = r * r * u;
    }
}

/// Max-subtracted softmax in place. Returns `false` (leaving the exponentials
/// unnormalized) when the sum is zero.
pub fn softmax_in_place(v: &mut [f32]) -> bool {
    let Some(max) = v.iter().copied().reduce(f32::max) else {
        return false;
    };
    let mut sum = 0.0f32;
    for x in v.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    if sum == 0.0 {
        return false;
    }
    let inv = 1.0 / sum;
    for x in v.iter_mut() {
        *x *= inv;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn rms_norm_unit_rms() {
        let x = [3.0f32, -4.0];
        let mut out = [0f32; 2];
        rms_norm(&mut out, &x, &[1.0, 2.0], 0.0, false);
        let rms = (12.5f32).sqrt();
        assert!((out[0] - 3.0 / rms).abs() < 1e-6);
        assert!((out[1] - 2.0 * -4.0 / rms).abs() < 1e-6);

        let mut y = x;
        rms_norm_in_place(&mut y, &[1.0, 2.0], 0.0, false);
        assert_eq!(y, out);
    }

    #[test]
    fn rms_norm_modes_close() {
        let mut rng = StdRng::seed_from_u64(1);
        let x: Vec<f32> = (0..256).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let w = vec![1.0f32; 256];
        let mut a = vec![0f32; 256];
        let mut b = vec![0f32; 256];
        rms_norm(&mut a, &x, &w, 1e-5, false);
        rms_norm(&mut b, &x, &w, 1e-5, true);
        for (p, q) in a.iter().zip(&b) {
            assert!((p - q).abs() < 1e-4);
        }
    }

    #[test]
    fn gated_activations() {
        let mut out = [0f32; 3];
        mul_relu2(&mut out, &[-1.0, 0.0, 2.0], &[5.0, 5.0, 0.5]);
        assert_eq!(out, [0.0, 0.0, 2.0]);

        mul_silu(&mut out, &[0.0, 1.0, -1.0], &[1.0, 2.0, 1.0]);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 2.0 / (1.0 + (-1.0f32).exp())).abs() < 1e-6);
        assert!(out[2] < 0.0);
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut rng = StdRng::seed_from_u64(9);
        for len in [1usize, 5, 64] {
            let mut v: Vec<f32> = (0..len).map(|_| rng.gen_range(-30.0..30.0)).collect();
            assert!(softmax_in_place(&mut v));
            let sum: f32 = v.iter().sum();
            assert!((sum - 1.0).abs() <= 1e-5, "len {len}: {sum}");
        }
        assert!(!softmax_in_place(&mut []));
    }
}

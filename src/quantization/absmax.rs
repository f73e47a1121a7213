//! AbsMax quantization: f32 weights to packed I2_S ternary.

use crate::kernels::TernaryWeight;
use crate::model::dequant::{i2s_packed_len, I2S_BLOCK, I2S_BLOCK_BYTES};

/// Packs ternary values in {-1, 0, 1} into the I2_S layout and appends the f32 scale.
///
/// Element `i` lands in super-block `i / 128`, byte `i % 32`, at shift
/// `6 - 2 * ((i % 128) / 32)`. Unused tail codes encode zero.
pub fn pack_i2s(ternary: &[i8], scale: f32) -> Vec<u8> {
    let zero = TernaryWeight::Zero.to_code();
    let fill = zero << 6 | zero << 4 | zero << 2 | zero;
    let mut out = vec![fill; i2s_packed_len(ternary.len())];
    for (i, &t) in ternary.iter().enumerate() {
        let code = TernaryWeight::from_i8(t).to_code();
        let off = i % I2S_BLOCK;
        let byte = (i / I2S_BLOCK) * I2S_BLOCK_BYTES + off % 32;
        let shift = 6 - 2 * (off / 32);
        out[byte] = (out[byte] & !(0b11 << shift)) | (code << shift);
    }
    out.extend_from_slice(&scale.to_le_bytes());
    out
}

/// Quantize f32 weights to ternary by sign with a single scale `max|w|`.
///
/// Returns the packed I2_S bytes (scale included) and the scale.
pub fn absmax_quantize_i2s(weights: &[f32]) -> (Vec<u8>, f32) {
    let scale = if weights.is_empty() {
        1.0f32
    } else {
        weights
            .iter()
            .map(|&w| w.abs())
            .fold(0.0f32, f32::max)
            .max(1e-12)
    };
    let ternary: Vec<i8> = weights
        .iter()
        .map(|&w| TernaryWeight::from_f32(w).to_i8())
        .collect();
    (pack_i2s(&ternary, scale), scale)
}

/// Root-mean-square error between two equally long slices.
pub fn compute_quantization_error(original: &[f32], quantized: &[f32]) -> f32 {
    let n = original.len().min(quantized.len());
    if n == 0 {
        return 0.0;
    }
    let sum_sq: f32 = original[..n]
        .iter()
        .zip(&quantized[..n])
        .map(|(a, q)| (a - q).powi(2))
        .sum();
    (sum_sq / n as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::dequant::{decode_tensor, GgmlType};

    #[test]
    fn pack_then_decode() {
        let t: Vec<i8> = (0..300).map(|i| [(-1i8), 0, 1][i % 3]).collect();
        let bytes = pack_i2s(&t, 0.5);
        assert_eq!(bytes.len(), 3 * 32 + 4);
        let out = decode_tensor(GgmlType::I2S, &bytes, t.len(), "w").unwrap();
        for (i, (&a, &b)) in t.iter().zip(&out).enumerate() {
            assert_eq!(a as f32 * 0.5, b, "element {i}");
        }
    }

    #[test]
    fn absmax_sign_quantization() {
        let w = [0.3f32, -0.9, 0.0, 0.1];
        let (bytes, scale) = absmax_quantize_i2s(&w);
        assert_eq!(scale, 0.9);
        let out = decode_tensor(GgmlType::I2S, &bytes, 4, "w").unwrap();
        assert_eq!(out, vec![0.9, -0.9, 0.0, 0.9]);
        assert!(compute_quantization_error(&w, &out) > 0.0);
    }
}

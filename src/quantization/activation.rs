//! Row-wise i8 activation quantization for the ternary×i8 kernels.

/// Floor on the absolute maximum so an all-zero row keeps a finite scale.
pub const I8S_EPS: f32 = 1e-5;

/// A quantized activation row: `q ≈ v · scale`.
#[derive(Debug, Clone, Copy)]
pub struct ActRow<'a> {
    pub q: &'a [i8],
    pub scale: f32,
    /// Sum of `q`, used to undo the code offset in the fast kernels.
    pub sum: i32,
}

/// Quantizes `src` into `dst` and returns `(scale, sum(q))`.
///
/// `scale = 127 / max(max|v|, 1e-5)`, `q = clip(round(v · scale), -128, 127)`,
/// with ties rounded to even.
pub fn quantize_row_i8s(dst: &mut [i8], src: &[f32]) -> (f32, i32) {
    let n = dst.len().min(src.len());
    if n == 0 {
        return (0.0, 0);
    }
    let max_abs = src[..n]
        .iter()
        .fold(0.0f32, |m, v| m.max(v.abs()))
        .max(I8S_EPS);
    let scale = 127.0 / max_abs;
    let mut sum = 0i32;
    for (d, &v) in dst[..n].iter_mut().zip(&src[..n]) {
        let q = (v as f64 * scale as f64).round_ties_even().clamp(-128.0, 127.0) as i8;
        *d = q;
        sum += q as i32;
    }
    (scale, sum)
}

/// Owned convenience wrapper around [`quantize_row_i8s`].
pub fn quantize_row(src: &[f32]) -> (Vec<i8>, f32, i32) {
    let mut q = vec![0i8; src.len()];
    let (scale, sum) = quantize_row_i8s(&mut q, src);
    (q, scale, sum)
}

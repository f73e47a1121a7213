//! Tensor element types and block decoders.
//!
//! Every decoder turns a little-endian byte slab into a flat f32 row. Block
//! layouts follow ggml; I2_S keeps its trailing f32 scale in the same slab.

use crate::config::Code3Mode;
use crate::errors::{BitNetError, Result};

/// ggml tensor type codes understood by the decoders.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum GgmlType {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q4_1 = 3,
    Q5_0 = 6,
    Q5_1 = 7,
    Q8_0 = 8,
    Q8_1 = 9,
    Q2_K = 10,
    Q3_K = 11,
    Q4_K = 12,
    Q5_K = 13,
    Q6_K = 14,
    Q8_K = 15,
    TQ1_0 = 34,
    TQ2_0 = 35,
    I2S = 36,
}

/// Elements per I2_S super-block.
pub const I2S_BLOCK: usize = 128;
/// Bytes per I2_S super-block.
pub const I2S_BLOCK_BYTES: usize = 32;

const QK: usize = 32;
const QK_K: usize = 256;

impl GgmlType {
    pub fn from_u32(v: u32) -> Option<Self> {
        use GgmlType::*;
        Some(match v {
            0 => F32,
            1 => F16,
            2 => Q4_0,
            3 => Q4_1,
            6 => Q5_0,
            7 => Q5_1,
            8 => Q8_0,
            9 => Q8_1,
            10 => Q2_K,
            11 => Q3_K,
            12 => Q4_K,
            13 => Q5_K,
            14 => Q6_K,
            15 => Q8_K,
            34 => TQ1_0,
            35 => TQ2_0,
            36 => I2S,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use GgmlType::*;
        match self {
            F32 => "f32",
            F16 => "f16",
            Q4_0 => "q4_0",
            Q4_1 => "q4_1",
            Q5_0 => "q5_0",
            Q5_1 => "q5_1",
            Q8_0 => "q8_0",
            Q8_1 => "q8_1",
            Q2_K => "q2_k",
            Q3_K => "q3_k",
            Q4_K => "q4_k",
            Q5_K => "q5_k",
            Q6_K => "q6_k",
            Q8_K => "q8_k",
            TQ1_0 => "tq1_0",
            TQ2_0 => "tq2_0",
            I2S => "i2_s",
        }
    }

    /// Elements per block. I2_S reports 1: its count need not be a multiple of 128.
    pub fn block_size(self) -> usize {
        use GgmlType::*;
        match self {
            F32 | F16 | I2S => 1,
            Q4_0 | Q4_1 | Q5_0 | Q5_1 | Q8_0 | Q8_1 => QK,
            Q2_K | Q3_K | Q4_K | Q5_K | Q6_K | Q8_K | TQ1_0 | TQ2_0 => QK_K,
        }
    }

    /// Bytes per block (per element for F32/F16).
    pub fn block_bytes(self) -> usize {
        use GgmlType::*;
        match self {
            F32 => 4,
            F16 => 2,
            Q4_0 => 2 + QK / 2,
            Q4_1 => 4 + QK / 2,
            Q5_0 => 2 + 4 + QK / 2,
            Q5_1 => 4 + 4 + QK / 2,
            Q8_0 => 2 + QK,
            Q8_1 => 4 + QK,
            Q2_K => 2 + 2 + QK_K / 16 + QK_K / 4,
            Q3_K => QK_K / 8 + QK_K / 4 + 12 + 2,
            Q4_K => 2 + 2 + 12 + QK_K / 2,
            Q5_K => 2 + 2 + 12 + QK_K / 8 + QK_K / 2,
            Q6_K => QK_K / 2 + QK_K / 4 + QK_K / 16 + 2,
            Q8_K => 4 + QK_K + (QK_K / 16) * 2,
            TQ1_0 => (QK_K - 4 * QK_K / 64) / 5 + QK_K / 64 + 2,
            TQ2_0 => QK_K / 4 + 2,
            I2S => 0,
        }
    }

    /// Encoded byte length for `count` elements, after block-size validation.
    pub fn encoded_len(self, name: &str, count: u64) -> Result<usize> {
        let count_usize = usize::try_from(count).map_err(|_| BitNetError::SizeOverflow {
            name: name.to_string(),
        })?;
        if self == GgmlType::I2S {
            return Ok(i2s_packed_len(count_usize) + 4);
        }
        let bs = self.block_size();
        if count_usize % bs != 0 {
            return Err(BitNetError::BadBlockSize {
                name: name.to_string(),
                count,
                block_size: bs as u64,
            });
        }
        (count_usize / bs)
            .checked_mul(self.block_bytes())
            .ok_or_else(|| BitNetError::SizeOverflow {
                name: name.to_string(),
            })
    }
}

/// Packed I2_S byte length (without the trailing scale).
pub fn i2s_packed_len(count: usize) -> usize {
    count.div_ceil(I2S_BLOCK) * I2S_BLOCK_BYTES
}

/// IEEE half to f32, subnormals included.
#[inline]
pub fn f16_to_f32(bits: u16) -> f32 {
    half::f16::from_bits(bits).to_f32()
}

#[inline]
fn f16_at(b: &[u8], off: usize) -> f32 {
    f16_to_f32(u16::from_le_bytes([b[off], b[off + 1]]))
}

#[inline]
fn f32_at(b: &[u8], off: usize) -> f32 {
    f32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// Ternary value of a 2-bit I2_S code.
#[inline]
pub fn i2s_code_value(code: u8, mode: Code3Mode) -> i8 {
    match code & 3 {
        0 => -1,
        1 => 0,
        2 => 1,
        _ => match mode {
            Code3Mode::Zero => 0,
            Code3Mode::PlusOne => 1,
        },
    }
}

/// Code at flat element index `idx` of a packed I2_S slab.
#[inline]
pub fn i2s_code_at(packed: &[u8], idx: usize) -> u8 {
    let block = idx / I2S_BLOCK;
    let off = idx % I2S_BLOCK;
    let gp = off % 32;
    let group = off / 32;
    let byte = packed[block * I2S_BLOCK_BYTES + gp];
    (byte >> (6 - 2 * group)) & 3
}

/// Decodes `count` elements of type `ty` from `data` into f32.
pub fn decode_tensor(ty: GgmlType, data: &[u8], count: usize, name: &str) -> Result<Vec<f32>> {
    let need = ty.encoded_len(name, count as u64)?;
    if data.len() < need {
        return Err(BitNetError::Truncated {
            context: format!("tensor {name} ({}): need {need} bytes, have {}", ty.name(), data.len()),
        });
    }
    let data = &data[..need];
    let mut out = vec![0f32; count];
    match ty {
        GgmlType::F32 => {
            for (o, c) in out.iter_mut().zip(data.chunks_exact(4)) {
                *o = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            }
        }
        GgmlType::F16 => {
            for (o, c) in out.iter_mut().zip(data.chunks_exact(2)) {
                *o = f16_to_f32(u16::from_le_bytes([c[0], c[1]]));
            }
        }
        GgmlType::Q4_0 => decode_blocks(data, &mut out, ty, dequant_q4_0),
        GgmlType::Q4_1 => decode_blocks(data, &mut out, ty, dequant_q4_1),
        GgmlType::Q5_0 => decode_blocks(data, &mut out, ty, dequant_q5_0),
        GgmlType::Q5_1 => decode_blocks(data, &mut out, ty, dequant_q5_1),
        GgmlType::Q8_0 => decode_blocks(data, &mut out, ty, dequant_q8_0),
        GgmlType::Q8_1 => decode_blocks(data, &mut out, ty, dequant_q8_1),
        GgmlType::Q2_K => decode_blocks(data, &mut out, ty, dequant_q2_k),
        GgmlType::Q3_K => decode_blocks(data, &mut out, ty, dequant_q3_k),
        GgmlType::Q4_K => decode_blocks(data, &mut out, ty, dequant_q4_k),
        GgmlType::Q5_K => decode_blocks(data, &mut out, ty, dequant_q5_k),
        GgmlType::Q6_K => decode_blocks(data, &mut out, ty, dequant_q6_k),
        GgmlType::Q8_K => decode_blocks(data, &mut out, ty, dequant_q8_k),
        GgmlType::TQ1_0 => decode_blocks(data, &mut out, ty, dequant_tq1_0),
        GgmlType::TQ2_0 => decode_blocks(data, &mut out, ty, dequant_tq2_0),
        GgmlType::I2S => {
            let packed_len = i2s_packed_len(count);
            let scale = f32_at(data, packed_len);
            decode_i2s_into(&data[..packed_len], scale, Code3Mode::Zero, &mut out);
        }
    }
    Ok(out)
}

/// Decodes packed I2_S codes times `scale` into `out`.
pub fn decode_i2s_into(packed: &[u8], scale: f32, mode: Code3Mode, out: &mut [f32]) {
    let n = out.len().min(packed.len() / I2S_BLOCK_BYTES * I2S_BLOCK);
    for (i, o) in out[..n].iter_mut().enumerate() {
        *o = f32::from(i2s_code_value(i2s_code_at(packed, i), mode)) * scale;
    }
}

fn decode_blocks(data: &[u8], out: &mut [f32], ty: GgmlType, f: fn(&[u8], &mut [f32])) {
    for (blk, dst) in data
        .chunks_exact(ty.block_bytes())
        .zip(out.chunks_exact_mut(ty.block_size()))
    {
        f(blk, dst);
    }
}

/// Nibble `idx` of a packed array; even indices take the low nibble.
#[inline]
fn nibble_at(qs: &[u8], idx: usize) -> u8 {
    let b = qs[idx / 2];
    if idx % 2 == 0 {
        b & 0x0f
    } else {
        b >> 4
    }
}

fn dequant_q4_0(b: &[u8], out: &mut [f32]) {
    let d = f16_at(b, 0);
    let qs = &b[2..];
    for (i, o) in out.iter_mut().enumerate() {
        *o = d * (nibble_at(qs, i) as i32 - 8) as f32;
    }
}

fn dequant_q4_1(b: &[u8], out: &mut [f32]) {
    let d = f16_at(b, 0);
    let m = f16_at(b, 2);
    let qs = &b[4..];
    for (i, o) in out.iter_mut().enumerate() {
        *o = d * nibble_at(qs, i) as f32 + m;
    }
}

#[inline]
fn q5_value(qh: &[u8], qs: &[u8], i: usize) -> u8 {
    let hi = (qh[i / 8] >> (i % 8)) & 1;
    (hi << 4) | nibble_at(qs, i)
}

fn dequant_q5_0(b: &[u8], out: &mut [f32]) {
    let d = f16_at(b, 0);
    let (qh, qs) = (&b[2..6], &b[6..]);
    for (i, o) in out.iter_mut().enumerate() {
        *o = d * (q5_value(qh, qs, i) as i32 - 16) as f32;
    }
}

fn dequant_q5_1(b: &[u8], out: &mut [f32]) {
    let d = f16_at(b, 0);
    let m = f16_at(b, 2);
    let (qh, qs) = (&b[4..8], &b[8..]);
    for (i, o) in out.iter_mut().enumerate() {
        *o = d * q5_value(qh, qs, i) as f32 + m;
    }
}

fn dequant_q8_0(b: &[u8], out: &mut [f32]) {
    let d = f16_at(b, 0);
    for (o, &q) in out.iter_mut().zip(&b[2..]) {
        *o = d * (q as i8) as f32;
    }
}

fn dequant_q8_1(b: &[u8], out: &mut [f32]) {
    // d, s (sum, unused for decode), qs
    let d = f16_at(b, 0);
    for (o, &q) in out.iter_mut().zip(&b[4..]) {
        *o = d * (q as i8) as f32;
    }
}

fn dequant_q2_k(b: &[u8], out: &mut [f32]) {
    let scales = &b[0..QK_K / 16];
    let mut q = &b[QK_K / 16..QK_K / 16 + QK_K / 4];
    let d = f16_at(b, QK_K / 16 + QK_K / 4);
    let dmin = f16_at(b, QK_K / 16 + QK_K / 4 + 2);

    let mut is = 0;
    let mut oi = 0;
    for _ in (0..QK_K).step_by(128) {
        let mut shift = 0;
        for _ in 0..4 {
            for part in 0..2 {
                let sc = scales[is];
                is += 1;
                let dl = d * (sc & 0xf) as f32;
                let ml = dmin * (sc >> 4) as f32;
                for l in 0..16 {
                    out[oi] = dl * ((q[l + 16 * part] >> shift) & 3) as f32 - ml;
                    oi += 1;
                }
            }
            shift += 2;
        }
        q = &q[32..];
    }
}

/// Unpacks the 12-byte Q3_K scale table into 16 six-bit scales.
fn q3_k_scales(src: &[u8]) -> [i8; 16] {
    const KMASK1: u32 = 0x0303_0303;
    const KMASK2: u32 = 0x0f0f_0f0f;
    let word = |o: usize| u32::from_le_bytes([src[o], src[o + 1], src[o + 2], src[o + 3]]);
    let (a0, a1, tmp) = (word(0), word(4), word(8));
    let aux = [
        (a0 & KMASK2) | ((tmp & KMASK1) << 4),
        (a1 & KMASK2) | (((tmp >> 2) & KMASK1) << 4),
        ((a0 >> 4) & KMASK2) | (((tmp >> 4) & KMASK1) << 4),
        ((a1 >> 4) & KMASK2) | (((tmp >> 6) & KMASK1) << 4),
    ];
    let mut scales = [0i8; 16];
    for (i, v) in aux.iter().enumerate() {
        for (k, byte) in v.to_le_bytes().iter().enumerate() {
            scales[i * 4 + k] = *byte as i8;
        }
    }
    scales
}

fn dequant_q3_k(b: &[u8], out: &mut [f32]) {
    let hm = &b[0..QK_K / 8];
    let mut q = &b[QK_K / 8..QK_K / 8 + QK_K / 4];
    let scales = q3_k_scales(&b[QK_K / 8 + QK_K / 4..QK_K / 8 + QK_K / 4 + 12]);
    let d = f16_at(b, QK_K / 8 + QK_K / 4 + 12);

    let mut m: u8 = 1;
    let mut is = 0;
    let mut oi = 0;
    for _ in (0..QK_K).step_by(128) {
        let mut shift = 0;
        for _ in 0..4 {
            for part in 0..2 {
                let dl = d * (scales[is] as i32 - 32) as f32;
                is += 1;
                for l in 0..16 {
                    let idx = l + 16 * part;
                    let mut v = ((q[idx] >> shift) & 3) as i32;
                    if hm[idx] & m == 0 {
                        v -= 4;
                    }
                    out[oi] = dl * v as f32;
                    oi += 1;
                }
            }
            shift += 2;
            m = m.wrapping_shl(1);
        }
        q = &q[32..];
    }
}

/// Six-bit scale and min for sub-block `j` of a Q4_K/Q5_K block.
#[inline]
fn scale_min_k4(j: usize, q: &[u8]) -> (u8, u8) {
    if j < 4 {
        (q[j] & 63, q[j + 4] & 63)
    } else {
        (
            (q[j + 4] & 0xf) | ((q[j - 4] >> 6) << 4),
            (q[j + 4] >> 4) | ((q[j] >> 6) << 4),
        )
    }
}

fn dequant_q4_k(b: &[u8], out: &mut [f32]) {
    let d = f16_at(b, 0);
    let dmin = f16_at(b, 2);
    let scales = &b[4..16];
    let mut q = &b[16..];
    let mut is = 0;
    let mut oi = 0;
    for _ in (0..QK_K).step_by(64) {
        let (sc1, m1) = scale_min_k4(is, scales);
        let (sc2, m2) = scale_min_k4(is + 1, scales);
        let (d1, min1) = (d * sc1 as f32, dmin * m1 as f32);
        let (d2, min2) = (d * sc2 as f32, dmin * m2 as f32);
        for l in 0..32 {
            out[oi + l] = d1 * (q[l] & 0xf) as f32 - min1;
            out[oi + 32 + l] = d2 * (q[l] >> 4) as f32 - min2;
        }
        oi += 64;
        q = &q[32..];
        is += 2;
    }
}

fn dequant_q5_k(b: &[u8], out: &mut [f32]) {
    let d = f16_at(b, 0);
    let dmin = f16_at(b, 2);
    let scales = &b[4..16];
    let qh = &b[16..16 + QK_K / 8];
    let mut ql = &b[16 + QK_K / 8..];
    let (mut u1, mut u2) = (1u8, 2u8);
    let mut is = 0;
    let mut oi = 0;
    for _ in (0..QK_K).step_by(64) {
        let (sc1, m1) = scale_min_k4(is, scales);
        let (sc2, m2) = scale_min_k4(is + 1, scales);
        let (d1, min1) = (d * sc1 as f32, dmin * m1 as f32);
        let (d2, min2) = (d * sc2 as f32, dmin * m2 as f32);
        for l in 0..32 {
            let lo = (ql[l] & 0xf) as u32 + if qh[l] & u1 != 0 { 16 } else { 0 };
            let hi = (ql[l] >> 4) as u32 + if qh[l] & u2 != 0 { 16 } else { 0 };
            out[oi + l] = d1 * lo as f32 - min1;
            out[oi + 32 + l] = d2 * hi as f32 - min2;
        }
        oi += 64;
        ql = &ql[32..];
        is += 2;
        u1 = u1.wrapping_shl(2);
        u2 = u2.wrapping_shl(2);
    }
}

fn dequant_q6_k(b: &[u8], out: &mut [f32]) {
    let mut ql = &b[0..QK_K / 2];
    let mut qh = &b[QK_K / 2..QK_K / 2 + QK_K / 4];
    let mut sc = &b[QK_K / 2 + QK_K / 4..QK_K / 2 + QK_K / 4 + QK_K / 16];
    let d = f16_at(b, QK_K / 2 + QK_K / 4 + QK_K / 16);
    let mut base = 0;
    for _ in (0..QK_K).step_by(128) {
        for l in 0..32 {
            let is = l / 16;
            let q1 = ((ql[l] & 0xf) | ((qh[l] & 3) << 4)) as i32 - 32;
            let q2 = ((ql[l + 32] & 0xf) | (((qh[l] >> 2) & 3) << 4)) as i32 - 32;
            let q3 = ((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) as i32 - 32;
            let q4 = ((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) as i32 - 32;
            out[base + l] = d * (sc[is] as i8) as f32 * q1 as f32;
            out[base + l + 32] = d * (sc[is + 2] as i8) as f32 * q2 as f32;
            out[base + l + 64] = d * (sc[is + 4] as i8) as f32 * q3 as f32;
            out[base + l + 96] = d * (sc[is + 6] as i8) as f32 * q4 as f32;
        }
        base += 128;
        ql = &ql[64..];
        qh = &qh[32..];
        sc = &sc[8..];
    }
}

fn dequant_q8_k(b: &[u8], out: &mut [f32]) {
    // bsums trail the quants and are not needed here
    let d = f32_at(b, 0);
    for (o, &q) in out.iter_mut().zip(&b[4..4 + QK_K]) {
        *o = d * (q as i8) as f32;
    }
}

fn dequant_tq1_0(b: &[u8], out: &mut [f32]) {
    const QS: usize = (QK_K - 4 * QK_K / 64) / 5;
    const QH: usize = QK_K / 64;
    const POW3: [u8; 6] = [1, 3, 9, 27, 81, 243];
    let qs = &b[..QS];
    let qh = &b[QS..QS + QH];
    let d = f16_at(b, QS + QH);

    let trit = |byte: u8, p: u8| -> f32 {
        let q = byte.wrapping_mul(p);
        let xi = ((q as u16 * 3) >> 8) as i16;
        (xi - 1) as f32 * d
    };

    let mut oi = 0;
    let main = QS - QS % 32;
    for j in (0..main).step_by(32) {
        for &p in &POW3[..5] {
            for m in 0..32 {
                out[oi] = trit(qs[j + m], p);
                oi += 1;
            }
        }
    }
    for j in (main..QS).step_by(16) {
        for &p in &POW3[..5] {
            for m in 0..16 {
                out[oi] = trit(qs[j + m], p);
                oi += 1;
            }
        }
    }
    for &p in &POW3[..4] {
        for &byte in qh {
            out[oi] = trit(byte, p);
            oi += 1;
        }
    }
}

fn dequant_tq2_0(b: &[u8], out: &mut [f32]) {
    let qs = &b[..QK_K / 4];
    let d = f16_at(b, QK_K / 4);
    let mut oi = 0;
    for j in (0..qs.len()).step_by(32) {
        for l in 0..4 {
            for m in 0..32 {
                let q = (qs[j + m] >> (2 * l)) & 3;
                out[oi] = (q as i32 - 1) as f32 * d;
                oi += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn f16_bytes(v: f32) -> [u8; 2] {
        f16::from_f32(v).to_bits().to_le_bytes()
    }

    #[test]
    fn f32_decode() {
        let vals = [1.5f32, -2.0, 0.25, 3.75];
        let bytes: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(decode_tensor(GgmlType::F32, &bytes, 4, "t").unwrap(), vals);
    }

    #[test]
    fn f16_subnormal() {
        // smallest positive subnormal half
        assert_eq!(f16_to_f32(0x0001), 2f32.powi(-24));
        assert_eq!(f16_to_f32(0x3c00), 1.0);
        assert_eq!(f16_to_f32(0x8000), -0.0);
    }

    #[test]
    fn q8_0_block() {
        let mut block = f16_bytes(0.5).to_vec();
        block.extend((-16i8..16).map(|q| q as u8));
        let out = decode_tensor(GgmlType::Q8_0, &block, 32, "q").unwrap();
        let expect: Vec<f32> = (-16..16).map(|q| q as f32 * 0.5).collect();
        assert_eq!(out, expect);
    }

    #[test]
    fn q4_0_low_nibble_first() {
        let mut block = f16_bytes(2.0).to_vec();
        block.push(0x9a); // low 0xa, high 0x9
        block.extend([0x88u8; 15]);
        let out = decode_tensor(GgmlType::Q4_0, &block, 32, "q").unwrap();
        assert_eq!(out[0], 2.0 * (10 - 8) as f32);
        assert_eq!(out[1], 2.0 * (9 - 8) as f32);
        assert!(out[2..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn q4_1_adds_min() {
        let mut block = f16_bytes(1.0).to_vec();
        block.extend(f16_bytes(-3.0));
        block.extend([0x21u8; 16]);
        let out = decode_tensor(GgmlType::Q4_1, &block, 32, "q").unwrap();
        assert_eq!(out[0], 1.0 - 3.0);
        assert_eq!(out[1], 2.0 - 3.0);
    }

    #[test]
    fn q5_0_high_bit() {
        let mut block = f16_bytes(1.0).to_vec();
        block.extend([0b0000_0001, 0, 0, 0]);
        block.extend([0u8; 16]);
        let out = decode_tensor(GgmlType::Q5_0, &block, 32, "q").unwrap();
        assert_eq!(out[0], 0.0); // (16 | 0) - 16
        assert_eq!(out[1], -16.0);
    }

    #[test]
    fn q8_k_block() {
        let mut block = 0.25f32.to_le_bytes().to_vec();
        block.extend((0..QK_K).map(|i| (i as i32 - 128) as i8 as u8));
        block.extend([0u8; 32]);
        let out = decode_tensor(GgmlType::Q8_K, &block, QK_K, "q").unwrap();
        assert_eq!(out[0], -32.0);
        assert_eq!(out[255], 127.0 * 0.25);
    }

    #[test]
    fn q4_k_uniform_scales() {
        // scales 1 and mins 0 for all eight sub-blocks
        let mut block = f16_bytes(1.0).to_vec();
        block.extend(f16_bytes(0.0));
        block.extend([1, 1, 1, 1, 0, 0, 0, 0, 0x01, 0x01, 0x01, 0x01]);
        block.extend([0x53u8; QK_K / 2]);
        let out = decode_tensor(GgmlType::Q4_K, &block, QK_K, "q").unwrap();
        for chunk in out.chunks(64) {
            assert!(chunk[..32].iter().all(|&v| v == 3.0));
            assert!(chunk[32..].iter().all(|&v| v == 5.0));
        }
    }

    #[test]
    fn q6_k_zero_point() {
        // ql/qh chosen so every quant equals 32 → value 0
        let mut block = vec![0u8; QK_K / 2];
        block.extend([0b1010_1010u8; QK_K / 4]);
        block.extend([1u8; QK_K / 16]);
        block.extend(f16_bytes(1.0));
        let out = decode_tensor(GgmlType::Q6_K, &block, QK_K, "q").unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn q2_k_min_subtracted() {
        let mut block = vec![0x21u8; QK_K / 16]; // scale 1, min 2
        block.extend([0u8; QK_K / 4]);
        block.extend(f16_bytes(1.0));
        block.extend(f16_bytes(0.5));
        let out = decode_tensor(GgmlType::Q2_K, &block, QK_K, "q").unwrap();
        assert!(out.iter().all(|&v| v == -1.0));
    }

    #[test]
    fn q3_k_all_low() {
        // scales all encode 32 → multiplier 0
        let mut block = vec![0u8; QK_K / 8 + QK_K / 4];
        block.extend([0u8, 0, 0, 0, 0, 0, 0, 0, 0xaa, 0xaa, 0xaa, 0xaa]);
        block.extend(f16_bytes(1.0));
        let out = decode_tensor(GgmlType::Q3_K, &block, QK_K, "q").unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn tq2_0_codes() {
        let mut block = vec![0b1001_0100u8; QK_K / 4]; // codes 0,1,1,2 from low bits
        block.extend(f16_bytes(2.0));
        let out = decode_tensor(GgmlType::TQ2_0, &block, QK_K, "t").unwrap();
        assert_eq!(&out[0..1], &[-2.0]);
        assert_eq!(out[32], 0.0);
        assert_eq!(out[96], 2.0);
    }

    #[test]
    fn tq1_0_zero_bytes_decode_to_minus_one() {
        let mut block = vec![0u8; GgmlType::TQ1_0.block_bytes() - 2];
        block.extend(f16_bytes(1.5));
        let out = decode_tensor(GgmlType::TQ1_0, &block, QK_K, "t").unwrap();
        assert_eq!(out.len(), QK_K);
        assert!(out.iter().all(|&v| v == -1.5));
    }

    #[test]
    fn i2s_layout_and_scale() {
        // first byte holds codes for positions 0, 32, 64, 96
        let mut packed = vec![0x55u8; 32]; // code 1 everywhere → 0
        packed[0] = 0b00_10_11_01; // pos0=-1, pos32=+1, pos64=code3, pos96=0
        packed.extend(2.0f32.to_le_bytes());
        let out = decode_tensor(GgmlType::I2S, &packed, 128, "w").unwrap();
        assert_eq!(out[0], -2.0);
        assert_eq!(out[32], 2.0);
        assert_eq!(out[64], 0.0);
        assert_eq!(out[96], 0.0);
        assert_eq!(out[1], 0.0);

        let mut plus = vec![0f32; 128];
        decode_i2s_into(&packed[..32], 2.0, Code3Mode::PlusOne, &mut plus);
        assert_eq!(plus[64], 2.0);
    }

    #[test]
    fn block_size_mismatch() {
        let err = decode_tensor(GgmlType::Q8_0, &[0u8; 64], 33, "odd").unwrap_err();
        assert!(matches!(err, BitNetError::BadBlockSize { block_size: 32, .. }));
    }

    #[test]
    fn short_slab_is_truncated() {
        let err = decode_tensor(GgmlType::F32, &[0u8; 7], 2, "short").unwrap_err();
        assert!(matches!(err, BitNetError::Truncated { .. }));
    }
}

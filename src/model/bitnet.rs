//! Transformer graph: linear weights, layers and the loaded model.

use tracing::debug;

use super::config::ModelConfig;
use super::dequant::GgmlType;
use super::store::{ModelFile, PackedBytes};
use crate::config::Code3Mode;
use crate::errors::{BitNetError, Result};
use crate::kernels::{f16_column, matvec_f16, matvec_t_f16, I2sView, KernelContext};

pub const TOKEN_EMBD: &str = "token_embd.weight";
pub const OUTPUT: &str = "output.weight";
pub const OUTPUT_NORM: &str = "output_norm.weight";

/// Storage of a 2-D weight.
#[derive(Debug, Clone)]
pub enum WeightData {
    F32(Vec<f32>),
    /// Raw half bits, decoded on the fly.
    F16(Vec<u16>),
    /// Packed ternary codes with one scale for the whole tensor.
    I2s { packed: PackedBytes, scale: f32 },
}

impl WeightData {
    pub fn kind(&self) -> &'static str {
        match self {
            WeightData::F32(_) => "f32",
            WeightData::F16(_) => "f16",
            WeightData::I2s { .. } => "i2_s",
        }
    }
}

/// A column-major `rows × cols` weight plus the orientation it is applied in.
///
/// `transposed` is set when `rows` equals the input dimension, in which case
/// the weight is applied with `matvec_t` and produces `cols` outputs.
#[derive(Debug, Clone)]
pub struct LinearWeight {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    pub transposed: bool,
    pub data: WeightData,
}

fn matrix_dims(file: &ModelFile, name: &str) -> Result<(usize, usize, GgmlType)> {
    let info = file.tensor_info(name)?;
    if info.dims.len() != 2 {
        return Err(BitNetError::shape(
            name,
            format!("expected 2 dims, got {:?}", info.dims),
        ));
    }
    let rows = usize::try_from(info.dims[0]).unwrap_or(0);
    let cols = usize::try_from(info.dims[1]).unwrap_or(0);
    if rows == 0 || cols == 0 {
        return Err(BitNetError::shape(name, format!("invalid dims {:?}", info.dims)));
    }
    let ty = info.ggml_type().ok_or_else(|| BitNetError::UnsupportedType {
        type_code: info.type_code,
        context: name.to_string(),
    })?;
    Ok((rows, cols, ty))
}

impl LinearWeight {
    /// Loads `name` as a projection whose input has `in_dim` elements.
    ///
    /// F16 stays raw, I2_S stays packed, everything else is decoded to f32.
    pub fn load(file: &ModelFile, name: &str, in_dim: usize) -> Result<Self> {
        let (rows, cols, ty) = matrix_dims(file, name)?;
        let transposed = if rows == in_dim {
            true
        } else if cols == in_dim {
            false
        } else {
            return Err(BitNetError::shape(
                name,
                format!("dims [{rows}, {cols}] incompatible with input dim {in_dim}"),
            ));
        };
        let data = match ty {
            GgmlType::I2S => {
                let p = file.read_tensor_i2s_packed(name)?;
                WeightData::I2s {
                    packed: p.packed,
                    scale: p.scale,
                }
            }
            GgmlType::F16 => WeightData::F16(file.read_tensor_f16_raw(name)?),
            _ => WeightData::F32(file.read_tensor_f32(name)?),
        };
        debug!(tensor = name, rows, cols, transposed, kind = data.kind(), "linear weight");
        Ok(Self {
            name: name.to_string(),
            rows,
            cols,
            transposed,
            data,
        })
    }

    /// Loads the `hidden × vocab` embedding table. F16 stays raw, every
    /// other type (I2_S included) is decoded to f32.
    pub fn load_embedding(file: &ModelFile, name: &str) -> Result<Self> {
        let (rows, cols, ty) = matrix_dims(file, name)?;
        let data = match ty {
            GgmlType::F16 => WeightData::F16(file.read_tensor_f16_raw(name)?),
            _ => WeightData::F32(file.read_tensor_f32(name)?),
        };
        Ok(Self {
            name: name.to_string(),
            rows,
            cols,
            transposed: true,
            data,
        })
    }

    pub fn in_dim(&self) -> usize {
        if self.transposed {
            self.rows
        } else {
            self.cols
        }
    }

    pub fn out_dim(&self) -> usize {
        if self.transposed {
            self.cols
        } else {
            self.rows
        }
    }

    /// `dst = W·x` using the kernel that matches storage and orientation.
    pub fn apply(&self, ctx: &KernelContext, dst: &mut [f32], x: &[f32]) {
        let (rows, cols) = (self.rows, self.cols);
        match &self.data {
            WeightData::F32(mat) if self.transposed => ctx.matvec_t(dst, mat, rows, cols, x),
            WeightData::F32(mat) => ctx.matvec(dst, mat, rows, cols, x),
            WeightData::F16(mat) if self.transposed => matvec_t_f16(dst, mat, rows, cols, x),
            WeightData::F16(mat) => matvec_f16(dst, mat, rows, cols, x),
            WeightData::I2s { packed, scale } => {
                let view = I2sView::new(packed, rows, cols, *scale);
                ctx.i2s_matvec(dst, view, x, self.transposed);
            }
        }
    }

    /// Copies stored column `c` into `dst` (an embedding row). Returns `false`
    /// when `c` is out of range.
    pub fn column(&self, dst: &mut [f32], c: usize) -> bool {
        if c >= self.cols {
            return false;
        }
        let rows = self.rows;
        match &self.data {
            WeightData::F32(mat) => match mat.get(rows * c..rows * (c + 1)) {
                Some(col) => {
                    let n = dst.len().min(rows);
                    dst[..n].copy_from_slice(&col[..n]);
                    true
                }
                None => false,
            },
            WeightData::F16(mat) => {
                if mat.len() < rows * (c + 1) {
                    return false;
                }
                f16_column(dst, mat, rows, c);
                true
            }
            WeightData::I2s { packed, scale } => {
                let view = I2sView::new(packed, rows, self.cols, *scale);
                if !view.is_valid() {
                    return false;
                }
                for (r, d) in dst.iter_mut().take(rows).enumerate() {
                    *d = view.value(r, c, Code3Mode::Zero) as f32 * scale;
                }
                true
            }
        }
    }
}

fn load_norm(file: &ModelFile, name: &str, len: usize) -> Result<Vec<f32>> {
    let v = file.read_tensor_f32(name)?;
    if v.len() != len {
        return Err(BitNetError::shape(name, format!("len {} want {len}", v.len())));
    }
    Ok(v)
}

/// One transformer block.
#[derive(Debug, Clone)]
pub struct Layer {
    pub attn_norm: Vec<f32>,
    /// Applied to the attention accumulator before `attn_output`.
    pub attn_sub_norm: Option<Vec<f32>>,
    pub ffn_norm: Vec<f32>,
    /// Applied to the activated FFN vector before `ffn_down`.
    pub ffn_sub_norm: Option<Vec<f32>>,
    pub attn_q: LinearWeight,
    pub attn_k: LinearWeight,
    pub attn_v: LinearWeight,
    pub attn_output: LinearWeight,
    pub ffn_gate: LinearWeight,
    pub ffn_up: LinearWeight,
    pub ffn_down: LinearWeight,
    pub head_dim: usize,
}

impl Layer {
    /// Loads `blk.{idx}.*` and validates it against `hidden` and the head counts.
    pub fn load(file: &ModelFile, idx: usize, hidden: usize, heads: usize, kv_heads: usize) -> Result<Self> {
        let name = |t: &str| format!("blk.{idx}.{t}.weight");
        let optional_norm = |t: &str, len: usize| -> Result<Option<Vec<f32>>> {
            let n = name(t);
            if file.gguf().has_tensor(&n) {
                load_norm(file, &n, len).map(Some)
            } else {
                Ok(None)
            }
        };

        let attn_norm = load_norm(file, &name("attn_norm"), hidden)?;
        let ffn_norm = load_norm(file, &name("ffn_norm"), hidden)?;
        let attn_q = LinearWeight::load(file, &name("attn_q"), hidden)?;
        let attn_k = LinearWeight::load(file, &name("attn_k"), hidden)?;
        let attn_v = LinearWeight::load(file, &name("attn_v"), hidden)?;

        let (q_dim, k_dim, v_dim) = (attn_q.out_dim(), attn_k.out_dim(), attn_v.out_dim());
        if q_dim % heads != 0 {
            return Err(BitNetError::shape(
                &attn_q.name,
                format!("dim {q_dim} not divisible by head_count {heads}"),
            ));
        }
        if k_dim % kv_heads != 0 || v_dim % kv_heads != 0 {
            return Err(BitNetError::shape(
                &attn_k.name,
                format!("k/v dims {k_dim}/{v_dim} not divisible by head_count_kv {kv_heads}"),
            ));
        }
        let head_dim = q_dim / heads;
        if k_dim / kv_heads != head_dim || v_dim / kv_heads != head_dim {
            return Err(BitNetError::shape(
                name("attn").as_str(),
                format!(
                    "head dims differ: q={head_dim} k={} v={}",
                    k_dim / kv_heads,
                    v_dim / kv_heads
                ),
            ));
        }
        let attn_sub_norm = optional_norm("attn_sub_norm", q_dim)?;

        let attn_output = LinearWeight::load(file, &name("attn_output"), q_dim)?;
        if attn_output.out_dim() != hidden {
            return Err(BitNetError::shape(
                &attn_output.name,
                format!("output dim {} want {hidden}", attn_output.out_dim()),
            ));
        }

        let ffn_gate = LinearWeight::load(file, &name("ffn_gate"), hidden)?;
        let ffn_up = LinearWeight::load(file, &name("ffn_up"), hidden)?;
        let ffn_dim = ffn_gate.out_dim();
        if ffn_up.out_dim() != ffn_dim {
            return Err(BitNetError::shape(
                &ffn_up.name,
                format!("output dim {} differs from gate {ffn_dim}", ffn_up.out_dim()),
            ));
        }
        let ffn_sub_norm = optional_norm("ffn_sub_norm", ffn_dim)?;
        let ffn_down = LinearWeight::load(file, &name("ffn_down"), ffn_dim)?;
        if ffn_down.out_dim() != hidden {
            return Err(BitNetError::shape(
                &ffn_down.name,
                format!("output dim {} want {hidden}", ffn_down.out_dim()),
            ));
        }

        Ok(Self {
            attn_norm,
            attn_sub_norm,
            ffn_norm,
            ffn_sub_norm,
            attn_q,
            attn_k,
            attn_v,
            attn_output,
            ffn_gate,
            ffn_up,
            ffn_down,
            head_dim,
        })
    }

    pub fn q_dim(&self) -> usize {
        self.attn_q.out_dim()
    }

    pub fn kv_dim(&self) -> usize {
        self.attn_k.out_dim()
    }

    pub fn ffn_dim(&self) -> usize {
        self.ffn_gate.out_dim()
    }
}

/// How a loaded model produces logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    /// Embedding, `blk.*` layers, output norm and projection.
    Transformer,
    /// No layers: logits are the output projection of the current token's embedding.
    EmbeddingOutput,
}

impl ModelMode {
    pub fn name(self) -> &'static str {
        match self {
            ModelMode::Transformer => "transformer",
            ModelMode::EmbeddingOutput => "embedding-output",
        }
    }
}

/// Immutable model weights.
#[derive(Debug, Clone)]
pub struct BitNetModel {
    pub config: ModelConfig,
    pub mode: ModelMode,
    pub hidden: usize,
    pub vocab: usize,
    pub token_embd: LinearWeight,
    /// Present in transformer mode.
    pub output_norm: Option<Vec<f32>>,
    /// `None` when the output projection is tied to `token_embd`.
    pub output: Option<LinearWeight>,
    pub layers: Vec<Layer>,
}

impl BitNetModel {
    pub fn load(file: &ModelFile, config: ModelConfig) -> Result<Self> {
        let gguf = file.gguf();
        if gguf.has_tensor("blk.0.attn_q.weight") {
            return Self::load_transformer(file, config);
        }
        match (gguf.has_tensor(TOKEN_EMBD), gguf.has_tensor(OUTPUT)) {
            (true, true) => Self::load_embedding_output(file, config),
            (true, false) => Err(BitNetError::MissingTensor(OUTPUT.to_string())),
            _ => Err(BitNetError::MissingTensor(TOKEN_EMBD.to_string())),
        }
    }

    fn load_embedding_output(file: &ModelFile, config: ModelConfig) -> Result<Self> {
        let token_embd = LinearWeight::load_embedding(file, TOKEN_EMBD)?;
        let (hidden, vocab) = (token_embd.rows, token_embd.cols);
        let output = LinearWeight::load(file, OUTPUT, hidden)?;
        if output.out_dim() != vocab {
            return Err(BitNetError::shape(
                OUTPUT,
                format!("dims [{}, {}] incompatible with embedding [{hidden}, {vocab}]", output.rows, output.cols),
            ));
        }
        Ok(Self {
            config,
            mode: ModelMode::EmbeddingOutput,
            hidden,
            vocab,
            token_embd,
            output_norm: None,
            output: Some(output),
            layers: Vec::new(),
        })
    }

    fn load_transformer(file: &ModelFile, config: ModelConfig) -> Result<Self> {
        let (heads, kv_heads) = (config.heads, config.kv_heads);
        if heads % kv_heads != 0 {
            return Err(BitNetError::shape(
                "attention",
                format!("head_count {heads} is not a multiple of head_count_kv {kv_heads}"),
            ));
        }
        let token_embd = LinearWeight::load_embedding(file, TOKEN_EMBD)?;
        let (hidden, vocab) = (token_embd.rows, token_embd.cols);
        let output_norm = load_norm(file, OUTPUT_NORM, hidden)?;

        let output = if config.tie_output || !file.gguf().has_tensor(OUTPUT) {
            None
        } else {
            let w = LinearWeight::load(file, OUTPUT, hidden)?;
            if w.out_dim() != vocab {
                return Err(BitNetError::shape(
                    OUTPUT,
                    format!("output dim {} want vocab {vocab}", w.out_dim()),
                ));
            }
            Some(w)
        };

        let mut layers = Vec::new();
        while file.gguf().has_tensor(&format!("blk.{}.attn_q.weight", layers.len())) {
            let idx = layers.len();
            layers.push(Layer::load(file, idx, hidden, heads, kv_heads)?);
            debug!(layer = idx, "layer loaded");
        }

        Ok(Self {
            config,
            mode: ModelMode::Transformer,
            hidden,
            vocab,
            token_embd,
            output_norm: Some(output_norm),
            output,
            layers,
        })
    }

    /// The projection that produces logits.
    pub fn output_weight(&self) -> &LinearWeight {
        self.output.as_ref().unwrap_or(&self.token_embd)
    }

    pub fn is_output_tied(&self) -> bool {
        self.output.is_none()
    }

    /// Writes the embedding of `token` into `dst`. Returns `false` for ids
    /// outside the vocabulary.
    pub fn embed(&self, dst: &mut [f32], token: i32) -> bool {
        usize::try_from(token).is_ok_and(|t| self.token_embd.column(dst, t))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Largest per-layer K/V step width.
    pub fn max_kv_dim(&self) -> usize {
        self.layers.iter().map(Layer::kv_dim).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::model::writer::{GgufWriter, WriterValue};

    fn file(w: &GgufWriter) -> ModelFile {
        ModelFile::from_bytes(w.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn orientation_follows_input_dim() {
        // [[1,2,3],[4,5,6]] column-major
        let mat = [1.0f32, 4.0, 2.0, 5.0, 3.0, 6.0];
        let mut w = GgufWriter::new();
        w.add_tensor_f32("w", &[2, 3], &mat);
        let f = file(&w);
        let ctx = KernelContext::new(KernelConfig::strict());

        let plain = LinearWeight::load(&f, "w", 3).unwrap();
        assert!(!plain.transposed);
        assert_eq!(plain.out_dim(), 2);
        let mut out = [0f32; 2];
        plain.apply(&ctx, &mut out, &[2.0, -1.0, 0.5]);
        assert_eq!(out, [1.5, 6.0]);

        let t = LinearWeight::load(&f, "w", 2).unwrap();
        assert!(t.transposed);
        let mut out_t = [0f32; 3];
        t.apply(&ctx, &mut out_t, &[1.0, 1.0]);
        assert_eq!(out_t, [5.0, 7.0, 9.0]);

        let err = LinearWeight::load(&f, "w", 5).unwrap_err();
        assert!(matches!(err, BitNetError::ShapeMismatch { .. }));
    }

    #[test]
    fn i2s_weight_stays_packed_and_matches_f32() {
        let t: Vec<i8> = (0..8 * 16).map(|i| (i % 3) as i8 - 1).collect();
        let dense: Vec<f32> = t.iter().map(|&v| v as f32 * 0.5).collect();
        let mut w = GgufWriter::new();
        w.add_tensor_i2s("q", &[8, 16], &t, 0.5)
            .add_tensor_f32("d", &[8, 16], &dense);
        let f = file(&w);
        let q = LinearWeight::load(&f, "q", 16).unwrap();
        assert!(matches!(q.data, WeightData::I2s { .. }));
        let d = LinearWeight::load(&f, "d", 16).unwrap();

        let ctx = KernelContext::new(KernelConfig {
            i2s_quantized_activations: false,
            threads: 1,
            ..KernelConfig::default()
        });
        let x: Vec<f32> = (0..16).map(|i| i as f32 * 0.1 - 0.8).collect();
        let mut a = [0f32; 8];
        let mut b = [0f32; 8];
        q.apply(&ctx, &mut a, &x);
        d.apply(&ctx, &mut b, &x);
        for (p, q) in a.iter().zip(&b) {
            assert!((p - q).abs() <= 1e-5 * 0.5 * 16.0);
        }

        let mut col = [0f32; 8];
        assert!(q.column(&mut col, 3));
        assert_eq!(col.to_vec(), dense[24..32].to_vec());
    }

    #[test]
    fn missing_tensors_are_reported() {
        let err = BitNetModel::load(&file(&GgufWriter::new()), ModelConfig::default()).unwrap_err();
        assert!(matches!(err, BitNetError::MissingTensor(ref n) if n == TOKEN_EMBD));

        let mut w = GgufWriter::new();
        w.add_tensor_f32(TOKEN_EMBD, &[2, 3], &[0.0; 6]);
        let err = BitNetModel::load(&file(&w), ModelConfig::default()).unwrap_err();
        assert!(matches!(err, BitNetError::MissingTensor(ref n) if n == OUTPUT));
    }

    #[test]
    fn embedding_output_mode() {
        let emb: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let mut w = GgufWriter::new();
        w.add_kv("general.architecture", WriterValue::String("toy".into()))
            .add_tensor_f16(TOKEN_EMBD, &[2, 3], &emb)
            .add_tensor_f32(OUTPUT, &[3, 2], &[1.0; 6]);
        let f = file(&w);
        let model = BitNetModel::load(&f, ModelConfig::from_metadata(f.gguf())).unwrap();
        assert_eq!(model.mode, ModelMode::EmbeddingOutput);
        assert_eq!((model.hidden, model.vocab), (2, 3));
        assert!(!model.output_weight().transposed);

        let mut e = [0f32; 2];
        assert!(model.embed(&mut e, 2));
        assert_eq!(e, [4.0, 5.0]);
        assert!(!model.embed(&mut e, 3));
        assert!(!model.embed(&mut e, -1));
    }

    #[test]
    fn rejects_bad_output_shape() {
        let mut w = GgufWriter::new();
        w.add_tensor_f32(TOKEN_EMBD, &[2, 3], &[0.0; 6])
            .add_tensor_f32(OUTPUT, &[2, 4], &[0.0; 8]);
        let err = BitNetModel::load(&file(&w), ModelConfig::default()).unwrap_err();
        assert!(matches!(err, BitNetError::ShapeMismatch { .. }));
    }
}

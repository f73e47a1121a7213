//! Deterministic demo models for tests, benches and smoke runs.
//!
//! `demo_model_bytes` writes a complete GGUF image: llama-style metadata, a
//! greedy-trie vocabulary and random weights drawn from a seeded `StdRng`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::bitnet::{OUTPUT, OUTPUT_NORM, TOKEN_EMBD};
use super::writer::{GgufWriter, WriterValue};
use crate::errors::Result;

/// Shape and storage choices for a generated model.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoModelSpec {
    pub architecture: String,
    pub hidden: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub layers: usize,
    pub ffn_dim: usize,
    pub vocab: usize,
    pub context_length: u32,
    /// 0 rotates the whole head.
    pub rope_dim: usize,
    pub rope_scale: f32,
    pub rope_scaling: String,
    /// I2_S projections instead of f32.
    pub ternary: bool,
    pub f16_embedding: bool,
    /// Write a separate `output.weight` instead of tying to the embedding.
    pub untied_output: bool,
    /// Magnitude of projection weights; small values keep the residual stream
    /// dominated by the token embedding.
    pub weight_scale: f32,
    /// Add `blk.N.attn_sub_norm` / `blk.N.ffn_sub_norm`.
    pub sub_norms: bool,
}

impl Default for DemoModelSpec {
    fn default() -> Self {
        Self {
            architecture: "llama".to_string(),
            hidden: 64,
            heads: 4,
            kv_heads: 2,
            layers: 2,
            ffn_dim: 128,
            vocab: 128,
            context_length: 256,
            rope_dim: 0,
            rope_scale: 1.0,
            rope_scaling: "linear".to_string(),
            ternary: true,
            f16_embedding: false,
            untied_output: false,
            weight_scale: 0.05,
            sub_norms: false,
        }
    }
}

impl DemoModelSpec {
    /// Two layers, hidden 4, two query heads sharing one KV head.
    pub fn toy() -> Self {
        Self {
            hidden: 4,
            heads: 2,
            kv_heads: 1,
            layers: 2,
            ffn_dim: 8,
            vocab: 8,
            rope_dim: 2,
            rope_scale: 2.0,
            ..Self::default()
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden / self.heads.max(1)
    }
}

/// `<unk>`, `<s>`, `</s>`, printable ASCII, then filler pieces, cut to `n`.
pub fn demo_vocab(n: usize) -> Vec<String> {
    let mut v: Vec<String> = ["<unk>", "<s>", "</s>"].iter().map(|s| s.to_string()).collect();
    v.extend((0x20u8..=0x7e).map(|b| (b as char).to_string()));
    let mut i = 0;
    while v.len() < n {
        v.push(format!("<tok{i}>"));
        i += 1;
    }
    v.truncate(n);
    v
}

fn uniform(rng: &mut StdRng, n: usize, scale: f32) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-scale..=scale)).collect()
}

fn near_one(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(0.95f32..=1.05)).collect()
}

/// Column `t` is a signed basis vector for the first `2·hidden` tokens and a
/// random unit vector after that, plus a small jitter.
fn embedding_table(rng: &mut StdRng, hidden: usize, vocab: usize) -> Vec<f32> {
    let mut out = vec![0f32; hidden * vocab];
    for t in 0..vocab {
        let col = &mut out[hidden * t..hidden * (t + 1)];
        if t < 2 * hidden {
            col[t / 2] = if t % 2 == 0 { 1.0 } else { -1.0 };
        } else {
            let v = uniform(rng, hidden, 1.0);
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
            for (c, x) in col.iter_mut().zip(v) {
                *c = x / norm;
            }
        }
        for c in col.iter_mut() {
            *c += rng.gen_range(-0.05f32..=0.05);
        }
    }
    out
}

fn add_projection(
    w: &mut GgufWriter,
    rng: &mut StdRng,
    spec: &DemoModelSpec,
    name: String,
    in_dim: usize,
    out_dim: usize,
) {
    let dims = [in_dim as u64, out_dim as u64];
    let n = in_dim * out_dim;
    if spec.ternary {
        let t: Vec<i8> = (0..n).map(|_| rng.gen_range(-1i8..=1)).collect();
        w.add_tensor_i2s(name, &dims, &t, spec.weight_scale);
    } else {
        let v = uniform(rng, n, spec.weight_scale);
        w.add_tensor_f32(name, &dims, &v);
    }
}

/// Builds the GGUF writer for `spec`; the same seed yields the same bytes.
pub fn demo_model_writer(seed: u64, spec: &DemoModelSpec) -> GgufWriter {
    let mut rng = StdRng::seed_from_u64(seed);
    let prefix = if spec.architecture == "llama" {
        "llama"
    } else {
        "bitnet-b1.58"
    };
    let head_dim = spec.head_dim();
    let q_dim = head_dim * spec.heads;
    let kv_dim = head_dim * spec.kv_heads;

    let mut w = GgufWriter::new();
    w.add_kv("general.architecture", WriterValue::String(spec.architecture.clone()))
        .add_kv("general.name", WriterValue::String("bitnet-demo".into()))
        .add_kv(format!("{prefix}.context_length"), WriterValue::UInt32(spec.context_length))
        .add_kv(format!("{prefix}.embedding_length"), WriterValue::UInt32(spec.hidden as u32))
        .add_kv(format!("{prefix}.block_count"), WriterValue::UInt32(spec.layers as u32))
        .add_kv(format!("{prefix}.attention.head_count"), WriterValue::UInt32(spec.heads as u32))
        .add_kv(
            format!("{prefix}.attention.head_count_kv"),
            WriterValue::UInt32(spec.kv_heads as u32),
        )
        .add_kv(
            format!("{prefix}.attention.layer_norm_rms_epsilon"),
            WriterValue::Float32(1e-5),
        )
        .add_kv(format!("{prefix}.rope.freq_base"), WriterValue::Float32(10_000.0))
        .add_kv(format!("{prefix}.rope.scaling.factor"), WriterValue::Float32(spec.rope_scale))
        .add_kv("llama.rope.scaling.type", WriterValue::String(spec.rope_scaling.clone()))
        .add_kv("tokenizer.ggml.tokens", WriterValue::StringArray(demo_vocab(spec.vocab)))
        .add_kv("tokenizer.ggml.bos_token_id", WriterValue::UInt32(1))
        .add_kv("tokenizer.ggml.eos_token_id", WriterValue::UInt32(2))
        .add_kv("tokenizer.ggml.unknown_token_id", WriterValue::UInt32(0))
        .add_kv("tokenizer.ggml.add_bos_token", WriterValue::Bool(true));
    if spec.rope_dim > 0 {
        w.add_kv(
            format!("{prefix}.rope.dimension_count"),
            WriterValue::UInt32(spec.rope_dim as u32),
        );
    }

    let embd = embedding_table(&mut rng, spec.hidden, spec.vocab);
    let embd_dims = [spec.hidden as u64, spec.vocab as u64];
    if spec.f16_embedding {
        w.add_tensor_f16(TOKEN_EMBD, &embd_dims, &embd);
    } else {
        w.add_tensor_f32(TOKEN_EMBD, &embd_dims, &embd);
    }
    w.add_tensor_f32(OUTPUT_NORM, &[spec.hidden as u64], &vec![1.0; spec.hidden]);
    if spec.untied_output {
        let out = uniform(&mut rng, spec.hidden * spec.vocab, 1.0);
        w.add_tensor_f32(OUTPUT, &embd_dims, &out);
    }

    for i in 0..spec.layers {
        let name = |t: &str| format!("blk.{i}.{t}.weight");
        let attn_norm = near_one(&mut rng, spec.hidden);
        let ffn_norm = near_one(&mut rng, spec.hidden);
        w.add_tensor_f32(name("attn_norm"), &[spec.hidden as u64], &attn_norm)
            .add_tensor_f32(name("ffn_norm"), &[spec.hidden as u64], &ffn_norm);
        add_projection(&mut w, &mut rng, spec, name("attn_q"), spec.hidden, q_dim);
        add_projection(&mut w, &mut rng, spec, name("attn_k"), spec.hidden, kv_dim);
        add_projection(&mut w, &mut rng, spec, name("attn_v"), spec.hidden, kv_dim);
        add_projection(&mut w, &mut rng, spec, name("attn_output"), q_dim, spec.hidden);
        add_projection(&mut w, &mut rng, spec, name("ffn_gate"), spec.hidden, spec.ffn_dim);
        add_projection(&mut w, &mut rng, spec, name("ffn_up"), spec.hidden, spec.ffn_dim);
        add_projection(&mut w, &mut rng, spec, name("ffn_down"), spec.ffn_dim, spec.hidden);
        if spec.sub_norms {
            let a = near_one(&mut rng, q_dim);
            let f = near_one(&mut rng, spec.ffn_dim);
            w.add_tensor_f32(name("attn_sub_norm"), &[q_dim as u64], &a)
                .add_tensor_f32(name("ffn_sub_norm"), &[spec.ffn_dim as u64], &f);
        }
    }
    w
}

/// Serialized demo model.
pub fn demo_model_bytes(seed: u64, spec: &DemoModelSpec) -> Result<Vec<u8>> {
    demo_model_writer(seed, spec).to_bytes()
}

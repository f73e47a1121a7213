//! Inference engine: one forward step per token through the loaded model.

use tracing::trace;

use super::attention::causal_attention;
use super::cache::KvCache;
use super::rope::Rope;
use crate::errors::{BitNetError, Result};
use crate::kernels::dense::add_scaled;
use crate::kernels::norm::{mul_relu2, mul_silu};
use crate::kernels::KernelContext;
use crate::model::{BitNetModel, FfnActivation, Layer, ModelMode};

/// Per-request scratch: hidden state, layer buffers, logits and the KV cache.
///
/// Sized once for the widest layer; each step slices what it needs.
#[derive(Debug)]
pub struct ForwardState {
    x: Vec<f32>,
    n1: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    attn: Vec<f32>,
    attn_norm: Vec<f32>,
    attn_out: Vec<f32>,
    gate: Vec<f32>,
    up: Vec<f32>,
    act: Vec<f32>,
    act_norm: Vec<f32>,
    down: Vec<f32>,
    scores: Vec<f32>,
    angles: Vec<(f32, f32)>,
    logits: Vec<f32>,
    cache: KvCache,
}

impl ForwardState {
    /// Logits of the last step that computed them.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Hidden state after the last step.
    pub fn hidden(&self) -> &[f32] {
        &self.x
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    pub fn max_seq(&self) -> usize {
        self.cache.max_seq()
    }
}

/// Engine that owns the model weights and the kernel context.
#[derive(Debug)]
pub struct InferenceEngine {
    model: BitNetModel,
    ctx: KernelContext,
    ropes: Vec<Rope>,
}

impl InferenceEngine {
    pub fn new(model: BitNetModel, ctx: KernelContext) -> Self {
        let ropes = model
            .layers
            .iter()
            .map(|l| Rope::new(&model.config.rope, l.head_dim))
            .collect();
        Self { model, ctx, ropes }
    }

    pub fn model(&self) -> &BitNetModel {
        &self.model
    }

    pub fn kernels(&self) -> &KernelContext {
        &self.ctx
    }

    pub fn vocab_size(&self) -> usize {
        self.model.vocab
    }

    /// Allocates scratch and a KV cache for `max_seq` positions.
    pub fn new_state(&self, max_seq: usize) -> ForwardState {
        let hidden = self.model.hidden;
        let layers = &self.model.layers;
        let widest = |f: fn(&Layer) -> usize| layers.iter().map(f).max().unwrap_or(0);
        let (q_dim, kv_dim, ffn_dim) = (widest(Layer::q_dim), widest(Layer::kv_dim), widest(Layer::ffn_dim));
        let max_seq = max_seq.max(1);
        let cache = KvCache::new(
            layers.iter().map(|l| (l.kv_dim() / l.head_dim.max(1), l.head_dim)),
            if layers.is_empty() { 1 } else { max_seq },
        );
        ForwardState {
            x: vec![0.0; hidden],
            n1: vec![0.0; hidden],
            q: vec![0.0; q_dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            attn: vec![0.0; q_dim],
            attn_norm: vec![0.0; q_dim],
            attn_out: vec![0.0; hidden],
            gate: vec![0.0; ffn_dim],
            up: vec![0.0; ffn_dim],
            act: vec![0.0; ffn_dim],
            act_norm: vec![0.0; ffn_dim],
            down: vec![0.0; hidden],
            scores: vec![0.0; max_seq],
            angles: Vec::new(),
            logits: vec![0.0; self.model.vocab],
            cache,
        }
    }

    /// Runs `token` at position `pos`. Logits are written only when
    /// `compute_logits` is set; prefill steps skip the output projection.
    pub fn forward(
        &self,
        st: &mut ForwardState,
        token: i32,
        pos: usize,
        compute_logits: bool,
    ) -> Result<()> {
        match self.model.mode {
            ModelMode::EmbeddingOutput => {
                if !compute_logits {
                    return Ok(());
                }
                self.embed(st, token);
                self.model.output_weight().apply(&self.ctx, &mut st.logits, &st.x);
            }
            ModelMode::Transformer => {
                if pos >= st.cache.max_seq() {
                    return Err(BitNetError::InvalidRequest(format!(
                        "position {pos} exceeds sequence capacity {}",
                        st.cache.max_seq()
                    )));
                }
                self.embed(st, token);
                for idx in 0..self.model.layers.len() {
                    self.layer_step(st, idx, pos)?;
                }
                if compute_logits {
                    if let Some(norm) = &self.model.output_norm {
                        self.ctx.rms_norm(&mut st.n1, &st.x, norm, self.model.config.rms_eps);
                    } else {
                        st.n1.copy_from_slice(&st.x);
                    }
                    self.model.output_weight().apply(&self.ctx, &mut st.logits, &st.n1);
                }
            }
        }
        trace!(token, pos, compute_logits, "forward step");
        Ok(())
    }

    fn embed(&self, st: &mut ForwardState, token: i32) {
        if !self.model.embed(&mut st.x, token) {
            trace!(token, vocab = self.model.vocab, "token outside embedding table, synthesizing");
            fill_token_vector(&mut st.x, token);
        }
    }

    fn layer_step(&self, st: &mut ForwardState, idx: usize, pos: usize) -> Result<()> {
        let layer = &self.model.layers[idx];
        let ctx = &self.ctx;
        let eps = self.model.config.rms_eps;
        let head_dim = layer.head_dim;
        let (q_dim, kv_dim, ffn_dim) = (layer.q_dim(), layer.kv_dim(), layer.ffn_dim());
        let (heads, kv_heads) = (q_dim / head_dim, kv_dim / head_dim);

        ctx.rms_norm(&mut st.n1, &st.x, &layer.attn_norm, eps);
        let (q, k, v) = (&mut st.q[..q_dim], &mut st.k[..kv_dim], &mut st.v[..kv_dim]);
        layer.attn_q.apply(ctx, q, &st.n1);
        layer.attn_k.apply(ctx, k, &st.n1);
        layer.attn_v.apply(ctx, v, &st.n1);

        let rope = &self.ropes[idx];
        rope.angles(pos, &mut st.angles);
        rope.rotate(q, heads, &st.angles);
        rope.rotate(k, kv_heads, &st.angles);

        let cache = st.cache.layer_mut(idx);
        cache.store(pos, k, v)?;
        let attn = &mut st.attn[..q_dim];
        causal_attention(ctx, attn, &mut st.scores, q, cache, pos + 1, heads);

        let attn_in: &[f32] = match &layer.attn_sub_norm {
            Some(w) => {
                ctx.rms_norm(&mut st.attn_norm[..q_dim], attn, w, eps);
                &st.attn_norm[..q_dim]
            }
            None => &*attn,
        };
        layer.attn_output.apply(ctx, &mut st.attn_out, attn_in);
        add_scaled(&mut st.x, &st.attn_out, 1.0);

        ctx.rms_norm(&mut st.n1, &st.x, &layer.ffn_norm, eps);
        let (gate, up, act) = (
            &mut st.gate[..ffn_dim],
            &mut st.up[..ffn_dim],
            &mut st.act[..ffn_dim],
        );
        layer.ffn_gate.apply(ctx, gate, &st.n1);
        layer.ffn_up.apply(ctx, up, &st.n1);
        match self.model.config.activation {
            FfnActivation::Silu => mul_silu(act, gate, up),
            FfnActivation::Relu2 => mul_relu2(act, gate, up),
        }
        let down_in: &[f32] = match &layer.ffn_sub_norm {
            Some(w) => {
                ctx.rms_norm(&mut st.act_norm[..ffn_dim], act, w, eps);
                &st.act_norm[..ffn_dim]
            }
            None => &*act,
        };
        layer.ffn_down.apply(ctx, &mut st.down, down_in);
        add_scaled(&mut st.x, &st.down, 1.0);
        Ok(())
    }
}

/// Deterministic stand-in hidden state for ids past the embedding table:
/// xorshift32 seeded with `token + 0x9e3779b9`, low 16 bits mapped to [-1, 1).
fn fill_token_vector(dst: &mut [f32], token: i32) {
    let mut x = (token as u32).wrapping_add(0x9e37_79b9);
    for v in dst.iter_mut() {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *v = ((x & 0xffff) as i32 - 32768) as f32 / 32768.0;
    }
}

/// Start token when the prompt is empty: `seed mod vocab`, non-negative.
pub fn seed_token(seed: i64, vocab: usize) -> i32 {
    if vocab == 0 {
        return seed as i32;
    }
    seed.rem_euclid(vocab as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::model::demo::{demo_model_bytes, DemoModelSpec};
    use crate::model::{ModelConfig, ModelFile};

    fn engine(spec: &DemoModelSpec, kernels: KernelConfig) -> InferenceEngine {
        let file = ModelFile::from_bytes(demo_model_bytes(3, spec).unwrap()).unwrap();
        let cfg = ModelConfig::from_metadata(file.gguf());
        let model = BitNetModel::load(&file, cfg).unwrap();
        InferenceEngine::new(model, KernelContext::new(kernels))
    }

    fn serial() -> KernelConfig {
        KernelConfig {
            threads: 1,
            ..KernelConfig::default()
        }
    }

    #[test]
    fn logits_are_finite_and_sized() {
        let spec = DemoModelSpec::default();
        let e = engine(&spec, serial());
        let mut st = e.new_state(4);
        for (pos, tok) in [1, 40, 41].into_iter().enumerate() {
            e.forward(&mut st, tok, pos, true).unwrap();
        }
        assert_eq!(st.logits().len(), spec.vocab);
        assert!(st.logits().iter().all(|l| l.is_finite()));
    }

    #[test]
    fn prefill_without_logits_matches_full_steps() {
        let e = engine(&DemoModelSpec::toy(), serial());
        let mut a = e.new_state(3);
        let mut b = e.new_state(3);
        e.forward(&mut a, 1, 0, false).unwrap();
        e.forward(&mut a, 2, 1, true).unwrap();
        e.forward(&mut b, 1, 0, true).unwrap();
        e.forward(&mut b, 2, 1, true).unwrap();
        assert_eq!(a.logits(), b.logits());
    }

    #[test]
    fn position_past_capacity_is_rejected() {
        let e = engine(&DemoModelSpec::toy(), serial());
        let mut st = e.new_state(1);
        e.forward(&mut st, 1, 0, true).unwrap();
        assert!(matches!(
            e.forward(&mut st, 1, 1, true),
            Err(BitNetError::InvalidRequest(_))
        ));
    }

    #[test]
    fn tokens_past_the_embedding_table_are_synthesized() {
        let e = engine(&DemoModelSpec::toy(), serial());
        let run = |tok: i32| {
            let mut st = e.new_state(1);
            e.forward(&mut st, tok, 0, true).unwrap();
            st.logits().to_vec()
        };
        let a = run(99);
        assert!(a.iter().all(|l| l.is_finite()));
        assert_eq!(a, run(99));
        assert_ne!(a, run(100));
        assert!(run(-3).iter().all(|l| l.is_finite()));
    }

    #[test]
    fn token_vector_is_deterministic_and_bounded() {
        let (mut a, mut b) = (vec![0f32; 64], vec![0f32; 64]);
        fill_token_vector(&mut a, 7);
        fill_token_vector(&mut b, 7);
        assert_eq!(a, b);
        assert!(a.iter().all(|v| (-1.0..1.0).contains(v)));
        fill_token_vector(&mut b, 8);
        assert_ne!(a, b);
    }

    #[test]
    fn strict_and_default_kernels_agree() {
        let spec = DemoModelSpec::default();
        let fast = engine(&spec, serial());
        let strict = engine(&spec, KernelConfig::strict());
        let (mut a, mut b) = (fast.new_state(2), strict.new_state(2));
        for (pos, tok) in [5, 9].into_iter().enumerate() {
            fast.forward(&mut a, tok, pos, true).unwrap();
            strict.forward(&mut b, tok, pos, true).unwrap();
        }
        for (x, y) in a.logits().iter().zip(b.logits()) {
            assert!((x - y).abs() <= 1e-3 + 1e-3 * y.abs(), "{x} vs {y}");
        }
    }

    #[test]
    fn seed_token_wraps() {
        assert_eq!(seed_token(10, 8), 2);
        assert_eq!(seed_token(-1, 8), 7);
        assert_eq!(seed_token(3, 0), 3);
    }
}

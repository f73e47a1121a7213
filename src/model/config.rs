//! Model hyperparameters read from container metadata.

use super::gguf::GgufFile;

/// Key prefixes tried in order for transformer hyperparameters.
const ARCH_PREFIXES: [&str; 2] = ["llama", "bitnet-b1.58"];

/// Architectures that pair rotary dimensions NeoX-style and tie the output
/// projection to the token embedding.
const BITNET_ARCHS: [&str; 3] = ["bitnet", "bitnet-b1.58", "bitnet-25"];

/// How positions are scaled before the rotary embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RopeScaling {
    /// `pos / scale`; also used when the scaling type is unset.
    #[default]
    Linear,
    Yarn,
}

impl RopeScaling {
    pub fn parse(s: &str) -> Self {
        match s {
            "yarn" => RopeScaling::Yarn,
            _ => RopeScaling::Linear,
        }
    }
}

/// Rotary embedding settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    pub freq_base: f32,
    pub scale: f32,
    pub scaling: RopeScaling,
    /// Rotated sub-dimension per head; 0 means the whole head.
    pub dim: usize,
    /// Pair `(i, i + dim/2)` instead of `(i, i + 1)`.
    pub neox: bool,
    pub beta_fast: f32,
    pub beta_slow: f32,
    pub original_context: f32,
    pub ext_factor: f32,
    pub attn_factor: f32,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            freq_base: 10_000.0,
            scale: 1.0,
            scaling: RopeScaling::Linear,
            dim: 0,
            neox: false,
            beta_fast: 0.0,
            beta_slow: 0.0,
            original_context: 0.0,
            ext_factor: 0.0,
            attn_factor: 1.0,
        }
    }
}

/// Gated FFN activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfnActivation {
    Silu,
    /// `max(g, 0)² · up`
    Relu2,
}

/// Hyperparameters of a decoder-only model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub architecture: String,
    pub context_length: u32,
    /// Declared vocabulary size; 0 when the container does not say.
    pub vocab_size: u32,
    pub rms_eps: f32,
    pub heads: usize,
    pub kv_heads: usize,
    pub rope: RopeConfig,
    pub activation: FfnActivation,
    /// Reuse `token_embd` as the output projection even when `output.weight` exists.
    pub tie_output: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: String::new(),
            context_length: 0,
            vocab_size: 0,
            rms_eps: 1e-5,
            heads: 1,
            kv_heads: 1,
            rope: RopeConfig::default(),
            activation: FfnActivation::Relu2,
            tie_output: false,
        }
    }
}

fn arch_keys(suffix: &str) -> Vec<String> {
    ARCH_PREFIXES
        .iter()
        .map(|p| format!("{p}.{suffix}"))
        .collect()
}

fn first_u32(gguf: &GgufFile, keys: &[String]) -> Option<u32> {
    let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
    gguf.first_u32(&keys)
}

fn first_f32(gguf: &GgufFile, keys: &[String]) -> Option<f32> {
    let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
    gguf.first_f32(&keys)
}

impl ModelConfig {
    pub fn from_metadata(gguf: &GgufFile) -> Self {
        let architecture = gguf.architecture().to_string();
        let bitnet = BITNET_ARCHS.contains(&architecture.as_str());

        let context_length = gguf
            .first_u32(&[
                "llama.context_length",
                "bitnet-b1.58.context_length",
                "falcon.context_length",
                "gpt2.context_length",
            ])
            .unwrap_or(0);
        let vocab_size = gguf
            .first_u32(&[
                "llama.vocab_size",
                "bitnet-b1.58.vocab_size",
                "gpt2.vocab_size",
                "tokenizer.ggml.tokens_count",
                "tokenizer.ggml.tokens.count",
            ])
            .unwrap_or(0);

        let heads = first_u32(gguf, &arch_keys("attention.head_count"))
            .filter(|&h| h > 0)
            .unwrap_or(1) as usize;
        let kv_heads = first_u32(gguf, &arch_keys("attention.head_count_kv"))
            .filter(|&h| h > 0)
            .map_or(heads, |h| h as usize);
        let rms_eps =
            first_f32(gguf, &arch_keys("attention.layer_norm_rms_epsilon")).unwrap_or(1e-5);

        let defaults = RopeConfig::default();
        let positive = |v: Option<f32>, fallback: f32| v.filter(|&x| x > 0.0).unwrap_or(fallback);
        let rope = RopeConfig {
            freq_base: positive(first_f32(gguf, &arch_keys("rope.freq_base")), defaults.freq_base),
            scale: positive(first_f32(gguf, &arch_keys("rope.scaling.factor")), defaults.scale),
            scaling: RopeScaling::parse(
                gguf.first_str(&["llama.rope.scaling.type", "llama.rope.scaling_type"])
                    .unwrap_or(""),
            ),
            dim: first_u32(gguf, &arch_keys("rope.dimension_count")).unwrap_or(0) as usize,
            neox: bitnet,
            beta_fast: first_f32(gguf, &arch_keys("rope.scaling.beta_fast")).unwrap_or(0.0),
            beta_slow: first_f32(gguf, &arch_keys("rope.scaling.beta_slow")).unwrap_or(0.0),
            original_context: first_f32(gguf, &arch_keys("rope.scaling.original_context_length"))
                .unwrap_or(0.0),
            ext_factor: first_f32(gguf, &arch_keys("rope.scaling.ext_factor")).unwrap_or(0.0),
            attn_factor: first_f32(gguf, &arch_keys("rope.scaling.attn_factor"))
                .filter(|&f| f != 0.0)
                .unwrap_or(defaults.attn_factor),
        };

        let activation = if architecture == "llama" {
            FfnActivation::Silu
        } else {
            FfnActivation::Relu2
        };

        Self {
            architecture,
            context_length,
            vocab_size,
            rms_eps,
            heads,
            kv_heads,
            rope,
            activation,
            tie_output: bitnet,
        }
    }
}

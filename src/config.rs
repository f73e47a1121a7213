//! Runtime configuration: kernel selection, cache sizes, loading options.
//!
//! Every field has a default; `from_env` overlays `BITNET_*` variables and
//! `from_json_str` / `from_json_file` accept a partial JSON document.

use crate::errors::{BitNetError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How the unused I2_S code 3 is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code3Mode {
    /// Reference semantics: code 3 decodes to 0.
    #[default]
    Zero,
    /// Compatibility variant: code 3 decodes to +1.
    PlusOne,
}

/// Kernel selection switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Run the scalar reference kernels end to end, single-threaded.
    pub strict_parity: bool,
    /// Accumulate dot products and RMS norms in f32 like ggml.
    pub match_ggml: bool,
    pub i2s_code3: Code3Mode,
    /// Quantize activations to i8 before ternary matvecs.
    pub i2s_quantized_activations: bool,
    /// Worker threads for the parallel kernels; 0 means one per logical CPU.
    pub threads: usize,
    /// Matrices with fewer elements than this run on the calling thread.
    pub parallel_min_elements: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            strict_parity: false,
            match_ggml: false,
            i2s_code3: Code3Mode::Zero,
            i2s_quantized_activations: true,
            threads: 0,
            parallel_min_elements: 1 << 16,
        }
    }
}

impl KernelConfig {
    /// Reference kernels only.
    pub fn strict() -> Self {
        Self {
            strict_parity: true,
            ..Self::default()
        }
    }

    /// Worker count after resolving 0 to the host's logical CPU count.
    pub fn worker_count(&self) -> usize {
        if self.strict_parity {
            return 1;
        }
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Whether a matrix of `elements` should use the parallel kernels.
    pub fn use_parallel(&self, elements: usize) -> bool {
        !self.strict_parity && self.worker_count() > 1 && elements >= self.parallel_min_elements
    }
}

/// Tokenizer memoization sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    pub bpe_cache_size: usize,
    pub spm_cache_size: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            bpe_cache_size: 256,
            spm_cache_size: 256,
        }
    }
}

/// Top-level configuration for `load_model_with_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub kernels: KernelConfig,
    pub tokenizer: TokenizerConfig,
    /// Memoized prompt→token entries; 0 disables the cache.
    pub prompt_cache_size: usize,
    /// Memoized token→text entries; 0 disables the cache.
    pub decode_cache_size: usize,
    /// Longest token sequence eligible for the decode cache.
    pub decode_cache_max_tokens: usize,
    /// Entries recorded per top-K step; 0 disables capture.
    pub topk: usize,
    /// Memory-map the container on unix hosts.
    pub use_mmap: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kernels: KernelConfig::default(),
            tokenizer: TokenizerConfig::default(),
            prompt_cache_size: 128,
            decode_cache_size: 256,
            decode_cache_max_tokens: 64,
            topk: 5,
            use_mmap: true,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `BITNET_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg
    }

    /// Parse a (possibly partial) JSON document; missing fields keep defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| BitNetError::InvalidRequest(format!("runtime config: {e}")))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |key: &str| lookup(key).map(|v| v != "0" && !v.is_empty());
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());

        if let Some(v) = flag("BITNET_PARITY_STRICT") {
            self.kernels.strict_parity = v;
        }
        if let Some(v) = flag("BITNET_MATCH_GGML") {
            self.kernels.match_ggml = v;
        }
        if let Some(true) = flag("BITNET_I2S_MAP3_TO1") {
            self.kernels.i2s_code3 = Code3Mode::PlusOne;
        }
        if let Some(v) = flag("BITNET_I2S_F32") {
            self.kernels.i2s_quantized_activations = !v;
        }
        if let Some(n) = number("BITNET_THREADS") {
            self.kernels.threads = n;
        }
        if let Some(n) = number("BITNET_PROMPT_CACHE_CAP") {
            self.prompt_cache_size = n;
        }
        if let Some(n) = number("BITNET_DECODE_CACHE_CAP") {
            self.decode_cache_size = n;
        }
        if let Some(true) = flag("BITNET_DISABLE_TOPK") {
            self.topk = 0;
        }
        if let Some(false) = flag("BITNET_MMAP") {
            self.use_mmap = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.topk, 5);
        assert_eq!(cfg.prompt_cache_size, 128);
        assert_eq!(cfg.tokenizer.bpe_cache_size, 256);
        assert_eq!(cfg.kernels.i2s_code3, Code3Mode::Zero);
        assert!(!cfg.kernels.strict_parity);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = RuntimeConfig::from_json_str(
            r#"{"kernels": {"strict_parity": true, "i2s_code3": "plus_one"}, "topk": 3}"#,
        )
        .unwrap();
        assert!(cfg.kernels.strict_parity);
        assert_eq!(cfg.kernels.i2s_code3, Code3Mode::PlusOne);
        assert_eq!(cfg.topk, 3);
        assert_eq!(cfg.decode_cache_size, 256);
    }

    #[test]
    fn bad_json_is_invalid_request() {
        let err = RuntimeConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, BitNetError::InvalidRequest(_)));
    }

    #[test]
    fn env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("BITNET_PARITY_STRICT", "1"),
            ("BITNET_THREADS", "3"),
            ("BITNET_DISABLE_TOPK", "1"),
            ("BITNET_I2S_MAP3_TO1", "1"),
        ]
        .into_iter()
        .collect();
        let mut cfg = RuntimeConfig::default();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert!(cfg.kernels.strict_parity);
        assert_eq!(cfg.kernels.threads, 3);
        assert_eq!(cfg.topk, 0);
        assert_eq!(cfg.kernels.i2s_code3, Code3Mode::PlusOne);
        assert_eq!(cfg.kernels.worker_count(), 1);
    }
}

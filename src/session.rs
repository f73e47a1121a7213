//! Load-once, generate-many facade over the model, tokenizer and engine.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::errors::{BitNetError, Result};
use crate::inference::{CancelHandle, GenerationParams, InferenceEngine, TextGenerator, TopKStep};
use crate::kernels::KernelContext;
use crate::model::{BitNetModel, ModelConfig, ModelFile};
use crate::tokenizer::Tokenizer;

/// One generation call.
///
/// `temp`, `top_p` and `top_k` are accepted for sampler extensions; decoding is
/// always argmax.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateRequest {
    pub prompt: String,
    pub seed: i64,
    pub max_tokens: i64,
    pub temp: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub disable_topk_capture: bool,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: i64) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    pub token_ids: Vec<i32>,
    /// The prompt followed by the decoded tokens.
    pub text: String,
    pub topk_steps: Vec<TopKStep>,
}

/// Container-level facts about a loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
    pub architecture: String,
    pub context_length: u32,
    pub vocab_size: u32,
}

/// Insertion-ordered memo with a fixed capacity; the oldest entry goes first.
#[derive(Debug)]
struct FifoCache<K, V> {
    map: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V: Clone> FifoCache<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 || self.map.contains_key(&key) {
            return;
        }
        while self.order.len() >= self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.map.remove(&old);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, value);
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// A loaded model ready to serve [`GenerateRequest`]s.
///
/// Immutable after load apart from its memo caches; every call allocates its
/// own scratch and KV cache, so a `Session` can be shared across threads.
#[derive(Debug)]
pub struct Session {
    info: ModelInfo,
    config: RuntimeConfig,
    engine: InferenceEngine,
    tokenizer: Option<Tokenizer>,
    prompt_cache: Mutex<FifoCache<String, Vec<i32>>>,
    decode_cache: Mutex<FifoCache<Vec<i32>, String>>,
}

/// Loads `path` with [`RuntimeConfig::from_env`].
pub fn load_model(path: impl AsRef<Path>) -> Result<Session> {
    load_model_with_config(path, RuntimeConfig::from_env())
}

pub fn load_model_with_config(path: impl AsRef<Path>, config: RuntimeConfig) -> Result<Session> {
    let file = ModelFile::open(path.as_ref(), config.use_mmap)?;
    Session::from_file(file, config)
}

impl Session {
    /// Builds a session from an already opened container.
    pub fn from_file(file: ModelFile, config: RuntimeConfig) -> Result<Self> {
        let started = Instant::now();
        let gguf = file.gguf();
        let model_config = ModelConfig::from_metadata(gguf);

        let tokenizer = match Tokenizer::from_metadata(gguf, &config.tokenizer) {
            Ok(t) => {
                debug!(kind = ?t.kind(), vocab = t.vocab_size(), "tokenizer ready");
                Some(t)
            }
            Err(e) => {
                warn!(error = %e, "model has no usable tokenizer; prompts tokenize to nothing");
                None
            }
        };

        let info = ModelInfo {
            path: file.path().to_path_buf(),
            version: gguf.header.version,
            tensor_count: gguf.header.tensor_count,
            kv_count: gguf.header.kv_count,
            architecture: model_config.architecture.clone(),
            context_length: model_config.context_length,
            vocab_size: model_config.vocab_size,
        };

        let model = BitNetModel::load(&file, model_config)?;
        info!(
            path = %info.path.display(),
            architecture = %info.architecture,
            mode = model.mode.name(),
            layers = model.num_layers(),
            hidden = model.hidden,
            vocab = model.vocab,
            heads = model.config.heads,
            kv_heads = model.config.kv_heads,
            rope_base = model.config.rope.freq_base,
            rope_scaling = ?model.config.rope.scaling,
            tied_output = model.is_output_tied(),
            mmap = file.is_mapped(),
            ms = started.elapsed().as_secs_f64() * 1000.0,
            "model loaded"
        );

        let engine = InferenceEngine::new(model, KernelContext::new(config.kernels.clone()));
        Ok(Self {
            info,
            prompt_cache: Mutex::new(FifoCache::new(config.prompt_cache_size)),
            decode_cache: Mutex::new(FifoCache::new(config.decode_cache_size)),
            config,
            engine,
            tokenizer,
        })
    }

    pub fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    pub fn tokenizer(&self) -> Option<&Tokenizer> {
        self.tokenizer.as_ref()
    }

    pub fn generate(&self, req: &GenerateRequest) -> Result<GenerateResult> {
        self.run(req, None)
    }

    /// Like [`Session::generate`], but stops at the next token boundary once
    /// `cancel` fires and returns [`BitNetError::Cancelled`] with the partial result.
    pub fn generate_with_cancel(&self, req: &GenerateRequest, cancel: &CancelHandle) -> Result<GenerateResult> {
        self.run(req, Some(cancel))
    }

    fn run(&self, req: &GenerateRequest, cancel: Option<&CancelHandle>) -> Result<GenerateResult> {
        let max_tokens = usize::try_from(req.max_tokens).map_err(|_| {
            BitNetError::InvalidRequest(format!("max_tokens must be >= 0, got {}", req.max_tokens))
        })?;
        if max_tokens == 0 {
            return Ok(GenerateResult::default());
        }

        let prompt = self.prompt_tokens(&req.prompt);
        if prompt.len().checked_add(max_tokens).is_none() {
            return Err(BitNetError::InvalidRequest(format!("max_tokens {max_tokens} too large")));
        }
        let params = GenerationParams {
            max_tokens,
            seed: req.seed,
            topk: if req.disable_topk_capture { 0 } else { self.config.topk },
        };
        let out = match TextGenerator::new(&self.engine).generate(&prompt, params, cancel) {
            Ok(out) => out,
            Err(BitNetError::Interrupted { source, mut partial }) => {
                partial.text = format!("{}{}", req.prompt, self.decode_cached(&partial.token_ids));
                return Err(BitNetError::Interrupted { source, partial });
            }
            Err(e) => return Err(e),
        };

        let text = format!("{}{}", req.prompt, self.decode_cached(&out.tokens));
        let result = GenerateResult {
            token_ids: out.tokens,
            text,
            topk_steps: out.topk_steps,
        };
        if out.cancelled {
            return Err(BitNetError::Cancelled {
                partial: Box::new(result),
            });
        }
        Ok(result)
    }

    /// Token ids for `text`, BOS included when the model asks for it.
    pub fn tokenize(&self, text: &str) -> Result<Vec<i32>> {
        match &self.tokenizer {
            Some(t) => Ok(t.tokenize(text)),
            None => Err(BitNetError::Tokenizer("model carries no tokenizer".to_string())),
        }
    }

    /// Text for `ids`; empty when the model has no tokenizer.
    pub fn decode(&self, ids: &[i32]) -> String {
        self.tokenizer.as_ref().map(|t| t.decode(ids)).unwrap_or_default()
    }

    fn prompt_tokens(&self, prompt: &str) -> Vec<i32> {
        let Some(tokenizer) = &self.tokenizer else {
            return Vec::new();
        };
        if let Some(hit) = self.prompt_cache.lock().get(&prompt.to_string()) {
            return hit;
        }
        let ids = tokenizer.tokenize(prompt);
        self.prompt_cache.lock().insert(prompt.to_string(), ids.clone());
        ids
    }

    fn decode_cached(&self, ids: &[i32]) -> String {
        if ids.is_empty() || ids.len() > self.config.decode_cache_max_tokens {
            return self.decode(ids);
        }
        let key = ids.to_vec();
        if let Some(hit) = self.decode_cache.lock().get(&key) {
            return hit;
        }
        let text = self.decode(ids);
        self.decode_cache.lock().insert(key, text.clone());
        text
    }

    #[cfg(test)]
    fn cache_sizes(&self) -> (usize, usize) {
        (self.prompt_cache.lock().len(), self.decode_cache.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::model::demo::{demo_model_bytes, DemoModelSpec};

    fn session(spec: &DemoModelSpec, config: RuntimeConfig) -> Session {
        let file = ModelFile::from_bytes(demo_model_bytes(5, spec).unwrap()).unwrap();
        Session::from_file(file, config).unwrap()
    }

    fn serial() -> RuntimeConfig {
        RuntimeConfig {
            kernels: KernelConfig {
                threads: 1,
                ..KernelConfig::default()
            },
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn fifo_evicts_oldest() {
        let mut c = FifoCache::new(2);
        c.insert(1, "a");
        c.insert(2, "b");
        c.insert(1, "ignored");
        c.insert(3, "c");
        assert_eq!(c.get(&1), None);
        assert_eq!(c.get(&2), Some("b"));
        assert_eq!(c.get(&3), Some("c"));
        let mut off = FifoCache::new(0);
        off.insert(1, 1);
        assert_eq!(off.len(), 0);
    }

    #[test]
    fn result_text_is_prompt_plus_decoded_tokens() {
        let s = session(&DemoModelSpec::default(), serial());
        let res = s.generate(&GenerateRequest::new("hi", 4)).unwrap();
        assert_eq!(res.token_ids.len(), 4);
        assert_eq!(res.topk_steps.len(), 4);
        assert_eq!(res.text, format!("hi{}", s.decode(&res.token_ids)));
    }

    #[test]
    fn negative_max_tokens_is_rejected() {
        let s = session(&DemoModelSpec::toy(), serial());
        let err = s.generate(&GenerateRequest::new("x", -1)).unwrap_err();
        assert!(matches!(err, BitNetError::InvalidRequest(_)));
    }

    #[test]
    fn zero_max_tokens_returns_empty_result() {
        let s = session(&DemoModelSpec::toy(), serial());
        let res = s.generate(&GenerateRequest::new("abc", 0)).unwrap();
        assert_eq!(res, GenerateResult::default());
    }

    #[test]
    fn caches_fill_on_repeat_requests() {
        let s = session(&DemoModelSpec::default(), serial());
        let req = GenerateRequest::new("cache me", 3);
        let a = s.generate(&req).unwrap();
        let b = s.generate(&req).unwrap();
        assert_eq!(a, b);
        assert_eq!(s.cache_sizes(), (1, 1));
    }

    #[test]
    fn cancel_returns_partial_result() {
        let s = session(&DemoModelSpec::toy(), serial());
        let handle = CancelHandle::new();
        handle.cancel();
        match s.generate_with_cancel(&GenerateRequest::new("", 5), &handle) {
            Err(BitNetError::Cancelled { partial }) => assert!(partial.token_ids.is_empty()),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn model_info_reflects_header() {
        let spec = DemoModelSpec::default();
        let s = session(&spec, serial());
        let info = s.model_info();
        assert_eq!(info.version, 3);
        assert_eq!(info.architecture, spec.architecture);
        assert_eq!(info.vocab_size as usize, spec.vocab);
        assert_eq!(info.context_length, spec.context_length);
        assert!(info.tensor_count > 0 && info.kv_count > 0);
    }

    #[test]
    fn session_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Session>();
    }
}

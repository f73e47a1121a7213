//! Greedy generation: prefill, argmax decode loop, top-K capture.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::engine::{seed_token, InferenceEngine};
use crate::errors::{BitNetError, Result};
use crate::kernels::argmax;
use crate::session::GenerateResult;
use crate::utils::{top_k, GenerationMetrics, Profiler};

/// One `(token_id, logit)` candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TopKEntry {
    pub token_id: i32,
    pub logit: f32,
}

/// Highest logits of one decode step, descending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopKStep {
    pub step: usize,
    pub entries: Vec<TopKEntry>,
}

/// Cooperative cancellation flag checked between tokens.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationParams {
    pub max_tokens: usize,
    /// Picks the start token when the prompt is empty.
    pub seed: i64,
    /// Entries per top-K step; 0 disables capture.
    pub topk: usize,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationOutput {
    pub tokens: Vec<i32>,
    pub topk_steps: Vec<TopKStep>,
    pub metrics: GenerationMetrics,
    /// Set when the loop stopped on a cancel; `tokens` holds what was emitted.
    pub cancelled: bool,
}

impl GenerationOutput {
    /// Wraps a step failure together with the tokens emitted so far.
    fn interrupted(self, source: BitNetError) -> BitNetError {
        BitNetError::Interrupted {
            source: Box::new(source),
            partial: Box::new(GenerateResult {
                token_ids: self.tokens,
                text: String::new(),
                topk_steps: self.topk_steps,
            }),
        }
    }
}

/// Drives an [`InferenceEngine`] over a prompt.
#[derive(Debug, Clone, Copy)]
pub struct TextGenerator<'a> {
    engine: &'a InferenceEngine,
}

impl<'a> TextGenerator<'a> {
    pub fn new(engine: &'a InferenceEngine) -> Self {
        Self { engine }
    }

    /// Prefills every prompt token but the last, then emits `max_tokens`
    /// argmax tokens starting from the last prompt token (or the seed token).
    ///
    /// A failing step returns [`BitNetError::Interrupted`] carrying the tokens
    /// and top-K steps produced before it.
    pub fn generate(
        &self,
        prompt: &[i32],
        params: GenerationParams,
        cancel: Option<&CancelHandle>,
    ) -> Result<GenerationOutput> {
        let mut out = GenerationOutput::default();
        if params.max_tokens == 0 {
            return Ok(out);
        }
        let cancelled = || cancel.is_some_and(CancelHandle::is_cancelled);
        let engine = self.engine;
        let mut profiler = Profiler::new();
        let mut st = engine.new_state(prompt.len() + params.max_tokens);

        let (mut current, start_pos) = match prompt.split_last() {
            Some((&last, head)) => {
                profiler.start("prefill");
                for (pos, &tok) in head.iter().enumerate() {
                    if cancelled() {
                        out.cancelled = true;
                        return Ok(out);
                    }
                    if let Err(e) = engine.forward(&mut st, tok, pos, false) {
                        return Err(out.interrupted(e));
                    }
                }
                profiler.end("prefill");
                (last, head.len())
            }
            None => (seed_token(params.seed, engine.vocab_size()), 0),
        };

        out.tokens.reserve(params.max_tokens);
        let k = params.topk.min(engine.vocab_size());
        profiler.start("decode");
        for step in 0..params.max_tokens {
            if cancelled() {
                out.cancelled = true;
                break;
            }
            if let Err(e) = engine.forward(&mut st, current, start_pos + step, true) {
                return Err(out.interrupted(e));
            }
            let logits = st.logits();
            if k > 0 {
                let entries = top_k(logits, k)
                    .into_iter()
                    .map(|(token_id, logit)| TopKEntry { token_id, logit })
                    .collect();
                out.topk_steps.push(TopKStep { step, entries });
            }
            let next = argmax(logits);
            trace!(step, token = next, logit = logits.get(next.max(0) as usize).copied().unwrap_or(0.0), "decode");
            // Empty logits: emit 0 and continue from it.
            current = next.max(0);
            out.tokens.push(current);
        }
        profiler.end("decode");

        out.metrics = profiler.generation_metrics(prompt.len(), out.tokens.len());
        profiler.log("generate");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kernels::KernelContext;
    use crate::model::demo::{demo_model_bytes, DemoModelSpec};
    use crate::model::{BitNetModel, ModelConfig, ModelFile};

    fn engine(spec: &DemoModelSpec) -> InferenceEngine {
        let file = ModelFile::from_bytes(demo_model_bytes(11, spec).unwrap()).unwrap();
        let model = BitNetModel::load(&file, ModelConfig::from_metadata(file.gguf())).unwrap();
        InferenceEngine::new(
            model,
            KernelContext::new(KernelConfig {
                threads: 1,
                ..KernelConfig::default()
            }),
        )
    }

    fn params(max_tokens: usize) -> GenerationParams {
        GenerationParams {
            max_tokens,
            seed: 0,
            topk: 5,
        }
    }

    #[test]
    fn emits_requested_tokens_with_topk() {
        let e = engine(&DemoModelSpec::default());
        let out = TextGenerator::new(&e).generate(&[1, 40, 50], params(6), None).unwrap();
        assert_eq!(out.tokens.len(), 6);
        assert_eq!(out.topk_steps.len(), 6);
        for (i, s) in out.topk_steps.iter().enumerate() {
            assert_eq!(s.step, i);
            assert_eq!(s.entries.len(), 5);
            assert_eq!(s.entries[0].token_id, out.tokens[i]);
            assert!(s.entries.windows(2).all(|w| w[0].logit >= w[1].logit));
        }
        assert_eq!(out.metrics.generated_tokens, 6);
        assert!(!out.cancelled);
    }

    #[test]
    fn zero_tokens_is_empty() {
        let e = engine(&DemoModelSpec::toy());
        let out = TextGenerator::new(&e).generate(&[1, 2], params(0), None).unwrap();
        assert!(out.tokens.is_empty() && out.topk_steps.is_empty());
    }

    #[test]
    fn empty_prompt_starts_from_seed_token() {
        let e = engine(&DemoModelSpec::toy());
        let g = TextGenerator::new(&e);
        let seeded = GenerationParams {
            seed: 13,
            ..params(3)
        };
        // 13 mod 8 = 5
        let a = g.generate(&[], seeded, None).unwrap();
        let b = g.generate(&[5], params(3), None).unwrap();
        assert_eq!(a.tokens, b.tokens);
    }

    #[test]
    fn cancelled_before_start_returns_nothing() {
        let e = engine(&DemoModelSpec::toy());
        let handle = CancelHandle::new();
        handle.cancel();
        let out = TextGenerator::new(&e)
            .generate(&[1, 2, 3], params(4), Some(&handle))
            .unwrap();
        assert!(out.cancelled);
        assert!(out.tokens.is_empty());
    }

    #[test]
    fn step_failure_keeps_emitted_tokens() {
        let out = GenerationOutput {
            tokens: vec![3, 4],
            ..GenerationOutput::default()
        };
        let err = out.interrupted(BitNetError::InvalidRequest("boom".into()));
        assert!(err.to_string().starts_with("generation failed after 2 tokens"));
        match err {
            BitNetError::Interrupted { source, partial } => {
                assert!(matches!(*source, BitNetError::InvalidRequest(_)));
                assert_eq!(partial.token_ids, vec![3, 4]);
            }
            other => panic!("expected Interrupted, got {other:?}"),
        }
    }

    #[test]
    fn topk_capture_can_be_disabled() {
        let e = engine(&DemoModelSpec::toy());
        let p = GenerationParams {
            topk: 0,
            ..params(3)
        };
        let out = TextGenerator::new(&e).generate(&[1], p, None).unwrap();
        assert_eq!(out.tokens.len(), 3);
        assert!(out.topk_steps.is_empty());
    }
}

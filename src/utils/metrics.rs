//! Timing and logit helpers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::info;

/// Per-request timing summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationMetrics {
    pub prefill_time_ms: f64,
    pub decode_time_ms: f64,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub tokens_per_second: f64,
}

/// Accumulating section timer.
#[derive(Debug, Default)]
pub struct Profiler {
    start_times: HashMap<&'static str, Instant>,
    durations: HashMap<&'static str, Duration>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, label: &'static str) {
        self.start_times.insert(label, Instant::now());
    }

    pub fn end(&mut self, label: &'static str) {
        if let Some(start) = self.start_times.remove(label) {
            *self.durations.entry(label).or_default() += start.elapsed();
        }
    }

    /// Total time recorded under `label`.
    pub fn get(&self, label: &str) -> Duration {
        self.durations.get(label).copied().unwrap_or_default()
    }

    pub fn report(&self) -> HashMap<&'static str, Duration> {
        self.durations.clone()
    }

    /// Summary built from the `prefill` and `decode` sections.
    pub fn generation_metrics(&self, prompt_tokens: usize, generated_tokens: usize) -> GenerationMetrics {
        let prefill = self.get("prefill");
        let decode = self.get("decode");
        let tokens_per_second = if decode.as_secs_f64() > 0.0 {
            generated_tokens as f64 / decode.as_secs_f64()
        } else {
            0.0
        };
        GenerationMetrics {
            prefill_time_ms: prefill.as_secs_f64() * 1000.0,
            decode_time_ms: decode.as_secs_f64() * 1000.0,
            prompt_tokens,
            generated_tokens,
            tokens_per_second,
        }
    }

    /// Log every recorded section at info level.
    pub fn log(&self, context: &str) {
        let mut sections: Vec<_> = self.durations.iter().collect();
        sections.sort_by_key(|(label, _)| **label);
        for (label, d) in sections {
            info!(context, section = label, ms = d.as_secs_f64() * 1000.0, "timing");
        }
    }
}

/// The `k` largest logits as `(token_id, logit)`, sorted by descending logit.
///
/// Keeps a running set of `k` candidates and replaces the current minimum
/// only on a strictly larger logit, so among equal logits the lower id wins.
pub fn top_k(logits: &[f32], k: usize) -> Vec<(i32, f32)> {
    let k = k.min(logits.len());
    if k == 0 {
        return Vec::new();
    }
    let mut entries: Vec<(i32, f32)> = Vec::with_capacity(k);
    let mut min_idx = 0usize;
    for (id, &logit) in logits.iter().enumerate() {
        if entries.len() < k {
            entries.push((id as i32, logit));
            if entries.len() == k {
                min_idx = min_slot(&entries);
            }
            continue;
        }
        if logit <= entries[min_idx].1 {
            continue;
        }
        entries[min_idx] = (id as i32, logit);
        min_idx = min_slot(&entries);
    }
    // Stable insertion order: equal logits keep their relative order.
    for i in 1..entries.len() {
        let mut j = i;
        while j > 0 && entries[j - 1].1 < entries[j].1 {
            entries.swap(j - 1, j);
            j -= 1;
        }
    }
    entries
}

fn min_slot(entries: &[(i32, f32)]) -> usize {
    let mut idx = 0;
    for (i, e) in entries.iter().enumerate().skip(1) {
        if e.1 < entries[idx].1 {
            idx = i;
        }
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_sorted_descending() {
        let logits = [0.1, 3.0, -1.0, 2.5, 3.0, 0.0, 7.0];
        let top = top_k(&logits, 5);
        let ids: Vec<i32> = top.iter().map(|e| e.0).collect();
        assert_eq!(ids, vec![6, 1, 4, 3, 0]);
        assert!(top.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn top_k_short_input() {
        assert_eq!(top_k(&[1.0, 2.0], 5), vec![(1, 2.0), (0, 1.0)]);
        assert!(top_k(&[], 5).is_empty());
        assert!(top_k(&[1.0], 0).is_empty());
    }

    #[test]
    fn profiler_accumulates() {
        let mut p = Profiler::new();
        p.start("decode");
        p.end("decode");
        p.start("decode");
        p.end("decode");
        p.end("never-started");
        assert_eq!(p.report().len(), 1);
        let m = p.generation_metrics(3, 0);
        assert_eq!(m.prompt_tokens, 3);
        assert_eq!(m.tokens_per_second, 0.0);
    }
}

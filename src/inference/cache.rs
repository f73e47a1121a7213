//! Per-request KV cache.
//!
//! Keys are time-major: one contiguous `kv_dim` vector per position. Values are
//! head-major, dim-major, position-minor (`values[h·head_dim·max_seq + d·max_seq + t]`)
//! so the weighted sum over positions reads one contiguous run per (head, dim).

use crate::errors::{BitNetError, Result};

/// Cache for one layer.
#[derive(Debug, Clone)]
pub struct LayerCache {
    keys: Vec<f32>,
    values: Vec<f32>,
    kv_heads: usize,
    head_dim: usize,
    max_seq: usize,
}

impl LayerCache {
    pub fn new(kv_heads: usize, head_dim: usize, max_seq: usize) -> Self {
        let n = kv_heads * head_dim * max_seq;
        Self {
            keys: vec![0.0; n],
            values: vec![0.0; n],
            kv_heads,
            head_dim,
            max_seq,
        }
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_heads * self.head_dim
    }

    /// Write the K and V step vectors for position `t`.
    pub fn store(&mut self, t: usize, k: &[f32], v: &[f32]) -> Result<()> {
        let kv_dim = self.kv_dim();
        if t >= self.max_seq {
            return Err(BitNetError::InvalidRequest(format!(
                "position {t} exceeds cache length {}",
                self.max_seq
            )));
        }
        if k.len() != kv_dim || v.len() != kv_dim {
            return Err(BitNetError::shape(
                "kv cache",
                format!("k {} / v {} want {kv_dim}", k.len(), v.len()),
            ));
        }
        self.keys[t * kv_dim..(t + 1) * kv_dim].copy_from_slice(k);
        for (i, &x) in v.iter().enumerate() {
            // i = h·head_dim + d, and (h·head_dim + d)·max_seq is the row start.
            self.values[i * self.max_seq + t] = x;
        }
        Ok(())
    }

    /// Key slice of `kv_head` at position `t`.
    pub fn key(&self, kv_head: usize, t: usize) -> &[f32] {
        let start = t * self.kv_dim() + kv_head * self.head_dim;
        &self.keys[start..start + self.head_dim]
    }

    /// Values of `(kv_head, d)` for positions `0..steps`.
    pub fn value_run(&self, kv_head: usize, d: usize, steps: usize) -> &[f32] {
        let start = (kv_head * self.head_dim + d) * self.max_seq;
        &self.values[start..start + steps.min(self.max_seq)]
    }

    pub fn max_seq(&self) -> usize {
        self.max_seq
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn kv_heads(&self) -> usize {
        self.kv_heads
    }
}

/// One [`LayerCache`] per transformer layer, sized once per request.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerCache>,
    max_seq: usize,
}

impl KvCache {
    /// `shapes` holds `(kv_heads, head_dim)` per layer.
    pub fn new(shapes: impl IntoIterator<Item = (usize, usize)>, max_seq: usize) -> Self {
        let max_seq = max_seq.max(1);
        let layers = shapes
            .into_iter()
            .map(|(kv_heads, head_dim)| LayerCache::new(kv_heads, head_dim, max_seq))
            .collect();
        Self { layers, max_seq }
    }

    pub fn layer(&self, idx: usize) -> &LayerCache {
        &self.layers[idx]
    }

    pub fn layer_mut(&mut self, idx: usize) -> &mut LayerCache {
        &mut self.layers[idx]
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn max_seq(&self) -> usize {
        self.max_seq
    }

    /// Total bytes held by keys and values.
    pub fn memory_bytes(&self) -> usize {
        self.layers
            .iter()
            .map(|l| (l.keys.len() + l.values.len()) * std::mem::size_of::<f32>())
            .sum()
    }
}

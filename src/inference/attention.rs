//! Causal grouped-query attention over a [`LayerCache`].

use super::cache::LayerCache;
use crate::kernels::dense::dot_f32;
use crate::kernels::norm::softmax_in_place;
use crate::kernels::KernelContext;

/// Attention for the query at position `steps - 1`.
///
/// `q` holds `q_heads` heads of `cache.head_dim()`; query head `h` reads KV head
/// `h · kv_heads / q_heads`. `scores` must hold at least `steps` entries. Heads
/// whose softmax degenerates (zero sum) are left zeroed in `dst`.
pub fn causal_attention(
    ctx: &KernelContext,
    dst: &mut [f32],
    scores: &mut [f32],
    q: &[f32],
    cache: &LayerCache,
    steps: usize,
    q_heads: usize,
) {
    dst.fill(0.0);
    let head_dim = cache.head_dim();
    let kv_heads = cache.kv_heads();
    let steps = steps.min(cache.max_seq());
    if steps == 0 || q_heads == 0 || head_dim == 0 {
        return;
    }
    if q.len() < q_heads * head_dim || dst.len() < q_heads * head_dim || scores.len() < steps {
        return;
    }
    let scale = 1.0 / (head_dim as f32).sqrt();
    let scores = &mut scores[..steps];

    for h in 0..q_heads {
        let kv_head = h * kv_heads / q_heads;
        let qh = &q[h * head_dim..(h + 1) * head_dim];
        for (i, s) in scores.iter_mut().enumerate() {
            *s = ctx.attention_dot(qh, cache.key(kv_head, i)) * scale;
        }
        if !softmax_in_place(scores) {
            continue;
        }
        let out = &mut dst[h * head_dim..(h + 1) * head_dim];
        for (d, o) in out.iter_mut().enumerate() {
            *o = dot_f32(scores, cache.value_run(kv_head, d, steps));
        }
    }
}

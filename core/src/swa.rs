/// Sliding Window Attention (SWA): the attention collaborator of the
/// memory-as-context block.
///
/// Per-query-position attention over a causal sliding window.
/// Multi-head: Q/K/V are [seq_len, num_heads * head_dim], reshaped internally.
///
/// Two paths with identical numerics:
///   - `swa_forward` over a whole sequence;
///   - `swa_decode_step` for one new position against a bounded KV cache
///     holding at most `window_size` past rows.

use serde::{Serialize, Deserialize};

use crate::mac::ContextAttention;
use crate::tensor::{SimpleRng, matmul_f32, softmax_f32};

/// SWA forward pass.
///
/// Inputs (all row-major flat slices):
///   q: [seq_len, num_heads * head_dim]  (queries)
///   k: [seq_len, num_heads * head_dim]  (keys)
///   v: [seq_len, num_heads * head_dim]  (values)
///
/// Output:
///   out: [seq_len, num_heads * head_dim]  (attention output)
///   attn_weights: [num_heads, seq_len, window_size]  (softmax weights)
///
/// For each query position q_pos, attends to key positions in
/// [max(0, q_pos - window_size + 1) .. q_pos] (inclusive, causal).
/// The scale factor is 1/sqrt(head_dim).
pub fn swa_forward(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    out: &mut [f32],
    attn_weights: &mut [f32],
    seq_len: usize,
    num_heads: usize,
    head_dim: usize,
    window_size: usize,
) {
    let total_dim = num_heads * head_dim;
    debug_assert_eq!(q.len(), seq_len * total_dim);
    debug_assert_eq!(k.len(), seq_len * total_dim);
    debug_assert_eq!(v.len(), seq_len * total_dim);
    debug_assert_eq!(out.len(), seq_len * total_dim);
    debug_assert_eq!(attn_weights.len(), num_heads * seq_len * window_size);

    out.iter_mut().for_each(|x| *x = 0.0);
    attn_weights.iter_mut().for_each(|x| *x = 0.0);

    for h in 0..num_heads {
        for q_pos in 0..seq_len {
            let win_start = (q_pos + 1).saturating_sub(window_size);
            let aw_base = (h * seq_len + q_pos) * window_size;
            attend_window(
                &q[q_pos * total_dim..(q_pos + 1) * total_dim],
                &k[win_start * total_dim..(q_pos + 1) * total_dim],
                &v[win_start * total_dim..(q_pos + 1) * total_dim],
                &mut out[q_pos * total_dim..(q_pos + 1) * total_dim],
                &mut attn_weights[aw_base..aw_base + window_size],
                h,
                num_heads,
                head_dim,
            );
        }
    }
}

/// One query row of one head against the rows of its window.
///
/// `keys`/`values` hold the window's rows ([win_len, num_heads * head_dim]);
/// `weights` receives the softmax over them (trailing slots stay zero).
fn attend_window(
    q_row: &[f32],
    keys: &[f32],
    values: &[f32],
    out_row: &mut [f32],
    weights: &mut [f32],
    h: usize,
    num_heads: usize,
    head_dim: usize,
) {
    let total_dim = num_heads * head_dim;
    let win_len = keys.len() / total_dim;
    let h_offset = h * head_dim;
    let scale = 1.0 / (head_dim as f32).sqrt();

    let mut scores = vec![0.0f32; win_len];
    for w in 0..win_len {
        let mut dot = 0.0f32;
        for d in 0..head_dim {
            dot += q_row[h_offset + d] * keys[w * total_dim + h_offset + d];
        }
        scores[w] = dot * scale;
    }
    softmax_f32(&scores, &mut weights[..win_len], 1, win_len);

    for w in 0..win_len {
        let weight = weights[w];
        for d in 0..head_dim {
            out_row[h_offset + d] += weight * values[w * total_dim + h_offset + d];
        }
    }
}

/// Bounded KV cache for incremental decoding: the last `window_size` rows.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SwaKvCache {
    pub keys: Vec<f32>,
    pub values: Vec<f32>,
    /// Positions decoded so far (not bounded by the window).
    pub position: usize,
}

impl SwaKvCache {
    pub fn rows(&self, total_dim: usize) -> usize {
        self.keys.len() / total_dim
    }
}

/// Decode one position: append (k_row, v_row), evict rows that fell out of
/// the window, attend from `q_row`. Returns the [num_heads * head_dim] output.
pub fn swa_decode_step(
    q_row: &[f32],
    k_row: &[f32],
    v_row: &[f32],
    cache: &mut SwaKvCache,
    num_heads: usize,
    head_dim: usize,
    window_size: usize,
) -> Vec<f32> {
    let total_dim = num_heads * head_dim;
    cache.keys.extend_from_slice(k_row);
    cache.values.extend_from_slice(v_row);
    let rows = cache.rows(total_dim);
    if rows > window_size {
        let evict = (rows - window_size) * total_dim;
        cache.keys.drain(..evict);
        cache.values.drain(..evict);
    }
    cache.position += 1;

    let mut out = vec![0.0f32; total_dim];
    let mut weights = vec![0.0f32; window_size];
    for h in 0..num_heads {
        attend_window(q_row, &cache.keys, &cache.values, &mut out, &mut weights, h, num_heads, head_dim);
    }
    out
}

/// Multi-head sliding-window attention with its own projections.
///
///   y = SWA(x Wq, x Wk, x Wv) Wo
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowAttention {
    pub dim: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub window_size: usize,
    pub w_q: Vec<f32>,
    pub w_k: Vec<f32>,
    pub w_v: Vec<f32>,
    pub w_o: Vec<f32>,
}

impl SlidingWindowAttention {
    /// Xavier-initialized projections; `dim` must split evenly into heads.
    pub fn new(dim: usize, num_heads: usize, window_size: usize, seed: u64) -> Self {
        assert!(num_heads >= 1 && dim % num_heads == 0, "dim {dim} not divisible by {num_heads} heads");
        assert!(window_size >= 1);
        let mut rng = SimpleRng::new(seed);
        let mut proj = || {
            let mut w = vec![0.0f32; dim * dim];
            rng.fill_xavier(&mut w, dim, dim);
            w
        };
        SlidingWindowAttention {
            dim,
            num_heads,
            head_dim: dim / num_heads,
            window_size,
            w_q: proj(),
            w_k: proj(),
            w_v: proj(),
            w_o: proj(),
        }
    }

    fn project(&self, x: &[f32], w: &[f32], n: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; n * self.dim];
        matmul_f32(x, w, &mut out, n, self.dim, self.dim);
        out
    }
}

impl ContextAttention for SlidingWindowAttention {
    type Cache = SwaKvCache;

    fn dim(&self) -> usize {
        self.dim
    }

    fn forward(&self, x: &[f32], n: usize) -> Vec<f32> {
        let q = self.project(x, &self.w_q, n);
        let k = self.project(x, &self.w_k, n);
        let v = self.project(x, &self.w_v, n);
        let mut attn = vec![0.0f32; n * self.dim];
        let mut weights = vec![0.0f32; self.num_heads * n * self.window_size];
        swa_forward(&q, &k, &v, &mut attn, &mut weights, n, self.num_heads, self.head_dim, self.window_size);
        self.project(&attn, &self.w_o, n)
    }

    fn init_cache(&self) -> SwaKvCache {
        SwaKvCache::default()
    }

    fn step(&self, token: &[f32], cache: &mut SwaKvCache) -> Vec<f32> {
        let q = self.project(token, &self.w_q, 1);
        let k = self.project(token, &self.w_k, 1);
        let v = self.project(token, &self.w_v, 1);
        let attn = swa_decode_step(&q, &k, &v, cache, self.num_heads, self.head_dim, self.window_size);
        self.project(&attn, &self.w_o, 1)
    }
}

/// Attention memory: causal softmax attention whose projections are the
/// memory weights, plus a GELU feed-forward branch.
///
///   q = x Wq, k = x Wk, v = x Wv
///   attn = softmax_causal(scale · q kᵀ) v
///   y = attn + gelu(x F1) F2
///
/// Unlike the MLP variants, positions interact: the output for a row
/// depends on every earlier row passed in the same call.

use crate::memory_model::MemoryModel;
use crate::param_layout::ParamLayout;
use crate::tensor::{
    SimpleRng, matmul_f32, matmul_acc_f32, matmul_nt_f32, matmul_tn_acc_f32,
    softmax_f32, gelu_f32, gelu_prime_f32,
};

#[derive(Clone, Debug)]
pub struct MemoryAttention {
    dim: usize,
    scale: f32,
    hidden: usize,
}

pub struct AttentionCache {
    n: usize,
    x: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    /// Causal softmax weights: [n, n] (upper triangle zero)
    probs: Vec<f32>,
    u: Vec<f32>,
    hid: Vec<f32>,
}

impl MemoryAttention {
    pub fn new(dim: usize, scale: f32, hidden: usize) -> Self {
        assert!(hidden >= 1);
        MemoryAttention { dim, scale, hidden }
    }
}

impl MemoryModel for MemoryAttention {
    type Cache = AttentionCache;

    fn dim(&self) -> usize {
        self.dim
    }

    fn layout(&self) -> ParamLayout {
        let (d, h) = (self.dim, self.hidden);
        let mut layout = ParamLayout::new();
        layout.push("queries", &[d, d]);
        layout.push("keys", &[d, d]);
        layout.push("values", &[d, d]);
        layout.push("ffw.0", &[d, h]);
        layout.push("ffw.1", &[h, d]);
        layout
    }

    fn init_weights(&self, rng: &mut SimpleRng) -> Vec<f32> {
        let layout = self.layout();
        let mut w = vec![0.0f32; layout.numel()];
        for e in layout.entries() {
            rng.fill_xavier(&mut w[e.range()], e.shape[0], e.shape[1]);
        }
        w
    }

    fn forward(&self, weights: &[f32], x: &[f32], n: usize) -> (Vec<f32>, AttentionCache) {
        let (d, h) = (self.dim, self.hidden);
        debug_assert_eq!(x.len(), n * d);
        let layout = self.layout();
        let e = layout.entries();

        let mut q = vec![0.0f32; n * d];
        let mut k = vec![0.0f32; n * d];
        let mut v = vec![0.0f32; n * d];
        matmul_f32(x, &weights[e[0].range()], &mut q, n, d, d);
        matmul_f32(x, &weights[e[1].range()], &mut k, n, d, d);
        matmul_f32(x, &weights[e[2].range()], &mut v, n, d, d);

        let mut scores = vec![f32::NEG_INFINITY; n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut dot = 0.0f32;
                for c in 0..d {
                    dot += q[i * d + c] * k[j * d + c];
                }
                scores[i * n + j] = dot * self.scale;
            }
        }
        let mut probs = vec![0.0f32; n * n];
        softmax_f32(&scores, &mut probs, n, n);

        let mut y = vec![0.0f32; n * d];
        matmul_f32(&probs, &v, &mut y, n, n, d);

        let mut u = vec![0.0f32; n * h];
        matmul_f32(x, &weights[e[3].range()], &mut u, n, d, h);
        let hid: Vec<f32> = u.iter().map(|&z| gelu_f32(z)).collect();
        matmul_acc_f32(&hid, &weights[e[4].range()], &mut y, n, h, d);

        (y, AttentionCache { n, x: x.to_vec(), q, k, v, probs, u, hid })
    }

    fn backward(&self, weights: &[f32], cache: &AttentionCache, d_y: &[f32]) -> Vec<f32> {
        let (n, d, h) = (cache.n, self.dim, self.hidden);
        let layout = self.layout();
        let e = layout.entries();
        let mut grads = vec![0.0f32; layout.numel()];

        // Feed-forward branch
        matmul_tn_acc_f32(&cache.hid, d_y, &mut grads[e[4].range()], n, h, d);
        let mut d_u = vec![0.0f32; n * h];
        matmul_nt_f32(d_y, &weights[e[4].range()], &mut d_u, n, d, h);
        for (g, &z) in d_u.iter_mut().zip(cache.u.iter()) {
            *g *= gelu_prime_f32(z);
        }
        matmul_tn_acc_f32(&cache.x, &d_u, &mut grads[e[3].range()], n, d, h);

        // Attention branch: dV = Pᵀ dY, dP = dY Vᵀ
        let mut d_v = vec![0.0f32; n * d];
        matmul_tn_acc_f32(&cache.probs, d_y, &mut d_v, n, n, d);
        let mut d_p = vec![0.0f32; n * n];
        matmul_nt_f32(d_y, &cache.v, &mut d_p, n, d, n);

        // Softmax backward: dS = P ⊙ (dP - rowsum(dP ⊙ P)), scaled
        let mut d_s = vec![0.0f32; n * n];
        for i in 0..n {
            let mut row_dot = 0.0f32;
            for j in 0..=i {
                row_dot += d_p[i * n + j] * cache.probs[i * n + j];
            }
            for j in 0..=i {
                d_s[i * n + j] = cache.probs[i * n + j] * (d_p[i * n + j] - row_dot) * self.scale;
            }
        }

        // dQ = dS K, dK = dSᵀ Q
        let mut d_q = vec![0.0f32; n * d];
        matmul_f32(&d_s, &cache.k, &mut d_q, n, n, d);
        let mut d_k = vec![0.0f32; n * d];
        matmul_tn_acc_f32(&d_s, &cache.q, &mut d_k, n, n, d);

        matmul_tn_acc_f32(&cache.x, &d_q, &mut grads[e[0].range()], n, d, d);
        matmul_tn_acc_f32(&cache.x, &d_k, &mut grads[e[1].range()], n, d, d);
        matmul_tn_acc_f32(&cache.x, &d_v, &mut grads[e[2].range()], n, d, d);
        grads
    }
}

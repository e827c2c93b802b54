/// Gated residual MLP memory.
///
/// Per block (input x, residual r = x):
///   u = x @ W1;  hid = gelu(u);  branch = hid @ W2
///   g = sigmoid([branch, r] @ Wg)
///   x' = r + g ⊙ (branch - r)          // learned interpolation
/// After all blocks: y = x_L @ W_final.
///
/// Backward per block (given dx'):
///   d_branch = g ⊙ dx' + (d_cat)[:, :dim]
///   d_r      = (1 - g) ⊙ dx' + (d_cat)[:, dim:]
///   with d_gp = dx' ⊙ (branch - r) ⊙ g(1-g), d_cat = d_gp @ Wg^T

use crate::memory_model::MemoryModel;
use crate::param_layout::ParamLayout;
use crate::tensor::{
    SimpleRng, matmul_f32, matmul_nt_f32, matmul_tn_acc_f32,
    gelu_f32, gelu_prime_f32, sigmoid_f32,
};

#[derive(Clone, Debug)]
pub struct GatedResidualMemoryMlp {
    dim: usize,
    depth: usize,
    hidden: usize,
}

struct BlockCache {
    x: Vec<f32>,
    u: Vec<f32>,
    hid: Vec<f32>,
    branch: Vec<f32>,
    /// [branch, x] per row: [n, 2*dim]
    cat: Vec<f32>,
    gate: Vec<f32>,
}

pub struct GatedResidualCache {
    n: usize,
    blocks: Vec<BlockCache>,
    final_input: Vec<f32>,
}

impl GatedResidualMemoryMlp {
    pub fn new(dim: usize, depth: usize, hidden: usize) -> Self {
        assert!(depth >= 1 && hidden >= 1);
        GatedResidualMemoryMlp { dim, depth, hidden }
    }
}

impl MemoryModel for GatedResidualMemoryMlp {
    type Cache = GatedResidualCache;

    fn dim(&self) -> usize {
        self.dim
    }

    fn layout(&self) -> ParamLayout {
        let (d, h) = (self.dim, self.hidden);
        let mut layout = ParamLayout::new();
        for i in 0..self.depth {
            layout.push(format!("weights.{i}.0"), &[d, h]);
            layout.push(format!("weights.{i}.1"), &[h, d]);
            layout.push(format!("weights.{i}.to_gates"), &[2 * d, d]);
        }
        layout.push("final_proj", &[d, d]);
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

    fn forward(&self, weights: &[f32], x: &[f32], n: usize) -> (Vec<f32>, GatedResidualCache) {
        let (d, h) = (self.dim, self.hidden);
        debug_assert_eq!(x.len(), n * d);
        let layout = self.layout();
        let entries = layout.entries();

        let mut cur = x.to_vec();
        let mut blocks = Vec::with_capacity(self.depth);
        for i in 0..self.depth {
            let (e1, e2, eg) = (&entries[3 * i], &entries[3 * i + 1], &entries[3 * i + 2]);

            let mut u = vec![0.0f32; n * h];
            matmul_f32(&cur, &weights[e1.range()], &mut u, n, d, h);
            let hid: Vec<f32> = u.iter().map(|&v| gelu_f32(v)).collect();
            let mut branch = vec![0.0f32; n * d];
            matmul_f32(&hid, &weights[e2.range()], &mut branch, n, h, d);

            let mut cat = vec![0.0f32; n * 2 * d];
            for t in 0..n {
                cat[t * 2 * d..t * 2 * d + d].copy_from_slice(&branch[t * d..(t + 1) * d]);
                cat[t * 2 * d + d..(t + 1) * 2 * d].copy_from_slice(&cur[t * d..(t + 1) * d]);
            }
            let mut gate = vec![0.0f32; n * d];
            matmul_f32(&cat, &weights[eg.range()], &mut gate, n, 2 * d, d);
            for g in gate.iter_mut() {
                *g = sigmoid_f32(*g);
            }

            let next: Vec<f32> = (0..n * d)
                .map(|j| cur[j] + gate[j] * (branch[j] - cur[j]))
                .collect();
            blocks.push(BlockCache { x: cur, u, hid, branch, cat, gate });
            cur = next;
        }

        let ef = &entries[3 * self.depth];
        let mut y = vec![0.0f32; n * d];
        matmul_f32(&cur, &weights[ef.range()], &mut y, n, d, d);
        (y, GatedResidualCache { n, blocks, final_input: cur })
    }

    fn backward(&self, weights: &[f32], cache: &GatedResidualCache, d_y: &[f32]) -> Vec<f32> {
        let (n, d, h) = (cache.n, self.dim, self.hidden);
        let layout = self.layout();
        let entries = layout.entries();
        let mut grads = vec![0.0f32; layout.numel()];

        let ef = &entries[3 * self.depth];
        matmul_tn_acc_f32(&cache.final_input, d_y, &mut grads[ef.range()], n, d, d);
        let mut dx = vec![0.0f32; n * d];
        matmul_nt_f32(d_y, &weights[ef.range()], &mut dx, n, d, d);

        for i in (0..self.depth).rev() {
            let b = &cache.blocks[i];
            let (e1, e2, eg) = (&entries[3 * i], &entries[3 * i + 1], &entries[3 * i + 2]);

            let mut d_branch = vec![0.0f32; n * d];
            let mut d_res = vec![0.0f32; n * d];
            let mut d_gp = vec![0.0f32; n * d];
            for j in 0..n * d {
                let g = b.gate[j];
                d_branch[j] = g * dx[j];
                d_res[j] = (1.0 - g) * dx[j];
                d_gp[j] = dx[j] * (b.branch[j] - b.x[j]) * g * (1.0 - g);
            }

            matmul_tn_acc_f32(&b.cat, &d_gp, &mut grads[eg.range()], n, 2 * d, d);
            let mut d_cat = vec![0.0f32; n * 2 * d];
            matmul_nt_f32(&d_gp, &weights[eg.range()], &mut d_cat, n, d, 2 * d);
            for t in 0..n {
                for c in 0..d {
                    d_branch[t * d + c] += d_cat[t * 2 * d + c];
                    d_res[t * d + c] += d_cat[t * 2 * d + d + c];
                }
            }

            matmul_tn_acc_f32(&b.hid, &d_branch, &mut grads[e2.range()], n, h, d);
            let mut d_u = vec![0.0f32; n * h];
            matmul_nt_f32(&d_branch, &weights[e2.range()], &mut d_u, n, d, h);
            for (g, &u) in d_u.iter_mut().zip(b.u.iter()) {
                *g *= gelu_prime_f32(u);
            }
            matmul_tn_acc_f32(&b.x, &d_u, &mut grads[e1.range()], n, d, h);

            if i > 0 {
                let mut d_in = vec![0.0f32; n * d];
                matmul_nt_f32(&d_u, &weights[e1.range()], &mut d_in, n, h, d);
                for j in 0..n * d {
                    d_in[j] += d_res[j];
                }
                dx = d_in;
            }
        }
        grads
    }
}

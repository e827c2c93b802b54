/// Factorized MLP memory: each layer is a rank-k product.
///
/// Layer i: z_i = a_i @ A_i @ B_i with A_i: [dim, rank], B_i: [rank, dim],
/// a_0 = x, a_i = gelu(z_{i-1}). Far fewer parameters per head than the
/// dense MLP when rank << dim, so the weight trajectory stays small.

use crate::memory_model::MemoryModel;
use crate::param_layout::ParamLayout;
use crate::tensor::{
    SimpleRng, matmul_f32, matmul_nt_f32, matmul_tn_acc_f32,
    gelu_f32, gelu_prime_f32,
};

#[derive(Clone, Debug)]
pub struct FactorizedMemoryMlp {
    dim: usize,
    depth: usize,
    rank: usize,
}

pub struct FactorizedCache {
    pub n: usize,
    /// a_i per layer: [n, dim]
    pub layer_inputs: Vec<Vec<f32>>,
    /// a_i @ A_i per layer: [n, rank]
    pub low_rank: Vec<Vec<f32>>,
    /// z_i per layer: [n, dim]
    pub pre_acts: Vec<Vec<f32>>,
}

impl FactorizedMemoryMlp {
    pub fn new(dim: usize, depth: usize, rank: usize) -> Self {
        assert!(depth >= 1 && rank >= 1);
        FactorizedMemoryMlp { dim, depth, rank }
    }
}

impl MemoryModel for FactorizedMemoryMlp {
    type Cache = FactorizedCache;

    fn dim(&self) -> usize {
        self.dim
    }

    fn layout(&self) -> ParamLayout {
        let mut layout = ParamLayout::new();
        for i in 0..self.depth {
            layout.push(format!("weights.{i}.0"), &[self.dim, self.rank]);
            layout.push(format!("weights.{i}.1"), &[self.rank, self.dim]);
        }
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

    fn forward(&self, weights: &[f32], x: &[f32], n: usize) -> (Vec<f32>, FactorizedCache) {
        let (d, r) = (self.dim, self.rank);
        debug_assert_eq!(x.len(), n * d);
        let layout = self.layout();
        let entries = layout.entries();

        let mut layer_inputs = Vec::with_capacity(self.depth);
        let mut low_rank = Vec::with_capacity(self.depth);
        let mut pre_acts: Vec<Vec<f32>> = Vec::with_capacity(self.depth);
        for i in 0..self.depth {
            let a: Vec<f32> = if i == 0 {
                x.to_vec()
            } else {
                pre_acts[i - 1].iter().map(|&z| gelu_f32(z)).collect()
            };
            let mut h = vec![0.0f32; n * r];
            matmul_f32(&a, &weights[entries[2 * i].range()], &mut h, n, d, r);
            let mut z = vec![0.0f32; n * d];
            matmul_f32(&h, &weights[entries[2 * i + 1].range()], &mut z, n, r, d);
            layer_inputs.push(a);
            low_rank.push(h);
            pre_acts.push(z);
        }

        let y = pre_acts[self.depth - 1].clone();
        (y, FactorizedCache { n, layer_inputs, low_rank, pre_acts })
    }

    fn backward(&self, weights: &[f32], cache: &FactorizedCache, d_y: &[f32]) -> Vec<f32> {
        let (n, d, r) = (cache.n, self.dim, self.rank);
        let layout = self.layout();
        let entries = layout.entries();
        let mut grads = vec![0.0f32; layout.numel()];

        let mut dz = d_y.to_vec();
        for i in (0..self.depth).rev() {
            let (ea, eb) = (&entries[2 * i], &entries[2 * i + 1]);
            // dB = h^T dz, dh = dz B^T, dA = a^T dh
            matmul_tn_acc_f32(&cache.low_rank[i], &dz, &mut grads[eb.range()], n, r, d);
            let mut dh = vec![0.0f32; n * r];
            matmul_nt_f32(&dz, &weights[eb.range()], &mut dh, n, d, r);
            matmul_tn_acc_f32(&cache.layer_inputs[i], &dh, &mut grads[ea.range()], n, d, r);
            if i > 0 {
                let mut da = vec![0.0f32; n * d];
                matmul_nt_f32(&dh, &weights[ea.range()], &mut da, n, r, d);
                for (g, &z) in da.iter_mut().zip(cache.pre_acts[i - 1].iter()) {
                    *g *= gelu_prime_f32(z);
                }
                dz = da;
            }
        }
        grads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_model::check_gradients;

    #[test]
    fn test_factorized_param_count() {
        let m = FactorizedMemoryMlp::new(16, 2, 4);
        assert_eq!(m.num_params(), 2 * (16 * 4 + 4 * 16));
        assert_eq!(m.layout().entry("weights.1.0").unwrap().shape, vec![16, 4]);
    }

    #[test]
    fn test_factorized_rank_one_output_is_rank_one() {
        // depth 1, rank 1: every output row is a multiple of B.
        let m = FactorizedMemoryMlp::new(3, 1, 1);
        let w = [1.0f32, 0.0, 0.0, 2.0, -1.0, 0.5];
        let x = [1.0f32, 5.0, 5.0, -2.0, 0.0, 0.0];
        let (y, _) = m.forward(&w, &x, 2);
        assert_eq!(y, vec![2.0, -1.0, 0.5, -4.0, 2.0, -1.0]);
    }

    #[test]
    fn test_factorized_fd_gradient() {
        check_gradients(&FactorizedMemoryMlp::new(6, 2, 3), 4, 21, 1.0);
        check_gradients(&FactorizedMemoryMlp::new(5, 1, 2), 3, 22, 1.0);
    }
}

/// MLP memory: the default neural memory network.
///
/// z_0 = x @ W_0, z_i = gelu(z_{i-1}) @ W_i, y = z_{L-1}.
/// Dims run dim → hidden → … → hidden → dim; depth 1 is a single dim×dim
/// matrix (the linear key-value memory).
///
/// Backward is the usual chain: dW_i = a_i^T dz_i, da_i = dz_i W_i^T,
/// dz_{i-1} = da_i ⊙ gelu'(z_{i-1}).

use crate::memory_model::MemoryModel;
use crate::param_layout::ParamLayout;
use crate::tensor::{
    SimpleRng, matmul_f32, matmul_nt_f32, matmul_tn_acc_f32,
    gelu_f32, gelu_prime_f32,
};

#[derive(Clone, Debug)]
pub struct MemoryMlp {
    dim: usize,
    depth: usize,
    hidden: usize,
}

/// Forward intermediates.
pub struct MlpCache {
    pub n: usize,
    /// Input to each layer (x, then gelu of the previous pre-activation).
    pub layer_inputs: Vec<Vec<f32>>,
    /// Pre-activation output of each layer.
    pub pre_acts: Vec<Vec<f32>>,
}

impl MemoryMlp {
    pub fn new(dim: usize, depth: usize, hidden: usize) -> Self {
        assert!(depth >= 1);
        MemoryMlp { dim, depth, hidden }
    }

    /// Layer widths, length depth + 1.
    fn dims(&self) -> Vec<usize> {
        let mut dims = vec![self.dim];
        for _ in 1..self.depth {
            dims.push(self.hidden);
        }
        dims.push(self.dim);
        dims
    }
}

impl MemoryModel for MemoryMlp {
    type Cache = MlpCache;

    fn dim(&self) -> usize {
        self.dim
    }

    fn layout(&self) -> ParamLayout {
        let dims = self.dims();
        let mut layout = ParamLayout::new();
        for i in 0..self.depth {
            layout.push(format!("weights.{i}"), &[dims[i], dims[i + 1]]);
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

    fn forward(&self, weights: &[f32], x: &[f32], n: usize) -> (Vec<f32>, MlpCache) {
        debug_assert_eq!(x.len(), n * self.dim);
        let dims = self.dims();
        let layout = self.layout();

        let mut layer_inputs = Vec::with_capacity(self.depth);
        let mut pre_acts: Vec<Vec<f32>> = Vec::with_capacity(self.depth);
        for (i, e) in layout.entries().iter().enumerate() {
            let a = if i == 0 {
                x.to_vec()
            } else {
                pre_acts[i - 1].iter().map(|&z| gelu_f32(z)).collect()
            };
            let mut z = vec![0.0f32; n * dims[i + 1]];
            matmul_f32(&a, &weights[e.range()], &mut z, n, dims[i], dims[i + 1]);
            layer_inputs.push(a);
            pre_acts.push(z);
        }

        let y = pre_acts[self.depth - 1].clone();
        (y, MlpCache { n, layer_inputs, pre_acts })
    }

    fn backward(&self, weights: &[f32], cache: &MlpCache, d_y: &[f32]) -> Vec<f32> {
        let n = cache.n;
        let dims = self.dims();
        let layout = self.layout();
        let mut grads = vec![0.0f32; layout.numel()];

        let mut dz = d_y.to_vec();
        for i in (0..self.depth).rev() {
            let e = &layout.entries()[i];
            matmul_tn_acc_f32(&cache.layer_inputs[i], &dz, &mut grads[e.range()], n, dims[i], dims[i + 1]);
            if i > 0 {
                let mut da = vec![0.0f32; n * dims[i]];
                matmul_nt_f32(&dz, &weights[e.range()], &mut da, n, dims[i + 1], dims[i]);
                for (d, &z) in da.iter_mut().zip(cache.pre_acts[i - 1].iter()) {
                    *d *= gelu_prime_f32(z);
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
    fn test_mlp_layout() {
        let mlp = MemoryMlp::new(4, 2, 16);
        let layout = mlp.layout();
        assert_eq!(layout.len(), 2);
        assert_eq!(layout.entry("weights.0").unwrap().shape, vec![4, 16]);
        assert_eq!(layout.entry("weights.1").unwrap().shape, vec![16, 4]);
        assert_eq!(mlp.num_params(), 128);
    }

    #[test]
    fn test_depth_one_is_linear() {
        let mlp = MemoryMlp::new(2, 1, 99);
        assert_eq!(mlp.num_params(), 4);
        let w = [1.0f32, 2.0, 3.0, 4.0];
        let x = [1.0f32, 1.0, 0.5, 0.0];
        let (y, _) = mlp.forward(&w, &x, 2);
        assert_eq!(y, vec![4.0, 6.0, 0.5, 1.0]);
    }

    #[test]
    fn test_mlp_forward_deterministic() {
        let mlp = MemoryMlp::new(6, 3, 12);
        let mut rng = SimpleRng::new(42);
        let w = mlp.init_weights(&mut rng);
        let mut x = vec![0.0f32; 4 * 6];
        rng.fill_uniform(&mut x, 1.0);
        let (y1, _) = mlp.forward(&w, &x, 4);
        let (y2, _) = mlp.forward(&w, &x, 4);
        assert_eq!(y1, y2);
    }

    #[test]
    fn test_mlp_rows_independent() {
        // Each position is mapped on its own: evaluating one row alone
        // matches the batched result.
        let mlp = MemoryMlp::new(5, 2, 10);
        let mut rng = SimpleRng::new(8);
        let w = mlp.init_weights(&mut rng);
        let mut x = vec![0.0f32; 3 * 5];
        rng.fill_uniform(&mut x, 1.0);
        let (y, _) = mlp.forward(&w, &x, 3);
        let (y1, _) = mlp.forward(&w, &x[5..10], 1);
        assert_eq!(&y[5..10], y1.as_slice());
    }

    #[test]
    fn test_mlp_fd_gradient() {
        check_gradients(&MemoryMlp::new(6, 2, 12), 4, 11, 1.0);
        check_gradients(&MemoryMlp::new(5, 3, 7), 3, 12, 1.0);
    }
}

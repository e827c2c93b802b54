/// Gated-linear-unit MLP memory with a closing LayerNorm.
///
/// Per layer: [a, gate] = x @ W1 (split in half), x' = x + (a ⊙ silu(gate)) @ W2.
/// Output: LayerNorm(x_L) ⊙ (gamma + 1), gamma zero-initialized.

use crate::memory_model::MemoryModel;
use crate::param_layout::ParamLayout;
use crate::tensor::{
    SimpleRng, matmul_f32, matmul_acc_f32, matmul_nt_f32, matmul_tn_acc_f32,
    silu_f32, silu_prime_f32, layer_norm_f32, layer_norm_backward_f32,
};

#[derive(Clone, Debug)]
pub struct SwiGluMemoryMlp {
    dim: usize,
    depth: usize,
    /// Width of each GLU half.
    inner: usize,
}

struct LayerCache {
    x: Vec<f32>,
    /// x @ W1: [n, 2*inner]
    proj: Vec<f32>,
    /// a ⊙ silu(gate): [n, inner]
    gated: Vec<f32>,
}

pub struct SwiGluCache {
    n: usize,
    layers: Vec<LayerCache>,
    xhat: Vec<f32>,
    inv_std: Vec<f32>,
}

impl SwiGluMemoryMlp {
    pub fn new(dim: usize, depth: usize, inner: usize) -> Self {
        assert!(depth >= 1 && inner >= 1);
        SwiGluMemoryMlp { dim, depth, inner }
    }
}

impl MemoryModel for SwiGluMemoryMlp {
    type Cache = SwiGluCache;

    fn dim(&self) -> usize {
        self.dim
    }

    fn layout(&self) -> ParamLayout {
        let (d, k) = (self.dim, self.inner);
        let mut layout = ParamLayout::new();
        for i in 0..self.depth {
            layout.push(format!("weights.{i}.0"), &[d, 2 * k]);
            layout.push(format!("weights.{i}.1"), &[k, d]);
        }
        layout.push("norm.gamma", &[d]);
        layout
    }

    fn init_weights(&self, rng: &mut SimpleRng) -> Vec<f32> {
        let layout = self.layout();
        let mut w = vec![0.0f32; layout.numel()];
        for e in layout.entries() {
            if e.shape.len() == 2 {
                rng.fill_xavier(&mut w[e.range()], e.shape[0], e.shape[1]);
            }
        }
        w
    }

    fn forward(&self, weights: &[f32], x: &[f32], n: usize) -> (Vec<f32>, SwiGluCache) {
        let (d, k) = (self.dim, self.inner);
        debug_assert_eq!(x.len(), n * d);
        let layout = self.layout();
        let entries = layout.entries();

        let mut cur = x.to_vec();
        let mut layers = Vec::with_capacity(self.depth);
        for i in 0..self.depth {
            let (e1, e2) = (&entries[2 * i], &entries[2 * i + 1]);
            let mut proj = vec![0.0f32; n * 2 * k];
            matmul_f32(&cur, &weights[e1.range()], &mut proj, n, d, 2 * k);
            let mut gated = vec![0.0f32; n * k];
            for t in 0..n {
                for c in 0..k {
                    let a = proj[t * 2 * k + c];
                    let g = proj[t * 2 * k + k + c];
                    gated[t * k + c] = a * silu_f32(g);
                }
            }
            let mut next = cur.clone();
            matmul_acc_f32(&gated, &weights[e2.range()], &mut next, n, k, d);
            layers.push(LayerCache { x: cur, proj, gated });
            cur = next;
        }

        let gamma = &weights[entries[2 * self.depth].range()];
        let mut xhat = vec![0.0f32; n * d];
        let inv_std = layer_norm_f32(&cur, &mut xhat, n, d);
        let mut y = vec![0.0f32; n * d];
        for t in 0..n {
            for c in 0..d {
                y[t * d + c] = xhat[t * d + c] * (gamma[c] + 1.0);
            }
        }
        (y, SwiGluCache { n, layers, xhat, inv_std })
    }

    fn backward(&self, weights: &[f32], cache: &SwiGluCache, d_y: &[f32]) -> Vec<f32> {
        let (n, d, k) = (cache.n, self.dim, self.inner);
        let layout = self.layout();
        let entries = layout.entries();
        let mut grads = vec![0.0f32; layout.numel()];

        let eg = &entries[2 * self.depth];
        let gamma = &weights[eg.range()];
        let mut d_xhat = vec![0.0f32; n * d];
        {
            let d_gamma = &mut grads[eg.range()];
            for t in 0..n {
                for c in 0..d {
                    d_gamma[c] += d_y[t * d + c] * cache.xhat[t * d + c];
                    d_xhat[t * d + c] = d_y[t * d + c] * (gamma[c] + 1.0);
                }
            }
        }
        let mut dx = layer_norm_backward_f32(&cache.xhat, &cache.inv_std, &d_xhat, n, d);

        for i in (0..self.depth).rev() {
            let l = &cache.layers[i];
            let (e1, e2) = (&entries[2 * i], &entries[2 * i + 1]);

            matmul_tn_acc_f32(&l.gated, &dx, &mut grads[e2.range()], n, k, d);
            let mut d_gated = vec![0.0f32; n * k];
            matmul_nt_f32(&dx, &weights[e2.range()], &mut d_gated, n, d, k);

            let mut d_proj = vec![0.0f32; n * 2 * k];
            for t in 0..n {
                for c in 0..k {
                    let a = l.proj[t * 2 * k + c];
                    let g = l.proj[t * 2 * k + k + c];
                    let dg = d_gated[t * k + c];
                    d_proj[t * 2 * k + c] = dg * silu_f32(g);
                    d_proj[t * 2 * k + k + c] = dg * a * silu_prime_f32(g);
                }
            }
            matmul_tn_acc_f32(&l.x, &d_proj, &mut grads[e1.range()], n, d, 2 * k);

            if i > 0 {
                // residual path keeps dx, projection path adds d_proj @ W1^T
                let mut d_in = vec![0.0f32; n * d];
                matmul_nt_f32(&d_proj, &weights[e1.range()], &mut d_in, n, 2 * k, d);
                for j in 0..n * d {
                    dx[j] += d_in[j];
                }
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
    fn test_swiglu_layout_and_init() {
        let m = SwiGluMemoryMlp::new(6, 2, 4);
        let layout = m.layout();
        assert_eq!(layout.entry("weights.0.0").unwrap().shape, vec![6, 8]);
        assert_eq!(layout.entry("weights.1.1").unwrap().shape, vec![4, 6]);
        let mut rng = SimpleRng::new(2);
        let w = m.init_weights(&mut rng);
        assert!(layout.get("norm.gamma", &w).unwrap().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_swiglu_output_is_normalized() {
        let m = SwiGluMemoryMlp::new(8, 1, 5);
        let mut rng = SimpleRng::new(4);
        let w = m.init_weights(&mut rng);
        let mut x = vec![0.0f32; 3 * 8];
        rng.fill_uniform(&mut x, 2.0);
        let (y, _) = m.forward(&w, &x, 3);
        for t in 0..3 {
            let row = &y[t * 8..(t + 1) * 8];
            let mean: f32 = row.iter().sum::<f32>() / 8.0;
            assert!(mean.abs() < 1e-4, "row {t} mean {mean}");
        }
    }

    #[test]
    fn test_swiglu_fd_gradient() {
        check_gradients(&SwiGluMemoryMlp::new(5, 2, 4), 3, 51, 1.0);
    }
}

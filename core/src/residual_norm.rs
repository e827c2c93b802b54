/// Residual + LayerNorm wrapper around a memory network.
///
///   y = LayerNorm(inner(x)) ⊙ (gamma + 1) + x
///
/// gamma is a memory parameter (zero-initialized, appended after the
/// inner network's tensors as `norm.gamma`), so it is updated at test time
/// like every other weight. Keeps retrieved values on the input's scale
/// regardless of how far the inner weights drift.

use crate::memory_model::MemoryModel;
use crate::param_layout::ParamLayout;
use crate::tensor::{SimpleRng, layer_norm_f32, layer_norm_backward_f32};

#[derive(Clone, Debug)]
pub struct ResidualNorm<M> {
    pub inner: M,
}

pub struct ResidualNormCache<C> {
    inner: C,
    n: usize,
    xhat: Vec<f32>,
    inv_std: Vec<f32>,
}

impl<M: MemoryModel> ResidualNorm<M> {
    pub fn new(inner: M) -> Self {
        ResidualNorm { inner }
    }
}

impl<M: MemoryModel> MemoryModel for ResidualNorm<M> {
    type Cache = ResidualNormCache<M::Cache>;

    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn layout(&self) -> ParamLayout {
        let mut layout = self.inner.layout();
        layout.push("norm.gamma", &[self.inner.dim()]);
        layout
    }

    fn init_weights(&self, rng: &mut SimpleRng) -> Vec<f32> {
        let mut w = self.inner.init_weights(rng);
        w.extend(std::iter::repeat(0.0f32).take(self.inner.dim()));
        w
    }

    fn forward(&self, weights: &[f32], x: &[f32], n: usize) -> (Vec<f32>, Self::Cache) {
        let d = self.inner.dim();
        let split = weights.len() - d;
        let (inner_w, gamma) = weights.split_at(split);

        let (z, inner) = self.inner.forward(inner_w, x, n);
        let mut xhat = vec![0.0f32; n * d];
        let inv_std = layer_norm_f32(&z, &mut xhat, n, d);
        let mut y = vec![0.0f32; n * d];
        for t in 0..n {
            for c in 0..d {
                y[t * d + c] = xhat[t * d + c] * (gamma[c] + 1.0) + x[t * d + c];
            }
        }
        (y, ResidualNormCache { inner, n, xhat, inv_std })
    }

    fn backward(&self, weights: &[f32], cache: &Self::Cache, d_y: &[f32]) -> Vec<f32> {
        let d = self.inner.dim();
        let n = cache.n;
        let split = weights.len() - d;
        let (inner_w, gamma) = weights.split_at(split);

        let mut d_gamma = vec![0.0f32; d];
        let mut d_xhat = vec![0.0f32; n * d];
        for t in 0..n {
            for c in 0..d {
                d_gamma[c] += d_y[t * d + c] * cache.xhat[t * d + c];
                d_xhat[t * d + c] = d_y[t * d + c] * (gamma[c] + 1.0);
            }
        }
        let d_z = layer_norm_backward_f32(&cache.xhat, &cache.inv_std, &d_xhat, n, d);

        let mut grads = self.inner.backward(inner_w, &cache.inner, &d_z);
        grads.extend_from_slice(&d_gamma);
        grads
    }
}

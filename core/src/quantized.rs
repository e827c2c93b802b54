/// bf16 weight quantization around a memory network.
///
/// Forward evaluates the inner network with every weight rounded to bf16.
/// Backward is straight-through: gradients are taken at the rounded weights
/// and applied to the full-precision ones, so the trajectory itself stays f32.

use crate::memory_model::MemoryModel;
use crate::param_layout::ParamLayout;
use crate::tensor::{SimpleRng, truncate_to_bf16};

#[derive(Clone, Debug)]
pub struct Quantized<M> {
    pub inner: M,
}

pub struct QuantizedCache<C> {
    inner: C,
    rounded: Vec<f32>,
}

impl<M: MemoryModel> Quantized<M> {
    pub fn new(inner: M) -> Self {
        Quantized { inner }
    }
}

impl<M: MemoryModel> MemoryModel for Quantized<M> {
    type Cache = QuantizedCache<M::Cache>;

    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn layout(&self) -> ParamLayout {
        self.inner.layout()
    }

    fn init_weights(&self, rng: &mut SimpleRng) -> Vec<f32> {
        self.inner.init_weights(rng)
    }

    fn forward(&self, weights: &[f32], x: &[f32], n: usize) -> (Vec<f32>, Self::Cache) {
        let mut rounded = weights.to_vec();
        truncate_to_bf16(&mut rounded);
        let (y, inner) = self.inner.forward(&rounded, x, n);
        (y, QuantizedCache { inner, rounded })
    }

    fn backward(&self, _weights: &[f32], cache: &Self::Cache, d_y: &[f32]) -> Vec<f32> {
        self.inner.backward(&cache.rounded, &cache.inner, d_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_mlp::MemoryMlp;
    use crate::tensor::f32_to_bf16;

    #[test]
    fn test_quantized_matches_rounded_inner() {
        let inner = MemoryMlp::new(4, 2, 8);
        let q = Quantized::new(inner.clone());
        let mut rng = SimpleRng::new(5);
        let w = q.init_weights(&mut rng);
        let rounded: Vec<f32> = w.iter().map(|&v| f32_to_bf16(v)).collect();
        let mut x = vec![0.0f32; 2 * 4];
        rng.fill_uniform(&mut x, 1.0);

        let (yq, cq) = q.forward(&w, &x, 2);
        let (yr, cr) = inner.forward(&rounded, &x, 2);
        assert_eq!(yq, yr);

        let d_y = vec![0.5f32; 8];
        assert_eq!(q.backward(&w, &cq, &d_y), inner.backward(&rounded, &cr, &d_y));
    }

    #[test]
    fn test_quantized_differs_from_full_precision() {
        let inner = MemoryMlp::new(4, 1, 4);
        let q = Quantized::new(inner.clone());
        let w: Vec<f32> = (0..16).map(|i| 0.1 + i as f32 * 1.0e-3).collect();
        let x = [1.0f32, 1.0, 1.0, 1.0];
        let (yq, _) = q.forward(&w, &x, 1);
        let (yf, _) = inner.forward(&w, &x, 1);
        let diff: f32 = yq.iter().zip(yf.iter()).map(|(a, b)| (a - b).abs()).sum();
        assert!(diff > 0.0 && diff < 1e-2, "diff={diff}");
    }
}

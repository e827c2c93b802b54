/// The memory network abstraction.
///
/// A memory model is a pure function of an explicit flat weight vector:
/// `forward(weights, x)` never reads hidden state, so the engine can evaluate
/// it at any snapshot of a weight trajectory. Gradients are closed-form and
/// hand-derived per variant; `backward` returns dL/dweights summed over the
/// positions of the call, with per-position loss weighting carried by `d_y`.
///
/// Static dispatch only: `MemoryNetwork` is the runtime-selected enum.

use crate::config::{MemoryModelKind, NeuralMemoryConfig};
use crate::param_layout::ParamLayout;
use crate::tensor::SimpleRng;
use crate::memory_mlp::{MemoryMlp, MlpCache};
use crate::factorized_mlp::{FactorizedMemoryMlp, FactorizedCache};
use crate::gated_residual_mlp::{GatedResidualMemoryMlp, GatedResidualCache};
use crate::swiglu_mlp::{SwiGluMemoryMlp, SwiGluCache};
use crate::memory_attention::{MemoryAttention, AttentionCache};
use crate::residual_norm::{ResidualNorm, ResidualNormCache};
use crate::quantized::{Quantized, QuantizedCache};

/// A learnable associative map `[n, dim] → [n, dim]` with explicit weights.
pub trait MemoryModel {
    /// Forward intermediates needed by `backward`.
    type Cache;

    /// Token width in and out.
    fn dim(&self) -> usize;

    /// Named tensors in the flat weight vector.
    fn layout(&self) -> ParamLayout;

    fn num_params(&self) -> usize {
        self.layout().numel()
    }

    /// Fresh weights: xavier-uniform matrices, zero `gamma`s.
    fn init_weights(&self, rng: &mut SimpleRng) -> Vec<f32>;

    /// Per-position outputs for `n` input rows.
    fn forward(&self, weights: &[f32], x: &[f32], n: usize) -> (Vec<f32>, Self::Cache);

    /// dL/dweights given dL/dy for every position of the forward call.
    fn backward(&self, weights: &[f32], cache: &Self::Cache, d_y: &[f32]) -> Vec<f32>;
}

// ── Base networks ───────────────────────────────────────────────────

/// Architectures selectable by [`MemoryModelKind`].
#[derive(Clone, Debug)]
pub enum BaseNetwork {
    Mlp(MemoryMlp),
    Factorized(FactorizedMemoryMlp),
    GatedResidual(GatedResidualMemoryMlp),
    SwiGlu(SwiGluMemoryMlp),
    Attention(MemoryAttention),
}

pub enum BaseCache {
    Mlp(MlpCache),
    Factorized(FactorizedCache),
    GatedResidual(GatedResidualCache),
    SwiGlu(SwiGluCache),
    Attention(AttentionCache),
}

impl BaseNetwork {
    pub fn from_kind(kind: &MemoryModelKind, dim: usize) -> Self {
        let hidden = |ef: f32| ((dim as f32 * ef) as usize).max(1);
        match *kind {
            MemoryModelKind::Mlp { depth, expansion_factor } =>
                BaseNetwork::Mlp(MemoryMlp::new(dim, depth, hidden(expansion_factor))),
            MemoryModelKind::FactorizedMlp { depth, rank } =>
                BaseNetwork::Factorized(FactorizedMemoryMlp::new(dim, depth, rank)),
            MemoryModelKind::GatedResidualMlp { depth, expansion_factor } =>
                BaseNetwork::GatedResidual(GatedResidualMemoryMlp::new(dim, depth, hidden(expansion_factor))),
            MemoryModelKind::SwiGluMlp { depth, expansion_factor } =>
                BaseNetwork::SwiGlu(SwiGluMemoryMlp::new(dim, depth, hidden(expansion_factor * 2.0 / 3.0))),
            MemoryModelKind::Attention { scale, expansion_factor } =>
                BaseNetwork::Attention(MemoryAttention::new(dim, scale, hidden(expansion_factor))),
        }
    }
}

impl MemoryModel for BaseNetwork {
    type Cache = BaseCache;

    fn dim(&self) -> usize {
        match self {
            BaseNetwork::Mlp(m) => m.dim(),
            BaseNetwork::Factorized(m) => m.dim(),
            BaseNetwork::GatedResidual(m) => m.dim(),
            BaseNetwork::SwiGlu(m) => m.dim(),
            BaseNetwork::Attention(m) => m.dim(),
        }
    }

    fn layout(&self) -> ParamLayout {
        match self {
            BaseNetwork::Mlp(m) => m.layout(),
            BaseNetwork::Factorized(m) => m.layout(),
            BaseNetwork::GatedResidual(m) => m.layout(),
            BaseNetwork::SwiGlu(m) => m.layout(),
            BaseNetwork::Attention(m) => m.layout(),
        }
    }

    fn init_weights(&self, rng: &mut SimpleRng) -> Vec<f32> {
        match self {
            BaseNetwork::Mlp(m) => m.init_weights(rng),
            BaseNetwork::Factorized(m) => m.init_weights(rng),
            BaseNetwork::GatedResidual(m) => m.init_weights(rng),
            BaseNetwork::SwiGlu(m) => m.init_weights(rng),
            BaseNetwork::Attention(m) => m.init_weights(rng),
        }
    }

    fn forward(&self, weights: &[f32], x: &[f32], n: usize) -> (Vec<f32>, BaseCache) {
        match self {
            BaseNetwork::Mlp(m) => {
                let (y, c) = m.forward(weights, x, n);
                (y, BaseCache::Mlp(c))
            }
            BaseNetwork::Factorized(m) => {
                let (y, c) = m.forward(weights, x, n);
                (y, BaseCache::Factorized(c))
            }
            BaseNetwork::GatedResidual(m) => {
                let (y, c) = m.forward(weights, x, n);
                (y, BaseCache::GatedResidual(c))
            }
            BaseNetwork::SwiGlu(m) => {
                let (y, c) = m.forward(weights, x, n);
                (y, BaseCache::SwiGlu(c))
            }
            BaseNetwork::Attention(m) => {
                let (y, c) = m.forward(weights, x, n);
                (y, BaseCache::Attention(c))
            }
        }
    }

    fn backward(&self, weights: &[f32], cache: &BaseCache, d_y: &[f32]) -> Vec<f32> {
        match (self, cache) {
            (BaseNetwork::Mlp(m), BaseCache::Mlp(c)) => m.backward(weights, c, d_y),
            (BaseNetwork::Factorized(m), BaseCache::Factorized(c)) => m.backward(weights, c, d_y),
            (BaseNetwork::GatedResidual(m), BaseCache::GatedResidual(c)) => m.backward(weights, c, d_y),
            (BaseNetwork::SwiGlu(m), BaseCache::SwiGlu(c)) => m.backward(weights, c, d_y),
            (BaseNetwork::Attention(m), BaseCache::Attention(c)) => m.backward(weights, c, d_y),
            _ => unreachable!("cache produced by a different memory network"),
        }
    }
}

// ── Composed network ────────────────────────────────────────────────

/// Base network plus the optional residual-norm and bf16 wrappers.
#[derive(Clone, Debug)]
pub enum MemoryNetwork {
    Plain(BaseNetwork),
    Residual(ResidualNorm<BaseNetwork>),
    Quantized(Quantized<BaseNetwork>),
    QuantizedResidual(Quantized<ResidualNorm<BaseNetwork>>),
}

pub enum NetworkCache {
    Plain(BaseCache),
    Residual(ResidualNormCache<BaseCache>),
    Quantized(QuantizedCache<BaseCache>),
    QuantizedResidual(QuantizedCache<ResidualNormCache<BaseCache>>),
}

impl MemoryNetwork {
    /// Per-head network described by the engine configuration.
    pub fn from_config(cfg: &NeuralMemoryConfig) -> Self {
        let base = BaseNetwork::from_kind(&cfg.model, cfg.dim_head());
        match (cfg.mem_model_norm_add_residual, cfg.quantize_memory_weights) {
            (false, false) => MemoryNetwork::Plain(base),
            (true, false) => MemoryNetwork::Residual(ResidualNorm::new(base)),
            (false, true) => MemoryNetwork::Quantized(Quantized::new(base)),
            (true, true) => MemoryNetwork::QuantizedResidual(Quantized::new(ResidualNorm::new(base))),
        }
    }

    /// Attention memory mixes positions, so its output depends on which
    /// tokens are evaluated together.
    pub fn mixes_positions(&self) -> bool {
        let base = match self {
            MemoryNetwork::Plain(b) => b,
            MemoryNetwork::Residual(r) => &r.inner,
            MemoryNetwork::Quantized(q) => &q.inner,
            MemoryNetwork::QuantizedResidual(q) => &q.inner.inner,
        };
        matches!(base, BaseNetwork::Attention(_))
    }
}

impl MemoryModel for MemoryNetwork {
    type Cache = NetworkCache;

    fn dim(&self) -> usize {
        match self {
            MemoryNetwork::Plain(m) => m.dim(),
            MemoryNetwork::Residual(m) => m.dim(),
            MemoryNetwork::Quantized(m) => m.dim(),
            MemoryNetwork::QuantizedResidual(m) => m.dim(),
        }
    }

    fn layout(&self) -> ParamLayout {
        match self {
            MemoryNetwork::Plain(m) => m.layout(),
            MemoryNetwork::Residual(m) => m.layout(),
            MemoryNetwork::Quantized(m) => m.layout(),
            MemoryNetwork::QuantizedResidual(m) => m.layout(),
        }
    }

    fn init_weights(&self, rng: &mut SimpleRng) -> Vec<f32> {
        match self {
            MemoryNetwork::Plain(m) => m.init_weights(rng),
            MemoryNetwork::Residual(m) => m.init_weights(rng),
            MemoryNetwork::Quantized(m) => m.init_weights(rng),
            MemoryNetwork::QuantizedResidual(m) => m.init_weights(rng),
        }
    }

    fn forward(&self, weights: &[f32], x: &[f32], n: usize) -> (Vec<f32>, NetworkCache) {
        match self {
            MemoryNetwork::Plain(m) => {
                let (y, c) = m.forward(weights, x, n);
                (y, NetworkCache::Plain(c))
            }
            MemoryNetwork::Residual(m) => {
                let (y, c) = m.forward(weights, x, n);
                (y, NetworkCache::Residual(c))
            }
            MemoryNetwork::Quantized(m) => {
                let (y, c) = m.forward(weights, x, n);
                (y, NetworkCache::Quantized(c))
            }
            MemoryNetwork::QuantizedResidual(m) => {
                let (y, c) = m.forward(weights, x, n);
                (y, NetworkCache::QuantizedResidual(c))
            }
        }
    }

    fn backward(&self, weights: &[f32], cache: &NetworkCache, d_y: &[f32]) -> Vec<f32> {
        match (self, cache) {
            (MemoryNetwork::Plain(m), NetworkCache::Plain(c)) => m.backward(weights, c, d_y),
            (MemoryNetwork::Residual(m), NetworkCache::Residual(c)) => m.backward(weights, c, d_y),
            (MemoryNetwork::Quantized(m), NetworkCache::Quantized(c)) => m.backward(weights, c, d_y),
            (MemoryNetwork::QuantizedResidual(m), NetworkCache::QuantizedResidual(c)) =>
                m.backward(weights, c, d_y),
            _ => unreachable!("cache produced by a different memory network"),
        }
    }
}

// ── Gradient checking (tests) ───────────────────────────────────────

/// Central finite-difference check of `backward` against
/// L = Σ coef ⊙ forward(weights, x), over a strided subset of weights.
#[cfg(test)]
pub(crate) fn check_gradients<M: MemoryModel>(model: &M, n: usize, seed: u64, input_scale: f32) {
    let dim = model.dim();
    let mut rng = SimpleRng::new(seed);
    let mut weights = model.init_weights(&mut rng);
    // Perturb zero-initialized gammas so their gradients are exercised too.
    for w in weights.iter_mut() {
        if *w == 0.0 {
            *w = rng.uniform(0.2);
        }
    }
    let mut x = vec![0.0f32; n * dim];
    rng.fill_uniform(&mut x, input_scale);
    let mut coef = vec![0.0f32; n * dim];
    rng.fill_uniform(&mut coef, 1.0);

    let loss = |w: &[f32]| -> f64 {
        let (y, _) = model.forward(w, &x, n);
        y.iter().zip(coef.iter()).map(|(&a, &b)| a as f64 * b as f64).sum()
    };

    let (_, cache) = model.forward(&weights, &x, n);
    let grad = model.backward(&weights, &cache, &coef);
    assert_eq!(grad.len(), weights.len());

    let eps = 1e-2f32;
    let stride = (weights.len() / 97).max(1);
    let mut checked = 0;
    for i in (0..weights.len()).step_by(stride) {
        let orig = weights[i];
        weights[i] = orig + eps;
        let lp = loss(&weights);
        weights[i] = orig - eps;
        let lm = loss(&weights);
        weights[i] = orig;
        let fd = ((lp - lm) / (2.0 * eps as f64)) as f32;
        let tol = 5e-3 + 0.05 * fd.abs();
        assert!((grad[i] - fd).abs() <= tol,
            "weight {i}: analytic={}, fd={fd}", grad[i]);
        checked += 1;
    }
    assert!(checked > 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NeuralMemoryConfig;

    #[test]
    fn test_from_config_wrappers() {
        let cfg = NeuralMemoryConfig::test_config();
        let net = MemoryNetwork::from_config(&cfg);
        assert!(matches!(net, MemoryNetwork::Residual(_)));
        assert_eq!(net.dim(), 8);
        // Residual norm appends a gamma after the MLP weights
        let layout = net.layout();
        assert_eq!(layout.entries().last().unwrap().name, "norm.gamma");

        let plain = MemoryNetwork::from_config(&NeuralMemoryConfig {
            mem_model_norm_add_residual: false,
            ..cfg.clone()
        });
        assert_eq!(plain.num_params() + 8, net.num_params());

        let quant = MemoryNetwork::from_config(&NeuralMemoryConfig {
            quantize_memory_weights: true,
            ..cfg
        });
        assert!(matches!(quant, MemoryNetwork::QuantizedResidual(_)));
        assert_eq!(quant.num_params(), net.num_params());
    }

    #[test]
    fn test_mixes_positions() {
        let mut cfg = NeuralMemoryConfig::test_config();
        assert!(!MemoryNetwork::from_config(&cfg).mixes_positions());
        cfg.model = MemoryModelKind::Attention { scale: 8.0, expansion_factor: 2.0 };
        assert!(MemoryNetwork::from_config(&cfg).mixes_positions());
    }

    #[test]
    fn test_every_kind_shapes_and_gradients() {
        let kinds = [
            MemoryModelKind::Mlp { depth: 1, expansion_factor: 1.0 },
            MemoryModelKind::Mlp { depth: 3, expansion_factor: 2.0 },
            MemoryModelKind::FactorizedMlp { depth: 2, rank: 3 },
            MemoryModelKind::GatedResidualMlp { depth: 2, expansion_factor: 2.0 },
            MemoryModelKind::SwiGluMlp { depth: 2, expansion_factor: 3.0 },
            MemoryModelKind::Attention { scale: 1.0, expansion_factor: 2.0 },
        ];
        for (i, kind) in kinds.iter().enumerate() {
            let cfg = NeuralMemoryConfig {
                model: *kind,
                ..NeuralMemoryConfig::test_config()
            };
            let net = MemoryNetwork::from_config(&cfg);
            let mut rng = SimpleRng::new(3);
            let w = net.init_weights(&mut rng);
            assert_eq!(w.len(), net.num_params(), "{kind:?}");
            let x = vec![0.1f32; 5 * net.dim()];
            let (y, _) = net.forward(&w, &x, 5);
            assert_eq!(y.len(), x.len(), "{kind:?}");
            assert!(y.iter().all(|v| v.is_finite()), "{kind:?}");
            check_gradients(&net, 5, 40 + i as u64, 0.8);
        }
    }
}

/// Neural memory configuration: immutable after construction.
///
/// Every option that changes the numerical path lives here. Validation
/// happens once (`validate`, called by `NeuralMemory::new`), so call-time
/// code can assume a consistent configuration.

use serde::{Serialize, Deserialize};
use crate::error::{ConfigError, MemoryError};
use crate::tensor::{gelu_f32, silu_f32};

/// Chunk granularity for storing (writing) and retrieving (reading).
///
/// `Uniform(c)` uses one size for both. `Split` decouples them; the two
/// sizes must divide one another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkSize {
    Uniform(usize),
    Split { retrieve: usize, store: usize },
}

impl ChunkSize {
    pub fn store(&self) -> usize {
        match *self {
            ChunkSize::Uniform(c) => c,
            ChunkSize::Split { store, .. } => store,
        }
    }

    pub fn retrieve(&self) -> usize {
        match *self {
            ChunkSize::Uniform(c) => c,
            ChunkSize::Split { retrieve, .. } => retrieve,
        }
    }
}

/// Architecture of the per-head memory network.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryModelKind {
    /// `dim → hidden → … → dim`, GELU between layers. `depth = 1` is a linear map.
    Mlp { depth: usize, expansion_factor: f32 },
    /// Each layer factored as `[dim, rank] @ [rank, dim]`.
    FactorizedMlp { depth: usize, rank: usize },
    /// Residual blocks with a learned sigmoid interpolation gate.
    GatedResidualMlp { depth: usize, expansion_factor: f32 },
    /// Residual gated-linear-unit blocks followed by a LayerNorm.
    SwiGluMlp { depth: usize, expansion_factor: f32 },
    /// Causal single-head softmax attention plus a feed-forward branch.
    Attention { scale: f32, expansion_factor: f32 },
}

impl Default for MemoryModelKind {
    fn default() -> Self {
        MemoryModelKind::Mlp { depth: 2, expansion_factor: 4.0 }
    }
}

impl MemoryModelKind {
    fn validate(&self, dim: usize) -> Result<(), ConfigError> {
        let hidden_ok = |ef: f32| ef.is_finite() && ef > 0.0 && (dim as f32 * ef) as usize >= 1;
        let ok = match *self {
            MemoryModelKind::Mlp { depth, expansion_factor }
            | MemoryModelKind::GatedResidualMlp { depth, expansion_factor } => {
                depth >= 1 && hidden_ok(expansion_factor)
            }
            MemoryModelKind::SwiGluMlp { depth, expansion_factor } => {
                depth >= 1 && hidden_ok(expansion_factor * 2.0 / 3.0)
            }
            MemoryModelKind::FactorizedMlp { depth, rank } => depth >= 1 && rank >= 1,
            MemoryModelKind::Attention { scale, expansion_factor } => {
                scale.is_finite() && hidden_ok(expansion_factor)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(ConfigError::UnsupportedModel(format!("{self:?} for dim_head={dim}")))
        }
    }
}

/// Output activation applied to retrieved values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Identity,
    Silu,
    Gelu,
    Tanh,
    Relu,
}

impl Activation {
    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Silu => silu_f32(x),
            Activation::Gelu => gelu_f32(x),
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
        }
    }
}

/// Full engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuralMemoryConfig {
    /// Model width of input/output tokens.
    pub dim: usize,
    pub chunk_size: ChunkSize,
    /// Store chunks are scanned in groups of this many tokens. Performance
    /// knob only; outputs are identical for every value.
    pub batch_size: Option<usize>,
    /// Per-head memory width. Defaults to `dim`.
    pub dim_head: Option<usize>,
    pub heads: usize,
    pub model: MemoryModelKind,
    /// Wrap the memory network as `LayerNorm(model(x)) * (gamma + 1) + x`.
    pub mem_model_norm_add_residual: bool,
    /// Evaluate the memory network with bf16-rounded weights.
    pub quantize_memory_weights: bool,
    pub momentum: bool,
    pub momentum_order: usize,
    /// Update with a learned softmax mix of the momentum orders instead of
    /// the last order alone.
    pub learned_momentum_combine: bool,
    /// Give the raw surprise its own weight in that mix.
    pub learned_combine_include_zeroth: bool,
    pub qk_rmsnorm: bool,
    pub pre_rmsnorm: bool,
    pub post_rmsnorm: bool,
    /// Soft clamp on each named gradient tensor's L2 norm.
    pub max_grad_norm: Option<f32>,
    pub per_parameter_lr_modulation: bool,
    pub max_mem_layer_modulation: f32,
    /// Attention pooling (instead of mean) for chunk representations.
    pub attn_pool_chunks: bool,
    /// Mix another instance's weight trajectory into the surprise weights.
    pub accept_weight_residual: bool,
    pub activation: Activation,
    /// Adaptive learning rate is `sigmoid(·) * max_lr`.
    pub max_lr: f32,
    pub init_adaptive_step_bias: Option<f32>,
    pub init_momentum_bias: Option<f32>,
    pub init_decay_bias: Option<f32>,
    /// Sample independent initial memory weights for every head.
    pub per_head_learned_parameters: bool,
    /// Re-anchor the surprise gradient at the committed weights every this
    /// many tokens (test-time-training mini batches). `None` keeps the
    /// initial weights as the anchor.
    pub weight_refresh_interval: Option<usize>,
}

impl Default for NeuralMemoryConfig {
    fn default() -> Self {
        NeuralMemoryConfig::new(64)
    }
}

impl NeuralMemoryConfig {
    /// Defaults for a given model width.
    pub fn new(dim: usize) -> Self {
        NeuralMemoryConfig {
            dim,
            chunk_size: ChunkSize::Uniform(1),
            batch_size: None,
            dim_head: None,
            heads: 1,
            model: MemoryModelKind::default(),
            mem_model_norm_add_residual: true,
            quantize_memory_weights: false,
            momentum: true,
            momentum_order: 1,
            learned_momentum_combine: false,
            learned_combine_include_zeroth: false,
            qk_rmsnorm: false,
            pre_rmsnorm: true,
            post_rmsnorm: false,
            max_grad_norm: None,
            per_parameter_lr_modulation: false,
            max_mem_layer_modulation: 1.0,
            attn_pool_chunks: false,
            accept_weight_residual: false,
            activation: Activation::Identity,
            max_lr: 1.0,
            init_adaptive_step_bias: None,
            init_momentum_bias: None,
            init_decay_bias: None,
            per_head_learned_parameters: true,
            weight_refresh_interval: None,
        }
    }

    /// Test configuration: tiny two-head model for fast iteration.
    pub fn test_config() -> Self {
        NeuralMemoryConfig {
            chunk_size: ChunkSize::Uniform(4),
            dim_head: Some(8),
            heads: 2,
            model: MemoryModelKind::Mlp { depth: 2, expansion_factor: 2.0 },
            ..NeuralMemoryConfig::new(16)
        }
    }

    /// Parse a JSON configuration and validate it.
    pub fn from_json(json: &str) -> Result<Self, MemoryError> {
        let cfg: NeuralMemoryConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String, MemoryError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn dim_head(&self) -> usize {
        self.dim_head.unwrap_or(self.dim)
    }

    /// Width of the concatenated heads: `heads * dim_head`.
    pub fn inner_dim(&self) -> usize {
        self.heads * self.dim_head()
    }

    pub fn store_chunk(&self) -> usize {
        self.chunk_size.store()
    }

    pub fn retrieve_chunk(&self) -> usize {
        self.chunk_size.retrieve()
    }

    /// Heads are merged through a learned projection unless the single
    /// head already has model width.
    pub fn has_combine_heads(&self) -> bool {
        self.heads > 1 || self.dim_head() != self.dim
    }

    /// Number of stacked momentum buffers carried in the state.
    pub fn momentum_buffers(&self) -> usize {
        if self.momentum { self.momentum_order } else { 0 }
    }

    /// Terms in the learned momentum mix; 0 when the last order is used.
    pub fn momentum_combine_terms(&self) -> usize {
        if self.momentum && self.learned_momentum_combine {
            self.momentum_order + usize::from(self.learned_combine_include_zeroth)
        } else {
            0
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dim == 0 {
            return Err(ConfigError::InvalidOption("dim must be at least 1".into()));
        }
        if self.heads == 0 || self.dim_head() == 0 {
            return Err(ConfigError::InvalidOption("heads and dim_head must be at least 1".into()));
        }

        let store = self.store_chunk();
        let retrieve = self.retrieve_chunk();
        for c in [store, retrieve] {
            if c == 0 {
                return Err(ConfigError::InvalidChunkSize(c));
            }
        }
        if retrieve % store != 0 && store % retrieve != 0 {
            return Err(ConfigError::IncompatibleChunkSizes { retrieve, store });
        }

        for (name, knob) in [
            ("batch_size", self.batch_size),
            ("weight_refresh_interval", self.weight_refresh_interval),
        ] {
            if let Some(n) = knob {
                if n == 0 || n % store != 0 {
                    return Err(ConfigError::InvalidOption(format!(
                        "{name}={n} must be a positive multiple of the store chunk size {store}"
                    )));
                }
            }
        }

        if self.attn_pool_chunks && store == 1 {
            return Err(ConfigError::InvalidOption(
                "attn_pool_chunks requires a store chunk size greater than 1".into(),
            ));
        }
        if self.momentum && self.momentum_order == 0 {
            return Err(ConfigError::InvalidOption("momentum_order must be at least 1".into()));
        }
        if self.learned_momentum_combine && !self.momentum {
            return Err(ConfigError::InvalidOption("learned_momentum_combine requires momentum".into()));
        }
        if let Some(m) = self.max_grad_norm {
            if !(m.is_finite() && m > 0.0) {
                return Err(ConfigError::InvalidOption(format!("max_grad_norm={m} must be positive")));
            }
        }
        if !(self.max_lr.is_finite() && self.max_lr >= 0.0) {
            return Err(ConfigError::InvalidOption(format!("max_lr={} must be non-negative", self.max_lr)));
        }
        if self.per_parameter_lr_modulation
            && !(self.max_mem_layer_modulation.is_finite() && self.max_mem_layer_modulation > 0.0)
        {
            return Err(ConfigError::InvalidOption(format!(
                "max_mem_layer_modulation={} must be positive",
                self.max_mem_layer_modulation
            )));
        }

        self.model.validate(self.dim_head())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(NeuralMemoryConfig::new(32).validate().is_ok());
        assert!(NeuralMemoryConfig::test_config().validate().is_ok());
        let cfg = NeuralMemoryConfig::new(32);
        assert_eq!(cfg.dim_head(), 32);
        assert_eq!(cfg.inner_dim(), 32);
        assert!(!cfg.has_combine_heads());
    }

    #[test]
    fn test_zero_chunk_rejected() {
        let cfg = NeuralMemoryConfig { chunk_size: ChunkSize::Uniform(0), ..NeuralMemoryConfig::new(8) };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidChunkSize(0)));
    }

    #[test]
    fn test_incompatible_split_rejected() {
        let cfg = NeuralMemoryConfig {
            chunk_size: ChunkSize::Split { retrieve: 3, store: 2 },
            ..NeuralMemoryConfig::new(8)
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::IncompatibleChunkSizes { retrieve: 3, store: 2 })
        );
        let ok = NeuralMemoryConfig {
            chunk_size: ChunkSize::Split { retrieve: 4, store: 2 },
            ..NeuralMemoryConfig::new(8)
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_attn_pool_requires_chunks() {
        let cfg = NeuralMemoryConfig { attn_pool_chunks: true, ..NeuralMemoryConfig::new(8) };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidOption(_))));
    }

    #[test]
    fn test_momentum_combine_terms() {
        let base = NeuralMemoryConfig { momentum_order: 3, ..NeuralMemoryConfig::test_config() };
        assert_eq!(base.momentum_combine_terms(), 0);
        let mixed = NeuralMemoryConfig { learned_momentum_combine: true, ..base.clone() };
        assert_eq!(mixed.momentum_combine_terms(), 3);
        let zeroth = NeuralMemoryConfig { learned_combine_include_zeroth: true, ..mixed.clone() };
        assert_eq!(zeroth.momentum_combine_terms(), 4);

        let no_momentum = NeuralMemoryConfig { momentum: false, ..mixed };
        assert!(matches!(no_momentum.validate(), Err(ConfigError::InvalidOption(_))));
    }

    #[test]
    fn test_batch_size_must_align_with_store_chunk() {
        let cfg = NeuralMemoryConfig {
            chunk_size: ChunkSize::Uniform(4),
            batch_size: Some(6),
            ..NeuralMemoryConfig::new(8)
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidOption(_))));
    }

    #[test]
    fn test_degenerate_model_rejected() {
        let cfg = NeuralMemoryConfig {
            model: MemoryModelKind::Mlp { depth: 0, expansion_factor: 4.0 },
            ..NeuralMemoryConfig::new(8)
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::UnsupportedModel(_))));
    }

    #[test]
    fn test_json_partial_uses_defaults() {
        let cfg = NeuralMemoryConfig::from_json(
            r#"{"dim": 24, "chunk_size": {"retrieve": 8, "store": 4},
                "model": {"kind": "factorized_mlp", "depth": 2, "rank": 3},
                "activation": "silu"}"#,
        ).unwrap();
        assert_eq!(cfg.dim, 24);
        assert_eq!(cfg.store_chunk(), 4);
        assert_eq!(cfg.retrieve_chunk(), 8);
        assert_eq!(cfg.model, MemoryModelKind::FactorizedMlp { depth: 2, rank: 3 });
        assert_eq!(cfg.activation, Activation::Silu);
        assert!(cfg.momentum);
        assert!(cfg.pre_rmsnorm);
    }

    #[test]
    fn test_json_invalid_config_is_an_error() {
        let err = NeuralMemoryConfig::from_json(r#"{"dim": 8, "chunk_size": 0}"#).unwrap_err();
        assert_eq!(err, MemoryError::Config(ConfigError::InvalidChunkSize(0)));
        let err = NeuralMemoryConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, MemoryError::ConfigParse(_)));
    }

    #[test]
    fn test_json_round_trip() {
        let cfg = NeuralMemoryConfig::test_config();
        let json = cfg.to_json().unwrap();
        let back = NeuralMemoryConfig::from_json(&json).unwrap();
        assert_eq!(cfg, back);
    }
}

/// MAC (Memory As Context) block.
///
/// Architecture (per layer):
///   retrieved = memory(x)                   (neural memory read + write)
///   h = x + sigmoid(gate) ⊙ retrieved       (scalar or per-channel gate)
///   y = h + attn(h)                         (any causal context attention)
///
/// Incremental decoding interleaves one `process_one_step` call on the
/// memory with one `step` on the attention's cache. Because the memory only
/// exposes chunks completed at or before each token, decoding token by token
/// reproduces `forward` on the whole sequence.

use serde::{Serialize, Deserialize};
use tracing::trace;

use crate::error::MemoryError;
use crate::neural_memory::{MemoryState, NeuralMemory};
use crate::param_layout::WeightTrajectory;
use crate::tensor::sigmoid_f32;

/// Causal attention over a token stream, with a one-token decode path.
pub trait ContextAttention {
    type Cache;

    fn dim(&self) -> usize;

    /// Full causal pass over `n` rows of `x`: [n, dim] → [n, dim].
    fn forward(&self, x: &[f32], n: usize) -> Vec<f32>;

    fn init_cache(&self) -> Self::Cache;

    /// Next position given everything already in `cache`. Must equal the
    /// corresponding row of `forward` on the full prefix.
    fn step(&self, token: &[f32], cache: &mut Self::Cache) -> Vec<f32>;
}

/// Learned gate on the retrieved memory (pre-sigmoid logits).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ContextGate {
    Scalar(f32),
    Channel(Vec<f32>),
}

impl ContextGate {
    fn value(&self, c: usize) -> f32 {
        match self {
            ContextGate::Scalar(g) => sigmoid_f32(*g),
            ContextGate::Channel(g) => sigmoid_f32(g[c]),
        }
    }
}

/// Decode-time state: the memory's threaded state and the attention cache.
pub struct BlockDecodeCache<C> {
    pub memory: MemoryState,
    pub attention: C,
}

pub struct MemoryAsContextBlock<A> {
    pub memory: NeuralMemory,
    pub attention: A,
    pub gate: ContextGate,
}

impl<A: ContextAttention> MemoryAsContextBlock<A> {
    pub fn new(memory: NeuralMemory, attention: A, gate: ContextGate) -> Result<Self, MemoryError> {
        let dim = memory.config().dim;
        if attention.dim() != dim {
            return Err(MemoryError::ShapeMismatch { what: "attention dim", expected: dim, found: attention.dim() });
        }
        if let ContextGate::Channel(g) = &gate {
            if g.len() != dim {
                return Err(MemoryError::ShapeMismatch { what: "context gate", expected: dim, found: g.len() });
            }
        }
        Ok(MemoryAsContextBlock { memory, attention, gate })
    }

    /// Whole-segment pass. Returns the block output and the memory state to
    /// thread into the next segment.
    pub fn forward(
        &self,
        x: &[f32],
        state: Option<MemoryState>,
        prev_weights: Option<&WeightTrajectory>,
    ) -> Result<(Vec<f32>, MemoryState), MemoryError> {
        let d = self.memory.config().dim;
        let (retrieved, state) = self.memory.process(x, state, prev_weights, None)?;
        let n = x.len() / d;
        let h = self.inject(x, &retrieved);
        let attn = self.attention.forward(&h, n);
        let y = h.iter().zip(attn.iter()).map(|(a, b)| a + b).collect();
        Ok((y, state))
    }

    pub fn init_decode_cache(&self) -> BlockDecodeCache<A::Cache> {
        BlockDecodeCache { memory: self.memory.init_state(), attention: self.attention.init_cache() }
    }

    /// One token through memory and attention, updating `cache` in place.
    /// On error `cache` is left untouched.
    pub fn decode_step(
        &self,
        token: &[f32],
        cache: &mut BlockDecodeCache<A::Cache>,
    ) -> Result<Vec<f32>, MemoryError> {
        let (retrieved, state) = self.memory.process_one_step(token, cache.memory.clone())?;
        cache.memory = state;
        trace!(seq_index = cache.memory.seq_index, "mac decode step");

        let h = self.inject(token, &retrieved);
        let attn = self.attention.step(&h, &mut cache.attention);
        Ok(h.iter().zip(attn.iter()).map(|(a, b)| a + b).collect())
    }

    fn inject(&self, x: &[f32], retrieved: &[f32]) -> Vec<f32> {
        let d = self.memory.config().dim;
        x.iter()
            .zip(retrieved.iter())
            .enumerate()
            .map(|(i, (&xi, &ri))| xi + self.gate.value(i % d) * ri)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NeuralMemoryConfig;
    use crate::swa::SlidingWindowAttention;
    use crate::tensor::SimpleRng;

    fn block(gate: ContextGate) -> MemoryAsContextBlock<SlidingWindowAttention> {
        let memory = NeuralMemory::new(NeuralMemoryConfig::test_config(), 7).unwrap();
        let attention = SlidingWindowAttention::new(16, 2, 4, 8);
        MemoryAsContextBlock::new(memory, attention, gate).unwrap()
    }

    #[test]
    fn test_closed_gate_ignores_memory() {
        // sigmoid(-100) ≈ 0 → output is x + attn(x)
        let b = block(ContextGate::Scalar(-100.0));
        let mut rng = SimpleRng::new(1);
        let mut x = vec![0.0f32; 5 * 16];
        rng.fill_uniform(&mut x, 1.0);
        let (y, _) = b.forward(&x, None, None).unwrap();
        let attn = b.attention.forward(&x, 5);
        for i in 0..x.len() {
            assert!((y[i] - (x[i] + attn[i])).abs() < 1e-5);
        }
    }

    #[test]
    fn test_channel_gate_length_checked() {
        let memory = NeuralMemory::new(NeuralMemoryConfig::test_config(), 7).unwrap();
        let attention = SlidingWindowAttention::new(16, 2, 4, 8);
        let err = MemoryAsContextBlock::new(memory, attention, ContextGate::Channel(vec![0.0; 3]))
            .err()
            .unwrap();
        assert_eq!(err, MemoryError::ShapeMismatch { what: "context gate", expected: 16, found: 3 });
    }

    #[test]
    fn test_decode_error_keeps_cache() {
        let b = block(ContextGate::Scalar(0.0));
        let mut cache = b.init_decode_cache();
        assert!(b.decode_step(&[0.0; 4], &mut cache).is_err());
        assert_eq!(cache.memory.seq_index, 0);
    }
}

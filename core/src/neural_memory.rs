//! Neural memory engine: a test-time learned associative memory.
//!
//! A small memory network (see [`crate::memory_model`]) is written chunk by
//! chunk with surprise-driven updates and read back by the same input stream.
//! For each chunk i of `store_chunk` tokens and each head:
//!
//!   u_i  = -clamp(∇_W Σ_t lr_t · mean((M(k_t; W_anchor) - v_t)²))   (surprise)
//!   S_i  = eta_i · S_{i-1} + u_i                                    (momentum)
//!   W_i  = (1 - alpha_i) · W_{i-1} + S_i                            (weights)
//!
//! All chunk gradients are taken at the same anchor weights, so the two
//! recurrences are linear and run as associative scans over the whole call.
//! The token at absolute position t reads with `W_{r(t)}`,
//! `r(t) = floor(floor((t+1)/retrieve_chunk)·retrieve_chunk / store_chunk)`:
//! only chunks completed at or before t are visible. Every index is absolute,
//! so splitting a sequence into calls that thread [`MemoryState`] (down to
//! one token per call) reproduces the single-call output.
//!
//! The engine is immutable after construction; all evolving state lives in
//! the caller-owned `MemoryState` value.

use serde::{Serialize, Deserialize};
use tracing::{debug, trace, warn};

use crate::associative_scan::{associative_scan_carried, momentum_scan_carried};
use crate::config::NeuralMemoryConfig;
use crate::error::MemoryError;
use crate::memory_model::{MemoryModel, MemoryNetwork};
use crate::param_layout::{MemoryWeights, ParamLayout, WeightTrajectory};
use crate::tensor::{
    SimpleRng, matmul_f32, rms_norm_f32, sigmoid_f32, softmax_f32, vec_norm_f32,
};

// ═════════════════════════════════════════════════════════════════════
// Parameters
// ═════════════════════════════════════════════════════════════════════

/// Outer (slow) parameters of the engine, fixed at test time.
///
/// Layout (row-major, `inner = heads * dim_head`, `P` = named memory tensors):
///   store_norm, retrieve_norm: [dim]           (empty unless pre_rmsnorm)
///   w_q, w_k, w_v:             [dim, inner]
///   q_norm, k_norm:            [inner]         (empty unless qk_rmsnorm; gamma - 1)
///   post_norm:                 [inner]         (empty unless post_rmsnorm; gamma - 1)
///   w_lr, b_lr:                [dim, heads], [heads]
///   w_decay, b_decay:          [dim, heads], [heads]
///   w_momentum, b_momentum:    [dim, order*heads], [order*heads]
///   w_momentum_combine, b_momentum_combine: [dim, heads*T], [heads*T]
///                              (T mixed terms; empty unless learned_momentum_combine)
///   w_layer_mod, b_layer_mod:  [dim, heads*P], [heads*P]
///   w_residual_mix, b_residual_mix: [dim, heads], [heads]
///   w_pool, b_pool:            [dim, dim], [dim]   (zero init: starts as mean pooling)
///   w_retrieve_gate:           [dim, heads]    (empty unless heads > 1)
///   w_combine:                 [inner, dim]    (empty unless heads are merged)
///   memory_init:               per-head initial memory weights
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NeuralMemoryParams {
    pub store_norm: Vec<f32>,
    pub retrieve_norm: Vec<f32>,
    pub w_q: Vec<f32>,
    pub w_k: Vec<f32>,
    pub w_v: Vec<f32>,
    pub q_norm: Vec<f32>,
    pub k_norm: Vec<f32>,
    pub post_norm: Vec<f32>,
    pub w_lr: Vec<f32>,
    pub b_lr: Vec<f32>,
    pub w_decay: Vec<f32>,
    pub b_decay: Vec<f32>,
    pub w_momentum: Vec<f32>,
    pub b_momentum: Vec<f32>,
    #[serde(default)]
    pub w_momentum_combine: Vec<f32>,
    #[serde(default)]
    pub b_momentum_combine: Vec<f32>,
    pub w_layer_mod: Vec<f32>,
    pub b_layer_mod: Vec<f32>,
    pub w_residual_mix: Vec<f32>,
    pub b_residual_mix: Vec<f32>,
    pub w_pool: Vec<f32>,
    pub b_pool: Vec<f32>,
    pub w_retrieve_gate: Vec<f32>,
    pub w_combine: Vec<f32>,
    pub memory_init: MemoryWeights,
}

/// Element counts every parameter must have for a given configuration.
fn expected_sizes(cfg: &NeuralMemoryConfig, num_tensors: usize) -> [(&'static str, usize); 24] {
    let d = cfg.dim;
    let inner = cfg.inner_dim();
    let h = cfg.heads;
    let on = |flag: bool, n: usize| if flag { n } else { 0 };
    let order = cfg.momentum_buffers();
    [
        ("store_norm", on(cfg.pre_rmsnorm, d)),
        ("retrieve_norm", on(cfg.pre_rmsnorm, d)),
        ("w_q", d * inner),
        ("w_k", d * inner),
        ("w_v", d * inner),
        ("q_norm", on(cfg.qk_rmsnorm, inner)),
        ("k_norm", on(cfg.qk_rmsnorm, inner)),
        ("post_norm", on(cfg.post_rmsnorm, inner)),
        ("w_lr", d * h),
        ("b_lr", h),
        ("w_decay", d * h),
        ("b_decay", h),
        ("w_momentum", d * order * h),
        ("b_momentum", order * h),
        ("w_momentum_combine", d * h * cfg.momentum_combine_terms()),
        ("b_momentum_combine", h * cfg.momentum_combine_terms()),
        ("w_layer_mod", on(cfg.per_parameter_lr_modulation, d * h * num_tensors)),
        ("b_layer_mod", on(cfg.per_parameter_lr_modulation, h * num_tensors)),
        ("w_residual_mix", on(cfg.accept_weight_residual, d * h)),
        ("b_residual_mix", on(cfg.accept_weight_residual, h)),
        ("w_pool", on(cfg.attn_pool_chunks, d * d)),
        ("b_pool", on(cfg.attn_pool_chunks, d)),
        ("w_retrieve_gate", on(h > 1, d * h)),
        ("w_combine", on(cfg.has_combine_heads(), inner * d)),
    ]
}

impl NeuralMemoryParams {
    /// Deterministic initialization from a seed.
    ///
    /// Projections and gate weights use the uniform(±1/sqrt(fan_in)) scheme;
    /// gate biases take the configured `init_*_bias` when given.
    pub fn init(cfg: &NeuralMemoryConfig, model: &MemoryNetwork, seed: u64) -> Self {
        let mut rng = SimpleRng::new(seed);
        let num_tensors = model.layout().len();
        let sizes = expected_sizes(cfg, num_tensors);
        let size = |name: &str| sizes.iter().find(|(n, _)| *n == name).map_or(0, |(_, s)| *s);
        let d = cfg.dim;
        let inner = cfg.inner_dim();

        let mut linear = |name: &str, fan_in: usize| -> Vec<f32> {
            let mut w = vec![0.0f32; size(name)];
            rng.fill_uniform(&mut w, 1.0 / (fan_in as f32).sqrt());
            w
        };
        let w_q = linear("w_q", d);
        let w_k = linear("w_k", d);
        let w_v = linear("w_v", d);
        let w_lr = linear("w_lr", d);
        let mut b_lr = linear("b_lr", d);
        let w_decay = linear("w_decay", d);
        let mut b_decay = linear("b_decay", d);
        let w_momentum = linear("w_momentum", d);
        let mut b_momentum = linear("b_momentum", d);
        let w_momentum_combine = linear("w_momentum_combine", d);
        let b_momentum_combine = linear("b_momentum_combine", d);
        let w_layer_mod = linear("w_layer_mod", d);
        let b_layer_mod = linear("b_layer_mod", d);
        let w_residual_mix = linear("w_residual_mix", d);
        let b_residual_mix = linear("b_residual_mix", d);
        let w_retrieve_gate = linear("w_retrieve_gate", d);
        let w_combine = linear("w_combine", inner);

        for (bias, init) in [
            (&mut b_lr, cfg.init_adaptive_step_bias),
            (&mut b_decay, cfg.init_decay_bias),
            (&mut b_momentum, cfg.init_momentum_bias),
        ] {
            if let Some(b) = init {
                bias.iter_mut().for_each(|v| *v = b);
            }
        }

        let heads: Vec<Vec<f32>> = if cfg.per_head_learned_parameters {
            (0..cfg.heads).map(|_| model.init_weights(&mut rng)).collect()
        } else {
            let shared = model.init_weights(&mut rng);
            vec![shared; cfg.heads]
        };

        NeuralMemoryParams {
            store_norm: vec![1.0; size("store_norm")],
            retrieve_norm: vec![1.0; size("retrieve_norm")],
            w_q,
            w_k,
            w_v,
            q_norm: vec![0.0; size("q_norm")],
            k_norm: vec![0.0; size("k_norm")],
            post_norm: vec![0.0; size("post_norm")],
            w_lr,
            b_lr,
            w_decay,
            b_decay,
            w_momentum,
            b_momentum,
            w_momentum_combine,
            b_momentum_combine,
            w_layer_mod,
            b_layer_mod,
            w_residual_mix,
            b_residual_mix,
            w_pool: vec![0.0; size("w_pool")],
            b_pool: vec![0.0; size("b_pool")],
            w_retrieve_gate,
            w_combine,
            memory_init: MemoryWeights::from_heads(heads),
        }
    }

    fn field(&self, name: &str) -> &[f32] {
        match name {
            "store_norm" => &self.store_norm,
            "retrieve_norm" => &self.retrieve_norm,
            "w_q" => &self.w_q,
            "w_k" => &self.w_k,
            "w_v" => &self.w_v,
            "q_norm" => &self.q_norm,
            "k_norm" => &self.k_norm,
            "post_norm" => &self.post_norm,
            "w_lr" => &self.w_lr,
            "b_lr" => &self.b_lr,
            "w_decay" => &self.w_decay,
            "b_decay" => &self.b_decay,
            "w_momentum" => &self.w_momentum,
            "b_momentum" => &self.b_momentum,
            "w_momentum_combine" => &self.w_momentum_combine,
            "b_momentum_combine" => &self.b_momentum_combine,
            "w_layer_mod" => &self.w_layer_mod,
            "b_layer_mod" => &self.b_layer_mod,
            "w_residual_mix" => &self.w_residual_mix,
            "b_residual_mix" => &self.b_residual_mix,
            "w_pool" => &self.w_pool,
            "b_pool" => &self.b_pool,
            "w_retrieve_gate" => &self.w_retrieve_gate,
            "w_combine" => &self.w_combine,
            _ => &[],
        }
    }

    /// Verify every tensor against the configuration.
    pub fn check_shapes(&self, cfg: &NeuralMemoryConfig, layout: &ParamLayout) -> Result<(), MemoryError> {
        for (name, expected) in expected_sizes(cfg, layout.len()) {
            let found = self.field(name).len();
            if found != expected {
                return Err(MemoryError::ShapeMismatch { what: name, expected, found });
            }
        }
        self.memory_init.check_shape("memory_init", cfg.heads, layout.numel())
    }
}

// ═════════════════════════════════════════════════════════════════════
// State
// ═════════════════════════════════════════════════════════════════════

/// Caller-owned evolving memory state, threaded through successive calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryState {
    /// Tokens consumed so far, buffered ones included.
    pub seq_index: usize,
    /// Committed weights `W_k`, k = committed tokens / store chunk.
    pub weights: MemoryWeights,
    /// Weights the surprise gradient is evaluated at.
    pub surprise_anchor: MemoryWeights,
    /// One buffer per momentum order; empty without momentum.
    pub momentum: Vec<MemoryWeights>,
    /// Store tokens of the incomplete trailing chunk: [buffered, dim].
    pub cache_store_segment: Vec<f32>,
    /// Snapshots produced by the most recent call, `W_{k0} ..= W_{k0+n}`.
    pub updates: Option<WeightTrajectory>,
    /// Older snapshot still visible to the next read when the retrieve
    /// chunk is coarser than the store chunk.
    pub read_snapshot: Option<(usize, MemoryWeights)>,
    /// f64 scan states behind `weights` and `momentum`. Ignored when it no
    /// longer rounds to them.
    #[serde(default)]
    pub scan_carry: Option<ScanCarry>,
}

/// Full-precision recurrence states, laid out like [`MemoryWeights::data`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanCarry {
    pub weights: Vec<f64>,
    /// One per momentum order.
    pub momentum: Vec<Vec<f64>>,
}

impl ScanCarry {
    fn widen(weights: &MemoryWeights, momentum: &[MemoryWeights]) -> Self {
        let wide = |w: &MemoryWeights| -> Vec<f64> { w.data.iter().map(|&x| x as f64).collect() };
        ScanCarry { weights: wide(weights), momentum: momentum.iter().map(wide).collect() }
    }

    /// True when every carried value rounds to the given f32 state.
    fn rounds_to(&self, weights: &MemoryWeights, momentum: &[MemoryWeights]) -> bool {
        let same = |wide: &[f64], w: &MemoryWeights| {
            wide.len() == w.data.len() && wide.iter().zip(w.data.iter()).all(|(&a, &b)| a as f32 == b)
        };
        same(&self.weights[..], weights)
            && self.momentum.len() == momentum.len()
            && self.momentum.iter().zip(momentum.iter()).all(|(c, m)| same(&c[..], m))
    }

    fn round(wide: &[f64], heads: usize, per_head: usize) -> MemoryWeights {
        MemoryWeights { heads, per_head, data: wide.iter().map(|&x| x as f32).collect() }
    }
}

impl MemoryState {
    /// Tokens waiting in the store buffer.
    pub fn buffered_tokens(&self, dim: usize) -> usize {
        self.cache_store_segment.len() / dim
    }

    /// Number of chunks written into `weights`.
    pub fn committed_chunks(&self, dim: usize, store_chunk: usize) -> usize {
        (self.seq_index - self.buffered_tokens(dim)) / store_chunk
    }
}

// ═════════════════════════════════════════════════════════════════════
// Requests and outputs
// ═════════════════════════════════════════════════════════════════════

/// Full-form call arguments.
pub struct ProcessRequest<'a> {
    /// Tokens to read for: [seq_len, dim].
    pub input: &'a [f32],
    pub state: Option<MemoryState>,
    /// Another instance's trajectory, mixed into the surprise weights.
    pub prev_weights: Option<&'a WeightTrajectory>,
    /// Tokens to write instead of `input`: [seq_len, dim].
    pub store_sequence: Option<&'a [f32]>,
}

impl<'a> ProcessRequest<'a> {
    pub fn new(input: &'a [f32]) -> Self {
        ProcessRequest { input, state: None, prev_weights: None, store_sequence: None }
    }

    pub fn with_state(mut self, state: MemoryState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_prev_weights(mut self, prev: &'a WeightTrajectory) -> Self {
        self.prev_weights = Some(prev);
        self
    }

    pub fn with_store_sequence(mut self, store: &'a [f32]) -> Self {
        self.store_sequence = Some(store);
        self
    }
}

/// Per stored token, per head surprise statistics of one call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Surprises {
    /// Absolute position of the first token covered.
    pub start_token: usize,
    /// Unweighted reconstruction loss mean((M(k) - v)²): [tokens, heads].
    pub loss: Vec<f32>,
    /// Adaptive learning rate: [tokens, heads].
    pub adaptive_lr: Vec<f32>,
}

pub struct ProcessOutput {
    /// Retrieved values: [seq_len, dim].
    pub retrieved: Vec<f32>,
    pub state: MemoryState,
    pub surprises: Surprises,
}

/// Result of writing one group of full chunks.
struct StoredSegment {
    /// `W_{first+1} ..= W_{first+m}`
    snapshots: Vec<MemoryWeights>,
    carry: ScanCarry,
    loss: Vec<f32>,
    adaptive_lr: Vec<f32>,
}

// ═════════════════════════════════════════════════════════════════════
// Engine
// ═════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct NeuralMemory {
    config: NeuralMemoryConfig,
    model: MemoryNetwork,
    layout: ParamLayout,
    params: NeuralMemoryParams,
}

impl NeuralMemory {
    /// Validate the configuration and initialize parameters from `seed`.
    pub fn new(config: NeuralMemoryConfig, seed: u64) -> Result<Self, MemoryError> {
        config.validate()?;
        let model = MemoryNetwork::from_config(&config);
        if model.mixes_positions() {
            debug!("attention memory: retrieved values depend on how tokens are grouped into calls");
        }
        let params = NeuralMemoryParams::init(&config, &model, seed);
        let layout = model.layout();
        Ok(NeuralMemory { config, model, layout, params })
    }

    /// Build around externally supplied (e.g. trained) parameters.
    pub fn from_params(config: NeuralMemoryConfig, params: NeuralMemoryParams) -> Result<Self, MemoryError> {
        config.validate()?;
        let model = MemoryNetwork::from_config(&config);
        let layout = model.layout();
        params.check_shapes(&config, &layout)?;
        Ok(NeuralMemory { config, model, layout, params })
    }

    pub fn config(&self) -> &NeuralMemoryConfig {
        &self.config
    }

    pub fn params(&self) -> &NeuralMemoryParams {
        &self.params
    }

    pub fn model(&self) -> &MemoryNetwork {
        &self.model
    }

    /// Named tensors of one head's memory weights.
    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// Fresh state: initial weights, zero momentum, empty buffer.
    pub fn init_state(&self) -> MemoryState {
        let init = self.params.memory_init.clone();
        let zeros = MemoryWeights::zeros(self.config.heads, self.layout.numel());
        MemoryState {
            seq_index: 0,
            weights: init.clone(),
            surprise_anchor: init,
            momentum: vec![zeros; self.config.momentum_buffers()],
            cache_store_segment: Vec::new(),
            updates: None,
            read_snapshot: None,
            scan_carry: None,
        }
    }

    /// Read for and write `input`, continuing from `state` (fresh if None).
    pub fn process(
        &self,
        input: &[f32],
        state: Option<MemoryState>,
        prev_weights: Option<&WeightTrajectory>,
        store_sequence: Option<&[f32]>,
    ) -> Result<(Vec<f32>, MemoryState), MemoryError> {
        let out = self.process_request(ProcessRequest { input, state, prev_weights, store_sequence })?;
        Ok((out.retrieved, out.state))
    }

    /// Token-level sequential mode: one `[dim]` token in, one out.
    pub fn process_one_step(
        &self,
        token: &[f32],
        state: MemoryState,
    ) -> Result<(Vec<f32>, MemoryState), MemoryError> {
        if token.len() != self.config.dim {
            return Err(MemoryError::ShapeMismatch {
                what: "token",
                expected: self.config.dim,
                found: token.len(),
            });
        }
        self.process(token, Some(state), None, None)
    }

    /// Independent sequences: `inputs` is [batch, seq_len, dim].
    pub fn process_batch(
        &self,
        inputs: &[f32],
        batch: usize,
        states: Option<Vec<MemoryState>>,
    ) -> Result<(Vec<f32>, Vec<MemoryState>), MemoryError> {
        if batch == 0 || inputs.len() % batch != 0 {
            return Err(MemoryError::ShapeMismatch { what: "batch", expected: batch, found: inputs.len() });
        }
        let per_seq = inputs.len() / batch;
        let mut states: Vec<Option<MemoryState>> = match states {
            Some(s) if s.len() != batch => {
                return Err(MemoryError::ShapeMismatch { what: "batch states", expected: batch, found: s.len() });
            }
            Some(s) => s.into_iter().map(Some).collect(),
            None => vec![None; batch],
        };

        let mut retrieved = Vec::with_capacity(inputs.len());
        let mut next_states = Vec::with_capacity(batch);
        for (b, seq) in inputs.chunks(per_seq.max(1)).enumerate().take(batch) {
            let (out, state) = self.process(seq, states[b].take(), None, None)?;
            retrieved.extend_from_slice(&out);
            next_states.push(state);
        }
        // zero-length sequences still yield one state per row
        while next_states.len() < batch {
            let b = next_states.len();
            let (_, state) = self.process(&[], states[b].take(), None, None)?;
            next_states.push(state);
        }
        Ok((retrieved, next_states))
    }

    /// Full-form call: also reports per-token surprises.
    pub fn process_request(&self, req: ProcessRequest<'_>) -> Result<ProcessOutput, MemoryError> {
        let cfg = &self.config;
        let d = cfg.dim;
        let sc = cfg.store_chunk();

        let input = req.input;
        if input.len() % d != 0 {
            return Err(MemoryError::RaggedInput { len: input.len(), dim: d });
        }
        let seq_len = input.len() / d;
        let store = req.store_sequence.unwrap_or(input);
        if store.len() != input.len() {
            return Err(MemoryError::ShapeMismatch {
                what: "store_sequence",
                expected: input.len(),
                found: store.len(),
            });
        }
        if let Some(prev) = req.prev_weights {
            for snap in &prev.snapshots {
                snap.check_shape("prev_weights", cfg.heads, self.layout.numel())?;
            }
        }
        let state = match req.state {
            Some(s) => {
                self.check_state(&s)?;
                s
            }
            None => self.init_state(),
        };

        let MemoryState {
            seq_index: p0,
            weights,
            surprise_anchor: mut anchor,
            momentum,
            cache_store_segment,
            read_snapshot,
            scan_carry,
            ..
        } = state;
        let mut carry = match scan_carry {
            Some(c) if c.rounds_to(&weights, &momentum) => c,
            Some(_) => {
                debug!("scan carry does not match state weights; resuming from f32");
                ScanCarry::widen(&weights, &momentum)
            }
            None => ScanCarry::widen(&weights, &momentum),
        };

        // ── Store: commit every full chunk of buffer ++ store ──────────
        let buffered = cache_store_segment.len() / d;
        let k0 = (p0 - buffered) / sc;
        let mut pending = cache_store_segment;
        pending.extend_from_slice(store);
        let n_full = pending.len() / d / sc;

        let mut snapshots = Vec::with_capacity(n_full + 1);
        snapshots.push(weights);
        let mut surprises = Surprises { start_token: k0 * sc, ..Surprises::default() };

        let mut chunk = k0;
        while chunk < k0 + n_full {
            let end = self.segment_end(chunk, k0 + n_full);
            let tokens = &pending[(chunk - k0) * sc * d..(end - k0) * sc * d];
            let seg = self.store_segment(tokens, chunk, &anchor, &carry, req.prev_weights)?;
            trace!(first_chunk = chunk, chunks = end - chunk, "stored memory segment");
            carry = seg.carry;
            snapshots.extend(seg.snapshots);
            surprises.loss.extend(seg.loss);
            surprises.adaptive_lr.extend(seg.adaptive_lr);

            if let Some(interval) = cfg.weight_refresh_interval {
                if (end * sc) % interval == 0 {
                    anchor = snapshots[snapshots.len() - 1].clone();
                }
            }
            chunk = end;
        }
        let remainder = pending[n_full * sc * d..].to_vec();

        // ── Retrieve: group tokens by visible snapshot ─────────────────
        let mut retrieved = vec![0.0f32; input.len()];
        let mut t = 0;
        while t < seq_len {
            let k = self.read_index(p0 + t);
            let mut e = t + 1;
            while e < seq_len && self.read_index(p0 + e) == k {
                e += 1;
            }
            let snapshot = lookup_snapshot(&snapshots, k0, &read_snapshot, k)?;
            let out = self.retrieve_group(&input[t * d..e * d], e - t, snapshot);
            retrieved[t * d..e * d].copy_from_slice(&out);
            t = e;
        }

        let p_end = p0 + seq_len;
        let next_read = self.read_index(p_end);
        let next_read_snapshot = if next_read < k0 + n_full {
            Some((next_read, lookup_snapshot(&snapshots, k0, &read_snapshot, next_read)?.clone()))
        } else {
            None
        };

        debug!(
            seq_index = p_end,
            tokens = seq_len,
            chunks_committed = n_full,
            buffered = remainder.len() / d,
            "neural memory call"
        );

        let committed = snapshots[snapshots.len() - 1].clone();
        let (nh, p) = (cfg.heads, self.layout.numel());
        let momentum = carry.momentum.iter().map(|m| ScanCarry::round(m, nh, p)).collect();
        let state = MemoryState {
            seq_index: p_end,
            weights: committed,
            surprise_anchor: anchor,
            momentum,
            cache_store_segment: remainder,
            updates: Some(WeightTrajectory { start_chunk: k0, snapshots }),
            read_snapshot: next_read_snapshot,
            scan_carry: Some(carry),
        };
        Ok(ProcessOutput { retrieved, state, surprises })
    }

    /// Snapshot index visible to the token at absolute position `t`.
    fn read_index(&self, t: usize) -> usize {
        let rc = self.config.retrieve_chunk();
        ((t + 1) / rc * rc) / self.config.store_chunk()
    }

    /// End (exclusive) of the store group starting at `chunk`: the next
    /// `batch_size` or `weight_refresh_interval` boundary, capped at `limit`.
    fn segment_end(&self, chunk: usize, limit: usize) -> usize {
        let sc = self.config.store_chunk();
        let mut end = limit;
        for knob in [self.config.batch_size, self.config.weight_refresh_interval] {
            if let Some(tokens) = knob {
                let per = tokens / sc;
                end = end.min((chunk / per + 1) * per);
            }
        }
        end
    }

    fn check_state(&self, s: &MemoryState) -> Result<(), MemoryError> {
        let cfg = &self.config;
        let (h, p) = (cfg.heads, self.layout.numel());
        s.weights.check_shape("state.weights", h, p)?;
        s.surprise_anchor.check_shape("state.surprise_anchor", h, p)?;
        if s.momentum.len() != cfg.momentum_buffers() {
            return Err(MemoryError::ShapeMismatch {
                what: "state.momentum",
                expected: cfg.momentum_buffers(),
                found: s.momentum.len(),
            });
        }
        for m in &s.momentum {
            m.check_shape("state.momentum", h, p)?;
        }
        if let Some((_, w)) = &s.read_snapshot {
            w.check_shape("state.read_snapshot", h, p)?;
        }
        // the buffer holds exactly the tokens past the last committed chunk
        let buf = s.cache_store_segment.len();
        let expected = (s.seq_index % cfg.store_chunk()) * cfg.dim;
        if buf != expected {
            return Err(MemoryError::ShapeMismatch {
                what: "state.cache_store_segment",
                expected,
                found: buf,
            });
        }
        Ok(())
    }

    // ── Store path ──────────────────────────────────────────────────

    /// Write `m` full chunks starting at absolute chunk `first_chunk`.
    fn store_segment(
        &self,
        tokens: &[f32],
        first_chunk: usize,
        anchor: &MemoryWeights,
        carry: &ScanCarry,
        prev_weights: Option<&WeightTrajectory>,
    ) -> Result<StoredSegment, MemoryError> {
        let cfg = &self.config;
        let pr = &self.params;
        let (d, sc, nh, dh) = (cfg.dim, cfg.store_chunk(), cfg.heads, cfg.dim_head());
        let inner = cfg.inner_dim();
        let p = self.layout.numel();
        let n_tok = tokens.len() / d;
        let m = n_tok / sc;

        let s = if cfg.pre_rmsnorm {
            let mut out = vec![0.0f32; tokens.len()];
            rms_norm_f32(tokens, &pr.store_norm, 0.0, &mut out, n_tok, d);
            out
        } else {
            tokens.to_vec()
        };

        // Per-token adaptive lr: [n_tok, heads]
        let lr: Vec<f32> = linear_sigmoid(&s, &pr.w_lr, &pr.b_lr, n_tok, d, nh)
            .into_iter()
            .map(|g| g * cfg.max_lr)
            .collect();

        // Per-chunk gates from chunk representations
        let reps = self.chunk_representations(&s, m);
        let decay = linear_sigmoid(&reps, &pr.w_decay, &pr.b_decay, m, d, nh);
        let order = cfg.momentum_buffers();
        let eta = linear_sigmoid(&reps, &pr.w_momentum, &pr.b_momentum, m, d, order * nh);
        // softmax weights over the mixed momentum orders: [m, heads, terms]
        let terms = cfg.momentum_combine_terms();
        let combine = if terms > 0 {
            let mut logits = vec![0.0f32; m * nh * terms];
            matmul_f32(&reps, &pr.w_momentum_combine, &mut logits, m, d, nh * terms);
            for (i, v) in logits.iter_mut().enumerate() {
                *v += pr.b_momentum_combine[i % (nh * terms)];
            }
            let mut w = vec![0.0f32; logits.len()];
            softmax_f32(&logits, &mut w, m * nh, terms);
            w
        } else {
            Vec::new()
        };
        let num_tensors = self.layout.len();
        let layer_mod: Vec<f32> = if cfg.per_parameter_lr_modulation {
            linear_sigmoid(&reps, &pr.w_layer_mod, &pr.b_layer_mod, m, d, nh * num_tensors)
                .into_iter()
                .map(|g| g * cfg.max_mem_layer_modulation)
                .collect()
        } else {
            Vec::new()
        };
        let residual = match prev_weights {
            Some(prev) => {
                let mix = if cfg.accept_weight_residual {
                    Some(linear_sigmoid(&reps, &pr.w_residual_mix, &pr.b_residual_mix, m, d, nh))
                } else {
                    None
                };
                let snaps = (0..m)
                    .map(|i| prev.snapshot(first_chunk + i))
                    .collect::<Result<Vec<_>, _>>()?;
                Some((snaps, mix))
            }
            None => None,
        };

        // Keys and values
        let mut keys = vec![0.0f32; n_tok * inner];
        matmul_f32(&s, &pr.w_k, &mut keys, n_tok, d, inner);
        if cfg.qk_rmsnorm {
            multihead_rms_norm(&mut keys, &pr.k_norm, n_tok * nh, dh);
        }
        let mut values = vec![0.0f32; n_tok * inner];
        matmul_f32(&s, &pr.w_v, &mut values, n_tok, d, inner);

        let mut loss = vec![0.0f32; n_tok * nh];
        let mut next_carry = ScanCarry {
            weights: Vec::with_capacity(nh * p),
            momentum: vec![Vec::with_capacity(nh * p); order],
        };
        let mut head_states: Vec<Vec<f32>> = Vec::with_capacity(nh);

        for h in 0..nh {
            let k_h = head_columns(&keys, n_tok, nh, dh, h);
            let v_h = head_columns(&values, n_tok, nh, dh, h);

            let mut surprise = vec![0.0f32; m * p];
            for i in 0..m {
                let mut wfs = anchor.head(h).to_vec();
                if let Some((snaps, mix)) = &residual {
                    let scale = mix.as_ref().map_or(1.0, |g| g[i * nh + h]);
                    for (w, &r) in wfs.iter_mut().zip(snaps[i].head(h).iter()) {
                        *w += scale * r;
                    }
                }

                let rows = i * sc..(i + 1) * sc;
                let (pred, cache) = self.model.forward(&wfs, &k_h[rows.start * dh..rows.end * dh], sc);
                let mut d_pred = vec![0.0f32; sc * dh];
                for (r, t) in rows.clone().enumerate() {
                    let lr_t = lr[t * nh + h];
                    let mut sq = 0.0f32;
                    for c in 0..dh {
                        let err = pred[r * dh + c] - v_h[t * dh + c];
                        sq += err * err;
                        d_pred[r * dh + c] = 2.0 * lr_t * err / dh as f32;
                    }
                    loss[t * nh + h] = sq / dh as f32;
                }
                let mut grad = self.model.backward(&wfs, &cache, &d_pred);

                for (ti, e) in self.layout.entries().iter().enumerate() {
                    let g = &mut grad[e.range()];
                    if let Some(max_norm) = cfg.max_grad_norm {
                        softclamp_norm(g, max_norm);
                    }
                    if cfg.per_parameter_lr_modulation {
                        let scale = layer_mod[(i * nh + h) * num_tensors + ti];
                        g.iter_mut().for_each(|v| *v *= scale);
                    }
                }
                for (u, g) in surprise[i * p..(i + 1) * p].iter_mut().zip(grad.iter()) {
                    *u = -g;
                }
            }
            if surprise.iter().any(|v| !v.is_finite()) {
                warn!(head = h, first_chunk, "non-finite surprise in memory update");
            }

            // S_i = eta_i * S_{i-1} + u_i, per order
            let update = if order > 0 {
                let gates: Vec<Vec<f32>> = (0..order)
                    .map(|o| (0..m).map(|i| eta[i * order * nh + o * nh + h]).collect())
                    .collect();
                let prevs: Vec<&[f64]> = carry.momentum.iter().map(|c| &c[h * p..(h + 1) * p]).collect();
                let (mut orders, finals) = momentum_scan_carried(&gates, &surprise, &prevs, p);
                for (o, last) in finals.into_iter().enumerate() {
                    next_carry.momentum[o].extend(last);
                }
                if terms > 0 {
                    let zeroth = cfg.learned_combine_include_zeroth;
                    mix_momentum_orders(&surprise, &orders, zeroth, &combine[h * terms..], nh * terms, m, p)
                } else {
                    orders.pop().unwrap_or(surprise)
                }
            } else {
                surprise
            };

            // W_i = (1 - alpha_i) * W_{i-1} + update_i
            let retain: Vec<f32> = (0..m).map(|i| 1.0 - decay[i * nh + h]).collect();
            let (states, last) = associative_scan_carried(&retain, &update, &carry.weights[h * p..(h + 1) * p], p);
            next_carry.weights.extend(last);
            head_states.push(states);
        }

        let snapshots = (0..m)
            .map(|i| MemoryWeights::from_heads(
                head_states.iter().map(|st| st[i * p..(i + 1) * p].to_vec()).collect(),
            ))
            .collect();

        Ok(StoredSegment { snapshots, carry: next_carry, loss, adaptive_lr: lr })
    }

    /// One [dim] summary per chunk: mean, or per-channel attention pooling.
    fn chunk_representations(&self, s: &[f32], m: usize) -> Vec<f32> {
        let (d, sc) = (self.config.dim, self.config.store_chunk());
        let mut reps = vec![0.0f32; m * d];
        for i in 0..m {
            let chunk = &s[i * sc * d..(i + 1) * sc * d];
            let rep = &mut reps[i * d..(i + 1) * d];
            if self.config.attn_pool_chunks {
                let mut logits = vec![0.0f32; sc * d];
                matmul_f32(chunk, &self.params.w_pool, &mut logits, sc, d, d);
                for c in 0..d {
                    let mut max = f32::NEG_INFINITY;
                    for r in 0..sc {
                        logits[r * d + c] += self.params.b_pool[c];
                        max = max.max(logits[r * d + c]);
                    }
                    let mut z = 0.0f32;
                    let mut acc = 0.0f32;
                    for r in 0..sc {
                        let e = (logits[r * d + c] - max).exp();
                        z += e;
                        acc += e * chunk[r * d + c];
                    }
                    rep[c] = acc / z;
                }
            } else {
                for r in 0..sc {
                    for c in 0..d {
                        rep[c] += chunk[r * d + c];
                    }
                }
                rep.iter_mut().for_each(|v| *v /= sc as f32);
            }
        }
        reps
    }

    // ── Retrieve path ───────────────────────────────────────────────

    /// Read `n` tokens with one weight snapshot.
    fn retrieve_group(&self, tokens: &[f32], n: usize, snapshot: &MemoryWeights) -> Vec<f32> {
        let cfg = &self.config;
        let pr = &self.params;
        let (d, nh, dh) = (cfg.dim, cfg.heads, cfg.dim_head());
        let inner = cfg.inner_dim();

        let x = if cfg.pre_rmsnorm {
            let mut out = vec![0.0f32; tokens.len()];
            rms_norm_f32(tokens, &pr.retrieve_norm, 0.0, &mut out, n, d);
            out
        } else {
            tokens.to_vec()
        };

        let mut q = vec![0.0f32; n * inner];
        matmul_f32(&x, &pr.w_q, &mut q, n, d, inner);
        if cfg.qk_rmsnorm {
            multihead_rms_norm(&mut q, &pr.q_norm, n * nh, dh);
        }

        let mut values = vec![0.0f32; n * inner];
        for h in 0..nh {
            let q_h = head_columns(&q, n, nh, dh, h);
            let (y, _) = self.model.forward(snapshot.head(h), &q_h, n);
            for t in 0..n {
                values[t * inner + h * dh..t * inner + (h + 1) * dh]
                    .copy_from_slice(&y[t * dh..(t + 1) * dh]);
            }
        }

        if cfg.post_rmsnorm {
            multihead_rms_norm(&mut values, &pr.post_norm, n * nh, dh);
        }
        if nh > 1 {
            let gates = linear_sigmoid(&x, &pr.w_retrieve_gate, &[], n, d, nh);
            for t in 0..n {
                for h in 0..nh {
                    let g = gates[t * nh + h];
                    values[t * inner + h * dh..t * inner + (h + 1) * dh]
                        .iter_mut()
                        .for_each(|v| *v *= g);
                }
            }
        }

        let mut out = if cfg.has_combine_heads() {
            let mut out = vec![0.0f32; n * d];
            matmul_f32(&values, &pr.w_combine, &mut out, n, inner, d);
            out
        } else {
            values
        };
        for v in out.iter_mut() {
            *v = cfg.activation.apply(*v);
        }
        out
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// sigmoid(x @ w + b) for x: [rows, fan_in], w: [fan_in, fan_out], b: [fan_out] or empty.
fn linear_sigmoid(x: &[f32], w: &[f32], b: &[f32], rows: usize, fan_in: usize, fan_out: usize) -> Vec<f32> {
    if fan_out == 0 {
        return Vec::new();
    }
    let mut out = vec![0.0f32; rows * fan_out];
    matmul_f32(x, w, &mut out, rows, fan_in, fan_out);
    for r in 0..rows {
        for c in 0..fan_out {
            let bias = if b.is_empty() { 0.0 } else { b[c] };
            out[r * fan_out + c] = sigmoid_f32(out[r * fan_out + c] + bias);
        }
    }
    out
}

/// Softmax-weighted sum of the momentum orders, with the raw surprise as an
/// extra leading term when `include_surprise`.
///
/// `weights[i * stride + o]` is term o's weight for chunk i.
fn mix_momentum_orders(
    surprise: &[f32],
    orders: &[Vec<f32>],
    include_surprise: bool,
    weights: &[f32],
    stride: usize,
    m: usize,
    p: usize,
) -> Vec<f32> {
    let mut out = vec![0.0f32; m * p];
    for i in 0..m {
        let w = &weights[i * stride..];
        let dst = &mut out[i * p..(i + 1) * p];
        let terms = include_surprise
            .then_some(surprise)
            .into_iter()
            .chain(orders.iter().map(Vec::as_slice));
        for (o, term) in terms.enumerate() {
            for (acc, &v) in dst.iter_mut().zip(term[i * p..(i + 1) * p].iter()) {
                *acc += w[o] * v;
            }
        }
    }
    out
}

/// RMSNorm over each head's slice, scale `(gamma + 1)` with gamma: [heads * dim_head].
fn multihead_rms_norm(x: &mut [f32], gamma: &[f32], groups: usize, dim_head: usize) {
    let heads = gamma.len() / dim_head;
    let src = x.to_vec();
    for g in 0..groups {
        let h = g % heads;
        let span = g * dim_head..(g + 1) * dim_head;
        rms_norm_f32(
            &src[span.clone()],
            &gamma[h * dim_head..(h + 1) * dim_head],
            1.0,
            &mut x[span],
            1,
            dim_head,
        );
    }
}

/// Columns of head `h` from [rows, heads * dim_head] as [rows, dim_head].
fn head_columns(x: &[f32], rows: usize, heads: usize, dim_head: usize, h: usize) -> Vec<f32> {
    let inner = heads * dim_head;
    let mut out = Vec::with_capacity(rows * dim_head);
    for t in 0..rows {
        out.extend_from_slice(&x[t * inner + h * dim_head..t * inner + (h + 1) * dim_head]);
    }
    out
}

/// Rescale a gradient tensor so its L2 norm becomes `softclamp_max(norm)`.
fn softclamp_norm(g: &mut [f32], max_norm: f32) {
    let norm = vec_norm_f32(g);
    if norm <= 0.0 || !norm.is_finite() {
        return;
    }
    let scale = softclamp_max(norm, max_norm) / norm;
    g.iter_mut().for_each(|v| *v *= scale);
}

/// tanh(x / (max/2)) · max/2 + max/2, within (max/2, max] for x > 0.
/// Large norms saturate to exactly `max` in f32.
fn softclamp_max(x: f32, max: f32) -> f32 {
    let half = max / 2.0;
    (x / half).tanh() * half + half
}

/// Snapshot `k` from this call's trajectory, or the carried older snapshot.
fn lookup_snapshot<'a>(
    snapshots: &'a [MemoryWeights],
    k0: usize,
    read_snapshot: &'a Option<(usize, MemoryWeights)>,
    k: usize,
) -> Result<&'a MemoryWeights, MemoryError> {
    if k >= k0 && k - k0 < snapshots.len() {
        return Ok(&snapshots[k - k0]);
    }
    match read_snapshot {
        Some((idx, w)) if *idx == k => Ok(w),
        _ => Err(MemoryError::TrajectoryOutOfRange { chunk: k, start: k0, end: k0 + snapshots.len() }),
    }
}

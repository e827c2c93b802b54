pub mod tensor;
pub mod error;
pub mod config;
pub mod associative_scan;
pub mod param_layout;
pub mod memory_model;
pub mod memory_mlp;
pub mod factorized_mlp;
pub mod gated_residual_mlp;
pub mod swiglu_mlp;
pub mod memory_attention;
pub mod residual_norm;
pub mod quantized;
pub mod neural_memory;
pub mod swa;
pub mod mac;

pub use config::{Activation, ChunkSize, MemoryModelKind, NeuralMemoryConfig};
pub use error::{ConfigError, MemoryError};
pub use neural_memory::{
    MemoryState, NeuralMemory, NeuralMemoryParams, ProcessOutput, ProcessRequest, ScanCarry,
    Surprises,
};
pub use param_layout::{MemoryWeights, ParamLayout, WeightTrajectory};

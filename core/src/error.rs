/// Error types for the neural memory engine.
///
/// Configuration problems are detected once, at construction. Everything
/// raised at call time is a shape or trajectory contract violation by the
/// caller. Numeric instability is never an error: it surfaces as degraded
/// output and a `tracing` warning.

use thiserror::Error;

/// Invalid or unsupported combination of configuration options.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("chunk size must be at least 1 (got {0})")]
    InvalidChunkSize(usize),

    #[error("retrieve chunk size {retrieve} and store chunk size {store} must divide one another")]
    IncompatibleChunkSizes { retrieve: usize, store: usize },

    #[error("unsupported memory model: {0}")]
    UnsupportedModel(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),
}

/// Errors returned by [`crate::neural_memory::NeuralMemory`] operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MemoryError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("input of length {len} is not a whole number of {dim}-wide tokens")]
    RaggedInput { len: usize, dim: usize },

    #[error("shape mismatch for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("weight trajectory has no snapshot for chunk {chunk} (covers chunks {start}..{end})")]
    TrajectoryOutOfRange { chunk: usize, start: usize, end: usize },
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::ConfigParse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let e: MemoryError = ConfigError::InvalidChunkSize(0).into();
        assert_eq!(e, MemoryError::Config(ConfigError::InvalidChunkSize(0)));
        assert!(e.to_string().contains("chunk size must be at least 1"));
    }

    #[test]
    fn test_shape_mismatch_message() {
        let e = MemoryError::ShapeMismatch { what: "input", expected: 16, found: 15 };
        assert_eq!(e.to_string(), "shape mismatch for input: expected 16, found 15");
    }
}

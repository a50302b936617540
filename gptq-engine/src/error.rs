//! gptq-engine error types

/// gptq-engine result type
pub type Result<T> = std::result::Result<T, Error>;

/// gptq-engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from candle tensor operations
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Filesystem error (tensor store, packed layer files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed SafeTensors header or summary JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A tensor did not have the expected shape
    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// What was being checked
        what: String,
        /// Expected dimensions
        expected: Vec<usize>,
        /// Actual dimensions
        got: Vec<usize>,
    },

    /// A per-layer or run configuration value is out of range
    #[error("invalid config '{field}': {reason}")]
    InvalidConfig {
        /// Offending field
        field: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Damped curvature matrix was not positive-definite
    #[error("cholesky factorization failed at column {column} (pivot {pivot:e}); increase percdamp")]
    Factorization {
        /// Column where the pivot went non-positive
        column: usize,
        /// The offending pivot value
        pivot: f64,
    },

    /// NaN or infinity found where finite values are required
    #[error("non-finite values in {what}")]
    NonFinite {
        /// Which tensor
        what: String,
    },

    /// Tensor file is truncated or its header is inconsistent
    #[error("malformed tensor file: {reason}")]
    InvalidFormat {
        /// What was wrong
        reason: String,
    },

    /// Named tensor absent from a store or tensor map
    #[error("tensor not found: {name}")]
    MissingTensor {
        /// Tensor name
        name: String,
    },

    /// Layer name not known to the block or collector
    #[error("unknown layer: {name}")]
    UnknownLayer {
        /// Layer name
        name: String,
    },

    /// Operation not supported for this configuration
    #[error("unsupported: {reason}")]
    Unsupported {
        /// Description of what is unsupported
        reason: String,
    },
}

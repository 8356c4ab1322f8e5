//! Error types for soft-align-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Incompatible tensor shapes between inputs, or between an input and the layer.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    /// Well-shaped input carrying values the core cannot interpret.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::ShapeMismatch`] from anything debug-printable.
    pub(crate) fn shape(
        context: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Error::ShapeMismatch {
            context,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }

    /// [`Error::ShapeMismatch`] with a textual description of the expected shape.
    pub(crate) fn shape_desc(
        context: &'static str,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Error::ShapeMismatch {
            context,
            expected: expected.to_string(),
            actual: format!("{actual:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_message_carries_both_shapes() {
        let err = Error::shape("attention input", [2, 16, 5], [2, 12, 5]);
        let msg = err.to_string();
        assert!(msg.contains("attention input"));
        assert!(msg.contains("[2, 16, 5]"));
        assert!(msg.contains("[2, 12, 5]"));
    }

    #[test]
    fn described_shape_is_not_quoted() {
        let err = Error::shape_desc("attention heads", "channels divisible by num_heads=3", 16);
        assert_eq!(
            err.to_string(),
            "shape mismatch in attention heads: expected channels divisible by num_heads=3, got 16"
        );
    }
}

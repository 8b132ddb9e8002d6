//! Error types for speaker-vc.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Loss identifier outside the supported set.
    #[error("unknown loss type '{0}'")]
    UnknownLossKind(String),

    /// Pretrained checkpoint missing or incompatible.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// Tensor shape incompatible with the configured model.
    #[error("shape: {0}")]
    Shape(String),

    /// An embedding-based loss was called without a target embedding.
    #[error("{0} requires a target speaker embedding")]
    MissingEmbedding(&'static str),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

use thiserror::Error;

/// Errors raised by pipeline stages (decoders, encoders, hand-off channels).
#[derive(Error, Debug)]
pub enum PipelineError {
    /// An encoder could not turn a pack into bytes.
    #[error("encode failed: {0}")]
    Encode(String),

    /// A decoder could not make sense of a pack.
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The receiving side of a hand-off channel is gone.
    #[error("{0} is closed")]
    Closed(String),
}

use pack_pipeline::PipelineError;
use thiserror::Error;

/// Errors surfaced by the NATS input and output plugins.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Missing or invalid configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// A named collaborator (decoder route) could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    /// The initial connect or subscribe failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The transport closed the connection underneath a running plugin.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("publish failed: {0}")]
    Publish(String),

    /// An adapter task panicked or was cancelled.
    #[error("adapter task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        BridgeError::Config(msg.into())
    }
}

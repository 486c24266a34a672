//! Pipeline-side building blocks for nats_bridge: pooled packs, decoders,
//! encoders, the router, and the runner traits plugins are written against.

pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod message;
pub mod pack;
pub mod router;
pub mod runner;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use message::{Field, FieldValue, Message};
pub use pack::{PackSupply, PipelinePack};

//! NATS input and output plugins for the pack pipeline, plus the wiring the
//! `nats_bridge` binary runs them with.

pub mod apps;
pub mod config;
pub mod connection;
pub mod error;
pub mod input;
pub mod lifecycle;
pub mod logger;
pub mod mock_conn;
pub mod nats;
pub mod output;

pub use error::BridgeError;
pub use input::NatsInput;
pub use output::NatsOutput;

use std::path::PathBuf;

use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct LogConfig {
    /// An `EnvFilter` directive, e.g. `info` or `nats_bridge=debug`.
    #[serde(default = "default_level")]
    pub level: String,
    /// When set, logs also go to `<dir>/nats_bridge.log` and per-pack failures
    /// to `<dir>/nats_bridge_events.json`, both rotated daily.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: None,
        }
    }
}

impl LogConfig {
    pub fn new(level: impl Into<String>, dir: Option<PathBuf>) -> Self {
        Self {
            level: level.into(),
            dir,
        }
    }
}

/// Installs the global subscriber. Keep the returned guards alive for as long
/// as the process logs, dropping them flushes and stops the file writers.
pub fn init_tracing(config: &LogConfig) -> Result<Vec<WorkerGuard>> {
    let mut guards = Vec::new();
    let stdout_layer = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(&config.level));

    let (file_layer, events_layer) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;

            // plain text copy of everything that reaches stdout
            let (txt_writer, txt_guard) = tracing_appender::non_blocking(RollingFileAppender::new(
                Rotation::DAILY,
                dir,
                "nats_bridge.log",
            ));
            guards.push(txt_guard);
            let txt_layer = fmt::layer()
                .with_writer(txt_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(&config.level));

            // newline-delimited JSON of events with target="pack"
            let (json_writer, json_guard) = tracing_appender::non_blocking(RollingFileAppender::new(
                Rotation::DAILY,
                dir,
                "nats_bridge_events.json",
            ));
            guards.push(json_guard);
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_writer)
                .with_target(true)
                .with_filter(EnvFilter::new("pack=info"));

            (Some(txt_layer), Some(json_layer))
        }
        None => (None, None),
    };

    Registry::default()
        .with(stdout_layer)
        .with(file_layer)
        .with(events_layer)
        .try_init()?;

    Ok(guards)
}

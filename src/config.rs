use std::{collections::BTreeMap, env, fs, path::Path};

use anyhow::{Context, Result, bail};
use pack_pipeline::config::{DEFAULT_POOL_SIZE, DEFAULT_QUEUE_SIZE};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::logger::LogConfig;

pub const DEFAULT_URL: &str = "nats://127.0.0.1:4222";

/// Overrides the `url` of every input and output when set.
pub const URL_ENV: &str = "NATS_BRIDGE_URL";

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_true() -> bool {
    true
}

/// Connection settings shared by inputs and outputs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Fallback servers tried after `url`.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Keep the server list in the configured order.
    #[serde(default)]
    pub no_randomize: bool,
    #[serde(default, rename = "reconnect")]
    pub allow_reconnect: bool,
    /// Unset means the client's default (retry forever).
    #[serde(default, rename = "max_reconnects")]
    pub max_reconnect: Option<usize>,
    /// Seconds between reconnect attempts.
    #[serde(default)]
    pub reconnect_wait: u32,
    /// Connect timeout in milliseconds.
    #[serde(default)]
    pub timeout: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            servers: vec![],
            no_randomize: false,
            allow_reconnect: false,
            max_reconnect: None,
            reconnect_wait: 0,
            timeout: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct NatsInputConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub subject: String,
    /// Decoder every inbound pack is routed through.
    #[serde(default, rename = "decoder")]
    pub decoder_name: Option<String>,
    /// Store raw message bytes instead of populating fields. When unset this
    /// is inferred from the decoder.
    #[serde(default, rename = "use_msgbytes")]
    pub use_msg_bytes: Option<bool>,
}

impl NatsInputConfig {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct NatsOutputConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub subject: String,
    /// Name of an entry in `encoders`.
    #[serde(default)]
    pub encoder: Option<String>,
    /// Only packs with this message type are routed here.
    #[serde(default)]
    pub message_matcher: Option<String>,
}

impl NatsOutputConfig {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecoderConfig {
    /// Pipeline-native message bytes.
    Native,
    /// Adds fixed string fields.
    Scribble {
        #[serde(default)]
        fields: BTreeMap<String, String>,
    },
    /// Runs other named decoders in order.
    Multi { stages: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EncoderConfig {
    Payload {
        #[serde(default = "default_true")]
        append_newlines: bool,
        #[serde(default)]
        prefix_ts: bool,
        #[serde(default)]
        ts_format: Option<String>,
    },
    Native,
}

/// Everything `nats_bridge run` needs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BridgeConfig {
    /// Hostname stamped on inbound messages; defaults to `$HOSTNAME`.
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub decoders: BTreeMap<String, DecoderConfig>,
    #[serde(default)]
    pub encoders: BTreeMap<String, EncoderConfig>,
    #[serde(default)]
    pub inputs: BTreeMap<String, NatsInputConfig>,
    #[serde(default)]
    pub outputs: BTreeMap<String, NatsOutputConfig>,
}

impl BridgeConfig {
    /// Reads a `.yaml`/`.yml` or `.json` file and applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|os| os.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let mut config: BridgeConfig = match ext.as_str() {
            "yaml" | "yml" => serde_yaml_bw::from_str(&contents)
                .with_context(|| format!("Invalid YAML in {}", path.display()))?,
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?,
            other => bail!("unsupported config extension \"{other}\" (expected .yaml, .yml or .json)"),
        };
        if let Ok(url) = env::var(URL_ENV) {
            info!("{URL_ENV} overrides the configured NATS urls");
            config.override_url(&url);
        }
        Ok(config)
    }

    pub fn override_url(&mut self, url: &str) {
        for input in self.inputs.values_mut() {
            input.connection.url = url.to_string();
        }
        for output in self.outputs.values_mut() {
            output.connection.url = url.to_string();
        }
    }

    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

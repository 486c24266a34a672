use std::fmt::Write;

use chrono::{
    DateTime, Utc,
    format::{Item, StrftimeItems},
};

use crate::{error::PipelineError, pack::PipelinePack};

pub const DEFAULT_TS_FORMAT: &str = "[%Y/%b/%d:%H:%M:%S %z]";

/// Rejects strftime patterns chrono cannot render.
pub fn validate_ts_format(format: &str) -> Result<(), PipelineError> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(PipelineError::Encode(format!("invalid timestamp format {format:?}")));
    }
    Ok(())
}

/// Serializes a pack for an output.
pub trait Encoder: Send + Sync {
    fn encode(&self, pack: &PipelinePack) -> Result<Vec<u8>, PipelineError>;
}

/// Emits the message payload, optionally prefixed with its timestamp.
#[derive(Debug, Clone)]
pub struct PayloadEncoder {
    pub append_newlines: bool,
    pub prefix_ts: bool,
    pub ts_format: String,
}

impl Default for PayloadEncoder {
    fn default() -> Self {
        Self {
            append_newlines: true,
            prefix_ts: false,
            ts_format: DEFAULT_TS_FORMAT.to_string(),
        }
    }
}

impl Encoder for PayloadEncoder {
    fn encode(&self, pack: &PipelinePack) -> Result<Vec<u8>, PipelineError> {
        let payload = &pack.message.payload;
        let mut out = Vec::with_capacity(payload.len() + 32);
        if self.prefix_ts {
            let ts: DateTime<Utc> = DateTime::from_timestamp_nanos(pack.message.timestamp);
            let mut stamp = String::new();
            write!(stamp, "{} ", ts.format(&self.ts_format)).map_err(|_| {
                PipelineError::Encode(format!("invalid timestamp format {:?}", self.ts_format))
            })?;
            out.extend_from_slice(stamp.as_bytes());
        }
        out.extend_from_slice(payload.as_bytes());
        if self.append_newlines {
            out.push(b'\n');
        }
        Ok(out)
    }
}

/// Emits the whole message in the pipeline-native (JSON) encoding, the inverse
/// of [`crate::decoder::NativeDecoder`].
#[derive(Debug, Clone, Default)]
pub struct NativeEncoder;

impl Encoder for NativeEncoder {
    fn encode(&self, pack: &PipelinePack) -> Result<Vec<u8>, PipelineError> {
        Ok(serde_json::to_vec(&pack.message)?)
    }
}

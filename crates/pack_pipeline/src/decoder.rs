use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{
    error::PipelineError,
    message::{Field, Message},
    pack::PipelinePack,
    runner::InjectTx,
};

/// Turns the raw contents of a pack into structured message data.
///
/// The two capability flags let inputs decide, without inspecting concrete
/// types, whether they should hand the decoder untouched transport bytes.
pub trait Decoder: Send + Sync {
    fn decode(&self, pack: &mut PipelinePack) -> Result<(), PipelineError>;

    /// This decoder expects the pipeline-native byte encoding in `msg_bytes`.
    fn declares_raw_passthrough(&self) -> bool {
        false
    }

    /// For composite decoders: the first stage expects native bytes.
    fn first_stage_declares_raw_passthrough(&self) -> bool {
        false
    }
}

/// True when inputs feeding `decoder` should store raw bytes instead of
/// populating message fields.
pub fn wants_raw_bytes(decoder: &dyn Decoder) -> bool {
    decoder.declares_raw_passthrough() || decoder.first_stage_declares_raw_passthrough()
}

/// Decodes pipeline-native bytes (JSON serialized [`Message`]).
#[derive(Debug, Clone, Default)]
pub struct NativeDecoder;

impl Decoder for NativeDecoder {
    fn decode(&self, pack: &mut PipelinePack) -> Result<(), PipelineError> {
        if pack.msg_bytes.is_empty() {
            return Err(PipelineError::Decode("pack carries no message bytes".into()));
        }
        pack.message = serde_json::from_slice::<Message>(&pack.msg_bytes)?;
        pack.decoded = true;
        Ok(())
    }

    fn declares_raw_passthrough(&self) -> bool {
        true
    }
}

/// Runs every stage in order; the first failing stage aborts the chain.
#[derive(Clone, Default)]
pub struct MultiDecoder {
    pub stages: Vec<Arc<dyn Decoder>>,
}

impl MultiDecoder {
    pub fn new(stages: Vec<Arc<dyn Decoder>>) -> Self {
        Self { stages }
    }
}

impl Decoder for MultiDecoder {
    fn decode(&self, pack: &mut PipelinePack) -> Result<(), PipelineError> {
        for stage in &self.stages {
            stage.decode(pack)?;
        }
        Ok(())
    }

    fn first_stage_declares_raw_passthrough(&self) -> bool {
        self.stages
            .first()
            .map(|s| s.declares_raw_passthrough())
            .unwrap_or(false)
    }
}

/// Writes a fixed set of string fields onto every message.
#[derive(Debug, Clone, Default)]
pub struct ScribbleDecoder {
    pub fields: BTreeMap<String, String>,
}

impl ScribbleDecoder {
    pub fn new(fields: BTreeMap<String, String>) -> Self {
        Self { fields }
    }
}

impl Decoder for ScribbleDecoder {
    fn decode(&self, pack: &mut PipelinePack) -> Result<(), PipelineError> {
        for (name, value) in &self.fields {
            pack.message.set_field(Field::string(name.as_str(), value.as_str()));
        }
        pack.decoded = true;
        Ok(())
    }
}

/// The input side of a running decoder.
#[derive(Clone, Debug)]
pub struct DecoderInput {
    name: String,
    tx: mpsc::Sender<PipelinePack>,
}

impl DecoderInput {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hands a pack to the decoder, waiting while its queue is full.
    /// On failure the pack comes back so the caller can recycle it.
    pub async fn send(&self, pack: PipelinePack) -> Result<(), PipelinePack> {
        self.tx.send(pack).await.map_err(|e| e.0)
    }
}

/// Spawns the task that drains a decoder's queue into the router.
pub(crate) fn spawn_decoder_runner(
    name: String,
    decoder: Arc<dyn Decoder>,
    inject: InjectTx,
    capacity: usize,
) -> DecoderInput {
    let (tx, mut rx) = mpsc::channel::<PipelinePack>(capacity.max(1));
    let runner_name = name.clone();
    tokio::spawn(async move {
        while let Some(mut pack) = rx.recv().await {
            match decoder.decode(&mut pack) {
                Ok(()) => {
                    if let Err(err) = inject.send(pack).await {
                        error!(decoder = %runner_name, "router is gone, dropping decoded pack");
                        err.0.recycle();
                        break;
                    }
                }
                Err(err) => {
                    error!(decoder = %runner_name, "{err}");
                    pack.recycle();
                }
            }
        }
        debug!(decoder = %runner_name, "decoder runner exiting");
    });
    DecoderInput { name, tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_decoder_restores_a_serialized_message() {
        let mut original = Message::default();
        original.set_payload("inner");
        original.set_type("native");

        let mut pack = PipelinePack::new();
        pack.msg_bytes = serde_json::to_vec(&original).unwrap();
        NativeDecoder.decode(&mut pack).unwrap();
        assert_eq!(pack.message, original);
        assert!(pack.decoded);
    }

    #[test]
    fn native_decoder_rejects_empty_and_garbage_bytes() {
        let mut pack = PipelinePack::new();
        assert!(matches!(NativeDecoder.decode(&mut pack), Err(PipelineError::Decode(_))));
        pack.msg_bytes = b"not json".to_vec();
        assert!(matches!(NativeDecoder.decode(&mut pack), Err(PipelineError::Json(_))));
    }

    #[test]
    fn passthrough_capability_follows_the_first_stage() {
        let native_first = MultiDecoder::new(vec![
            Arc::new(NativeDecoder),
            Arc::new(ScribbleDecoder::default()),
        ]);
        let scribble_first = MultiDecoder::new(vec![
            Arc::new(ScribbleDecoder::default()),
            Arc::new(NativeDecoder),
        ]);
        assert!(wants_raw_bytes(&NativeDecoder));
        assert!(wants_raw_bytes(&native_first));
        assert!(!wants_raw_bytes(&scribble_first));
        assert!(!wants_raw_bytes(&MultiDecoder::default()));
        assert!(!wants_raw_bytes(&ScribbleDecoder::default()));
    }

    #[test]
    fn scribble_sets_every_configured_field() {
        let mut fields = BTreeMap::new();
        fields.insert("env".to_string(), "prod".to_string());
        fields.insert("team".to_string(), "ops".to_string());
        let mut pack = PipelinePack::new();
        ScribbleDecoder::new(fields).decode(&mut pack).unwrap();
        assert_eq!(pack.message.get_field_value("env").and_then(|v| v.as_str()), Some("prod"));
        assert_eq!(pack.message.get_field_value("team").and_then(|v| v.as_str()), Some("ops"));
    }
}

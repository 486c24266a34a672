use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::error;

use crate::{
    decoder::{Decoder, DecoderInput},
    encoder::Encoder,
    error::PipelineError,
    pack::{PackSupply, PipelinePack},
};

/// Sending half of the router's injection queue.
pub type InjectTx = mpsc::Sender<PipelinePack>;

/// What an input plugin sees of the pipeline while it runs.
#[async_trait]
pub trait InputRunner: Send + Sync {
    fn name(&self) -> &str;

    /// The pool this input draws packs from.
    fn pack_supply(&self) -> PackSupply;

    /// Hands a filled pack to the router. If the router is gone the pack is
    /// recycled here and an error is returned.
    async fn inject(&self, pack: PipelinePack) -> Result<(), PipelineError>;
}

/// What an output plugin sees of the pipeline while it runs.
#[async_trait]
pub trait OutputRunner: Send {
    fn name(&self) -> &str;

    fn encoder(&self) -> Option<Arc<dyn Encoder>>;

    fn encode(&self, pack: &PipelinePack) -> Result<Vec<u8>, PipelineError> {
        match self.encoder() {
            Some(encoder) => encoder.encode(pack),
            None => Err(PipelineError::Encode(format!("{} has no encoder", self.name()))),
        }
    }

    /// Next pack routed to this output; `None` once the router has shut down.
    /// Must be cancel safe, outputs race it against their stop signal.
    async fn next_pack(&mut self) -> Option<PipelinePack>;

    fn log_error(&self, err: &(dyn std::error::Error + Send + Sync)) {
        error!(target: "pack", output = %self.name(), "{err}");
    }
}

/// Lookups a plugin may perform against the running pipeline.
pub trait PluginHelper: Send + Sync {
    fn hostname(&self) -> &str;

    /// The registered decoder, for capability queries.
    fn decoder(&self, name: &str) -> Option<Arc<dyn Decoder>>;

    /// Input queue of a decoder instance dedicated to `runner_name`, started on
    /// first request.
    fn decoder_runner(&self, name: &str, runner_name: &str) -> Option<DecoderInput>;
}

#[derive(Clone, Debug)]
pub struct PluginInputRunner {
    name: String,
    supply: PackSupply,
    inject_tx: InjectTx,
}

impl PluginInputRunner {
    pub fn new(name: impl Into<String>, supply: PackSupply, inject_tx: InjectTx) -> Self {
        Self {
            name: name.into(),
            supply,
            inject_tx,
        }
    }
}

#[async_trait]
impl InputRunner for PluginInputRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn pack_supply(&self) -> PackSupply {
        self.supply.clone()
    }

    async fn inject(&self, pack: PipelinePack) -> Result<(), PipelineError> {
        if let Err(err) = self.inject_tx.send(pack).await {
            err.0.recycle();
            return Err(PipelineError::Closed("router".into()));
        }
        Ok(())
    }
}

pub struct PluginOutputRunner {
    name: String,
    encoder: Option<Arc<dyn Encoder>>,
    in_rx: mpsc::Receiver<PipelinePack>,
}

impl PluginOutputRunner {
    pub fn new(
        name: impl Into<String>,
        encoder: Option<Arc<dyn Encoder>>,
        in_rx: mpsc::Receiver<PipelinePack>,
    ) -> Self {
        Self {
            name: name.into(),
            encoder,
            in_rx,
        }
    }
}

#[async_trait]
impl OutputRunner for PluginOutputRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn encoder(&self) -> Option<Arc<dyn Encoder>> {
        self.encoder.clone()
    }

    async fn next_pack(&mut self) -> Option<PipelinePack> {
        self.in_rx.recv().await
    }
}

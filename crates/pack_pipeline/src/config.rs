use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::info;

use crate::{
    decoder::{Decoder, DecoderInput, spawn_decoder_runner},
    encoder::Encoder,
    error::PipelineError,
    pack::{PackSupply, PipelinePack},
    router::{OutputRoute, Router},
    runner::{InjectTx, PluginHelper, PluginInputRunner, PluginOutputRunner},
};

pub const DEFAULT_POOL_SIZE: usize = 100;
pub const DEFAULT_QUEUE_SIZE: usize = 30;

/// The shared state of one pipeline: pack pool, decoder registry and router
/// plumbing. Plugins reach it through [`PluginHelper`].
pub struct PipelineConfig {
    hostname: String,
    supply: PackSupply,
    queue_size: usize,
    decoders: DashMap<String, Arc<dyn Decoder>>,
    decoder_runners: DashMap<String, DecoderInput>,
    inject_tx: Mutex<Option<InjectTx>>,
    router_rx: Mutex<Option<mpsc::Receiver<PipelinePack>>>,
    routes: Mutex<Vec<OutputRoute>>,
}

impl PipelineConfig {
    pub fn new(hostname: impl Into<String>, pool_size: usize, queue_size: usize) -> Self {
        let queue_size = queue_size.max(1);
        let (inject_tx, router_rx) = mpsc::channel(queue_size);
        Self {
            hostname: hostname.into(),
            supply: PackSupply::new(pool_size),
            queue_size,
            decoders: DashMap::new(),
            decoder_runners: DashMap::new(),
            inject_tx: Mutex::new(Some(inject_tx)),
            router_rx: Mutex::new(Some(router_rx)),
            routes: Mutex::new(Vec::new()),
        }
    }

    pub fn pack_supply(&self) -> PackSupply {
        self.supply.clone()
    }

    pub fn register_decoder(&self, name: impl Into<String>, decoder: Arc<dyn Decoder>) {
        self.decoders.insert(name.into(), decoder);
    }

    fn injector(&self) -> Option<InjectTx> {
        self.inject_tx.lock().ok().and_then(|tx| tx.clone())
    }

    /// Runners created after [`PipelineConfig::close_injector`] fail every inject.
    pub fn input_runner(&self, name: impl Into<String>) -> PluginInputRunner {
        let inject_tx = self.injector().unwrap_or_else(|| mpsc::channel(1).0);
        PluginInputRunner::new(name, self.supply.clone(), inject_tx)
    }

    /// Drops the pipeline's own injection handles and the decoder runner
    /// queues. Once every input runner is gone too, the router drains, exits
    /// and closes the output channels, which lets outputs finish their backlog.
    pub fn close_injector(&self) {
        let dropped = self.inject_tx.lock().ok().and_then(|mut tx| tx.take());
        self.decoder_runners.clear();
        if dropped.is_some() {
            info!("pipeline injector closed");
        }
    }

    /// Registers a route and returns the runner that drains it. Routes must be
    /// added before [`PipelineConfig::start_router`].
    pub fn output_runner(
        &self,
        name: impl Into<String>,
        encoder: Option<Arc<dyn Encoder>>,
        matcher: Option<String>,
    ) -> PluginOutputRunner {
        let name = name.into();
        let (tx, rx) = mpsc::channel(self.queue_size);
        if let Ok(mut routes) = self.routes.lock() {
            routes.push(OutputRoute { name: name.clone(), matcher, tx });
        }
        PluginOutputRunner::new(name, encoder, rx)
    }

    /// Spawns the router. Can only be done once per pipeline.
    pub fn start_router(&self) -> Result<JoinHandle<()>, PipelineError> {
        let rx = self
            .router_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| PipelineError::Closed("router already started".into()))?;
        let routes = self
            .routes
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default();
        info!(outputs = routes.len(), "starting router");
        Ok(tokio::spawn(Router::new(rx, routes).run()))
    }
}

impl PluginHelper for PipelineConfig {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn decoder(&self, name: &str) -> Option<Arc<dyn Decoder>> {
        self.decoders.get(name).map(|d| d.value().clone())
    }

    fn decoder_runner(&self, name: &str, runner_name: &str) -> Option<DecoderInput> {
        let decoder = self.decoder(name)?;
        let inject_tx = self.injector()?;
        let input = self
            .decoder_runners
            .entry(runner_name.to_string())
            .or_insert_with(|| {
                spawn_decoder_runner(
                    runner_name.to_string(),
                    decoder,
                    inject_tx,
                    self.queue_size,
                )
            });
        Some(input.value().clone())
    }
}

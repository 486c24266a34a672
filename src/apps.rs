use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use pack_pipeline::{
    PipelineConfig,
    decoder::{Decoder, MultiDecoder, NativeDecoder, ScribbleDecoder},
    encoder::{DEFAULT_TS_FORMAT, Encoder, NativeEncoder, PayloadEncoder, validate_ts_format},
    runner::{InputRunner, OutputRunner, PluginOutputRunner},
};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::{
    config::{BridgeConfig, DecoderConfig, EncoderConfig},
    connection::ConnectionProvider,
    error::BridgeError,
    input::NatsInput,
    output::NatsOutput,
};

/// How long shutdown waits for adapters before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub type AdapterResult = (String, Result<(), BridgeError>);

/// Builds every named decoder, resolving `multi` stages by name.
pub fn build_decoders(
    confs: &BTreeMap<String, DecoderConfig>,
) -> Result<BTreeMap<String, Arc<dyn Decoder>>> {
    let mut built = BTreeMap::new();
    for name in confs.keys() {
        build_decoder(name, confs, &mut built, &mut Vec::new())?;
    }
    Ok(built)
}

fn build_decoder(
    name: &str,
    confs: &BTreeMap<String, DecoderConfig>,
    built: &mut BTreeMap<String, Arc<dyn Decoder>>,
    visiting: &mut Vec<String>,
) -> Result<Arc<dyn Decoder>> {
    if let Some(decoder) = built.get(name) {
        return Ok(decoder.clone());
    }
    if visiting.iter().any(|v| v == name) {
        bail!("decoder cycle: {} -> {name}", visiting.join(" -> "));
    }
    let conf = confs
        .get(name)
        .with_context(|| format!("unknown decoder \"{name}\""))?;

    visiting.push(name.to_string());
    let decoder: Arc<dyn Decoder> = match conf {
        DecoderConfig::Native => Arc::new(NativeDecoder),
        DecoderConfig::Scribble { fields } => Arc::new(ScribbleDecoder::new(fields.clone())),
        DecoderConfig::Multi { stages } => {
            if stages.is_empty() {
                bail!("multi decoder \"{name}\" has no stages");
            }
            let stages = stages
                .iter()
                .map(|stage| build_decoder(stage, confs, built, visiting))
                .collect::<Result<Vec<_>>>()?;
            Arc::new(MultiDecoder::new(stages))
        }
    };
    visiting.pop();

    built.insert(name.to_string(), decoder.clone());
    Ok(decoder)
}

pub fn build_encoder(conf: &EncoderConfig) -> Result<Arc<dyn Encoder>> {
    Ok(match conf {
        EncoderConfig::Payload { append_newlines, prefix_ts, ts_format } => {
            let ts_format = ts_format.clone().unwrap_or_else(|| DEFAULT_TS_FORMAT.to_string());
            validate_ts_format(&ts_format)?;
            Arc::new(PayloadEncoder {
                append_newlines: *append_newlines,
                prefix_ts: *prefix_ts,
                ts_format,
            })
        }
        EncoderConfig::Native => Arc::new(NativeEncoder),
    })
}

/// A wired bridge: one pipeline, its decoders, and every configured adapter.
pub struct App {
    pipeline: Arc<PipelineConfig>,
    inputs: Vec<(String, Arc<NatsInput>)>,
    outputs: Vec<(Arc<NatsOutput>, PluginOutputRunner)>,
    running_outputs: Vec<Arc<NatsOutput>>,
    router_task: Option<JoinHandle<()>>,
    input_tasks: JoinSet<AdapterResult>,
    output_tasks: JoinSet<AdapterResult>,
}

impl App {
    /// Builds and initializes everything without touching the network.
    /// `provider` replaces the NATS client for every adapter when given.
    pub fn bootstrap(
        config: &BridgeConfig,
        provider: Option<Arc<dyn ConnectionProvider>>,
    ) -> Result<Self> {
        let pipeline = Arc::new(PipelineConfig::new(
            config.hostname(),
            config.pool_size,
            config.queue_size,
        ));
        for (name, decoder) in build_decoders(&config.decoders)? {
            pipeline.register_decoder(name, decoder);
        }

        let mut outputs = Vec::with_capacity(config.outputs.len());
        for (name, conf) in &config.outputs {
            let encoder = match &conf.encoder {
                Some(encoder) => {
                    let encoder_conf = config.encoders.get(encoder).with_context(|| {
                        format!("output \"{name}\" uses unknown encoder \"{encoder}\"")
                    })?;
                    let built = build_encoder(encoder_conf)
                        .with_context(|| format!("encoder \"{encoder}\" is invalid"))?;
                    Some(built)
                }
                None => {
                    warn!(output = %name, "no encoder configured, this output will refuse to run");
                    None
                }
            };
            let mut output = NatsOutput::new(conf.clone());
            if let Some(provider) = &provider {
                output = output.with_connection_provider(provider.clone());
            }
            output
                .init()
                .with_context(|| format!("output \"{name}\" failed to initialize"))?;
            let runner = pipeline.output_runner(name.as_str(), encoder, conf.message_matcher.clone());
            outputs.push((Arc::new(output), runner));
        }

        let mut inputs = Vec::with_capacity(config.inputs.len());
        for (name, conf) in &config.inputs {
            let mut input = NatsInput::new(conf.clone());
            if let Some(provider) = &provider {
                input = input.with_connection_provider(provider.clone());
            }
            input
                .init(pipeline.as_ref())
                .with_context(|| format!("input \"{name}\" failed to initialize"))?;
            inputs.push((name.clone(), Arc::new(input)));
        }

        Ok(Self {
            pipeline,
            inputs,
            outputs,
            running_outputs: Vec::new(),
            router_task: None,
            input_tasks: JoinSet::new(),
            output_tasks: JoinSet::new(),
        })
    }

    pub fn pipeline(&self) -> Arc<PipelineConfig> {
        self.pipeline.clone()
    }

    pub fn adapter_count(&self) -> usize {
        self.inputs.len() + self.outputs.len() + self.running_outputs.len()
    }

    /// Starts the router, then every output, then every input.
    pub fn start(&mut self) -> Result<()> {
        self.router_task = Some(self.pipeline.start_router()?);

        for (output, mut runner) in self.outputs.drain(..) {
            let task_output = output.clone();
            let name = format!("output {}", runner.name());
            self.output_tasks.spawn(async move {
                let result = task_output.run(&mut runner).await;
                (name, result)
            });
            self.running_outputs.push(output);
        }

        for (name, input) in &self.inputs {
            let runner: Arc<dyn InputRunner> = Arc::new(self.pipeline.input_runner(name.as_str()));
            let pipeline = self.pipeline.clone();
            let input = input.clone();
            let name = format!("input {name}");
            self.input_tasks.spawn(async move {
                let result = input.run(runner, pipeline.as_ref()).await;
                (name, result)
            });
        }
        info!(
            adapters = self.input_tasks.len() + self.output_tasks.len(),
            "nats bridge started"
        );
        Ok(())
    }

    /// Resolves when the first adapter exits; `None` if none are running.
    pub async fn next_exit(&mut self) -> Option<AdapterResult> {
        let joined = tokio::select! {
            Some(done) = self.input_tasks.join_next() => done,
            Some(done) = self.output_tasks.join_next() => done,
            else => return None,
        };
        Some(flatten(joined))
    }

    /// Stops the inputs, then lets the outputs publish whatever is still in
    /// the pipeline. Outputs are only stopped if they miss the grace period.
    pub async fn shutdown(&mut self) -> Vec<AdapterResult> {
        let mut results = Vec::new();
        for (_, input) in &self.inputs {
            input.stop();
        }
        if !collect(&mut self.input_tasks, &mut results).await {
            error!("inputs did not stop within {SHUTDOWN_GRACE:?}, aborting them");
            self.input_tasks.abort_all();
            collect(&mut self.input_tasks, &mut results).await;
        }

        // the router exits once the last injector is gone, closing every output channel
        self.pipeline.close_injector();
        if !collect(&mut self.output_tasks, &mut results).await {
            warn!("outputs still draining after {SHUTDOWN_GRACE:?}, stopping them");
            for output in &self.running_outputs {
                output.stop();
            }
            if !collect(&mut self.output_tasks, &mut results).await {
                error!("outputs did not stop, aborting them");
                self.output_tasks.abort_all();
                collect(&mut self.output_tasks, &mut results).await;
            }
        }

        if let Some(mut router) = self.router_task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut router).await.is_err() {
                warn!("router still busy after shutdown, aborting it");
                router.abort();
            }
        }
        results
    }
}

fn flatten(joined: Result<AdapterResult, JoinError>) -> AdapterResult {
    joined.unwrap_or_else(|err| ("adapter task".to_string(), Err(BridgeError::Task(err.to_string()))))
}

/// Joins every task in `tasks`, giving up after [`SHUTDOWN_GRACE`]. Returns
/// whether the set was emptied.
async fn collect(tasks: &mut JoinSet<AdapterResult>, results: &mut Vec<AdapterResult>) -> bool {
    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            results.push(flatten(joined));
        }
    };
    tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi(stages: &[&str]) -> DecoderConfig {
        DecoderConfig::Multi {
            stages: stages.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn multi_decoders_resolve_their_stages() {
        let mut confs = BTreeMap::new();
        confs.insert("native".to_string(), DecoderConfig::Native);
        confs.insert("tag".to_string(), DecoderConfig::Scribble { fields: BTreeMap::new() });
        confs.insert("chain".to_string(), multi(&["native", "tag"]));

        let built = build_decoders(&confs).unwrap();
        assert_eq!(built.len(), 3);
        assert!(pack_pipeline::decoder::wants_raw_bytes(built["chain"].as_ref()));
        assert!(!pack_pipeline::decoder::wants_raw_bytes(built["tag"].as_ref()));
    }

    #[test]
    fn decoder_cycles_and_unknown_stages_are_rejected() {
        let mut confs = BTreeMap::new();
        confs.insert("a".to_string(), multi(&["b"]));
        confs.insert("b".to_string(), multi(&["a"]));
        let err = build_decoders(&confs).err().unwrap();
        assert!(err.to_string().contains("cycle"));

        let mut confs = BTreeMap::new();
        confs.insert("a".to_string(), multi(&["missing"]));
        assert!(build_decoders(&confs).is_err());

        let mut confs = BTreeMap::new();
        confs.insert("empty".to_string(), multi(&[]));
        assert!(build_decoders(&confs).is_err());
    }

    #[test]
    fn payload_encoder_defaults_its_timestamp_format() {
        let mut pack = pack_pipeline::PipelinePack::new();
        pack.message.set_payload("body");
        let encoder = build_encoder(&EncoderConfig::Payload {
            append_newlines: true,
            prefix_ts: false,
            ts_format: None,
        })
        .unwrap();
        assert_eq!(encoder.encode(&pack).unwrap(), b"body\n");

        let bogus = build_encoder(&EncoderConfig::Payload {
            append_newlines: true,
            prefix_ts: true,
            ts_format: Some("%Q bogus".into()),
        });
        assert!(bogus.is_err());
    }
}

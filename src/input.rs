use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pack_pipeline::{
    Field, PackSupply,
    decoder::{DecoderInput, wants_raw_bytes},
    runner::{InputRunner, PluginHelper},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::NatsInputConfig,
    connection::{ConnectionProvider, MessageHandler, Msg, Options},
    error::BridgeError,
    lifecycle::{AdapterState, StateCell, StopSignal},
    nats::NatsConnectionProvider,
};

/// Message type stamped on every pack built from freeform text.
pub const INPUT_MESSAGE_TYPE: &str = "nats.input";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Requested,
    ConnectionClosed,
}

/// Subscribes to one subject and feeds every message into the pipeline.
pub struct NatsInput {
    config: NatsInputConfig,
    provider: Arc<dyn ConnectionProvider>,
    options: Option<Options>,
    use_msg_bytes: bool,
    stop: Option<StopSignal<Shutdown>>,
    state: StateCell,
}

impl NatsInput {
    pub fn new(config: NatsInputConfig) -> Self {
        Self {
            config,
            provider: Arc::new(NatsConnectionProvider),
            options: None,
            use_msg_bytes: false,
            stop: None,
            state: StateCell::default(),
        }
    }

    pub fn with_connection_provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn config(&self) -> &NatsInputConfig {
        &self.config
    }

    pub fn state(&self) -> AdapterState {
        self.state.get()
    }

    /// Whether inbound bytes are stored untouched for a native decoder.
    pub fn use_msg_bytes(&self) -> bool {
        self.use_msg_bytes
    }

    /// Validates the configuration, derives connection options and settles
    /// raw passthrough mode. `helper` is only used to query the decoder.
    pub fn init(&mut self, helper: &dyn PluginHelper) -> Result<(), BridgeError> {
        let state = self.state.get();
        if matches!(state, AdapterState::Running | AdapterState::Stopped) {
            return Err(BridgeError::config(format!("cannot init an input that is {state:?}")));
        }
        if self.config.subject.trim().is_empty() {
            return Err(BridgeError::config("subject is required"));
        }

        self.use_msg_bytes = match (self.config.use_msg_bytes, &self.config.decoder_name) {
            (Some(flag), _) => flag,
            (None, Some(name)) => {
                let decoder = helper
                    .decoder(name)
                    .ok_or_else(|| BridgeError::config(format!("decoder {name} is not registered")))?;
                wants_raw_bytes(decoder.as_ref())
            }
            (None, None) => false,
        };

        let stop = StopSignal::new();
        let options = Options::from_config(&self.config.connection)?
            .with_closed_callback(stop.hook(|| Shutdown::ConnectionClosed));
        self.options = Some(options);
        self.stop = Some(stop);
        self.state.initialize()
    }

    /// Connects, subscribes and blocks until stopped. A connection the
    /// transport gives up on counts as a stop.
    pub async fn run(
        &self,
        runner: Arc<dyn InputRunner>,
        helper: &dyn PluginHelper,
    ) -> Result<(), BridgeError> {
        self.state.start()?;
        let result = self.serve(runner, helper).await;
        self.state.set(AdapterState::Stopped);
        result
    }

    async fn serve(
        &self,
        runner: Arc<dyn InputRunner>,
        helper: &dyn PluginHelper,
    ) -> Result<(), BridgeError> {
        let (options, stop) = match (&self.options, &self.stop) {
            (Some(options), Some(stop)) => (options, stop),
            _ => return Err(BridgeError::config("input was never initialized")),
        };
        let mut waiter = stop
            .take_waiter()
            .ok_or_else(|| BridgeError::config("input is already running"))?;

        let route = match &self.config.decoder_name {
            Some(decoder) => {
                let runner_name = format!("{}-{}", runner.name(), decoder);
                let input = helper
                    .decoder_runner(decoder, &runner_name)
                    .ok_or_else(|| BridgeError::NotFound(format!("decoder runner {runner_name}")))?;
                Route::Decoder(input)
            }
            None => Route::Inject(runner.clone()),
        };
        let handler = Arc::new(InboundHandler {
            input: runner.name().to_string(),
            supply: runner.pack_supply(),
            hostname: helper.hostname().to_string(),
            use_msg_bytes: self.use_msg_bytes,
            route,
        });

        let conn = self.provider.connect(options).await?;
        if let Err(err) = conn.subscribe(&self.config.subject, handler).await {
            conn.close().await;
            return Err(err);
        }
        info!(input = %runner.name(), subject = %self.config.subject, "📥 NATS input subscribed");

        match waiter.wait().await {
            Some(Shutdown::ConnectionClosed) => {
                warn!(input = %runner.name(), "🔌 NATS connection closed, stopping input")
            }
            _ => info!(input = %runner.name(), "🛑 NATS input stopping"),
        }
        conn.close().await;
        Ok(())
    }

    /// Asks a running (or about to run) input to stop. Does nothing before
    /// `init`; repeated calls are ignored.
    pub fn stop(&self) {
        if let Some(stop) = &self.stop {
            if !stop.signal(Shutdown::Requested) {
                debug!(subject = %self.config.subject, "stop already pending");
            }
        }
    }
}

enum Route {
    Decoder(DecoderInput),
    Inject(Arc<dyn InputRunner>),
}

struct InboundHandler {
    input: String,
    supply: PackSupply,
    hostname: String,
    use_msg_bytes: bool,
    route: Route,
}

#[async_trait]
impl MessageHandler for InboundHandler {
    async fn on_message(&self, msg: Msg) {
        // an empty pool parks the subscription here
        let mut pack = match self.supply.acquire().await {
            Ok(pack) => pack,
            Err(err) => {
                error!(input = %self.input, "dropping message from {}: {err}", msg.subject);
                return;
            }
        };

        if self.use_msg_bytes {
            pack.msg_bytes.extend_from_slice(&msg.data);
        } else {
            let message = &mut pack.message;
            message.set_uuid(Uuid::new_v4());
            message.set_timestamp(Utc::now().timestamp_nanos_opt().unwrap_or_default());
            message.set_type(INPUT_MESSAGE_TYPE);
            message.set_hostname(self.hostname.as_str());
            message.set_payload(String::from_utf8_lossy(&msg.data));
            message.add_field(Field::string("subject", msg.subject.as_str()));
        }

        match &self.route {
            Route::Decoder(decoder) => {
                if let Err(pack) = decoder.send(pack).await {
                    warn!(input = %self.input, decoder = %decoder.name(), "decoder is gone, recycling pack");
                    pack.recycle();
                }
            }
            Route::Inject(runner) => {
                if let Err(err) = runner.inject(pack).await {
                    warn!(input = %self.input, "inject failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_conn::MockConnectionProvider;
    use pack_pipeline::{PipelineConfig, decoder::NativeDecoder};

    fn mock_input(config: NatsInputConfig) -> (NatsInput, Arc<MockConnectionProvider>) {
        let provider = MockConnectionProvider::new();
        let input = NatsInput::new(config).with_connection_provider(provider.clone());
        (input, provider)
    }

    #[test]
    fn init_requires_a_subject() {
        let pipeline = PipelineConfig::new("host", 1, 1);
        let (mut input, _) = mock_input(NatsInputConfig::new(" "));
        assert!(matches!(input.init(&pipeline), Err(BridgeError::Config(_))));
        assert_eq!(input.state(), AdapterState::Created);
    }

    #[test]
    fn passthrough_is_inferred_from_the_decoder() {
        let pipeline = PipelineConfig::new("host", 1, 1);
        pipeline.register_decoder("native", Arc::new(NativeDecoder));

        let mut config = NatsInputConfig::new("test");
        config.decoder_name = Some("native".into());
        let (mut input, _) = mock_input(config.clone());
        input.init(&pipeline).unwrap();
        assert!(input.use_msg_bytes());
        assert_eq!(input.state(), AdapterState::Initialized);

        config.use_msg_bytes = Some(false);
        let (mut explicit, _) = mock_input(config.clone());
        explicit.init(&pipeline).unwrap();
        assert!(!explicit.use_msg_bytes());

        config.use_msg_bytes = None;
        config.decoder_name = Some("missing".into());
        let (mut missing, _) = mock_input(config);
        assert!(matches!(missing.init(&pipeline), Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn run_before_init_is_a_config_error() {
        let pipeline = PipelineConfig::new("host", 1, 1);
        let (input, provider) = mock_input(NatsInputConfig::new("test"));
        input.stop();
        let runner: Arc<dyn InputRunner> = Arc::new(pipeline.input_runner("in"));
        assert!(matches!(input.run(runner, &pipeline).await, Err(BridgeError::Config(_))));
        assert_eq!(provider.connect_count(), 0);
    }

    #[tokio::test]
    async fn missing_decoder_runner_is_not_found() {
        let pipeline = PipelineConfig::new("host", 1, 1);
        let mut config = NatsInputConfig::new("test");
        config.decoder_name = Some("gone".into());
        config.use_msg_bytes = Some(true);
        let (mut input, provider) = mock_input(config);
        input.init(&pipeline).unwrap();

        let runner: Arc<dyn InputRunner> = Arc::new(pipeline.input_runner("in"));
        assert!(matches!(input.run(runner, &pipeline).await, Err(BridgeError::NotFound(_))));
        assert_eq!(provider.connect_count(), 0);
        assert_eq!(input.state(), AdapterState::Stopped);
    }

    #[tokio::test]
    async fn connect_failure_is_propagated() {
        let pipeline = PipelineConfig::new("host", 1, 1);
        let (mut input, provider) = mock_input(NatsInputConfig::new("test"));
        provider.fail_connect(true);
        input.init(&pipeline).unwrap();

        let runner: Arc<dyn InputRunner> = Arc::new(pipeline.input_runner("in"));
        assert!(matches!(input.run(runner, &pipeline).await, Err(BridgeError::Connection(_))));
    }
}

use std::sync::Arc;

use bytes::Bytes;
use pack_pipeline::runner::OutputRunner;
use tracing::{debug, info, warn};

use crate::{
    config::NatsOutputConfig,
    connection::{ConnectionProvider, Options},
    error::BridgeError,
    lifecycle::{AdapterState, StateCell, StopSignal},
    nats::NatsConnectionProvider,
};

/// Publishes every pack routed to it on one subject.
pub struct NatsOutput {
    config: NatsOutputConfig,
    provider: Arc<dyn ConnectionProvider>,
    options: Option<Options>,
    // Ok(()) for a requested stop, the error for an abnormal close
    stop: Option<StopSignal<Result<(), BridgeError>>>,
    state: StateCell,
}

impl NatsOutput {
    pub fn new(config: NatsOutputConfig) -> Self {
        Self {
            config,
            provider: Arc::new(NatsConnectionProvider),
            options: None,
            stop: None,
            state: StateCell::default(),
        }
    }

    pub fn with_connection_provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn config(&self) -> &NatsOutputConfig {
        &self.config
    }

    pub fn state(&self) -> AdapterState {
        self.state.get()
    }

    pub fn init(&mut self) -> Result<(), BridgeError> {
        let state = self.state.get();
        if matches!(state, AdapterState::Running | AdapterState::Stopped) {
            return Err(BridgeError::config(format!("cannot init an output that is {state:?}")));
        }
        if self.config.subject.trim().is_empty() {
            return Err(BridgeError::config("subject is required"));
        }
        let stop = StopSignal::new();
        let options = Options::from_config(&self.config.connection)?
            .with_closed_callback(stop.hook(|| Err(BridgeError::ConnectionClosed)));
        self.options = Some(options);
        self.stop = Some(stop);
        self.state.initialize()
    }

    /// Drains `runner` onto the subject until the pipeline closes the channel
    /// (`Ok`), `stop` is called (`Ok`) or the transport closes the connection
    /// (`Err(ConnectionClosed)`). Encode and publish failures are logged and
    /// the pack dropped; every pack pulled is recycled exactly once.
    pub async fn run<R>(&self, runner: &mut R) -> Result<(), BridgeError>
    where
        R: OutputRunner + ?Sized,
    {
        self.state.start()?;
        let result = self.serve(runner).await;
        self.state.set(AdapterState::Stopped);
        result
    }

    async fn serve<R>(&self, runner: &mut R) -> Result<(), BridgeError>
    where
        R: OutputRunner + ?Sized,
    {
        let (options, stop) = match (&self.options, &self.stop) {
            (Some(options), Some(stop)) => (options, stop),
            _ => return Err(BridgeError::config("output was never initialized")),
        };
        if runner.encoder().is_none() {
            return Err(BridgeError::config("encoder required"));
        }
        let mut waiter = stop
            .take_waiter()
            .ok_or_else(|| BridgeError::config("output is already running"))?;

        let conn = self.provider.connect(options).await?;
        info!(output = %runner.name(), subject = %self.config.subject, "📤 NATS output publishing");

        let result = loop {
            tokio::select! {
                queued = waiter.wait() => break queued.unwrap_or(Ok(())),
                next = runner.next_pack() => {
                    let Some(pack) = next else {
                        debug!(output = %runner.name(), "pipeline closed the output channel");
                        break Ok(());
                    };
                    let encoded = runner.encode(&pack);
                    let outcome = match encoded {
                        Ok(bytes) => conn.publish(&self.config.subject, Bytes::from(bytes)).await,
                        Err(err) => Err(BridgeError::from(err)),
                    };
                    pack.recycle();
                    if let Err(err) = outcome {
                        runner.log_error(&err);
                    }
                }
            }
        };

        match &result {
            Ok(()) => info!(output = %runner.name(), "🛑 NATS output stopping"),
            Err(err) => warn!(output = %runner.name(), "🔌 NATS output ending: {err}"),
        }
        conn.close().await;
        result
    }

    /// Ends a running output gracefully. Does nothing before `init`.
    pub fn stop(&self) {
        if let Some(stop) = &self.stop {
            if !stop.signal(Ok(())) {
                debug!(subject = %self.config.subject, "stop already pending");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_conn::MockConnectionProvider;
    use pack_pipeline::PipelineConfig;

    #[test]
    fn init_validates_subject_and_urls() {
        let mut missing = NatsOutput::new(NatsOutputConfig::new(""));
        assert!(matches!(missing.init(), Err(BridgeError::Config(_))));

        let mut config = NatsOutputConfig::new("out");
        config.connection.url = "http://wrong".into();
        let mut bad_url = NatsOutput::new(config);
        assert!(matches!(bad_url.init(), Err(BridgeError::Config(_))));
        assert_eq!(bad_url.state(), AdapterState::Created);
    }

    #[tokio::test]
    async fn missing_encoder_fails_before_connecting() {
        let pipeline = PipelineConfig::new("host", 1, 1);
        let provider = MockConnectionProvider::new();
        let mut output =
            NatsOutput::new(NatsOutputConfig::new("test")).with_connection_provider(provider.clone());
        output.init().unwrap();

        let mut runner = pipeline.output_runner("out", None, None);
        let err = output.run(&mut runner).await.unwrap_err();
        assert!(matches!(err, BridgeError::Config(ref msg) if msg == "encoder required"));
        assert_eq!(provider.connect_count(), 0);
        assert_eq!(output.state(), AdapterState::Stopped);
    }
}

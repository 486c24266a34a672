use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use nats_bridge::{
    BridgeError, NatsOutput,
    config::NatsOutputConfig,
    lifecycle::AdapterState,
    mock_conn::MockConnectionProvider,
};
use pack_pipeline::{
    PackSupply, PipelineError, PipelinePack,
    encoder::Encoder,
    runner::OutputRunner,
};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};

const WAIT: Duration = Duration::from_secs(2);

struct Fixed(&'static [u8]);

impl Encoder for Fixed {
    fn encode(&self, _pack: &PipelinePack) -> Result<Vec<u8>, PipelineError> {
        Ok(self.0.to_vec())
    }
}

struct Broken;

impl Encoder for Broken {
    fn encode(&self, _pack: &PipelinePack) -> Result<Vec<u8>, PipelineError> {
        Err(PipelineError::Encode("broken on purpose".into()))
    }
}

/// Output runner that counts the errors reported to it.
struct CountingRunner {
    encoder: Option<Arc<dyn Encoder>>,
    rx: mpsc::Receiver<PipelinePack>,
    errors: Arc<AtomicUsize>,
}

#[async_trait]
impl OutputRunner for CountingRunner {
    fn name(&self) -> &str {
        "counting"
    }

    fn encoder(&self) -> Option<Arc<dyn Encoder>> {
        self.encoder.clone()
    }

    async fn next_pack(&mut self) -> Option<PipelinePack> {
        self.rx.recv().await
    }

    fn log_error(&self, _err: &(dyn std::error::Error + Send + Sync)) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    supply: PackSupply,
    tx: mpsc::Sender<PipelinePack>,
    errors: Arc<AtomicUsize>,
    provider: Arc<MockConnectionProvider>,
    output: Arc<NatsOutput>,
}

impl Harness {
    fn new(encoder: Option<Arc<dyn Encoder>>) -> (Self, CountingRunner) {
        let (tx, rx) = mpsc::channel(4);
        let errors = Arc::new(AtomicUsize::new(0));
        let provider = MockConnectionProvider::new();
        let mut output =
            NatsOutput::new(NatsOutputConfig::new("test")).with_connection_provider(provider.clone());
        output.init().unwrap();
        let runner = CountingRunner {
            encoder,
            rx,
            errors: errors.clone(),
        };
        let harness = Self {
            supply: PackSupply::new(3),
            tx,
            errors,
            provider,
            output: Arc::new(output),
        };
        (harness, runner)
    }

    fn spawn(&self, mut runner: CountingRunner) -> JoinHandle<Result<(), BridgeError>> {
        let output = self.output.clone();
        tokio::spawn(async move { output.run(&mut runner).await })
    }

    async fn send(&self, payload: &str) {
        let mut pack = self.supply.acquire().await.unwrap();
        pack.message.set_payload(payload);
        self.tx.send(pack).await.unwrap();
    }
}

async fn finish(task: JoinHandle<Result<(), BridgeError>>) -> Result<(), BridgeError> {
    timeout(WAIT, task).await.expect("run should return").unwrap()
}

#[tokio::test]
async fn encoded_bytes_are_published_on_the_subject() {
    let (h, runner) = Harness::new(Some(Arc::new(Fixed(b"known bytes"))));
    let task = h.spawn(runner);

    h.send("ignored by the encoder").await;
    let published = timeout(WAIT, h.provider.connection().next_published())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(published.subject, "test");
    assert_eq!(published.data, Bytes::from_static(b"known bytes"));

    drop(h.tx);
    finish(task).await.unwrap();
    assert_eq!(h.supply.available(), h.supply.size());
    assert_eq!(h.provider.connection().published().len(), 1);
    assert_eq!(h.provider.connection().close_count(), 1);
    assert_eq!(h.output.state(), AdapterState::Stopped);
}

#[tokio::test]
async fn encode_failures_are_logged_and_recycled() {
    let (h, runner) = Harness::new(Some(Arc::new(Broken)));
    let task = h.spawn(runner);

    h.send("a").await;
    h.send("b").await;
    drop(h.tx);
    finish(task).await.unwrap();

    assert_eq!(h.errors.load(Ordering::SeqCst), 2);
    assert_eq!(h.supply.available(), h.supply.size());
    assert!(h.provider.connection().published().is_empty());
}

#[tokio::test]
async fn publish_failures_are_logged_and_recycled() {
    let (h, runner) = Harness::new(Some(Arc::new(Fixed(b"x"))));
    h.provider.connection().fail_publishes(true);
    let task = h.spawn(runner);

    h.send("a").await;
    h.send("b").await;
    h.send("c").await;
    drop(h.tx);
    finish(task).await.unwrap();

    assert_eq!(h.errors.load(Ordering::SeqCst), 3);
    assert_eq!(h.supply.available(), h.supply.size());
}

#[tokio::test]
async fn missing_encoder_never_connects() {
    let (h, runner) = Harness::new(None);
    let result = finish(h.spawn(runner)).await;
    assert!(matches!(result, Err(BridgeError::Config(ref msg)) if msg == "encoder required"));
    assert_eq!(h.provider.connect_count(), 0);
    assert_eq!(h.provider.connection().close_count(), 0);
}

#[tokio::test]
async fn remote_close_is_reported_as_an_error() {
    let (h, runner) = Harness::new(Some(Arc::new(Fixed(b"x"))));
    let task = h.spawn(runner);

    timeout(WAIT, h.provider.wait_for_connect()).await.unwrap();
    h.provider.close_remotely();
    assert!(matches!(finish(task).await, Err(BridgeError::ConnectionClosed)));
    assert_eq!(h.provider.connection().close_count(), 1);
}

#[tokio::test]
async fn stop_ends_the_run_gracefully() {
    let (h, runner) = Harness::new(Some(Arc::new(Fixed(b"x"))));
    let task = h.spawn(runner);

    timeout(WAIT, h.provider.wait_for_connect()).await.unwrap();
    h.output.stop();
    h.output.stop();
    finish(task).await.unwrap();
    assert_eq!(h.provider.connection().close_count(), 1);
}

#[tokio::test]
async fn connect_failure_is_returned() {
    let (h, runner) = Harness::new(Some(Arc::new(Fixed(b"x"))));
    h.provider.fail_connect(true);
    assert!(matches!(finish(h.spawn(runner)).await, Err(BridgeError::Connection(_))));
    assert_eq!(h.provider.connection().close_count(), 0);
}

#[tokio::test]
async fn a_stopped_output_cannot_run_again() {
    let (h, runner) = Harness::new(Some(Arc::new(Fixed(b"x"))));
    h.output.stop();
    finish(h.spawn(runner)).await.unwrap();

    let (_tx, rx) = mpsc::channel(1);
    let again = CountingRunner {
        encoder: Some(Arc::new(Fixed(b"x"))),
        rx,
        errors: Arc::new(AtomicUsize::new(0)),
    };
    assert!(matches!(finish(h.spawn(again)).await, Err(BridgeError::Config(_))));
    assert_eq!(h.provider.connect_count(), 1);
}

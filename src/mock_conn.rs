//! In-memory transport for tests: messages are fed in by hand and publishes
//! are recorded instead of leaving the process.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    connection::{Connection, ConnectionProvider, MessageHandler, Msg, Options, Subscription},
    error::BridgeError,
};

pub struct MockConnection {
    inbound_tx: mpsc::UnboundedSender<Msg>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Msg>>>,
    published_tx: mpsc::UnboundedSender<Msg>,
    published_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Msg>>,
    published: Mutex<Vec<Msg>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    fail_publishes: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
    handled: Arc<AtomicUsize>,
    closed: AtomicBool,
    close_count: AtomicUsize,
    next_id: AtomicU64,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            published_tx,
            published_rx: tokio::sync::Mutex::new(published_rx),
            published: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            fail_publishes: AtomicBool::new(false),
            publish_delay: Mutex::new(None),
            handled: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    /// Queues an inbound message. Messages sent before anyone subscribes are
    /// delivered once the subscription starts.
    pub fn deliver(&self, msg: Msg) {
        if self.inbound_tx.send(msg).is_err() {
            debug!("mock subscription is gone, dropping inbound message");
        }
    }

    /// Waits for the next recorded publish.
    pub async fn next_published(&self) -> Option<Msg> {
        self.published_rx.lock().await.recv().await
    }

    pub fn published(&self) -> Vec<Msg> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Makes every publish take `delay` before it is recorded.
    pub fn slow_publishes(&self, delay: Duration) {
        if let Ok(mut slot) = self.publish_delay.lock() {
            *slot = Some(delay);
        }
    }

    /// Inbound messages the subscriber's handler has finished with.
    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn publish(&self, subject: &str, data: Bytes) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BridgeError::Publish(format!("mock refused publish to {subject}")));
        }
        let delay = self.publish_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let msg = Msg::new(subject, data);
        if let Ok(mut published) = self.published.lock() {
            published.push(msg.clone());
        }
        let _ = self.published_tx.send(msg);
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }
        let mut rx = self
            .inbound_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| BridgeError::Connection("mock supports a single subscription".into()))?;
        let subject = subject.to_string();
        let filter = subject.clone();
        let handled = self.handled.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if msg.subject == filter {
                    handler.on_message(msg).await;
                    handled.fetch_add(1, Ordering::SeqCst);
                } else {
                    debug!(subject = %msg.subject, "mock dropped message for another subject");
                }
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
        Ok(Subscription {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            subject,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        let tasks = self
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
    }
}

/// Hands out one shared [`MockConnection`] and remembers the options it was
/// asked to connect with.
pub struct MockConnectionProvider {
    connection: Arc<MockConnection>,
    options: Mutex<Option<Options>>,
    fail_connect: AtomicBool,
    connects: watch::Sender<usize>,
}

impl MockConnectionProvider {
    pub fn new() -> Arc<Self> {
        Self::with_connection(MockConnection::new())
    }

    pub fn with_connection(connection: Arc<MockConnection>) -> Arc<Self> {
        let (connects, _) = watch::channel(0);
        Arc::new(Self {
            connection,
            options: Mutex::new(None),
            fail_connect: AtomicBool::new(false),
            connects,
        })
    }

    pub fn connection(&self) -> Arc<MockConnection> {
        self.connection.clone()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        *self.connects.borrow()
    }

    pub async fn wait_for_connect(&self) {
        let mut rx = self.connects.subscribe();
        let _ = rx.wait_for(|count| *count > 0).await;
    }

    pub fn options(&self) -> Option<Options> {
        self.options.lock().ok().and_then(|o| o.clone())
    }

    /// Simulates the server dropping the connection for good: the connection
    /// stops working and the closed hook of the last connect fires.
    pub fn close_remotely(&self) {
        self.connection.closed.store(true, Ordering::SeqCst);
        if let Some(options) = self.options() {
            options.notify_closed();
        }
    }
}

#[async_trait]
impl ConnectionProvider for MockConnectionProvider {
    async fn connect(&self, options: &Options) -> Result<Arc<dyn Connection>, BridgeError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection(format!("mock refused {}", options.url)));
        }
        if let Ok(mut stored) = self.options.lock() {
            *stored = Some(options.clone());
        }
        self.connects.send_modify(|count| *count += 1);
        Ok(self.connection.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    struct Collect(mpsc::UnboundedSender<Msg>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn on_message(&self, msg: Msg) {
            let _ = self.0.send(msg);
        }
    }

    #[tokio::test]
    async fn delivers_in_order_to_the_single_subscriber() {
        let conn = MockConnection::new();
        conn.deliver(Msg::new("a", "1"));
        conn.deliver(Msg::new("b", "skip"));
        conn.deliver(Msg::new("a", "2"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe("a", Arc::new(Collect(tx.clone()))).await.unwrap();
        assert!(conn.subscribe("a", Arc::new(Collect(tx))).await.is_err());

        assert_eq!(rx.recv().await.unwrap().data, Bytes::from("1"));
        assert_eq!(rx.recv().await.unwrap().data, Bytes::from("2"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conn.handled(), 2);
    }

    #[tokio::test]
    async fn records_publishes_until_closed() {
        let conn = MockConnection::new();
        conn.publish("out", Bytes::from("x")).await.unwrap();
        assert_eq!(conn.next_published().await, Some(Msg::new("out", "x")));

        conn.fail_publishes(true);
        assert!(matches!(conn.publish("out", Bytes::new()).await, Err(BridgeError::Publish(_))));

        conn.close().await;
        assert!(matches!(
            conn.publish("out", Bytes::new()).await,
            Err(BridgeError::ConnectionClosed)
        ));
        assert_eq!(conn.close_count(), 1);
        assert_eq!(conn.published().len(), 1);
    }

    #[tokio::test]
    async fn provider_counts_connects_and_fires_the_closed_hook() {
        let provider = MockConnectionProvider::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let options = Options::from_config(&ConnectionConfig::default())
            .unwrap()
            .with_closed_callback(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        provider.fail_connect(true);
        assert!(matches!(provider.connect(&options).await, Err(BridgeError::Connection(_))));
        assert_eq!(provider.connect_count(), 0);

        provider.fail_connect(false);
        provider.connect(&options).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), provider.wait_for_connect())
            .await
            .unwrap();
        assert_eq!(provider.connect_count(), 1);

        provider.close_remotely();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(provider.connection().is_closed());
    }
}

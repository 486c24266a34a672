use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use async_nats::{Client, ClientError, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionProvider, MessageHandler, Msg, Options, Subscription},
    error::BridgeError,
};

/// Connects to a real NATS server with `async-nats`.
#[derive(Debug, Clone, Default)]
pub struct NatsConnectionProvider;

impl NatsConnectionProvider {
    fn connect_options(options: &Options) -> ConnectOptions {
        let mut opts = ConnectOptions::new();
        if options.no_randomize {
            opts = opts.retain_servers_order();
        }
        // async-nats treats a max of 0 as "forever"
        opts = match (options.allow_reconnect, options.max_reconnect) {
            (false, _) => opts.max_reconnects(1),
            (true, Some(max)) if max > 0 => opts.max_reconnects(max),
            (true, _) => opts.max_reconnects(None::<usize>),
        };
        if let Some(wait) = options.reconnect_wait {
            opts = opts.reconnect_delay_callback(move |_attempts| wait);
        }
        if let Some(timeout) = options.timeout {
            opts = opts.connection_timeout(timeout);
        }
        let closed = options.clone();
        opts.event_callback(move |event| {
            let closed = closed.clone();
            async move {
                match event {
                    Event::ClientError(ClientError::MaxReconnects) => {
                        warn!("NATS reconnect attempts exhausted, connection closed");
                        closed.notify_closed();
                    }
                    Event::Disconnected => warn!("NATS disconnected"),
                    Event::Connected => info!("NATS connected"),
                    other => debug!("NATS event: {other}"),
                }
            }
        })
    }
}

#[async_trait]
impl ConnectionProvider for NatsConnectionProvider {
    async fn connect(&self, options: &Options) -> Result<Arc<dyn Connection>, BridgeError> {
        let addrs = options.server_addrs()?;
        let client = async_nats::connect_with_options(addrs.as_slice(), Self::connect_options(options))
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))?;
        info!(url = %options.url, "connected to NATS");
        Ok(Arc::new(NatsConnection::new(client)))
    }
}

pub struct NatsConnection {
    client: Mutex<Option<Client>>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl NatsConnection {
    pub fn new(client: Client) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn client(&self) -> Result<Client, BridgeError> {
        self.client
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or(BridgeError::ConnectionClosed)
    }
}

#[async_trait]
impl Connection for NatsConnection {
    async fn publish(&self, subject: &str, data: Bytes) -> Result<(), BridgeError> {
        self.client()?
            .publish(subject.to_string(), data)
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BridgeError> {
        let mut subscriber = self
            .client()?
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subject_name = subject.to_string();

        // One task per subscription: the handler is awaited before the next
        // message is read, which keeps delivery order and lets it apply backpressure.
        let task = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                handler.on_message(Msg::from(message)).await;
            }
            debug!(subject = %subject_name, "NATS subscription ended");
        });
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(task);
        }
        Ok(Subscription {
            id,
            subject: subject.to_string(),
        })
    }

    async fn close(&self) {
        let tasks = self
            .subscriptions
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
        let client = self.client.lock().ok().and_then(|mut c| c.take());
        if let Some(client) = client {
            if let Err(err) = client.drain().await {
                warn!("drain on close failed: {err}");
            }
        }
    }
}

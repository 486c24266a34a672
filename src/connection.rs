use std::{fmt, sync::Arc, time::Duration};

use async_nats::ServerAddr;
use async_trait::async_trait;
use bytes::Bytes;

use crate::{config::ConnectionConfig, error::BridgeError};

/// An inbound transport message.
#[derive(Debug, Clone, PartialEq)]
pub struct Msg {
    pub subject: String,
    pub reply: Option<String>,
    pub data: Bytes,
}

impl Msg {
    pub fn new(subject: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            data: data.into(),
        }
    }
}

impl From<async_nats::Message> for Msg {
    fn from(message: async_nats::Message) -> Self {
        Self {
            subject: message.subject.to_string(),
            reply: message.reply.map(|r| r.to_string()),
            data: message.payload,
        }
    }
}

/// Called by the transport once per inbound message, in delivery order, on a
/// task owned by the connection. May block (await) for as long as it needs;
/// the subscription does not read ahead while it does.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, msg: Msg);
}

/// Handle for an active subscription; delivery ends when its connection closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    pub subject: String,
}

/// A live transport session.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn publish(&self, subject: &str, data: Bytes) -> Result<(), BridgeError>;

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BridgeError>;

    async fn close(&self);
}

/// Opens connections; swapped out in tests.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connect(&self, options: &Options) -> Result<Arc<dyn Connection>, BridgeError>;
}

pub type ClosedCallback = Arc<dyn Fn() + Send + Sync>;

/// Connection options derived once from [`ConnectionConfig`].
#[derive(Clone)]
pub struct Options {
    pub url: String,
    pub servers: Vec<String>,
    pub no_randomize: bool,
    pub allow_reconnect: bool,
    pub max_reconnect: Option<usize>,
    pub reconnect_wait: Option<Duration>,
    pub timeout: Option<Duration>,
    /// Invoked when the transport gives up on the connection.
    pub closed_cb: Option<ClosedCallback>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("url", &self.url)
            .field("servers", &self.servers)
            .field("no_randomize", &self.no_randomize)
            .field("allow_reconnect", &self.allow_reconnect)
            .field("max_reconnect", &self.max_reconnect)
            .field("reconnect_wait", &self.reconnect_wait)
            .field("timeout", &self.timeout)
            .field("closed_cb", &self.closed_cb.is_some())
            .finish()
    }
}

impl Options {
    /// Validates every address and converts the second/millisecond fields.
    /// Zero waits and timeouts leave the client defaults in place.
    pub fn from_config(conf: &ConnectionConfig) -> Result<Self, BridgeError> {
        let options = Self {
            url: conf.url.clone(),
            servers: conf.servers.clone(),
            no_randomize: conf.no_randomize,
            allow_reconnect: conf.allow_reconnect,
            max_reconnect: conf.max_reconnect,
            reconnect_wait: (conf.reconnect_wait > 0)
                .then(|| Duration::from_secs(u64::from(conf.reconnect_wait))),
            timeout: (conf.timeout > 0).then(|| Duration::from_millis(u64::from(conf.timeout))),
            closed_cb: None,
        };
        options.server_addrs()?;
        Ok(options)
    }

    pub fn with_closed_callback(mut self, cb: ClosedCallback) -> Self {
        self.closed_cb = Some(cb);
        self
    }

    /// `url` followed by the fallback servers, duplicates removed.
    pub fn server_addrs(&self) -> Result<Vec<ServerAddr>, BridgeError> {
        let mut raw: Vec<&str> = Vec::with_capacity(self.servers.len() + 1);
        for candidate in std::iter::once(&self.url).chain(self.servers.iter()) {
            let candidate = candidate.trim();
            if !candidate.is_empty() && !raw.contains(&candidate) {
                raw.push(candidate);
            }
        }
        if raw.is_empty() {
            return Err(BridgeError::config("no NATS url or servers configured"));
        }
        raw.into_iter()
            .map(|s| {
                s.parse::<ServerAddr>()
                    .map_err(|e| BridgeError::config(format!("invalid NATS server address {s:?}: {e}")))
            })
            .collect()
    }

    pub fn notify_closed(&self) {
        if let Some(cb) = &self.closed_cb {
            cb();
        }
    }
}

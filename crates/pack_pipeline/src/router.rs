use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::pack::PipelinePack;

/// Destination for routed packs.
#[derive(Debug, Clone)]
pub struct OutputRoute {
    pub name: String,
    /// Message type this output accepts; `None` accepts everything.
    pub matcher: Option<String>,
    pub tx: mpsc::Sender<PipelinePack>,
}

impl OutputRoute {
    fn matches(&self, pack: &PipelinePack) -> bool {
        self.matcher
            .as_deref()
            .map(|t| t == pack.message.msg_type)
            .unwrap_or(true)
    }
}

/// Moves injected packs to outputs. A pack goes to the first matching route,
/// unmatched packs go straight back to the pool.
pub struct Router {
    rx: mpsc::Receiver<PipelinePack>,
    routes: Vec<OutputRoute>,
}

impl Router {
    pub fn new(rx: mpsc::Receiver<PipelinePack>, routes: Vec<OutputRoute>) -> Self {
        Self { rx, routes }
    }

    /// Runs until every injector is dropped. Dropping the routes on exit closes
    /// the output channels, which outputs treat as end of stream.
    pub async fn run(mut self) {
        while let Some(pack) = self.rx.recv().await {
            self.route(pack).await;
        }
        debug!("router exiting");
    }

    async fn route(&mut self, pack: PipelinePack) {
        let Some(idx) = self.routes.iter().position(|r| r.matches(&pack)) else {
            pack.recycle();
            return;
        };
        if let Err(err) = self.routes[idx].tx.send(pack).await {
            let route = self.routes.remove(idx);
            warn!(output = %route.name, "output is gone, removing its route");
            err.0.recycle();
        }
    }
}

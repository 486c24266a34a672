use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::{error::PipelineError, message::Message};

/// A reusable unit of work. Packs are owned by a [`PackSupply`]; whoever holds
/// one must either hand it downstream or call [`PipelinePack::recycle`]. A
/// pooled pack that is dropped anywhere else returns to its pool as well.
#[derive(Debug)]
pub struct PipelinePack {
    pub message: Message,
    /// Raw bytes as received, used by decoders that understand the native format.
    pub msg_bytes: Vec<u8>,
    pub decoded: bool,
    recycle_tx: Option<mpsc::Sender<PipelinePack>>,
}

impl PipelinePack {
    /// A pack that belongs to no pool; recycling it simply drops it.
    pub fn new() -> Self {
        Self {
            message: Message::default(),
            msg_bytes: Vec::new(),
            decoded: false,
            recycle_tx: None,
        }
    }

    fn pooled(recycle_tx: mpsc::Sender<PipelinePack>) -> Self {
        let mut pack = Self::new();
        pack.recycle_tx = Some(recycle_tx);
        pack
    }

    /// Clears the pack and returns it to the pool it came from.
    pub fn recycle(self) {
        drop(self);
    }
}

impl Drop for PipelinePack {
    fn drop(&mut self) {
        let Some(tx) = self.recycle_tx.take() else {
            return;
        };
        let mut msg_bytes = std::mem::take(&mut self.msg_bytes);
        msg_bytes.clear();
        let fresh = PipelinePack {
            message: Message::default(),
            msg_bytes,
            decoded: false,
            recycle_tx: Some(tx.clone()),
        };
        // The pool channel is sized to hold every pack it ever created.
        if let Err(err) = tx.try_send(fresh) {
            let mut orphan = err.into_inner();
            orphan.recycle_tx = None;
            debug!("pack pool is gone, dropping recycled pack");
        }
    }
}

impl Default for PipelinePack {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded pool of packs. Cloning shares the same pool.
#[derive(Clone, Debug)]
pub struct PackSupply {
    tx: mpsc::Sender<PipelinePack>,
    rx: Arc<Mutex<mpsc::Receiver<PipelinePack>>>,
}

impl PackSupply {
    /// Creates a pool holding `size` packs (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel(size);
        for _ in 0..size {
            // cannot fail: the channel has exactly `size` free slots
            let _ = tx.try_send(PipelinePack::pooled(tx.clone()));
        }
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Waits until a pack is free. This is where producers feel backpressure.
    pub async fn acquire(&self) -> Result<PipelinePack, PipelineError> {
        // Waiters queue fairly on the mutex, so packs are handed out in request order.
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| PipelineError::Closed("pack supply".into()))
    }

    /// Takes a pack only if one is immediately free.
    pub fn try_acquire(&self) -> Option<PipelinePack> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Number of packs currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn size(&self) -> usize {
        self.tx.max_capacity()
    }
}

use std::sync::{Arc, Mutex};

use crossbeam_utils::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BridgeError;

/// `Created -> Initialized -> Running -> Stopped`. `Stopped` is terminal.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AdapterState {
    #[default]
    Created,
    Initialized,
    Running,
    Stopped,
}

/// Lock-free state shared between an adapter and whoever watches it.
#[derive(Debug, Clone, Default)]
pub struct StateCell(Arc<AtomicCell<AdapterState>>);

impl StateCell {
    pub fn get(&self) -> AdapterState {
        self.0.load()
    }

    pub fn set(&self, state: AdapterState) {
        self.0.store(state);
    }

    /// `Created -> Initialized`; init may be repeated before the first run.
    pub fn initialize(&self) -> Result<(), BridgeError> {
        match self.get() {
            AdapterState::Created | AdapterState::Initialized => {
                self.set(AdapterState::Initialized);
                Ok(())
            }
            other => Err(BridgeError::config(format!("cannot init an adapter that is {other:?}"))),
        }
    }

    /// `Initialized -> Running`, exactly once.
    pub fn start(&self) -> Result<(), BridgeError> {
        self.0
            .compare_exchange(AdapterState::Initialized, AdapterState::Running)
            .map(|_| ())
            .map_err(|actual| match actual {
                AdapterState::Created => BridgeError::config("adapter was never initialized"),
                other => BridgeError::config(format!("adapter is {other:?} and cannot be restarted")),
            })
    }
}

/// A single-slot, non-blocking signal. The first value sent is kept until it is
/// received; later values are dropped while the slot is full.
pub struct StopSignal<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<Option<mpsc::Receiver<T>>>,
}

impl<T: Send + 'static> StopSignal<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Returns false when the value was dropped.
    pub fn signal(&self, value: T) -> bool {
        self.tx.try_send(value).is_ok()
    }

    /// A detached callback that signals with `make()` on every call.
    pub fn hook(&self, make: impl Fn() -> T + Send + Sync + 'static) -> Arc<dyn Fn() + Send + Sync> {
        let tx = self.tx.clone();
        Arc::new(move || {
            let _ = tx.try_send(make());
        })
    }

    /// The receiving end; only one waiter ever gets it.
    pub fn take_waiter(&self) -> Option<StopWaiter<T>> {
        self.rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .map(|rx| StopWaiter { rx })
    }
}

impl<T: Send + 'static> Default for StopSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StopWaiter<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> StopWaiter<T> {
    /// Waits for the next signal. Cancel safe.
    pub async fn wait(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn state_cell_walks_the_lifecycle_once() {
        let state = StateCell::default();
        assert!(matches!(state.start(), Err(BridgeError::Config(_))));

        state.initialize().unwrap();
        state.initialize().unwrap();
        state.start().unwrap();
        assert_eq!(state.get(), AdapterState::Running);
        assert!(state.start().is_err());
        assert!(state.initialize().is_err());

        state.set(AdapterState::Stopped);
        assert!(state.start().is_err());
        assert!(state.initialize().is_err());
    }

    #[tokio::test]
    async fn extra_signals_are_dropped_without_blocking() {
        let signal = StopSignal::new();
        assert!(signal.signal(1));
        assert!(!signal.signal(2));
        let hook = signal.hook(|| 3);
        hook();
        hook();

        let mut waiter = signal.take_waiter().unwrap();
        assert!(signal.take_waiter().is_none());
        assert_eq!(waiter.wait().await, Some(1));

        let nothing = tokio::time::timeout(Duration::from_millis(20), waiter.wait()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn hook_reaches_the_waiter() {
        let signal: StopSignal<&'static str> = StopSignal::new();
        let mut waiter = signal.take_waiter().unwrap();
        let hook = signal.hook(|| "closed");
        tokio::spawn(async move { hook() });
        assert_eq!(waiter.wait().await, Some("closed"));
    }
}

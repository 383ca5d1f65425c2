//! Uniform start/stop lifecycle for long-running components.
//!
//! `start` hands the component a cancellation handle and errors if already
//! running; `stop` fires the handle and errors if not running; `wait`
//! blocks until the component reports it has fully wound down. Cancellation
//! is the only graceful-shutdown mechanism: components react to the handle
//! by stopping timers, draining queues, flushing the WAL, and closing their
//! connections, in that order.

use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;
use tracing::info;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ServiceError {
    #[error("already started")]
    AlreadyStarted,
    #[error("already stopped")]
    AlreadyStopped,
    #[error("not started")]
    NotStarted,
}

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Cancellation handle given to the running task. Cheap to clone; becomes
/// `true` exactly once.
pub type CancelHandle = watch::Receiver<bool>;

pub struct Service {
    name: String,
    state: AtomicU8,
    cancel_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            name: name.into(),
            state: AtomicU8::new(STATE_NEW),
            cancel_tx,
            done_tx,
            done_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the service running and hand back the cancellation handle the
    /// task must watch.
    pub fn start(&self) -> Result<CancelHandle, ServiceError> {
        match self.state.compare_exchange(
            STATE_NEW,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                info!(service = %self.name, "starting service");
                Ok(self.cancel_tx.subscribe())
            }
            Err(STATE_RUNNING) => Err(ServiceError::AlreadyStarted),
            Err(_) => Err(ServiceError::AlreadyStopped),
        }
    }

    /// Fire cancellation. The task observes it and calls [`Service::finished`]
    /// once wound down.
    pub fn stop(&self) -> Result<(), ServiceError> {
        match self.state.compare_exchange(
            STATE_RUNNING,
            STATE_STOPPED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                info!(service = %self.name, "stopping service");
                let _ = self.cancel_tx.send(true);
                Ok(())
            }
            Err(STATE_NEW) => Err(ServiceError::NotStarted),
            Err(_) => Err(ServiceError::AlreadyStopped),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    /// Called by the task as its last act.
    pub fn finished(&self) {
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        let _ = self.done_tx.send(true);
    }

    /// Block until the task has fully stopped.
    pub async fn wait(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

//! Start/stop plumbing shared by every background loop in the canary.
//!
//! A [`BackgroundTask`] owns a shutdown signal and the join handle of the task
//! it spawned. `stop()` flips the signal and then waits for the task to exit,
//! so nothing is left running once it returns. Stopping twice, or from two
//! callers at once, is safe: the second caller finds the handle already taken
//! (or waits on the lock until the first caller has joined it).

use std::future::Future;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::warn;

pub struct BackgroundTask {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    /// Spawn `body` with a fresh shutdown receiver. The task runs until
    /// `body` returns; well-behaved bodies return once the receiver flips.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(body(shutdown_rx));
        Self {
            name,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal shutdown and wait for the task to exit. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.take()
            && let Err(e) = handle.await
        {
            warn!(task = self.name, error = %e, "background task ended abnormally");
        }
    }

    /// Whether the task has been stopped or has exited on its own.
    pub fn is_finished(&self) -> bool {
        match self.handle.try_lock() {
            Ok(guard) => guard.as_ref().is_none_or(|h| h.is_finished()),
            // someone is in stop() right now
            Err(_) => true,
        }
    }
}

/// Sleep for `duration` unless shutdown is requested first.
///
/// Returns `true` when the caller should exit its loop.
pub async fn sleep_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown_rx.borrow_and_update() {
        return true;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            // a dropped sender also means shutdown
            changed.is_err() || *shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Resolve once shutdown has been requested or the sender is gone.
pub async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

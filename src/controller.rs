use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

/// Shutdown flag observed by intake loops and workers.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Owning side of [`Shutdown`].
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered, or the trigger dropped.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

/// Bounds in-flight deliveries for one subscription.
///
/// Each admitted delivery holds one permit until its terminal action has been
/// issued. Backoff waits keep the permit, so a slow endpoint throttles its
/// own subscription.
#[derive(Debug)]
pub struct ConcurrencyController {
    limit: u32,
    semaphore: Arc<Semaphore>,
    shutdown: Shutdown,
}

impl ConcurrencyController {
    pub fn new(prefetch: u16, shutdown: Shutdown) -> Self {
        let limit = u32::from(prefetch.max(1));
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit as usize)),
            shutdown,
        }
    }

    /// Wait for a free slot. Returns `None` once shutdown has begun; nothing
    /// is admitted after that.
    pub async fn admit(&self) -> Option<OwnedSemaphorePermit> {
        if self.shutdown.is_triggered() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.triggered() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        (self.limit as usize).saturating_sub(self.semaphore.available_permits())
    }

    /// Wait up to `grace` for every admitted delivery to finish.
    ///
    /// Returns the number still in flight when the wait ended; those are left
    /// unsettled for the broker to redeliver.
    pub async fn drain(&self, grace: Duration) -> usize {
        match tokio::time::timeout(grace, self.semaphore.acquire_many(self.limit)).await {
            Ok(Ok(_all)) => 0,
            Ok(Err(_closed)) => self.in_flight(),
            Err(_elapsed) => self.in_flight(),
        }
    }
}

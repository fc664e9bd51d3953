//! Scan sharing between concurrent resolvers.
//!
//! A radio has one scan. Sessions that resolve addresses at the same time
//! each take a [`ScanLease`]; the scan starts with the first lease and stops
//! when the last one is released.

use crate::error::SessionError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Starts and stops the underlying scan.
pub trait ScanControl: Clone + Send + Sync + 'static {
    fn start(&self) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Stops the scan. Failures are the implementation's to log.
    fn stop(&self) -> impl Future<Output = ()> + Send;
}

/// A scan shared by every resolver holding a lease.
#[derive(Clone)]
pub struct SharedScan<S: ScanControl> {
    control: S,
    active: Arc<Mutex<usize>>,
}

impl<S: ScanControl> SharedScan<S> {
    pub fn new(control: S) -> Self {
        Self {
            control,
            active: Arc::new(Mutex::new(0)),
        }
    }

    /// Joins the scan, starting it if nobody else is scanning.
    pub async fn acquire(&self) -> Result<ScanLease<S>, SessionError> {
        let mut active = self.active.lock().await;
        if *active == 0 {
            self.control.start().await?;
            tracing::debug!("Scan started");
        }
        *active += 1;
        Ok(ScanLease {
            control: self.control.clone(),
            active: self.active.clone(),
            released: false,
        })
    }

    /// Number of outstanding leases.
    pub async fn active(&self) -> usize {
        *self.active.lock().await
    }
}

/// Membership in a shared scan.
///
/// Release it with [`ScanLease::release`]. A lease dropped without release
/// (a cancelled resolve) is released on a background task.
pub struct ScanLease<S: ScanControl> {
    control: S,
    active: Arc<Mutex<usize>>,
    released: bool,
}

impl<S: ScanControl> ScanLease<S> {
    /// Leaves the scan, stopping it if this was the last lease.
    pub async fn release(mut self) {
        self.released = true;
        leave(&self.control, &self.active).await;
    }
}

impl<S: ScanControl> Drop for ScanLease<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let control = self.control.clone();
        let active = self.active.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                leave(&control, &active).await;
            });
        }
    }
}

async fn leave<S: ScanControl>(control: &S, active: &Mutex<usize>) {
    let mut active = active.lock().await;
    *active = active.saturating_sub(1);
    if *active == 0 {
        control.stop().await;
        tracing::debug!("Scan stopped");
    }
}

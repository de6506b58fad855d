use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;

/// Counting admission gate in front of the loaded model. Capacity is the
/// number of inference slots; transcription and language detection compete
/// for the same permits. Acquisition order is tokio's semaphore fairness
/// (FIFO), which is all that is promised.
pub struct InferenceGate {
    permits: Arc<Semaphore>,
}

impl InferenceGate {
    /// A capacity below one would never admit a request, so it is clamped.
    pub fn new(slots: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(slots.max(1))),
        }
    }

    /// Runs `op` on the blocking thread pool while holding one permit. The
    /// permit moves into the closure, so it is released when the closure
    /// finishes, errors, or panics.
    pub async fn run_blocking<F, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits).acquire_owned().await?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            op()
        })
        .await?
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

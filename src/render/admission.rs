use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{EngineError, Result};

/// Bounded-concurrency gate in front of the typesetter subprocess pool.
///
/// A counting semaphore with FIFO waiters. Saturation surfaces as
/// `Busy` once the acquire timeout elapses; callers retry with jitter.
pub struct AdmissionController {
    semaphore: Option<Arc<Semaphore>>,
}

impl AdmissionController {
    /// `max_concurrent = 0` means unbounded: every acquire succeeds
    /// immediately.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))),
        }
    }

    /// Waits up to `timeout` for a slot. The returned handle releases
    /// the slot when dropped, on every exit path including panics.
    pub async fn acquire(&self, timeout: Duration) -> Result<RenderSlot> {
        let Some(semaphore) = &self.semaphore else {
            return Ok(RenderSlot { _permit: None });
        };
        match tokio::time::timeout(timeout, Arc::clone(semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(RenderSlot {
                _permit: Some(permit),
            }),
            Ok(Err(_)) => Err(EngineError::Internal(
                "admission semaphore closed".to_string(),
            )),
            Err(_) => Err(EngineError::Busy),
        }
    }

    /// Slots currently free; unbounded controllers report `None`.
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }
}

/// RAII admission slot.
#[derive(Debug)]
pub struct RenderSlot {
    _permit: Option<OwnedSemaphorePermit>,
}

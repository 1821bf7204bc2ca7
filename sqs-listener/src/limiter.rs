//! Per-queue bound on the number of in-flight messages.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::{ListenerError, Result};

/// A counting limiter shared by a queue's poller and sink.
///
/// Every in-flight message holds one [`InFlightPermit`]; the slot is returned when the permit is
/// dropped, whatever the outcome of the pipeline was.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    total: usize,
    draining: Arc<AtomicBool>,
}

impl ConcurrencyLimiter {
    pub fn new(total: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(total)),
            total,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.total.saturating_sub(self.available())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Waits for a single slot.
    pub async fn acquire(&self) -> Result<InFlightPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(ListenerError::generic)?;
        Ok(InFlightPermit(permit))
    }

    /// Waits up to `wait` for a first slot, then grabs whatever else is immediately available up
    /// to `max` slots in total.
    ///
    /// Returns an empty vector when no slot freed up in time or the limiter is draining.
    pub async fn acquire_up_to(&self, max: usize, wait: Duration) -> Vec<InFlightPermit> {
        if max == 0 || self.is_draining() {
            return Vec::new();
        }

        let first = match tokio::time::timeout(wait, self.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                trace!(in_flight = self.in_flight(), "No slot freed up in time");
                return Vec::new();
            }
        };
        if self.is_draining() {
            return Vec::new();
        }

        let mut permits = Vec::with_capacity(max);
        permits.push(InFlightPermit(first));
        while permits.len() < max {
            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permits.push(InFlightPermit(permit)),
                Err(_) => break,
            }
        }
        trace!(
            acquired = permits.len(),
            available = self.available(),
            "Acquired slots"
        );
        permits
    }

    /// Stops handing out slots through [`ConcurrencyLimiter::acquire_up_to`] and waits up to
    /// `timeout` for every in-flight slot to come back.
    ///
    /// Returns whether all slots were returned in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.draining.store(true, Ordering::Release);
        debug!(
            in_flight = self.in_flight(),
            ?timeout,
            "Waiting for in-flight messages"
        );
        let Ok(total) = u32::try_from(self.total) else {
            return false;
        };
        matches!(
            tokio::time::timeout(timeout, self.semaphore.acquire_many(total)).await,
            Ok(Ok(_))
        )
    }
}

impl fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("total", &self.total)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// One occupied concurrency slot, released on drop.
pub struct InFlightPermit(OwnedSemaphorePermit);

impl fmt::Debug for InFlightPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightPermit").finish()
    }
}

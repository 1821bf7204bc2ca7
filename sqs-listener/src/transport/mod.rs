//! The queue transport seam.
//!
//! The listener only needs three remote operations: receive, batch delete and batch visibility
//! change. Everything else about the queue service is up to the transport.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;

use crate::{ListenerError, Message, Result};

#[cfg(feature = "in_memory")]
pub mod in_memory;
#[cfg(feature = "sqs")]
pub mod sqs;

/// The most entries a single batch delete or batch visibility change may carry.
pub const MAX_BATCH_ENTRIES: usize = 10;

/// The longest visibility timeout a transport accepts, twelve hours.
pub const MAX_VISIBILITY_TIMEOUT_SECS: u32 = 43_200;

/// One entry of a batch visibility change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VisibilityChange {
    pub receipt_handle: String,
    pub timeout_seconds: u32,
}

impl VisibilityChange {
    pub fn new(receipt_handle: impl Into<String>, timeout_seconds: u32) -> Self {
        Self {
            receipt_handle: receipt_handle.into(),
            timeout_seconds,
        }
    }
}

/// The capability to change the visibility timeout of one delivery.
#[derive(Clone)]
pub struct Visibility {
    transport: DynTransport,
    queue_url: String,
    receipt_handle: String,
}

impl Visibility {
    pub(crate) fn new(transport: DynTransport, queue_url: &str, receipt_handle: &str) -> Self {
        Self {
            transport,
            queue_url: queue_url.to_owned(),
            receipt_handle: receipt_handle.to_owned(),
        }
    }

    /// Hides the delivery for `timeout_seconds` from now on, capped at
    /// [`MAX_VISIBILITY_TIMEOUT_SECS`]. Zero makes it visible right away.
    pub async fn change_to(&self, timeout_seconds: u32) -> Result<()> {
        self.transport
            .change_visibility_all(
                &self.queue_url,
                &[self.receipt_handle.as_str()],
                timeout_seconds.min(MAX_VISIBILITY_TIMEOUT_SECS),
            )
            .await
    }
}

impl fmt::Debug for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Visibility")
            .field("queue_url", &self.queue_url)
            .finish_non_exhaustive()
    }
}

/// The per-entry result of a batch call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchEntryResult {
    pub receipt_handle: String,
    pub error: Option<String>,
}

impl BatchEntryResult {
    pub fn ok(receipt_handle: impl Into<String>) -> Self {
        Self {
            receipt_handle: receipt_handle.into(),
            error: None,
        }
    }

    pub fn failed(receipt_handle: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            receipt_handle: receipt_handle.into(),
            error: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub trait QueueTransport: Send + Sync {
    /// Receives up to `max_messages` messages, waiting up to `wait_time` for at least one.
    ///
    /// An empty vector means the wait elapsed without messages, which is not an error.
    fn receive(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait_time: Duration,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send;

    /// Deletes up to [`MAX_BATCH_ENTRIES`] deliveries.
    fn delete_batch(
        &self,
        queue_url: &str,
        receipt_handles: &[String],
    ) -> impl Future<Output = Result<Vec<BatchEntryResult>>> + Send;

    /// Changes the visibility timeout of up to [`MAX_BATCH_ENTRIES`] deliveries.
    fn change_visibility_batch(
        &self,
        queue_url: &str,
        entries: &[VisibilityChange],
    ) -> impl Future<Output = Result<Vec<BatchEntryResult>>> + Send;

    /// Maps a configured queue name to the url the other operations expect.
    fn resolve_queue_url(&self, queue_name: &str) -> impl Future<Output = Result<String>> + Send {
        let url = queue_name.to_owned();
        async move { Ok(url) }
    }

    fn into_dyn(self) -> DynTransport
    where
        Self: Sized + 'static,
    {
        DynTransport::new(self)
    }
}

/// A type-erased, cheaply clonable [`QueueTransport`].
#[derive(Clone)]
pub struct DynTransport(Arc<dyn ErasedQueueTransport>);

impl DynTransport {
    pub fn new(inner: impl QueueTransport + 'static) -> Self {
        Self(Arc::new(DynTransportInner { inner }))
    }

    /// Deletes all `receipt_handles` in as many batch calls as needed.
    ///
    /// On failure the handles that are still not deleted are returned alongside the last error.
    pub(crate) async fn delete_all(
        &self,
        queue_url: &str,
        receipt_handles: &[String],
    ) -> Result<(), (Vec<String>, ListenerError)> {
        let mut remaining = Vec::new();
        let mut last_error = None;

        for chunk in receipt_handles.chunks(MAX_BATCH_ENTRIES) {
            match self.delete_batch(queue_url, chunk).await {
                Ok(results) => {
                    let failed: Vec<String> = results
                        .into_iter()
                        .filter(|r| !r.is_success())
                        .map(|r| r.receipt_handle)
                        .collect();
                    if !failed.is_empty() {
                        last_error = Some(ListenerError::PartialBatchFailure {
                            failed: failed.len(),
                            total: chunk.len(),
                        });
                        remaining.extend(failed);
                    }
                }
                Err(e) => {
                    remaining.extend(chunk.iter().cloned());
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            None => Ok(()),
            Some(e) => Err((remaining, e)),
        }
    }

    /// Sets the visibility timeout of all `receipt_handles` in as many batch calls as needed.
    pub(crate) async fn change_visibility_all(
        &self,
        queue_url: &str,
        receipt_handles: &[&str],
        timeout_seconds: u32,
    ) -> Result<()> {
        let mut failed = 0;
        let mut last_error = None;

        for chunk in receipt_handles.chunks(MAX_BATCH_ENTRIES) {
            let entries: Vec<VisibilityChange> = chunk
                .iter()
                .map(|rh| VisibilityChange::new(*rh, timeout_seconds))
                .collect();
            match self.change_visibility_batch(queue_url, &entries).await {
                Ok(results) => failed += results.iter().filter(|r| !r.is_success()).count(),
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) => Err(e),
            None if failed > 0 => Err(ListenerError::PartialBatchFailure {
                failed,
                total: receipt_handles.len(),
            }),
            None => Ok(()),
        }
    }
}

trait ErasedQueueTransport: Send + Sync {
    fn receive<'a>(
        &'a self,
        queue_url: &'a str,
        max_messages: usize,
        wait_time: Duration,
    ) -> BoxFuture<'a, Result<Vec<Message>>>;

    fn delete_batch<'a>(
        &'a self,
        queue_url: &'a str,
        receipt_handles: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<BatchEntryResult>>>;

    fn change_visibility_batch<'a>(
        &'a self,
        queue_url: &'a str,
        entries: &'a [VisibilityChange],
    ) -> BoxFuture<'a, Result<Vec<BatchEntryResult>>>;

    fn resolve_queue_url<'a>(&'a self, queue_name: &'a str) -> BoxFuture<'a, Result<String>>;
}

struct DynTransportInner<T> {
    inner: T,
}

impl<T: QueueTransport> ErasedQueueTransport for DynTransportInner<T> {
    fn receive<'a>(
        &'a self,
        queue_url: &'a str,
        max_messages: usize,
        wait_time: Duration,
    ) -> BoxFuture<'a, Result<Vec<Message>>> {
        Box::pin(self.inner.receive(queue_url, max_messages, wait_time))
    }

    fn delete_batch<'a>(
        &'a self,
        queue_url: &'a str,
        receipt_handles: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<BatchEntryResult>>> {
        Box::pin(self.inner.delete_batch(queue_url, receipt_handles))
    }

    fn change_visibility_batch<'a>(
        &'a self,
        queue_url: &'a str,
        entries: &'a [VisibilityChange],
    ) -> BoxFuture<'a, Result<Vec<BatchEntryResult>>> {
        Box::pin(self.inner.change_visibility_batch(queue_url, entries))
    }

    fn resolve_queue_url<'a>(&'a self, queue_name: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.inner.resolve_queue_url(queue_name))
    }
}

impl QueueTransport for DynTransport {
    async fn receive(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Message>> {
        self.0.receive(queue_url, max_messages, wait_time).await
    }

    async fn delete_batch(
        &self,
        queue_url: &str,
        receipt_handles: &[String],
    ) -> Result<Vec<BatchEntryResult>> {
        self.0.delete_batch(queue_url, receipt_handles).await
    }

    async fn change_visibility_batch(
        &self,
        queue_url: &str,
        entries: &[VisibilityChange],
    ) -> Result<Vec<BatchEntryResult>> {
        self.0.change_visibility_batch(queue_url, entries).await
    }

    async fn resolve_queue_url(&self, queue_name: &str) -> Result<String> {
        self.0.resolve_queue_url(queue_name).await
    }

    fn into_dyn(self) -> DynTransport {
        self
    }
}

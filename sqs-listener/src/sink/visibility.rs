//! Keeping messages invisible while they are being worked on.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Deserialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{trace, warn};

use super::MessageSink;
use crate::{
    interceptor::MessageInterceptor,
    message::Batch,
    pipeline::{MessageOutcome, ProcessingContext, ProcessingStatus},
    transport::DynTransport,
    Message, Result,
};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityStrategy {
    /// Rely on the queue's visibility timeout.
    #[default]
    None,
    /// Extend the whole batch once, before any of it is handled.
    OnceOnReceive,
    /// Extend each message right before its handler runs, then periodically until it completes.
    MessagesBeingProcessed,
    /// Periodically extend the messages of the original batch that did not complete yet.
    RemainingOriginalBatchMessages,
}

/// Extends the visibility of the messages emitted to the delegate sink.
///
/// Periodic extensions are issued every `extension_period` for as long as the delegate's emit
/// runs and stop with it. A failed extension is logged and otherwise ignored, the message then
/// simply becomes visible again once its current timeout runs out.
pub struct VisibilityExtendingSinkAdapter<S> {
    delegate: S,
    transport: DynTransport,
    strategy: VisibilityStrategy,
    visibility_secs: u32,
    extension_period: Duration,
}

impl<S: MessageSink> VisibilityExtendingSinkAdapter<S> {
    pub fn new(
        delegate: S,
        transport: DynTransport,
        strategy: VisibilityStrategy,
        visibility_secs: u32,
        extension_period: Duration,
    ) -> Self {
        Self {
            delegate,
            transport,
            strategy,
            visibility_secs,
            extension_period,
        }
    }

    fn extender(&self, queue_url: &str) -> Extender {
        Extender {
            transport: self.transport.clone(),
            queue_url: queue_url.to_owned(),
            visibility_secs: self.visibility_secs,
        }
    }

    async fn emit_extending(
        &self,
        batch: Batch,
        context: ProcessingContext,
        extender: &Extender,
        tracker: &Tracker,
    ) -> Vec<MessageOutcome> {
        tokio::select! {
            biased;
            outcomes = self.delegate.emit(batch, context) => outcomes,
            () = self.keep_extending(extender, tracker) => Vec::new(),
        }
    }

    async fn keep_extending(&self, extender: &Extender, tracker: &Tracker) {
        let mut ticker = interval_at(
            Instant::now() + self.extension_period,
            self.extension_period,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let receipt_handles = tracker.snapshot();
            if !receipt_handles.is_empty() {
                extender.extend(&receipt_handles).await;
            }
        }
    }
}

impl<S: MessageSink> MessageSink for VisibilityExtendingSinkAdapter<S> {
    async fn emit(&self, batch: Batch, context: ProcessingContext) -> Vec<MessageOutcome> {
        let Some(queue_url) = batch.messages().first().map(|m| m.queue_url().to_owned()) else {
            return self.delegate.emit(batch, context).await;
        };
        let extender = self.extender(&queue_url);

        match self.strategy {
            VisibilityStrategy::None => self.delegate.emit(batch, context).await,
            VisibilityStrategy::OnceOnReceive => {
                let receipt_handles = receipt_handles(&batch);
                extender.extend(&receipt_handles).await;
                self.delegate.emit(batch, context).await
            }
            VisibilityStrategy::MessagesBeingProcessed => {
                let tracker = Tracker::default();
                let context = context.with_interceptor(TrackingInterceptor {
                    tracker: tracker.clone(),
                    extend_on_start: Some(extender.clone()),
                });
                self.emit_extending(batch, context, &extender, &tracker)
                    .await
            }
            VisibilityStrategy::RemainingOriginalBatchMessages => {
                let tracker = Tracker::new(receipt_handles(&batch));
                let context = context.with_interceptor(TrackingInterceptor {
                    tracker: tracker.clone(),
                    extend_on_start: None,
                });
                self.emit_extending(batch, context, &extender, &tracker)
                    .await
            }
        }
    }
}

fn receipt_handles(batch: &Batch) -> Vec<String> {
    batch
        .messages()
        .iter()
        .map(|m| m.receipt_handle().to_owned())
        .collect()
}

#[derive(Clone)]
struct Extender {
    transport: DynTransport,
    queue_url: String,
    visibility_secs: u32,
}

impl Extender {
    async fn extend(&self, receipt_handles: &[String]) {
        let handles: Vec<&str> = receipt_handles.iter().map(String::as_str).collect();
        trace!(
            queue = %self.queue_url,
            messages = handles.len(),
            timeout_seconds = self.visibility_secs,
            "Extending message visibility"
        );
        if let Err(e) = self
            .transport
            .change_visibility_all(&self.queue_url, &handles, self.visibility_secs)
            .await
        {
            warn!(
                queue = %self.queue_url,
                messages = handles.len(),
                error = %e,
                "Failed to extend message visibility"
            );
        }
    }
}

/// The receipt handles that are still due for extension, in the order they were added.
#[derive(Clone, Default)]
struct Tracker(Arc<Mutex<Vec<String>>>);

impl Tracker {
    fn new(receipt_handles: Vec<String>) -> Self {
        Self(Arc::new(Mutex::new(receipt_handles)))
    }

    fn handles(&self) -> MutexGuard<'_, Vec<String>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, receipt_handle: &str) {
        let mut handles = self.handles();
        if !handles.iter().any(|h| h == receipt_handle) {
            handles.push(receipt_handle.to_owned());
        }
    }

    fn remove(&self, receipt_handle: &str) {
        self.handles().retain(|h| h != receipt_handle);
    }

    fn snapshot(&self) -> Vec<String> {
        self.handles().clone()
    }
}

struct TrackingInterceptor {
    tracker: Tracker,
    extend_on_start: Option<Extender>,
}

/// Whether the delivery is already gone from the queue, e.g. deleted on receipt.
fn is_deleted(message: &Message) -> bool {
    message
        .acknowledgement()
        .is_some_and(|ack| ack.is_acknowledged())
}

impl MessageInterceptor for TrackingInterceptor {
    async fn before(&self, message: Message) -> Result<Message> {
        if is_deleted(&message) {
            self.tracker.remove(message.receipt_handle());
            return Ok(message);
        }
        if let Some(extender) = &self.extend_on_start {
            self.tracker.insert(message.receipt_handle());
            extender
                .extend(&[message.receipt_handle().to_owned()])
                .await;
        }
        Ok(message)
    }

    async fn before_batch(&self, messages: Vec<Message>) -> Result<Vec<Message>> {
        for message in messages.iter().filter(|m| is_deleted(m)) {
            self.tracker.remove(message.receipt_handle());
        }
        if let Some(extender) = &self.extend_on_start {
            let receipt_handles: Vec<String> = messages
                .iter()
                .filter(|m| !is_deleted(m))
                .map(|m| m.receipt_handle().to_owned())
                .collect();
            if receipt_handles.is_empty() {
                return Ok(messages);
            }
            for receipt_handle in &receipt_handles {
                self.tracker.insert(receipt_handle);
            }
            extender.extend(&receipt_handles).await;
        }
        Ok(messages)
    }

    async fn on_completion(&self, message: &Message, _status: &ProcessingStatus) {
        self.tracker.remove(message.receipt_handle());
    }
}

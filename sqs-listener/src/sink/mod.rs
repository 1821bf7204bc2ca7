//! Sinks accept received batches and drive their messages through the pipeline.
//!
//! The base sinks enforce the queue's concurrency limit. Adapters wrap another sink to add
//! grouping ([`grouping::MessageGroupingSinkAdapter`]) or visibility extension
//! ([`visibility::VisibilityExtendingSinkAdapter`]).

use std::{future::Future, sync::Arc};

use futures_util::future::BoxFuture;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::{
    limiter::{ConcurrencyLimiter, InFlightPermit},
    message::Batch,
    pipeline::{MessageOutcome, MessagePipeline, ProcessingContext, ProcessingStatus},
    ListenerError,
};

pub mod grouping;
pub mod visibility;

pub trait MessageSink: Send + Sync + 'static {
    /// Drives every message of `batch` to its terminal state.
    ///
    /// Resolves once all of them got there, with one outcome per message in batch order. The
    /// failure of one message never fails its siblings.
    fn emit(
        &self,
        batch: Batch,
        context: ProcessingContext,
    ) -> impl Future<Output = Vec<MessageOutcome>> + Send;

    fn into_dyn(self) -> DynSink
    where
        Self: Sized,
    {
        DynSink::new(self)
    }
}

/// A type-erased, cheaply clonable [`MessageSink`].
#[derive(Clone)]
pub struct DynSink(Arc<dyn ErasedMessageSink>);

impl DynSink {
    pub fn new(inner: impl MessageSink) -> Self {
        Self(Arc::new(inner))
    }
}

trait ErasedMessageSink: Send + Sync {
    fn emit(&self, batch: Batch, context: ProcessingContext) -> BoxFuture<'_, Vec<MessageOutcome>>;
}

impl<S: MessageSink> ErasedMessageSink for S {
    fn emit(&self, batch: Batch, context: ProcessingContext) -> BoxFuture<'_, Vec<MessageOutcome>> {
        Box::pin(MessageSink::emit(self, batch, context))
    }
}

impl MessageSink for DynSink {
    async fn emit(&self, batch: Batch, context: ProcessingContext) -> Vec<MessageOutcome> {
        self.0.emit(batch, context).await
    }

    fn into_dyn(self) -> DynSink {
        self
    }
}

/// Processes the messages of a batch concurrently, each on its own task.
///
/// Messages of a polled batch bring their concurrency slot along. Messages that don't wait for a
/// free one before they are spawned.
pub struct FanOutSink {
    pipeline: Arc<MessagePipeline>,
    limiter: ConcurrencyLimiter,
}

impl FanOutSink {
    pub(crate) fn new(pipeline: Arc<MessagePipeline>, limiter: ConcurrencyLimiter) -> Self {
        Self { pipeline, limiter }
    }
}

impl MessageSink for FanOutSink {
    async fn emit(&self, batch: Batch, context: ProcessingContext) -> Vec<MessageOutcome> {
        if batch.is_empty() {
            debug!("Ignoring empty batch");
            return Vec::new();
        }

        let (messages, permits) = batch.into_parts();
        let mut permits = permits.into_iter();
        let mut fallbacks = Vec::with_capacity(messages.len());
        let mut tasks = JoinSet::new();

        for (index, message) in messages.into_iter().enumerate() {
            let permit = match permits.next() {
                Some(permit) => Some(permit),
                None => acquire(&self.limiter).await,
            };
            fallbacks.push(MessageOutcome::new(
                &message,
                ProcessingStatus::Failed {
                    reason: ListenerError::HandlerPanicked.to_string(),
                },
                false,
            ));

            let pipeline = self.pipeline.clone();
            let context = context.clone();
            tasks.spawn(async move {
                let outcome = pipeline.process(message, &context).await;
                drop(permit);
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<MessageOutcome>> = vec![None; fallbacks.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!(error = %e, "Message processing task failed"),
            }
        }
        outcomes
            .into_iter()
            .zip(fallbacks)
            .map(|(outcome, fallback)| outcome.unwrap_or(fallback))
            .collect()
    }
}

/// Processes the messages of a batch one after another, in batch order.
///
/// Once a message fails, the rest of the batch is skipped and left for redelivery so that no
/// message overtakes one that came before it.
pub struct OrderedSink {
    pipeline: Arc<MessagePipeline>,
}

impl OrderedSink {
    pub(crate) fn new(pipeline: Arc<MessagePipeline>) -> Self {
        Self { pipeline }
    }
}

impl MessageSink for OrderedSink {
    async fn emit(&self, batch: Batch, context: ProcessingContext) -> Vec<MessageOutcome> {
        if batch.is_empty() {
            debug!("Ignoring empty batch");
            return Vec::new();
        }

        let (messages, permits) = batch.into_parts();
        let mut permits = permits.into_iter();
        let mut outcomes = Vec::with_capacity(messages.len());
        let mut failed = false;

        for message in messages {
            let permit = permits.next();
            let outcome = if failed {
                self.pipeline.skip(message, &context).await
            } else {
                self.pipeline.process(message, &context).await
            };
            drop(permit);
            if !outcome.status.is_success() && !failed {
                debug!(message_id = %outcome.message_id, "Skipping the rest of the ordered batch");
                failed = true;
            }
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Hands a whole batch to one batch handler invocation.
pub struct BatchSink {
    pipeline: Arc<MessagePipeline>,
    limiter: ConcurrencyLimiter,
}

impl BatchSink {
    pub(crate) fn new(pipeline: Arc<MessagePipeline>, limiter: ConcurrencyLimiter) -> Self {
        Self { pipeline, limiter }
    }
}

impl MessageSink for BatchSink {
    async fn emit(&self, batch: Batch, context: ProcessingContext) -> Vec<MessageOutcome> {
        if batch.is_empty() {
            debug!("Ignoring empty batch");
            return Vec::new();
        }

        let (messages, mut permits) = batch.into_parts();
        let wanted = messages.len().min(self.limiter.total());
        while permits.len() < wanted {
            match acquire(&self.limiter).await {
                Some(permit) => permits.push(permit),
                None => break,
            }
        }

        let outcomes = self.pipeline.process_batch(messages, &context).await;
        drop(permits);
        outcomes
    }
}

async fn acquire(limiter: &ConcurrencyLimiter) -> Option<InFlightPermit> {
    match limiter.acquire().await {
        Ok(permit) => Some(permit),
        Err(e) => {
            warn!(error = %e, "Failed to acquire a concurrency slot");
            None
        }
    }
}

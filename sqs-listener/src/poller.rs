//! The per-queue polling loop.

use std::time::Duration;

use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, info, trace, warn};

use crate::{
    backoff::{Backoff, BackoffPolicy},
    limiter::ConcurrencyLimiter,
    message::Batch,
    options::ContainerOptions,
    pipeline::{MessageOutcome, ProcessingContext},
    sink::{DynSink, MessageSink as _},
    transport::{DynTransport, QueueTransport as _},
};

/// Emits of received batches that may still be running.
pub(crate) type Emits = JoinSet<Vec<MessageOutcome>>;

/// Receives batches from one queue and emits them to its sink.
///
/// A receive asks for no more messages than there are free concurrency slots, so that every
/// received message already holds its slot when it reaches the sink. At most one receive is
/// outstanding at a time.
pub(crate) struct Poller {
    queue_url: String,
    transport: DynTransport,
    sink: DynSink,
    limiter: ConcurrencyLimiter,
    max_messages_per_poll: usize,
    poll_timeout: Duration,
    max_delay_between_polls: Duration,
    backoff: BackoffPolicy,
}

impl Poller {
    pub(crate) fn new(
        queue_url: String,
        transport: DynTransport,
        sink: DynSink,
        limiter: ConcurrencyLimiter,
        options: &ContainerOptions,
    ) -> Self {
        Self {
            queue_url,
            transport,
            sink,
            limiter,
            max_messages_per_poll: options.max_messages_per_poll,
            poll_timeout: options.poll_timeout,
            max_delay_between_polls: options.max_delay_between_polls,
            backoff: options.poll_backoff,
        }
    }

    /// Polls until `shutdown` turns true or its sender goes away.
    ///
    /// An outstanding receive is cancelled on shutdown. Emits that were already handed to the
    /// sink are returned, still running.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) -> Emits {
        info!(queue = %self.queue_url, "Starting poller");
        let mut emits = JoinSet::new();
        let mut backoff = Backoff::new(self.backoff);

        loop {
            while let Some(joined) = emits.try_join_next() {
                if let Err(e) = joined {
                    warn!(queue = %self.queue_url, error = %e, "Emit task failed");
                }
            }
            if *shutdown.borrow_and_update() {
                break;
            }

            let permits = tokio::select! {
                permits = self.limiter.acquire_up_to(
                    self.max_messages_per_poll,
                    self.max_delay_between_polls,
                ) => permits,
                _ = shutdown.changed() => break,
            };
            if permits.is_empty() {
                trace!(queue = %self.queue_url, "No free slot, polling again");
                continue;
            }

            let received = tokio::select! {
                received = self.transport.receive(
                    &self.queue_url,
                    permits.len(),
                    self.poll_timeout,
                ) => received,
                _ = shutdown.changed() => break,
            };

            match received {
                Ok(messages) => {
                    let failures = backoff.reset();
                    if failures > 0 {
                        info!(queue = %self.queue_url, failures, "Receiving recovered");
                    }
                    if messages.is_empty() {
                        trace!(queue = %self.queue_url, "Poll returned no messages");
                        continue;
                    }

                    debug!(queue = %self.queue_url, count = messages.len(), "Received messages");
                    let batch = Batch::with_permits(messages, permits);
                    let sink = self.sink.clone();
                    emits.spawn(async move { sink.emit(batch, ProcessingContext::new()).await });
                }
                Err(e) => {
                    drop(permits);
                    let delay = backoff.on_failure();
                    warn!(
                        queue = %self.queue_url,
                        error = %e,
                        ?delay,
                        "Failed to receive messages"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!(
            queue = %self.queue_url,
            running = emits.len(),
            "Poller stopped"
        );
        emits
    }
}

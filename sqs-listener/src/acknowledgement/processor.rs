use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, trace, warn};

use super::{Acknowledgement, AcknowledgementDelivery, AcknowledgementResultCallback};
use crate::{backoff::RetryPolicy, transport::DynTransport, ListenerError};

/// Deliveries a delete sequence could not remove, with the error that ended it.
#[derive(Debug)]
pub(crate) struct AcknowledgementFailure {
    pub(crate) failed: Vec<String>,
    pub(crate) error: ListenerError,
}

/// Sends the deletes of one queue, either right away or through a background batching task.
#[derive(Clone)]
pub(crate) struct AcknowledgementProcessor(Arc<ProcessorInner>);

struct ProcessorInner {
    executor: Executor,
    delivery: AcknowledgementDelivery,
    batcher: Mutex<Option<Batcher>>,
}

struct Batcher {
    tx: mpsc::UnboundedSender<PendingAcknowledgement>,
    task: JoinHandle<()>,
}

struct PendingAcknowledgement {
    ack: Acknowledgement,
    done: oneshot::Sender<Result<(), ListenerError>>,
}

impl AcknowledgementProcessor {
    pub(crate) fn new(
        transport: DynTransport,
        queue_url: &str,
        delivery: AcknowledgementDelivery,
        retry: RetryPolicy,
        callback: Option<Arc<dyn AcknowledgementResultCallback>>,
    ) -> Self {
        Self(Arc::new(ProcessorInner {
            executor: Executor {
                transport,
                queue_url: queue_url.to_owned(),
                retry,
                callback,
            },
            delivery,
            batcher: Mutex::new(None),
        }))
    }

    fn batcher(&self) -> MutexGuard<'_, Option<Batcher>> {
        self.0
            .batcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts the batching task, if this processor batches and it is not running yet.
    pub(crate) fn start(&self) {
        let AcknowledgementDelivery::Batched {
            threshold,
            interval,
        } = self.0.delivery
        else {
            return;
        };

        let mut batcher = self.batcher();
        if batcher.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_batcher(
            self.0.executor.clone(),
            rx,
            threshold,
            interval,
        ));
        *batcher = Some(Batcher { tx, task });
    }

    /// Flushes buffered acknowledgements and stops the batching task, waiting at most `timeout`.
    pub(crate) async fn stop(&self, timeout: Duration) {
        let Some(Batcher { tx, mut task }) = self.batcher().take() else {
            return;
        };
        drop(tx);

        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!(
                queue = %self.0.executor.queue_url,
                ?timeout,
                "Acknowledgement flush did not finish in time"
            );
            task.abort();
        }
    }

    pub(crate) async fn acknowledge(
        &self,
        acks: Vec<Acknowledgement>,
    ) -> Result<(), AcknowledgementFailure> {
        if acks.is_empty() {
            return Ok(());
        }

        let tx = self.batcher().as_ref().map(|b| b.tx.clone());
        let Some(tx) = tx else {
            return self.0.executor.execute(&acks).await;
        };

        let mut waiting = Vec::with_capacity(acks.len());
        let mut unsent = Vec::new();
        for ack in acks {
            let (done, rx) = oneshot::channel();
            match tx.send(PendingAcknowledgement {
                ack: ack.clone(),
                done,
            }) {
                Ok(()) => waiting.push((ack, rx)),
                Err(_) => unsent.push(ack),
            }
        }
        // Holding on to the sender would keep `stop` from closing the channel.
        drop(tx);

        let mut failed = Vec::new();
        let mut last_error = None;
        if !unsent.is_empty() {
            // The batching task stopped in the meantime.
            if let Err(f) = self.0.executor.execute(&unsent).await {
                failed.extend(f.failed);
                last_error = Some(f.error);
            }
        }
        for (ack, rx) in waiting {
            let result = rx.await.unwrap_or_else(|_| {
                Err(ListenerError::configuration(
                    "acknowledgement processor stopped before the delete completed",
                ))
            });
            if let Err(e) = result {
                failed.push(ack.receipt_handle().to_owned());
                last_error = Some(e);
            }
        }

        match last_error {
            None => Ok(()),
            Some(error) => Err(AcknowledgementFailure { failed, error }),
        }
    }
}

#[derive(Clone)]
struct Executor {
    transport: DynTransport,
    queue_url: String,
    retry: RetryPolicy,
    callback: Option<Arc<dyn AcknowledgementResultCallback>>,
}

impl Executor {
    async fn execute(&self, acks: &[Acknowledgement]) -> Result<(), AcknowledgementFailure> {
        let mut remaining: Vec<String> = acks
            .iter()
            .map(|a| a.receipt_handle().to_owned())
            .collect();
        let mut attempt = 0;

        loop {
            let (failed, e) = match self.transport.delete_all(&self.queue_url, &remaining).await {
                Ok(()) => {
                    trace!(queue = %self.queue_url, count = acks.len(), "Deleted messages");
                    if let Some(cb) = &self.callback {
                        cb.on_success(acks);
                    }
                    return Ok(());
                }
                Err(failure) => failure,
            };

            attempt += 1;
            if attempt >= self.retry.max_attempts {
                error!(
                    queue = %self.queue_url,
                    count = failed.len(),
                    error = %e,
                    "Giving up on deleting messages"
                );
                if let Some(cb) = &self.callback {
                    let (not_deleted, deleted): (Vec<Acknowledgement>, Vec<Acknowledgement>) =
                        acks.iter()
                            .cloned()
                            .partition(|a| failed.iter().any(|rh| rh == a.receipt_handle()));
                    if !deleted.is_empty() {
                        cb.on_success(&deleted);
                    }
                    cb.on_failure(&not_deleted, &e);
                }
                return Err(AcknowledgementFailure { failed, error: e });
            }

            let delay = self.retry.backoff.delay(attempt - 1);
            warn!(
                queue = %self.queue_url,
                attempt,
                ?delay,
                error = %e,
                "Delete failed, retrying"
            );
            tokio::time::sleep(delay).await;
            remaining = failed;
        }
    }
}

async fn run_batcher(
    executor: Executor,
    mut rx: mpsc::UnboundedReceiver<PendingAcknowledgement>,
    threshold: usize,
    interval: Duration,
) {
    debug!(queue = %executor.queue_url, threshold, ?interval, "Batching acknowledgements");
    let mut buffer = Vec::new();
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(pending) => {
                    buffer.push(pending);
                    if buffer.len() >= threshold {
                        flush(&executor, &mut buffer).await;
                        ticker.reset();
                    }
                }
                None => {
                    flush(&executor, &mut buffer).await;
                    break;
                }
            },
            _ = ticker.tick() => flush(&executor, &mut buffer).await,
        }
    }
    debug!(queue = %executor.queue_url, "Acknowledgement batching stopped");
}

async fn flush(executor: &Executor, buffer: &mut Vec<PendingAcknowledgement>) {
    if buffer.is_empty() {
        return;
    }

    let pending = mem::take(buffer);
    let acks: Vec<Acknowledgement> = pending.iter().map(|p| p.ack.clone()).collect();
    let result = executor.execute(&acks).await;

    let total = pending.len();
    for p in pending {
        let outcome = match &result {
            Err(f) if f.failed.iter().any(|rh| rh == p.ack.receipt_handle()) => {
                Err(ListenerError::PartialBatchFailure {
                    failed: f.failed.len(),
                    total,
                })
            }
            _ => Ok(()),
        };
        // The acknowledging side may have given up waiting.
        let _ = p.done.send(outcome);
    }
}

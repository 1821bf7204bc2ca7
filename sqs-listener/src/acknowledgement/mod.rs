//! Deleting processed messages from their queue.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Deserialize;

use crate::{options::duration_millis, ListenerError, Message, Result};

mod processor;

pub(crate) use self::processor::AcknowledgementProcessor;

/// When the pipeline deletes a message.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgementMode {
    /// Delete on receipt, before the handler runs. A failing handler loses the message.
    Always,
    /// Delete once the handler completed without error.
    #[default]
    OnSuccess,
    /// Never delete automatically; the handler calls [`Message::acknowledge`].
    Manual,
    /// Never delete, leaving every message to the queue's redrive policy.
    NoRedrive,
}

impl AcknowledgementMode {
    pub(crate) fn deletes_on_receipt(self) -> bool {
        self == AcknowledgementMode::Always
    }

    pub(crate) fn deletes_on_success(self) -> bool {
        self == AcknowledgementMode::OnSuccess
    }
}

/// How deletes are sent to the transport.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgementDelivery {
    /// One batch delete per acknowledged message or batch.
    #[default]
    Immediate,
    /// Buffer acknowledgements and delete them together once `threshold` are buffered or
    /// `interval` elapsed since the last flush.
    Batched {
        threshold: usize,
        #[serde(with = "duration_millis")]
        interval: Duration,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcknowledgementOutcome {
    Deleted,
    /// The delivery had already been deleted (or a delete of it was under way).
    AlreadyAcknowledged,
}

/// Notified after every delete attempt sequence.
pub trait AcknowledgementResultCallback: Send + Sync {
    fn on_success(&self, acknowledged: &[Acknowledgement]) {
        let _ = acknowledged;
    }

    fn on_failure(&self, failed: &[Acknowledgement], error: &ListenerError) {
        let _ = (failed, error);
    }
}

const PENDING: u8 = 0;
const IN_PROGRESS: u8 = 1;
const DELETED: u8 = 2;

/// The capability to delete one delivery of a message.
///
/// Clones share state: however many clones call [`Acknowledgement::acknowledge`], at most one
/// delete is in flight and a delivery is never deleted twice. A failed delete leaves the
/// acknowledgement pending, so it may be retried.
#[derive(Clone)]
pub struct Acknowledgement(Arc<AcknowledgementInner>);

struct AcknowledgementInner {
    message_id: String,
    receipt_handle: String,
    queue_url: String,
    state: AtomicU8,
    processor: AcknowledgementProcessor,
}

impl Acknowledgement {
    pub(crate) fn new<T>(message: &Message<T>, processor: AcknowledgementProcessor) -> Self {
        Self(Arc::new(AcknowledgementInner {
            message_id: message.id().to_owned(),
            receipt_handle: message.receipt_handle().to_owned(),
            queue_url: message.queue_url().to_owned(),
            state: AtomicU8::new(PENDING),
            processor,
        }))
    }

    pub fn message_id(&self) -> &str {
        &self.0.message_id
    }

    pub fn receipt_handle(&self) -> &str {
        &self.0.receipt_handle
    }

    pub fn queue_url(&self) -> &str {
        &self.0.queue_url
    }

    pub fn is_acknowledged(&self) -> bool {
        self.0.state.load(Ordering::Acquire) == DELETED
    }

    /// Deletes this delivery from its queue.
    pub async fn acknowledge(&self) -> Result<AcknowledgementOutcome> {
        if !self.claim() {
            return Ok(AcknowledgementOutcome::AlreadyAcknowledged);
        }

        match self.0.processor.acknowledge(vec![self.clone()]).await {
            Ok(()) => {
                self.settle(true);
                Ok(AcknowledgementOutcome::Deleted)
            }
            Err(failure) => {
                self.settle(false);
                Err(failure.error)
            }
        }
    }

    /// Deletes every pending delivery in `acks` with as few transport calls as possible.
    ///
    /// Deliveries that were already deleted are skipped. All of `acks` must belong to the same
    /// queue.
    pub(crate) async fn acknowledge_all(acks: &[Acknowledgement]) -> Result<()> {
        let claimed: Vec<Acknowledgement> = acks.iter().filter(|a| a.claim()).cloned().collect();
        let Some(first) = claimed.first() else {
            return Ok(());
        };

        match first.0.processor.acknowledge(claimed.clone()).await {
            Ok(()) => {
                for ack in &claimed {
                    ack.settle(true);
                }
                Ok(())
            }
            Err(failure) => {
                for ack in &claimed {
                    ack.settle(!failure.failed.iter().any(|rh| rh == ack.receipt_handle()));
                }
                Err(failure.error)
            }
        }
    }

    fn claim(&self) -> bool {
        self.0
            .state
            .compare_exchange(PENDING, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn settle(&self, deleted: bool) {
        let state = if deleted { DELETED } else { PENDING };
        self.0.state.store(state, Ordering::Release);
    }
}

impl fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgement")
            .field("message_id", &self.0.message_id)
            .field("acknowledged", &self.is_acknowledged())
            .finish_non_exhaustive()
    }
}

//! The way of one message (or one batch) from receipt to its terminal state.
//!
//! ```text
//! RECEIVED -> CONVERTED -> INTERCEPTED -> HANDLING -> { ACKNOWLEDGED | FAILED } -> TERMINAL
//! ```
//!
//! A message whose payload cannot be converted goes straight to `FAILED`, no interceptor sees
//! it. A message never enters `HANDLING` twice in one invocation. Interceptors see the message in
//! registration order, container interceptors first, then the ones added to the
//! [`ProcessingContext`] by sink adapters.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt as _;
use tracing::{debug, trace, warn};

use crate::{
    acknowledgement::{Acknowledgement, AcknowledgementMode, AcknowledgementProcessor},
    handler::{Converted, DynErrorHandler, Listener},
    interceptor::{DynInterceptor, MessageInterceptor},
    message::headers,
    transport::{DynTransport, Visibility},
    ListenerError, Message,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessingStatus {
    Succeeded,
    Failed { reason: String },
    /// Never handled, e.g. because an earlier message of its ordering group failed.
    Skipped,
}

impl ProcessingStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingStatus::Succeeded)
    }

    fn failed(error: &ListenerError) -> Self {
        ProcessingStatus::Failed {
            reason: error.to_string(),
        }
    }
}

/// What became of one message of an emitted batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageOutcome {
    pub message_id: String,
    pub receipt_handle: String,
    pub status: ProcessingStatus,
    /// Whether the delivery was deleted. If not, it is left for redelivery.
    pub deleted: bool,
}

impl MessageOutcome {
    pub(crate) fn new<T>(message: &Message<T>, status: ProcessingStatus, deleted: bool) -> Self {
        Self {
            message_id: message.id().to_owned(),
            receipt_handle: message.receipt_handle().to_owned(),
            status,
            deleted,
        }
    }

    fn acknowledged(ack: &Acknowledgement, status: ProcessingStatus) -> Self {
        Self {
            message_id: ack.message_id().to_owned(),
            receipt_handle: ack.receipt_handle().to_owned(),
            status,
            deleted: ack.is_acknowledged(),
        }
    }
}

/// Per-emit state handed down the sink chain.
///
/// Only interceptors travel with the context. The
/// [`AcknowledgementResultCallback`](crate::acknowledgement::AcknowledgementResultCallback) is held
/// by the queue's acknowledgement processor instead, which reports every delete it performs,
/// including batched ones that complete after the emit returned.
#[derive(Clone, Default)]
pub struct ProcessingContext {
    interceptors: Vec<DynInterceptor>,
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interceptor(mut self, interceptor: impl MessageInterceptor) -> Self {
        self.interceptors.push(DynInterceptor::new(interceptor));
        self
    }

    pub fn interceptors(&self) -> &[DynInterceptor] {
        &self.interceptors
    }
}

#[derive(Clone, Copy, Debug)]
enum ProcessingState {
    Received,
    Converted,
    Intercepted,
    Handling,
    Acknowledged,
    Failed,
    Terminal,
}

fn transition<T>(message: &Message<T>, state: ProcessingState) {
    trace!(message_id = %message.id(), queue = %message.queue_url(), ?state, "Message state changed");
}

pub(crate) struct MessagePipeline {
    listener: Listener,
    interceptors: Vec<DynInterceptor>,
    error_handler: Option<DynErrorHandler>,
    acknowledgement_mode: AcknowledgementMode,
    acknowledgements: AcknowledgementProcessor,
    transport: DynTransport,
}

type Handled<T> = Result<T, (T, ListenerError)>;

impl MessagePipeline {
    pub(crate) fn new(
        listener: Listener,
        interceptors: Vec<DynInterceptor>,
        error_handler: Option<DynErrorHandler>,
        acknowledgement_mode: AcknowledgementMode,
        acknowledgements: AcknowledgementProcessor,
        transport: DynTransport,
    ) -> Self {
        Self {
            listener,
            interceptors,
            error_handler,
            acknowledgement_mode,
            acknowledgements,
            transport,
        }
    }

    /// Binds a received message to its acknowledgement and visibility, and adds the delivery
    /// attempt header unless the message already carries one.
    fn prepare(&self, message: Message) -> (Message, Acknowledgement) {
        let ack = Acknowledgement::new(&message, self.acknowledgements.clone());
        let visibility = Visibility::new(
            self.transport.clone(),
            message.queue_url(),
            message.receipt_handle(),
        );
        let attempt = message.receive_count().to_string();
        let message = message
            .with_header_if_absent(headers::DELIVERY_ATTEMPT, attempt)
            .with_acknowledgement(ack.clone())
            .with_visibility(visibility);
        (message, ack)
    }

    fn interceptors<'a>(&'a self, context: &'a ProcessingContext) -> Vec<&'a DynInterceptor> {
        self.interceptors
            .iter()
            .chain(context.interceptors())
            .collect()
    }

    pub(crate) async fn process(
        &self,
        message: Message,
        context: &ProcessingContext,
    ) -> MessageOutcome {
        let (message, ack) = self.prepare(message);
        transition(&message, ProcessingState::Received);
        if self.acknowledgement_mode.deletes_on_receipt() {
            acknowledge(&ack).await;
        }

        let interceptors = self.interceptors(context);
        let handled = match self.listener.convert(&message) {
            Ok(payload) => {
                transition(&message, ProcessingState::Converted);
                self.intercept_and_handle(message, payload, &interceptors)
                    .await
            }
            Err(e) => Err((message, e)),
        };
        let (message, status) = match handled {
            Ok(message) => {
                for interceptor in &interceptors {
                    interceptor.after(&message).await;
                }
                if self.acknowledgement_mode.deletes_on_success() {
                    acknowledge(&ack).await;
                }
                (message, ProcessingStatus::Succeeded)
            }
            Err((message, error)) => {
                let status = self.recover(&message, error).await;
                if status.is_success() && self.acknowledgement_mode.deletes_on_success() {
                    acknowledge(&ack).await;
                }
                (message, status)
            }
        };

        transition(
            &message,
            if status.is_success() {
                ProcessingState::Acknowledged
            } else {
                ProcessingState::Failed
            },
        );
        for interceptor in &interceptors {
            interceptor.on_completion(&message, &status).await;
        }
        transition(&message, ProcessingState::Terminal);
        MessageOutcome::acknowledged(&ack, status)
    }

    async fn intercept_and_handle(
        &self,
        message: Message,
        payload: Converted,
        interceptors: &[&DynInterceptor],
    ) -> Handled<Message> {
        let mut current = message;
        for interceptor in interceptors {
            current = match interceptor.before(current.clone()).await {
                Ok(intercepted) => intercepted,
                Err(e) => return Err((current, e)),
            };
        }
        transition(&current, ProcessingState::Intercepted);

        let Listener::Single(handler) = &self.listener else {
            let e = ListenerError::configuration("batch listener cannot handle single messages");
            return Err((current, e));
        };
        transition(&current, ProcessingState::Handling);
        match AssertUnwindSafe(handler.handle(current.clone(), payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(current),
            Ok(Err(e)) => Err((current, e)),
            Err(_) => Err((current, ListenerError::HandlerPanicked)),
        }
    }

    async fn recover(&self, message: &Message, error: ListenerError) -> ProcessingStatus {
        debug!(message_id = %message.id(), error = %error, "Message processing failed");
        let Some(error_handler) = &self.error_handler else {
            return ProcessingStatus::failed(&error);
        };
        match error_handler.handle(message, error).await {
            Ok(()) => {
                debug!(message_id = %message.id(), "Error handler recovered message");
                ProcessingStatus::Succeeded
            }
            Err(e) => ProcessingStatus::failed(&e),
        }
    }

    /// Drives a whole batch through one handler invocation. Every message shares the outcome.
    pub(crate) async fn process_batch(
        &self,
        messages: Vec<Message>,
        context: &ProcessingContext,
    ) -> Vec<MessageOutcome> {
        if messages.is_empty() {
            return Vec::new();
        }
        let (messages, acks): (Vec<Message>, Vec<Acknowledgement>) =
            messages.into_iter().map(|m| self.prepare(m)).unzip();
        for message in &messages {
            transition(message, ProcessingState::Received);
        }
        if self.acknowledgement_mode.deletes_on_receipt() {
            acknowledge_all(&acks).await;
        }

        let interceptors = self.interceptors(context);
        let converted = messages
            .iter()
            .map(|m| Ok((m.id().to_owned(), self.listener.convert(m)?)))
            .collect::<Result<Vec<_>, ListenerError>>();
        let handled = match converted {
            Ok(payloads) => {
                for message in &messages {
                    transition(message, ProcessingState::Converted);
                }
                self.intercept_and_handle_batch(messages, payloads, &interceptors)
                    .await
            }
            Err(e) => Err((messages, e)),
        };
        let (messages, status) = match handled {
            Ok(messages) => {
                for interceptor in &interceptors {
                    interceptor.after_batch(&messages).await;
                }
                (messages, ProcessingStatus::Succeeded)
            }
            Err((messages, error)) => {
                let status = self.recover_batch(&messages, error).await;
                (messages, status)
            }
        };
        if status.is_success() && self.acknowledgement_mode.deletes_on_success() {
            acknowledge_all(&acks).await;
        }

        for interceptor in &interceptors {
            interceptor.on_completion_batch(&messages, &status).await;
        }
        for message in &messages {
            transition(message, ProcessingState::Terminal);
        }
        acks.iter()
            .map(|ack| MessageOutcome::acknowledged(ack, status.clone()))
            .collect()
    }

    async fn intercept_and_handle_batch(
        &self,
        messages: Vec<Message>,
        mut payloads: Vec<(String, Converted)>,
        interceptors: &[&DynInterceptor],
    ) -> Handled<Vec<Message>> {
        let mut current = messages;
        for interceptor in interceptors {
            current = match interceptor.before_batch(current.clone()).await {
                Ok(intercepted) => intercepted,
                Err(e) => return Err((current, e)),
            };
        }

        let Listener::Batch(handler) = &self.listener else {
            let e = ListenerError::configuration("single message listener cannot handle batches");
            return Err((current, e));
        };
        // Interceptors may reorder or drop messages, so payloads are matched up by id.
        let paired: Option<Vec<(Message, Converted)>> = current
            .iter()
            .map(|m| {
                let pos = payloads.iter().position(|(id, _)| id == m.id())?;
                Some((m.clone(), payloads.swap_remove(pos).1))
            })
            .collect();
        let Some(paired) = paired else {
            let e = ListenerError::handler("interceptor added a message that was never received");
            return Err((current, e));
        };
        for message in &current {
            transition(message, ProcessingState::Handling);
        }
        match AssertUnwindSafe(handler.handle_batch(paired))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(current),
            Ok(Err(e)) => Err((current, e)),
            Err(_) => Err((current, ListenerError::HandlerPanicked)),
        }
    }

    async fn recover_batch(&self, messages: &[Message], error: ListenerError) -> ProcessingStatus {
        debug!(count = messages.len(), error = %error, "Batch processing failed");
        let Some(error_handler) = &self.error_handler else {
            return ProcessingStatus::failed(&error);
        };
        match error_handler.handle_batch(messages, error).await {
            Ok(()) => ProcessingStatus::Succeeded,
            Err(e) => ProcessingStatus::failed(&e),
        }
    }

    /// Completes a message without handling it. It is left for redelivery.
    pub(crate) async fn skip(&self, message: Message, context: &ProcessingContext) -> MessageOutcome {
        let status = ProcessingStatus::Skipped;
        for interceptor in self.interceptors(context) {
            interceptor.on_completion(&message, &status).await;
        }
        transition(&message, ProcessingState::Terminal);
        MessageOutcome::new(&message, status, false)
    }
}

async fn acknowledge(ack: &Acknowledgement) {
    if let Err(e) = ack.acknowledge().await {
        warn!(message_id = %ack.message_id(), error = %e, "Failed to acknowledge message");
    }
}

async fn acknowledge_all(acks: &[Acknowledgement]) {
    if let Err(e) = Acknowledgement::acknowledge_all(acks).await {
        warn!(count = acks.len(), error = %e, "Failed to acknowledge batch");
    }
}

//! User handlers and what happens when they fail.

use std::{any::Any, future::Future, marker::PhantomData, sync::Arc};

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::{
    backoff::Jitter,
    converter::MessageConverter,
    options::ListenerMode,
    transport::MAX_VISIBILITY_TIMEOUT_SECS,
    ListenerError, Message, Result,
};

pub trait MessageHandler<T>: Send + Sync + 'static {
    fn handle(&self, message: Message<T>) -> impl Future<Output = Result<()>> + Send;
}

impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    fn handle(&self, message: Message<T>) -> impl Future<Output = Result<()>> + Send {
        self(message)
    }
}

/// A handler receiving every message of a batch at once.
pub trait BatchMessageHandler<T>: Send + Sync + 'static {
    fn handle_batch(&self, messages: Vec<Message<T>>) -> impl Future<Output = Result<()>> + Send;
}

impl<T, F, Fut> BatchMessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(Vec<Message<T>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    fn handle_batch(&self, messages: Vec<Message<T>>) -> impl Future<Output = Result<()>> + Send {
        self(messages)
    }
}

/// A handler paired with the converter producing its payload type, working on raw messages.
#[derive(Clone)]
pub(crate) enum Listener {
    Single(Arc<dyn ErasedHandler>),
    Batch(Arc<dyn ErasedBatchHandler>),
}

impl Listener {
    pub(crate) fn single<T, C, H>(converter: C, handler: H) -> Self
    where
        T: Send + 'static,
        C: MessageConverter<T>,
        H: MessageHandler<T>,
    {
        Self::Single(Arc::new(Converting {
            converter,
            handler,
            _pd: PhantomData,
        }))
    }

    pub(crate) fn batch<T, C, H>(converter: C, handler: H) -> Self
    where
        T: Send + 'static,
        C: MessageConverter<T>,
        H: BatchMessageHandler<T>,
    {
        Self::Batch(Arc::new(Converting {
            converter,
            handler,
            _pd: PhantomData,
        }))
    }

    pub(crate) fn mode(&self) -> ListenerMode {
        match self {
            Listener::Single(_) => ListenerMode::Single,
            Listener::Batch(_) => ListenerMode::Batch,
        }
    }

    /// Converts the raw payload into the handler's payload type. Runs before any interceptor.
    pub(crate) fn convert(&self, message: &Message) -> Result<Converted> {
        match self {
            Listener::Single(handler) => handler.convert(message),
            Listener::Batch(handler) => handler.convert(message),
        }
    }
}

/// A payload produced by [`Listener::convert`], to be handed back to the same listener.
pub(crate) type Converted = Box<dyn Any + Send>;

pub(crate) trait ErasedHandler: Send + Sync {
    fn convert(&self, message: &Message) -> Result<Converted>;
    fn handle(&self, message: Message, payload: Converted) -> BoxFuture<'_, Result<()>>;
}

pub(crate) trait ErasedBatchHandler: Send + Sync {
    fn convert(&self, message: &Message) -> Result<Converted>;
    fn handle_batch(&self, messages: Vec<(Message, Converted)>) -> BoxFuture<'_, Result<()>>;
}

struct Converting<C, H, T> {
    converter: C,
    handler: H,
    _pd: PhantomData<fn() -> T>,
}

impl<C, H, T> Converting<C, H, T>
where
    T: Send + 'static,
    C: MessageConverter<T>,
{
    fn erase(&self, message: &Message) -> Result<Converted> {
        Ok(Box::new(self.converter.convert(message)?))
    }

    fn typed(message: &Message, payload: Converted) -> Result<Message<T>> {
        let payload = payload
            .downcast::<T>()
            .map_err(|_| ListenerError::conversion("converted payload has an unexpected type"))?;
        Ok(message.replace_payload(*payload))
    }
}

impl<T, C, H> ErasedHandler for Converting<C, H, T>
where
    T: Send + 'static,
    C: MessageConverter<T>,
    H: MessageHandler<T>,
{
    fn convert(&self, message: &Message) -> Result<Converted> {
        self.erase(message)
    }

    fn handle(&self, message: Message, payload: Converted) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let message = Self::typed(&message, payload)?;
            self.handler.handle(message).await
        })
    }
}

impl<T, C, H> ErasedBatchHandler for Converting<C, H, T>
where
    T: Send + 'static,
    C: MessageConverter<T>,
    H: BatchMessageHandler<T>,
{
    fn convert(&self, message: &Message) -> Result<Converted> {
        self.erase(message)
    }

    fn handle_batch(&self, messages: Vec<(Message, Converted)>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let typed = messages
                .into_iter()
                .map(|(message, payload)| Self::typed(&message, payload))
                .collect::<Result<Vec<_>>>()?;
            self.handler.handle_batch(typed).await
        })
    }
}

/// Decides what happens to a message whose handler failed.
///
/// Returning `Ok(())` marks the message as recovered, after which it is acknowledged like a
/// successfully handled one. Returning an error keeps it failed.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle(
        &self,
        message: &Message,
        error: ListenerError,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Recovers a batch only if every message of it recovers.
    fn handle_batch(
        &self,
        messages: &[Message],
        error: ListenerError,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            let reason = error.to_string();
            let mut result = Ok(());
            for message in messages {
                if let Err(e) = self.handle(message, ListenerError::handler(reason.clone())).await
                {
                    result = Err(e);
                }
            }
            result
        }
    }
}

#[derive(Clone)]
pub(crate) struct DynErrorHandler(Arc<dyn ErasedErrorHandler>);

impl DynErrorHandler {
    pub(crate) fn new(inner: impl ErrorHandler) -> Self {
        Self(Arc::new(inner))
    }

    pub(crate) async fn handle(&self, message: &Message, error: ListenerError) -> Result<()> {
        self.0.handle(message, error).await
    }

    pub(crate) async fn handle_batch(
        &self,
        messages: &[Message],
        error: ListenerError,
    ) -> Result<()> {
        self.0.handle_batch(messages, error).await
    }
}

trait ErasedErrorHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        message: &'a Message,
        error: ListenerError,
    ) -> BoxFuture<'a, Result<()>>;
    fn handle_batch<'a>(
        &'a self,
        messages: &'a [Message],
        error: ListenerError,
    ) -> BoxFuture<'a, Result<()>>;
}

impl<H: ErrorHandler> ErasedErrorHandler for H {
    fn handle<'a>(
        &'a self,
        message: &'a Message,
        error: ListenerError,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(ErrorHandler::handle(self, message, error))
    }

    fn handle_batch<'a>(
        &'a self,
        messages: &'a [Message],
        error: ListenerError,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(ErrorHandler::handle_batch(self, messages, error))
    }
}

/// Postpones the redelivery of failed messages, longer with every delivery attempt.
///
/// The visibility timeout becomes `initial * multiplier^(receive_count - 1)` seconds, capped at
/// `max`. Messages stay failed.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffErrorHandler {
    pub initial_visibility_timeout_secs: u32,
    pub multiplier: f64,
    pub max_visibility_timeout_secs: u32,
    pub jitter: Jitter,
}

impl Default for ExponentialBackoffErrorHandler {
    fn default() -> Self {
        Self {
            initial_visibility_timeout_secs: 100,
            multiplier: 2.0,
            max_visibility_timeout_secs: MAX_VISIBILITY_TIMEOUT_SECS,
            jitter: Jitter::None,
        }
    }
}

impl ExponentialBackoffErrorHandler {
    pub fn visibility_timeout(&self, receive_count: u32, rng: &mut fastrand::Rng) -> u32 {
        let exponent = receive_count.saturating_sub(1).min(64) as i32;
        let secs = (f64::from(self.initial_visibility_timeout_secs)
            * self.multiplier.max(1.0).powi(exponent))
        .min(f64::from(self.max_visibility_timeout_secs));
        self.jitter.apply(secs as u32, rng)
    }
}

impl ErrorHandler for ExponentialBackoffErrorHandler {
    async fn handle(&self, message: &Message, error: ListenerError) -> Result<()> {
        let timeout = self.visibility_timeout(message.receive_count(), &mut fastrand::Rng::new());
        postpone(message, timeout).await;
        Err(error)
    }
}

/// Postpones the redelivery of failed messages by
/// `initial + increment * (receive_count - 1)` seconds, capped at `max`. Messages stay failed.
#[derive(Clone, Debug)]
pub struct LinearBackoffErrorHandler {
    pub initial_visibility_timeout_secs: u32,
    pub increment_secs: u32,
    pub max_visibility_timeout_secs: u32,
}

impl Default for LinearBackoffErrorHandler {
    fn default() -> Self {
        Self {
            initial_visibility_timeout_secs: 100,
            increment_secs: 2,
            max_visibility_timeout_secs: MAX_VISIBILITY_TIMEOUT_SECS,
        }
    }
}

impl LinearBackoffErrorHandler {
    pub fn visibility_timeout(&self, receive_count: u32) -> u32 {
        self.increment_secs
            .saturating_mul(receive_count.saturating_sub(1))
            .saturating_add(self.initial_visibility_timeout_secs)
            .min(self.max_visibility_timeout_secs)
    }
}

impl ErrorHandler for LinearBackoffErrorHandler {
    async fn handle(&self, message: &Message, error: ListenerError) -> Result<()> {
        postpone(message, self.visibility_timeout(message.receive_count())).await;
        Err(error)
    }
}

async fn postpone(message: &Message, timeout_seconds: u32) {
    let Some(visibility) = message.visibility() else {
        return;
    };
    match visibility.change_to(timeout_seconds).await {
        Ok(()) => debug!(
            message_id = %message.id(),
            timeout_seconds,
            "Postponed redelivery of failed message"
        ),
        Err(e) => warn!(
            message_id = %message.id(),
            error = %e,
            "Failed to postpone redelivery of failed message"
        ),
    }
}

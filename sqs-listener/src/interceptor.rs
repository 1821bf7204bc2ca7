use std::{future::Future, sync::Arc};

use futures_util::future::BoxFuture;

use crate::{pipeline::ProcessingStatus, Message, Result};

/// Hooks run by the pipeline around every handler invocation.
///
/// `before` hooks run in registration order and may return an enriched copy of the message,
/// which is what later hooks and the handler see. A failing `before` hook fails the message
/// without invoking the handler.
pub trait MessageInterceptor: Send + Sync + 'static {
    fn before(&self, message: Message) -> impl Future<Output = Result<Message>> + Send {
        async move { Ok(message) }
    }

    /// Runs only after the handler succeeded.
    fn after(&self, message: &Message) -> impl Future<Output = ()> + Send {
        let _ = message;
        async {}
    }

    /// Runs once the message reached its terminal state, whatever that is.
    fn on_completion(
        &self,
        message: &Message,
        status: &ProcessingStatus,
    ) -> impl Future<Output = ()> + Send {
        let _ = (message, status);
        async {}
    }

    fn before_batch(
        &self,
        messages: Vec<Message>,
    ) -> impl Future<Output = Result<Vec<Message>>> + Send {
        async move {
            let mut out = Vec::with_capacity(messages.len());
            for message in messages {
                out.push(self.before(message).await?);
            }
            Ok(out)
        }
    }

    fn after_batch(&self, messages: &[Message]) -> impl Future<Output = ()> + Send {
        async move {
            for message in messages {
                self.after(message).await;
            }
        }
    }

    fn on_completion_batch(
        &self,
        messages: &[Message],
        status: &ProcessingStatus,
    ) -> impl Future<Output = ()> + Send {
        async move {
            for message in messages {
                self.on_completion(message, status).await;
            }
        }
    }
}

/// A type-erased, cheaply clonable [`MessageInterceptor`].
#[derive(Clone)]
pub struct DynInterceptor(Arc<dyn ErasedInterceptor>);

impl DynInterceptor {
    pub fn new(inner: impl MessageInterceptor) -> Self {
        Self(Arc::new(DynInterceptorInner { inner }))
    }
}

trait ErasedInterceptor: Send + Sync {
    fn before(&self, message: Message) -> BoxFuture<'_, Result<Message>>;
    fn after<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, ()>;
    fn on_completion<'a>(
        &'a self,
        message: &'a Message,
        status: &'a ProcessingStatus,
    ) -> BoxFuture<'a, ()>;
    fn before_batch(&self, messages: Vec<Message>) -> BoxFuture<'_, Result<Vec<Message>>>;
    fn after_batch<'a>(&'a self, messages: &'a [Message]) -> BoxFuture<'a, ()>;
    fn on_completion_batch<'a>(
        &'a self,
        messages: &'a [Message],
        status: &'a ProcessingStatus,
    ) -> BoxFuture<'a, ()>;
}

struct DynInterceptorInner<I> {
    inner: I,
}

impl<I: MessageInterceptor> ErasedInterceptor for DynInterceptorInner<I> {
    fn before(&self, message: Message) -> BoxFuture<'_, Result<Message>> {
        Box::pin(self.inner.before(message))
    }

    fn after<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, ()> {
        Box::pin(self.inner.after(message))
    }

    fn on_completion<'a>(
        &'a self,
        message: &'a Message,
        status: &'a ProcessingStatus,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.inner.on_completion(message, status))
    }

    fn before_batch(&self, messages: Vec<Message>) -> BoxFuture<'_, Result<Vec<Message>>> {
        Box::pin(self.inner.before_batch(messages))
    }

    fn after_batch<'a>(&'a self, messages: &'a [Message]) -> BoxFuture<'a, ()> {
        Box::pin(self.inner.after_batch(messages))
    }

    fn on_completion_batch<'a>(
        &'a self,
        messages: &'a [Message],
        status: &'a ProcessingStatus,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.inner.on_completion_batch(messages, status))
    }
}

impl MessageInterceptor for DynInterceptor {
    async fn before(&self, message: Message) -> Result<Message> {
        self.0.before(message).await
    }

    async fn after(&self, message: &Message) {
        self.0.after(message).await;
    }

    async fn on_completion(&self, message: &Message, status: &ProcessingStatus) {
        self.0.on_completion(message, status).await;
    }

    async fn before_batch(&self, messages: Vec<Message>) -> Result<Vec<Message>> {
        self.0.before_batch(messages).await
    }

    async fn after_batch(&self, messages: &[Message]) {
        self.0.after_batch(messages).await;
    }

    async fn on_completion_batch(&self, messages: &[Message], status: &ProcessingStatus) {
        self.0.on_completion_batch(messages, status).await;
    }
}

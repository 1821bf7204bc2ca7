use std::{sync::Arc, time::Duration};

use crate::{
    acknowledgement::{AcknowledgementDelivery, AcknowledgementMode, AcknowledgementProcessor},
    backoff::RetryPolicy,
    converter::Bytes,
    handler::{DynErrorHandler, Listener},
    interceptor::DynInterceptor,
    pipeline::MessagePipeline,
    transport::{in_memory::InMemoryTransport, QueueTransport},
    ListenerError, Message,
};

pub(crate) struct Fixture {
    pub(crate) transport: InMemoryTransport,
    pub(crate) queue_url: String,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self::with_visibility(Duration::from_secs(30))
    }

    pub(crate) fn with_visibility(visibility: Duration) -> Self {
        let transport = InMemoryTransport::with_default_visibility(visibility);
        let queue_url = transport.create_queue("test");
        Self {
            transport,
            queue_url,
        }
    }

    pub(crate) fn send_all(&self, bodies: &[&str]) {
        for body in bodies {
            self.transport.send(&self.queue_url, *body).unwrap();
        }
    }

    pub(crate) async fn receive(&self) -> Vec<Message> {
        self.transport
            .receive(&self.queue_url, 10, Duration::ZERO)
            .await
            .unwrap()
    }

    pub(crate) async fn receive_one(&self, body: &str) -> Message {
        self.send_all(&[body]);
        let mut messages = self.receive().await;
        assert_eq!(messages.len(), 1);
        messages.remove(0)
    }

    pub(crate) fn pipeline(
        &self,
        listener: Listener,
        mode: AcknowledgementMode,
    ) -> Arc<MessagePipeline> {
        self.pipeline_with(listener, mode, Vec::new(), None)
    }

    pub(crate) fn pipeline_with(
        &self,
        listener: Listener,
        mode: AcknowledgementMode,
        interceptors: Vec<DynInterceptor>,
        error_handler: Option<DynErrorHandler>,
    ) -> Arc<MessagePipeline> {
        let transport = self.transport.clone().into_dyn();
        let acknowledgements = AcknowledgementProcessor::new(
            transport.clone(),
            &self.queue_url,
            AcknowledgementDelivery::Immediate,
            RetryPolicy::default(),
            None,
        );
        Arc::new(MessagePipeline::new(
            listener,
            interceptors,
            error_handler,
            mode,
            acknowledgements,
            transport,
        ))
    }
}

async fn succeed(_message: Message<Vec<u8>>) -> crate::Result<()> {
    Ok(())
}

async fn fail(_message: Message<Vec<u8>>) -> crate::Result<()> {
    Err(ListenerError::handler("boom"))
}

pub(crate) fn succeeding() -> Listener {
    Listener::single(Bytes, succeed)
}

pub(crate) fn failing() -> Listener {
    Listener::single(Bytes, fail)
}

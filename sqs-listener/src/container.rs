//! The listener container: registrations, sink composition and lifecycle.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures_util::future::join_all;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    acknowledgement::{AcknowledgementProcessor, AcknowledgementResultCallback},
    converter::{FromMessage, MessageConverter},
    handler::{BatchMessageHandler, DynErrorHandler, ErrorHandler, Listener, MessageHandler},
    interceptor::{DynInterceptor, MessageInterceptor},
    limiter::ConcurrencyLimiter,
    options::{ContainerOptions, ListenerMode, ListenerOptions},
    pipeline::MessagePipeline,
    poller::{Emits, Poller},
    sink::{
        grouping::MessageGroupingSinkAdapter,
        visibility::{VisibilityExtendingSinkAdapter, VisibilityStrategy},
        BatchSink, DynSink, FanOutSink, MessageSink as _, OrderedSink,
    },
    transport::{DynTransport, QueueTransport},
    ListenerError, Result,
};

struct Registration {
    queue: String,
    listener: Listener,
    options: ListenerOptions,
}

pub struct ContainerBuilder {
    transport: DynTransport,
    options: ContainerOptions,
    registrations: Vec<Registration>,
    interceptors: Vec<DynInterceptor>,
    error_handler: Option<DynErrorHandler>,
    callback: Option<Arc<dyn AcknowledgementResultCallback>>,
}

impl ContainerBuilder {
    pub fn options(mut self, options: ContainerOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers `handler` for every message of `queue`, a queue name or url.
    pub fn listener<T, H>(self, queue: impl Into<String>, handler: H) -> Self
    where
        T: FromMessage,
        H: MessageHandler<T>,
    {
        self.listener_with_options(queue, ListenerOptions::default(), handler)
    }

    pub fn listener_with_options<T, H>(
        self,
        queue: impl Into<String>,
        options: ListenerOptions,
        handler: H,
    ) -> Self
    where
        T: FromMessage,
        H: MessageHandler<T>,
    {
        self.register(
            queue.into(),
            options,
            Listener::single(T::Converter::default(), handler),
        )
    }

    /// Registers `handler` for `queue`, with payloads converted by `converter`.
    pub fn listener_with_converter<T, C, H>(
        self,
        queue: impl Into<String>,
        options: ListenerOptions,
        converter: C,
        handler: H,
    ) -> Self
    where
        T: Send + 'static,
        C: MessageConverter<T>,
        H: MessageHandler<T>,
    {
        self.register(queue.into(), options, Listener::single(converter, handler))
    }

    /// Registers `handler` for whole batches of `queue`.
    pub fn batch_listener<T, H>(self, queue: impl Into<String>, handler: H) -> Self
    where
        T: FromMessage,
        H: BatchMessageHandler<T>,
    {
        self.batch_listener_with_options(queue, ListenerOptions::default(), handler)
    }

    pub fn batch_listener_with_options<T, H>(
        self,
        queue: impl Into<String>,
        options: ListenerOptions,
        handler: H,
    ) -> Self
    where
        T: FromMessage,
        H: BatchMessageHandler<T>,
    {
        self.register(
            queue.into(),
            options,
            Listener::batch(T::Converter::default(), handler),
        )
    }

    pub fn batch_listener_with_converter<T, C, H>(
        self,
        queue: impl Into<String>,
        options: ListenerOptions,
        converter: C,
        handler: H,
    ) -> Self
    where
        T: Send + 'static,
        C: MessageConverter<T>,
        H: BatchMessageHandler<T>,
    {
        self.register(queue.into(), options, Listener::batch(converter, handler))
    }

    fn register(mut self, queue: String, options: ListenerOptions, listener: Listener) -> Self {
        self.registrations.push(Registration {
            queue,
            listener,
            options,
        });
        self
    }

    /// Adds an interceptor to the pipeline of every listener. Interceptors run in the order they
    /// were added.
    pub fn interceptor(mut self, interceptor: impl MessageInterceptor) -> Self {
        self.interceptors.push(DynInterceptor::new(interceptor));
        self
    }

    pub fn error_handler(mut self, error_handler: impl ErrorHandler) -> Self {
        self.error_handler = Some(DynErrorHandler::new(error_handler));
        self
    }

    pub fn acknowledgement_callback(
        mut self,
        callback: impl AcknowledgementResultCallback + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<ListenerContainer> {
        self.options.validate()?;
        if self.registrations.is_empty() {
            return Err(ListenerError::configuration("no listener registered"));
        }

        let mut queues = HashSet::new();
        for registration in &self.registrations {
            let queue = registration.queue.trim();
            if queue.is_empty() {
                return Err(ListenerError::configuration("queue name must not be empty"));
            }
            if !queues.insert(queue) {
                return Err(ListenerError::configuration(format!(
                    "more than one listener registered for queue {queue}"
                )));
            }
            self.options.merged(&registration.options).validate()?;
        }

        Ok(ListenerContainer {
            transport: self.transport,
            options: self.options,
            registrations: self.registrations,
            interceptors: self.interceptors,
            error_handler: self.error_handler,
            callback: self.callback,
            lifecycle: tokio::sync::Mutex::new(()),
            running: Mutex::new(None),
        })
    }
}

/// Polls every registered queue and drives what it receives through the listeners.
///
/// Each queue gets its own poller, concurrency limiter and acknowledgement processor, all
/// created on [`ListenerContainer::start`] and torn down on [`ListenerContainer::stop`]. The
/// container may be started again after it was stopped.
pub struct ListenerContainer {
    transport: DynTransport,
    options: ContainerOptions,
    registrations: Vec<Registration>,
    interceptors: Vec<DynInterceptor>,
    error_handler: Option<DynErrorHandler>,
    callback: Option<Arc<dyn AcknowledgementResultCallback>>,
    // Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    queues: Vec<RunningQueue>,
}

struct RunningQueue {
    name: String,
    queue_url: String,
    limiter: ConcurrencyLimiter,
    acknowledgements: AcknowledgementProcessor,
    poller: JoinHandle<Emits>,
    shutdown_timeout: Duration,
    acknowledgement_shutdown_timeout: Duration,
}

impl ListenerContainer {
    pub fn builder(transport: impl QueueTransport + 'static) -> ContainerBuilder {
        ContainerBuilder {
            transport: transport.into_dyn(),
            options: ContainerOptions::default(),
            registrations: Vec::new(),
            interceptors: Vec::new(),
            error_handler: None,
            callback: None,
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Concurrency slots of `queue` (a registered name or its url) currently taken, or `None`
    /// if the container does not poll that queue right now.
    ///
    /// Slots are taken by messages between receipt and their terminal state, and reserved by an
    /// outstanding receive for the messages it may return.
    pub fn occupied_slots(&self, queue: &str) -> Option<usize> {
        self.running().as_ref().and_then(|running| {
            running
                .queues
                .iter()
                .find(|q| q.name == queue || q.queue_url == queue)
                .map(|q| q.limiter.in_flight())
        })
    }

    /// Resolves every registered queue and starts polling it.
    ///
    /// Starting a running container does nothing. If a queue cannot be resolved, nothing is
    /// started and the error is returned.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            debug!("Listener container already running");
            return Ok(());
        }

        let mut resolved = Vec::with_capacity(self.registrations.len());
        for registration in &self.registrations {
            let queue_url = self
                .transport
                .resolve_queue_url(registration.queue.trim())
                .await?;
            resolved.push((registration, queue_url));
        }

        let (shutdown, rx) = watch::channel(false);
        let queues: Vec<RunningQueue> = resolved
            .into_iter()
            .map(|(registration, queue_url)| self.spawn_queue(registration, queue_url, rx.clone()))
            .collect();
        info!(queues = queues.len(), "Listener container started");
        *self.running() = Some(Running { shutdown, queues });
        Ok(())
    }

    fn spawn_queue(
        &self,
        registration: &Registration,
        queue_url: String,
        shutdown: watch::Receiver<bool>,
    ) -> RunningQueue {
        let options = self.options.merged(&registration.options);
        let limiter = ConcurrencyLimiter::new(options.max_concurrent_messages);
        let acknowledgements = AcknowledgementProcessor::new(
            self.transport.clone(),
            &queue_url,
            options.acknowledgement_delivery,
            options.acknowledgement_retry,
            self.callback.clone(),
        );
        acknowledgements.start();

        let pipeline = Arc::new(MessagePipeline::new(
            registration.listener.clone(),
            self.interceptors.clone(),
            self.error_handler.clone(),
            options.acknowledgement_mode,
            acknowledgements.clone(),
            self.transport.clone(),
        ));
        let sink = compose_sink(
            &options,
            &queue_url,
            registration.listener.mode(),
            pipeline,
            limiter.clone(),
            self.transport.clone(),
        );
        let poller = Poller::new(
            queue_url.clone(),
            self.transport.clone(),
            sink,
            limiter.clone(),
            &options,
        );

        RunningQueue {
            name: registration.queue.trim().to_owned(),
            queue_url,
            limiter,
            acknowledgements,
            poller: tokio::spawn(poller.run(shutdown)),
            shutdown_timeout: options.listener_shutdown_timeout,
            acknowledgement_shutdown_timeout: options.acknowledgement_shutdown_timeout,
        }
    }

    /// Stops polling and waits up to the shutdown timeout for in-flight messages to finish.
    ///
    /// Messages still running once the timeout elapsed are abandoned without being deleted, so
    /// they are redelivered after their visibility timeout. Stopping a stopped container does
    /// nothing.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(running) = self.running().take() else {
            debug!("Listener container not running");
            return;
        };

        info!("Stopping listener container");
        running.shutdown.send_replace(true);
        join_all(running.queues.into_iter().map(RunningQueue::stop)).await;
        info!("Listener container stopped");
    }
}

impl RunningQueue {
    async fn stop(self) {
        let mut emits = match self.poller.await {
            Ok(emits) => emits,
            Err(e) => {
                warn!(queue = %self.queue_url, error = %e, "Poller task failed");
                Emits::new()
            }
        };

        if !self.limiter.drain(self.shutdown_timeout).await {
            warn!(
                queue = %self.queue_url,
                in_flight = self.limiter.in_flight(),
                timeout = ?self.shutdown_timeout,
                "In-flight messages did not finish in time, abandoning them"
            );
            emits.abort_all();
        }
        while let Some(joined) = emits.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    warn!(queue = %self.queue_url, error = %e, "Emit task failed");
                }
            }
        }

        self.acknowledgements
            .stop(self.acknowledgement_shutdown_timeout)
            .await;
        debug!(queue = %self.queue_url, "Queue stopped");
    }
}

/// Builds the sink chain of one queue: visibility extension over grouping over the base sink.
fn compose_sink(
    options: &ContainerOptions,
    queue_url: &str,
    mode: ListenerMode,
    pipeline: Arc<MessagePipeline>,
    limiter: ConcurrencyLimiter,
    transport: DynTransport,
) -> DynSink {
    let grouped = options.fifo_grouping.applies_to(queue_url);
    let sink = match (mode, grouped) {
        (ListenerMode::Single, false) => FanOutSink::new(pipeline, limiter).into_dyn(),
        (ListenerMode::Single, true) => {
            MessageGroupingSinkAdapter::by_message_group(OrderedSink::new(pipeline)).into_dyn()
        }
        (ListenerMode::Batch, false) => BatchSink::new(pipeline, limiter).into_dyn(),
        (ListenerMode::Batch, true) => {
            MessageGroupingSinkAdapter::by_message_group(BatchSink::new(pipeline, limiter))
                .into_dyn()
        }
    };

    match options.visibility_strategy {
        VisibilityStrategy::None => sink,
        strategy => VisibilityExtendingSinkAdapter::new(
            sink,
            transport,
            strategy,
            options.message_visibility_secs(),
            options.extension_period(),
        )
        .into_dyn(),
    }
}

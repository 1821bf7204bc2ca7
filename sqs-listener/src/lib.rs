//! # SQS Listener
//!
//! A listener container for SQS-style queues. It continuously polls one or more queues, hands
//! every received batch to a [`MessageSink`][sink::MessageSink] that drives each message through a
//! processing pipeline (interceptors, conversion, handler invocation, acknowledgement, error
//! handling), and keeps the number of occupied processing slots per queue bounded.
//!
//! While a handler is running the container can keep extending the message's visibility window
//! so that slow handlers do not cause premature redelivery, and it deletes messages according to
//! the configured [`AcknowledgementMode`].
//!
//! ## Cargo Features
//!
//! * `in_memory`: an in-memory transport with real visibility semantics, used throughout the
//!   tests.
//! * `sqs`: a transport backed by `aws-sdk-sqs`.
//!
//! Both are enabled by default.
//!
//! ## How to Use
//!
//! ```no_run
//! # async {
//! use sqs_listener::{
//!     transport::sqs::{SqsConfig, SqsTransport},
//!     ContainerOptions, ListenerContainer, Message,
//! };
//!
//! let transport = SqsTransport::new(SqsConfig::default()).await;
//!
//! let container = ListenerContainer::builder(transport)
//!     .options(ContainerOptions::builder().max_concurrent_messages(20).build())
//!     .listener("orders", |message: Message<String>| async move {
//!         println!("received {}", message.payload());
//!         Ok::<_, sqs_listener::ListenerError>(())
//!     })
//!     .build()?;
//!
//! container.start().await?;
//! // ...
//! container.stop().await;
//! # anyhow::Ok(())
//! # };
//! ```
//!
//! ## Converters
//!
//! Handlers receive a [`Message<T>`]; the raw payload bytes are turned into `T` by a
//! [`MessageConverter`][converter::MessageConverter]. `String`, `Vec<u8>` and
//! `serde_json::Value` work out of the box. [`converter::Json`] covers types implementing both
//! [`serde::Deserialize`] and [`serde::Serialize`], and any `Fn(&Message) -> Result<T>` closure can
//! be used as a converter.
#![warn(unreachable_pub)]

use std::fmt::Debug;

use thiserror::Error;

pub mod acknowledgement;
pub mod backoff;
pub mod container;
pub mod converter;
pub mod handler;
pub mod interceptor;
pub mod limiter;
pub mod message;
pub mod options;
pub mod pipeline;
pub mod poller;
pub mod sink;
pub mod transport;

#[cfg(all(test, feature = "in_memory"))]
mod test_util;

pub use self::{
    acknowledgement::{Acknowledgement, AcknowledgementMode, AcknowledgementOutcome},
    container::{ContainerBuilder, ListenerContainer},
    message::{Batch, Message, MessageHeaders},
    options::{ContainerOptions, ListenerMode, ListenerOptions},
    pipeline::{MessageOutcome, ProcessingStatus},
    sink::visibility::VisibilityStrategy,
    transport::{DynTransport, QueueTransport},
};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("transport error: {0}")]
    Transport(Box<dyn std::error::Error + Send + Sync>),

    #[error("handler error: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),

    #[error("conversion error: {0}")]
    Conversion(Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid container configuration: {0}")]
    Configuration(String),

    #[error("(de)serialization error")]
    Serde(#[from] serde_json::Error),

    #[error("{failed} of {total} batch entries failed")]
    PartialBatchFailure { failed: usize, total: usize },

    #[error("handler panicked")]
    HandlerPanicked,

    #[error("{0}")]
    Generic(Box<dyn std::error::Error + Send + Sync>),
}

impl ListenerError {
    pub fn transport<E: 'static + std::error::Error + Send + Sync>(e: E) -> Self {
        Self::Transport(Box::new(e))
    }

    pub fn handler<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Self {
        Self::Handler(e.into())
    }

    pub fn conversion<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Self {
        Self::Conversion(e.into())
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub fn generic<E: 'static + std::error::Error + Send + Sync>(e: E) -> Self {
        Self::Generic(Box::new(e))
    }

    /// Whether this error came out of user code, either the handler itself or the conversion of
    /// the payload it was meant to receive.
    pub fn is_handler_failure(&self) -> bool {
        matches!(
            self,
            Self::Handler(_) | Self::Conversion(_) | Self::Serde(_) | Self::HandlerPanicked
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::PartialBatchFailure { .. })
    }
}

pub type Result<T, E = ListenerError> = std::result::Result<T, E>;

//! Container and per-listener configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::{
    acknowledgement::{AcknowledgementDelivery, AcknowledgementMode},
    backoff::{BackoffPolicy, RetryPolicy},
    sink::visibility::VisibilityStrategy,
    transport::{MAX_BATCH_ENTRIES, MAX_VISIBILITY_TIMEOUT_SECS},
    ListenerError, Result,
};

/// The longest long-poll wait a receive call may ask for.
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// How a listener's handler receives messages, decided by how it was registered.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ListenerMode {
    /// One pipeline invocation per message.
    #[default]
    Single,
    /// One pipeline invocation per received batch (or per group of it).
    Batch,
}

/// Whether messages are processed in per-group order.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FifoGrouping {
    /// Group by `MessageGroupId` on queues whose url ends in `.fifo`.
    #[default]
    Auto,
    Always,
    Never,
}

impl FifoGrouping {
    pub fn applies_to(self, queue_url: &str) -> bool {
        match self {
            FifoGrouping::Auto => queue_url.ends_with(".fifo"),
            FifoGrouping::Always => true,
            FifoGrouping::Never => false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerOptions {
    pub max_messages_per_poll: usize,
    pub max_concurrent_messages: usize,
    /// Long-poll wait of each receive call.
    #[serde(with = "duration_secs")]
    pub poll_timeout: Duration,
    /// How long the poller waits for a free concurrency slot before checking for shutdown.
    #[serde(with = "duration_secs")]
    pub max_delay_between_polls: Duration,
    /// Backoff between polls after a receive failed.
    pub poll_backoff: BackoffPolicy,
    /// Grace period granted to in-flight messages on stop.
    #[serde(with = "duration_secs")]
    pub listener_shutdown_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub acknowledgement_shutdown_timeout: Duration,
    pub acknowledgement_mode: AcknowledgementMode,
    pub acknowledgement_delivery: AcknowledgementDelivery,
    pub acknowledgement_retry: RetryPolicy,
    pub visibility_strategy: VisibilityStrategy,
    #[serde(with = "duration_secs")]
    pub message_visibility: Duration,
    /// Fraction of `message_visibility` after which a running message is extended again.
    pub extension_ratio: f64,
    pub fifo_grouping: FifoGrouping,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            max_messages_per_poll: MAX_BATCH_ENTRIES,
            max_concurrent_messages: 10,
            poll_timeout: Duration::from_secs(10),
            max_delay_between_polls: Duration::from_secs(10),
            poll_backoff: BackoffPolicy::default(),
            listener_shutdown_timeout: Duration::from_secs(20),
            acknowledgement_shutdown_timeout: Duration::from_secs(20),
            acknowledgement_mode: AcknowledgementMode::default(),
            acknowledgement_delivery: AcknowledgementDelivery::default(),
            acknowledgement_retry: RetryPolicy::default(),
            visibility_strategy: VisibilityStrategy::default(),
            message_visibility: Duration::from_secs(30),
            extension_ratio: 0.5,
            fifo_grouping: FifoGrouping::default(),
        }
    }
}

impl ContainerOptions {
    pub fn builder() -> ContainerOptionsBuilder {
        ContainerOptionsBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_ENTRIES).contains(&self.max_messages_per_poll) {
            return Err(ListenerError::configuration(format!(
                "max_messages_per_poll must be between 1 and {MAX_BATCH_ENTRIES}, got {}",
                self.max_messages_per_poll
            )));
        }
        if self.max_concurrent_messages == 0 {
            return Err(ListenerError::configuration(
                "max_concurrent_messages must be at least 1",
            ));
        }
        if self.poll_timeout > MAX_POLL_TIMEOUT {
            return Err(ListenerError::configuration(format!(
                "poll_timeout must not exceed {MAX_POLL_TIMEOUT:?}"
            )));
        }
        if self.max_delay_between_polls.is_zero() {
            return Err(ListenerError::configuration(
                "max_delay_between_polls must not be zero",
            ));
        }
        let visibility = self.message_visibility.as_secs();
        if self.message_visibility.subsec_nanos() != 0
            || !(1..=u64::from(MAX_VISIBILITY_TIMEOUT_SECS)).contains(&visibility)
        {
            return Err(ListenerError::configuration(format!(
                "message_visibility must be a whole number of seconds between 1 and \
                 {MAX_VISIBILITY_TIMEOUT_SECS}"
            )));
        }
        if !(0.5..=0.8).contains(&self.extension_ratio) {
            return Err(ListenerError::configuration(format!(
                "extension_ratio must be between 0.5 and 0.8, got {}",
                self.extension_ratio
            )));
        }
        if self.acknowledgement_retry.max_attempts == 0 {
            return Err(ListenerError::configuration(
                "acknowledgement_retry.max_attempts must be at least 1",
            ));
        }
        if let AcknowledgementDelivery::Batched {
            threshold,
            interval,
        } = self.acknowledgement_delivery
        {
            if threshold == 0 || interval.is_zero() {
                return Err(ListenerError::configuration(
                    "batched acknowledgement needs a non-zero threshold and interval",
                ));
            }
        }
        Ok(())
    }

    /// The visibility timeout in whole seconds.
    pub fn message_visibility_secs(&self) -> u32 {
        u32::try_from(self.message_visibility.as_secs()).unwrap_or(MAX_VISIBILITY_TIMEOUT_SECS)
    }

    /// How often running messages have their visibility extended.
    pub fn extension_period(&self) -> Duration {
        self.message_visibility.mul_f64(self.extension_ratio)
    }

    /// These options with the overrides of one listener applied.
    pub fn merged(&self, overrides: &ListenerOptions) -> ContainerOptions {
        let mut merged = self.clone();
        if let Some(mode) = overrides.acknowledgement_mode {
            merged.acknowledgement_mode = mode;
        }
        if let Some(max) = overrides.max_concurrent_messages {
            merged.max_concurrent_messages = max;
        }
        if let Some(strategy) = overrides.visibility_strategy {
            merged.visibility_strategy = strategy;
        }
        if let Some(visibility) = overrides.message_visibility {
            merged.message_visibility = visibility;
        }
        merged
    }
}

#[derive(Default)]
pub struct ContainerOptionsBuilder {
    options: ContainerOptions,
}

impl ContainerOptionsBuilder {
    pub fn max_messages_per_poll(mut self, max: usize) -> Self {
        self.options.max_messages_per_poll = max;
        self
    }

    pub fn max_concurrent_messages(mut self, max: usize) -> Self {
        self.options.max_concurrent_messages = max;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.options.poll_timeout = timeout;
        self
    }

    pub fn max_delay_between_polls(mut self, delay: Duration) -> Self {
        self.options.max_delay_between_polls = delay;
        self
    }

    pub fn poll_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.options.poll_backoff = backoff;
        self
    }

    pub fn listener_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.listener_shutdown_timeout = timeout;
        self
    }

    pub fn acknowledgement_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.acknowledgement_shutdown_timeout = timeout;
        self
    }

    pub fn acknowledgement_mode(mut self, mode: AcknowledgementMode) -> Self {
        self.options.acknowledgement_mode = mode;
        self
    }

    pub fn acknowledgement_delivery(mut self, delivery: AcknowledgementDelivery) -> Self {
        self.options.acknowledgement_delivery = delivery;
        self
    }

    pub fn acknowledgement_retry(mut self, retry: RetryPolicy) -> Self {
        self.options.acknowledgement_retry = retry;
        self
    }

    pub fn visibility_strategy(mut self, strategy: VisibilityStrategy) -> Self {
        self.options.visibility_strategy = strategy;
        self
    }

    pub fn message_visibility(mut self, visibility: Duration) -> Self {
        self.options.message_visibility = visibility;
        self
    }

    pub fn extension_ratio(mut self, ratio: f64) -> Self {
        self.options.extension_ratio = ratio;
        self
    }

    pub fn fifo_grouping(mut self, grouping: FifoGrouping) -> Self {
        self.options.fifo_grouping = grouping;
        self
    }

    pub fn build(self) -> ContainerOptions {
        self.options
    }
}

/// Overrides of [`ContainerOptions`] for a single listener.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenerOptions {
    pub acknowledgement_mode: Option<AcknowledgementMode>,
    pub max_concurrent_messages: Option<usize>,
    pub visibility_strategy: Option<VisibilityStrategy>,
    #[serde(with = "option_duration_secs")]
    pub message_visibility: Option<Duration>,
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acknowledgement_mode(mut self, mode: AcknowledgementMode) -> Self {
        self.acknowledgement_mode = Some(mode);
        self
    }

    pub fn max_concurrent_messages(mut self, max: usize) -> Self {
        self.max_concurrent_messages = Some(max);
        self
    }

    pub fn visibility_strategy(mut self, strategy: VisibilityStrategy) -> Self {
        self.visibility_strategy = Some(strategy);
        self
    }

    pub fn message_visibility(mut self, visibility: Duration) -> Self {
        self.message_visibility = Some(visibility);
        self
    }
}

/// Durations given as whole seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

pub(crate) mod option_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|s| s.map(Duration::from_secs))
    }
}

/// Durations given as milliseconds.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

use std::time::Duration;

use aws_sdk_sqs::{
    types::{
        ChangeMessageVisibilityBatchRequestEntry, DeleteMessageBatchRequestEntry,
        MessageSystemAttributeName,
    },
    Client,
};
use tracing::{trace, warn};

use super::{BatchEntryResult, QueueTransport, VisibilityChange, MAX_BATCH_ENTRIES};
use crate::{message::MessageHeaders, ListenerError, Message, Result};

/// The longest long-poll wait SQS accepts.
const MAX_WAIT_TIME_SECS: u64 = 20;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SqsConfig {
    /// Sends every request to this endpoint instead of the regional AWS one, e.g. a local
    /// ElasticMQ instance.
    pub endpoint_url: Option<String>,
}

#[derive(Clone)]
pub struct SqsTransport {
    client: Client,
}

impl SqsTransport {
    /// Loads the AWS configuration from the environment.
    pub async fn new(cfg: SqsConfig) -> Self {
        let aws_cfg = match &cfg.endpoint_url {
            Some(endpoint) => aws_config::from_env().endpoint_url(endpoint).load().await,
            None => aws_config::load_from_env().await,
        };
        Self::from_client(Client::new(&aws_cfg))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn wrap_message(queue_url: &str, message: &aws_sdk_sqs::types::Message) -> Option<Message> {
        let Some(receipt_handle) = message.receipt_handle() else {
            warn!(id = ?message.message_id(), "Dropping message without receipt handle");
            return None;
        };

        let mut headers = MessageHeaders::new();
        let mut receive_count = 1;
        if let Some(attributes) = message.attributes() {
            for (name, value) in attributes {
                if *name == MessageSystemAttributeName::ApproximateReceiveCount {
                    receive_count = value.parse().unwrap_or(1);
                }
                headers.insert(name.as_str(), value.as_str());
            }
        }
        if let Some(attributes) = message.message_attributes() {
            for (name, value) in attributes {
                if let Some(s) = value.string_value() {
                    headers.insert(name.as_str(), s);
                }
            }
        }

        Some(
            Message::new(
                message.message_id().unwrap_or(receipt_handle),
                message.body().unwrap_or_default().as_bytes().to_owned(),
                receipt_handle,
                queue_url,
            )
            .with_headers(headers)
            .with_receive_count(receive_count),
        )
    }
}

impl QueueTransport for SqsTransport {
    async fn receive(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Message>> {
        let max_messages = max_messages.clamp(1, MAX_BATCH_ENTRIES);
        let wait_time_secs = wait_time.as_secs().min(MAX_WAIT_TIME_SECS);

        let out = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages.try_into().map_err(ListenerError::generic)?)
            .wait_time_seconds(wait_time_secs.try_into().map_err(ListenerError::generic)?)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(ListenerError::transport)?;

        let messages: Vec<Message> = out
            .messages()
            .iter()
            .filter_map(|m| Self::wrap_message(queue_url, m))
            .collect();
        trace!(queue_url, count = messages.len(), "Received messages");
        Ok(messages)
    }

    async fn delete_batch(
        &self,
        queue_url: &str,
        receipt_handles: &[String],
    ) -> Result<Vec<BatchEntryResult>> {
        let entries = receipt_handles
            .iter()
            .enumerate()
            .map(|(i, rh)| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(i.to_string())
                    .receipt_handle(rh)
                    .build()
                    .map_err(ListenerError::generic)
            })
            .collect::<Result<Vec<_>>>()?;

        let out = self
            .client
            .delete_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(ListenerError::transport)?;

        let failed = out
            .failed()
            .iter()
            .map(|f| (f.id(), f.message().unwrap_or(f.code())));
        Ok(batch_results(receipt_handles, failed))
    }

    async fn change_visibility_batch(
        &self,
        queue_url: &str,
        entries: &[VisibilityChange],
    ) -> Result<Vec<BatchEntryResult>> {
        let request = entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                ChangeMessageVisibilityBatchRequestEntry::builder()
                    .id(i.to_string())
                    .receipt_handle(&e.receipt_handle)
                    .visibility_timeout(
                        e.timeout_seconds
                            .try_into()
                            .map_err(ListenerError::generic)?,
                    )
                    .build()
                    .map_err(ListenerError::generic)
            })
            .collect::<Result<Vec<_>>>()?;

        let out = self
            .client
            .change_message_visibility_batch()
            .queue_url(queue_url)
            .set_entries(Some(request))
            .send()
            .await
            .map_err(ListenerError::transport)?;

        let handles: Vec<String> = entries.iter().map(|e| e.receipt_handle.clone()).collect();
        let failed = out
            .failed()
            .iter()
            .map(|f| (f.id(), f.message().unwrap_or(f.code())));
        Ok(batch_results(&handles, failed))
    }

    async fn resolve_queue_url(&self, queue_name: &str) -> Result<String> {
        if queue_name.starts_with("http://") || queue_name.starts_with("https://") {
            return Ok(queue_name.to_owned());
        }

        let out = self
            .client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(ListenerError::transport)?;
        out.queue_url()
            .map(ToOwned::to_owned)
            .ok_or_else(|| ListenerError::configuration(format!("no url for queue {queue_name}")))
    }
}

/// Maps the failed entries of a batch response, identified by their position in the request,
/// back onto the receipt handles that were sent.
fn batch_results<'a>(
    receipt_handles: &[String],
    failed: impl Iterator<Item = (&'a str, &'a str)>,
) -> Vec<BatchEntryResult> {
    let mut results: Vec<BatchEntryResult> =
        receipt_handles.iter().map(BatchEntryResult::ok).collect();
    for (id, reason) in failed {
        match id.parse::<usize>().ok().and_then(|i| results.get_mut(i)) {
            Some(entry) => entry.error = Some(reason.to_owned()),
            None => warn!(id, reason, "Batch response references an unknown entry"),
        }
    }
    results
}

use std::{collections::HashMap, fmt};

use crate::{
    acknowledgement::{Acknowledgement, AcknowledgementOutcome},
    limiter::InFlightPermit,
    transport::Visibility,
    ListenerError, Result,
};

/// Well-known header names.
pub mod headers {
    /// The ordering group of a message received from a FIFO queue.
    pub const MESSAGE_GROUP_ID: &str = "MessageGroupId";
    /// The deduplication id of a message received from a FIFO queue.
    pub const MESSAGE_DEDUPLICATION_ID: &str = "MessageDeduplicationId";
    /// Epoch milliseconds at which the transport accepted the message.
    pub const SENT_TIMESTAMP: &str = "SentTimestamp";
    /// Added by the pipeline: the delivery attempt this invocation corresponds to.
    pub const DELIVERY_ATTEMPT: &str = "x-delivery-attempt";
}

/// String headers attached to a [`Message`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageHeaders(HashMap<String, String>);

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub(crate) fn insert_if_absent(&mut self, key: &str, value: impl Into<String>) {
        self.0
            .entry(key.to_owned())
            .or_insert_with(|| value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MessageHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<HashMap<String, String>> for MessageHeaders {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

/// A message received from a queue.
///
/// Messages are never mutated once received. The `with_*` methods consume the message and
/// return a copy carrying the additional data, which is how the pipeline attaches headers and
/// the [`Acknowledgement`] bound to this delivery.
#[derive(Clone)]
pub struct Message<T = Vec<u8>> {
    id: String,
    payload: T,
    headers: MessageHeaders,
    receipt_handle: String,
    queue_url: String,
    receive_count: u32,
    acknowledgement: Option<Acknowledgement>,
    visibility: Option<Visibility>,
}

impl<T> Message<T> {
    pub fn new(
        id: impl Into<String>,
        payload: T,
        receipt_handle: impl Into<String>,
        queue_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            payload,
            headers: MessageHeaders::default(),
            receipt_handle: receipt_handle.into(),
            queue_url: queue_url.into(),
            receive_count: 1,
            acknowledgement: None,
            visibility: None,
        }
    }

    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_receive_count(mut self, receive_count: u32) -> Self {
        self.receive_count = receive_count;
        self
    }

    pub(crate) fn with_header_if_absent(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert_if_absent(key, value);
        self
    }

    pub(crate) fn with_acknowledgement(mut self, acknowledgement: Acknowledgement) -> Self {
        self.acknowledgement = Some(acknowledgement);
        self
    }

    pub(crate) fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn receipt_handle(&self) -> &str {
        &self.receipt_handle
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// How many times the transport has delivered this message, including this delivery.
    pub fn receive_count(&self) -> u32 {
        self.receive_count
    }

    pub fn group_id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_GROUP_ID)
    }

    /// The acknowledgement bound to this delivery. Present on every message that reached a
    /// handler.
    pub fn acknowledgement(&self) -> Option<&Acknowledgement> {
        self.acknowledgement.as_ref()
    }

    /// Controls how long this delivery stays hidden from other consumers.
    pub fn visibility(&self) -> Option<&Visibility> {
        self.visibility.as_ref()
    }

    /// Deletes this delivery from its queue, see [`Acknowledgement::acknowledge`].
    pub async fn acknowledge(&self) -> Result<AcknowledgementOutcome> {
        match &self.acknowledgement {
            Some(ack) => ack.acknowledge().await,
            None => Err(ListenerError::configuration(
                "message is not bound to an acknowledgement",
            )),
        }
    }

    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        Message {
            id: self.id,
            payload: f(self.payload),
            headers: self.headers,
            receipt_handle: self.receipt_handle,
            queue_url: self.queue_url,
            receive_count: self.receive_count,
            acknowledgement: self.acknowledgement,
            visibility: self.visibility,
        }
    }

    /// Copies the envelope of this message around a new payload.
    pub(crate) fn replace_payload<U>(&self, payload: U) -> Message<U> {
        Message {
            id: self.id.clone(),
            payload,
            headers: self.headers.clone(),
            receipt_handle: self.receipt_handle.clone(),
            queue_url: self.queue_url.clone(),
            receive_count: self.receive_count,
            acknowledgement: self.acknowledgement.clone(),
            visibility: self.visibility.clone(),
        }
    }
}

impl Message {
    pub fn borrow_payload(&self) -> &[u8] {
        &self.payload
    }
}

impl<T> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("queue_url", &self.queue_url)
            .field("receive_count", &self.receive_count)
            .finish_non_exhaustive()
    }
}

/// An ordered collection of messages received together.
///
/// A batch produced by the poller also carries one concurrency slot per message, which the sink
/// consumes instead of acquiring new ones.
#[derive(Debug, Default)]
pub struct Batch {
    messages: Vec<Message>,
    permits: Vec<InFlightPermit>,
}

impl Batch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            permits: Vec::new(),
        }
    }

    pub(crate) fn with_permits(messages: Vec<Message>, mut permits: Vec<InFlightPermit>) -> Self {
        // Surplus slots go straight back to the limiter.
        permits.truncate(messages.len());
        Self { messages, permits }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_ids(&self) -> Vec<&str> {
        self.messages.iter().map(Message::id).collect()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub(crate) fn into_parts(self) -> (Vec<Message>, Vec<InFlightPermit>) {
        (self.messages, self.permits)
    }

    /// Splits the batch by `key`, keeping the relative order of messages within each partition.
    /// Partitions are returned in order of first appearance.
    pub(crate) fn partition_by<F>(self, key: F) -> Vec<(String, Batch)>
    where
        F: Fn(&Message) -> String,
    {
        let mut partitions: Vec<(String, Batch)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut permits = self.permits.into_iter();

        for message in self.messages {
            let k = key(&message);
            let slot = *index.entry(k.clone()).or_insert_with(|| {
                partitions.push((k, Batch::default()));
                partitions.len() - 1
            });
            let batch = &mut partitions[slot].1;
            batch.messages.push(message);
            if let Some(permit) = permits.next() {
                batch.permits.push(permit);
            }
        }

        partitions
    }
}

impl From<Vec<Message>> for Batch {
    fn from(messages: Vec<Message>) -> Self {
        Self::new(messages)
    }
}

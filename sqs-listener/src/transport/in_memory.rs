//! An in-process transport with SQS-like visibility semantics.
//!
//! Received messages stay hidden for the queue's visibility timeout and reappear with a new
//! receipt handle unless they are deleted. Every delete and visibility change is recorded so
//! that tests can assert on exactly what the listener asked the transport to do.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use svix_ksuid::{Ksuid, KsuidLike as _};
use thiserror::Error;
use tokio::{
    sync::Notify,
    time::{sleep_until, Instant},
};

use super::{BatchEntryResult, QueueTransport, VisibilityChange};
use crate::{message::MessageHeaders, ListenerError, Message, Result};

const URL_SCHEME: &str = "memory://";

#[derive(Debug, Error)]
pub enum InMemoryTransportError {
    #[error("injected {0} failure")]
    Injected(&'static str),
    #[error("queue does not exist: {0}")]
    NoSuchQueue(String),
}

/// A delete call as seen by the transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedDelete {
    pub queue_url: String,
    pub receipt_handles: Vec<String>,
}

/// A visibility change call as seen by the transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedVisibilityChange {
    pub queue_url: String,
    pub entries: Vec<VisibilityChange>,
    pub at: Instant,
}

#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    default_visibility: Duration,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Vec<StoredMessage>>,
    receive_calls: usize,
    deletes: Vec<RecordedDelete>,
    visibility_changes: Vec<RecordedVisibilityChange>,
    failing_receives: usize,
    failing_deletes: usize,
    failing_visibility_changes: usize,
}

struct StoredMessage {
    id: String,
    body: Vec<u8>,
    headers: MessageHeaders,
    visible_at: Instant,
    receive_count: u32,
    receipt_handle: Option<String>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_default_visibility(Duration::from_secs(30))
    }

    /// Creates a transport whose queues hide received messages for `visibility`.
    pub fn with_default_visibility(visibility: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                default_visibility: visibility,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a queue named `name` and returns its url.
    pub fn create_queue(&self, name: &str) -> String {
        let url = format!("{URL_SCHEME}{name}");
        self.state().queues.entry(url.clone()).or_default();
        url
    }

    pub fn send(&self, queue_url: &str, body: impl Into<Vec<u8>>) -> Result<String> {
        self.send_with_headers(queue_url, body, MessageHeaders::default())
    }

    pub fn send_with_headers(
        &self,
        queue_url: &str,
        body: impl Into<Vec<u8>>,
        headers: MessageHeaders,
    ) -> Result<String> {
        let id = Ksuid::new(None, None).to_string();
        {
            let mut state = self.state();
            let queue = state.queues.get_mut(queue_url).ok_or_else(|| {
                ListenerError::transport(InMemoryTransportError::NoSuchQueue(queue_url.to_owned()))
            })?;
            queue.push(StoredMessage {
                id: id.clone(),
                body: body.into(),
                headers,
                visible_at: Instant::now(),
                receive_count: 0,
                receipt_handle: None,
            });
        }
        self.inner.notify.notify_waiters();
        Ok(id)
    }

    /// Number of messages not yet deleted, visible or not.
    pub fn pending(&self, queue_url: &str) -> usize {
        self.state().queues.get(queue_url).map_or(0, Vec::len)
    }

    pub fn receive_calls(&self) -> usize {
        self.state().receive_calls
    }

    pub fn deletes(&self) -> Vec<RecordedDelete> {
        self.state().deletes.clone()
    }

    /// Every receipt handle passed to a delete call, in call order.
    pub fn deleted_receipt_handles(&self) -> Vec<String> {
        self.state()
            .deletes
            .iter()
            .flat_map(|d| d.receipt_handles.iter().cloned())
            .collect()
    }

    pub fn visibility_changes(&self) -> Vec<RecordedVisibilityChange> {
        self.state().visibility_changes.clone()
    }

    pub fn fail_next_receives(&self, count: usize) {
        self.state().failing_receives = count;
    }

    pub fn fail_next_deletes(&self, count: usize) {
        self.state().failing_deletes = count;
    }

    pub fn fail_next_visibility_changes(&self, count: usize) {
        self.state().failing_visibility_changes = count;
    }

    fn take_visible(&self, queue_url: &str, max_messages: usize) -> Result<Taken> {
        let mut state = self.state();
        let queue = state.queues.get_mut(queue_url).ok_or_else(|| {
            ListenerError::transport(InMemoryTransportError::NoSuchQueue(queue_url.to_owned()))
        })?;

        let now = Instant::now();
        let mut out = Vec::new();
        for stored in queue.iter_mut() {
            if out.len() >= max_messages {
                break;
            }
            if stored.visible_at > now {
                continue;
            }
            stored.receive_count += 1;
            stored.visible_at = now + self.inner.default_visibility;
            let receipt_handle = Ksuid::new(None, None).to_string();
            stored.receipt_handle = Some(receipt_handle.clone());
            out.push(
                Message::new(stored.id.clone(), stored.body.clone(), receipt_handle, queue_url)
                    .with_headers(stored.headers.clone())
                    .with_receive_count(stored.receive_count),
            );
        }

        if !out.is_empty() {
            return Ok(Taken::Messages(out));
        }
        Ok(Taken::Nothing {
            next_visible: queue.iter().map(|m| m.visible_at).min(),
        })
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

enum Taken {
    Messages(Vec<Message>),
    Nothing { next_visible: Option<Instant> },
}

impl QueueTransport for InMemoryTransport {
    async fn receive(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Message>> {
        {
            let mut state = self.state();
            state.receive_calls += 1;
            if state.failing_receives > 0 {
                state.failing_receives -= 1;
                return Err(ListenerError::transport(InMemoryTransportError::Injected(
                    "receive",
                )));
            }
        }

        let deadline = Instant::now() + wait_time;
        loop {
            let notified = self.inner.notify.notified();
            let next_visible = match self.take_visible(queue_url, max_messages)? {
                Taken::Messages(messages) => return Ok(messages),
                Taken::Nothing { next_visible } => next_visible,
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = sleep_until(wake) => {}
            }
        }
    }

    async fn delete_batch(
        &self,
        queue_url: &str,
        receipt_handles: &[String],
    ) -> Result<Vec<BatchEntryResult>> {
        let mut state = self.state();
        state.deletes.push(RecordedDelete {
            queue_url: queue_url.to_owned(),
            receipt_handles: receipt_handles.to_vec(),
        });
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(ListenerError::transport(InMemoryTransportError::Injected(
                "delete",
            )));
        }

        let queue = state.queues.get_mut(queue_url).ok_or_else(|| {
            ListenerError::transport(InMemoryTransportError::NoSuchQueue(queue_url.to_owned()))
        })?;
        Ok(receipt_handles
            .iter()
            .map(|rh| {
                match queue
                    .iter()
                    .position(|m| m.receipt_handle.as_deref() == Some(rh.as_str()))
                {
                    Some(idx) => {
                        queue.remove(idx);
                        BatchEntryResult::ok(rh.clone())
                    }
                    None => BatchEntryResult::failed(rh.clone(), "ReceiptHandleIsInvalid"),
                }
            })
            .collect())
    }

    async fn change_visibility_batch(
        &self,
        queue_url: &str,
        entries: &[VisibilityChange],
    ) -> Result<Vec<BatchEntryResult>> {
        let results = {
            let mut state = self.state();
            state.visibility_changes.push(RecordedVisibilityChange {
                queue_url: queue_url.to_owned(),
                entries: entries.to_vec(),
                at: Instant::now(),
            });
            if state.failing_visibility_changes > 0 {
                state.failing_visibility_changes -= 1;
                return Err(ListenerError::transport(InMemoryTransportError::Injected(
                    "visibility change",
                )));
            }

            let queue = state.queues.get_mut(queue_url).ok_or_else(|| {
                ListenerError::transport(InMemoryTransportError::NoSuchQueue(
                    queue_url.to_owned(),
                ))
            })?;
            let now = Instant::now();
            entries
                .iter()
                .map(|entry| {
                    match queue.iter_mut().find(|m| {
                        m.receipt_handle.as_deref() == Some(entry.receipt_handle.as_str())
                    }) {
                        Some(stored) => {
                            stored.visible_at =
                                now + Duration::from_secs(entry.timeout_seconds.into());
                            BatchEntryResult::ok(entry.receipt_handle.clone())
                        }
                        None => BatchEntryResult::failed(
                            entry.receipt_handle.clone(),
                            "ReceiptHandleIsInvalid",
                        ),
                    }
                })
                .collect()
        };
        self.inner.notify.notify_waiters();
        Ok(results)
    }

    async fn resolve_queue_url(&self, queue_name: &str) -> Result<String> {
        let url = if queue_name.starts_with(URL_SCHEME) {
            queue_name.to_owned()
        } else {
            format!("{URL_SCHEME}{queue_name}")
        };
        if self.state().queues.contains_key(&url) {
            Ok(url)
        } else {
            Err(ListenerError::transport(
                InMemoryTransportError::NoSuchQueue(queue_name.to_owned()),
            ))
        }
    }
}

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use futures_util::future::join_all;
use tracing::trace;

use super::MessageSink;
use crate::{
    message::Batch,
    pipeline::{MessageOutcome, ProcessingContext},
    Message,
};

/// The group of messages that carry no group id.
pub const DEFAULT_GROUP: &str = "default";

type GroupKey = Arc<dyn Fn(&Message) -> String + Send + Sync>;
type GroupLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Splits batches into groups and emits every group to the delegate on its own.
///
/// Different groups run concurrently. Emits of the same group, whether from one batch or from
/// batches of consecutive polls, are serialized in arrival order.
pub struct MessageGroupingSinkAdapter<S> {
    delegate: S,
    key: GroupKey,
    groups: GroupLocks,
}

impl<S: MessageSink> MessageGroupingSinkAdapter<S> {
    pub fn new(delegate: S, key: impl Fn(&Message) -> String + Send + Sync + 'static) -> Self {
        Self {
            delegate,
            key: Arc::new(key),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Groups by the `MessageGroupId` of FIFO queues.
    pub fn by_message_group(delegate: S) -> Self {
        Self::new(delegate, |message| {
            message.group_id().unwrap_or(DEFAULT_GROUP).to_owned()
        })
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, key: String) -> GroupSlot<'_> {
        let lock = self.groups().entry(key.clone()).or_default().clone();
        GroupSlot {
            groups: &self.groups,
            key,
            lock,
        }
    }

    async fn emit_group(
        &self,
        key: String,
        batch: Batch,
        context: ProcessingContext,
    ) -> Vec<MessageOutcome> {
        let slot = self.slot(key);
        let _guard = slot.lock.clone().lock_owned().await;
        trace!(group = %slot.key, messages = batch.len(), "Emitting group");
        self.delegate.emit(batch, context).await
    }
}

/// Keeps a group's lock registered while an emit of that group waits for or holds it.
struct GroupSlot<'a> {
    groups: &'a GroupLocks,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for GroupSlot<'_> {
    fn drop(&mut self) {
        let mut groups = self
            .groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The map and this slot are the only holders left.
        let idle = groups
            .get(&self.key)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2);
        if idle {
            groups.remove(&self.key);
        }
    }
}

impl<S: MessageSink> MessageSink for MessageGroupingSinkAdapter<S> {
    async fn emit(&self, batch: Batch, context: ProcessingContext) -> Vec<MessageOutcome> {
        if batch.is_empty() {
            return Vec::new();
        }

        let order: Vec<String> = batch
            .messages()
            .iter()
            .map(|m| m.receipt_handle().to_owned())
            .collect();
        let partitions = batch.partition_by(|m| (self.key)(m));
        trace!(groups = partitions.len(), "Partitioned batch");

        let emits = partitions
            .into_iter()
            .map(|(key, partition)| self.emit_group(key, partition, context.clone()));
        let mut by_handle: HashMap<String, MessageOutcome> = join_all(emits)
            .await
            .into_iter()
            .flatten()
            .map(|outcome| (outcome.receipt_handle.clone(), outcome))
            .collect();

        order
            .iter()
            .filter_map(|receipt_handle| by_handle.remove(receipt_handle))
            .collect()
    }
}

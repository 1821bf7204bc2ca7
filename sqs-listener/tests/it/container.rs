use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use sqs_listener::{
    transport::in_memory::InMemoryTransport, ContainerOptions, ListenerContainer, ListenerError,
    Message, VisibilityStrategy,
};

use crate::eventually;

#[derive(Clone, Default)]
struct Seen(Arc<Mutex<Vec<String>>>);

impl Seen {
    fn push(&self, value: impl Into<String>) {
        self.0.lock().unwrap().push(value.into());
    }

    fn get(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

fn queue_with(bodies: &[&str]) -> (InMemoryTransport, String) {
    let transport = InMemoryTransport::new();
    let queue_url = transport.create_queue("orders");
    for body in bodies {
        transport.send(&queue_url, *body).unwrap();
    }
    (transport, queue_url)
}

fn recording_container(
    transport: &InMemoryTransport,
    options: ContainerOptions,
    seen: &Seen,
) -> ListenerContainer {
    let seen = seen.clone();
    ListenerContainer::builder(transport.clone())
        .options(options)
        .listener("orders", move |message: Message<String>| {
            seen.push(message.receipt_handle());
            async { Ok::<_, ListenerError>(()) }
        })
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_batch_is_deleted_once_per_message() {
    let (transport, queue_url) = queue_with(&["a", "b", "c"]);
    let seen = Seen::default();
    let container = recording_container(&transport, ContainerOptions::default(), &seen);

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    let handled: HashSet<String> = seen.get().into_iter().collect();
    let deleted = transport.deleted_receipt_handles();
    assert_eq!(handled.len(), 3);
    assert_eq!(deleted.len(), 3);
    assert_eq!(deleted.into_iter().collect::<HashSet<_>>(), handled);
    assert_eq!(transport.deletes().len(), 3);
    assert!(transport.visibility_changes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_once_on_receive_extends_batch_before_handling() {
    let (transport, queue_url) = queue_with(&["a", "b", "c"]);
    let changes_at_handling = Arc::new(Mutex::new(Vec::new()));
    let container = {
        let transport = transport.clone();
        let changes_at_handling = changes_at_handling.clone();
        ListenerContainer::builder(transport.clone())
            .options(
                ContainerOptions::builder()
                    .visibility_strategy(VisibilityStrategy::OnceOnReceive)
                    .build(),
            )
            .listener("orders", move |_message: Message<String>| {
                let changes = transport.visibility_changes().len();
                changes_at_handling.lock().unwrap().push(changes);
                async { Ok::<_, ListenerError>(()) }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    let changes = transport.visibility_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].entries.len(), 3);
    assert_eq!(*changes_at_handling.lock().unwrap(), vec![1, 1, 1]);

    let extended: HashSet<&str> = changes[0]
        .entries
        .iter()
        .map(|e| e.receipt_handle.as_str())
        .collect();
    let deleted = transport.deleted_receipt_handles();
    assert_eq!(
        deleted.iter().map(String::as_str).collect::<HashSet<_>>(),
        extended
    );
}

#[tokio::test(start_paused = true)]
async fn test_failures_do_not_stop_polling() {
    let (transport, queue_url) = queue_with(&["bad", "good-1"]);
    let container = ListenerContainer::builder(transport.clone())
        .listener("orders", |message: Message<String>| async move {
            if message.payload() == "bad" {
                return Err(ListenerError::handler("rejected"));
            }
            Ok(())
        })
        .build()
        .unwrap();

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 1).await;
    transport.send(&queue_url, "good-2").unwrap();
    eventually(Duration::from_secs(5), || {
        transport.deleted_receipt_handles().len() == 2
    })
    .await;
    container.stop().await;

    assert_eq!(transport.pending(&queue_url), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slots_return_to_baseline() {
    let (transport, queue_url) = queue_with(&[]);
    let options = ContainerOptions::builder()
        .max_concurrent_messages(8)
        .max_messages_per_poll(4)
        .poll_timeout(Duration::from_secs(1))
        .build();
    let container = ListenerContainer::builder(transport.clone())
        .options(options)
        .listener("orders", |message: Message<String>| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if message.payload().starts_with("bad") {
                return Err(ListenerError::handler("rejected"));
            }
            Ok(())
        })
        .build()
        .unwrap();

    container.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    // An idle poller only holds the slots reserved by its outstanding receive.
    assert_eq!(container.occupied_slots("orders"), Some(4));

    for body in ["bad-1", "good-1", "bad-2", "good-2", "good-3", "bad-3"] {
        transport.send(&queue_url, body).unwrap();
    }
    eventually(Duration::from_secs(5), || {
        transport.deleted_receipt_handles().len() == 3
    })
    .await;
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    assert_eq!(container.occupied_slots("orders"), Some(4));
    container.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_running_handlers() {
    let (transport, queue_url) = queue_with(&["slow"]);
    let started = Arc::new(AtomicUsize::new(0));
    let container = {
        let started = started.clone();
        ListenerContainer::builder(transport.clone())
            .listener("orders", move |_message: Message<String>| {
                started.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, ListenerError>(())
                }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(1), || started.load(Ordering::SeqCst) == 1).await;
    container.stop().await;

    assert!(!container.is_running());
    assert_eq!(transport.deleted_receipt_handles().len(), 1);
    assert_eq!(transport.pending(&queue_url), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_abandons_handlers_after_grace_period() {
    let (transport, queue_url) = queue_with(&["stuck"]);
    let started = Arc::new(AtomicUsize::new(0));
    let container = {
        let started = started.clone();
        ListenerContainer::builder(transport.clone())
            .options(
                ContainerOptions::builder()
                    .listener_shutdown_timeout(Duration::from_secs(1))
                    .build(),
            )
            .listener("orders", move |_message: Message<String>| {
                started.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok::<_, ListenerError>(())
                }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(1), || started.load(Ordering::SeqCst) == 1).await;
    let stopped = tokio::time::timeout(Duration::from_secs(5), container.stop()).await;

    assert!(stopped.is_ok());
    assert!(transport.deletes().is_empty());
    assert_eq!(transport.pending(&queue_url), 1);
}

#[tokio::test(start_paused = true)]
async fn test_container_restarts() {
    let (transport, queue_url) = queue_with(&["first"]);
    let seen = Seen::default();
    let container = recording_container(&transport, ContainerOptions::default(), &seen);

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    transport.send(&queue_url, "second").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.pending(&queue_url), 1);

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    assert_eq!(seen.get().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_batch_listener_receives_whole_batches() {
    let (transport, queue_url) = queue_with(&["a", "b", "c", "d"]);
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let container = {
        let sizes = sizes.clone();
        ListenerContainer::builder(transport.clone())
            .batch_listener("orders", move |messages: Vec<Message<String>>| {
                sizes.lock().unwrap().push(messages.len());
                async { Ok::<_, ListenerError>(()) }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    assert_eq!(*sizes.lock().unwrap(), vec![4]);
    assert_eq!(transport.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_many_queues_poll_independently() {
    let transport = InMemoryTransport::new();
    let orders = transport.create_queue("orders");
    let refunds = transport.create_queue("refunds");
    transport.send(&orders, "o").unwrap();
    transport.send(&refunds, "r").unwrap();
    let seen = Seen::default();
    let container = {
        let (orders_seen, refunds_seen) = (seen.clone(), seen.clone());
        ListenerContainer::builder(transport.clone())
            .listener("orders", move |m: Message<String>| {
                orders_seen.push(format!("orders:{}", m.payload()));
                async { Ok::<_, ListenerError>(()) }
            })
            .listener(refunds.clone(), move |m: Message<String>| {
                refunds_seen.push(format!("refunds:{}", m.payload()));
                async { Ok::<_, ListenerError>(()) }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || {
        transport.pending(&orders) + transport.pending(&refunds) == 0
    })
    .await;
    container.stop().await;

    let seen: HashSet<String> = seen.get().into_iter().collect();
    assert_eq!(
        seen,
        HashSet::from(["orders:o".to_owned(), "refunds:r".to_owned()])
    );
}

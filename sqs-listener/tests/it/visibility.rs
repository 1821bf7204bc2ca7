use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use sqs_listener::{
    transport::in_memory::InMemoryTransport, ContainerOptions, ListenerContainer, ListenerError,
    ListenerOptions, Message, VisibilityStrategy,
};
use tokio::time::Instant;

use crate::eventually;

const VISIBILITY: Duration = Duration::from_secs(10);

/// A container whose handler takes 25s, well past the 10s visibility timeout.
fn slow_container(
    transport: &InMemoryTransport,
    strategy: VisibilityStrategy,
    invocations: &Arc<AtomicUsize>,
) -> ListenerContainer {
    let invocations = invocations.clone();
    ListenerContainer::builder(transport.clone())
        .options(
            ContainerOptions::builder()
                .message_visibility(VISIBILITY)
                .max_concurrent_messages(2)
                .listener_shutdown_timeout(Duration::from_secs(60))
                .build(),
        )
        .listener_with_options(
            "reports",
            ListenerOptions::new().visibility_strategy(strategy),
            move |_message: Message<String>| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(25)).await;
                    Ok::<_, ListenerError>(())
                }
            },
        )
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_is_extended_before_expiry() {
    let transport = InMemoryTransport::with_default_visibility(VISIBILITY);
    let queue_url = transport.create_queue("reports");
    transport.send(&queue_url, "quarterly").unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    let container = slow_container(
        &transport,
        VisibilityStrategy::MessagesBeingProcessed,
        &invocations,
    );

    container.start().await.unwrap();
    eventually(Duration::from_secs(1), || invocations.load(Ordering::SeqCst) == 1).await;
    let received_at = Instant::now();
    eventually(Duration::from_secs(40), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    let changes = transport.visibility_changes();
    assert!(!changes.is_empty());
    assert!(changes
        .iter()
        .any(|c| c.at > received_at && c.at < received_at + VISIBILITY));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(transport.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remaining_batch_strategy_keeps_slow_message_hidden() {
    let transport = InMemoryTransport::with_default_visibility(VISIBILITY);
    let queue_url = transport.create_queue("reports");
    transport.send(&queue_url, "quarterly").unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    let container = slow_container(
        &transport,
        VisibilityStrategy::RemainingOriginalBatchMessages,
        &invocations,
    );

    container.start().await.unwrap();
    eventually(Duration::from_secs(40), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    assert!(!transport.visibility_changes().is_empty());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_without_extension_slow_messages_are_redelivered() {
    let transport = InMemoryTransport::with_default_visibility(VISIBILITY);
    let queue_url = transport.create_queue("reports");
    transport.send(&queue_url, "quarterly").unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    let container = slow_container(&transport, VisibilityStrategy::None, &invocations);

    container.start().await.unwrap();
    eventually(Duration::from_secs(15), || invocations.load(Ordering::SeqCst) == 2).await;
    container.stop().await;

    assert!(transport.visibility_changes().is_empty());
}

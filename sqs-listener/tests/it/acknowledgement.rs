use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use sqs_listener::{
    acknowledgement::{AcknowledgementDelivery, AcknowledgementResultCallback},
    transport::in_memory::InMemoryTransport,
    Acknowledgement, AcknowledgementMode, AcknowledgementOutcome, ContainerOptions,
    ListenerContainer, ListenerError, ListenerOptions, Message,
};

use crate::eventually;

fn queue() -> (InMemoryTransport, String) {
    let transport = InMemoryTransport::with_default_visibility(Duration::from_secs(5));
    let queue_url = transport.create_queue("payments");
    (transport, queue_url)
}

async fn reject(_message: Message<String>) -> sqs_listener::Result<()> {
    Err(ListenerError::handler("rejected"))
}

async fn accept(_message: Message<String>) -> sqs_listener::Result<()> {
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_on_success_does_not_delete_failed_messages() {
    let (transport, queue_url) = queue();
    transport.send(&queue_url, "x").unwrap();
    let container = ListenerContainer::builder(transport.clone())
        .listener("payments", reject)
        .build()
        .unwrap();

    container.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(12)).await;
    container.stop().await;

    assert!(transport.deletes().is_empty());
    assert_eq!(transport.pending(&queue_url), 1);
}

#[tokio::test(start_paused = true)]
async fn test_on_success_deletes_exactly_the_handled_delivery() {
    let (transport, queue_url) = queue();
    transport.send(&queue_url, "x").unwrap();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let container = {
        let handled = handled.clone();
        ListenerContainer::builder(transport.clone())
            .listener("payments", move |message: Message<String>| {
                handled
                    .lock()
                    .unwrap()
                    .push(message.receipt_handle().to_owned());
                async { Ok::<_, ListenerError>(()) }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    assert_eq!(transport.deleted_receipt_handles(), *handled.lock().unwrap());
    assert_eq!(transport.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_messages_are_redelivered() {
    let (transport, queue_url) = queue();
    transport.send(&queue_url, "x").unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let container = {
        let attempts = attempts.clone();
        ListenerContainer::builder(transport.clone())
            .listener("payments", move |message: Message<String>| {
                let receive_count = message.receive_count();
                attempts.lock().unwrap().push(receive_count);
                async move {
                    if receive_count < 3 {
                        return Err(ListenerError::handler("not yet"));
                    }
                    Ok(())
                }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(30), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(transport.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_always_deletes_even_when_handler_fails() {
    let (transport, queue_url) = queue();
    transport.send(&queue_url, "x").unwrap();
    let container = ListenerContainer::builder(transport.clone())
        .options(
            ContainerOptions::builder()
                .acknowledgement_mode(AcknowledgementMode::Always)
                .build(),
        )
        .listener("payments", reject)
        .build()
        .unwrap();

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    assert_eq!(transport.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_redrive_leaves_successes_to_the_queue() {
    let (transport, queue_url) = queue();
    transport.send(&queue_url, "x").unwrap();
    let container = ListenerContainer::builder(transport.clone())
        .listener_with_options(
            "payments",
            ListenerOptions::new().acknowledgement_mode(AcknowledgementMode::NoRedrive),
            accept,
        )
        .build()
        .unwrap();

    container.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(12)).await;
    container.stop().await;

    assert!(transport.deletes().is_empty());
    assert_eq!(transport.pending(&queue_url), 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_acknowledgement_is_idempotent() {
    let (transport, queue_url) = queue();
    transport.send(&queue_url, "x").unwrap();
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let container = {
        let outcomes = outcomes.clone();
        ListenerContainer::builder(transport.clone())
            .options(
                ContainerOptions::builder()
                    .acknowledgement_mode(AcknowledgementMode::Manual)
                    .build(),
            )
            .listener("payments", move |message: Message<String>| {
                let outcomes = outcomes.clone();
                async move {
                    let first = message.acknowledge().await?;
                    let second = message.acknowledge().await?;
                    outcomes.lock().unwrap().extend([first, second]);
                    Ok::<_, ListenerError>(())
                }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![
            AcknowledgementOutcome::Deleted,
            AcknowledgementOutcome::AlreadyAcknowledged
        ]
    );
    assert_eq!(transport.deletes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delete_failures_are_retried() {
    let (transport, queue_url) = queue();
    transport.send(&queue_url, "x").unwrap();
    transport.fail_next_deletes(2);
    let container = ListenerContainer::builder(transport.clone())
        .listener("payments", accept)
        .build()
        .unwrap();

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    assert_eq!(transport.deletes().len(), 3);
}

#[derive(Clone, Default)]
struct Recorder {
    succeeded: Arc<Mutex<Vec<String>>>,
    failed: Arc<Mutex<Vec<String>>>,
}

impl AcknowledgementResultCallback for Recorder {
    fn on_success(&self, acknowledged: &[Acknowledgement]) {
        let ids = acknowledged.iter().map(|a| a.message_id().to_owned());
        self.succeeded.lock().unwrap().extend(ids);
    }

    fn on_failure(&self, failed: &[Acknowledgement], _error: &ListenerError) {
        let ids = failed.iter().map(|a| a.message_id().to_owned());
        self.failed.lock().unwrap().extend(ids);
    }
}

#[tokio::test(start_paused = true)]
async fn test_callback_sees_every_acknowledgement_result() {
    let (transport, queue_url) = queue();
    let ok = transport.send(&queue_url, "ok").unwrap();
    let recorder = Recorder::default();
    let container = ListenerContainer::builder(transport.clone())
        .listener("payments", accept)
        .acknowledgement_callback(recorder.clone())
        .build()
        .unwrap();

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;

    transport.fail_next_deletes(3);
    let doomed = transport.send(&queue_url, "doomed").unwrap();
    eventually(Duration::from_secs(5), || !recorder.failed.lock().unwrap().is_empty()).await;
    container.stop().await;

    assert_eq!(*recorder.succeeded.lock().unwrap(), vec![ok]);
    assert_eq!(*recorder.failed.lock().unwrap(), vec![doomed]);
}

#[tokio::test(start_paused = true)]
async fn test_batched_delivery_deletes_together() {
    let (transport, queue_url) = queue();
    for body in ["a", "b", "c"] {
        transport.send(&queue_url, body).unwrap();
    }
    let container = ListenerContainer::builder(transport.clone())
        .options(
            ContainerOptions::builder()
                .acknowledgement_delivery(AcknowledgementDelivery::Batched {
                    threshold: 3,
                    interval: Duration::from_secs(1),
                })
                .build(),
        )
        .listener("payments", accept)
        .build()
        .unwrap();

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    let deletes = transport.deletes();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].receipt_handles.len(), 3);
}

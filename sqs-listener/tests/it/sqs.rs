//! Tests against the ElasticMQ instance of `testing-docker-compose.yaml`.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use aws_sdk_sqs::types::QueueAttributeName;
use sqs_listener::{
    transport::sqs::{SqsConfig, SqsTransport},
    ContainerOptions, ListenerContainer, ListenerError, Message, VisibilityStrategy,
};

use crate::eventually;

const ROOT_URL: &str = "http://localhost:9324";
const DEFAULT_CFG: [(&str, &str); 3] = [
    ("AWS_DEFAULT_REGION", "localhost"),
    ("AWS_ACCESS_KEY_ID", "x"),
    ("AWS_SECRET_ACCESS_KEY", "x"),
];

/// Creates a transport for the local instance and a temporary queue on it, so that tests don't
/// steal each other's messages. Returns the transport and the queue name.
async fn make_test_queue() -> (SqsTransport, String) {
    for (var, val) in &DEFAULT_CFG {
        if std::env::var(var).is_err() {
            std::env::set_var(var, val);
        }
    }

    let transport = SqsTransport::new(SqsConfig {
        endpoint_url: Some(ROOT_URL.to_owned()),
    })
    .await;

    let queue_name: String = std::iter::repeat_with(fastrand::alphanumeric)
        .take(8)
        .collect();
    transport
        .client()
        .create_queue()
        .queue_name(&queue_name)
        .send()
        .await
        .unwrap();

    (transport, queue_name)
}

async fn send(transport: &SqsTransport, queue_url: &str, body: &str) {
    transport
        .client()
        .send_message()
        .queue_url(queue_url)
        .message_body(body)
        .send()
        .await
        .unwrap();
}

async fn queue_is_empty(transport: &SqsTransport, queue_url: &str) -> bool {
    let out = transport
        .client()
        .receive_message()
        .queue_url(queue_url)
        .wait_time_seconds(1)
        .send()
        .await
        .unwrap();
    out.messages().is_empty()
}

#[tokio::test]
#[ignore = "needs ElasticMQ on localhost:9324"]
async fn test_handled_messages_are_deleted() {
    use sqs_listener::QueueTransport as _;

    let (transport, queue_name) = make_test_queue().await;
    let queue_url = transport.resolve_queue_url(&queue_name).await.unwrap();
    for body in ["a", "b", "c"] {
        send(&transport, &queue_url, body).await;
    }

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let container = {
        let seen = seen.clone();
        ListenerContainer::builder(transport.clone())
            .options(
                ContainerOptions::builder()
                    .poll_timeout(Duration::from_secs(1))
                    .visibility_strategy(VisibilityStrategy::OnceOnReceive)
                    .build(),
            )
            .listener(queue_name.clone(), move |message: Message<String>| {
                seen.lock().unwrap().insert(message.payload().clone());
                async { Ok::<_, ListenerError>(()) }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(10), || seen.lock().unwrap().len() == 3).await;
    container.stop().await;

    assert!(queue_is_empty(&transport, &queue_url).await);
}

#[tokio::test]
#[ignore = "needs ElasticMQ on localhost:9324"]
async fn test_failed_messages_stay_on_the_queue() {
    use sqs_listener::QueueTransport as _;

    let (transport, queue_name) = make_test_queue().await;
    let queue_url = transport.resolve_queue_url(&queue_name).await.unwrap();
    send(&transport, &queue_url, "poison").await;

    let attempts = Arc::new(Mutex::new(0));
    let container = {
        let attempts = attempts.clone();
        ListenerContainer::builder(transport.clone())
            .options(
                ContainerOptions::builder()
                    .poll_timeout(Duration::from_secs(1))
                    .build(),
            )
            .listener(queue_name, move |_message: Message<String>| {
                *attempts.lock().unwrap() += 1;
                async { Err::<(), _>(ListenerError::handler("poison")) }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(10), || *attempts.lock().unwrap() == 1).await;
    container.stop().await;

    let out = transport
        .client()
        .get_queue_attributes()
        .queue_url(&queue_url)
        .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
        .send()
        .await
        .unwrap();
    let not_visible = out
        .attributes()
        .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible))
        .map(String::as_str);
    assert_eq!(not_visible, Some("1"));
}

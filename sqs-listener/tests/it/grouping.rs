use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use sqs_listener::{
    message::headers, transport::in_memory::InMemoryTransport, ListenerContainer, ListenerError,
    Message, MessageHeaders,
};

use crate::eventually;

fn fifo_queue(messages: &[(&str, &str)]) -> (InMemoryTransport, String) {
    let transport = InMemoryTransport::with_default_visibility(Duration::from_secs(5));
    let queue_url = transport.create_queue("ledger.fifo");
    for (body, group) in messages {
        let headers: MessageHeaders = [(headers::MESSAGE_GROUP_ID, *group)].into_iter().collect();
        transport
            .send_with_headers(&queue_url, *body, headers)
            .unwrap();
    }
    (transport, queue_url)
}

fn in_group<'a>(seen: &'a [String], group: &str) -> Vec<&'a str> {
    seen.iter()
        .filter(|s| s.starts_with(group))
        .map(String::as_str)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_groups_are_handled_in_receive_order() {
    let (transport, queue_url) =
        fifo_queue(&[("A1", "A"), ("A2", "A"), ("B1", "B"), ("A3", "A"), ("B2", "B")]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let container = {
        let seen = seen.clone();
        ListenerContainer::builder(transport.clone())
            .listener("ledger.fifo", move |message: Message<String>| {
                let seen = seen.clone();
                async move {
                    // Later messages finish quicker, so only ordering can keep them in line.
                    let delay = match message.payload().as_str() {
                        "A1" | "B1" => 30,
                        "A2" => 20,
                        _ => 10,
                    };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    seen.lock().unwrap().push(message.payload().clone());
                    Ok::<_, ListenerError>(())
                }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(5), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(in_group(&seen, "A"), vec!["A1", "A2", "A3"]);
    assert_eq!(in_group(&seen, "B"), vec!["B1", "B2"]);
}

#[tokio::test(start_paused = true)]
async fn test_failure_holds_back_the_rest_of_its_group() {
    let (transport, queue_url) = fifo_queue(&[("A1", "A"), ("A2", "A"), ("B1", "B")]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let container = {
        let seen = seen.clone();
        ListenerContainer::builder(transport.clone())
            .listener("ledger.fifo", move |message: Message<String>| {
                let attempt = format!("{}#{}", message.payload(), message.receive_count());
                seen.lock().unwrap().push(attempt.clone());
                async move {
                    if attempt == "A1#1" {
                        return Err(ListenerError::handler("try again"));
                    }
                    Ok(())
                }
            })
            .build()
            .unwrap()
    };

    container.start().await.unwrap();
    eventually(Duration::from_secs(20), || transport.pending(&queue_url) == 0).await;
    container.stop().await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(in_group(&seen, "A"), vec!["A1#1", "A1#2", "A2#2"]);
    assert_eq!(in_group(&seen, "B"), vec!["B1#1"]);
}

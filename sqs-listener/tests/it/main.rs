use std::time::Duration;

#[cfg(feature = "in_memory")]
mod acknowledgement;
#[cfg(feature = "in_memory")]
mod container;
#[cfg(feature = "in_memory")]
mod grouping;
#[cfg(feature = "sqs")]
mod sqs;
#[cfg(feature = "in_memory")]
mod visibility;

/// Polls `condition` every 10ms until it holds, failing the test after `timeout`.
async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}

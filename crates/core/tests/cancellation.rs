mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Body, RecordingStatus, Script, ScriptedConnector, pattern};
use tgrelay_core::{
    Error, ProgressReporter, PullSource, ReadRetry, RetryPolicy, SessionRegistry, SessionState,
    TransferAdapter, TransferRequest,
};

fn connector() -> Arc<ScriptedConnector> {
    Arc::new(ScriptedConnector::new().script("direct", Script::Serve(Body::new(8000).chunk(1000))))
}

#[tokio::test]
async fn cancelling_one_identity_leaves_the_other_running() {
    let registry = SessionRegistry::new();
    let alice = registry.begin("alice").unwrap();
    let bob = registry.begin("bob").unwrap();

    let connector = connector();
    let mut a = TransferAdapter::new(
        connector.clone(),
        RetryPolicy::direct(),
        TransferRequest::new("http://files.test/a", "a", 1 << 20),
        alice.cancel_flag().clone(),
    );
    let mut b = TransferAdapter::new(
        connector.clone(),
        RetryPolicy::direct(),
        TransferRequest::new("http://files.test/b", "b", 1 << 20),
        bob.cancel_flag().clone(),
    );

    assert_eq!(a.read(1000).await.unwrap().len(), 1000);
    assert_eq!(b.read(1000).await.unwrap().len(), 1000);

    assert!(registry.cancel("alice"));
    assert!(matches!(a.read(1000).await, Err(Error::Cancelled)));

    let mut rest = Vec::new();
    loop {
        let chunk = b.read(4096).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        rest.extend_from_slice(&chunk);
    }
    assert_eq!(rest, pattern(1000, 7000));

    alice.finish::<()>(&Err(Error::Cancelled));
    bob.finish(&Ok(()));
    assert_eq!(
        registry.status("alice").last_outcome,
        Some(SessionState::Cancelled)
    );
    assert_eq!(
        registry.status("bob").last_outcome,
        Some(SessionState::Completed)
    );
}

#[tokio::test]
async fn cancel_for_an_idle_identity_is_a_no_op() {
    let registry = SessionRegistry::new();
    assert!(!registry.cancel("nobody"));

    let guard = registry.begin("carol").unwrap();
    guard.finish(&Ok(()));
    assert!(!registry.cancel("carol"));

    // A finished transfer's flag does not leak into the next one.
    let next = registry.begin("carol").unwrap();
    assert!(!next.cancel_flag().is_cancelled());
}

#[tokio::test]
async fn cancel_is_observed_before_the_open() {
    let registry = SessionRegistry::new();
    let guard = registry.begin("dave").unwrap();
    let connector = connector();
    let mut a = TransferAdapter::new(
        connector.clone(),
        RetryPolicy::direct(),
        TransferRequest::new("http://files.test/a", "a", 1 << 20),
        guard.cancel_flag().clone(),
    );

    registry.cancel("dave");
    assert!(matches!(a.open().await, Err(Error::Cancelled)));
    assert_eq!(connector.opened(), 0);
}

#[tokio::test]
async fn cancel_interrupts_read_backoff() {
    let registry = SessionRegistry::new();
    let guard = registry.begin("erin").unwrap();
    let connector = Arc::new(ScriptedConnector::new().script(
        "direct",
        Script::Serve(Body::new(4000).chunk(1000).stall_at(1000, 3)),
    ));
    let mut a = TransferAdapter::new(
        connector,
        RetryPolicy::direct(),
        TransferRequest::new("http://files.test/a", "a", 1 << 20)
            .with_probe_bytes(1000)
            .with_read_timeout(Duration::from_millis(20))
            .with_read_retry(ReadRetry::new(3, Duration::from_secs(10))),
        guard.cancel_flag().clone(),
    );
    assert_eq!(a.read(1000).await.unwrap().len(), 1000);

    let started = Instant::now();
    let (read, ()) = tokio::join!(a.read(1000), async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.cancel("erin");
    });
    assert!(matches!(read, Err(Error::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn reporter_checkpoint_observes_the_flag() {
    let registry = SessionRegistry::new();
    let guard = registry.begin("frank").unwrap();
    let status = Arc::new(RecordingStatus::default());
    let mut reporter = ProgressReporter::new("a.mp4", status.clone(), guard.cancel_flag().clone())
        .with_interval(Duration::ZERO);

    reporter.checkpoint(10, Some(100)).await.unwrap();
    registry.cancel("frank");
    assert!(matches!(
        reporter.checkpoint(20, Some(100)).await,
        Err(Error::Cancelled)
    ));
    assert_eq!(status.shown().len(), 1);

    drop(guard);
    assert_eq!(
        registry.status("frank").last_outcome,
        Some(SessionState::Cancelled)
    );
}

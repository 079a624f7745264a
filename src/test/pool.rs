use std::time::Duration;

use crate::{
    cmap::{options::ConnectionPoolOptions, ConnectionEstablisher, ConnectionPool},
    error::{Error, ErrorKind},
    event::cmap::CmapEventEmitter,
    options::ServerAddress,
    runtime::Deadline,
    sdam::TopologyUpdater,
};

use super::util::{standalone_hello, MockCluster};

const A: &str = "a:27017";

/// Builds a ready pool over the mock cluster, with a background task draining (and
/// acknowledging) SDAM updates the pool sends.
fn ready_pool(cluster: &MockCluster, options: ConnectionPoolOptions) -> ConnectionPool {
    let client_options = cluster.client_options(&[A]);
    let establisher = ConnectionEstablisher::from_client_options(&client_options).unwrap();

    let (updater, mut receiver) = TopologyUpdater::channel();
    crate::runtime::spawn(async move {
        while let Some(message) = receiver.recv().await {
            message.acknowledge(false);
        }
    });

    let mut options = options;
    options.ready = Some(true);

    ConnectionPool::new(
        ServerAddress::parse(A).unwrap(),
        establisher,
        updater,
        CmapEventEmitter::new(vec![]),
        Some(options),
    )
}

#[tokio::test]
async fn wait_queue_timeout_on_exhausted_pool() {
    let cluster = MockCluster::new();
    cluster.add_server(A, standalone_hello());
    let pool = ready_pool(
        &cluster,
        ConnectionPoolOptions {
            max_pool_size: Some(1),
            ..Default::default()
        },
    );

    let first = pool
        .check_out(Deadline::expires_in(Duration::from_secs(5)))
        .await
        .unwrap();

    // The pool is at max size, so a second check-out with a short deadline times out.
    let second = pool
        .check_out(Deadline::expires_in(Duration::from_millis(100)))
        .await;
    let error = second.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::WaitQueueTimeout { .. }));

    // The invariants held throughout: one connection total, checked out.
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.checked_out_count(), 1);

    // After the first connection is returned, a check-out succeeds immediately.
    drop(first);
    let third = pool
        .check_out(Deadline::expires_in(Duration::from_secs(5)))
        .await;
    assert!(third.is_ok());
    assert_eq!(pool.size(), 1);
}

#[tokio::test]
async fn pool_never_exceeds_max_size() {
    let cluster = MockCluster::new();
    cluster.add_server(A, standalone_hello());
    let pool = ready_pool(
        &cluster,
        ConnectionPoolOptions {
            max_pool_size: Some(2),
            ..Default::default()
        },
    );

    let c1 = pool
        .check_out(Deadline::expires_in(Duration::from_secs(5)))
        .await
        .unwrap();
    let c2 = pool
        .check_out(Deadline::expires_in(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(pool.size(), 2);

    for _ in 0..3 {
        let result = pool
            .check_out(Deadline::expires_in(Duration::from_millis(50)))
            .await;
        assert!(result.is_err());
        assert!(pool.size() <= 2);
    }

    drop(c1);
    drop(c2);
    let c3 = pool
        .check_out(Deadline::expires_in(Duration::from_secs(5)))
        .await
        .unwrap();
    drop(c3);
    assert!(pool.size() <= 2);
}

#[tokio::test]
async fn wait_queue_full_rejects_excess_waiters() {
    let cluster = MockCluster::new();
    cluster.add_server(A, standalone_hello());
    let pool = ready_pool(
        &cluster,
        ConnectionPoolOptions {
            max_pool_size: Some(1),
            max_wait_queue_size: Some(1),
            ..Default::default()
        },
    );

    let _held = pool
        .check_out(Deadline::expires_in(Duration::from_secs(5)))
        .await
        .unwrap();

    // One waiter is allowed to queue; it will eventually time out on its own deadline.
    let pool_clone = pool.clone();
    let queued = crate::runtime::spawn(async move {
        pool_clone
            .check_out(Deadline::expires_in(Duration::from_millis(500)))
            .await
    });

    // Give the queued request time to land in the wait queue.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.wait_queue_size(), 1);

    let rejected = pool
        .check_out(Deadline::expires_in(Duration::from_secs(5)))
        .await;
    let error = rejected.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::WaitQueueFull { .. }));

    assert!(queued.await.is_err());
}

#[tokio::test]
async fn stale_connections_are_destroyed_on_check_in() {
    let cluster = MockCluster::new();
    cluster.add_server(A, standalone_hello());
    let pool = ready_pool(
        &cluster,
        ConnectionPoolOptions {
            max_pool_size: Some(2),
            ..Default::default()
        },
    );

    let conn = pool
        .check_out(Deadline::expires_in(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(pool.size(), 1);

    // Clearing the pool increments its generation, making the checked-out connection stale.
    pool.clear(
        Error::from_io(std::io::ErrorKind::ConnectionReset.into()),
        None,
    )
    .await;

    // Check-in (via drop) must destroy the stale connection rather than pooling it.
    drop(conn);
    pool.mark_as_ready().await;

    let mut subscriber = pool.status_subscriber();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = subscriber.status();
        if status.available_connection_count == 0 && status.total_connection_count == 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "stale connection was not destroyed: {:?}",
            status
        );
        let _ = subscriber
            .wait_for_generation_change(Duration::from_millis(100))
            .await;
    }
}

#[tokio::test]
async fn cleared_pool_fails_checkouts_until_ready() {
    let cluster = MockCluster::new();
    cluster.add_server(A, standalone_hello());
    let pool = ready_pool(&cluster, Default::default());

    pool.clear(
        Error::from_io(std::io::ErrorKind::ConnectionReset.into()),
        None,
    )
    .await;

    let result = pool
        .check_out(Deadline::expires_in(Duration::from_secs(1)))
        .await;
    let error = result.unwrap_err();
    assert!(error.is_pool_cleared());

    pool.mark_as_ready().await;
    let result = pool
        .check_out(Deadline::expires_in(Duration::from_secs(5)))
        .await;
    assert!(result.is_ok());
}

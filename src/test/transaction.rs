use bson::doc;

use crate::{
    error::ErrorKind,
    sdam::test_helpers::mongos,
    test::util::{mongos_hello, MockCluster, ScriptedResponse},
    Client,
};

const M1: &str = "m1:27017";
const M2: &str = "m2:27017";

/// A client connected to a scripted two-mongos sharded cluster, with both servers already
/// discovered.
async fn sharded_client(cluster: &MockCluster) -> Client {
    cluster.add_server(M1, mongos_hello());
    cluster.add_server(M2, mongos_hello());
    let options = cluster.client_options(&[M1, M2]);
    let client = Client::with_options(options).unwrap();

    let updater = client.topology().updater();
    updater.update(mongos(M1)).await;
    updater.update(mongos(M2)).await;

    client
}

#[tokio::test]
async fn transaction_state_machine() {
    let cluster = MockCluster::new();
    let client = sharded_client(&cluster).await;
    let mut session = client.start_session(None).await.unwrap();

    // No transaction is active yet.
    let error = session.commit_transaction().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));
    let error = session.abort_transaction().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));

    // Starting a transaction bumps the transaction number.
    session.start_transaction(None).unwrap();
    assert_eq!(session.txn_number(), 1);

    // A transaction cannot be started while one is active.
    let error = session.start_transaction(None).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));

    // Committing an empty transaction runs no command, and repeated commits are idempotent.
    session.commit_transaction().await.unwrap();
    session.commit_transaction().await.unwrap();
    assert!(cluster.requests(M1).is_empty());
    assert!(cluster.requests(M2).is_empty());

    // Aborting after a commit is an error.
    let error = session.abort_transaction().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));

    // A new transaction can be started after a commit, and aborted while starting without
    // running a command.
    session.start_transaction(None).unwrap();
    assert_eq!(session.txn_number(), 2);
    session.abort_transaction().await.unwrap();

    // Aborting twice is an error; so is committing after an abort.
    let error = session.abort_transaction().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));
    let error = session.commit_transaction().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Transaction { .. }));

    client.shutdown().await;
}

#[tokio::test]
async fn first_transaction_statement_pins_and_carries_start_fields() {
    let cluster = MockCluster::new();
    let client = sharded_client(&cluster).await;
    let mut session = client.start_session(None).await.unwrap();

    session.start_transaction(None).unwrap();
    client
        .run_command(
            "test",
            doc! { "insert": "coll", "documents": [ { "x": 1 } ] },
            None,
            Some(&mut session),
        )
        .await
        .unwrap();

    let pinned_address = session.transaction.pinned_mongos.clone().unwrap();

    let requests = cluster.requests(&pinned_address.to_string());
    assert_eq!(requests.len(), 1);
    let insert = &requests[0];
    assert_eq!(insert.get_bool("startTransaction"), Ok(true));
    assert_eq!(insert.get_bool("autocommit"), Ok(false));
    assert_eq!(insert.get_i64("txnNumber"), Ok(1));
    assert!(insert.get_document("lsid").is_ok());

    // The second statement targets the pinned mongos and omits startTransaction.
    client
        .run_command(
            "test",
            doc! { "insert": "coll", "documents": [ { "x": 2 } ] },
            None,
            Some(&mut session),
        )
        .await
        .unwrap();
    let requests = cluster.requests(&pinned_address.to_string());
    assert_eq!(requests.len(), 2);
    assert!(!requests[1].contains_key("startTransaction"));

    session.abort_transaction().await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn commit_retries_on_other_mongos_with_recovery_token() {
    let cluster = MockCluster::new();
    let client = sharded_client(&cluster).await;
    let mut session = client.start_session(None).await.unwrap();

    let recovery_token = doc! { "shardId": "shard0" };

    // The insert lands on whichever mongos selection picks, pinning the session and
    // returning a recovery token.
    for address in [M1, M2] {
        cluster.enqueue(
            address,
            ScriptedResponse::Reply(doc! { "ok": 1, "recoveryToken": recovery_token.clone() }),
        );
    }

    session.start_transaction(None).unwrap();
    client
        .run_command(
            "test",
            doc! { "insert": "coll", "documents": [ { "x": 1 } ] },
            None,
            Some(&mut session),
        )
        .await
        .unwrap();

    let pinned = session.transaction.pinned_mongos.clone().unwrap().to_string();
    let other = if pinned == M1 { M2 } else { M1 };
    assert_eq!(
        session.transaction.recovery_token,
        Some(recovery_token.clone())
    );

    // The pinned mongos drops the connection during commit; the other one accepts it.
    cluster.enqueue(&pinned, ScriptedResponse::NetworkError);
    cluster.enqueue(other, ScriptedResponse::Reply(doc! { "ok": 1 }));

    session.commit_transaction().await.unwrap();

    // The commit was retried on the other mongos with the recovery token attached.
    let retried: Vec<_> = cluster
        .requests(other)
        .into_iter()
        .filter(|request| request.contains_key("commitTransaction"))
        .collect();
    assert_eq!(retried.len(), 1);
    assert_eq!(
        retried[0].get_document("recoveryToken"),
        Ok(&recovery_token)
    );

    // The session remained pinned through the retries.
    assert_eq!(
        session.transaction.pinned_mongos.clone().unwrap().to_string(),
        pinned
    );

    client.shutdown().await;
}

#[tokio::test]
async fn network_error_marks_session_dirty() {
    let cluster = MockCluster::new();
    let client = sharded_client(&cluster).await;
    let mut session = client.start_session(None).await.unwrap();

    cluster.enqueue(M1, ScriptedResponse::NetworkError);
    cluster.enqueue(M2, ScriptedResponse::NetworkError);

    let result = client
        .run_command("test", doc! { "ping": 1 }, None, Some(&mut session))
        .await;
    assert!(result.is_err());
    assert!(session.is_dirty());

    // A dirty session is discarded rather than pooled when it is returned.
    let id = session.id().clone();
    drop(session);
    client.topology().sync_workers().await;
    assert!(!client.inner.session_pool.contains(&id).await);

    client.shutdown().await;
}

#[tokio::test]
async fn session_from_other_client_is_rejected() {
    let cluster = MockCluster::new();
    let client_a = sharded_client(&cluster).await;
    let client_b = sharded_client(&cluster).await;

    let mut session = client_b.start_session(None).await.unwrap();
    let error = client_a
        .run_command("test", doc! { "ping": 1 }, None, Some(&mut session))
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::SessionUsage { .. }));

    client_a.shutdown().await;
    client_b.shutdown().await;
}

#[tokio::test]
async fn cluster_time_gossip_converges_on_max() {
    use bson::Timestamp;

    use crate::client::session::ClusterTime;

    let cluster = MockCluster::new();
    let client = sharded_client(&cluster).await;
    let mut session = client.start_session(None).await.unwrap();

    let older = ClusterTime {
        cluster_time: Timestamp {
            time: 10,
            increment: 1,
        },
        signature: doc! {},
    };
    let newer = ClusterTime {
        cluster_time: Timestamp {
            time: 10,
            increment: 2,
        },
        signature: doc! {},
    };

    session.advance_cluster_time(&newer);
    session.advance_cluster_time(&older);
    assert_eq!(session.cluster_time(), Some(&newer));

    // Idempotent under repeated application.
    session.advance_cluster_time(&newer);
    assert_eq!(session.cluster_time(), Some(&newer));

    client.shutdown().await;
}

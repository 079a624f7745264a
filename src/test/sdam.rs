use std::time::Duration;

use crate::{
    cmap::conn::ConnectionGeneration,
    error::{CommandError, Error, ErrorKind},
    options::ServerAddress,
    runtime::Deadline,
    sdam::{
        test_helpers::{rs_primary, rs_secondary},
        HandshakePhase,
        ServerType,
        Topology,
        TopologyType,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
};

use super::util::{standalone_hello, MockCluster};

const A: &str = "a:27017";
const B: &str = "b:27017";

fn writable() -> SelectionCriteria {
    SelectionCriteria::ReadPreference(ReadPreference::Primary)
}

async fn rs_topology(cluster: &MockCluster) -> Topology {
    cluster.add_server(A, standalone_hello());
    cluster.add_server(B, standalone_hello());
    let options = cluster.client_options(&[A, B]);
    let topology = Topology::new(options).unwrap();

    let updater = topology.updater();
    updater
        .update(rs_primary(A, "rs0", &[A, B], 1, 1))
        .await;
    updater.update(rs_secondary(B, "rs0", &[A, B])).await;
    topology
}

fn server_type(topology: &Topology, address: &str) -> ServerType {
    topology
        .description()
        .get_server_description(&ServerAddress::parse(address).unwrap())
        .map(|sd| sd.server_type)
        .unwrap_or(ServerType::Unknown)
}

#[tokio::test]
async fn primary_step_down_triggers_reselection() {
    let cluster = MockCluster::new();
    let topology = rs_topology(&cluster).await;
    let updater = topology.updater();

    let selected = topology
        .select_server(&writable(), "test", Deadline::expires_in(Duration::from_secs(1)), None)
        .await
        .unwrap();
    assert_eq!(selected.address().to_string(), A);
    drop(selected);

    let generation_before = topology.servers()[&ServerAddress::parse(A).unwrap()]
        .pool
        .generation();

    // The primary steps down to a secondary, and b is elected with a higher election id.
    updater.update(rs_secondary(A, "rs0", &[A, B])).await;
    assert_eq!(
        topology.description().topology_type(),
        TopologyType::ReplicaSetNoPrimary
    );

    updater.update(rs_primary(B, "rs0", &[A, B], 1, 2)).await;
    assert_eq!(
        topology.description().topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );

    let selected = topology
        .select_server(&writable(), "test", Deadline::expires_in(Duration::from_secs(1)), None)
        .await
        .unwrap();
    assert_eq!(selected.address().to_string(), B);

    // A pure SDAM transition does not clear the old primary's pool.
    let generation_after = topology.servers()[&ServerAddress::parse(A).unwrap()]
        .pool
        .generation();
    assert_eq!(
        generation_before.as_normal().unwrap(),
        generation_after.as_normal().unwrap()
    );

    topology.shutdown().await;
}

#[tokio::test]
async fn stale_primary_is_marked_unknown() {
    let cluster = MockCluster::new();
    let topology = rs_topology(&cluster).await;
    let updater = topology.updater();

    // b gets elected with a higher election id.
    updater.update(rs_primary(B, "rs0", &[A, B], 1, 2)).await;
    assert_eq!(server_type(&topology, B), ServerType::RsPrimary);

    // A delayed response from a still claims primacy with the older election id; it loses.
    updater.update(rs_primary(A, "rs0", &[A, B], 1, 1)).await;

    assert_eq!(server_type(&topology, A), ServerType::Unknown);
    assert_eq!(server_type(&topology, B), ServerType::RsPrimary);
    assert_eq!(
        topology.description().topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );

    topology.shutdown().await;
}

#[tokio::test]
async fn not_primary_clears_pool_and_marks_unknown() {
    let cluster = MockCluster::new();
    let topology = rs_topology(&cluster).await;

    let address = ServerAddress::parse(A).unwrap();
    let generation_before = topology.servers()[&address].pool.generation();
    assert_eq!(generation_before.as_normal(), Some(0));

    let error: Error = ErrorKind::Command(CommandError {
        code: 10107,
        code_name: "NotWritablePrimary".to_string(),
        message: "not master".to_string(),
        topology_version: None,
    })
    .into();

    let updated = topology
        .handle_application_error(
            address.clone(),
            error,
            HandshakePhase::AfterCompletion {
                generation: ConnectionGeneration::Normal(0),
                max_wire_version: Some(8),
            },
        )
        .await;
    assert!(updated);

    assert_eq!(server_type(&topology, A), ServerType::Unknown);
    let generation_after = topology.servers()[&address].pool.generation();
    assert_eq!(generation_after.as_normal(), Some(1));

    topology.shutdown().await;
}

#[tokio::test]
async fn stale_application_errors_are_ignored() {
    let cluster = MockCluster::new();
    let topology = rs_topology(&cluster).await;

    let address = ServerAddress::parse(A).unwrap();
    let error = Error::from_io(std::io::ErrorKind::ConnectionReset.into());

    // An error from a connection of a previous generation must not re-clear the pool.
    topology.servers()[&address]
        .pool
        .clear(error.clone(), None)
        .await;
    let generation = topology.servers()[&address].pool.generation();
    assert_eq!(generation.as_normal(), Some(1));

    let updated = topology
        .handle_application_error(
            address.clone(),
            error,
            HandshakePhase::AfterCompletion {
                generation: ConnectionGeneration::Normal(0),
                max_wire_version: Some(17),
            },
        )
        .await;
    assert!(!updated);
    let generation = topology.servers()[&address].pool.generation();
    assert_eq!(generation.as_normal(), Some(1));

    topology.shutdown().await;
}

#[tokio::test]
async fn zero_selection_timeout_fails_after_one_attempt() {
    let cluster = MockCluster::new();
    cluster.add_server(A, standalone_hello());
    let options = cluster.client_options(&[A]);
    let topology = Topology::new(options).unwrap();

    // No server description has arrived, so nothing is selectable and the deadline has
    // already expired.
    let result = topology
        .select_server(&writable(), "test", Deadline::expires_in(Duration::ZERO), None)
        .await;
    let error = result.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::ServerSelection { .. }));

    topology.shutdown().await;
}

#[tokio::test]
async fn load_balanced_topology_selects_without_monitoring() {
    let cluster = MockCluster::new();
    cluster.add_server(A, standalone_hello());
    let mut options = cluster.client_options(&[A]);
    options.load_balanced = Some(true);
    let topology = Topology::new(options).unwrap();

    assert_eq!(topology.description().topology_type(), TopologyType::LoadBalanced);

    // The synthetic load balancer description is selectable immediately, with no monitor
    // traffic.
    let selected = topology
        .select_server(&writable(), "test", Deadline::expires_in(Duration::from_secs(1)), None)
        .await
        .unwrap();
    assert_eq!(selected.address().to_string(), A);
    assert_eq!(server_type(&topology, A), ServerType::LoadBalancer);
    drop(selected);

    topology.shutdown().await;
}

#[tokio::test]
async fn selection_wakes_on_topology_update() {
    let cluster = MockCluster::new();
    cluster.add_server(A, standalone_hello());
    cluster.add_server(B, standalone_hello());
    let options = cluster.client_options(&[A, B]);
    let topology = Topology::new(options).unwrap();
    let updater = topology.updater();

    let topology_updater = updater.clone();
    let publisher = tokio::spawn(async move {
        // Publish the primary shortly after selection starts waiting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        topology_updater
            .update(rs_primary(A, "rs0", &[A, B], 1, 1))
            .await;
    });

    let selected = topology
        .select_server(&writable(), "test", Deadline::expires_in(Duration::from_secs(5)), None)
        .await
        .unwrap();
    assert_eq!(selected.address().to_string(), A);
    drop(selected);

    publisher.await.unwrap();
    topology.shutdown().await;
}

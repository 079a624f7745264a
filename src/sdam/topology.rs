use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use bson::oid::ObjectId;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch,
};

use super::{
    description::{
        server::ServerDescription,
        topology::{TopologyDescription, TopologyType, TransactionSupportStatus},
    },
    monitor::Monitor,
    server::Server,
    server_selection::{self, SelectedServer},
    srv_polling::SrvPollingMonitor,
};
use crate::{
    client::session::ClusterTime,
    cmap::{conn::ConnectionGeneration, ConnectionEstablisher, PoolGeneration},
    error::{Error, ErrorKind, Result},
    event::{
        cmap::CmapEventEmitter,
        sdam::{
            SdamEventEmitter,
            ServerClosedEvent,
            ServerDescriptionChangedEvent,
            ServerOpeningEvent,
            TopologyClosedEvent,
            TopologyDescriptionChangedEvent,
            TopologyOpeningEvent,
        },
    },
    options::{ClientOptions, ServerAddress},
    runtime::{AcknowledgedMessage, Deadline, WorkerHandle, WorkerHandleListener},
    sdam::public::ServerInfo,
    selection_criteria::SelectionCriteria,
};

/// How long selection waits for a topology change before re-applying the selector, when time
/// remains on the deadline.
const DEFAULT_SELECTION_WAIT: Duration = Duration::from_millis(500);

/// A struct providing access to the client's current view of the topology.
/// When this is dropped, monitors will stop performing checks.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: CheckRequester,
    _worker_handle: WorkerHandle,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Topology> {
        TopologyWorker::start(options)
    }

    /// Begin watching for changes in the topology.
    pub(crate) fn watch(&self) -> TopologyWatcher {
        let mut watcher = self.watcher.clone();
        // Mark the latest topology as seen.
        watcher.observe_latest();
        watcher
    }

    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    /// Request that all monitors perform an immediate check of their servers.
    pub(crate) fn request_update(&self) {
        self.check_requester.request()
    }

    /// Handle an error that occurred during an operation, updating the topology and clearing
    /// pools as the SDAM rules require. Returns whether the topology changed as a result.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Gets the latest cluster time seen by any server in the topology.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher
            .peek_latest()
            .description
            .cluster_time()
            .cloned()
    }

    /// Advance the topology's highest seen cluster time.
    pub(crate) fn advance_cluster_time(&self, to: ClusterTime) {
        self.updater.advance_cluster_time(to)
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.watcher.peek_latest().description.logical_session_timeout
    }

    /// Attach the `$readPreference` field to a command when the targeted server requires it.
    pub(crate) fn attach_read_preference(
        &self,
        address: &ServerAddress,
        command: &mut crate::cmap::Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        self.watcher
            .peek_latest()
            .description
            .update_command_with_read_pref(address, command, criteria)
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.watcher
            .peek_latest()
            .description
            .transaction_support_status()
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.watcher.peek_latest().description.topology_type()
    }

    #[cfg(test)]
    pub(crate) fn description(&self) -> TopologyDescription {
        self.watcher.peek_latest().description.clone()
    }

    #[cfg(test)]
    pub(crate) fn servers(&self) -> HashMap<ServerAddress, Arc<Server>> {
        self.watcher.peek_latest().servers.clone()
    }

    /// Warm all of the topology's connection pools up to `min_pool_size`, waiting until they
    /// are filled.
    pub(crate) async fn warm_pools(&self) {
        let pools: Vec<_> = self
            .watcher
            .peek_latest()
            .servers
            .values()
            .map(|server| server.pool.clone())
            .collect();
        let acks: Vec<_> = pools
            .iter()
            .map(|pool| pool.broadcast(BroadcastMessage::FillPool))
            .collect();
        futures_util::future::join_all(
            acks.into_iter().map(|ack| ack.wait_for_acknowledgment()),
        )
        .await;
    }

    /// Shut the topology down: stop monitors, close all servers and their pools, and emit the
    /// topology-closed event. Idempotent.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) async fn sync_workers(&self) {
        let pools: Vec<_> = self
            .watcher
            .peek_latest()
            .servers
            .values()
            .map(|server| server.pool.clone())
            .collect();
        let acks: Vec<_> = pools
            .iter()
            .map(|pool| pool.broadcast(BroadcastMessage::SyncWorkers))
            .collect();
        futures_util::future::join_all(
            acks.into_iter().map(|ack| ack.wait_for_acknowledgment()),
        )
        .await;
    }

    /// Select a server matching `criteria` from the current topology, waiting for topology
    /// updates until `deadline` if no suitable server is known yet.
    ///
    /// Each iteration re-reads the latest published description, so a returned server was
    /// suitable in a description observed after this call started.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        operation_name: &str,
        deadline: Deadline,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<SelectedServer> {
        let start_time = Instant::now();
        let mut watcher = self.watch();
        loop {
            let state = watcher.observe_latest();

            let result = server_selection::attempt_to_select_server(
                criteria,
                &state.description,
                &state.servers,
                deprioritized,
            )?;
            if let Some(server) = result {
                tracing::debug!(
                    operation = operation_name,
                    server = %server.address(),
                    "selected server"
                );
                return Ok(server);
            }

            if deadline.has_expired() {
                return Err(ErrorKind::ServerSelection {
                    message: format!(
                        "{} (waited {:?} for {})",
                        state
                            .description
                            .server_selection_timeout_error_message(criteria),
                        start_time.elapsed(),
                        operation_name,
                    ),
                }
                .into());
            }

            // No suitable server: ask the monitors for fresh information and wait for the
            // topology to change, re-checking periodically in case of a deadline shorter than
            // the heartbeat interval.
            self.request_update();
            let wait = deadline.min_remaining(DEFAULT_SELECTION_WAIT);
            watcher.wait_for_update(Some(wait)).await;
        }
    }
}

/// The shared state of a topology: its current description and its live servers. Published as
/// one value so readers always observe a consistent pairing of the two.
#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// Receiving end of the topology's published state. Cloneable; each clone tracks which
/// publication it last observed independently.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    /// Whether the topology worker is still alive.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    /// Borrow the latest state without marking it observed. The borrow holds a lock; do not
    /// hold the returned value across an await point.
    pub(crate) fn peek_latest(&self) -> watch::Ref<'_, TopologyState> {
        self.receiver.borrow()
    }

    /// Clone the latest state, marking it observed.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    pub(crate) fn server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    /// Wait for a new state to be published, or until the timeout elapses. Returns whether a
    /// new state was observed.
    pub(crate) async fn wait_for_update(&mut self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => {
                matches!(
                    tokio::time::timeout(timeout, self.receiver.changed()).await,
                    Ok(Ok(()))
                )
            }
            None => self.receiver.changed().await.is_ok(),
        }
    }
}

/// Handle for sending updates into the topology worker. Updates are processed serially in the
/// order they are sent, and each returns whether it changed the topology.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    #[cfg(test)]
    pub(crate) fn channel() -> (TopologyUpdater, UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>)
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        (TopologyUpdater { sender }, receiver)
    }

    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    /// Update the topology using the provided server description, returning whether the
    /// topology changed as a result.
    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd))).await
    }

    /// Handle an error that occurred in a monitor's check of the given server.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    /// Replace the topology's set of hosts, adding and removing servers as needed.
    pub(crate) async fn sync_hosts(&self, hosts: Vec<ServerAddress>) -> bool {
        self.send_message(UpdateMessage::SyncHosts(hosts)).await
    }

    pub(crate) fn advance_cluster_time(&self, to: ClusterTime) {
        let (message, _) = AcknowledgedMessage::package(UpdateMessage::AdvanceClusterTime(to));
        let _ = self.sender.send(message);
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Broadcast(BroadcastMessage::Shutdown))
            .await;
    }
}

/// Handle used to wake all monitors for an immediate check.
#[derive(Debug, Clone)]
pub(crate) struct CheckRequester {
    sender: Arc<watch::Sender<()>>,
}

impl CheckRequester {
    fn new() -> CheckRequester {
        let (sender, _) = watch::channel(());
        CheckRequester {
            sender: Arc::new(sender),
        }
    }

    pub(crate) fn request(&self) {
        let _ = self.sender.send(());
    }

    pub(crate) fn subscribe(&self) -> CheckRequestReceiver {
        CheckRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiver for immediate-check requests, one per monitor.
#[derive(Debug)]
pub(crate) struct CheckRequestReceiver {
    receiver: watch::Receiver<()>,
}

impl CheckRequestReceiver {
    /// Mark any outstanding check requests as handled.
    pub(crate) fn clear_check_requests(&mut self) {
        self.receiver.borrow_and_update();
    }

    /// Wait until a check is requested or the timeout elapses. Returns whether a check was
    /// requested.
    pub(crate) async fn wait_for_check_request(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }
}

/// The messages a [`TopologyUpdater`] can process. Each is acknowledged with whether it
/// changed the topology.
#[derive(Debug)]
pub(crate) enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    SyncHosts(Vec<ServerAddress>),
    AdvanceClusterTime(ClusterTime),
    Broadcast(BroadcastMessage),
}

/// Lifecycle messages fanned out from the topology to its pools.
#[derive(Debug, Clone)]
pub(crate) enum BroadcastMessage {
    Shutdown,
    FillPool,
    #[cfg(test)]
    SyncWorkers,
}

/// The phase a connection handshake had reached when an error occurred, used to discard stale
/// application errors and to scope pool clears.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// The error occurred before the hello was completed; only the pool generation at the time
    /// the establishment started is known.
    PreHello { generation: PoolGeneration },

    /// The error occurred after the hello completed but before establishment finished (e.g.
    /// during authentication).
    PostHello { generation: ConnectionGeneration },

    /// The error occurred on an established connection.
    AfterCompletion {
        generation: ConnectionGeneration,
        max_wire_version: Option<i32>,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(connection: &crate::cmap::PooledConnection) -> Self {
        Self::AfterCompletion {
            generation: connection.generation,
            max_wire_version: connection
                .stream_description
                .as_ref()
                .and_then(|sd| sd.max_wire_version),
        }
    }

    /// The wire version of the server as reported by the handshake, if it completed.
    fn wire_version(&self) -> Option<i32> {
        match self {
            Self::AfterCompletion {
                max_wire_version, ..
            } => *max_wire_version,
            _ => None,
        }
    }

    fn service_id(&self) -> Option<ObjectId> {
        match self {
            Self::PreHello { .. } => None,
            Self::PostHello { generation } | Self::AfterCompletion { generation, .. } => {
                generation.service_id()
            }
        }
    }

    /// Whether the error occurred before the handshake completed.
    fn is_before_completion(&self) -> bool {
        !matches!(self, Self::AfterCompletion { .. })
    }

    /// Whether an error that occurred in this phase is stale relative to the pool's current
    /// generation and can be ignored.
    fn is_stale(&self, pool_generation: &PoolGeneration) -> bool {
        match self {
            Self::PreHello { generation } => match (generation, pool_generation) {
                (PoolGeneration::Normal(hgen), PoolGeneration::Normal(pgen)) => hgen < pgen,
                // Pre-hello handshake errors are ignored in load-balanced mode.
                (PoolGeneration::LoadBalanced(_), PoolGeneration::LoadBalanced(_)) => true,
                _ => true,
            },
            Self::PostHello { generation } | Self::AfterCompletion { generation, .. } => {
                generation.is_stale(pool_generation)
            }
        }
    }
}

/// The worker task that owns the canonical topology state. All mutations flow through its
/// update channel and are applied one at a time; the resulting immutable state is published
/// through a watch channel.
struct TopologyWorker {
    id: ObjectId,
    update_receiver: UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
    publisher: watch::Sender<TopologyState>,
    options: ClientOptions,

    /// The owned canonical copy of the state. Mutated in place, then published as a clone.
    description: TopologyDescription,
    servers: HashMap<ServerAddress, Arc<Server>>,

    event_emitter: SdamEventEmitter,
    cmap_event_emitter: CmapEventEmitter,
    establisher: ConnectionEstablisher,
    check_requester: CheckRequester,
    handle_listener: WorkerHandleListener,

    /// Handles cloned into monitors and pools so they can feed updates back in.
    updater: TopologyUpdater,
    watcher: TopologyWatcher,
}

impl TopologyWorker {
    fn start(options: ClientOptions) -> Result<Topology> {
        let establisher = ConnectionEstablisher::from_client_options(&options)?;

        let mut description = TopologyDescription::default();
        description.initialize(&options);

        let id = ObjectId::new();
        let event_emitter = SdamEventEmitter::new(options.sdam_event_handlers.clone());
        let cmap_event_emitter = CmapEventEmitter::new(options.cmap_event_handlers.clone());

        event_emitter.emit_event(|| {
            TopologyOpeningEvent { topology_id: id }.into()
        });

        let (update_sender, update_receiver) = mpsc::unbounded_channel();
        let updater = TopologyUpdater {
            sender: update_sender,
        };
        let check_requester = CheckRequester::new();
        let (handle, handle_listener) = WorkerHandleListener::channel();

        let initial_state = TopologyState {
            description: TopologyDescription::default(),
            servers: HashMap::new(),
        };
        let (publisher, state_receiver) = watch::channel(initial_state);
        let watcher = TopologyWatcher {
            receiver: state_receiver,
        };

        let mut worker = TopologyWorker {
            id,
            update_receiver,
            publisher,
            options: options.clone(),
            description,
            servers: HashMap::new(),
            event_emitter,
            cmap_event_emitter,
            establisher,
            check_requester: check_requester.clone(),
            handle_listener,
            updater: updater.clone(),
            watcher: watcher.clone(),
        };

        let previous = TopologyDescription::default();
        for address in options.hosts.clone() {
            worker.add_server(address);
        }
        let seeds: Vec<ServerAddress> = worker.servers.keys().cloned().collect();

        if worker.description.topology_type() == TopologyType::LoadBalanced {
            // Load-balanced clients don't have a heartbeat monitor, so we synthesize updating
            // each server to `ServerType::LoadBalancer` with an RTT of 0 so it'll be selected.
            for address in options.hosts.iter() {
                let mut new_desc = ServerDescription::new(address);
                new_desc.server_type = super::ServerType::LoadBalancer;
                new_desc.average_round_trip_time = Some(Duration::from_nanos(0));
                if let Err(e) = worker.description.update(new_desc) {
                    tracing::warn!("failed to initialize load balancer description: {}", e);
                }
            }
        }

        worker.emit_topology_changed_event(&previous);
        worker.publish_state();

        // Monitors are started only after the state containing their server has been
        // published, so a monitor's first liveness check observes its own server.
        for address in seeds {
            worker.start_monitor(address);
        }

        if worker.monitoring_enabled() {
            SrvPollingMonitor::start(
                updater.clone(),
                watcher.clone(),
                worker.options.clone(),
            );
        }

        crate::runtime::spawn(async move { worker.execute().await });

        Ok(Topology {
            watcher,
            updater,
            check_requester,
            _worker_handle: handle,
        })
    }

    async fn execute(mut self) {
        loop {
            tokio::select! {
                biased;

                Some(update) = self.update_receiver.recv() => {
                    let (update, ack) = update.into_parts();
                    let mut shutdown = false;
                    let changed = match update {
                        UpdateMessage::ServerUpdate(sd) => self.update_server(*sd).await,
                        UpdateMessage::SyncHosts(hosts) => {
                            self.sync_hosts(hosts.into_iter().collect())
                        }
                        UpdateMessage::MonitorError { address, error } => {
                            self.handle_monitor_error(address, error).await
                        }
                        UpdateMessage::ApplicationError { address, error, phase } => {
                            self.handle_application_error(address, error, phase).await
                        }
                        UpdateMessage::AdvanceClusterTime(to) => {
                            self.description.advance_cluster_time(&to);
                            self.publish_state();
                            false
                        }
                        UpdateMessage::Broadcast(BroadcastMessage::Shutdown) => {
                            shutdown = true;
                            false
                        }
                        UpdateMessage::Broadcast(_) => false,
                    };
                    ack.acknowledge(changed);
                    if shutdown {
                        break;
                    }
                }
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    break
                }
            }
        }

        // Close all servers and their pools before reporting the topology as closed.
        let addresses: Vec<_> = self.servers.keys().cloned().collect();
        let acks: Vec<_> = self
            .servers
            .values()
            .map(|server| server.pool.broadcast(BroadcastMessage::Shutdown))
            .collect();
        futures_util::future::join_all(
            acks.into_iter().map(|ack| ack.wait_for_acknowledgment()),
        )
        .await;
        self.servers.clear();

        for address in addresses {
            self.event_emitter.emit_event(|| {
                ServerClosedEvent {
                    address,
                    topology_id: self.id,
                }
                .into()
            });
        }
        self.event_emitter.emit_event(|| {
            TopologyClosedEvent {
                topology_id: self.id,
            }
            .into()
        });
    }

    fn monitoring_enabled(&self) -> bool {
        if self.description.topology_type() == TopologyType::LoadBalanced {
            return false;
        }
        #[cfg(test)]
        {
            !self
                .options
                .test_options
                .as_ref()
                .map(|to| to.disable_monitoring_threads)
                .unwrap_or(false)
        }
        #[cfg(not(test))]
        {
            true
        }
    }

    /// Create a `Server` for the given address, adding it to the server map. The server's
    /// monitor is started separately, after the state containing it has been published.
    fn add_server(&mut self, address: ServerAddress) {
        if self.servers.contains_key(&address) {
            return;
        }

        let server = Server::new(
            address.clone(),
            &self.options,
            self.establisher.clone(),
            self.updater.clone(),
            self.cmap_event_emitter.clone(),
        );
        self.servers.insert(address.clone(), server);

        self.event_emitter.emit_event(|| {
            ServerOpeningEvent {
                address,
                topology_id: self.id,
            }
            .into()
        });
    }

    fn start_monitor(&self, address: ServerAddress) {
        if self.monitoring_enabled() {
            Monitor::start(
                address,
                self.updater.clone(),
                self.watcher.clone(),
                self.event_emitter.clone(),
                self.check_requester.subscribe(),
                self.establisher.clone(),
                self.options.clone(),
            );
        }
    }

    /// Bring the live server map in line with the current description, starting servers that
    /// were added and dropping servers that were removed. Returns the added addresses; their
    /// monitors must be started after the new state is published.
    fn sync_server_map(&mut self) -> Vec<ServerAddress> {
        let described: HashSet<ServerAddress> =
            self.description.server_addresses().cloned().collect();

        let removed: Vec<ServerAddress> = self
            .servers
            .keys()
            .filter(|address| !described.contains(address))
            .cloned()
            .collect();
        for address in removed {
            // Dropping the server closes its pool once outstanding operations finish; its
            // monitor exits when it observes the server is gone.
            self.servers.remove(&address);
            self.event_emitter.emit_event(|| {
                ServerClosedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                }
                .into()
            });
        }

        let mut added = Vec::new();
        for address in described {
            if !self.servers.contains_key(&address) {
                self.add_server(address.clone());
                added.push(address);
            }
        }
        added
    }

    fn sync_hosts(&mut self, hosts: HashSet<ServerAddress>) -> bool {
        let previous = self.description.clone();
        self.description.sync_hosts(hosts);
        self.process_description_change(previous)
    }

    /// Apply a new server description to the topology.
    async fn update_server(&mut self, sd: ServerDescription) -> bool {
        let previous = self.description.clone();
        let server_type = sd.server_type;
        let address = sd.address.clone();

        if let Err(e) = self.description.update(sd) {
            // This only happens if we try to access a field from the hello response when an
            // error occurred during the check, which the SDAM algorithm does not do for
            // Unknown servers.
            tracing::warn!("failed to apply server description: {}", e);
            return false;
        }

        let changed = self.process_description_change(previous);

        // A server that came back as data-bearing may resume creating and handing out
        // connections.
        if changed
            && (server_type.is_data_bearing()
                || (server_type != super::ServerType::Unknown
                    && self.description.topology_type() == TopologyType::Single))
        {
            if let Some(server) = self.servers.get(&address) {
                server.pool.mark_as_ready().await;
            }
        }

        changed
    }

    /// Emit the events for a description change, reconcile the server map, and publish the new
    /// state. Returns whether the description changed in a way selection cares about.
    fn process_description_change(&mut self, previous: TopologyDescription) -> bool {
        let added = self.sync_server_map();

        let changed = previous != self.description;
        if changed {
            self.emit_server_changed_events(&previous);
            self.emit_topology_changed_event(&previous);
        }

        // Publish unconditionally so watchers observe auxiliary state (e.g. cluster time)
        // even when the selectable topology did not change.
        self.publish_state();

        for address in added {
            self.start_monitor(address);
        }

        changed
    }

    fn emit_server_changed_events(&self, previous: &TopologyDescription) {
        if !self.event_emitter.has_listeners() {
            return;
        }
        if let Some(diff) = previous.diff(&self.description) {
            for (address, (previous_description, new_description)) in diff.changed_servers {
                let event = ServerDescriptionChangedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                    previous_description: ServerInfo::new_owned(previous_description.clone()),
                    new_description: ServerInfo::new_owned(new_description.clone()),
                };
                self.event_emitter
                    .emit_event(|| Box::new(event).into());
            }
        }
    }

    fn emit_topology_changed_event(&self, previous: &TopologyDescription) {
        self.event_emitter.emit_event(|| {
            Box::new(TopologyDescriptionChangedEvent {
                topology_id: self.id,
                previous_description: previous.clone().into(),
                new_description: self.description.clone().into(),
            })
            .into()
        });
    }

    fn publish_state(&self) {
        let state = TopologyState {
            description: self.description.clone(),
            servers: self.servers.clone(),
        };
        let _ = self.publisher.send(state);
    }

    /// Mark the server as Unknown in response to an error, returning whether the topology
    /// changed.
    async fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address, error);
        self.update_server(description).await
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        match self.servers.get(&address).cloned() {
            Some(server) => {
                let updated = self.mark_server_as_unknown(address, error.clone()).await;
                if updated {
                    // The heartbeat monitor is disabled in load-balanced mode, so this will
                    // never have a service id.
                    server.pool.clear(error, None).await;
                }
                updated
            }
            None => false,
        }
    }

    /// Handle an error that occurred during an operation or handshake against `address`,
    /// applying the SDAM error-handling rules.
    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let server = match self.servers.get(&address).cloned() {
            Some(server) => server,
            None => return false,
        };

        if phase.is_stale(&server.pool.generation()) {
            return false;
        }

        let is_load_balanced =
            self.description.topology_type() == TopologyType::LoadBalanced;

        if error.is_state_change_error() {
            // "not primary" and "node is recovering" mark the server Unknown and prompt an
            // immediate re-scan; the pool is only cleared for shutdown errors or servers that
            // predate modern state-change reporting.
            let updated = is_load_balanced
                || self.mark_server_as_unknown(address, error.clone()).await;

            if updated && error.requires_pool_clear(phase.wire_version()) {
                server.pool.clear(error, phase.service_id()).await;
            }
            self.check_requester.request();

            updated
        } else if error.is_non_timeout_network_error()
            || (phase.is_before_completion()
                && (error.is_auth_error()
                    || error.is_network_timeout()
                    || error.is_command_error()))
        {
            let updated = is_load_balanced
                || self.mark_server_as_unknown(address, error.clone()).await;
            if updated {
                server.pool.clear(error, phase.service_id()).await;
            }
            updated
        } else {
            false
        }
    }
}

//! Contains the events and functionality for monitoring Server Discovery and Monitoring.

use std::{sync::Arc, time::Duration};

use bson::{oid::ObjectId, Document};
use derive_where::derive_where;

use crate::{error::Error, options::ServerAddress, TopologyDescription};

/// A description of the most up-to-date information known about a server, as published to
/// event listeners.
pub type ServerDescription = crate::ServerInfo<'static>;

/// Published when a server description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The server's previous description.
    pub previous_description: ServerDescription,

    /// The server's new description.
    pub new_description: ServerDescription,
}

/// Published when a server is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The ID of the topology.
    pub topology_id: ObjectId,

    /// The topology's previous description.
    pub previous_description: TopologyDescription,

    /// The topology's new description.
    pub new_description: TopologyDescription,
}

/// Published when a topology is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology is closed. Note that this event will not be published until the
/// client associated with the topology is shut down or dropped.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server monitor's `hello` or legacy hello command is started.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the heartbeat is an awaitable (streaming) hello.
    pub awaited: bool,
}

/// Published when a server monitor's `hello` or legacy hello command succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The execution time of the event.
    pub duration: Duration,

    /// The reply to the `hello` or legacy hello command.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the heartbeat was an awaitable (streaming) hello.
    pub awaited: bool,
}

/// Published when a server monitor's `hello` or legacy hello command fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The execution time of the event.
    pub duration: Duration,

    /// The failure that occurred.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the heartbeat was an awaitable (streaming) hello.
    pub awaited: bool,
}

/// The set of events emitted by the SDAM subsystem.
#[derive(Clone, Debug, derive_more::From)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum SdamEvent {
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event sent
/// by the driver. Handlers must not block; emission happens inline on driver tasks.
#[allow(unused_variables)]
pub trait SdamEventHandler: Send + Sync {
    /// Called when a server description changes.
    fn handle_server_description_changed_event(&self, event: ServerDescriptionChangedEvent) {}

    /// Called when a server is initialized.
    fn handle_server_opening_event(&self, event: ServerOpeningEvent) {}

    /// Called when a server is closed.
    fn handle_server_closed_event(&self, event: ServerClosedEvent) {}

    /// Called when the topology description changes.
    fn handle_topology_description_changed_event(&self, event: TopologyDescriptionChangedEvent) {}

    /// Called when the topology is initialized.
    fn handle_topology_opening_event(&self, event: TopologyOpeningEvent) {}

    /// Called when the topology closes.
    fn handle_topology_closed_event(&self, event: TopologyClosedEvent) {}

    /// Called when a server heartbeat begins.
    fn handle_server_heartbeat_started_event(&self, event: ServerHeartbeatStartedEvent) {}

    /// Called when a server heartbeat succeeds.
    fn handle_server_heartbeat_succeeded_event(&self, event: ServerHeartbeatSucceededEvent) {}

    /// Called when a server heartbeat fails.
    fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {}
}

/// Emitter that fans an [`SdamEvent`] out to the frozen list of registered handlers. For a given
/// subject (topology or single server) events are emitted sequentially from the topology worker
/// or that server's monitor, so per-subject ordering is preserved.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct SdamEventEmitter {
    #[derive_where(skip)]
    listeners: Arc<[Arc<dyn SdamEventHandler>]>,
}

impl SdamEventEmitter {
    pub(crate) fn new(listeners: Vec<Arc<dyn SdamEventHandler>>) -> Self {
        Self {
            listeners: listeners.into(),
        }
    }

    pub(crate) fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Emit the event produced by `generate_event` to each registered listener. The closure is
    /// not invoked when nobody is listening.
    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> SdamEvent) {
        if self.listeners.is_empty() {
            return;
        }
        super::deliver(&self.listeners, generate_event(), |listener, event| {
            match event {
                SdamEvent::ServerDescriptionChanged(e) => {
                    listener.handle_server_description_changed_event(*e)
                }
                SdamEvent::ServerOpening(e) => listener.handle_server_opening_event(e),
                SdamEvent::ServerClosed(e) => listener.handle_server_closed_event(e),
                SdamEvent::TopologyDescriptionChanged(e) => {
                    listener.handle_topology_description_changed_event(*e)
                }
                SdamEvent::TopologyOpening(e) => listener.handle_topology_opening_event(e),
                SdamEvent::TopologyClosed(e) => listener.handle_topology_closed_event(e),
                SdamEvent::ServerHeartbeatStarted(e) => {
                    listener.handle_server_heartbeat_started_event(e)
                }
                SdamEvent::ServerHeartbeatSucceeded(e) => {
                    listener.handle_server_heartbeat_succeeded_event(e)
                }
                SdamEvent::ServerHeartbeatFailed(e) => {
                    listener.handle_server_heartbeat_failed_event(e)
                }
            }
        });
    }
}

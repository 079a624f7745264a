//! Contains the events and functionality for monitoring the behavior of the connection pooling
//! of a client.

use std::{sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::{Deserialize, Serialize};

use crate::{cmap::options::ConnectionPoolOptions, error::Error, options::ServerAddress};

/// Event emitted when a connection pool is created.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server that the pool's connections will connect to.
    #[serde(skip)]
    pub address: ServerAddress,

    /// The options used for the pool.
    pub options: Option<ConnectionPoolOptions>,
}

/// Event emitted when a connection pool becomes ready.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct PoolReadyEvent {
    /// The address of the server that the pool's connections will connect to.
    #[serde(skip)]
    pub address: ServerAddress,
}

/// Event emitted when a connection pool is cleared.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server that the pool's connections will connect to.
    #[serde(skip)]
    pub address: ServerAddress,

    /// If the pool is in load-balanced mode, the id of the selected backend that the clear
    /// applies to; `None` clears the whole pool.
    #[serde(rename = "serviceId")]
    pub service_id: Option<bson::oid::ObjectId>,
}

/// Event emitted when a connection pool is closed.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server that the pool's connections will connect to.
    #[serde(skip)]
    pub address: ServerAddress,
}

/// Event emitted when a connection is created.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server that the connection will connect to.
    #[serde(skip)]
    pub address: ServerAddress,

    /// The unique ID of the connection. This is not used for anything internally, but can be
    /// used to identify other events related to this connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is ready to be used. This indicates that all the necessary
/// prerequisites for using a connection (handshake, authentication, etc.) have been completed.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The address of the server that the connection is connected to.
    #[serde(skip)]
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The time it took to establish the connection.
    #[serde(skip)]
    pub duration: Duration,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server that the connection was connected to.
    #[serde(skip)]
    pub address: ServerAddress,

    /// The unique ID of the connection.
    #[serde(default)]
    pub connection_id: u32,

    /// The reason that the connection was closed.
    pub reason: ConnectionClosedReason,
}

/// The reasons that a connection may be closed.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection pool has been cleared since the connection was created.
    Stale,

    /// The connection has been available for longer than `max_idle_time` without being used.
    Idle,

    /// The connection has been established for longer than `max_life_time`.
    Expired,

    /// An error occurred while using the connection.
    Error,

    /// The connection was dropped during read or write.
    Dropped,

    /// The pool that the connection belongs to has been closed.
    PoolClosed,
}

/// Event emitted when a thread begins checking out a connection to use for an operation.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server that the connection will connect to.
    #[serde(skip)]
    pub address: ServerAddress,
}

/// Event emitted when a thread is unable to check out a connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server that the connection would have connected to.
    pub address: ServerAddress,

    /// The reason a connection was unable to be checked out.
    pub reason: ConnectionCheckoutFailedReason,

    /// The error that occurred, if the failure was caused by one.
    pub error: Option<Error>,

    /// The time spent attempting the check out.
    pub duration: Duration,
}

/// The reasons a connection may not be able to be checked out.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The pool was closed before a connection could be checked out.
    PoolClosed,

    /// The wait queue already holds the maximum number of waiters.
    WaitQueueFull,

    /// The deadline elapsed while waiting for a connection to become available.
    Timeout,

    /// An error occurred while trying to establish a connection (e.g. during the handshake or
    /// authentication).
    ConnectionError,
}

/// Event emitted when a connection is successfully checked out.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The time it took to check out the connection.
    pub duration: Duration,
}

/// Event emitted when a connection is checked back into a connection pool.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server that the connection was connected to.
    #[serde(skip)]
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

/// The set of events emitted by a connection pool.
#[derive(Clone, Debug, derive_more::From)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum CmapEvent {
    PoolCreated(PoolCreatedEvent),
    PoolReady(PoolReadyEvent),
    PoolCleared(PoolClearedEvent),
    PoolClosed(PoolClosedEvent),
    ConnectionCreated(ConnectionCreatedEvent),
    ConnectionReady(ConnectionReadyEvent),
    ConnectionClosed(ConnectionClosedEvent),
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}

/// Applications can implement this trait to specify custom logic to run on each CMAP event sent
/// by the driver. Handlers must not block; emission happens inline on driver tasks.
#[allow(unused_variables)]
pub trait CmapEventHandler: Send + Sync {
    /// Called whenever a connection pool is created.
    fn handle_pool_created_event(&self, event: PoolCreatedEvent) {}

    /// Called whenever a connection pool is marked as ready for use.
    ///
    /// Connections may not be created by or checked out from the pool until it has been marked
    /// as ready.
    fn handle_pool_ready_event(&self, event: PoolReadyEvent) {}

    /// Called whenever a connection pool is cleared.
    fn handle_pool_cleared_event(&self, event: PoolClearedEvent) {}

    /// Called whenever a connection pool is closed.
    fn handle_pool_closed_event(&self, event: PoolClosedEvent) {}

    /// Called whenever a connection is created.
    fn handle_connection_created_event(&self, event: ConnectionCreatedEvent) {}

    /// Called whenever a connection is ready to be used.
    fn handle_connection_ready_event(&self, event: ConnectionReadyEvent) {}

    /// Called whenever a connection is closed.
    fn handle_connection_closed_event(&self, event: ConnectionClosedEvent) {}

    /// Called whenever a thread begins checking out a connection to use for an operation.
    fn handle_connection_checkout_started_event(&self, event: ConnectionCheckoutStartedEvent) {}

    /// Called whenever a thread is unable to check out a connection.
    fn handle_connection_checkout_failed_event(&self, event: ConnectionCheckoutFailedEvent) {}

    /// Called whenever a connection is successfully checked out.
    fn handle_connection_checked_out_event(&self, event: ConnectionCheckedOutEvent) {}

    /// Called whenever a connection is checked back into a connection pool.
    fn handle_connection_checked_in_event(&self, event: ConnectionCheckedInEvent) {}
}

/// Emitter that fans a [`CmapEvent`] out to the frozen list of registered handlers.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct CmapEventEmitter {
    #[derive_where(skip)]
    listeners: Arc<[Arc<dyn CmapEventHandler>]>,
}

impl CmapEventEmitter {
    pub(crate) fn new(listeners: Vec<Arc<dyn CmapEventHandler>>) -> Self {
        Self {
            listeners: listeners.into(),
        }
    }

    /// Emit the event produced by `generate_event` to each registered listener. The closure is
    /// not invoked when nobody is listening.
    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> CmapEvent) {
        if self.listeners.is_empty() {
            return;
        }
        super::deliver(&self.listeners, generate_event(), |listener, event| {
            match event {
                CmapEvent::PoolCreated(e) => listener.handle_pool_created_event(e),
                CmapEvent::PoolReady(e) => listener.handle_pool_ready_event(e),
                CmapEvent::PoolCleared(e) => listener.handle_pool_cleared_event(e),
                CmapEvent::PoolClosed(e) => listener.handle_pool_closed_event(e),
                CmapEvent::ConnectionCreated(e) => listener.handle_connection_created_event(e),
                CmapEvent::ConnectionReady(e) => listener.handle_connection_ready_event(e),
                CmapEvent::ConnectionClosed(e) => listener.handle_connection_closed_event(e),
                CmapEvent::ConnectionCheckoutStarted(e) => {
                    listener.handle_connection_checkout_started_event(e)
                }
                CmapEvent::ConnectionCheckoutFailed(e) => {
                    listener.handle_connection_checkout_failed_event(e)
                }
                CmapEvent::ConnectionCheckedOut(e) => {
                    listener.handle_connection_checked_out_event(e)
                }
                CmapEvent::ConnectionCheckedIn(e) => {
                    listener.handle_connection_checked_in_event(e)
                }
            }
        });
    }
}

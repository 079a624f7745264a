//! Per-server connection pooling, modeled on the CMAP specification.
//!
//! The transport layer is pluggable: see [`Connector`] and [`WireChannel`].

pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;
mod status;
mod worker;

use std::time::Instant;

use derive_where::derive_where;

pub use self::{
    conn::{ConnectSettings, Connector, WireChannel},
    establish::Authenticator,
};
pub(crate) use self::{
    conn::{
        next_request_id,
        pooled::PooledConnection,
        Command,
        Connection,
        RawCommandResponse,
        StreamDescription,
    },
    establish::ConnectionEstablisher,
    status::PoolStatusSubscriber,
    worker::PoolGeneration,
};
use self::{
    connection_requester::{ConnectionRequestResult, ConnectionRequester},
    manager::PoolManager,
    options::ConnectionPoolOptions,
    worker::ConnectionPoolWorker,
};
use crate::{
    error::{Error, ErrorKind, Result},
    event::cmap::{
        CmapEvent,
        CmapEventEmitter,
        ConnectionCheckoutFailedEvent,
        ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent,
        PoolCreatedEvent,
    },
    options::ServerAddress,
    runtime::{AcknowledgmentReceiver, Deadline},
    sdam::{BroadcastMessage, TopologyUpdater},
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A pool of established connections to one server.
/// This type is actually a handle to a task that manages the connections and is cheap to clone
/// and pass around.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    connection_requester: ConnectionRequester,
    status_subscriber: PoolStatusSubscriber,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        connection_establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        event_emitter: CmapEventEmitter,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let (manager, connection_requester, status_subscriber) = ConnectionPoolWorker::start(
            address.clone(),
            connection_establisher,
            server_updater,
            event_emitter.clone(),
            options.clone(),
        );

        event_emitter.emit_event(|| {
            CmapEvent::PoolCreated(PoolCreatedEvent {
                address: address.clone(),
                options,
            })
        });

        Self {
            address,
            manager,
            connection_requester,
            status_subscriber,
            event_emitter,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress) -> Self {
        let (manager, _) = manager::channel();
        let handle = crate::runtime::WorkerHandle::new_mocked();
        let (connection_requester, _) = connection_requester::channel(handle);
        let (_, status_subscriber) = status::channel(PoolGeneration::normal());

        Self {
            address,
            manager,
            connection_requester,
            status_subscriber,
            event_emitter: CmapEventEmitter::new(vec![]),
        }
    }

    /// Checks out a connection from the pool. This method will yield until this request reaches
    /// the front of the wait queue and a connection is available or established for it, the
    /// pool is cleared or closed, or `deadline` expires.
    pub(crate) async fn check_out(&self, deadline: Deadline) -> Result<PooledConnection> {
        let time_started = Instant::now();
        self.event_emitter.emit_event(|| {
            ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        let conn = match deadline.await_on(self.request_connection()).await {
            Some(result) => result,
            None => Err(ErrorKind::WaitQueueTimeout {
                address: self.address.clone(),
            }
            .into()),
        };

        match conn {
            Ok(ref conn) => {
                self.event_emitter
                    .emit_event(|| conn.checked_out_event(time_started).into());
            }
            Err(ref err) => {
                let reason = checkout_failed_reason(err);
                self.event_emitter.emit_event(|| {
                    ConnectionCheckoutFailedEvent {
                        address: self.address.clone(),
                        reason,
                        error: Some(err.clone()),
                        duration: Instant::now() - time_started,
                    }
                    .into()
                });
            }
        }

        conn
    }

    async fn request_connection(&self) -> Result<PooledConnection> {
        let response = self.connection_requester.request().await;

        match response {
            Some(ConnectionRequestResult::Pooled(c)) => Ok(*c),
            Some(ConnectionRequestResult::Establishing(task)) => task.await,
            Some(ConnectionRequestResult::PoolCleared(e)) => {
                Err(Error::pool_cleared_error(&self.address, &e))
            }
            Some(ConnectionRequestResult::Rejected(e)) => Err(e),
            Some(ConnectionRequestResult::PoolWarmed) => {
                Err(Error::internal("invalid result from connection requester"))
            }
            None => Err(Error::pool_closed_error(&self.address)),
        }
    }

    /// Increments the generation of the pool, pausing it until it is marked ready again.
    /// Rather than eagerly removing stale connections from the pool, they are left for the
    /// background task to clean up.
    pub(crate) async fn clear(&self, cause: Error, service_id: Option<bson::oid::ObjectId>) {
        self.manager
            .clear(cause, service_id)
            .wait_for_acknowledgment()
            .await;
    }

    /// Mark the pool as "ready", allowing connections to be created and checked out.
    pub(crate) async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().wait_for_acknowledgment().await;
    }

    pub(crate) fn generation(&self) -> PoolGeneration {
        self.status_subscriber.generation()
    }

    /// The total number of connections currently managed by the pool, including checked-out and
    /// pending connections.
    #[allow(dead_code)]
    pub(crate) fn size(&self) -> u32 {
        self.status_subscriber.status().total_connection_count
    }

    /// The number of connections currently checked out of the pool.
    #[allow(dead_code)]
    pub(crate) fn checked_out_count(&self) -> u32 {
        let status = self.status_subscriber.status();
        status
            .total_connection_count
            .saturating_sub(status.available_connection_count)
            .saturating_sub(status.pending_connection_count)
    }

    /// The number of check-out requests currently waiting in the wait queue.
    #[allow(dead_code)]
    pub(crate) fn wait_queue_size(&self) -> u32 {
        self.status_subscriber.status().wait_queue_length
    }

    #[cfg(test)]
    pub(crate) fn status_subscriber(&self) -> PoolStatusSubscriber {
        self.status_subscriber.clone()
    }

    pub(crate) fn broadcast(&self, msg: BroadcastMessage) -> AcknowledgmentReceiver<()> {
        self.manager.broadcast(msg)
    }
}

fn checkout_failed_reason(error: &Error) -> ConnectionCheckoutFailedReason {
    match error.kind.as_ref() {
        ErrorKind::WaitQueueTimeout { .. } => ConnectionCheckoutFailedReason::Timeout,
        ErrorKind::WaitQueueFull { .. } => ConnectionCheckoutFailedReason::WaitQueueFull,
        ErrorKind::ConnectionPoolClosed { .. } => ConnectionCheckoutFailedReason::PoolClosed,
        _ => ConnectionCheckoutFailedReason::ConnectionError,
    }
}

use std::{
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use derive_where::derive_where;

use super::{Connection, ConnectionGeneration, PendingConnection, WireChannel};
use crate::{
    cmap::{manager::PoolManager, PoolGeneration},
    event::cmap::{
        CmapEventEmitter,
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionReadyEvent,
    },
};

/// A wrapper around the [`Connection`] type that represents a connection within a connection
/// pool. This type derefs into [`Connection`], so fields and methods exposed on that type can
/// be called directly from this one.
#[derive_where(Debug)]
pub(crate) struct PooledConnection {
    /// The connection this pooled connection wraps.
    connection: Connection,

    /// The connection pool generation from which this connection was checked out.
    pub(crate) generation: ConnectionGeneration,

    /// Emitter for events related to this connection.
    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,

    /// The state of this connection.
    state: PooledConnectionState,
}

/// The state of a pooled connection.
#[derive(Debug)]
enum PooledConnectionState {
    /// The state associated with a connection checked into the connection pool.
    CheckedIn { available_time: Instant },

    /// The state associated with a connection checked out of the connection pool.
    CheckedOut {
        /// The manager used to check this connection back into the pool.
        pool_manager: PoolManager,
    },
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl PooledConnection {
    /// Creates a new pooled connection in the checked-in state.
    pub(crate) fn new(pending_connection: PendingConnection, channel: Box<dyn WireChannel>) -> Self {
        let connection = Connection::new(
            pending_connection.address,
            channel,
            pending_connection.id,
            pending_connection.time_created,
        );
        let generation = match pending_connection.generation {
            PoolGeneration::Normal(generation) => ConnectionGeneration::Normal(generation),
            PoolGeneration::LoadBalanced(_) => ConnectionGeneration::LoadBalanced {
                service_id: None,
                generation: 0,
            },
        };
        Self {
            connection,
            generation,
            event_emitter: pending_connection.event_emitter,
            state: PooledConnectionState::CheckedIn {
                available_time: Instant::now(),
            },
        }
    }

    /// The service ID for this connection. Only returns a value if this connection is to a load
    /// balancer.
    pub(crate) fn service_id(&self) -> Option<bson::oid::ObjectId> {
        self.connection
            .stream_description
            .as_ref()
            .and_then(|sd| sd.service_id)
    }

    /// Updates the state of the connection to indicate that it is checked into the pool.
    pub(crate) fn mark_checked_in(&mut self) {
        if !matches!(self.state, PooledConnectionState::CheckedIn { .. }) {
            self.state = PooledConnectionState::CheckedIn {
                available_time: Instant::now(),
            };
        }
    }

    /// Updates the state of the connection to indicate that it is checked out of the pool.
    pub(crate) fn mark_checked_out(&mut self, pool_manager: PoolManager) {
        self.state = PooledConnectionState::CheckedOut { pool_manager };
    }

    /// Whether this connection has been sitting available for longer than `max_idle_time`.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        let Some(max_idle_time) = max_idle_time else {
            return false;
        };
        match self.state {
            PooledConnectionState::CheckedIn { available_time } => {
                Instant::now().duration_since(available_time) >= max_idle_time
            }
            _ => false,
        }
    }

    /// Whether this connection has been established for longer than `max_life_time`.
    pub(crate) fn is_expired(&self, max_life_time: Option<Duration>) -> bool {
        let Some(max_life_time) = max_life_time else {
            return false;
        };
        Instant::now().duration_since(self.connection.time_created) >= max_life_time
    }

    /// Close this connection, emitting a [`ConnectionClosedEvent`] with the supplied reason.
    pub(crate) fn close_and_drop(mut self, reason: ConnectionClosedReason) {
        // Mark as checked in so the drop impl doesn't attempt to return it to the pool.
        self.mark_checked_in();
        self.connection.shutdown();
        self.emit_closed_event(reason);
    }

    /// Emit a [`ConnectionClosedEvent`] for this connection with the supplied reason.
    pub(crate) fn emit_closed_event(&self, reason: ConnectionClosedReason) {
        self.event_emitter
            .emit_event(|| self.closed_event(reason).into());
    }

    /// Nullifies the internal state of this connection and returns it in a new
    /// [`PooledConnection`] with the given state.
    fn take(&mut self, new_state: PooledConnectionState) -> Self {
        Self {
            connection: self.connection.take(),
            generation: self.generation,
            event_emitter: self.event_emitter.clone(),
            state: new_state,
        }
    }

    /// Helper to create a [`ConnectionCheckedOutEvent`] for the connection.
    pub(crate) fn checked_out_event(&self, time_started: Instant) -> ConnectionCheckedOutEvent {
        ConnectionCheckedOutEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
            duration: Instant::now() - time_started,
        }
    }

    /// Helper to create a [`ConnectionCheckedInEvent`] for the connection.
    pub(crate) fn checked_in_event(&self) -> ConnectionCheckedInEvent {
        ConnectionCheckedInEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
        }
    }

    /// Helper to create a [`ConnectionReadyEvent`] for the connection.
    pub(crate) fn ready_event(&self) -> ConnectionReadyEvent {
        ConnectionReadyEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
            duration: Instant::now() - self.connection.time_created,
        }
    }

    /// Helper to create a [`ConnectionClosedEvent`] for the connection.
    pub(super) fn closed_event(&self, reason: ConnectionClosedReason) -> ConnectionClosedEvent {
        ConnectionClosedEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
            reason,
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        match &self.state {
            // Nothing needs to be done when a checked-in connection is dropped.
            PooledConnectionState::CheckedIn { .. } => {}
            // A checked-out connection should be sent back to the connection pool.
            PooledConnectionState::CheckedOut { pool_manager } => {
                let pool_manager = pool_manager.clone();
                let dropped_connection = self.take(PooledConnectionState::CheckedIn {
                    available_time: Instant::now(),
                });
                if let Err(mut returned_connection) = pool_manager.check_in(dropped_connection) {
                    // Checking in the connection failed because the pool has closed, so emit an
                    // event and let the connection drop.
                    returned_connection.mark_checked_in();
                    returned_connection.connection.shutdown();
                    returned_connection.emit_closed_event(ConnectionClosedReason::PoolClosed);
                }
            }
        }
    }
}

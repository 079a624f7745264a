use bson::oid::ObjectId;
use tokio::sync::mpsc;

use super::conn::pooled::PooledConnection;
use crate::{
    error::Error,
    runtime::{AcknowledgedMessage, AcknowledgmentReceiver},
    sdam::BroadcastMessage,
};

/// Returns a new `PoolManager`/`ManagementRequestReceiver` pair.
pub(super) fn channel() -> (PoolManager, ManagementRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        PoolManager { sender },
        ManagementRequestReceiver { receiver },
    )
}

/// A handle used to manage the pool's state: checking connections back in, pausing and
/// resuming, and relaying lifecycle broadcasts. Cloned onto every checked-out connection.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    /// Lazily clear the pool, pausing it until it is marked ready again. The returned receiver
    /// resolves once the worker has processed the clear.
    pub(crate) fn clear(
        &self,
        cause: Error,
        service_id: Option<ObjectId>,
    ) -> AcknowledgmentReceiver<()> {
        let (message, acknowledgment_receiver) = AcknowledgedMessage::package(());
        let _ = self.sender.send(PoolManagementRequest::Clear {
            completion_handler: message,
            cause,
            service_id,
        });
        acknowledgment_receiver
    }

    /// Mark the pool as ready, allowing check-outs to resume.
    pub(crate) fn mark_as_ready(&self) -> AcknowledgmentReceiver<()> {
        let (message, acknowledgment_receiver) = AcknowledgedMessage::package(());
        let _ = self.sender.send(PoolManagementRequest::MarkAsReady {
            completion_handler: message,
        });
        acknowledgment_receiver
    }

    /// Check a connection back into the pool. Returns the connection if the pool worker has
    /// already stopped.
    pub(crate) fn check_in(
        &self,
        connection: PooledConnection,
    ) -> std::result::Result<(), PooledConnection> {
        if let Err(request) = self
            .sender
            .send(PoolManagementRequest::CheckIn(Box::new(connection)))
        {
            return Err(*request.0.unwrap_check_in());
        }
        Ok(())
    }

    pub(super) fn handle_connection_succeeded(&self, connection: ConnectionSucceeded) {
        let _ = self
            .sender
            .send(PoolManagementRequest::HandleConnectionSucceeded(connection));
    }

    pub(super) fn handle_connection_failed(&self) {
        let _ = self.sender.send(PoolManagementRequest::HandleConnectionFailed);
    }

    pub(crate) fn broadcast(&self, message: BroadcastMessage) -> AcknowledgmentReceiver<()> {
        let (message, acknowledgment_receiver) = AcknowledgedMessage::package(message);
        let _ = self.sender.send(PoolManagementRequest::Broadcast(message));
        acknowledgment_receiver
    }
}

#[derive(Debug)]
pub(super) struct ManagementRequestReceiver {
    pub(super) receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}

/// The requests a `PoolManager` can issue to its pool worker.
#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    /// Clear the pool, transitioning it to Paused and incrementing its generation.
    Clear {
        completion_handler: AcknowledgedMessage<()>,
        cause: Error,
        service_id: Option<ObjectId>,
    },

    /// Mark the pool as Ready, allowing connections to be created and checked out.
    MarkAsReady {
        completion_handler: AcknowledgedMessage<()>,
    },

    /// Check in the given connection.
    CheckIn(Box<PooledConnection>),

    /// Update the pool based on the given establishment success.
    HandleConnectionSucceeded(ConnectionSucceeded),

    /// Update the pool after an establishment failure.
    HandleConnectionFailed,

    /// Handle a client-wide lifecycle broadcast.
    Broadcast(AcknowledgedMessage<BroadcastMessage>),
}

impl PoolManagementRequest {
    fn unwrap_check_in(self) -> Box<PooledConnection> {
        match self {
            PoolManagementRequest::CheckIn(conn) => conn,
            _ => panic!("tried to unwrap check_in but got {:?}", self),
        }
    }
}

/// The result of a successful connection establishment: either the connection was handed
/// directly to the requesting operation, or it was established in the background to satisfy
/// `min_pool_size` and belongs in the pool.
#[derive(Debug)]
pub(super) enum ConnectionSucceeded {
    ForPool(Box<PooledConnection>),
    Used { service_id: Option<ObjectId> },
}

impl ConnectionSucceeded {
    pub(super) fn service_id(&self) -> Option<ObjectId> {
        match self {
            ConnectionSucceeded::ForPool(conn) => conn.service_id(),
            ConnectionSucceeded::Used { service_id, .. } => *service_id,
        }
    }
}

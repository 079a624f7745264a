use super::PoolGeneration;

/// A snapshot of the observable state of a pool, published by the pool worker whenever the
/// state changes.
#[derive(Clone, Debug)]
pub(crate) struct PoolStatus {
    /// The current generation of the pool.
    pub(crate) generation: PoolGeneration,

    /// The total number of connections managed by the pool, including pending and checked-out
    /// connections.
    pub(crate) total_connection_count: u32,

    /// The number of established connections currently idle in the pool.
    pub(crate) available_connection_count: u32,

    /// The number of connections currently being established.
    pub(crate) pending_connection_count: u32,

    /// The number of check-out requests currently waiting for a connection.
    pub(crate) wait_queue_length: u32,
}

/// Create a channel for publishing and receiving updates to the pool's status.
pub(super) fn channel(generation: PoolGeneration) -> (PoolStatusPublisher, PoolStatusSubscriber) {
    let init = PoolStatus {
        generation,
        total_connection_count: 0,
        available_connection_count: 0,
        pending_connection_count: 0,
        wait_queue_length: 0,
    };
    let (sender, receiver) = tokio::sync::watch::channel(init);
    (
        PoolStatusPublisher { sender },
        PoolStatusSubscriber { receiver },
    )
}

/// Struct used to publish updates to the pool's status.
#[derive(Debug)]
pub(super) struct PoolStatusPublisher {
    sender: tokio::sync::watch::Sender<PoolStatus>,
}

impl PoolStatusPublisher {
    pub(super) fn publish(&self, status: PoolStatus) {
        // If nobody is listening, this returns an error, which we don't mind.
        let _: std::result::Result<_, _> = self.sender.send(status);
    }
}

/// Subscriber used to get the latest status of a pool.
#[derive(Clone, Debug)]
pub(crate) struct PoolStatusSubscriber {
    receiver: tokio::sync::watch::Receiver<PoolStatus>,
}

impl PoolStatusSubscriber {
    /// Get a copy of the pool's latest generation.
    pub(crate) fn generation(&self) -> PoolGeneration {
        self.receiver.borrow().generation.clone()
    }

    pub(crate) fn status(&self) -> PoolStatus {
        self.receiver.borrow().clone()
    }

    #[cfg(test)]
    pub(crate) async fn wait_for_generation_change(
        &mut self,
        timeout: std::time::Duration,
    ) -> Option<PoolGeneration> {
        crate::runtime::timeout(timeout, self.receiver.changed())
            .await
            .ok()
            .and_then(|r| r.ok())
            .map(|_| self.receiver.borrow().generation.clone())
    }
}

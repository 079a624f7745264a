mod acknowledged_message;
pub(crate) mod deadline;
mod join_handle;
pub(crate) mod resolver;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver, AcknowledgmentSender},
    deadline::{Deadline, TimeoutContext},
    join_handle::AsyncJoinHandle,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::{Error, Result};

/// Spawn a task in the background to run a future.
///
/// If the runtime is still running, this will return a handle to the background task.
/// Otherwise, it will panic.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::network_timeout())
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

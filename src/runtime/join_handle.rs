use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Handle to a spawned background task.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> AsyncJoinHandle<T> {
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        #[cfg(test)]
        let handle = tokio::runtime::Handle::try_current()
            .expect("all runtime-using tests should use tokio::test");
        #[cfg(not(test))]
        let handle = tokio::runtime::Handle::current();

        AsyncJoinHandle(handle.spawn(fut))
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Tasks spawned by this crate do not panic or get aborted, so join errors indicate a
        // runtime teardown race and are surfaced as panics rather than recoverable errors.
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.expect("background task unexpectedly failed to join"))
    }
}

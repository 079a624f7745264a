use std::{
    future::Future,
    time::{Duration, Instant},
};

use crate::concern::WriteConcern;

/// A point on the monotonic clock by which a blocking operation must complete, or the absence of
/// one. Every suspension point in this crate (pool check-out, server selection, monitor waits)
/// accepts a `Deadline`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires.
    pub(crate) fn infinite() -> Self {
        Deadline(None)
    }

    /// A deadline `duration` from now. A duration too large to represent is treated as
    /// infinite.
    pub(crate) fn expires_in(duration: Duration) -> Self {
        Deadline(Instant::now().checked_add(duration))
    }

    pub(crate) fn is_infinite(&self) -> bool {
        self.0.is_none()
    }

    pub(crate) fn has_expired(&self) -> bool {
        match self.0 {
            Some(instant) => instant <= Instant::now(),
            None => false,
        }
    }

    /// The time left on this deadline, or `None` if it never expires. An expired deadline
    /// reports a zero remainder rather than a negative one.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.0.map(|instant| instant.saturating_duration_since(Instant::now()))
    }

    /// The earlier of this deadline and `duration` from now.
    pub(crate) fn min_remaining(&self, duration: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(duration),
            None => duration,
        }
    }

    /// Await `future` until this deadline expires. Returns `None` on expiration; an infinite
    /// deadline waits forever.
    pub(crate) async fn await_on<F: Future>(&self, future: F) -> Option<F::Output> {
        match self.remaining() {
            Some(remaining) => tokio::time::timeout(remaining, future).await.ok(),
            None => Some(future.await),
        }
    }
}

/// Tracks an operation-level `timeoutMS` budget across the stages of an operation: server
/// selection, connection check-out, the socket round trip, and the server-side `maxTimeMS`
/// remainder.
#[derive(Clone, Debug)]
pub(crate) struct TimeoutContext {
    deadline: Deadline,
    timeout: Option<Duration>,
}

impl TimeoutContext {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: match timeout {
                Some(timeout) => Deadline::expires_in(timeout),
                None => Deadline::infinite(),
            },
            timeout,
        }
    }

    /// Whether an operation-level timeout is active.
    pub(crate) fn is_set(&self) -> bool {
        self.timeout.is_some()
    }

    pub(crate) fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// The deadline for the server selection stage: the operation deadline, capped by the
    /// configured server selection timeout.
    pub(crate) fn server_selection_deadline(&self, server_selection_timeout: Duration) -> Deadline {
        Deadline::expires_in(self.deadline.min_remaining(server_selection_timeout))
    }

    /// The deadline for the connection check-out stage: the operation deadline, capped by the
    /// configured wait queue timeout when one is set.
    pub(crate) fn checkout_deadline(&self, wait_queue_timeout: Option<Duration>) -> Deadline {
        match (self.deadline.remaining(), wait_queue_timeout) {
            (Some(remaining), Some(wq)) => Deadline::expires_in(remaining.min(wq)),
            (Some(remaining), None) => Deadline::expires_in(remaining),
            (None, Some(wq)) => Deadline::expires_in(wq),
            (None, None) => Deadline::infinite(),
        }
    }

    /// The server-side `maxTimeMS` to attach to the command: whatever remains of the budget
    /// after the client-side stages have consumed their share.
    pub(crate) fn remaining_max_time(&self) -> Option<Duration> {
        self.timeout?;
        self.deadline.remaining()
    }

    /// Applies the double-timeout rule: when an operation-level timeout is active, the write
    /// concern's `wtimeout` is stripped so the server does not race a second timer against
    /// `maxTimeMS`.
    pub(crate) fn resolve_write_concern(&self, write_concern: Option<WriteConcern>) -> Option<WriteConcern> {
        match (self.is_set(), write_concern) {
            (true, Some(mut wc)) => {
                wc.w_timeout = None;
                Some(wc)
            }
            (_, wc) => wc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concern::{Acknowledgment, WriteConcern};

    #[test]
    fn infinite_deadline_never_expires() {
        let deadline = Deadline::infinite();
        assert!(!deadline.has_expired());
        assert!(deadline.remaining().is_none());
        assert_eq!(
            deadline.min_remaining(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn finite_deadline_expires() {
        let deadline = Deadline::expires_in(Duration::from_millis(0));
        assert!(deadline.has_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));

        let deadline = Deadline::expires_in(Duration::from_secs(60));
        assert!(!deadline.has_expired());
        assert!(deadline.remaining().unwrap() <= Duration::from_secs(60));
        assert!(deadline.min_remaining(Duration::from_secs(1)) <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn await_on_times_out() {
        let deadline = Deadline::expires_in(Duration::from_millis(20));
        let result = deadline.await_on(std::future::pending::<()>()).await;
        assert!(result.is_none());

        let deadline = Deadline::infinite();
        let result = deadline.await_on(std::future::ready(42)).await;
        assert_eq!(result, Some(42));
    }

    #[test]
    fn timeout_context_strips_wtimeout() {
        let wc = WriteConcern::builder()
            .w(Acknowledgment::Majority)
            .w_timeout(Duration::from_secs(5))
            .build();

        let without_timeout = TimeoutContext::new(None);
        assert_eq!(
            without_timeout
                .resolve_write_concern(Some(wc.clone()))
                .unwrap()
                .w_timeout,
            Some(Duration::from_secs(5))
        );

        let with_timeout = TimeoutContext::new(Some(Duration::from_secs(30)));
        assert_eq!(
            with_timeout
                .resolve_write_concern(Some(wc))
                .unwrap()
                .w_timeout,
            None
        );
    }

    #[test]
    fn timeout_context_subdivides() {
        let ctx = TimeoutContext::new(Some(Duration::from_secs(10)));
        let selection = ctx.server_selection_deadline(Duration::from_secs(30));
        assert!(selection.remaining().unwrap() <= Duration::from_secs(10));

        let ctx = TimeoutContext::new(None);
        let selection = ctx.server_selection_deadline(Duration::from_secs(30));
        assert!(selection.remaining().unwrap() <= Duration::from_secs(30));
        assert!(ctx.remaining_max_time().is_none());
        assert!(ctx.checkout_deadline(None).is_infinite());
    }
}

use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;

use super::ServerSession;

/// A LIFO pool of server sessions, shared by all of a client's `ClientSession`s. Reusing the
/// most recently returned session keeps the working set of server-side sessions small.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Checks out a server session from the pool. Sessions that are about to expire within one
    /// minute of the deployment's logical session timeout are discarded along the way; if no
    /// usable session remains, a new one is created.
    pub(crate) async fn check_out(
        &self,
        logical_session_timeout: Option<Duration>,
    ) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks in a server session to the pool. If it is about to expire or is dirty, it will
    /// be discarded.
    ///
    /// This method will also clear out any expired sessions from the back of the pool before
    /// checking in.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().await;
        while let Some(pooled_session) = pool.pop_back() {
            if pooled_session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            pool.push_back(pooled_session);
            break;
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: &bson::Document) -> bool {
        self.pool.lock().await.iter().any(|s| &s.id == id)
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.pool.lock().await.len()
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(30 * 60));

    #[tokio::test]
    async fn pool_reuses_lifo() {
        let pool = ServerSessionPool::new();

        let first = pool.check_out(TIMEOUT).await;
        let second = pool.check_out(TIMEOUT).await;
        assert_ne!(first.id, second.id);

        let first_id = first.id.clone();
        let second_id = second.id.clone();
        pool.check_in(first, TIMEOUT).await;
        pool.check_in(second, TIMEOUT).await;

        // The most recently returned session comes back first.
        let reused = pool.check_out(TIMEOUT).await;
        assert_eq!(reused.id, second_id);
        let reused = pool.check_out(TIMEOUT).await;
        assert_eq!(reused.id, first_id);
    }

    #[tokio::test]
    async fn dirty_sessions_are_discarded() {
        let pool = ServerSessionPool::new();

        let mut session = pool.check_out(TIMEOUT).await;
        session.dirty = true;
        let id = session.id.clone();
        pool.check_in(session, TIMEOUT).await;

        assert!(!pool.contains(&id).await);
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn expiring_sessions_are_discarded() {
        let pool = ServerSessionPool::new();

        let mut session = pool.check_out(TIMEOUT).await;
        // Backdate the session so it sits within one minute of its expiration.
        session.last_use = Instant::now() - Duration::from_secs(30 * 60 - 30);
        let id = session.id.clone();
        pool.check_in(session, TIMEOUT).await;

        assert!(!pool.contains(&id).await);

        // With no known timeout, sessions never count as expiring.
        let mut session = pool.check_out(TIMEOUT).await;
        session.last_use = Instant::now() - Duration::from_secs(60 * 60);
        let id = session.id.clone();
        pool.check_in(session, None).await;
        assert!(pool.contains(&id).await);
    }
}

use std::time::Duration;

use serde::Deserialize;

use crate::options::ClientOptions;

/// Contains the options for creating a connection pool.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionPoolOptions {
    /// The amount of time a connection can remain idle in a connection pool before being closed.
    /// A value of zero indicates that connections should not be closed due to being idle.
    #[serde(rename = "maxIdleTimeMS", default)]
    #[serde(deserialize_with = "crate::options::deserialize_duration_option_from_u64_millis")]
    pub max_idle_time: Option<Duration>,

    /// The amount of time a connection may remain established before being closed, regardless
    /// of use. Unset means connections are not closed due to age.
    #[serde(rename = "maxLifeTimeMS", default)]
    #[serde(deserialize_with = "crate::options::deserialize_duration_option_from_u64_millis")]
    pub max_life_time: Option<Duration>,

    /// The maximum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    pub min_pool_size: Option<u32>,

    /// The maximum number of new connections that can be created concurrently.
    pub max_connecting: Option<u32>,

    /// The maximum number of check-out requests that may be queued waiting for a connection.
    /// Requests beyond this bound fail immediately with a wait-queue-full error. Unset means
    /// the wait queue is unbounded.
    pub max_wait_queue_size: Option<u32>,

    /// The default time to wait in the wait queue before a check-out fails.
    #[serde(rename = "waitQueueTimeoutMS", default)]
    #[serde(deserialize_with = "crate::options::deserialize_duration_option_from_u64_millis")]
    pub wait_queue_timeout: Option<Duration>,

    /// Whether the pool is in load-balanced mode.
    pub load_balanced: Option<bool>,

    #[cfg(test)]
    #[serde(skip)]
    pub(crate) ready: Option<bool>,

    #[cfg(test)]
    #[serde(skip)]
    pub(crate) background_thread_interval: Option<BackgroundThreadInterval>,
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BackgroundThreadInterval {
    Never,
    Every(Duration),
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_idle_time: options.max_idle_time,
            max_life_time: options.max_life_time,
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_connecting: options.max_connecting,
            max_wait_queue_size: options.max_wait_queue_size,
            wait_queue_timeout: options.wait_queue_timeout,
            load_balanced: options.load_balanced,
            #[cfg(test)]
            ready: None,
            #[cfg(test)]
            background_thread_interval: None,
        }
    }
}

pub(crate) mod executor;
pub(crate) mod options;
pub(crate) mod session;

use std::sync::Arc;

use derive_where::derive_where;

use crate::{
    error::Result,
    event::command::CommandEventEmitter,
    options::{ClientOptions, SessionOptions},
    sdam::{Topology, TransactionSupportStatus},
};

use session::{ClientSession, ServerSession, ServerSessionPool};

/// This is the main entry point for the core API. A `Client` is used to connect to a MongoDB
/// cluster and, from there, to route commands to its servers.
///
/// A `Client` spawns background tasks that monitor the state of the deployment and maintain
/// per-server connection pools; dropping the last clone of a `Client` (or calling
/// [`Client::shutdown`]) stops them.
///
/// `Client` uses `std::sync::Arc` internally, so it can be shared safely across threads or
/// async tasks.
#[derive(Clone, Debug)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

#[derive_where(Debug)]
pub(crate) struct ClientInner {
    pub(crate) topology: Topology,
    pub(crate) options: ClientOptions,
    pub(crate) session_pool: ServerSessionPool,
    #[derive_where(skip)]
    pub(crate) command_event_emitter: CommandEventEmitter,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `uri`. The URI can be on
    /// the format described [here](https://www.mongodb.com/docs/manual/reference/connection-string/).
    ///
    /// Note that a [`Connector`](crate::cmap::Connector) must be supplied before operations
    /// can run; prefer [`ClientOptions::parse`] followed by [`Client::with_options`] so one
    /// can be attached.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri.as_ref()).await?;

        Client::with_options(options)
    }

    /// Creates a new `Client` connected to the cluster specified by `options`.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let command_event_emitter =
            CommandEventEmitter::new(options.command_event_handlers.clone());
        let inner = Arc::new(ClientInner {
            topology: Topology::new(options.clone())?,
            session_pool: ServerSessionPool::new(),
            options,
            command_event_emitter,
        });

        Ok(Self { inner })
    }

    /// The options this client was created with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Starts a new [`ClientSession`].
    pub async fn start_session(
        &self,
        options: impl Into<Option<SessionOptions>>,
    ) -> Result<ClientSession> {
        let timeout = self.inner.topology.logical_session_timeout();
        let server_session = self.inner.session_pool.check_out(timeout).await;
        Ok(ClientSession::new(server_session, self.clone(), options.into()))
    }

    /// Add connections to all connection pools up to `min_pool_size`. This is normally not
    /// needed - the connection pools start connecting immediately in the background. Use this
    /// method if you need to ensure the pools are filled before starting operations.
    pub async fn warm_connection_pool(&self) {
        self.inner.topology.warm_pools().await;
    }

    /// Shut down this client, terminating background thread workers and closing connections.
    /// This will wait for any live handles to server-side resources to be dropped first.
    pub async fn shutdown(self) {
        self.inner.topology.shutdown().await;
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.inner.topology.transaction_support_status()
    }

    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        let timeout = self.inner.topology.logical_session_timeout();
        self.inner.session_pool.check_in(session, timeout).await;
    }

    #[cfg(test)]
    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }
}

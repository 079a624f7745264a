use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bson::{doc, Document};
use derive_where::derive_where;

use super::{
    conn::{
        pooled::PooledConnection,
        Connection,
        ConnectionGeneration,
        ConnectSettings,
        Connector,
        PendingConnection,
        StreamDescription,
        WireChannel,
    },
    PoolGeneration,
};
use crate::{
    error::{Error, Result},
    hello::{hello_command, run_hello, HelloReply},
    options::{ClientOptions, Credential, ServerAddress},
    runtime,
    sdam::HandshakePhase,
    BoxFuture,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication hook invoked after the handshake on every application connection that has a
/// credential configured. Mechanisms themselves (SCRAM, X.509, etc.) are implemented by higher
/// layers.
pub trait Authenticator: Send + Sync + std::fmt::Debug {
    /// Authenticate the freshly handshaken channel.
    fn authenticate<'a>(
        &'a self,
        channel: &'a mut dyn WireChannel,
        credential: &'a Credential,
        hello_response: &'a Document,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Contains the logic to establish a connection, including connecting the transport,
/// handshaking, and authenticating when a credential is present.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionEstablisher {
    #[derive_where(skip)]
    connector: Arc<dyn Connector>,
    #[derive_where(skip)]
    authenticator: Option<Arc<dyn Authenticator>>,
    credential: Option<Credential>,
    handshaker: Handshaker,
    connect_timeout: Duration,
    settings: ConnectSettings,
}

impl ConnectionEstablisher {
    /// Creates a new ConnectionEstablisher from the given options.
    pub(crate) fn from_client_options(options: &ClientOptions) -> Result<Self> {
        let connector = options.connector.clone().ok_or_else(|| {
            Error::invalid_argument(
                "a connector supplying the wire transport must be configured on the client \
                 options",
            )
        })?;

        let connect_timeout = match options.connect_timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => DEFAULT_CONNECT_TIMEOUT,
        };
        let settings = ConnectSettings {
            connect_timeout: Some(connect_timeout),
            socket_timeout: options.socket_timeout,
            tls: options.tls_enabled(),
        };

        Ok(Self {
            connector,
            authenticator: options.authenticator.clone(),
            credential: options.credential.clone(),
            handshaker: Handshaker::new(options),
            connect_timeout,
            settings,
        })
    }

    async fn connect(&self, address: ServerAddress) -> Result<Box<dyn WireChannel>> {
        runtime::timeout(
            self.connect_timeout,
            self.connector.connect(address, self.settings.clone()),
        )
        .await?
    }

    /// Establishes a connection for application use: connect, handshake, then authenticate.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
    ) -> std::result::Result<PooledConnection, EstablishError> {
        let pool_generation = pending_connection.generation.clone();
        let channel = self
            .connect(pending_connection.address.clone())
            .await
            .map_err(|e| EstablishError::pre_hello(e, pool_generation.clone()))?;

        let mut connection = PooledConnection::new(pending_connection, channel);
        let hello_reply = self
            .handshaker
            .handshake(&mut connection)
            .await
            .map_err(|e| EstablishError::pre_hello(e, pool_generation.clone()))?;

        // In load-balanced mode the partition a connection belongs to is only known once the
        // handshake reports the backend's service id.
        if let PoolGeneration::LoadBalanced(ref gen_map) = pool_generation {
            let service_id = connection.service_id();
            let generation = service_id
                .and_then(|sid| gen_map.get(&sid).copied())
                .unwrap_or(0);
            connection.generation = ConnectionGeneration::LoadBalanced {
                service_id,
                generation,
            };
        }

        if let (Some(authenticator), Some(credential)) =
            (self.authenticator.as_ref(), self.credential.as_ref())
        {
            let hello_response = hello_reply.raw_command_response.clone();
            authenticator
                .authenticate(connection.channel_mut(), credential, &hello_response)
                .await
                .map_err(|e| EstablishError::post_hello(e, connection.generation))?;
        }

        Ok(connection)
    }

    /// Establishes a dedicated monitoring connection. Monitoring connections are never pooled
    /// and skip authentication.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
    ) -> Result<(Connection, HelloReply)> {
        let start = Instant::now();
        let channel = self.connect(address.clone()).await?;
        let mut connection = Connection::new(address, channel, 0, start);
        let hello_reply = self.handshaker.handshake(&mut connection).await?;
        Ok((connection, hello_reply))
    }
}

/// Contains the logic for handshaking a connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The hello or legacy hello command to send when handshaking. This will always be identical
    /// given the same pool options, so it can be created at the time the Handshaker is created.
    command: crate::cmap::Command,
}

impl Handshaker {
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let mut command = hello_command(options.load_balanced, None, None);

        let mut client = doc! {
            "driver": {
                "name": "mongodb-core",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": {
                "type": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
            },
        };
        if let Some(ref app_name) = options.app_name {
            client.insert("application", doc! { "name": app_name.as_str() });
        }
        command.body.insert("client", client);

        Self { command }
    }

    /// Performs the hello handshake, caching the resulting stream description on the
    /// connection.
    pub(crate) async fn handshake(&self, conn: &mut Connection) -> Result<HelloReply> {
        let reply = run_hello(conn, self.command.clone()).await?;
        conn.stream_description = Some(StreamDescription::from_hello_reply(&reply));
        Ok(reply)
    }
}

/// Error encountered during connection establishment, annotated with the phase the handshake
/// had reached. SDAM uses the phase to decide whether the error is stale and whether the pool
/// must be cleared.
#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}

impl EstablishError {
    pub(crate) fn pre_hello(cause: Error, generation: PoolGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PreHello { generation },
        }
    }

    pub(crate) fn post_hello(cause: Error, generation: ConnectionGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PostHello { generation },
        }
    }
}

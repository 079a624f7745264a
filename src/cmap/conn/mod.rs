mod command;
pub(crate) mod pooled;
mod stream_description;
pub(crate) mod wire;

use std::time::Instant;

use bson::oid::ObjectId;
use derive_where::derive_where;

pub use self::wire::{ConnectSettings, Connector, WireChannel};
pub(crate) use self::{
    command::{Command, RawCommandResponse},
    stream_description::StreamDescription,
    wire::next_request_id,
};
use crate::{
    cmap::PoolGeneration,
    error::{Error, ErrorKind, Result},
    event::{cmap::CmapEventEmitter, command::ConnectionInfo},
    options::ServerAddress,
};

/// A wrapper around a [`WireChannel`] that tracks the identity and handshake state a connection
/// needs over its lifetime.
#[derive_where(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,

    pub(crate) address: ServerAddress,

    /// The time at which the channel was established.
    pub(crate) time_created: Instant,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// The most recent error the connection encountered, if any. Errored connections are
    /// destroyed rather than pooled at check-in.
    pub(crate) error: Option<Error>,

    #[derive_where(skip)]
    channel: Box<dyn WireChannel>,
}

impl Connection {
    pub(crate) fn new(
        address: ServerAddress,
        channel: Box<dyn WireChannel>,
        id: u32,
        time_created: Instant,
    ) -> Self {
        Self {
            id,
            address,
            time_created,
            stream_description: None,
            error: None,
            channel,
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            address: self.address.clone(),
        }
    }

    /// Sends a command over this connection and waits for the response.
    ///
    /// An `Ok(..)` result means the round trip succeeded at the transport level; it does not
    /// imply anything about the success of the command itself.
    pub(crate) async fn send_command(&mut self, command: Command) -> Result<RawCommandResponse> {
        let request = command.into_raw()?;
        match self.channel.round_trip(request).await {
            Ok(response) => Ok(RawCommandResponse::new(self.address.clone(), response)),
            Err(error) => {
                self.error = Some(error.clone());
                Err(error)
            }
        }
    }

    pub(crate) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Gets the connection's StreamDescription.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "connection checked out but not handshaked".to_string(),
            }
            .into()
        })
    }

    pub(crate) fn shutdown(&mut self) {
        self.channel.shutdown();
    }

    /// Mutable access to the underlying channel, for the authentication hook.
    pub(crate) fn channel_mut(&mut self) -> &mut dyn WireChannel {
        self.channel.as_mut()
    }

    /// Nullify the inner state and return it in a new `Connection`, so the original can be
    /// consumed from a `Drop` impl.
    pub(crate) fn take(&mut self) -> Connection {
        Connection {
            id: self.id,
            address: self.address.clone(),
            time_created: self.time_created,
            stream_description: self.stream_description.take(),
            error: self.error.take(),
            channel: std::mem::replace(&mut self.channel, Box::new(wire::NullChannel)),
        }
    }
}

/// The generation a given connection belongs to, assigned at establishment.
///
/// In load-balanced mode generations are tracked per backend; the service id is only known
/// after the handshake reports it, at which point the establisher records the service's
/// generation at that moment.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ConnectionGeneration {
    Normal(u32),
    LoadBalanced {
        service_id: Option<ObjectId>,
        generation: u32,
    },
}

impl ConnectionGeneration {
    pub(crate) fn service_id(self) -> Option<ObjectId> {
        match self {
            ConnectionGeneration::LoadBalanced { service_id, .. } => service_id,
            ConnectionGeneration::Normal(_) => None,
        }
    }

    /// Whether a connection of this generation is stale relative to its pool's current
    /// generation.
    pub(crate) fn is_stale(&self, pool_generation: &PoolGeneration) -> bool {
        match (self, pool_generation) {
            (ConnectionGeneration::Normal(cgen), PoolGeneration::Normal(pgen)) => cgen != pgen,
            (
                ConnectionGeneration::LoadBalanced {
                    service_id: Some(sid),
                    generation,
                },
                PoolGeneration::LoadBalanced(gen_map),
            ) => gen_map.get(sid).copied().unwrap_or(0) != *generation,
            // A connection whose handshake never reported a service id cannot be matched to a
            // partition and is never considered stale.
            (
                ConnectionGeneration::LoadBalanced {
                    service_id: None, ..
                },
                PoolGeneration::LoadBalanced(_),
            ) => false,
            _ => true,
        }
    }
}

/// A connection that has been created by a pool but not yet established. Tracks the identity
/// the eventual connection will carry.
#[derive(Debug, Clone)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: PoolGeneration,
    pub(crate) event_emitter: CmapEventEmitter,
    pub(crate) time_created: Instant,
}

impl PendingConnection {
    pub(crate) fn created_event(&self) -> crate::event::cmap::ConnectionCreatedEvent {
        crate::event::cmap::ConnectionCreatedEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }
}

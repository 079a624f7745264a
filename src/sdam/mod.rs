mod description;
mod monitor;
pub mod public;
mod server;
mod srv_polling;
mod topology;

pub use self::description::server::TopologyVersion;
pub use self::public::{ServerInfo, ServerType, TopologyType};

pub(crate) use self::{
    description::{
        server::ServerDescription,
        topology::{TopologyDescription, TransactionSupportStatus},
    },
    monitor::MIN_HEARTBEAT_FREQUENCY,
    server::Server,
    topology::{
        BroadcastMessage,
        HandshakePhase,
        Topology,
        TopologyUpdater,
        TopologyWatcher,
    },
};

pub(crate) use self::description::topology::{choose_n, server_selection};
pub(crate) use self::description::topology::server_selection::SelectedServer;

#[cfg(test)]
pub(crate) use self::description::server::test_helpers;
#[cfg(test)]
pub(crate) use self::topology::UpdateMessage;

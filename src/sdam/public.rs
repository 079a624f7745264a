//! Public read-only views of the driver's SDAM state.

use std::{borrow::Cow, fmt, time::Duration};

use bson::DateTime;

pub use super::description::{server::ServerType, topology::TopologyType};
use crate::{options::ServerAddress, selection_criteria::TagSet};

use super::description::server::ServerDescription;

/// A description of the most up-to-date information known about a server.
#[derive(Clone)]
pub struct ServerInfo<'a> {
    description: Cow<'a, ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self {
            description: Cow::Borrowed(description),
        }
    }

    pub(crate) fn new_owned(description: ServerDescription) -> ServerInfo<'static> {
        ServerInfo {
            description: Cow::Owned(description),
        }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the time it has taken for a server check to round-trip
    /// from the driver to the server.
    ///
    /// This is the value used when performing a latency-based server selection.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the last time that the driver's monitoring thread for the server updated the
    /// internal information about the server.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.description.last_update_time
    }

    /// Gets the maximum wire version that the server supports.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.description.max_wire_version().ok().flatten()
    }

    /// Gets the minimum wire version that the server supports.
    pub fn min_wire_version(&self) -> Option<i32> {
        self.description.min_wire_version().ok().flatten()
    }

    /// Gets the name of the replica set that the server is part of.
    pub fn replica_set_name(&self) -> Option<&str> {
        match self.description.reply {
            Ok(Some(ref reply)) => reply.command_response.set_name.as_deref(),
            _ => None,
        }
    }

    /// Gets the version of the replica set config.
    pub fn replica_set_version(&self) -> Option<i32> {
        self.description.set_version().ok().flatten()
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the tags of the server, if it is part of a replica set.
    pub fn tags(&self) -> Option<&TagSet> {
        self.description.tags()
    }

    /// Gets the error that occurred during the last server check, if any.
    pub fn error(&self) -> Option<&crate::error::Error> {
        self.description.reply.as_ref().err()
    }

    /// Converts this into a view that owns its description.
    pub fn into_owned(self) -> ServerInfo<'static> {
        ServerInfo {
            description: Cow::Owned(self.description.into_owned()),
        }
    }
}

impl fmt::Display for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ Address: {}, Type: {:?}",
            self.address(),
            self.server_type()
        )?;

        match self.description.reply {
            Ok(_) => {
                if let Some(avg_rtt) = self.average_round_trip_time() {
                    write!(f, ", Average RTT: {:?}", avg_rtt)?;
                }

                if let Some(last_update_time) = self.last_update_time() {
                    write!(f, ", Last Updated: {}", last_update_time)?;
                }

                if let Some(max_wire_version) = self.max_wire_version() {
                    write!(f, ", Max Wire Version: {}", max_wire_version)?;
                }

                if let Some(min_wire_version) = self.min_wire_version() {
                    write!(f, ", Min Wire Version: {}", min_wire_version)?;
                }

                if let Some(rs_name) = self.replica_set_name() {
                    write!(f, ", Replica Set Name: {}", rs_name)?;
                }

                if let Some(rs_version) = self.replica_set_version() {
                    write!(f, ", Replica Set Version: {}", rs_version)?;
                }
            }
            Err(ref e) => {
                write!(f, ", Error: {}", e)?;
            }
        }

        write!(f, " }}")
    }
}

impl fmt::Debug for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A description of the most up-to-date information known about a topology, as published to
/// event listeners.
#[derive(Clone, Debug)]
pub struct TopologyDescription {
    pub(crate) inner: super::description::topology::TopologyDescription,
}

impl TopologyDescription {
    /// Whether there was an error performing an operation on the topology.
    pub fn has_compatibility_error(&self) -> bool {
        self.inner.compatibility_error.is_some()
    }

    /// The compatibility error message, if the driver is incompatible with some server in the
    /// topology.
    pub fn compatibility_error(&self) -> Option<&str> {
        self.inner.compatibility_error.as_deref()
    }

    /// The type of the topology.
    pub fn topology_type(&self) -> TopologyType {
        self.inner.topology_type
    }

    /// The name of the replica set, if the topology is one.
    pub fn set_name(&self) -> Option<&str> {
        self.inner.set_name.as_deref()
    }

    /// The amount of time a logical session will remain active on a server after its most
    /// recent use, as the minimum reported across the topology's data-bearing servers.
    pub fn logical_session_timeout(&self) -> Option<Duration> {
        self.inner.logical_session_timeout
    }

    /// The servers in the topology.
    pub fn servers(&self) -> Vec<ServerInfo<'_>> {
        self.inner
            .servers
            .values()
            .map(ServerInfo::new_borrowed)
            .collect()
    }
}

impl From<super::description::topology::TopologyDescription> for TopologyDescription {
    fn from(inner: super::description::topology::TopologyDescription) -> Self {
        Self { inner }
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

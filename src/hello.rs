use std::time::Duration;

use bson::{doc, oid::ObjectId, DateTime, Document, Timestamp};
use serde::{Deserialize, Serialize};

use crate::{
    client::session::ClusterTime,
    cmap::{Command, Connection, RawCommandResponse},
    error::Result,
    options::ServerAddress,
    sdam::{ServerType, TopologyVersion},
    selection_criteria::TagSet,
};

/// The legacy version of the `hello` command which was deprecated in 5.0.
/// To limit usages of the legacy name in the codebase, this constant should be used
/// wherever possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

#[derive(Debug, Clone, Copy)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// Construct a hello or legacy hello command, depending on the circumstances.
///
/// If `load_balanced` is true or the server previously indicated `helloOk: true`, then `hello`
/// will be used. Otherwise, legacy hello will be used, and if it's unknown whether the server
/// supports hello, the command also will contain `helloOk: true`.
pub(crate) fn hello_command(
    load_balanced: Option<bool>,
    hello_ok: Option<bool>,
    awaitable_options: Option<AwaitableHelloOptions>,
) -> Command {
    let (mut body, command_name) = if matches!(load_balanced, Some(true)) || matches!(hello_ok, Some(true)) {
        (doc! { "hello": 1 }, "hello")
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    if matches!(load_balanced, Some(true)) {
        body.insert("loadBalanced", true);
    }

    if let Some(opts) = awaitable_options {
        body.insert("topologyVersion", opts.topology_version);
        body.insert(
            "maxAwaitTimeMS",
            i64::try_from(opts.max_await_time.as_millis()).unwrap_or(i64::MAX),
        );
    }

    Command::new(command_name, "admin", body)
}

/// Execute a hello or legacy hello command on the given connection.
pub(crate) async fn run_hello(conn: &mut Connection, command: Command) -> Result<HelloReply> {
    let response = conn.send_command(command).await?;
    response.into_hello_reply()
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) cluster_time: Option<ClusterTime>,
    #[serde(skip)]
    pub(crate) raw_command_response: Document,
}

impl RawCommandResponse {
    pub(crate) fn into_hello_reply(self) -> Result<HelloReply> {
        #[derive(Debug, Deserialize)]
        struct FullHelloResponse {
            #[serde(rename = "$clusterTime")]
            cluster_time: Option<ClusterTime>,
            #[serde(flatten)]
            command_response: HelloCommandResponse,
        }

        let full: FullHelloResponse = self.body()?;
        let raw = self.to_document()?;

        Ok(HelloReply {
            server_address: self.source_address().clone(),
            command_response: full.command_response,
            cluster_time: full.cluster_time,
            raw_command_response: raw,
        })
    }
}

/// The response to a `hello` command.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/command/hello/) for more details.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub(crate) is_writable_primary: Option<bool>,

    #[serde(rename = "ismaster")]
    /// Legacy name for `is_writable_primary` field.
    pub(crate) is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring instead
    /// of the legacy hello command.
    pub(crate) hello_ok: Option<bool>,

    /// The list of all hosts.
    pub(crate) hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub(crate) passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub(crate) arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub(crate) msg: Option<String>,

    /// The address of the server that returned this `HelloCommandResponse`.
    pub(crate) me: Option<String>,

    /// The current replica set config version.
    pub(crate) set_version: Option<i32>,

    /// The name of the current replica set.
    pub(crate) set_name: Option<String>,

    /// Whether the server is hidden.
    pub(crate) hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub(crate) secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub(crate) arbiter_only: Option<bool>,

    #[serde(rename = "isreplicaset")]
    /// Whether the server is a replica set.
    pub(crate) is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub(crate) logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub(crate) last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub(crate) min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub(crate) max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub(crate) tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub(crate) election_id: Option<ObjectId>,

    /// The address of current primary member of the replica set.
    pub(crate) primary: Option<String>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub(crate) service_id: Option<ObjectId>,

    /// For internal use.
    pub(crate) topology_version: Option<TopologyVersion>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub(crate) last_write_date: DateTime,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[allow(dead_code)]
pub(crate) struct OpTime {
    ts: Timestamp,
    t: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_type_inference() {
        let mut response = HelloCommandResponse {
            msg: Some("isdbgrid".to_string()),
            ..Default::default()
        };
        assert_eq!(response.server_type(), ServerType::Mongos);

        response.msg = None;
        response.set_name = Some("rs0".to_string());
        response.is_writable_primary = Some(true);
        assert_eq!(response.server_type(), ServerType::RsPrimary);

        response.is_writable_primary = Some(false);
        response.secondary = Some(true);
        assert_eq!(response.server_type(), ServerType::RsSecondary);

        response.hidden = Some(true);
        assert_eq!(response.server_type(), ServerType::RsOther);

        let ghost = HelloCommandResponse {
            is_replica_set: Some(true),
            ..Default::default()
        };
        assert_eq!(ghost.server_type(), ServerType::RsGhost);

        assert_eq!(
            HelloCommandResponse::default().server_type(),
            ServerType::Standalone
        );
    }

    #[test]
    fn hello_command_shape() {
        let command = hello_command(None, None, None);
        assert_eq!(command.name, LEGACY_HELLO_COMMAND_NAME);
        assert_eq!(command.body.get_bool("helloOk"), Ok(true));

        let command = hello_command(None, Some(true), None);
        assert_eq!(command.name, "hello");

        let command = hello_command(Some(true), None, None);
        assert_eq!(command.name, "hello");
        assert_eq!(command.body.get_bool("loadBalanced"), Ok(true));
    }
}

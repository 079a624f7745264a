use std::time::Duration;

use bson::oid::ObjectId;

use crate::{hello::HelloReply, options::ServerAddress, sdam::ServerType};

/// Information about the server a connection is connected to, cached from the handshake.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// How long sessions started on this server will stay alive without being used.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub(crate) service_id: Option<ObjectId>,

    /// Whether the server understands the `hello` command.
    pub(crate) hello_ok: bool,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a hello command reply.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            min_wire_version: response.min_wire_version,
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(u64::try_from(mins).unwrap_or(0) * 60)),
            service_id: response.service_id,
            hello_ok: response.hello_ok.unwrap_or(false),
        }
    }
}

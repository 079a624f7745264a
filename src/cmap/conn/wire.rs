use std::{
    fmt,
    sync::atomic::{AtomicI32, Ordering},
    time::Duration,
};

use bson::RawDocumentBuf;

use crate::{error::Result, options::ServerAddress, BoxFuture};

/// Global counter for request IDs, shared by every connection of a client.
static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Returns a new, unique request ID for a command.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// A single established duplex channel to one server, carrying opaque BSON documents.
///
/// The wire-protocol message layout is deliberately not modeled here; implementations own the
/// underlying byte stream (TCP, TLS, Unix socket, or in-memory for tests) and whatever framing
/// the protocol requires. A channel carries at most one request at a time.
pub trait WireChannel: Send + fmt::Debug {
    /// Send one request document and await the server's response document.
    ///
    /// Transport failures must be reported via [`ErrorKind::Io`](crate::error::ErrorKind::Io)
    /// (with `TimedOut` for read/write timeouts) so that SDAM can classify them.
    fn round_trip(&mut self, request: RawDocumentBuf) -> BoxFuture<'_, Result<RawDocumentBuf>>;

    /// Tear the channel down. Best-effort and synchronous; dropping the channel must also
    /// release its resources.
    fn shutdown(&mut self);
}

/// The transport capabilities requested for a new channel.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct ConnectSettings {
    /// Maximum time to spend establishing the channel, including any TLS handshake.
    pub connect_timeout: Option<Duration>,

    /// Maximum time a single socket read or write may take before the channel reports a
    /// timeout.
    pub socket_timeout: Option<Duration>,

    /// Whether transport security is required. The mechanics of TLS are owned by the
    /// [`Connector`].
    pub tls: bool,
}

/// Factory for [`WireChannel`]s, supplied at client construction.
///
/// The pool owns *when* connections are established; the connector owns *how* bytes get moved.
/// Implementations typically open a TCP or Unix-socket stream, optionally wrap it in TLS, and
/// layer the wire-protocol framing on top.
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a new channel to `address`.
    fn connect(
        &self,
        address: ServerAddress,
        settings: ConnectSettings,
    ) -> BoxFuture<'static, Result<Box<dyn WireChannel>>>;
}

/// Placeholder channel used when a connection's state has been moved out (e.g. to check the
/// connection back in from a `Drop` impl). Any use is a driver bug.
#[derive(Debug)]
pub(crate) struct NullChannel;

impl WireChannel for NullChannel {
    fn round_trip(&mut self, _request: RawDocumentBuf) -> BoxFuture<'_, Result<RawDocumentBuf>> {
        Box::pin(async {
            Err(crate::error::Error::internal(
                "attempted to use a connection whose channel was moved",
            ))
        })
    }

    fn shutdown(&mut self) {}
}

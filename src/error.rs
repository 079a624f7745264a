//! Contains the `Error` and `Result` types that `mongodb_core` uses.

use std::{
    collections::HashSet,
    fmt::{self, Debug},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{options::ServerAddress, sdam::TopologyVersion};

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOTWRITABLEPRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];
const RETRYABLE_READ_CODES: [i32; 13] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 134, 262,
];
const RETRYABLE_WRITE_CODES: [i32; 12] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262,
];
const UNKNOWN_TRANSACTION_COMMIT_RESULT_LABEL_CODES: [i32; 3] = [50, 64, 91];

/// Retryable write error label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Transient transaction error label. This label will be added to a network error or server
/// selection error that occurs during a transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Unknown transaction commit result error label. This label will be added to a server selection
/// error, network error, write-retryable error, or MaxTimeMSExpired error encountered during a
/// commitTransaction.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// The result type for all fallible methods in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb_core` crate. The inner [`ErrorKind`] is boxed to keep
/// the `Error` small, and sources are `Arc`'d so errors can be cloned and fanned out to event
/// listeners and SDAM bookkeeping.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    pub(crate) wire_version: Option<i32>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        Self {
            kind: Box::new(kind),
            labels,
            wire_version: None,
            source: None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    /// Classify a low-level I/O failure. Interrupted reads/writes indicate cooperative
    /// cancellation and map to their own kind so callers can distinguish them from transport
    /// failures; timeouts stay `Io` so that `is_network_timeout` can see them.
    pub(crate) fn from_io(error: std::io::Error) -> Error {
        match error.kind() {
            std::io::ErrorKind::Interrupted => ErrorKind::Interrupted {
                message: error.to_string(),
            }
            .into(),
            _ => ErrorKind::Io(Arc::new(error)).into(),
        }
    }

    pub(crate) fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        Error::new(
            ErrorKind::ConnectionPoolCleared {
                message: format!(
                    "Connection pool for {} cleared because another operation failed with: {}",
                    address, cause
                ),
            },
            Some(cause.labels.iter().cloned()),
        )
    }

    pub(crate) fn pool_closed_error(address: &ServerAddress) -> Self {
        ErrorKind::ConnectionPoolClosed {
            message: format!("Connection pool for {} is closed", address),
        }
        .into()
    }

    pub(crate) fn session_usage(message: impl Into<String>) -> Self {
        ErrorKind::SessionUsage {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn with_source(mut self, source: impl Into<Option<Error>>) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Adds the given label to this error.
    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() != std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    pub(crate) fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    pub(crate) fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Interrupted { .. })
    }

    pub(crate) fn is_pool_cleared(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ConnectionPoolCleared { .. })
    }

    /// Gets the code from this error for performing SDAM updates, if applicable.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            _ => None,
        }
        .or_else(|| self.source.as_ref().and_then(|s| s.sdam_code()))
    }

    /// If this error corresponds to a "not writable primary" error as per the SDAM spec.
    pub(crate) fn is_notwritableprimary(&self) -> bool {
        self.sdam_code()
            .map(|code| NOTWRITABLEPRIMARY_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is recovering" error as per the SDAM spec.
    pub(crate) fn is_recovering(&self) -> bool {
        self.sdam_code()
            .map(|code| RECOVERING_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is shutting down" error as per the SDAM spec.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.sdam_code()
            .map(|code| SHUTTING_DOWN_CODES.contains(&code))
            .unwrap_or(false)
    }

    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    /// Whether a read operation should be retried if this error occurs.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => RETRYABLE_READ_CODES.contains(&code),
            None => false,
        }
    }

    pub(crate) fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether a "RetryableWriteError" label should be added to this error. If max_wire_version
    /// indicates a 4.4+ server, a label should only be added if the error is a network error.
    /// Otherwise, a label should be added if the error is a network error or the error code
    /// matches one of the retryable write codes.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if max_wire_version > 8 {
            return self.is_network_error();
        }
        if self.is_network_error() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => RETRYABLE_WRITE_CODES.contains(&code),
            None => false,
        }
    }

    pub(crate) fn should_add_unknown_transaction_commit_result_label(&self) -> bool {
        if self.contains_label(TRANSIENT_TRANSACTION_ERROR) {
            return false;
        }
        if self.is_network_error() || self.is_server_selection_error() || self.is_write_retryable()
        {
            return true;
        }
        match self.sdam_code() {
            Some(code) => UNKNOWN_TRANSACTION_COMMIT_RESULT_LABEL_CODES.contains(&code),
            None => false,
        }
    }

    /// The `topologyVersion` reported by the server alongside a state change error, if any.
    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => command_error.topology_version,
            _ => None,
        }
    }

    /// Whether a state change error should also clear the server's connection pool: always
    /// for shutdown errors, and for servers whose wire version predates 4.4 (`< 9`), which
    /// cannot be relied on to fail remaining connections promptly themselves.
    pub(crate) fn requires_pool_clear(&self, max_wire_version: Option<i32>) -> bool {
        self.is_shutting_down() || max_wire_version.unwrap_or(0) < 9
    }

    #[cfg(test)]
    pub(crate) fn message(&self) -> Option<String> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.message.clone()),
            ErrorKind::InvalidArgument { message }
            | ErrorKind::Internal { message }
            | ErrorKind::ServerSelection { message }
            | ErrorKind::IncompatibleServer { message }
            | ErrorKind::Transaction { message }
            | ErrorKind::SessionUsage { message }
            | ErrorKind::DnsResolve { message, .. } => Some(message.clone()),
            _ => None,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err))
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(Arc::new(err))
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(Arc::new(err))
    }
}

impl From<bson::raw::Error> for ErrorKind {
    fn from(err: bson::raw::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided, e.g. a malformed connection string or conflicting
    /// options.
    #[error("An invalid argument was provided: {message}")]
    InvalidArgument { message: String },

    /// An error occurred during authentication. The mechanisms themselves are plugged in by
    /// higher layers; this kind only carries their failures.
    #[error("{message}")]
    Authentication { message: String },

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An error occurred during DNS resolution of a `mongodb+srv` seedlist.
    #[error("DNS resolution failed ({kind}): {message}")]
    DnsResolve {
        kind: DnsErrorKind,
        message: String,
    },

    /// A network I/O error occurred. Timeouts are reported here with
    /// `std::io::ErrorKind::TimedOut`.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The operation was interrupted by cooperative cancellation rather than by a transport
    /// failure.
    #[error("Interrupted: {message}")]
    Interrupted { message: String },

    /// The connection pool was cleared while the check-out was in progress, or the checked-out
    /// connection belongs to an earlier generation. New check-outs fail with this kind while the
    /// pool is paused.
    #[error("{message}")]
    ConnectionPoolCleared { message: String },

    /// The connection pool has been closed and can no longer serve check-outs.
    #[error("{message}")]
    ConnectionPoolClosed { message: String },

    /// The check-out deadline elapsed while waiting in the pool's wait queue.
    #[error("Timed out while checking out a connection from connection pool for {address}")]
    WaitQueueTimeout { address: ServerAddress },

    /// The pool's wait queue is at capacity and cannot accept another waiter.
    #[error("The wait queue of the connection pool for {address} is full")]
    WaitQueueFull { address: ServerAddress },

    /// No server could be selected before the deadline. The message names the selection
    /// criteria and the topology that was observed.
    #[error("{message}")]
    ServerSelection { message: String },

    /// At least one observed server's wire version range does not overlap the driver's.
    #[error("{message}")]
    IncompatibleServer { message: String },

    /// The deployment does not support sessions.
    #[error("Attempted to start a session against a deployment that does not support sessions")]
    SessionsNotSupported,

    /// A session was used after being closed, or shared between concurrent operations.
    #[error("Invalid session usage: {message}")]
    SessionUsage { message: String },

    /// A transaction-related state machine violation, e.g. committing an aborted transaction.
    #[error("{message}")]
    Transaction { message: String },

    /// The response the server returned could not be interpreted.
    #[error("Invalid server response: {message}")]
    InvalidResponse { message: String },

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(Arc<bson::ser::Error>),

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(Arc<bson::de::Error>),

    /// The client has been shut down.
    #[error("The client has been shut down")]
    Shutdown,

    /// An internal error occurred. These are driver bugs.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Sub-classification of DNS resolution failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum DnsErrorKind {
    /// The SRV lookup returned zero records.
    #[display("no SRV records")]
    NoRecords,

    /// An SRV target was not domain-scoped to the queried hostname.
    #[display("SRV host mismatch")]
    HostMismatch,

    /// More than one TXT record was returned for the queried hostname.
    #[display("multiple TXT records")]
    MultipleTxtRecords,

    /// A TXT record contained an option other than `replicaSet`, `authSource`, or
    /// `loadBalanced`.
    #[display("disallowed TXT option")]
    DisallowedTxtOption,

    /// The resolver reported a failure that does not fall into a more specific category.
    #[display("resolver failure")]
    Resolver,
}

/// An error that was returned by the server in response to a command.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// The topology version reported by the server in the error response, used to ignore stale
    /// state change errors.
    #[serde(rename = "topologyVersion")]
    pub(crate) topology_version: Option<TopologyVersion>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Error code {} ({}): {}", self.code, self.code_name, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_error(code: i32) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: "test".to_string(),
            topology_version: None,
        })
        .into()
    }

    #[test]
    fn state_change_classification() {
        // 10107 NotWritablePrimary, 11600 InterruptedAtShutdown, 13436 NotPrimaryOrSecondary
        assert!(command_error(10107).is_notwritableprimary());
        assert!(!command_error(10107).is_shutting_down());
        assert!(command_error(11600).is_shutting_down());
        assert!(command_error(11600).is_recovering());
        assert!(command_error(13436).is_recovering());
        assert!(command_error(10107).is_state_change_error());
        assert!(!command_error(8000).is_state_change_error());
    }

    #[test]
    fn io_classification() {
        let interrupted = Error::from_io(std::io::ErrorKind::Interrupted.into());
        assert!(interrupted.is_interrupted());
        assert!(!interrupted.is_network_error());

        let timed_out = Error::from_io(std::io::ErrorKind::TimedOut.into());
        assert!(timed_out.is_network_timeout());
        assert!(timed_out.is_network_error());
        assert!(!timed_out.is_non_timeout_network_error());
        assert!(!timed_out.is_interrupted());

        let reset = Error::from_io(std::io::ErrorKind::ConnectionReset.into());
        assert!(reset.is_non_timeout_network_error());
    }

    #[test]
    fn pool_clear_requirement() {
        // Older servers clear on any state change error; newer ones only on shutdown codes.
        assert!(command_error(10107).requires_pool_clear(Some(8)));
        assert!(!command_error(10107).requires_pool_clear(Some(9)));
        assert!(command_error(11600).requires_pool_clear(Some(9)));
    }
}

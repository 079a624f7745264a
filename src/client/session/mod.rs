mod cluster_time;
pub(crate) mod pool;

use std::time::{Duration, Instant};

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::{
    cmap::Command,
    concern::{ReadConcern, WriteConcern},
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::TransactionSupportStatus,
    selection_criteria::SelectionCriteria,
    Client,
};
pub use cluster_time::ClusterTime;
pub(crate) use pool::ServerSessionPool;

/// Contains the options that can be used to create a new [`ClientSession`].
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct SessionOptions {
    /// The default options to use for transactions started on this session.
    ///
    /// If these options are not specified, they will be inherited from the
    /// [`Client`](crate::Client) associated with this session.
    pub default_transaction_options: Option<TransactionOptions>,
}

/// Contains the options that can be used for a transaction.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern to use for the transaction.
    pub read_concern: Option<ReadConcern>,

    /// The write concern to use when committing or aborting a transaction.
    pub write_concern: Option<WriteConcern>,

    /// The selection criteria to use for all read operations in a transaction.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The maximum amount of time to allow a single commitTransaction to run.
    pub max_commit_time: Option<Duration>,
}

/// A MongoDB client session. This struct represents a logical session used for ordering
/// sequential operations. To create a `ClientSession`, call `start_session` on a `Client`.
///
/// `ClientSession` instances are not thread safe or fork safe. They can only be used by one
/// thread or process at a time; Rust's ownership rules enforce this, as every operation taking
/// a session takes `&mut`.
#[derive(Clone, Debug)]
pub struct ClientSession {
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    server_session: ServerSession,
    client: Client,
    options: Option<SessionOptions>,
    pub(crate) transaction: Transaction,
}

/// The transaction state of a session, including the sharded-transaction bookkeeping (mongos
/// pinning and the recovery token).
#[derive(Clone, Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    pub(crate) pinned_mongos: Option<ServerAddress>,
    pub(crate) recovery_token: Option<Document>,
}

impl Transaction {
    pub(crate) fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.recovery_token = None;
    }

    pub(crate) fn commit(&mut self, data_committed: bool) {
        self.state = TransactionState::Committed { data_committed };
    }

    pub(crate) fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
        self.pinned_mongos = None;
    }
}

/// The state of a session's transaction, as driven by `start_transaction`,
/// `commit_transaction`, and `abort_transaction`.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Committed {
        /// Whether any data was committed when commit_transaction was initially called. This
        /// is required to determine whether a commitTransaction command should be run if the
        /// user calls commit_transaction again.
        data_committed: bool,
    },
    Aborted,
}

impl ClientSession {
    pub(crate) fn new(
        server_session: ServerSession,
        client: Client,
        options: Option<SessionOptions>,
    ) -> Self {
        Self {
            client,
            server_session,
            cluster_time: None,
            operation_time: None,
            options,
            transaction: Default::default(),
        }
    }

    /// The client used to create this session.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        &self.server_session.id
    }

    /// Whether this session is currently in a transaction.
    pub(crate) fn in_transaction(&self) -> bool {
        self.transaction.state == TransactionState::Starting
            || self.transaction.state == TransactionState::InProgress
    }

    /// The highest seen cluster time this session has seen so far.
    /// This will be `None` if this session has not been used in an operation yet.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The operation time of the most recent operation performed using this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// The options used to create this session.
    pub fn options(&self) -> Option<&SessionOptions> {
        self.options.as_ref()
    }

    /// Set the cluster time to the provided one if it is greater than this session's highest
    /// seen cluster time or if this session's cluster time is `None`. Idempotent and
    /// commutative: repeated and reordered advances converge on the maximum.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Advance the cached operation time to the provided one if it is greater than the
    /// session's current operation time.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        if self.operation_time.map(|ot| ot < ts).unwrap_or(true) {
            self.operation_time = Some(ts);
        }
    }

    /// Mark this session (and the underlying server session) as dirty.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }

    /// Updates the date that the underlying server session was last used as part of an
    /// operation sent to the server.
    pub(crate) fn update_last_use(&mut self) {
        self.server_session.last_use = Instant::now();
    }

    /// Gets the current txn_number.
    pub(crate) fn txn_number(&self) -> i64 {
        self.server_session.txn_number
    }

    /// Increments the txn_number.
    pub(crate) fn increment_txn_number(&mut self) {
        self.server_session.txn_number += 1;
    }

    /// Pin this session to the given mongos. All subsequent statements in the current
    /// transaction will target it.
    pub(crate) fn pin_mongos(&mut self, address: ServerAddress) {
        self.transaction.pinned_mongos = Some(address);
    }

    pub(crate) fn unpin_mongos(&mut self) {
        self.transaction.pinned_mongos = None;
    }

    pub(crate) fn pinned_mongos(&self) -> Option<&ServerAddress> {
        self.transaction.pinned_mongos.as_ref()
    }

    /// Whether this session is dirty.
    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.server_session.dirty
    }

    /// Starts a new transaction on this session with the given `TransactionOptions`. If no
    /// options are provided, the session's `defaultTransactionOptions` will be used. This
    /// session must be passed into each operation within the transaction; otherwise, the
    /// operation will be executed outside of the transaction.
    ///
    /// Errors returned from operations executed within a transaction may include a
    /// [`crate::error::TRANSIENT_TRANSACTION_ERROR`] label. This label indicates that the
    /// entire transaction can be retried with a reasonable expectation that it will succeed.
    pub fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        match self.transaction.state {
            TransactionState::Starting | TransactionState::InProgress => {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".into(),
                }
                .into());
            }
            TransactionState::Committed { .. } => {
                // Unpin the session if the previous transaction has been committed.
                self.unpin_mongos();
            }
            _ => {}
        }

        match self.client.transaction_support_status() {
            TransactionSupportStatus::Supported | TransactionSupportStatus::Undetermined => {}
            TransactionSupportStatus::Unsupported => {
                return Err(ErrorKind::Transaction {
                    message: "transactions are not supported by this deployment".into(),
                }
                .into())
            }
        }

        let options = options
            .into()
            .or_else(|| self.default_transaction_options().cloned());

        if let Some(ref options) = options {
            if !options
                .write_concern
                .as_ref()
                .map(|wc| wc.is_acknowledged())
                .unwrap_or(true)
            {
                return Err(ErrorKind::Transaction {
                    message: "transactions do not support unacknowledged write concerns".into(),
                }
                .into());
            }
        }

        self.increment_txn_number();
        self.transaction.start(options);
        Ok(())
    }

    /// Commits the transaction that is currently active on this session.
    ///
    /// This method may return an error with a
    /// [`crate::error::UNKNOWN_TRANSACTION_COMMIT_RESULT`] label. This label indicates that it
    /// is unknown whether the commit has satisfied the write concern associated with the
    /// transaction. If an error with this label is returned, it is safe to retry the commit
    /// until the write concern is satisfied or an error without the label is returned.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        match &mut self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "Cannot call commitTransaction after calling abortTransaction".into(),
            }
            .into()),
            TransactionState::Starting => {
                // Nothing ran inside the transaction, so there is nothing to commit on the
                // server.
                self.transaction.commit(false);
                Ok(())
            }
            TransactionState::InProgress => {
                self.transaction.commit(true);
                self.run_commit_command().await
            }
            TransactionState::Committed {
                data_committed: true,
            } => self.run_commit_command().await,
            TransactionState::Committed {
                data_committed: false,
            } => Ok(()),
        }
    }

    /// Aborts the transaction that is currently active on this session. Any open transaction
    /// will be aborted automatically when the `ClientSession` is dropped.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Committed { .. } => Err(ErrorKind::Transaction {
                message: "Cannot call abortTransaction after calling commitTransaction".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot call abortTransaction twice".into(),
            }
            .into()),
            TransactionState::Starting => {
                self.transaction.abort();
                Ok(())
            }
            TransactionState::InProgress => {
                let write_concern = self
                    .transaction
                    .options
                    .as_ref()
                    .and_then(|options| options.write_concern.clone());
                let pinned = self.transaction.pinned_mongos.clone();
                let recovery_token = self.transaction.recovery_token.clone();
                self.transaction.abort();

                let mut command =
                    Command::new("abortTransaction", "admin", doc! { "abortTransaction": 1 });
                command.set_txn_number(self.txn_number());
                command.set_autocommit();
                if let Some(ref wc) = write_concern {
                    command.set_write_concern(wc);
                }
                if let Some(ref token) = recovery_token {
                    command.set_recovery_token(token);
                }

                // Errors returned from running an abortTransaction command should be ignored.
                let _result = self
                    .client
                    .clone()
                    .execute_transaction_command(command, self, pinned)
                    .await;
                Ok(())
            }
        }
    }

    async fn run_commit_command(&mut self) -> Result<()> {
        let options = self.transaction.options.clone();
        let pinned = self.transaction.pinned_mongos.clone();

        let mut command =
            Command::new("commitTransaction", "admin", doc! { "commitTransaction": 1 });
        command.set_txn_number(self.txn_number());
        command.set_autocommit();
        if let Some(ref options) = options {
            if let Some(ref wc) = options.write_concern {
                command.set_write_concern(wc);
            }
            if let Some(max_commit_time) = options.max_commit_time {
                command.set_max_time_ms(max_commit_time);
            }
        }
        if let Some(ref token) = self.transaction.recovery_token.clone() {
            command.set_recovery_token(token);
        }

        self.client
            .clone()
            .execute_transaction_command(command, self, pinned)
            .await
            .map(|_| ())
    }

    fn default_transaction_options(&self) -> Option<&TransactionOptions> {
        self.options
            .as_ref()
            .and_then(|options| options.default_transaction_options.as_ref())
    }
}

struct DroppedClientSession {
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    server_session: ServerSession,
    client: Client,
    options: Option<SessionOptions>,
    transaction: Transaction,
}

impl From<DroppedClientSession> for ClientSession {
    fn from(dropped_session: DroppedClientSession) -> Self {
        Self {
            cluster_time: dropped_session.cluster_time,
            operation_time: dropped_session.operation_time,
            server_session: dropped_session.server_session,
            client: dropped_session.client,
            options: dropped_session.options,
            transaction: dropped_session.transaction,
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if tokio::runtime::Handle::try_current().is_err() {
            // The runtime is shutting down; the server-side session will expire on its own.
            return;
        }
        if self.transaction.state == TransactionState::InProgress {
            let dropped_session = DroppedClientSession {
                cluster_time: self.cluster_time.clone(),
                operation_time: self.operation_time,
                server_session: self.server_session.clone(),
                client: self.client.clone(),
                options: self.options.clone(),
                transaction: self.transaction.clone(),
            };
            crate::runtime::spawn(async move {
                let mut session: ClientSession = dropped_session.into();
                let _result = session.abort_transaction().await;
            });
        } else {
            let client = self.client.clone();
            let server_session = self.server_session.clone();
            crate::runtime::spawn(async move {
                client.check_in_server_session(server_session).await;
            });
        }
    }
}

/// Client side abstraction of a server session. These are pooled and may be associated with
/// multiple `ClientSession`s over the course of their lifetime.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    pub(crate) last_use: Instant,

    /// Whether a network error was encountered while using this session.
    pub(crate) dirty: bool,

    /// A monotonically increasing transaction number for this session.
    pub(crate) txn_number: i64,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    pub(super) fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Determines if this server session is about to expire in a short amount of time (1
    /// minute).
    pub(super) fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let timeout = match logical_session_timeout {
            Some(t) => t,
            None => return false,
        };
        let expiration_date = self.last_use + timeout;
        expiration_date < Instant::now() + Duration::from_secs(60)
    }
}

/// Attach the session's identity and transaction fields to an outgoing command.
pub(crate) fn attach_session_fields(
    command: &mut Command,
    session: &mut ClientSession,
    topology_cluster_time: Option<&ClusterTime>,
) {
    command.set_session_id(session.id());

    // Gossip the highest cluster time seen by either the session or the topology.
    let session_time = session.cluster_time().cloned();
    let cluster_time = match (session_time, topology_cluster_time) {
        (Some(s), Some(t)) => Some(std::cmp::max(s, t.clone())),
        (Some(s), None) => Some(s),
        (None, Some(t)) => Some(t.clone()),
        (None, None) => None,
    };
    if let Some(ref cluster_time) = cluster_time {
        command.set_cluster_time(cluster_time);
    }

    match session.transaction.state {
        TransactionState::Starting => {
            command.set_txn_number(session.txn_number());
            command.set_start_transaction();
            command.set_autocommit();
            if let Some(read_concern) = session
                .transaction
                .options
                .as_ref()
                .and_then(|o| o.read_concern.as_ref())
            {
                command.set_read_concern(read_concern);
            }
        }
        TransactionState::InProgress => {
            command.set_txn_number(session.txn_number());
            command.set_autocommit();
        }
        _ => {}
    }

    session.update_last_use();
}

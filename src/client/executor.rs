use std::time::{Duration, Instant};

use bson::{Document, Timestamp};
use serde::Deserialize;

use super::session::{attach_session_fields, ClientSession, ClusterTime, TransactionState};
use crate::{
    cmap::{next_request_id, Command, PooledConnection, RawCommandResponse},
    error::{
        CommandError,
        Error,
        ErrorKind,
        Result,
        RETRYABLE_WRITE_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    event::command::{CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent},
    options::ServerAddress,
    runtime::TimeoutContext,
    sdam::{HandshakePhase, TopologyType, TopologyVersion},
    selection_criteria::{ReadPreference, SelectionCriteria},
    Client,
};

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether an operation may be retried on a newly selected server after a retryable failure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Retryability {
    Write,
    /// Reserved for the read paths of higher driver layers; `run_command` itself never
    /// retries reads.
    #[allow(dead_code)]
    Read,
    None,
}

/// The portion of a command response that drives error mapping, session gossip, and sharded
/// transaction bookkeeping.
#[derive(Debug, Deserialize)]
struct CommandStatus {
    ok: bson::Bson,

    code: Option<i32>,

    #[serde(rename = "codeName")]
    code_name: Option<String>,

    errmsg: Option<String>,

    #[serde(rename = "errorLabels")]
    error_labels: Option<Vec<String>>,

    #[serde(rename = "$clusterTime")]
    cluster_time: Option<ClusterTime>,

    #[serde(rename = "operationTime")]
    operation_time: Option<Timestamp>,

    #[serde(rename = "recoveryToken")]
    recovery_token: Option<Document>,

    #[serde(rename = "topologyVersion")]
    topology_version: Option<TopologyVersion>,
}

impl CommandStatus {
    fn is_success(&self) -> bool {
        matches!(self.ok.as_f64(), Some(f) if f == 1.0)
            || matches!(self.ok.as_i32(), Some(1))
            || matches!(self.ok.as_i64(), Some(1))
            || matches!(self.ok.as_bool(), Some(true))
    }

    fn into_error(self) -> Error {
        Error::new(
            ErrorKind::Command(CommandError {
                code: self.code.unwrap_or(0),
                code_name: self.code_name.unwrap_or_default(),
                message: self.errmsg.unwrap_or_default(),
                topology_version: self.topology_version,
            }),
            self.error_labels,
        )
    }
}

impl Client {
    /// Run a raw database command against a server chosen by `criteria`, attaching session,
    /// cluster-time, and transaction fields as appropriate. This is the primitive on which
    /// higher driver layers build their operations.
    pub async fn run_command(
        &self,
        db: impl AsRef<str>,
        body: Document,
        criteria: impl Into<Option<SelectionCriteria>>,
        mut session: Option<&mut ClientSession>,
    ) -> Result<Document> {
        let name = body
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| Error::invalid_argument("command document must not be empty"))?;
        let command = Command::new(name, db.as_ref(), body);
        let response = self
            .execute_command(command, session.as_deref_mut(), criteria.into(), Retryability::None)
            .await?;
        response.to_document()
    }

    /// Execute a command, retrying at most once on a newly selected server when the failure is
    /// retryable and the operation's retryability allows it.
    pub(crate) async fn execute_command(
        &self,
        command: Command,
        mut session: Option<&mut ClientSession>,
        criteria: Option<SelectionCriteria>,
        retryability: Retryability,
    ) -> Result<RawCommandResponse> {
        if let Some(ref session) = session {
            if !std::sync::Arc::ptr_eq(&self.inner, &session.client().inner) {
                return Err(Error::session_usage(
                    "the session was started by a different client",
                ));
            }
        }

        let timeout_ctx = TimeoutContext::new(self.inner.options.timeout);
        let base_criteria = criteria
            .or_else(|| self.inner.options.selection_criteria.clone())
            .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary));

        // A session pinned to a mongos routes every statement of its transaction there.
        let effective_criteria = match session
            .as_ref()
            .filter(|s| s.in_transaction())
            .and_then(|s| s.pinned_mongos().cloned())
        {
            Some(address) => SelectionCriteria::from_address(address),
            None => base_criteria.clone(),
        };

        let first_attempt = self
            .execute_command_once(
                command.clone(),
                &mut session,
                &effective_criteria,
                &timeout_ctx,
                None,
                retryability,
            )
            .await;

        let (error, failed_address) = match first_attempt {
            Ok(response) => return Ok(response),
            Err(AttemptError { error, address }) => (error, address),
        };

        let retryable = match retryability {
            Retryability::Write => {
                self.inner.options.retry_writes != Some(false)
                    && (error.is_write_retryable() || error.is_pool_cleared())
            }
            Retryability::Read => {
                self.inner.options.retry_reads != Some(false)
                    && (error.is_read_retryable() || error.is_pool_cleared())
            }
            Retryability::None => false,
        };
        if !retryable || timeout_ctx.deadline().has_expired() {
            return Err(error);
        }

        // Retry exactly once, preferring a different server than the one that failed.
        match self
            .execute_command_once(
                command,
                &mut session,
                &base_criteria,
                &timeout_ctx,
                failed_address.as_ref(),
                retryability,
            )
            .await
        {
            Ok(response) => Ok(response),
            Err(AttemptError { error: retry_error, .. }) => {
                Err(retry_error.with_source(error))
            }
        }
    }

    /// Execute a commit or abort for a sharded transaction: the pinned mongos is tried first,
    /// and on a retryable failure the command is retried once on any other mongos with the
    /// session's recovery token attached.
    pub(crate) async fn execute_transaction_command(
        &self,
        command: Command,
        session: &mut ClientSession,
        pinned: Option<ServerAddress>,
    ) -> Result<RawCommandResponse> {
        let is_commit = command.name == "commitTransaction";
        let timeout_ctx = TimeoutContext::new(self.inner.options.timeout);
        let base_criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let pinned_criteria = pinned
            .map(SelectionCriteria::from_address)
            .unwrap_or_else(|| base_criteria.clone());

        let mut session_opt = Some(&mut *session);
        let first_attempt = self
            .execute_command_once(
                command.clone(),
                &mut session_opt,
                &pinned_criteria,
                &timeout_ctx,
                None,
                Retryability::Write,
            )
            .await;

        let (mut error, failed_address) = match first_attempt {
            Ok(response) => return Ok(response),
            Err(AttemptError { error, address }) => (error, address),
        };

        if !(error.is_write_retryable() || error.is_pool_cleared()) {
            if is_commit && error.should_add_unknown_transaction_commit_result_label() {
                error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
            }
            return Err(error);
        }

        // The session stays pinned: a successful retry on another mongos leaves the
        // transaction owned by this session either way, and the recovery token returned by the
        // first attempt (if any) has been stored on the session by now.
        let mut command = command;
        if let Some(ref token) = session.transaction.recovery_token {
            command.set_recovery_token(token);
        }

        let mut session_opt = Some(&mut *session);
        match self
            .execute_command_once(
                command,
                &mut session_opt,
                &base_criteria,
                &timeout_ctx,
                failed_address.as_ref(),
                Retryability::Write,
            )
            .await
        {
            Ok(response) => Ok(response),
            Err(AttemptError {
                error: mut retry_error,
                ..
            }) => {
                if is_commit && retry_error.should_add_unknown_transaction_commit_result_label() {
                    retry_error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                }
                Err(retry_error.with_source(error))
            }
        }
    }

    async fn execute_command_once(
        &self,
        command: Command,
        session: &mut Option<&mut ClientSession>,
        criteria: &SelectionCriteria,
        timeout_ctx: &TimeoutContext,
        deprioritized: Option<&ServerAddress>,
        retryability: Retryability,
    ) -> std::result::Result<RawCommandResponse, AttemptError> {
        let selection_timeout = self
            .inner
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let selection_deadline = timeout_ctx.server_selection_deadline(selection_timeout);

        let server = self
            .inner
            .topology
            .select_server(criteria, &command.name, selection_deadline, deprioritized)
            .await
            .map_err(AttemptError::before_selection)?;
        let address = server.address().clone();

        let checkout_deadline =
            timeout_ctx.checkout_deadline(self.inner.options.wait_queue_timeout);
        let mut conn = match server.pool.check_out(checkout_deadline).await {
            Ok(conn) => conn,
            Err(error) => {
                return Err(AttemptError::at(error, address));
            }
        };

        let mut command = command;
        if let Some(session) = session.as_deref_mut() {
            attach_session_fields(
                &mut command,
                session,
                self.inner.topology.cluster_time().as_ref(),
            );
        }
        self.inner
            .topology
            .attach_read_preference(&address, &mut command, Some(criteria));

        if let Some(max_time) = timeout_ctx.remaining_max_time() {
            command.set_max_time_ms(max_time);
        }
        if timeout_ctx.is_set() {
            // Avoid double timeouts on the server: maxTimeMS already bounds the operation.
            if let Ok(write_concern) = command.body.get_document_mut("writeConcern") {
                write_concern.remove("wtimeout");
            }
        }

        let request_id = next_request_id();
        let command_name = command.name.clone();
        let started_body = command.body.clone();
        let target_db = command.target_db.clone();
        self.inner.command_event_emitter.emit_event(|| {
            CommandStartedEvent {
                command: started_body,
                db: target_db,
                command_name: command_name.clone(),
                request_id,
                connection: conn.info(),
            }
            .into()
        });

        let start = Instant::now();
        let response = conn.send_command(command).await;
        let duration = start.elapsed();

        match response {
            Err(mut error) => {
                self.emit_failed_event(&conn, &command_name, request_id, duration, &error);

                if let Some(session) = session.as_deref_mut() {
                    if error.is_network_error() {
                        session.mark_dirty();
                    }
                }

                if retryability == Retryability::Write {
                    let wire_version = conn
                        .stream_description
                        .as_ref()
                        .and_then(|sd| sd.max_wire_version)
                        .unwrap_or(0);
                    if error.should_add_retryable_write_label(wire_version) {
                        error.add_label(RETRYABLE_WRITE_ERROR);
                    }
                }

                let phase = HandshakePhase::after_completion(&conn);
                drop(conn);
                self.inner
                    .topology
                    .handle_application_error(address.clone(), error.clone(), phase)
                    .await;

                Err(AttemptError::at(error, address))
            }
            Ok(raw_response) => {
                let status: CommandStatus = match raw_response.body() {
                    Ok(status) => status,
                    Err(error) => {
                        self.emit_failed_event(
                            &conn,
                            &command_name,
                            request_id,
                            duration,
                            &error,
                        );
                        return Err(AttemptError::at(error, address));
                    }
                };

                self.gossip_response(session, &address, &status).await;

                if status.is_success() {
                    if let Some(session) = session.as_deref_mut() {
                        if session.transaction.state == TransactionState::Starting {
                            session.transaction.state = TransactionState::InProgress;
                        }
                    }

                    let reply = raw_response.to_document().unwrap_or_default();
                    self.inner.command_event_emitter.emit_event(|| {
                        CommandSucceededEvent {
                            duration,
                            reply,
                            command_name: command_name.clone(),
                            request_id,
                            connection: conn.info(),
                        }
                        .into()
                    });

                    Ok(raw_response)
                } else {
                    let mut error = status.into_error();
                    error.wire_version = conn
                        .stream_description
                        .as_ref()
                        .and_then(|sd| sd.max_wire_version);

                    if retryability == Retryability::Write
                        && error.should_add_retryable_write_label(
                            error.wire_version.unwrap_or(0),
                        )
                    {
                        error.add_label(RETRYABLE_WRITE_ERROR);
                    }

                    self.emit_failed_event(&conn, &command_name, request_id, duration, &error);

                    if error.is_state_change_error() {
                        let phase = HandshakePhase::after_completion(&conn);
                        drop(conn);
                        self.inner
                            .topology
                            .handle_application_error(address.clone(), error.clone(), phase)
                            .await;
                    }

                    Err(AttemptError::at(error, address))
                }
            }
        }
    }

    /// Fold the server-reported times and tokens from a response into the topology and the
    /// session.
    async fn gossip_response(
        &self,
        session: &mut Option<&mut ClientSession>,
        address: &ServerAddress,
        status: &CommandStatus,
    ) {
        if let Some(ref cluster_time) = status.cluster_time {
            self.inner.topology.advance_cluster_time(cluster_time.clone());
        }

        if let Some(session) = session.as_deref_mut() {
            if let Some(ref cluster_time) = status.cluster_time {
                session.advance_cluster_time(cluster_time);
            }
            if let Some(operation_time) = status.operation_time {
                session.advance_operation_time(operation_time);
            }
            if session.in_transaction() {
                if let Some(ref token) = status.recovery_token {
                    session.transaction.recovery_token = Some(token.clone());
                }
                // The first statement of a transaction in a sharded cluster pins the session
                // to the mongos it ran on.
                if self.inner.topology.topology_type() == TopologyType::Sharded
                    && session.pinned_mongos().is_none()
                {
                    session.pin_mongos(address.clone());
                }
            } else if let Some(ref token) = status.recovery_token {
                // commitTransaction/abortTransaction responses refresh the token too.
                session.transaction.recovery_token = Some(token.clone());
            }
        }
    }

    fn emit_failed_event(
        &self,
        conn: &PooledConnection,
        command_name: &str,
        request_id: i32,
        duration: Duration,
        error: &Error,
    ) {
        let command_name = command_name.to_string();
        let failure = error.clone();
        let connection = conn.info();
        self.inner.command_event_emitter.emit_event(|| {
            CommandFailedEvent {
                duration,
                command_name,
                failure,
                request_id,
                connection,
            }
            .into()
        });
    }
}

/// An error from a single execution attempt, along with the server it occurred on if one had
/// been selected.
struct AttemptError {
    error: Error,
    address: Option<ServerAddress>,
}

impl AttemptError {
    fn before_selection(error: Error) -> Self {
        Self {
            error,
            address: None,
        }
    }

    fn at(error: Error, address: ServerAddress) -> Self {
        Self {
            error,
            address: Some(address),
        }
    }
}

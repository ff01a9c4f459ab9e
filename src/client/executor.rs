use std::time::Instant;

use bson::Document;

use super::{session::ServerSession, Client};
use crate::{
    bson_util,
    client::session::ClusterTime,
    cmap::{conn::wire::next_request_id, conn::wire::Message, Connection},
    error::{
        Error,
        ErrorKind,
        Result,
        NETWORK_ERROR,
        RETRYABLE_WRITE_ERROR,
    },
    event::command::{
        CommandEvent,
        CommandFailedEvent,
        CommandStartedEvent,
        CommandSucceededEvent,
    },
    operation::{CommandErrorBody, Operation, Retryability},
    options::ServerAddress,
    sdam::HandshakePhase,
};

impl Client {
    /// Execute the given operation.
    ///
    /// Server selection will be performed using the criteria specified on the operation, if
    /// any, and an implicit session will be acquired if the operation supports sessions.
    pub(crate) async fn execute_operation<T: Operation>(&self, op: &mut T) -> Result<T::O> {
        if self.is_shutdown() {
            return Err(ErrorKind::Shutdown.into());
        }

        self.execute_operation_with_retry(op).await
    }

    /// Selects a server and executes the given operation on it, retrying the operation once
    /// upon failure if retryability is supported.
    async fn execute_operation_with_retry<T: Operation>(&self, op: &mut T) -> Result<T::O> {
        let mut retry: Option<ExecutionRetry> = None;

        loop {
            if retry.is_some() {
                op.update_for_retry();
            }

            let server = match self
                .select_server(
                    op.selection_criteria(),
                    op.name(),
                    retry.as_ref().map(|r| &r.first_server),
                )
                .await
            {
                Ok(server) => server,
                Err(err) => {
                    retry.first_error()?;
                    return Err(err);
                }
            };
            let server_addr = server.address.clone();

            let mut conn = match server.pool.check_out().await {
                Ok(conn) => conn,
                Err(mut err) => {
                    retry.first_error()?;

                    if err.is_read_retryable()
                        && self.options().retry_writes != Some(false)
                    {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }

                    let op_retry = match self.get_op_retryability(op) {
                        Retryability::Read => err.is_read_retryable(),
                        Retryability::Write => err.is_write_retryable(),
                        _ => false,
                    };
                    if err.is_pool_cleared() || op_retry {
                        retry = Some(ExecutionRetry {
                            prior_txn_number: None,
                            first_error: err,
                            first_server: server_addr.clone(),
                        });
                        continue;
                    } else {
                        return Err(err);
                    }
                }
            };

            // Acquire an implicit session when the operation and the server support them;
            // retryable writes require one to carry the transaction number.
            let mut session: Option<ServerSession> =
                if op.supports_sessions() && conn.stream_description()?.supports_sessions() {
                    Some(
                        self.inner
                            .session_pool
                            .check_out(self.inner.topology.logical_session_timeout()),
                    )
                } else {
                    None
                };

            let retryability = self.get_retryability(&conn, op)?;
            if retryability == Retryability::None {
                retry.first_error()?;
            }

            let txn_number = retry
                .as_ref()
                .and_then(|r| r.prior_txn_number)
                .or_else(|| match (session.as_mut(), retryability) {
                    (Some(session), Retryability::Write) => {
                        Some(session.get_and_increment_txn_number())
                    }
                    _ => None,
                });

            let result = self
                .execute_operation_on_connection(
                    op,
                    &mut conn,
                    session.as_mut(),
                    txn_number,
                    retryability,
                )
                .await;

            let logical_session_timeout = self.inner.topology.logical_session_timeout();

            match result {
                Ok(output) => {
                    if let Some(session) = session.take() {
                        self.inner
                            .session_pool
                            .check_in(session, logical_session_timeout);
                    }
                    return Ok(output);
                }
                Err(mut err) => {
                    err.wire_version = conn.stream_description()?.max_wire_version;
                    self.add_error_labels(&conn, retryability, &mut err)?;

                    if err.is_network_error() {
                        if let Some(ref mut session) = session {
                            session.mark_dirty();
                        }
                    }
                    if let Some(session) = session.take() {
                        self.inner
                            .session_pool
                            .check_in(session, logical_session_timeout);
                    }

                    self.inner
                        .topology
                        .handle_application_error(
                            server_addr.clone(),
                            err.clone(),
                            HandshakePhase::after_completion(&conn),
                        )
                        .await;
                    // Release the connection to be processed by the connection pool.
                    drop(conn);
                    // Release the selected server to decrement its operation count.
                    drop(server);

                    if let Some(r) = retry {
                        // A second failure never triggers another attempt; surface whichever
                        // error is more meaningful.
                        if err.is_server_error()
                            || err.is_read_retryable()
                            || err.is_write_retryable()
                        {
                            return Err(err);
                        } else {
                            return Err(r.first_error);
                        }
                    } else if retryability == Retryability::Read && err.is_read_retryable()
                        || retryability == Retryability::Write && err.is_write_retryable()
                    {
                        // Reuse the transaction number so the server deduplicates the write.
                        retry = Some(ExecutionRetry {
                            prior_txn_number: txn_number,
                            first_error: err,
                            first_server: server_addr.clone(),
                        });
                        continue;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Executes an operation on a given connection.
    async fn execute_operation_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut Connection,
        session: Option<&mut ServerSession>,
        txn_number: Option<i64>,
        _retryability: Retryability,
    ) -> Result<T::O> {
        let stream_description = connection.stream_description()?.clone();
        let mut cmd = op.build(&stream_description)?;

        self.inner
            .topology
            .watch()
            .peek_latest()
            .description
            .update_command_with_read_pref(
                connection.address(),
                &mut cmd,
                op.selection_criteria()
                    .or(self.options().selection_criteria.as_ref()),
            );

        if let Some(session) = session {
            cmd.set_session(session);
            if let Some(txn_number) = txn_number {
                cmd.set_txn_number(txn_number);
            }
            session.update_last_use();
        }

        if let Some(cluster_time) = self.inner.topology.cluster_time() {
            cmd.set_cluster_time(&cluster_time);
        }

        let connection_info = connection.info();
        let service_id = connection.service_id();
        let request_id = next_request_id();

        let should_redact = cmd.should_redact();
        let should_compress = cmd.should_compress();

        let cmd_name = cmd.name.clone();
        let target_db = cmd.target_db.clone();

        let message = Message::from_command(cmd, Some(request_id));

        self.inner.command_event_emitter.emit_event(|| {
            let command_body = if should_redact {
                Document::new()
            } else {
                message.get_command_document()
            };
            CommandEvent::Started(CommandStartedEvent {
                command: command_body,
                db: target_db.clone(),
                command_name: cmd_name.clone(),
                request_id,
                connection: connection_info.clone(),
                service_id,
            })
        });

        let start_time = Instant::now();

        let command_result = match connection.send_message(message, should_compress).await {
            Ok(response) => {
                let raw_doc = response.raw_document();

                let ok = match raw_doc.get("ok").and_then(bson_util::get_int) {
                    Some(ok) => ok,
                    None => {
                        return Err(ErrorKind::InvalidResponse {
                            message: "missing 'ok' value in response".to_string(),
                        }
                        .into())
                    }
                };

                let cluster_time: Option<ClusterTime> = raw_doc
                    .get_document("$clusterTime")
                    .ok()
                    .and_then(|doc| bson::from_document(doc.clone()).ok());
                if let Some(cluster_time) = cluster_time {
                    self.inner.topology.advance_cluster_time(cluster_time).await;
                }

                if ok == 1 {
                    Ok(response)
                } else {
                    Err(response
                        .body::<CommandErrorBody>()
                        .map(|error_response| error_response.into())
                        .unwrap_or_else(|e| {
                            Error::from(ErrorKind::InvalidResponse {
                                message: format!("error deserializing command error: {}", e),
                            })
                        }))
                }
            }
            Err(err) => Err(err),
        };

        let duration = start_time.elapsed();

        match command_result {
            Err(err) => {
                self.inner.command_event_emitter.emit_event(|| {
                    let mut event_failure = err.clone();
                    if should_redact {
                        event_failure.redact();
                    }
                    CommandEvent::Failed(CommandFailedEvent {
                        duration,
                        command_name: cmd_name.clone(),
                        failure: event_failure,
                        request_id,
                        connection: connection_info.clone(),
                        service_id,
                    })
                });

                op.handle_error(err)
            }
            Ok(response) => {
                self.inner.command_event_emitter.emit_event(|| {
                    let reply = if should_redact {
                        Document::new()
                    } else {
                        response.raw_document().clone()
                    };
                    CommandEvent::Succeeded(CommandSucceededEvent {
                        duration,
                        reply,
                        command_name: cmd_name.clone(),
                        request_id,
                        connection: connection_info.clone(),
                        service_id,
                    })
                });

                op.handle_response(response, &stream_description)
            }
        }
    }

    /// Returns the retryability level for the execution of this operation, taking the client
    /// options into account.
    fn get_op_retryability<T: Operation>(&self, op: &T) -> Retryability {
        match op.retryability() {
            Retryability::Read if self.options().retry_reads != Some(false) => Retryability::Read,
            Retryability::Write if self.options().retry_writes != Some(false) => {
                Retryability::Write
            }
            _ => Retryability::None,
        }
    }

    /// Returns the retryability level for the execution of this operation on this connection.
    fn get_retryability<T: Operation>(
        &self,
        conn: &Connection,
        op: &T,
    ) -> Result<Retryability> {
        match self.get_op_retryability(op) {
            Retryability::Read => Ok(Retryability::Read),
            Retryability::Write if conn.stream_description()?.supports_retryable_writes() => {
                Ok(Retryability::Write)
            }
            _ => Ok(Retryability::None),
        }
    }

    /// Adds the necessary labels to the given error.
    ///
    /// On a pre-4.4 connection, a RetryableWriteError label should be added to any
    /// write-retryable error. On a 4.4+ connection, a label should only be added to network
    /// errors, since the server applies the label to command errors itself.
    fn add_error_labels(
        &self,
        conn: &Connection,
        retryability: Retryability,
        error: &mut Error,
    ) -> Result<()> {
        if error.is_network_io_error() {
            error.add_label(NETWORK_ERROR);
        }

        if retryability == Retryability::Write {
            if let Some(max_wire_version) = conn.stream_description()?.max_wire_version {
                if error.should_add_retryable_write_label(max_wire_version) {
                    error.add_label(RETRYABLE_WRITE_ERROR);
                }
            }
        }

        Ok(())
    }
}

/// State tracked for the single retry an operation is allowed.
#[derive(Debug)]
struct ExecutionRetry {
    prior_txn_number: Option<i64>,
    first_error: Error,
    first_server: ServerAddress,
}

trait RetryHelper {
    fn first_error(&mut self) -> Result<()>;
}

impl RetryHelper for Option<ExecutionRetry> {
    fn first_error(&mut self) -> Result<()> {
        match self.take() {
            Some(r) => Err(r.first_error),
            None => Ok(()),
        }
    }
}

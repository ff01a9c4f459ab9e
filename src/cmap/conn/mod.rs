mod command;
mod stream_description;
pub(crate) mod wire;

use std::time::{Duration, Instant};

use bson::oid::ObjectId;
use tokio::io::BufStream;

use self::wire::{Message, MessageFlags};
use super::{
    manager::PoolManager,
    worker::PoolGeneration,
};
use crate::{
    error::{Error, ErrorKind, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionCreatedEvent,
        ConnectionReadyEvent,
    },
    options::ServerAddress,
    runtime::AsyncStream,
};
pub(crate) use command::{Command, RawCommandResponse, REDACTED_COMMANDS};
pub(crate) use stream_description::StreamDescription;

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use crate::compression::Compressor;

/// User-facing information about a connection to the database.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A driver-generated identifier that uniquely identifies the connection.
    pub id: u32,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// The generation a connection was created at, compared against the owning pool's current
/// generation to detect staleness.
#[derive(Debug, Clone)]
pub(crate) enum ConnectionGeneration {
    /// The connection does not belong to a pool.
    Monitoring,

    Normal(u32),

    LoadBalanced {
        generation: u32,
        service_id: ObjectId,
    },
}

impl ConnectionGeneration {
    pub(crate) fn is_stale(&self, current_generation: &PoolGeneration) -> bool {
        match (self, current_generation) {
            (ConnectionGeneration::Monitoring, _) => false,
            (ConnectionGeneration::Normal(cgen), PoolGeneration::Normal(pgen)) => cgen != pgen,
            (
                ConnectionGeneration::LoadBalanced {
                    generation,
                    service_id,
                },
                PoolGeneration::LoadBalanced(gen_map),
            ) => generation != gen_map.get(service_id).unwrap_or(&0),
            _ => crate::error::load_balanced_mode_mismatch!(false),
        }
    }

    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        match self {
            ConnectionGeneration::LoadBalanced { service_id, .. } => Some(*service_id),
            _ => None,
        }
    }
}

/// A connection that has been created by a pool but not yet established.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: PoolGeneration,
    pub(crate) event_emitter: CmapEventEmitter,
    pub(crate) time_created: Instant,
}

impl PendingConnection {
    /// Helper to create a `ConnectionCreatedEvent` for the connection.
    pub(super) fn created_event(&self) -> ConnectionCreatedEvent {
        ConnectionCreatedEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }
}

/// An established connection to a server, carrying the authenticated, framed byte channel and
/// the pool bookkeeping required to return it or discard it.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: ConnectionGeneration,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// The compressor negotiated during the handshake, if any.
    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    pub(crate) compressor: Option<Compressor>,

    /// Marks the time when the connection was last checked into the pool. This is used to
    /// detect if the connection is idle.
    ready_and_available_time: Option<Instant>,

    /// When the connection is checked out of a pool, a manager is attached so that dropping the
    /// connection returns it to the pool. When it's checked into the pool, this is `None`.
    pool_manager: Option<PoolManager>,

    /// Whether a request has been sent and its reply not yet fully read. A connection dropped
    /// in this state cannot be reused, since the socket may contain a partial reply.
    command_executing: bool,

    /// The most recent error the connection observed, if any. Errored connections are discarded
    /// rather than returned to the idle set.
    error: Option<Error>,

    /// Whether the server holds the reply stream open and will push more replies for the most
    /// recent request.
    more_to_come: bool,

    time_created: Instant,

    stream: BufStream<AsyncStream>,

    /// The emitter for connection lifecycle events; `None` for monitoring connections.
    event_emitter: Option<CmapEventEmitter>,

    socket_timeout: Option<Duration>,
}

impl Connection {
    pub(crate) fn new(
        pending: PendingConnection,
        stream: AsyncStream,
        socket_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id: pending.id,
            address: pending.address,
            generation: match pending.generation {
                PoolGeneration::Normal(gen) => ConnectionGeneration::Normal(gen),
                // The service-scoped generation is pinned once the handshake reveals the
                // backend's id.
                PoolGeneration::LoadBalanced(_) => ConnectionGeneration::Monitoring,
            },
            stream_description: None,
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressor: None,
            ready_and_available_time: None,
            pool_manager: None,
            command_executing: false,
            error: None,
            more_to_come: false,
            time_created: pending.time_created,
            stream: BufStream::new(stream),
            event_emitter: Some(pending.event_emitter),
            socket_timeout,
        }
    }

    /// Constructs a connection that is not tied to any pool, used for monitoring.
    pub(crate) fn new_monitoring(address: ServerAddress, stream: AsyncStream) -> Self {
        Self {
            id: 0,
            address,
            generation: ConnectionGeneration::Monitoring,
            stream_description: None,
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressor: None,
            ready_and_available_time: None,
            pool_manager: None,
            command_executing: false,
            error: None,
            more_to_come: false,
            time_created: Instant::now(),
            stream: BufStream::new(stream),
            event_emitter: None,
            socket_timeout: None,
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        self.generation.service_id()
    }

    /// Helper to mark the time that the connection was checked into the pool for the purpose of
    /// detecting when it becomes idle.
    pub(super) fn mark_as_available(&mut self) {
        self.pool_manager.take();
        self.ready_and_available_time = Some(Instant::now());
    }

    /// Helper to mark that the connection has been checked out of the pool, attaching a manager
    /// so the connection can return itself to the pool when dropped.
    pub(super) fn mark_as_in_use(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
        self.ready_and_available_time.take();
    }

    /// Checks if the connection is idle.
    pub(super) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    /// Whether a reply is (or may still be) outstanding on this connection's socket.
    pub(super) fn is_executing(&self) -> bool {
        self.command_executing
    }

    pub(super) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the server indicated more replies are incoming for the last request.
    pub(crate) fn is_streaming(&self) -> bool {
        self.more_to_come
    }

    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "Stream checked out but not handshaked".to_string(),
            }
            .into()
        })
    }

    /// Sends a message on this connection and reads the single reply to it.
    ///
    /// An `Ok(...)` result simply means the server received the command and that the driver
    /// received the response; it does not imply anything about the success of the command
    /// itself.
    pub(crate) async fn send_message(
        &mut self,
        mut message: Message,
        can_compress: bool,
    ) -> Result<RawCommandResponse> {
        if self.more_to_come {
            return Err(Error::internal(format!(
                "attempted to send a new message to {} but moreToCome bit was set",
                self.address()
            )));
        }

        let request_id = message
            .request_id
            .unwrap_or_else(wire::next_request_id);
        message.request_id = Some(request_id);

        #[cfg(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        ))]
        let compressor = if can_compress {
            self.compressor.clone()
        } else {
            None
        };
        #[cfg(not(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        )))]
        let _ = can_compress;

        let socket_timeout = self.socket_timeout;
        self.command_executing = true;

        let stream = &mut self.stream;
        let round_trip = async move {
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            match compressor {
                Some(ref compressor) => {
                    message.write_op_compressed_to(stream, compressor).await?
                }
                None => message.write_to(stream).await?,
            }

            #[cfg(not(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            )))]
            message.write_to(stream).await?;

            Message::read_from(stream).await
        };

        let response_message_result = match socket_timeout {
            Some(timeout) => match crate::runtime::timeout(timeout, round_trip).await {
                Ok(result) => result,
                Err(timeout_error) => Err(timeout_error),
            },
            None => round_trip.await,
        };

        self.command_executing = false;

        let response_message = match response_message_result {
            Ok(response_message) => response_message,
            Err(error) => {
                self.error = Some(error.clone());
                return Err(error);
            }
        };

        if response_message.response_to != request_id {
            let error = Error::invalid_response(format!(
                "expected a response to request {}, but got a response to request {}",
                request_id, response_message.response_to
            ));
            self.error = Some(error.clone());
            return Err(error);
        }

        self.more_to_come = response_message.is_exhaust();

        Ok(RawCommandResponse::new(
            self.address.clone(),
            response_message.single_document_response(),
        ))
    }

    /// Sends a command on this connection and reads the reply.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
    ) -> Result<RawCommandResponse> {
        let message = Message::from_command(command, request_id.into());
        self.send_message(message, false).await
    }

    /// Receive the next message from a stream of replies to a previously-issued exhaust
    /// request. Returns an error if the server did not indicate more replies were incoming.
    pub(crate) async fn receive_message(&mut self) -> Result<RawCommandResponse> {
        if !self.more_to_come {
            return Err(Error::internal(format!(
                "attempted to stream a response from {} but moreToCome bit was not set",
                self.address()
            )));
        }

        self.command_executing = true;
        let response_message_result = Message::read_from(&mut self.stream).await;
        self.command_executing = false;

        let response_message = match response_message_result {
            Ok(response_message) => response_message,
            Err(error) => {
                self.error = Some(error.clone());
                return Err(error);
            }
        };

        self.more_to_come = response_message
            .flags
            .contains(MessageFlags::MORE_TO_COME);

        Ok(RawCommandResponse::new(
            self.address.clone(),
            response_message.single_document_response(),
        ))
    }

    /// Helper to create a `ConnectionCheckedOutEvent` for the connection.
    pub(super) fn checked_out_event(&self) -> ConnectionCheckedOutEvent {
        ConnectionCheckedOutEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    /// Helper to create a `ConnectionCheckedInEvent` for the connection.
    pub(super) fn checked_in_event(&self) -> ConnectionCheckedInEvent {
        ConnectionCheckedInEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    /// Helper to create a `ConnectionReadyEvent` for the connection.
    pub(super) fn ready_event(&self) -> ConnectionReadyEvent {
        ConnectionReadyEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    fn closed_event(&self, reason: ConnectionClosedReason) -> ConnectionClosedEvent {
        ConnectionClosedEvent {
            address: self.address.clone(),
            connection_id: self.id,
            reason,
        }
    }

    /// Close this connection, emitting a `ConnectionClosedEvent` with the supplied reason.
    pub(super) fn close_and_drop(mut self, reason: ConnectionClosedReason) {
        self.close(reason);
    }

    fn close(&mut self, reason: ConnectionClosedReason) {
        self.pool_manager.take();
        if let Some(emitter) = self.event_emitter.take() {
            emitter.emit_event(|| self.closed_event(reason).into());
        }
    }

    /// Nullify the inner state and return it in a new `Connection` for checking back in to
    /// the pool from a `Drop` implementation.
    fn take(&mut self) -> Connection {
        Connection {
            id: self.id,
            address: self.address.clone(),
            generation: self.generation.clone(),
            stream_description: self.stream_description.take(),
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressor: self.compressor.take(),
            ready_and_available_time: None,
            pool_manager: None,
            command_executing: self.command_executing,
            error: self.error.take(),
            more_to_come: self.more_to_come,
            time_created: self.time_created,
            stream: std::mem::replace(&mut self.stream, BufStream::new(AsyncStream::Null)),
            event_emitter: self.event_emitter.take(),
            socket_timeout: self.socket_timeout,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // If the connection has a pool manager, that means that the connection is being dropped
        // while it's checked out. If the pool is still alive, it should check itself back in.
        // Otherwise, the connection should close itself and emit a ConnectionClosed event.
        if let Some(pool_manager) = self.pool_manager.take() {
            let conn = self.take();
            if let Err(mut conn) = pool_manager.check_in(conn) {
                conn.close(ConnectionClosedReason::PoolClosed);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn generation_staleness() {
        let generation = ConnectionGeneration::Normal(2);
        assert!(!generation.is_stale(&PoolGeneration::Normal(2)));
        assert!(generation.is_stale(&PoolGeneration::Normal(3)));

        assert!(!ConnectionGeneration::Monitoring.is_stale(&PoolGeneration::Normal(7)));
    }

    #[test]
    fn load_balanced_generations_are_per_service() {
        let service_a = ObjectId::new();
        let service_b = ObjectId::new();

        let mut gen_map = HashMap::new();
        gen_map.insert(service_a, 1);

        let stale = ConnectionGeneration::LoadBalanced {
            generation: 0,
            service_id: service_a,
        };
        assert!(stale.is_stale(&PoolGeneration::LoadBalanced(gen_map.clone())));

        let current = ConnectionGeneration::LoadBalanced {
            generation: 1,
            service_id: service_a,
        };
        assert!(!current.is_stale(&PoolGeneration::LoadBalanced(gen_map.clone())));

        // Clearing service A must not invalidate service B's connections.
        let other_service = ConnectionGeneration::LoadBalanced {
            generation: 0,
            service_id: service_b,
        };
        assert!(!other_service.is_stale(&PoolGeneration::LoadBalanced(gen_map)));
    }
}

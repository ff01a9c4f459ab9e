use std::time::Duration;

use bson::oid::ObjectId;

use crate::{hello::HelloReply, options::ServerAddress, sdam::ServerType};

/// Contains the handshake information about a given server needed by a connection to shape the
/// commands it sends.
#[derive(Debug, Clone)]
pub(crate) struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// How long sessions started on this server remain active after their most recent use.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The maximum size of writes (excluding command overhead) that should be sent to the
    /// server.
    pub(crate) max_bson_object_size: Option<i64>,

    /// The maximum size of wire protocol messages that can be sent to the server.
    pub(crate) max_message_size_bytes: Option<i32>,

    /// The maximum number of inserts, updates, or deletes that can be included in a write batch.
    pub(crate) max_write_batch_size: Option<i64>,

    /// The SASL mechanisms the server supports for the handshaking user, if any were
    /// negotiated.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// Whether the server understands the `hello` command.
    pub(crate) hello_ok: bool,

    /// If this connection is to a load balancer, the id of the selected backend.
    pub(crate) service_id: Option<ObjectId>,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(address: ServerAddress, reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            server_address: address,
            initial_server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            min_wire_version: response.min_wire_version,
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins as u64 * 60)),
            max_bson_object_size: response.max_bson_object_size,
            max_message_size_bytes: response.max_message_size_bytes,
            max_write_batch_size: response.max_write_batch_size,
            sasl_supported_mechs: response.sasl_supported_mechs.clone(),
            hello_ok: response.hello_ok == Some(true),
            service_id: response.service_id,
        }
    }

    /// Whether sessions (and therefore transaction numbers) are supported by this server.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    /// Whether this server can accept a transaction number to deduplicate retried writes.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.initial_server_type != ServerType::Standalone && self.supports_sessions()
    }

    /// Gets a description of a stream for a 4.2 connection. This should be used for testing
    /// purposes only.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self {
            server_address: ServerAddress::default(),
            initial_server_type: ServerType::RsPrimary,
            max_wire_version: Some(8),
            min_wire_version: Some(8),
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            max_bson_object_size: Some(16 * 1024 * 1024),
            max_message_size_bytes: Some(48_000_000),
            max_write_batch_size: Some(100_000),
            sasl_supported_mechs: None,
            hello_ok: false,
            service_id: None,
        }
    }
}

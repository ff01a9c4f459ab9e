use bson::oid::ObjectId;
use tokio::sync::mpsc;

use super::Connection;
use crate::{
    error::Error,
    runtime::{AcknowledgedMessage, AcknowledgmentReceiver},
};

/// Returns a new requester/receiver pair for pool management requests.
pub(super) fn channel() -> (PoolManager, ManagementRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        PoolManager { sender },
        ManagementRequestReceiver { receiver },
    )
}

/// Struct used to make management requests to the pool (e.g. checking in a connection).
/// A PoolManager will NOT keep a pool from going out of scope and closing.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    /// Lazily clear the pool.
    pub(super) fn clear(&self, cause: Error, service_id: Option<ObjectId>) {
        let _ = self.sender.send(PoolManagementRequest::Clear {
            cause,
            service_id,
        });
    }

    /// Mark the pool as ready, returning a future that can be awaited on until the pool worker
    /// has processed the request.
    pub(super) fn mark_as_ready(&self) -> AcknowledgmentReceiver<()> {
        let (message, acknowledgment_receiver) = AcknowledgedMessage::package(());
        let _ = self.sender.send(PoolManagementRequest::MarkAsReady {
            completion_handler: message,
        });
        acknowledgment_receiver
    }

    /// Check in the given connection to the pool. If the pool has been dropped, the connection
    /// is returned so the caller can close it.
    pub(crate) fn check_in(&self, connection: Connection) -> std::result::Result<(), Connection> {
        if let Err(request) = self
            .sender
            .send(PoolManagementRequest::CheckIn(Box::new(connection)))
        {
            let conn = request.0.unwrap_check_in();
            return Err(conn);
        }
        Ok(())
    }

    /// Notify the pool that establishment of a connection succeeded.
    pub(super) fn handle_connection_succeeded(&self, connection: ConnectionSucceeded) {
        let _ = self
            .sender
            .send(PoolManagementRequest::HandleConnectionSucceeded(connection));
    }

    /// Notify the pool that establishment of a connection failed.
    pub(super) fn handle_connection_failed(&self) {
        let _ = self.sender.send(PoolManagementRequest::HandleConnectionFailed);
    }
}

#[derive(Debug)]
pub(super) struct ManagementRequestReceiver {
    pub(super) receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}

/// The requests that a `PoolManager` can make of its pool.
#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    /// Clear the pool, transitioning it to Paused.
    Clear {
        cause: Error,
        service_id: Option<ObjectId>,
    },

    /// Mark the pool as Ready, allowing connections to be created and checked out.
    MarkAsReady {
        completion_handler: AcknowledgedMessage<()>,
    },

    /// Check in the given connection.
    CheckIn(Box<Connection>),

    /// Update the pool based on the given establishment success.
    HandleConnectionSucceeded(ConnectionSucceeded),

    /// Update the pool after an establishment failure.
    HandleConnectionFailed,
}

impl PoolManagementRequest {
    fn unwrap_check_in(self) -> Connection {
        match self {
            PoolManagementRequest::CheckIn(conn) => *conn,
            _ => panic!("tried to unwrap checkin but got {:?}", self),
        }
    }
}

/// The result of a successful connection establishment.
#[derive(Debug)]
pub(super) enum ConnectionSucceeded {
    /// The connection was handed directly to the requesting operation.
    Used { service_id: Option<ObjectId> },

    /// The connection was established in the background and should be stored in the pool.
    ForPool(Box<Connection>),
}

impl ConnectionSucceeded {
    pub(super) fn service_id(&self) -> Option<ObjectId> {
        match self {
            ConnectionSucceeded::Used { service_id, .. } => *service_id,
            ConnectionSucceeded::ForPool(conn) => conn.service_id(),
        }
    }
}

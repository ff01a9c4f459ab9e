//! Contains the events and functionality for monitoring behavior of the connection pooling of a
//! `Client`.

use std::sync::Arc;

use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::options::ServerAddress;

/// Event emitted when a connection pool is created.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool becomes ready.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolReadyEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool is cleared.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// If the pool is tied to a load balancer, only connections for this specific backend are
    /// invalidated.
    pub service_id: Option<ObjectId>,
}

/// Event emitted when a connection pool is closed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection is created.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection. This is not used for anything internally, but can be
    /// used to identify other events related to this connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is ready to be used. This indicates that all the necessary
/// prerequisites for using a connection (handshake, authentication, etc.) have been completed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The address of the server that the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection. This is not used for anything internally, but can be
    /// used to identify other events related to this connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection. This is not used for anything internally, but can be
    /// used to identify other events related to this connection.
    #[serde(default)]
    pub connection_id: u32,

    /// The reason that the connection was closed.
    pub reason: ConnectionClosedReason,
}

/// The reasons that a connection may be closed.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection pool has been cleared since the connection was created.
    Stale,

    /// The connection has been available for longer than `max_idle_time` without being used.
    Idle,

    /// An error occurred while using the connection.
    Error,

    /// The connection was dropped during read or write.
    Dropped,

    /// The pool that the connection belongs to has been closed.
    PoolClosed,
}

/// Event emitted when an operation begins checking out a connection to use.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,
}

/// Event emitted when an operation is unable to check out a connection.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server that the connection would have connected to.
    pub address: ServerAddress,

    /// The reason a connection was unable to be checked out.
    pub reason: ConnectionCheckoutFailedReason,
}

/// The reasons a connection may not be able to be checked out.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The connection pool was cleared or closed before the checkout could complete.
    PoolCleared,

    /// The timeout for checking out a connection elapsed while waiting for a connection to be
    /// available.
    Timeout,

    /// An error occurred while trying to establish a connection (e.g. during the handshake or
    /// authentication).
    ConnectionError,
}

/// Event emitted when a connection is successfully checked out.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection. This is not used for anything internally, but can be
    /// used to identify other events related to this connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is checked back into a connection pool.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection. This is not used for anything internally, but can be
    /// used to identify other events related to this connection.
    pub connection_id: u32,
}

/// The events that can be emitted by a connection pool.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum CmapEvent {
    /// See [`PoolCreatedEvent`].
    PoolCreated(PoolCreatedEvent),
    /// See [`PoolReadyEvent`].
    PoolReady(PoolReadyEvent),
    /// See [`PoolClearedEvent`].
    PoolCleared(PoolClearedEvent),
    /// See [`PoolClosedEvent`].
    PoolClosed(PoolClosedEvent),
    /// See [`ConnectionCreatedEvent`].
    ConnectionCreated(ConnectionCreatedEvent),
    /// See [`ConnectionReadyEvent`].
    ConnectionReady(ConnectionReadyEvent),
    /// See [`ConnectionClosedEvent`].
    ConnectionClosed(ConnectionClosedEvent),
    /// See [`ConnectionCheckoutStartedEvent`].
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    /// See [`ConnectionCheckoutFailedEvent`].
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    /// See [`ConnectionCheckedOutEvent`].
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    /// See [`ConnectionCheckedInEvent`].
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}

macro_rules! cmap_event_from {
    ($variant:ident, $event:ty) => {
        impl From<$event> for CmapEvent {
            fn from(event: $event) -> Self {
                CmapEvent::$variant(event)
            }
        }
    };
}

cmap_event_from!(PoolCreated, PoolCreatedEvent);
cmap_event_from!(PoolReady, PoolReadyEvent);
cmap_event_from!(PoolCleared, PoolClearedEvent);
cmap_event_from!(PoolClosed, PoolClosedEvent);
cmap_event_from!(ConnectionCreated, ConnectionCreatedEvent);
cmap_event_from!(ConnectionReady, ConnectionReadyEvent);
cmap_event_from!(ConnectionClosed, ConnectionClosedEvent);
cmap_event_from!(ConnectionCheckoutStarted, ConnectionCheckoutStartedEvent);
cmap_event_from!(ConnectionCheckoutFailed, ConnectionCheckoutFailedEvent);
cmap_event_from!(ConnectionCheckedOut, ConnectionCheckedOutEvent);
cmap_event_from!(ConnectionCheckedIn, ConnectionCheckedInEvent);

/// Applications can implement this trait to specify custom logic to run on each CMAP event sent
/// by the driver.
///
/// ```rust
/// # use std::sync::Arc;
/// #
/// # use ferrodb::{
/// #     error::Result,
/// #     event::cmap::{
/// #         CmapEventHandler,
/// #         ConnectionCheckoutFailedEvent
/// #     },
/// #     options::ClientOptions,
/// #     Client,
/// # };
/// #
/// struct FailedCheckoutLogger;
///
/// impl CmapEventHandler for FailedCheckoutLogger {
///     fn handle_connection_checkout_failed_event(&self, event: ConnectionCheckoutFailedEvent) {
///         eprintln!("Failed connection checkout: {:?}", event);
///     }
/// }
///
/// # fn do_stuff() -> Result<()> {
/// let handler: Arc<dyn CmapEventHandler> = Arc::new(FailedCheckoutLogger);
/// let options = ClientOptions::builder()
///                   .cmap_event_handler(handler)
///                   .build();
/// let client = Client::with_options(options)?;
///
/// // Do things with the client, and failed connection pool checkouts will be logged to stderr.
/// # Ok(())
/// # }
/// ```
pub trait CmapEventHandler: Send + Sync {
    /// A [`Client`](crate::Client) will call this method on each registered handler
    /// whenever a connection pool is created.
    fn handle_pool_created_event(&self, _event: PoolCreatedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler
    /// whenever a connection pool is marked as ready for use.
    ///
    /// Connections may not be created by or checked out from the pool until it has been marked
    /// as ready.
    fn handle_pool_ready_event(&self, _event: PoolReadyEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler
    /// whenever a connection pool is cleared.
    fn handle_pool_cleared_event(&self, _event: PoolClearedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler
    /// whenever a connection pool is closed.
    fn handle_pool_closed_event(&self, _event: PoolClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler
    /// whenever a connection is created.
    fn handle_connection_created_event(&self, _event: ConnectionCreatedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler
    /// whenever a connection is ready to be used.
    fn handle_connection_ready_event(&self, _event: ConnectionReadyEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler
    /// whenever a connection is closed.
    fn handle_connection_closed_event(&self, _event: ConnectionClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler
    /// whenever an operation begins checking out a connection.
    fn handle_connection_checkout_started_event(&self, _event: ConnectionCheckoutStartedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler
    /// whenever an operation is unable to check out a connection.
    fn handle_connection_checkout_failed_event(&self, _event: ConnectionCheckoutFailedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler
    /// whenever a connection is successfully checked out.
    fn handle_connection_checked_out_event(&self, _event: ConnectionCheckedOutEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler
    /// whenever a connection is checked back into a connection pool.
    fn handle_connection_checked_in_event(&self, _event: ConnectionCheckedInEvent) {}
}

/// Dispatches CMAP events to the user-provided handler, if any, and mirrors them as tracing
/// events.
#[derive(Clone)]
pub(crate) struct CmapEventEmitter {
    handler: Option<Arc<dyn CmapEventHandler>>,
}

impl std::fmt::Debug for CmapEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmapEventEmitter").finish()
    }
}

impl CmapEventEmitter {
    pub(crate) fn new(handler: Option<Arc<dyn CmapEventHandler>>) -> Self {
        Self { handler }
    }

    pub(crate) fn emit_event<F>(&self, generate_event: F)
    where
        F: FnOnce() -> CmapEvent,
    {
        let event = generate_event();
        tracing::trace!(event = ?event, "connection pool event");

        if let Some(ref handler) = self.handler {
            match event {
                CmapEvent::PoolCreated(event) => handler.handle_pool_created_event(event),
                CmapEvent::PoolReady(event) => handler.handle_pool_ready_event(event),
                CmapEvent::PoolCleared(event) => handler.handle_pool_cleared_event(event),
                CmapEvent::PoolClosed(event) => handler.handle_pool_closed_event(event),
                CmapEvent::ConnectionCreated(event) => {
                    handler.handle_connection_created_event(event)
                }
                CmapEvent::ConnectionReady(event) => handler.handle_connection_ready_event(event),
                CmapEvent::ConnectionClosed(event) => {
                    handler.handle_connection_closed_event(event)
                }
                CmapEvent::ConnectionCheckoutStarted(event) => {
                    handler.handle_connection_checkout_started_event(event)
                }
                CmapEvent::ConnectionCheckoutFailed(event) => {
                    handler.handle_connection_checkout_failed_event(event)
                }
                CmapEvent::ConnectionCheckedOut(event) => {
                    handler.handle_connection_checked_out_event(event)
                }
                CmapEvent::ConnectionCheckedIn(event) => {
                    handler.handle_connection_checked_in_event(event)
                }
            }
        }
    }
}

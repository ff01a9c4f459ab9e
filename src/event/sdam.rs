//! Contains the events and functionality for monitoring Server Discovery and Monitoring.

use std::{sync::Arc, time::Duration};

use bson::{oid::ObjectId, Document};
use serde::Serialize;

use crate::{error::Error, options::ServerAddress};

pub use crate::sdam::public::{ServerDescription, TopologyDescription};

/// Published when a server description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The server's previous description.
    pub previous_description: ServerDescription,

    /// The server's new description.
    pub new_description: ServerDescription,
}

/// Published when a server is initialized.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    #[serde(skip)]
    pub topology_id: ObjectId,
}

/// Published when a server is closed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    #[serde(skip)]
    pub topology_id: ObjectId,
}

/// Published when a topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The ID of the topology.
    pub topology_id: ObjectId,

    /// The topology's previous description.
    pub previous_description: TopologyDescription,

    /// The topology's new description.
    pub new_description: TopologyDescription,
}

/// Published when a topology is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology is closed. Note that this event will not be published until the
/// client associated with the topology is shut down or dropped.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server monitor's `hello` or legacy hello command is started.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// Determines if this heartbeat event is from an awaitable `hello`.
    pub awaited: bool,
}

/// Published when a server monitor's `hello` or legacy hello command succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The execution time of the event.
    pub duration: Duration,

    /// The reply to the `hello` or legacy hello command.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Determines if this heartbeat event is from an awaitable `hello`.
    pub awaited: bool,
}

/// Published when a server monitor's `hello` or legacy hello command fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The execution time of the event.
    pub duration: Duration,

    /// The failure that occurred.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Determines if this heartbeat event is from an awaitable `hello`.
    pub awaited: bool,
}

/// The events that can be emitted by the topology.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum SdamEvent {
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event sent
/// by the driver.
pub trait SdamEventHandler: Send + Sync {
    /// A [`Client`](crate::Client) will call this method on each registered handler when a
    /// server description changes.
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when a
    /// server is initialized.
    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when a
    /// server is closed.
    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when its
    /// topology description changes.
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {
    }

    /// A [`Client`](crate::Client) will call this method on each registered handler when its
    /// topology is initialized.
    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when its
    /// topology closes. Note that this method will not be called until the
    /// [`Client`](crate::Client) is shut down or dropped.
    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when a
    /// server heartbeat begins.
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when a
    /// server heartbeat succeeds.
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when a
    /// server heartbeat fails.
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
}

/// Dispatches SDAM events to the user-provided handler, if any, and mirrors them as tracing
/// events.
#[derive(Clone)]
pub(crate) struct SdamEventEmitter {
    handler: Option<Arc<dyn SdamEventHandler>>,
}

impl std::fmt::Debug for SdamEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdamEventEmitter").finish()
    }
}

impl SdamEventEmitter {
    pub(crate) fn new(handler: Option<Arc<dyn SdamEventHandler>>) -> Self {
        Self { handler }
    }

    pub(crate) fn emit_event<F>(&self, generate_event: F)
    where
        F: FnOnce() -> SdamEvent,
    {
        let event = generate_event();
        tracing::trace!(event = ?event, "topology event");

        if let Some(ref handler) = self.handler {
            match event {
                SdamEvent::ServerDescriptionChanged(event) => {
                    handler.handle_server_description_changed_event(*event)
                }
                SdamEvent::ServerOpening(event) => handler.handle_server_opening_event(event),
                SdamEvent::ServerClosed(event) => handler.handle_server_closed_event(event),
                SdamEvent::TopologyDescriptionChanged(event) => {
                    handler.handle_topology_description_changed_event(*event)
                }
                SdamEvent::TopologyOpening(event) => handler.handle_topology_opening_event(event),
                SdamEvent::TopologyClosed(event) => handler.handle_topology_closed_event(event),
                SdamEvent::ServerHeartbeatStarted(event) => {
                    handler.handle_server_heartbeat_started_event(event)
                }
                SdamEvent::ServerHeartbeatSucceeded(event) => {
                    handler.handle_server_heartbeat_succeeded_event(event)
                }
                SdamEvent::ServerHeartbeatFailed(event) => {
                    handler.handle_server_heartbeat_failed_event(event)
                }
            }
        }
    }
}

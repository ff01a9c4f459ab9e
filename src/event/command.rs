//! Contains the events and functionality to monitor the commands and responses that a `Client`
//! sends and receives from the server.

use std::{sync::Arc, time::Duration};

use bson::{oid::ObjectId, Document};

use crate::{cmap::ConnectionInfo, error::Error};

/// An event that triggers when a database command is initiated.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandStartedEvent {
    /// The command being run.
    pub command: Document,

    /// The name of the database the command is being run against.
    pub db: String,

    /// The type of command being run, e.g. "find" or "hello".
    pub command_name: String,

    /// The driver-generated identifier for the request. Applications can use this to identify
    /// the corresponding event triggered by the completion of this command.
    pub request_id: i32,

    /// Information about the connection the command will be run on.
    pub connection: ConnectionInfo,

    /// If the client connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,
}

/// An event that triggers when a database command completes without an error.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandSucceededEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The server's reply to the command.
    pub reply: Document,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The driver-generated identifier for the request. Applications can use this to identify
    /// the corresponding `CommandStartedEvent` that triggered earlier.
    pub request_id: i32,

    /// Information about the connection the command was run on.
    pub connection: ConnectionInfo,

    /// If the client connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,
}

/// An event that triggers when a command failed to complete successfully.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandFailedEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The error that the driver returned due to the event failing.
    pub failure: Error,

    /// The driver-generated identifier for the request. Applications can use this to identify
    /// the corresponding `CommandStartedEvent` that triggered earlier.
    pub request_id: i32,

    /// Information about the connection the command was run on.
    pub connection: ConnectionInfo,

    /// If the client connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,
}

/// The events that can be emitted by the execution of a command.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum CommandEvent {
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

/// Applications can implement this trait to specify custom logic to run on each command event
/// sent by the driver.
pub trait CommandEventHandler: Send + Sync {
    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// database command is initiated.
    fn handle_command_started_event(&self, _event: CommandStartedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// database command completes without an error.
    fn handle_command_succeeded_event(&self, _event: CommandSucceededEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// database command fails to complete successfully.
    fn handle_command_failed_event(&self, _event: CommandFailedEvent) {}
}

/// Dispatches command events to the user-provided handler, if any.
#[derive(Clone)]
pub(crate) struct CommandEventEmitter {
    handler: Option<Arc<dyn CommandEventHandler>>,
}

impl std::fmt::Debug for CommandEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEventEmitter").finish()
    }
}

impl CommandEventEmitter {
    pub(crate) fn new(handler: Option<Arc<dyn CommandEventHandler>>) -> Self {
        Self { handler }
    }

    pub(crate) fn emit_event<F>(&self, generate_event: F)
    where
        F: FnOnce() -> CommandEvent,
    {
        if let Some(ref handler) = self.handler {
            match generate_event() {
                CommandEvent::Started(event) => handler.handle_command_started_event(event),
                CommandEvent::Succeeded(event) => handler.handle_command_succeeded_event(event),
                CommandEvent::Failed(event) => handler.handle_command_failed_event(event),
            }
        }
    }
}

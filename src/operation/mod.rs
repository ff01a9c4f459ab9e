mod insert;
mod run_command;

use serde::Deserialize;

use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{CommandError, Error, ErrorKind, Result},
    selection_criteria::SelectionCriteria,
};

pub(crate) use self::{insert::Insert, run_command::RunCommand};

/// A trait modeling the behavior of a server-side operation. This is the contract through
/// which everything above the core (CRUD, aggregation, index management, and so on) binds a
/// user request to server selection, connection checkout, and the retry loop.
pub(crate) trait Operation {
    /// The output type of this operation.
    type O;

    /// The name of the server-side operation that this operation sends.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    /// The operation may store some additional state that is required for handling the
    /// response.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Interpret an error encountered while sending the built command to the server, potentially
    /// recovering.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether or not this operation will request acknowledgment from the server.
    fn is_acknowledged(&self) -> bool {
        true
    }

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    fn name(&self) -> &str {
        Self::NAME
    }
}

/// The retryability level for an operation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Retryability {
    /// The operation is a write in the retryable-writes set; with a session available it may be
    /// assigned a transaction number and retried once.
    Write,

    /// The operation is a read and may be retried once if `retryReads` is enabled.
    Read,

    /// The operation cannot be retried.
    None,
}

/// The body of an `ok: 0` server response.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}

impl From<CommandErrorBody> for Error {
    fn from(command_error_response: CommandErrorBody) -> Error {
        Error::new(
            ErrorKind::Command(command_error_response.command_error),
            command_error_response.error_labels,
        )
    }
}

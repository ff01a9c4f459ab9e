//! Contains the `Error` and `Result` types that `ferrodb` uses.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{options::ServerAddress, sdam::TopologyVersion};

/// Retryable write error label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Transient transaction error label. This label will be added to a network error or server
/// selection error that occurs during a transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Network error label. This label is added to errors caused by the driver's inability to
/// read from or write to a server socket, including socket timeouts.
pub const NETWORK_ERROR: &str = "NetworkError";

/// The result type for all methods that can return an error in the `ferrodb` crate.
pub type Result<T> = std::result::Result<T, Error>;

// The server-side error code families the topology reacts to. "Recovering" is the broad
// family; shutdown codes are the subset of it that always warrants clearing the pool.

fn code_says_not_writable_primary(code: i32) -> bool {
    // NotWritablePrimary, NotPrimaryNoSecondaryOk, NotPrimaryOrSecondary(legacy).
    matches!(code, 10107 | 13435 | 10058)
}

fn code_says_recovering(code: i32) -> bool {
    // InterruptedAtShutdown, InterruptedDueToReplStateChange, NotPrimaryOrSecondary,
    // PrimarySteppedDown, ShutdownInProgress.
    matches!(code, 11600 | 11602 | 13436 | 189 | 91)
}

fn code_says_shutting_down(code: i32) -> bool {
    // InterruptedAtShutdown, ShutdownInProgress.
    matches!(code, 11600 | 91)
}

/// The codes on which a failed read may be re-run.
fn code_is_read_retryable(code: i32) -> bool {
    code_says_recovering(code)
        || code_says_not_writable_primary(code)
        || matches!(code, 7 | 6 | 89 | 9001 | 134 | 262)
}

/// The codes for which pre-4.4 servers expect the driver to attach the retryable-write
/// label itself.
fn code_is_write_retryable(code: i32) -> bool {
    code_says_recovering(code)
        || code_says_not_writable_primary(code)
        || matches!(code, 7 | 6 | 89 | 9001 | 262)
}

/// An error that can occur in the `ferrodb` crate. The inner [`ErrorKind`] is boxed so the
/// error stays small and cheap to clone as it travels between tasks.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,

    /// The wire version of the server the failing operation ran against, when known. Drives
    /// version-gated label attachment.
    pub(crate) wire_version: Option<i32>,

    /// The earlier failure this error superseded, if any (e.g. the first attempt's error
    /// when a retry also fails).
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();

        // Some deployments only attach labels to the write concern error rather than the
        // top level; hoist those up so label checks see them.
        if let Some(write_concern_error) = kind.write_concern_error() {
            labels.extend(write_concern_error.labels.clone());
        }

        Self {
            kind: Box::new(kind),
            labels,
            wire_version: None,
            source: None,
        }
    }

    pub(crate) fn with_source<E: Into<Option<Error>>>(mut self, source: E) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    // Constructors for the error shapes the core produces itself.

    /// A network error wrapping the given I/O failure.
    pub(crate) fn network(io: std::io::Error) -> Error {
        let mut error: Error = ErrorKind::Io(Arc::new(io)).into();
        error.add_label(NETWORK_ERROR);
        error
    }

    /// A network error representing an elapsed socket deadline.
    pub(crate) fn network_timeout() -> Error {
        Error::network(std::io::ErrorKind::TimedOut.into())
    }

    /// The retryable error surfaced to operations whose pool was cleared out from under
    /// them while they waited for a connection.
    pub(crate) fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        let mut error: Error = ErrorKind::ConnectionPoolCleared {
            message: format!(
                "Connection pool for {} cleared because another operation failed with: {}",
                address, cause
            ),
        }
        .into();
        error.add_label(NETWORK_ERROR);
        error
    }

    pub(crate) fn authentication_error(mechanism_name: &str, reason: &str) -> Self {
        ErrorKind::Authentication {
            message: format!("{} failure: {}", mechanism_name, reason),
        }
        .into()
    }

    pub(crate) fn unknown_authentication_error(mechanism_name: &str) -> Error {
        Error::authentication_error(mechanism_name, "internal error")
    }

    pub(crate) fn invalid_authentication_response(mechanism_name: &str) -> Error {
        Error::authentication_error(mechanism_name, "invalid server response")
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    // Labels.

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    // Classification. These predicates drive the topology/pool side effects and the retry
    // decisions; see the error-handling table in the executor and topology worker.

    /// The server-reported code relevant for topology transitions: the command-level code,
    /// or the write concern error's. Codes inside per-document write errors deliberately
    /// never count.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        let own_code = match *self.kind {
            ErrorKind::Command(ref command_error) => Some(command_error.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(ref wc_error)) => Some(wc_error.code),
            ErrorKind::BulkWrite(ref bulk) => bulk
                .write_concern_error
                .as_ref()
                .map(|wc_error| wc_error.code),
            _ => None,
        };

        own_code.or_else(|| self.source.as_ref().and_then(|source| source.sdam_code()))
    }

    pub(crate) fn is_notwritableprimary(&self) -> bool {
        self.sdam_code().map_or(false, code_says_not_writable_primary)
    }

    pub(crate) fn is_recovering(&self) -> bool {
        self.sdam_code().map_or(false, code_says_recovering)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.sdam_code().map_or(false, code_says_shutting_down)
    }

    /// Whether this is a "not primary" or "node is recovering" style error that should
    /// transition the server to Unknown.
    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    /// Whether this error was caused by a failure to talk to a server. Pool-cleared errors
    /// count: they stand in for a network error observed by a sibling operation.
    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    /// Whether this error came directly from socket I/O on a connection (as opposed to a
    /// pool-cleared stand-in).
    pub(crate) fn is_network_io_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Io(..))
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        match *self.kind {
            ErrorKind::Io(ref io) => io.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        match *self.kind {
            ErrorKind::Io(ref io) => io.kind() != std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Authentication { .. })
    }

    pub(crate) fn is_command_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::Command(_))
    }

    pub(crate) fn is_server_selection_error(&self) -> bool {
        matches!(*self.kind, ErrorKind::ServerSelection { .. })
    }

    pub(crate) fn is_pool_cleared(&self) -> bool {
        matches!(*self.kind, ErrorKind::ConnectionPoolCleared { .. })
    }

    pub(crate) fn is_incompatible_server(&self) -> bool {
        matches!(*self.kind, ErrorKind::IncompatibleServer { .. })
    }

    /// Whether the error was produced by the server rather than by the driver.
    pub(crate) fn is_server_error(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::Authentication { .. }
                | ErrorKind::BulkWrite(_)
                | ErrorKind::Command(_)
                | ErrorKind::Write(_)
        )
    }

    /// Whether a failed read operation may be run once more.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        self.sdam_code().map_or(false, code_is_read_retryable)
    }

    /// Whether a failed retryable write may be run once more. The label is authoritative:
    /// 4.4+ servers attach it themselves, and the driver attaches it for older servers via
    /// [`Error::should_add_retryable_write_label`].
    pub(crate) fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether the driver should attach the retryable-write label itself. Servers newer
    /// than wire version 8 (4.4) label their own errors, so for them only network errors
    /// get a driver-side label; for older servers the code table decides.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if self.is_network_error() {
            return true;
        }
        if max_wire_version > 8 {
            return false;
        }
        self.sdam_code().map_or(false, code_is_write_retryable)
    }

    /// The topology version the server attached to this error, used to discard stale
    /// state-change errors.
    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match *self.kind {
            ErrorKind::Command(ref command_error) => command_error.topology_version,
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn code(&self) -> Option<i32> {
        match *self.kind {
            ErrorKind::Command(ref command_error) => Some(command_error.code),
            ErrorKind::Write(ref failure) => Some(failure.code()),
            _ => None,
        }
        .or_else(|| self.source.as_ref().and_then(|source| source.sdam_code()))
    }

    /// Strips everything except codes, code names, and labels from errors produced by
    /// sensitive commands before they are handed to event handlers.
    pub(crate) fn redact(&mut self) {
        match *self.kind {
            ErrorKind::Command(ref mut command_error) => command_error.redact(),
            ErrorKind::Write(ref mut failure) => match failure {
                WriteFailure::WriteConcernError(wc_error) => wc_error.redact(),
                WriteFailure::WriteError(write_error) => write_error.redact(),
            },
            ErrorKind::BulkWrite(ref mut bulk) => {
                for write_error in bulk.write_errors.iter_mut().flatten() {
                    write_error.redact();
                }
                if let Some(ref mut wc_error) = bulk.write_concern_error {
                    wc_error.redact();
                }
            }
            _ => {}
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// Authenticating a connection failed.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(crate::bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(crate::bson::ser::Error),

    /// A write consisting of multiple sub-writes failed.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    BulkWrite(BulkWriteFailure),

    /// The server answered a command with `ok: 0`.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An error occurred during DNS resolution.
    #[error("An error occurred during DNS resolution: {message}")]
    #[non_exhaustive]
    DnsResolve { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Reading from or writing to a server socket failed.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection pool for a server was cleared while this operation was either waiting
    /// for a connection from it or using one, due to an error observed concurrently.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// The server's reply could not be interpreted.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// No server suitable for the operation could be found within the server selection
    /// deadline.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// A checkout request timed out while waiting for a connection to become available.
    #[error("Timed out while checking out a connection from connection pool for {address}")]
    #[non_exhaustive]
    WaitQueueTimeout { address: ServerAddress },

    /// The Client does not support sessions.
    #[error("Attempted to start a session on a deployment that does not support sessions")]
    SessionsNotSupported,

    #[error("{message}")]
    #[non_exhaustive]
    InvalidTlsConfig { message: String },

    /// A single write failed.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    Write(WriteFailure),

    /// The deployment's wire version range has no overlap with the driver's.
    #[error("The server does not support a database operation: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// A method was called on a client that was shut down.
    #[error("Client has been shut down")]
    Shutdown,
}

impl ErrorKind {
    fn write_concern_error(&self) -> Option<&WriteConcernError> {
        match self {
            ErrorKind::BulkWrite(bulk) => bulk.write_concern_error.as_ref(),
            ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)) => Some(wc_error),
            _ => None,
        }
    }
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// The topology version reported by the server in the error response.
    #[serde(rename = "topologyVersion")]
    pub(crate) topology_version: Option<TopologyVersion>,
}

impl CommandError {
    fn redact(&mut self) {
        self.message = "REDACTED".to_string();
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document identifying the write concern setting related to the error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,

    /// Labels categorizing the error. Some deployments attach labels here rather than at
    /// the top level of the reply.
    #[serde(rename = "errorLabels", default)]
    pub(crate) labels: Vec<String>,
}

impl WriteConcernError {
    fn redact(&mut self) {
        self.message = "REDACTED".to_string();
        self.details = None;
    }
}

/// An error that occurred during a write operation that wasn't due to being unable to
/// satisfy a write concern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code. Not always returned by the server.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document providing more information about the write error (e.g. details pertaining
    /// to document validation).
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

impl WriteError {
    fn redact(&mut self) {
        self.message = "REDACTED".to_string();
        self.details = None;
    }
}

/// One failed sub-write of a write operation consisting of multiple sub-writes.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BulkWriteError {
    /// Index into the list of operations that this error corresponds to.
    #[serde(default)]
    pub index: usize,

    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code. Not always returned by the server.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document providing more information about the write error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

impl BulkWriteError {
    fn redact(&mut self) {
        self.message = "REDACTED".to_string();
        self.details = None;
    }
}

/// The set of errors that occurred during a write operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkWriteFailure {
    /// The error(s) that occurred on account of a non write concern failure.
    pub write_errors: Option<Vec<BulkWriteError>>,

    /// The error that occurred on account of write concern failure.
    pub write_concern_error: Option<WriteConcernError>,

    #[serde(skip)]
    pub(crate) inserted_ids: HashMap<usize, Bson>,
}

impl BulkWriteFailure {
    pub(crate) fn new() -> Self {
        BulkWriteFailure {
            write_errors: None,
            write_concern_error: None,
            inserted_ids: Default::default(),
        }
    }
}

/// An error that occurred when trying to execute a write operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WriteFailure {
    /// An error that occurred due to not being able to satisfy a write concern.
    WriteConcernError(WriteConcernError),

    /// An error that occurred during a write operation that wasn't due to being unable to
    /// satisfy a write concern.
    WriteError(WriteError),
}

impl WriteFailure {
    #[cfg(test)]
    pub(crate) fn code(&self) -> i32 {
        match self {
            Self::WriteConcernError(wc_error) => wc_error.code,
            Self::WriteError(write_error) => write_error.code,
        }
    }
}

/// Flag a load-balanced mode mismatch. With debug assertions enabled, it will panic;
/// otherwise, it will return the argument, or `()` if none is given.
macro_rules! load_balanced_mode_mismatch {
    ($e:expr) => {{
        if cfg!(debug_assertions) {
            panic!("load-balanced mode mismatch")
        }
        return $e;
    }};
    () => {
        load_balanced_mode_mismatch!(())
    };
}

pub(crate) use load_balanced_mode_mismatch;

#[cfg(test)]
mod test {
    use super::*;

    fn command_error(code: i32) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: String::new(),
            topology_version: None,
        })
        .into()
    }

    #[test]
    fn state_change_error_families() {
        // NotWritablePrimary and NotPrimaryNoSecondaryOk.
        assert!(command_error(10107).is_notwritableprimary());
        assert!(command_error(13435).is_notwritableprimary());
        assert!(!command_error(10107).is_recovering());

        // Recovering family, with the shutdown subset.
        for code in [11600, 11602, 13436, 189, 91] {
            assert!(command_error(code).is_recovering(), "code {}", code);
        }
        assert!(command_error(11600).is_shutting_down());
        assert!(command_error(91).is_shutting_down());
        assert!(!command_error(11602).is_shutting_down());
        assert!(!command_error(13436).is_shutting_down());
    }

    #[test]
    fn write_concern_errors_count_for_topology_updates() {
        let error: Error = ErrorKind::Write(WriteFailure::WriteConcernError(WriteConcernError {
            code: 91,
            code_name: "ShutdownInProgress".to_string(),
            message: String::new(),
            details: None,
            labels: Vec::new(),
        }))
        .into();
        assert_eq!(error.sdam_code(), Some(91));
        assert!(error.is_shutting_down());

        // writeError codes must not be considered.
        let error: Error = ErrorKind::Write(WriteFailure::WriteError(WriteError {
            code: 91,
            code_name: None,
            message: String::new(),
            details: None,
        }))
        .into();
        assert_eq!(error.sdam_code(), None);
    }

    #[test]
    fn network_errors_are_retryable() {
        let error = Error::network_timeout();
        assert!(error.is_network_error());
        assert!(error.is_network_timeout());
        assert!(error.is_read_retryable());
        assert!(error.contains_label(NETWORK_ERROR));
        assert!(error.should_add_retryable_write_label(9));

        let error = Error::network(std::io::ErrorKind::ConnectionReset.into());
        assert!(error.is_non_timeout_network_error());
        assert!(error.is_read_retryable());
    }

    #[test]
    fn retryable_write_label_is_wire_version_gated() {
        // On 4.4+ servers the server applies the label itself, so only network errors get
        // a driver-side label.
        assert!(!command_error(11600).should_add_retryable_write_label(9));
        assert!(command_error(11600).should_add_retryable_write_label(8));
        assert!(command_error(189).should_add_retryable_write_label(7));
        assert!(!command_error(26).should_add_retryable_write_label(8));
    }

    #[test]
    fn pool_cleared_errors_are_network_flavored() {
        let cause = Error::network(std::io::ErrorKind::ConnectionReset.into());
        let address = ServerAddress::default();
        let error = Error::pool_cleared_error(&address, &cause);
        assert!(error.is_pool_cleared());
        assert!(error.is_network_error());
        assert!(!error.is_network_io_error());
        assert!(error.is_read_retryable());
    }
}

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;

use crate::{
    bson::Document,
    client::session::{ClusterTime, ServerSession},
    error::{Error, ErrorKind, Result},
    hello::{HelloCommandResponse, HelloReply, LEGACY_HELLO_COMMAND_NAME_LOWERCASE},
    operation::CommandErrorBody,
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

use std::collections::HashSet;

/// Commands whose bodies are never published in events or logs and whose replies are redacted,
/// since they may contain credentials.
pub(crate) static REDACTED_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "authenticate",
        "saslstart",
        "saslcontinue",
        "getnonce",
        "createuser",
        "updateuser",
        "copydbgetnonce",
        "copydbsaslstart",
        "copydb",
    ]
    .into_iter()
    .collect()
});

/// Commands that may never be sent compressed.
pub(crate) static UNCOMPRESSIBLE_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "hello",
        LEGACY_HELLO_COMMAND_NAME_LOWERCASE,
        "saslstart",
        "saslcontinue",
        "getnonce",
        "authenticate",
        "createuser",
        "updateuser",
        "copydbgetnonce",
        "copydbsaslstart",
        "copydb",
    ]
    .into_iter()
    .collect()
});

/// Driver-side abstraction of a server command containing all the information necessary to
/// serialize it to a wire message.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) exhaust_allowed: bool,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            exhaust_allowed: false,
        }
    }

    pub(crate) fn set_session(&mut self, session: &ServerSession) {
        self.body.insert("lsid", session.id.clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        // This serialization should never fail.
        if let Ok(doc) = bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.body
            .insert("$readPreference", read_preference.into_document());
    }

    /// Whether the body of this command should be redacted in events and logs.
    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        REDACTED_COMMANDS.contains(name.as_str())
            || ((name == "hello" || name == LEGACY_HELLO_COMMAND_NAME_LOWERCASE)
                && self.body.contains_key("speculativeAuthenticate"))
    }

    /// Whether this command is allowed to be sent compressed.
    pub(crate) fn should_compress(&self) -> bool {
        let name = self.name.to_lowercase();
        !UNCOMPRESSIBLE_COMMANDS.contains(name.as_str())
    }
}

/// A response to a command, backed by the single reply document from the server and the
/// address of the server that sent it.
#[derive(Clone, Debug)]
pub(crate) struct RawCommandResponse {
    #[allow(dead_code)]
    pub(crate) source: ServerAddress,
    document: Document,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, document: Document) -> Self {
        Self { source, document }
    }

    /// Deserialize the body of this response.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_document(self.document.clone()).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                message: format!("{}", e),
            })
        })
    }

    /// The reply document sent by the server.
    pub(crate) fn raw_document(&self) -> &Document {
        &self.document
    }

    pub(crate) fn into_document(self) -> Document {
        self.document
    }

    /// Interprets this response as a reply to a `hello` command, failing if the server reported
    /// a command error.
    pub(crate) fn into_hello_reply(self) -> Result<HelloReply> {
        let ok = self
            .document
            .get("ok")
            .and_then(crate::bson_util::get_int)
            .ok_or_else(|| {
                Error::invalid_response("hello response did not contain an `ok` field")
            })?;

        if ok != 1 {
            let error_body: CommandErrorBody = self.body()?;
            return Err(error_body.into());
        }

        let command_response: HelloCommandResponse = self.body()?;
        let cluster_time: Option<ClusterTime> = self
            .document
            .get_document("$clusterTime")
            .ok()
            .and_then(|doc| bson::from_document(doc.clone()).ok());

        Ok(HelloReply {
            command_response,
            raw_command_response: self.document,
            cluster_time,
        })
    }
}

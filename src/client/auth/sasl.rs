use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document},
    bson_util,
    client::auth::AuthMechanism,
    cmap::Command,
    error::{Error, Result},
};

/// One step of a SASL conversation: either the opening `saslStart` or a follow-up
/// `saslContinue` within an existing conversation.
pub(super) enum SaslStep {
    Start { mechanism: AuthMechanism },
    Continue { conversation_id: Bson },
}

impl SaslStep {
    /// Wraps the mechanism payload into the wire command for this step, targeted at the
    /// credential's auth database.
    pub(super) fn into_command(self, source: impl Into<String>, payload: Vec<u8>) -> Command {
        let payload = Binary {
            subtype: BinarySubtype::Generic,
            bytes: payload,
        };

        let (name, body) = match self {
            SaslStep::Start { mechanism } => (
                "saslStart",
                doc! {
                    "saslStart": 1,
                    "mechanism": mechanism.as_str(),
                    "payload": payload,
                },
            ),
            SaslStep::Continue { conversation_id } => (
                "saslContinue",
                doc! {
                    "saslContinue": 1,
                    "conversationId": conversation_id,
                    "payload": payload,
                },
            ),
        };

        Command::new(name, source, body)
    }
}

/// The server's half of a SASL step, common to `saslStart` and `saslContinue` replies.
#[derive(Debug)]
pub(super) struct SaslResponse {
    pub(super) conversation_id: Bson,
    pub(super) done: bool,
    pub(super) payload: Vec<u8>,
}

impl SaslResponse {
    pub(super) fn parse(mechanism_name: &str, mut reply: Document) -> Result<Self> {
        // A SASL failure comes back as a command failure; surface the server's message
        // when it provided one.
        match reply.get("ok").and_then(bson_util::get_int) {
            Some(1) => {}
            Some(_) => {
                let message = reply
                    .get_str("errmsg")
                    .unwrap_or("Authentication failure");
                return Err(Error::authentication_error(mechanism_name, message));
            }
            None => return Err(Error::invalid_authentication_response(mechanism_name)),
        }

        let malformed = || Error::invalid_authentication_response(mechanism_name);

        let conversation_id = reply.remove("conversationId").ok_or_else(malformed)?;
        let done = reply.get_bool("done").map_err(|_| malformed())?;
        let payload = match reply.remove("payload") {
            Some(Bson::Binary(binary)) => binary.bytes,
            _ => return Err(malformed()),
        };

        Ok(SaslResponse {
            conversation_id,
            done,
            payload,
        })
    }
}

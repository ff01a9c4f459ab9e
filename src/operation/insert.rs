use bson::{Bson, Document};
use serde::Deserialize;

use super::{Operation, Retryability};
use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{BulkWriteError, BulkWriteFailure, Error, ErrorKind, Result, WriteConcernError},
};

/// An operation that inserts a batch of documents into a collection. Single-statement inserts
/// are in the retryable-writes set, so this operation may be assigned a transaction number and
/// retried once.
#[derive(Debug)]
pub(crate) struct Insert {
    db: String,
    coll: String,
    documents: Vec<Document>,
}

impl Insert {
    pub(crate) fn new(db: String, coll: String, documents: Vec<Document>) -> Self {
        Self {
            db,
            coll,
            documents,
        }
    }
}

impl Operation for Insert {
    type O = u64;

    const NAME: &'static str = "insert";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let docs: Vec<Bson> = self
            .documents
            .iter()
            .map(|doc| Bson::Document(doc.clone()))
            .collect();

        // The command name must be the first key in the body.
        let mut body = Document::new();
        body.insert(Self::NAME, self.coll.clone());
        body.insert("documents", docs);
        body.insert("ordered", true);

        Ok(Command::new(Self::NAME, self.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let response: WriteResponseBody = response.body()?;

        let mut bulk_failure = BulkWriteFailure::new();
        if let Some(write_errors) = response.write_errors {
            bulk_failure.write_errors = Some(write_errors);
        }
        if let Some(write_concern_error) = response.write_concern_error {
            bulk_failure.write_concern_error = Some(write_concern_error);
        }

        if bulk_failure.write_errors.is_some() || bulk_failure.write_concern_error.is_some() {
            return Err(Error::new(
                ErrorKind::BulkWrite(bulk_failure),
                response.labels,
            ));
        }

        Ok(response.n)
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResponseBody {
    #[serde(default)]
    n: u64,

    write_errors: Option<Vec<BulkWriteError>>,

    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    labels: Option<Vec<String>>,
}

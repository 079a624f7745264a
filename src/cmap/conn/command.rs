use std::time::Duration;

use bson::{doc, Document, RawDocumentBuf};
use serde::de::DeserializeOwned;

use crate::{
    client::session::ClusterTime,
    concern::{ReadConcern, WriteConcern},
    error::{Error, Result},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// Driver-generated command to be sent to the server. The body is kept as a `Document` so
/// session, transaction, and routing fields can be attached incrementally before serialization.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
}

impl Command {
    pub(crate) fn new(name: impl ToString, target_db: impl ToString, body: Document) -> Self {
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            body,
        }
    }

    pub(crate) fn set_session_id(&mut self, lsid: &Document) {
        self.body.insert("lsid", lsid.clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if let Ok(doc) = bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.body.insert("startTransaction", true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.insert("autocommit", false);
    }

    pub(crate) fn set_recovery_token(&mut self, token: &Document) {
        self.body.insert("recoveryToken", token.clone());
    }

    pub(crate) fn set_max_time_ms(&mut self, max_time: Duration) {
        self.body.insert(
            "maxTimeMS",
            i64::try_from(max_time.as_millis()).unwrap_or(i64::MAX),
        );
    }

    pub(crate) fn set_read_preference(&mut self, read_pref: &ReadPreference) {
        self.body.insert("$readPreference", read_pref.to_document());
    }

    pub(crate) fn set_read_concern(&mut self, read_concern: &ReadConcern) {
        self.body
            .insert("readConcern", doc! { "level": read_concern.as_str() });
    }

    pub(crate) fn set_write_concern(&mut self, write_concern: &WriteConcern) {
        if !write_concern.is_empty() {
            self.body.insert("writeConcern", write_concern.to_document());
        }
    }

    /// Serialize the command for the wire, attaching the `$db` routing field.
    pub(crate) fn into_raw(mut self) -> Result<RawDocumentBuf> {
        self.body.insert("$db", self.target_db);
        let bytes = bson::to_vec(&self.body)?;
        RawDocumentBuf::from_bytes(bytes).map_err(Error::from)
    }
}

/// A response to a command, kept in raw BSON until a caller asks for a typed view.
#[derive(Clone, Debug)]
pub(crate) struct RawCommandResponse {
    source: ServerAddress,
    raw: RawDocumentBuf,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, raw: RawDocumentBuf) -> Self {
        Self { source, raw }
    }

    /// Deserialize the body of this response.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_slice(self.raw.as_bytes()).map_err(Error::from)
    }

    pub(crate) fn to_document(&self) -> Result<Document> {
        self.body()
    }

    /// The address of the server that produced this response.
    pub(crate) fn source_address(&self) -> &ServerAddress {
        &self.source
    }
}

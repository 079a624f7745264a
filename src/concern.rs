//! Contains the types for read concerns and write concerns.

use std::time::Duration;

use bson::{doc, Document};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// Specifies the consistency and isolation properties of read operations carried on a command.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadConcern {
    /// The level of the read concern.
    pub level: ReadConcernLevel,
}

/// Specifies the level consistency and isolation properties of a given `ReadConcern`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ReadConcernLevel {
    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-local/).
    Local,

    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-majority/).
    Majority,

    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-linearizable/).
    Linearizable,

    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-available/).
    Available,

    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-snapshot/).
    Snapshot,

    /// Specify a custom read concern level. This is present to provide forwards compatibility
    /// with any levels introduced in the future.
    #[serde(untagged)]
    Custom(String),
}

impl ReadConcern {
    /// Creates a read concern with level "majority".
    pub fn majority() -> Self {
        ReadConcernLevel::Majority.into()
    }

    /// Creates a read concern with level "local".
    pub fn local() -> Self {
        ReadConcernLevel::Local.into()
    }

    pub(crate) fn as_str(&self) -> &str {
        match self.level {
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Linearizable => "linearizable",
            ReadConcernLevel::Available => "available",
            ReadConcernLevel::Snapshot => "snapshot",
            ReadConcernLevel::Custom(ref s) => s.as_str(),
        }
    }
}

impl From<ReadConcernLevel> for ReadConcern {
    fn from(level: ReadConcernLevel) -> Self {
        Self { level }
    }
}

impl ReadConcernLevel {
    pub(crate) fn from_str(s: &str) -> Self {
        match s {
            "local" => ReadConcernLevel::Local,
            "majority" => ReadConcernLevel::Majority,
            "linearizable" => ReadConcernLevel::Linearizable,
            "available" => ReadConcernLevel::Available,
            "snapshot" => ReadConcernLevel::Snapshot,
            s => ReadConcernLevel::Custom(s.to_string()),
        }
    }
}

/// Specifies the level of acknowledgement requested from the server for write operations.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct WriteConcern {
    /// Requests acknowledgement that the operation has propagated to a specific number or
    /// variety of servers.
    pub w: Option<Acknowledgment>,

    /// Specifies a time limit for the write concern. If an operation has not propagated to the
    /// requested level within the time limit, an error will return.
    ///
    /// Note that an error being returned due to a write concern error does not imply that the
    /// write would not have finished propagating if allowed more time to finish, and the
    /// server will not roll back the writes that occurred before the timeout was reached.
    ///
    /// This option is stripped from commands executed under an operation-level timeout to avoid
    /// the server racing two timers.
    #[serde(rename = "wtimeout")]
    pub w_timeout: Option<Duration>,

    /// Requests acknowledgement that the operation has propagated to the on-disk journal.
    pub journal: Option<bool>,
}

/// The type of the `w` field in a [`WriteConcern`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// Requires acknowledgement that the write has reached the specified number of nodes.
    ///
    /// Note: specifying 0 here indicates that the write concern is unacknowledged, which is
    /// not supported within transactions.
    Nodes(u32),

    /// Requires acknowledgement that the write has reached the majority of nodes.
    #[serde(rename = "majority")]
    Majority,

    /// Requires acknowledgement according to the given custom write concern. See [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/#tag-sets-and-custom-write-concern-behavior)
    /// for more information.
    #[serde(untagged)]
    Custom(String),
}

impl From<u32> for Acknowledgment {
    fn from(i: u32) -> Self {
        Acknowledgment::Nodes(i)
    }
}

impl From<String> for Acknowledgment {
    fn from(s: String) -> Self {
        if s == "majority" {
            Acknowledgment::Majority
        } else {
            match s.parse::<u32>() {
                Ok(i) => Acknowledgment::Nodes(i),
                Err(_) => Acknowledgment::Custom(s),
            }
        }
    }
}

impl WriteConcern {
    /// Whether this write concern requests acknowledgement from the server. Unacknowledged
    /// write concerns are not supported within transactions.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// Validates that the write concern is consistent: requesting no acknowledgement while
    /// also requesting journaling is contradictory.
    pub fn validate(&self) -> Result<()> {
        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(Error::invalid_argument(
                "write concern cannot have w=0 and journal=true",
            ));
        }
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.w.is_none() && self.w_timeout.is_none() && self.journal.is_none()
    }

    pub(crate) fn to_document(&self) -> Document {
        let mut doc = doc! {};
        match self.w {
            Some(Acknowledgment::Nodes(n)) => {
                doc.insert("w", i64::from(n));
            }
            Some(Acknowledgment::Majority) => {
                doc.insert("w", "majority");
            }
            Some(Acknowledgment::Custom(ref s)) => {
                doc.insert("w", s.as_str());
            }
            None => {}
        }
        if let Some(w_timeout) = self.w_timeout {
            doc.insert(
                "wtimeout",
                i64::try_from(w_timeout.as_millis()).unwrap_or(i64::MAX),
            );
        }
        if let Some(journal) = self.journal {
            doc.insert("j", journal);
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_concern_validation() {
        let wc = WriteConcern::builder().w(0_u32).journal(true).build();
        assert!(wc.validate().is_err());
        assert!(!WriteConcern::builder().w(0_u32).build().is_acknowledged());
        assert!(WriteConcern::builder()
            .w(Acknowledgment::Majority)
            .build()
            .is_acknowledged());
    }

    #[test]
    fn write_concern_document() {
        let wc = WriteConcern::builder()
            .w(Acknowledgment::Majority)
            .w_timeout(Duration::from_secs(1))
            .build();
        assert_eq!(
            wc.to_document(),
            doc! { "w": "majority", "wtimeout": 1000_i64 }
        );
    }
}

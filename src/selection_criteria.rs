//! Contains the types used to specify which servers are suitable for a given operation.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bson::{doc, Bson, Document};
use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::public::ServerInfo,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ///
    /// See the documentation [here](https://www.mongodb.com/docs/manual/core/read-preference/) for more details.
    ReadPreference(ReadPreference),

    /// A read preference that is used only when no suitable server for the preferred one is
    /// known to the topology; i.e. when some connected server predates the cutoff wire version.
    ReadPreferenceWithFallback(ReadPreferenceWithFallback),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            (Self::ReadPreferenceWithFallback(f1), Self::ReadPreferenceWithFallback(f2)) => {
                f1 == f2
            }
            (Self::Predicate(p1), Self::Predicate(p2)) => Arc::ptr_eq(p1, p2),
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::ReadPreferenceWithFallback(ref fallback) => Some(&fallback.preferred),
            Self::Predicate(..) => None,
        }
    }

    /// A criteria that selects the one server with the given address.
    pub fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// A read preference paired with a fallback to apply when any connected server's wire version
/// predates `cutoff_wire_version`. Used to route operations that rely on newer server features
/// while mixed-version clusters are mid-upgrade.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ReadPreferenceWithFallback {
    /// The read preference applied when every connected server supports the cutoff.
    pub preferred: ReadPreference,

    /// The read preference applied when some connected server predates the cutoff.
    pub fallback: ReadPreference,

    /// Minimum max-wire-version a connected server must report for `preferred` to apply.
    pub cutoff_wire_version: i32,
}

/// Specifies how the driver should route a read operation to members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a replica set, and
/// `max_staleness` specifies the maximum lag behind the primary that a secondary can be to remain
/// eligible for the operation. The max staleness value maps to the `maxStalenessSeconds` MongoDB
/// option and will be sent to the server as an integer number of seconds.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more details.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        /// Specifies which secondaries are suitable.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries
    /// if not.
    PrimaryPreferred {
        /// Specifies which secondaries are suitable.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        /// Specifies which secondaries are suitable.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the node with the least network latency regardless of whether
    /// it's the primary or a secondary.
    Nearest {
        /// Specifies which servers are suitable.
        options: ReadPreferenceOptions,
    },
}

/// Specifies read preference options for non-primary read preferences.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set
    /// will be checked in order until one or more servers is found with each tag in the set.
    #[serde(alias = "tag_sets")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given operation. Any secondaries lagging behind more than
    /// `max_staleness` will not be considered.
    ///
    /// `max_staleness` must be at least 90 seconds. If a `max_staleness` less than 90 seconds
    /// is specified for an operation, the operation will return an error.
    #[serde(rename = "maxStalenessSeconds", default)]
    #[serde(with = "duration_option_as_secs")]
    pub max_staleness: Option<Duration>,
}

impl ReadPreferenceOptions {
    pub(crate) fn is_default(&self) -> bool {
        self.max_staleness.is_none()
            && self
                .tag_sets
                .as_ref()
                .map(|ts| ts.is_empty() || ts.iter().all(|t| t.is_empty()))
                .unwrap_or(true)
    }
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::PrimaryPreferred { .. } => "primaryPreferred",
            ReadPreference::Secondary { .. } => "secondary",
            ReadPreference::SecondaryPreferred { .. } => "secondaryPreferred",
            ReadPreference::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn from_mode(mode: &str) -> Result<Self> {
        match &mode.to_lowercase()[..] {
            "primary" => Ok(ReadPreference::Primary),
            "primarypreferred" => Ok(ReadPreference::PrimaryPreferred {
                options: Default::default(),
            }),
            "secondary" => Ok(ReadPreference::Secondary {
                options: Default::default(),
            }),
            "secondarypreferred" => Ok(ReadPreference::SecondaryPreferred {
                options: Default::default(),
            }),
            "nearest" => Ok(ReadPreference::Nearest {
                options: Default::default(),
            }),
            other => Err(Error::invalid_argument(format!(
                "'{}' is not a valid read preference",
                other
            ))),
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { ref options }
            | ReadPreference::PrimaryPreferred { ref options }
            | ReadPreference::SecondaryPreferred { ref options }
            | ReadPreference::Nearest { ref options } => Some(options),
        }
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|opts| opts.tag_sets.as_ref())
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|opts| opts.max_staleness)
    }

    /// Adds the given tag sets to this read preference. Returns an error for the `Primary`
    /// mode, which does not accept tag sets.
    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let options = match self {
            ReadPreference::Primary => {
                return Err(Error::invalid_argument(
                    "read preference tags can only be specified when a non-primary mode is \
                     specified",
                ));
            }
            ReadPreference::Secondary { ref mut options }
            | ReadPreference::PrimaryPreferred { ref mut options }
            | ReadPreference::SecondaryPreferred { ref mut options }
            | ReadPreference::Nearest { ref mut options } => options,
        };

        options.tag_sets = Some(tag_sets);

        Ok(self)
    }

    /// Sets the max staleness for this read preference. Returns an error for the `Primary`
    /// mode, which does not accept a staleness bound.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        let options = match self {
            ReadPreference::Primary => {
                return Err(Error::invalid_argument(
                    "max staleness can only be specified when a non-primary mode is specified",
                ));
            }
            ReadPreference::Secondary { ref mut options }
            | ReadPreference::PrimaryPreferred { ref mut options }
            | ReadPreference::SecondaryPreferred { ref mut options }
            | ReadPreference::Nearest { ref mut options } => options,
        };

        options.max_staleness = Some(max_staleness);

        Ok(self)
    }

    /// The `$readPreference` document attached to commands routed through a mongos.
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = doc! { "mode": self.mode() };

        if let Some(opts) = self.options() {
            if let Some(max_staleness) = opts.max_staleness {
                doc.insert(
                    "maxStalenessSeconds",
                    i64::try_from(max_staleness.as_secs()).unwrap_or(i64::MAX),
                );
            }

            if let Some(ref tag_sets) = opts.tag_sets {
                let tags: Vec<Bson> = tag_sets
                    .iter()
                    .map(|tag_set| {
                        Bson::Document(
                            tag_set
                                .iter()
                                .map(|(k, v)| (k.clone(), Bson::String(v.clone())))
                                .collect(),
                        )
                    })
                    .collect();
                doc.insert("tags", tags);
            }
        }

        doc
    }
}

/// A read preference tag set. See the documentation [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/) for more details.
pub type TagSet = HashMap<String, String>;

mod duration_option_as_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_i64(
                i64::try_from(duration.as_secs()).map_err(serde::ser::Error::custom)?,
            ),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_rejects_tags_and_staleness() {
        assert!(ReadPreference::Primary.with_tags(vec![]).is_err());
        assert!(ReadPreference::Primary
            .with_max_staleness(Duration::from_secs(100))
            .is_err());
    }

    #[test]
    fn read_preference_document() {
        let tag_set: TagSet = [("dc".to_string(), "ny".to_string())].into_iter().collect();
        let pref = ReadPreference::Secondary {
            options: Default::default(),
        }
        .with_tags(vec![tag_set])
        .unwrap()
        .with_max_staleness(Duration::from_secs(120))
        .unwrap();

        assert_eq!(
            pref.to_document(),
            doc! {
                "mode": "secondary",
                "maxStalenessSeconds": 120_i64,
                "tags": [ { "dc": "ny" } ],
            }
        );
    }

    #[test]
    fn from_mode_round_trips() {
        for mode in [
            "primary",
            "primaryPreferred",
            "secondary",
            "secondaryPreferred",
            "nearest",
        ] {
            assert_eq!(ReadPreference::from_mode(mode).unwrap().mode(), mode);
        }
        assert!(ReadPreference::from_mode("bogus").is_err());
    }
}

use std::{collections::HashMap, sync::Arc, time::Duration};

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::public::ServerInfo,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(Predicate),
}

impl std::fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadPreference(read_pref) => write!(f, "ReadPreference({:?})", read_pref),
            Self::Predicate(..) => write!(f, "Predicate"),
        }
    }
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
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
            Self::Predicate(..) => None,
        }
    }

    /// A selection criteria that only matches the server at the given address, used to pin
    /// operations to a specific server.
    #[allow(dead_code)]
    pub(crate) fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the driver should route a read operation to members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a replica set, and
/// `max_staleness` specifies the maximum lag behind the primary that a secondary can be to remain
/// eligible for the operation. The max staleness value maps to the `maxStalenessSeconds` URI
/// option and will be sent to the server as an integer number of seconds.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        /// Specifications for the desired secondary.
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries if
    /// not.
    PrimaryPreferred {
        /// Specifications for the fallback secondary.
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        /// Specifications for the desired secondary.
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the node with the least network latency regardless of whether it's
    /// the primary or a secondary.
    Nearest {
        /// Specifications for the desired server.
        options: Option<ReadPreferenceOptions>,
    },
}

/// Specifies read preference options for non-primary read preferences.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set will
    /// be checked in order until one or more servers is found with each tag in the set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given operation. Any secondaries lagging behind more than
    /// `max_staleness` will not be considered for the operation.
    ///
    /// `max_staleness` must be at least 90 seconds. If a `max_staleness` less than 90 seconds is
    /// specified for an operation, the operation will return an error.
    #[serde(rename = "maxStalenessSeconds", default, skip_serializing_if = "Option::is_none")]
    pub max_staleness: Option<Duration>,

    /// Specifies hedging behavior for reads. These options only apply to sharded clusters on
    /// servers that are at least version 4.4. Note that hedged reads are automatically enabled for
    /// read preference mode "nearest".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hedge: Option<HedgedReadOptions>,
}

/// Specifies hedging behavior for reads.
///
/// See the [server documentation](https://docs.ferrodb.dev/manual/core/read-preference-hedge-option/)
/// for more details.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[non_exhaustive]
pub struct HedgedReadOptions {
    /// Whether or not to allow reads from a sharded cluster to be "hedged" across two replica
    /// set members per shard, with the results from the first response received back from either
    /// being returned.
    pub enabled: bool,
}

impl HedgedReadOptions {
    /// Creates a new `HedgedReadOptions` with the given value for `enabled`.
    pub fn with_enabled(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl ReadPreference {
    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { ref options }
            | ReadPreference::PrimaryPreferred { ref options }
            | ReadPreference::SecondaryPreferred { ref options }
            | ReadPreference::Nearest { ref options } => options.as_ref(),
        }
    }

    fn options_mut(&mut self) -> Result<&mut ReadPreferenceOptions> {
        match self {
            ReadPreference::Primary => Err(ErrorKind::InvalidArgument {
                message: "read preference options can only be specified when a non-primary mode \
                          is specified"
                    .to_string(),
            }
            .into()),
            ReadPreference::Secondary { ref mut options }
            | ReadPreference::PrimaryPreferred { ref mut options }
            | ReadPreference::SecondaryPreferred { ref mut options }
            | ReadPreference::Nearest { ref mut options } => {
                Ok(options.get_or_insert_with(Default::default))
            }
        }
    }

    pub(crate) fn mode(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::PrimaryPreferred { .. } => "primaryPreferred",
            ReadPreference::Secondary { .. } => "secondary",
            ReadPreference::SecondaryPreferred { .. } => "secondaryPreferred",
            ReadPreference::Nearest { .. } => "nearest",
        }
    }

    /// Constructs a read preference from the mode string used in connection string options.
    pub(crate) fn from_mode_str(mode: &str) -> Option<Self> {
        match mode.to_lowercase().as_str() {
            "primary" => Some(ReadPreference::Primary),
            "secondary" => Some(ReadPreference::Secondary { options: None }),
            "primarypreferred" => Some(ReadPreference::PrimaryPreferred { options: None }),
            "secondarypreferred" => Some(ReadPreference::SecondaryPreferred { options: None }),
            "nearest" => Some(ReadPreference::Nearest { options: None }),
            _ => None,
        }
    }

    pub(crate) fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        self.options_mut()?.tag_sets = Some(tag_sets);
        Ok(self)
    }

    pub(crate) fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        self.options_mut()?.max_staleness = Some(max_staleness);
        Ok(self)
    }

    pub(crate) fn into_document(self) -> Document {
        let mut doc = doc! { "mode": self.mode() };
        let options = match self {
            ReadPreference::Primary => None,
            ReadPreference::PrimaryPreferred { options }
            | ReadPreference::Secondary { options }
            | ReadPreference::SecondaryPreferred { options }
            | ReadPreference::Nearest { options } => options,
        };

        if let Some(options) = options {
            if let Some(max_stale) = options.max_staleness {
                doc.insert(
                    "maxStalenessSeconds",
                    max_stale.as_secs().min(i32::MAX as u64) as i64,
                );
            }

            if let Some(tag_sets) = options.tag_sets {
                let tags: Vec<Bson> = tag_sets
                    .into_iter()
                    .map(|tag_set| {
                        Bson::Document(tag_set.into_iter().map(|(k, v)| (k, v.into())).collect())
                    })
                    .collect();
                doc.insert("tags", tags);
            }

            if let Some(hedge) = options.hedge {
                doc.insert("hedge", doc! { "enabled": hedge.enabled });
            }
        }

        doc
    }
}

/// A read preference tag set. See the documentation [here](https://docs.ferrodb.dev/manual/tutorial/configure-replica-set-tag-sets/) for more details.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primary_rejects_options() {
        assert!(ReadPreference::Primary
            .with_max_staleness(Duration::from_secs(100))
            .is_err());
        assert!(ReadPreference::Primary.with_tags(Vec::new()).is_err());
    }

    #[test]
    fn into_document_includes_options() {
        let read_pref = ReadPreference::Secondary { options: None }
            .with_tags(vec![[("dc".to_string(), "east".to_string())]
                .into_iter()
                .collect()])
            .unwrap()
            .with_max_staleness(Duration::from_secs(120))
            .unwrap();

        let doc = read_pref.into_document();
        assert_eq!(doc.get_str("mode").unwrap(), "secondary");
        assert_eq!(doc.get_i64("maxStalenessSeconds").unwrap(), 120);
        assert_eq!(
            doc.get_array("tags").unwrap()[0],
            Bson::Document(doc! { "dc": "east" })
        );
    }
}

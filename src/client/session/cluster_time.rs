use bson::{Document, Timestamp};
use serde::{Deserialize, Serialize};

/// Struct modeling a cluster time reported by the server.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClusterTime {
    /// The logical time.
    pub cluster_time: Timestamp,

    /// The server's signature over the time, carried along verbatim for gossip.
    pub signature: Document,
}

impl std::cmp::PartialEq for ClusterTime {
    fn eq(&self, other: &ClusterTime) -> bool {
        self.cluster_time == other.cluster_time
    }
}

impl std::cmp::Eq for ClusterTime {}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    fn cluster_time(time: u32, increment: u32) -> ClusterTime {
        ClusterTime {
            cluster_time: Timestamp { time, increment },
            signature: doc! {},
        }
    }

    #[test]
    fn ordering_ignores_signature() {
        assert!(cluster_time(1, 1) < cluster_time(1, 2));
        assert!(cluster_time(1, 9) < cluster_time(2, 0));
        assert_eq!(cluster_time(3, 3), cluster_time(3, 3));

        let mut signed = cluster_time(3, 3);
        signed.signature = doc! { "hash": "abc" };
        assert_eq!(signed, cluster_time(3, 3));
    }
}

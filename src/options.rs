//! Contains all of the types needed to specify options for the client, its sessions, and its
//! connection pools.

pub use crate::{
    client::{
        options::{
            ClientOptions,
            ConnectionString,
            Credential,
            HostInfo,
            ResolverConfig,
            ServerAddress,
            Tls,
        },
        session::{SessionOptions, TransactionOptions},
    },
    cmap::options::ConnectionPoolOptions,
    concern::{Acknowledgment, ReadConcern, ReadConcernLevel, WriteConcern},
    selection_criteria::{
        ReadPreference,
        ReadPreferenceOptions,
        ReadPreferenceWithFallback,
        SelectionCriteria,
        TagSet,
    },
};

pub(crate) use crate::client::options::deserialize_duration_option_from_u64_millis;

#[cfg(test)]
pub(crate) use crate::client::options::TestOptions;

use hickory_proto::ProtoErrorKind;
use hickory_resolver::{
    config::ResolverConfig,
    lookup::{SrvLookup, TxtLookup},
    name_server::TokioConnectionProvider,
    ResolveError,
    ResolveErrorKind,
    TokioResolver,
};

use crate::error::{DnsErrorKind, Error, ErrorKind, Result};

/// An async DNS resolver exposing the SRV and TXT lookups that seedlist discovery needs, and
/// distinguishing "name not found" from other failures.
pub(crate) struct AsyncResolver {
    resolver: TokioResolver,
}

impl AsyncResolver {
    pub(crate) async fn new(config: Option<ResolverConfig>) -> Result<Self> {
        let resolver = match config {
            Some(config) => {
                TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
                    .build()
            }
            None => TokioResolver::builder_tokio()
                .map_err(Error::from_resolve_error)?
                .build(),
        };

        Ok(Self { resolver })
    }

    pub(crate) async fn srv_lookup(&self, query: &str) -> Result<SrvLookup> {
        self.resolver
            .srv_lookup(query)
            .await
            .map_err(Error::from_resolve_error)
    }

    /// Look up TXT records for `query`. A name with no TXT records resolves to `None` rather
    /// than an error.
    pub(crate) async fn txt_lookup(&self, query: &str) -> Result<Option<TxtLookup>> {
        match self.resolver.txt_lookup(query).await {
            Ok(lookup) => Ok(Some(lookup)),
            Err(e) if is_no_records_found(&e) => Ok(None),
            Err(e) => Err(Error::from_resolve_error(e)),
        }
    }
}

fn is_no_records_found(error: &ResolveError) -> bool {
    match error.kind() {
        ResolveErrorKind::Proto(proto) => {
            matches!(proto.kind(), ProtoErrorKind::NoRecordsFound { .. })
        }
        _ => false,
    }
}

impl Error {
    pub(crate) fn from_resolve_error(error: ResolveError) -> Self {
        let kind = if is_no_records_found(&error) {
            DnsErrorKind::NoRecords
        } else {
            DnsErrorKind::Resolver
        };
        ErrorKind::DnsResolve {
            kind,
            message: error.to_string(),
        }
        .into()
    }
}

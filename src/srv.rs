use std::time::Duration;

use hickory_proto::rr::RData;
use hickory_resolver::config::ResolverConfig;

use crate::{
    error::{DnsErrorKind, ErrorKind, Result},
    options::ServerAddress,
    runtime::resolver::AsyncResolver,
};

const DEFAULT_SRV_SERVICE_NAME: &str = "mongodb";

/// The hosts and TXT-provided options discovered for a `mongodb+srv` connection string.
#[derive(Debug)]
pub(crate) struct ResolvedConfig {
    pub(crate) hosts: Vec<ServerAddress>,
    pub(crate) min_ttl: Duration,
    pub(crate) auth_source: Option<String>,
    pub(crate) replica_set: Option<String>,
    pub(crate) load_balanced: Option<bool>,
}

#[derive(Debug, Clone)]
pub(crate) struct LookupHosts {
    pub(crate) hosts: Vec<ServerAddress>,
    pub(crate) min_ttl: Duration,
}

/// The original SRV hostname and TTL, retained to allow mongos polling.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OriginalSrvInfo {
    pub(crate) hostname: String,
    pub(crate) min_ttl: Duration,
}

pub(crate) struct SrvResolver {
    resolver: AsyncResolver,
    srv_service_name: Option<String>,
}

impl SrvResolver {
    pub(crate) async fn new(
        config: Option<ResolverConfig>,
        srv_service_name: Option<String>,
    ) -> Result<Self> {
        let resolver = AsyncResolver::new(config).await?;

        Ok(Self {
            resolver,
            srv_service_name,
        })
    }

    pub(crate) async fn resolve_client_options(&self, hostname: &str) -> Result<ResolvedConfig> {
        let lookup_result = self.get_srv_hosts(hostname).await?;
        let mut config = ResolvedConfig {
            hosts: lookup_result.hosts,
            min_ttl: lookup_result.min_ttl,
            auth_source: None,
            replica_set: None,
            load_balanced: None,
        };

        self.get_txt_options(hostname, &mut config).await?;

        Ok(config)
    }

    pub(crate) async fn get_srv_hosts(&self, original_hostname: &str) -> Result<LookupHosts> {
        let service_name = self
            .srv_service_name
            .as_deref()
            .unwrap_or(DEFAULT_SRV_SERVICE_NAME);
        let lookup_hostname = format!("_{}._tcp.{}", service_name, original_hostname);

        let srv_lookup = self.resolver.srv_lookup(lookup_hostname.as_str()).await?;

        let mut records = Vec::new();
        for record in srv_lookup.as_lookup().record_iter() {
            if let RData::SRV(srv) = record.data() {
                records.push(SrvRecord {
                    target: srv.target().to_utf8(),
                    port: srv.port(),
                    ttl: record.ttl(),
                });
            }
        }

        make_lookup_hosts(original_hostname, records)
    }

    async fn get_txt_options(
        &self,
        original_hostname: &str,
        config: &mut ResolvedConfig,
    ) -> Result<()> {
        let txt_records_response = match self.resolver.txt_lookup(original_hostname).await? {
            Some(response) => response,
            None => return Ok(()),
        };
        let records: Vec<String> = txt_records_response
            .iter()
            .map(|record| {
                record
                    .txt_data()
                    .iter()
                    .map(|bytes| String::from_utf8_lossy(bytes.as_ref()).into_owned())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .collect();

        let options = parse_txt_options(original_hostname, &records)?;
        config.auth_source = options.auth_source;
        config.replica_set = options.replica_set;
        config.load_balanced = options.load_balanced;

        Ok(())
    }
}

/// One SRV record as returned by the resolver.
#[derive(Debug, Clone)]
pub(crate) struct SrvRecord {
    pub(crate) target: String,
    pub(crate) port: u16,
    pub(crate) ttl: u32,
}

/// Validate a set of SRV records against the queried hostname and produce the seedlist.
///
/// Every target must be domain-scoped to the queried hostname: it must end, at a `.` label
/// boundary, with the hostname's parent domain (the hostname minus its leftmost label when it
/// has at least three labels; the hostname itself otherwise). A hostname with fewer than three
/// labels additionally must not resolve to itself.
pub(crate) fn make_lookup_hosts(
    original_hostname: &str,
    records: Vec<SrvRecord>,
) -> Result<LookupHosts> {
    if records.is_empty() {
        return Err(ErrorKind::DnsResolve {
            kind: DnsErrorKind::NoRecords,
            message: format!(
                "SRV lookup for {} returned no records",
                original_hostname
            ),
        }
        .into());
    }

    let mut hosts = Vec::new();
    let mut min_ttl = u32::MAX;

    for record in records {
        let target = normalize_hostname(&record.target);
        verify_srv_target(original_hostname, &target)?;

        hosts.push(ServerAddress::Tcp {
            host: target,
            port: Some(record.port),
        });
        min_ttl = std::cmp::min(min_ttl, record.ttl);
    }

    Ok(LookupHosts {
        hosts,
        min_ttl: Duration::from_secs(min_ttl.into()),
    })
}

/// Strip a trailing dot and lowercase.
fn normalize_hostname(hostname: &str) -> String {
    hostname
        .strip_suffix('.')
        .unwrap_or(hostname)
        .to_lowercase()
}

fn verify_srv_target(original_hostname: &str, target: &str) -> Result<()> {
    let hostname = normalize_hostname(original_hostname);
    let labels: Vec<&str> = hostname.split('.').collect();

    let mismatch = || {
        ErrorKind::DnsResolve {
            kind: DnsErrorKind::HostMismatch,
            message: format!(
                "SRV lookup for {} returned result {}, which is not domain-scoped to it",
                original_hostname, target,
            ),
        }
        .into()
    };

    if labels.len() >= 3 {
        let parent_domain = labels[1..].join(".");
        if target != parent_domain && !target.ends_with(&format!(".{}", parent_domain)) {
            return Err(mismatch());
        }
    } else {
        // With fewer than three labels the parent domain is the hostname itself, and a target
        // identical to the queried host is rejected.
        if target == hostname || !target.ends_with(&format!(".{}", hostname)) {
            return Err(mismatch());
        }
    }

    Ok(())
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct ParsedTxtOptions {
    pub(crate) auth_source: Option<String>,
    pub(crate) replica_set: Option<String>,
    pub(crate) load_balanced: Option<bool>,
}

/// Parse the TXT records found for a `mongodb+srv` hostname. At most one record is allowed,
/// and it may only contain the `authSource`, `replicaSet`, and `loadBalanced` options.
pub(crate) fn parse_txt_options(
    original_hostname: &str,
    records: &[String],
) -> Result<ParsedTxtOptions> {
    let mut parsed = ParsedTxtOptions::default();

    let txt_string = match records {
        [] => return Ok(parsed),
        [record] => record,
        _ => {
            return Err(ErrorKind::DnsResolve {
                kind: DnsErrorKind::MultipleTxtRecords,
                message: format!(
                    "TXT lookup for {} returned more than one record, but more than one are \
                     not allowed with 'mongodb+srv'",
                    original_hostname,
                ),
            }
            .into())
        }
    };

    for option_pair in txt_string.split('&') {
        let parts: Vec<_> = option_pair.split('=').collect();

        if parts.len() != 2 {
            return Err(ErrorKind::DnsResolve {
                kind: DnsErrorKind::DisallowedTxtOption,
                message: format!(
                    "TXT record string '{}' is not a valid `key=value` option pair",
                    option_pair
                ),
            }
            .into());
        }

        match &parts[0].to_lowercase()[..] {
            "authsource" => {
                parsed.auth_source = Some(parts[1].to_string());
            }
            "replicaset" => {
                parsed.replica_set = Some(parts[1].to_string());
            }
            "loadbalanced" => {
                let val = match parts[1] {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(ErrorKind::DnsResolve {
                            kind: DnsErrorKind::DisallowedTxtOption,
                            message: format!(
                                "TXT record option 'loadbalanced={}' was returned, only 'true' \
                                 and 'false' are allowed values.",
                                other
                            ),
                        }
                        .into())
                    }
                };
                parsed.load_balanced = Some(val);
            }
            other => {
                return Err(ErrorKind::DnsResolve {
                    kind: DnsErrorKind::DisallowedTxtOption,
                    message: format!(
                        "TXT record option '{}' was returned, but only 'authSource', \
                         'replicaSet', and 'loadBalanced' are allowed",
                        other
                    ),
                }
                .into())
            }
        };
    }

    Ok(parsed)
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(target: &str, port: u16, ttl: u32) -> SrvRecord {
        SrvRecord {
            target: target.to_string(),
            port,
            ttl,
        }
    }

    fn dns_kind(result: Result<LookupHosts>) -> DnsErrorKind {
        match *result.unwrap_err().kind {
            ErrorKind::DnsResolve { kind, .. } => kind,
            ref other => panic!("expected DNS error, got {:?}", other),
        }
    }

    #[test]
    fn targets_in_parent_domain_are_accepted() {
        let hosts = make_lookup_hosts(
            "cluster0.example.mongodb.com",
            vec![
                record("shard0.example.mongodb.com.", 27017, 60),
                record("shard1.example.mongodb.com", 27018, 30),
            ],
        )
        .unwrap();

        assert_eq!(
            hosts
                .hosts
                .iter()
                .map(|h| h.to_string())
                .collect::<Vec<_>>(),
            vec!["shard0.example.mongodb.com:27017", "shard1.example.mongodb.com:27018"]
        );
        assert_eq!(hosts.min_ttl, Duration::from_secs(30));
    }

    #[test]
    fn target_outside_parent_domain_is_rejected() {
        let result = make_lookup_hosts(
            "blogs.mongodb.com",
            vec![record("blogs.evil.com", 27017, 60)],
        );
        assert_eq!(dns_kind(result), DnsErrorKind::HostMismatch);
    }

    #[test]
    fn join_point_must_be_label_boundary() {
        // "evilmongodb.com" ends with "mongodb.com" textually but not at a '.' boundary.
        let result = make_lookup_hosts(
            "blogs.mongodb.com",
            vec![record("a.evilmongodb.com", 27017, 60)],
        );
        assert_eq!(dns_kind(result), DnsErrorKind::HostMismatch);
    }

    #[test]
    fn two_label_hostname_must_not_resolve_to_itself() {
        let result = make_lookup_hosts(
            "mongodb.com",
            vec![record("mongodb.com", 27017, 60)],
        );
        assert_eq!(dns_kind(result), DnsErrorKind::HostMismatch);

        // A target below the two-label host is acceptable.
        let hosts = make_lookup_hosts(
            "mongodb.com",
            vec![record("cluster.mongodb.com", 27017, 60)],
        )
        .unwrap();
        assert_eq!(hosts.hosts.len(), 1);
    }

    #[test]
    fn zero_records_is_an_error() {
        let result = make_lookup_hosts("cluster0.example.com", vec![]);
        assert_eq!(dns_kind(result), DnsErrorKind::NoRecords);
    }

    #[test]
    fn txt_options_accepts_allowed_keys() {
        let parsed = parse_txt_options(
            "cluster0.example.com",
            &["replicaSet=rs0&authSource=admin".to_string()],
        )
        .unwrap();
        assert_eq!(parsed.replica_set.as_deref(), Some("rs0"));
        assert_eq!(parsed.auth_source.as_deref(), Some("admin"));
        assert_eq!(parsed.load_balanced, None);

        let parsed = parse_txt_options(
            "cluster0.example.com",
            &["loadBalanced=true".to_string()],
        )
        .unwrap();
        assert_eq!(parsed.load_balanced, Some(true));
    }

    #[test]
    fn txt_options_rejects_disallowed_keys() {
        let err = parse_txt_options(
            "cluster0.example.com",
            &["maxPoolSize=5".to_string()],
        )
        .unwrap_err();
        assert!(matches!(
            *err.kind,
            ErrorKind::DnsResolve {
                kind: DnsErrorKind::DisallowedTxtOption,
                ..
            }
        ));
    }

    #[test]
    fn multiple_txt_records_are_rejected() {
        let err = parse_txt_options(
            "cluster0.example.com",
            &["replicaSet=rs0".to_string(), "authSource=admin".to_string()],
        )
        .unwrap_err();
        assert!(matches!(
            *err.kind,
            ErrorKind::DnsResolve {
                kind: DnsErrorKind::MultipleTxtRecords,
                ..
            }
        ));
    }
}

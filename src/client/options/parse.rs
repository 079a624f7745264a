use super::{ClientOptions, ConnectionString, HostInfo, ServerAddress};
use crate::{
    error::{Error, Result},
    sdam::choose_n,
    srv::{OriginalSrvInfo, ResolvedConfig, SrvResolver},
};

/// The hosts of a connection string after DNS resolution.
pub(crate) enum ResolvedHostInfo {
    HostIdentifiers(Vec<ServerAddress>),
    DnsRecord {
        hostname: String,
        config: ResolvedConfig,
    },
}

impl HostInfo {
    async fn resolve(
        self,
        resolver_config: Option<super::ResolverConfig>,
        srv_service_name: Option<String>,
    ) -> Result<ResolvedHostInfo> {
        Ok(match self {
            Self::HostIdentifiers(hosts) => ResolvedHostInfo::HostIdentifiers(hosts),
            Self::DnsRecord(hostname) => {
                let resolver = SrvResolver::new(resolver_config, srv_service_name).await?;
                let config = resolver.resolve_client_options(&hostname).await?;
                ResolvedHostInfo::DnsRecord { hostname, config }
            }
        })
    }
}

impl ClientOptions {
    /// Parses a MongoDB connection string into a [`ClientOptions`] struct.
    ///
    /// For `mongodb+srv://` strings this performs the SRV and TXT lookups, validates the
    /// returned hosts against the seedlist domain-scoping rules, and merges TXT-provided
    /// options underneath the URI-provided ones.
    pub async fn parse(s: impl AsRef<str>) -> Result<ClientOptions> {
        Self::parse_connection_string(ConnectionString::parse(s)?).await
    }

    /// Creates a `ClientOptions` from the given parsed [`ConnectionString`], resolving any
    /// DNS seedlist.
    pub async fn parse_connection_string(mut conn_str: ConnectionString) -> Result<ClientOptions> {
        let auth_source_present = conn_str.auth_source.is_some();
        let host_info = std::mem::take(&mut conn_str.host_info);
        let mut options = ClientOptions::from_connection_string(conn_str);

        let resolved = host_info
            .resolve(
                options.resolver_config.clone(),
                options.srv_service_name.clone(),
            )
            .await?;
        options.hosts = match resolved {
            ResolvedHostInfo::HostIdentifiers(hosts) => hosts,
            ResolvedHostInfo::DnsRecord {
                hostname,
                mut config,
            } => {
                // Save the original SRV info to allow mongos polling.
                options.original_srv_info = Some(OriginalSrvInfo {
                    hostname,
                    min_ttl: config.min_ttl,
                });

                // Set the authSource TXT option found during SRV lookup unless the user
                // already set it. Note that this _does_ override the default database
                // specified in the URI, since it is supposed to be overridden by authSource.
                if !auth_source_present {
                    if let Some(auth_source) = config.auth_source.take() {
                        if let Some(ref mut credential) = options.credential {
                            credential.source = Some(auth_source);
                        }
                    }
                }

                // Set the replica set name TXT option found during SRV lookup unless the user
                // already set it.
                if options.repl_set_name.is_none() {
                    if let Some(replica_set) = config.replica_set.take() {
                        options.repl_set_name = Some(replica_set);
                    }
                }

                if options.load_balanced.is_none() {
                    options.load_balanced = config.load_balanced;
                }

                if let Some(max) = options.srv_max_hosts {
                    if max > 0 {
                        if options.repl_set_name.is_some() {
                            return Err(Error::invalid_argument(
                                "srvMaxHosts and replicaSet cannot both be present",
                            ));
                        }
                        if options.load_balanced == Some(true) {
                            return Err(Error::invalid_argument(
                                "srvMaxHosts and loadBalanced=true cannot both be present",
                            ));
                        }
                        config.hosts = choose_n(&config.hosts, max as usize).cloned().collect();
                    }
                }

                // Set the ClientOptions hosts to those found during the SRV lookup.
                config.hosts
            }
        };

        options.validate()?;
        Ok(options)
    }

    fn from_connection_string(conn_str: ConnectionString) -> Self {
        let mut credential = conn_str.credential;
        // The connection string parser has already populated the source from authSource, the
        // default database, or "admin"; keep it as-is.
        if let Some(ref mut credential) = credential {
            if credential.source.is_none() {
                credential.source = conn_str
                    .default_database
                    .clone()
                    .or_else(|| Some("admin".into()));
            }
        }

        Self {
            hosts: vec![],
            app_name: conn_str.app_name,
            connector: None,
            authenticator: None,
            tls: conn_str.tls,
            heartbeat_freq: conn_str.heartbeat_frequency,
            load_balanced: conn_str.load_balanced,
            local_threshold: conn_str.local_threshold,
            read_concern: conn_str.read_concern,
            selection_criteria: conn_str.read_preference.map(Into::into),
            repl_set_name: conn_str.replica_set,
            write_concern: conn_str.write_concern,
            max_pool_size: conn_str.max_pool_size,
            min_pool_size: conn_str.min_pool_size,
            max_connecting: conn_str.max_connecting,
            max_wait_queue_size: None,
            max_idle_time: conn_str.max_idle_time,
            max_life_time: None,
            wait_queue_timeout: conn_str.wait_queue_timeout,
            server_selection_timeout: conn_str.server_selection_timeout,
            connect_timeout: conn_str.connect_timeout,
            retry_reads: conn_str.retry_reads,
            retry_writes: conn_str.retry_writes,
            socket_timeout: conn_str.socket_timeout,
            direct_connection: conn_str.direct_connection,
            default_database: conn_str.default_database,
            timeout: conn_str.timeout,
            credential,
            sdam_event_handlers: vec![],
            cmap_event_handlers: vec![],
            command_event_handlers: vec![],
            original_srv_info: None,
            resolver_config: None,
            srv_max_hosts: conn_str.srv_max_hosts,
            srv_service_name: conn_str.srv_service_name,
            #[cfg(test)]
            test_options: None,
        }
    }
}


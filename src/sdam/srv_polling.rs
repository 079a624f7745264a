use std::time::Duration;

use super::{
    description::topology::{TopologyType, DEFAULT_HEARTBEAT_FREQUENCY},
    topology::{TopologyUpdater, TopologyWatcher},
};
use crate::{
    error::{Error, Result},
    options::ClientOptions,
    runtime,
    srv::{LookupHosts, SrvResolver},
};

const MIN_RESCAN_SRV_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that periodically re-resolves a `mongodb+srv` seedlist and applies the
/// result to the topology. Only sharded and not-yet-determined topologies are polled; record
/// TTLs drive the rescan interval, floored at sixty seconds.
pub(crate) struct SrvPollingMonitor {
    initial_hostname: String,
    resolver: Option<SrvResolver>,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    rescan_interval: Duration,
    client_options: ClientOptions,
}

impl SrvPollingMonitor {
    pub(crate) fn new(
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        mut client_options: ClientOptions,
    ) -> Option<Self> {
        let initial_info = client_options.original_srv_info.take()?;

        Some(Self {
            initial_hostname: initial_info.hostname,
            resolver: None,
            topology_updater,
            topology_watcher,
            rescan_interval: initial_info.min_ttl,
            client_options,
        })
    }

    /// Starts a monitoring task that periodically performs SRV record lookups to determine if
    /// the set of mongos in the cluster have changed. Does nothing for clients that were not
    /// initialized via a `mongodb+srv` connection string.
    pub(crate) fn start(
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        client_options: ClientOptions,
    ) {
        runtime::spawn(async move {
            if let Some(monitor) = Self::new(topology_updater, topology_watcher, client_options)
            {
                monitor.execute().await;
            }
        });
    }

    fn rescan_interval(&self) -> Duration {
        std::cmp::max(self.rescan_interval, MIN_RESCAN_SRV_INTERVAL)
    }

    async fn execute(mut self) {
        fn should_poll(tt: TopologyType) -> bool {
            matches!(tt, TopologyType::Sharded | TopologyType::Unknown)
        }

        while self.topology_watcher.is_alive() {
            runtime::delay_for(self.rescan_interval()).await;

            if !self.topology_watcher.is_alive() {
                break;
            }

            if should_poll(self.topology_watcher.peek_latest().description.topology_type()) {
                let lookup = self.lookup_hosts().await;

                // Verify that we should still update before applying the lookup, in case the
                // topology changed while it was in flight.
                if should_poll(
                    self.topology_watcher.peek_latest().description.topology_type(),
                ) {
                    self.update_hosts(lookup).await;
                }
            }
        }
    }

    async fn update_hosts(&mut self, lookup: Result<LookupHosts>) {
        let lookup = match lookup {
            Ok(LookupHosts { hosts, .. }) if hosts.is_empty() => {
                self.no_valid_hosts(None);
                return;
            }
            Ok(lookup) => lookup,
            Err(err) => {
                self.no_valid_hosts(Some(err));
                return;
            }
        };

        self.rescan_interval = lookup.min_ttl;

        self.topology_updater.sync_hosts(lookup.hosts).await;
    }

    async fn lookup_hosts(&mut self) -> Result<LookupHosts> {
        #[cfg(test)]
        if let Some(mock) = self
            .client_options
            .test_options
            .as_ref()
            .and_then(|to| to.mock_lookup_hosts.as_ref())
        {
            return mock.clone();
        }
        let initial_hostname = self.initial_hostname.clone();
        let resolver = self.get_or_create_srv_resolver().await?;
        resolver.get_srv_hosts(initial_hostname.as_str()).await
    }

    async fn get_or_create_srv_resolver(&mut self) -> Result<&SrvResolver> {
        if let Some(ref resolver) = self.resolver {
            return Ok(resolver);
        }

        let resolver = SrvResolver::new(
            self.client_options.resolver_config.clone(),
            self.client_options.srv_service_name.clone(),
        )
        .await?;

        // Since the resolver was not `Some` above, this will always insert the new resolver
        // and return a reference to it.
        Ok(self.resolver.get_or_insert(resolver))
    }

    fn no_valid_hosts(&mut self, error: Option<Error>) {
        match error {
            Some(error) => {
                tracing::warn!(
                    hostname = self.initial_hostname.as_str(),
                    "SRV lookup failed during rescan: {}",
                    error
                );
            }
            None => {
                tracing::warn!(
                    hostname = self.initial_hostname.as_str(),
                    "SRV rescan returned no valid hosts"
                );
            }
        }

        // Back off to the heartbeat cadence until records reappear.
        self.rescan_interval = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);
    }
}

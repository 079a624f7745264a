use std::{collections::HashMap, fmt, ops::Deref, sync::Arc, time::Duration};

use bson::DateTime;

use super::TopologyDescription;
use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::{
        description::{
            server::{ServerDescription, ServerType},
            topology::TopologyType,
        },
        public::ServerInfo,
        Server,
    },
    selection_criteria::{
        ReadPreference,
        ReadPreferenceOptions,
        ReadPreferenceWithFallback,
        SelectionCriteria,
        TagSet,
    },
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// Struct encapsulating a selected server that handles the operation count accounting.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    fn new(server: Arc<Server>) -> Self {
        server.increment_operation_count();
        Self { server }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.server.address
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        self.server.deref()
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.server.decrement_operation_count();
    }
}

/// Attempt to select a server, returning `None` if no server could be selected
/// that matched the provided criteria.
///
/// `servers` must be a snapshot taken atomically with `topology_description` so operation
/// counts line up with the described servers.
pub(crate) fn attempt_to_select_server<'a>(
    criteria: &'a SelectionCriteria,
    topology_description: &'a TopologyDescription,
    servers: &'a HashMap<ServerAddress, Arc<Server>>,
    deprioritized: Option<&ServerAddress>,
) -> Result<Option<SelectedServer>> {
    let mut in_window = topology_description.suitable_servers_in_latency_window(criteria)?;
    if let Some(addr) = deprioritized {
        if in_window.len() > 1 {
            in_window.retain(|d| &d.address != addr);
        }
    }
    let in_window_servers = in_window
        .into_iter()
        .flat_map(|desc| servers.get(&desc.address))
        .collect();
    let selected = select_server_in_latency_window(in_window_servers);
    Ok(selected.map(SelectedServer::new))
}

/// Choose a server from several suitable choices within the latency window according to
/// the algorithm laid out in the server selection specification: pick two at random and
/// take the one with the fewer in-flight operations.
fn select_server_in_latency_window(in_window: Vec<&Arc<Server>>) -> Option<Arc<Server>> {
    if in_window.is_empty() {
        return None;
    } else if in_window.len() == 1 {
        return Some(in_window[0].clone());
    }

    super::choose_n(&in_window, 2)
        .min_by_key(|s| s.operation_count())
        .map(|server| (*server).clone())
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {:?}. Topology: {}",
                criteria, self
            )
        } else {
            format!(
                "Server selection timeout: No available servers. Topology: {}",
                self
            )
        }
    }

    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::IncompatibleServer {
                message: message.to_string(),
            }
            .into());
        }

        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => self.suitable_servers(read_pref)?,
            SelectionCriteria::ReadPreferenceWithFallback(ref fallback) => {
                self.suitable_servers(self.resolve_fallback(fallback))?
            }
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .values()
                .filter(|s| {
                    // If we're direct-connected or connected to a standalone, ignore whether
                    // the single server in the topology is data-bearing.
                    (self.topology_type == TopologyType::Single || s.server_type.is_data_bearing())
                        && filter(&ServerInfo::new_borrowed(s))
                })
                .collect(),
        };

        self.retain_servers_within_latency_window(&mut suitable_servers);

        Ok(suitable_servers)
    }

    /// Picks the preferred or fallback read preference: the fallback applies while any
    /// available server predates the cutoff wire version.
    fn resolve_fallback<'a>(
        &self,
        fallback: &'a ReadPreferenceWithFallback,
    ) -> &'a ReadPreference {
        let any_predates_cutoff = self.servers.values().any(|s| {
            s.is_available()
                && matches!(
                    s.max_wire_version(),
                    Ok(Some(v)) if v < fallback.cutoff_wire_version
                )
        });
        if any_predates_cutoff {
            &fallback.fallback
        } else {
            &fallback.preferred
        }
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    fn suitable_servers(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let servers = match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single | TopologyType::LoadBalanced => self.servers.values().collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)?
            }
        };

        Ok(servers)
    }

    fn retain_servers_within_latency_window(
        &self,
        suitable_servers: &mut Vec<&ServerDescription>,
    ) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .fold(Option::<Duration>::None, |min, curr| match min {
                Some(prev) => Some(prev.min(curr)),
                None => Some(curr),
            });

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window = shortest_average_rtt
            .map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(move |server_desc| {
            if let (Some(server_rtt), Some(max_rtt)) =
                (server_desc.average_round_trip_time, max_rtt_within_window)
            {
                server_rtt <= max_rtt
            } else {
                // SDAM isn't performed with a load balanced topology, so the load balancer
                // won't have an RTT. Instead, we just select it.
                matches!(server_desc.server_type, ServerType::LoadBalancer)
            }
        });
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    pub(crate) fn primary(&self) -> Option<&ServerDescription> {
        self.servers_with_type(&[ServerType::RsPrimary]).next()
    }

    /// Candidates for a replica-set read. The preference mode decides which member kinds are
    /// admitted and which fallbacks apply; non-primary candidates then flow through the
    /// eligibility pipeline of [`eligible_members`](Self::eligible_members).
    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let suitable = match read_preference {
            ReadPreference::Primary => self.primary().into_iter().collect(),
            ReadPreference::PrimaryPreferred { options } => match self.primary() {
                Some(primary) => vec![primary],
                None => self.eligible_members(MemberKind::Secondaries, options)?,
            },
            ReadPreference::Secondary { options } => {
                self.eligible_members(MemberKind::Secondaries, options)?
            }
            ReadPreference::SecondaryPreferred { options } => {
                let secondaries = self.eligible_members(MemberKind::Secondaries, options)?;
                if secondaries.is_empty() {
                    self.primary().into_iter().collect()
                } else {
                    secondaries
                }
            }
            ReadPreference::Nearest { options } => {
                self.eligible_members(MemberKind::Any, options)?
            }
        };

        Ok(suitable)
    }

    /// The composable eligibility pipeline for non-primary reads: admit members of `kind`,
    /// drop secondaries outside the staleness bound, then keep the first matching tag set.
    fn eligible_members(
        &self,
        kind: MemberKind,
        options: &ReadPreferenceOptions,
    ) -> Result<Vec<&ServerDescription>> {
        let mut members: Vec<&ServerDescription> = self
            .servers
            .values()
            .filter(|server| kind.admits(server.server_type))
            .collect();

        if let Some(bound) = options.max_staleness {
            super::verify_max_staleness(bound, self.heartbeat_frequency())?;

            // A bound of zero means no bound at all.
            if bound > Duration::ZERO {
                let reference = self.newest_write_date();
                let heartbeat_frequency = self.heartbeat_frequency();
                members.retain(|server| {
                    // The primary is the replication source and is never stale itself.
                    server.server_type == ServerType::RsPrimary
                        || self.staleness_within_bound(
                            server,
                            reference,
                            heartbeat_frequency,
                            bound,
                        )
                });
            }
        }

        if let Some(tag_sets) = options.tag_sets.as_ref() {
            retain_first_matching_tag_set(&mut members, tag_sets);
        }

        Ok(members)
    }

    /// The reference point staleness is measured against: the primary's last reported write,
    /// or the newest write reported by any secondary when no primary is known.
    fn newest_write_date(&self) -> Option<DateTime> {
        match self.primary() {
            Some(primary) => primary.last_write_date().ok().flatten(),
            None => self
                .servers_with_type(&[ServerType::RsSecondary])
                .filter_map(|server| server.last_write_date().ok().flatten())
                .max_by_key(|date| date.timestamp_millis()),
        }
    }

    fn staleness_within_bound(
        &self,
        secondary: &ServerDescription,
        reference: Option<DateTime>,
        heartbeat_frequency: Duration,
        bound: Duration,
    ) -> bool {
        let Some(reference) = reference else {
            // No member has reported a write date yet, so no estimate is possible and the
            // bound cannot exclude anyone.
            return true;
        };
        let last_write = match secondary.last_write_date() {
            Ok(Some(date)) => date,
            // A secondary that reports no write date cannot be shown to satisfy the bound.
            _ => return false,
        };
        estimated_staleness(last_write, reference, heartbeat_frequency) <= bound
    }
}

/// Which replica-set member types a read preference mode admits before filtering.
#[derive(Clone, Copy, Debug)]
enum MemberKind {
    Secondaries,
    Any,
}

impl MemberKind {
    fn admits(self, server_type: ServerType) -> bool {
        match self {
            MemberKind::Secondaries => server_type == ServerType::RsSecondary,
            MemberKind::Any => {
                matches!(server_type, ServerType::RsPrimary | ServerType::RsSecondary)
            }
        }
    }
}

/// Estimated staleness of a secondary whose newest write is `last_write`, measured against
/// the topology's newest write at `reference`:
///
/// `max(reference.lastWriteDate - secondary.lastWriteDate + heartbeatFrequency,
/// heartbeatFrequency)`
///
/// The heartbeat term accounts for the write lag that can accrue between checks; the floor
/// keeps clock skew between members from producing an estimate below one heartbeat.
fn estimated_staleness(
    last_write: DateTime,
    reference: DateTime,
    heartbeat_frequency: Duration,
) -> Duration {
    let lag_ms = reference.timestamp_millis() - last_write.timestamp_millis();
    let heartbeat_ms = i64::try_from(heartbeat_frequency.as_millis()).unwrap_or(i64::MAX);
    let staleness_ms = lag_ms.saturating_add(heartbeat_ms).max(heartbeat_ms);
    Duration::from_millis(u64::try_from(staleness_ms).unwrap_or(u64::MAX))
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {}", set_name)?;
        }

        if let Some(max_set_version) = self.max_set_version {
            write!(f, ", Max Set Version: {}", max_set_version)?;
        }

        if let Some(max_election_id) = self.max_election_id {
            write!(f, ", Max Election ID: {}", max_election_id)?;
        }

        if let Some(ref compatibility_error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {}", compatibility_error)?;
        }

        if !self.servers.is_empty() {
            write!(f, ", Servers: [ ")?;
            let mut iter = self.servers.values();
            if let Some(server) = iter.next() {
                write!(f, "{}", ServerInfo::new_borrowed(server))?;
            }
            for server in iter {
                write!(f, ", {}", ServerInfo::new_borrowed(server))?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

/// Tag sets are tried in order; the first one any candidate matches keeps exactly the
/// candidates matching it. When no tag set matches at all, no candidate is suitable. An
/// empty list of tag sets admits everything.
fn retain_first_matching_tag_set(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    let first_match = tag_sets
        .iter()
        .find(|tag_set| servers.iter().any(|server| server.matches_tag_set(tag_set)));

    match first_match {
        Some(tag_set) => servers.retain(|server| server.matches_tag_set(tag_set)),
        None => servers.clear(),
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{
        hello::LastWrite,
        options::ClientOptions,
        sdam::description::server::test_helpers::{rs_primary, rs_secondary},
    };

    fn rs_description(rtts_ms: &[(&str, u64, bool)]) -> TopologyDescription {
        let hosts: Vec<&str> = rtts_ms.iter().map(|(h, _, _)| *h).collect();
        let options = ClientOptions::builder()
            .hosts(
                hosts
                    .iter()
                    .map(|h| crate::options::ServerAddress::parse(h).unwrap())
                    .collect::<Vec<_>>(),
            )
            .build();
        let mut description = TopologyDescription::default();
        description.initialize(&options);

        for (host, rtt, is_primary) in rtts_ms {
            let mut sd = if *is_primary {
                rs_primary(host, "rs0", &hosts, 1, 1)
            } else {
                rs_secondary(host, "rs0", &hosts)
            };
            sd.average_round_trip_time = Some(Duration::from_millis(*rtt));
            description.update(sd).unwrap();
        }

        description
    }

    fn set_last_write(description: &mut TopologyDescription, host: &str, millis: i64) {
        let address = crate::options::ServerAddress::parse(host).unwrap();
        let mut sd = description.servers.get(&address).unwrap().clone();
        if let Ok(Some(ref mut reply)) = sd.reply {
            reply.command_response.last_write = Some(LastWrite {
                last_write_date: DateTime::from_millis(millis),
            });
        }
        description.servers.insert(address, sd);
    }

    #[test]
    fn latency_window_filters_slow_servers() {
        let description = rs_description(&[
            ("a:27017", 5, true),
            ("b:27017", 10, false),
            ("c:27017", 100, false),
        ]);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest {
            options: Default::default(),
        });
        let suitable = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();

        // Default local threshold is 15ms, so only servers within 5ms + 15ms qualify.
        let min_rtt = Duration::from_millis(5);
        for server in &suitable {
            let rtt = server.average_round_trip_time.unwrap();
            assert!(rtt - min_rtt <= Duration::from_millis(15));
        }
        assert_eq!(suitable.len(), 2);
    }

    #[test]
    fn writable_selection_returns_primary_only() {
        let description = rs_description(&[
            ("a:27017", 5, true),
            ("b:27017", 5, false),
        ]);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let suitable = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].server_type, ServerType::RsPrimary);
    }

    #[test]
    fn secondary_preferred_falls_back_to_primary() {
        let description = rs_description(&[("a:27017", 5, true)]);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred {
            options: Default::default(),
        });
        let suitable = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].server_type, ServerType::RsPrimary);
    }

    #[test]
    fn staleness_estimate_matches_formula() {
        let heartbeat = Duration::from_secs(10);
        let reference = DateTime::from_millis(1_000_000);

        // A secondary 30 seconds behind the reference write: 30s + 10s.
        let behind = DateTime::from_millis(1_000_000 - 30_000);
        assert_eq!(
            estimated_staleness(behind, reference, heartbeat),
            Duration::from_secs(40)
        );

        // A secondary exactly at the reference write still accrues one heartbeat of lag.
        assert_eq!(
            estimated_staleness(reference, reference, heartbeat),
            Duration::from_secs(10)
        );

        // Clock skew can put a secondary's write date "ahead" of the reference; the estimate
        // floors at one heartbeat instead of going below it.
        let ahead = DateTime::from_millis(1_000_000 + 5_000);
        assert_eq!(
            estimated_staleness(ahead, reference, heartbeat),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn max_staleness_excludes_lagging_secondaries() {
        let mut description = rs_description(&[
            ("a:27017", 5, true),
            ("b:27017", 5, false),
            ("c:27017", 5, false),
        ]);

        // The primary's newest write is the reference; b lags it by 50s and c by 200s.
        set_last_write(&mut description, "a:27017", 1_000_000);
        set_last_write(&mut description, "b:27017", 1_000_000 - 50_000);
        set_last_write(&mut description, "c:27017", 1_000_000 - 200_000);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .max_staleness(Duration::from_secs(120))
                .build(),
        });
        let suitable = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();

        // With the default 10s heartbeat, b is 60s stale and c is 210s stale.
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address.to_string(), "b:27017");

        // Under Nearest the primary is admitted regardless of the staleness bound.
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest {
            options: ReadPreferenceOptions::builder()
                .max_staleness(Duration::from_secs(120))
                .build(),
        });
        let mut addresses: Vec<String> = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap()
            .iter()
            .map(|server| server.address.to_string())
            .collect();
        addresses.sort();
        assert_eq!(addresses, vec!["a:27017", "b:27017"]);
    }

    #[test]
    fn max_staleness_below_minimum_is_rejected() {
        let description = rs_description(&[("a:27017", 5, true), ("b:27017", 5, false)]);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .max_staleness(Duration::from_secs(10))
                .build(),
        });
        assert!(description
            .suitable_servers_in_latency_window(&criteria)
            .is_err());
    }

    #[test]
    fn first_matching_tag_set_wins() {
        let mut description = rs_description(&[
            ("a:27017", 5, true),
            ("b:27017", 5, false),
            ("c:27017", 5, false),
        ]);

        // Tag b with dc=ny and c with dc=sf.
        for (host, dc) in [("b:27017", "ny"), ("c:27017", "sf")] {
            let address = crate::options::ServerAddress::parse(host).unwrap();
            let mut sd = description.servers.get(&address).unwrap().clone();
            if let Ok(Some(ref mut reply)) = sd.reply {
                reply.command_response.tags =
                    Some([("dc".to_string(), dc.to_string())].into_iter().collect());
            }
            description.servers.insert(address, sd);
        }

        let tag_sets = vec![
            [("dc".to_string(), "tokyo".to_string())].into_iter().collect(),
            [("dc".to_string(), "sf".to_string())].into_iter().collect(),
        ];
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder().tag_sets(tag_sets).build(),
        });

        let suitable = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address.to_string(), "c:27017");
    }

    #[test]
    fn fallback_read_preference_applies_for_old_servers() {
        let description = rs_description(&[
            ("a:27017", 5, true),
            ("b:27017", 5, false),
        ]);

        let criteria =
            SelectionCriteria::ReadPreferenceWithFallback(ReadPreferenceWithFallback {
                preferred: ReadPreference::Secondary {
                    options: Default::default(),
                },
                fallback: ReadPreference::Primary,
                // All test servers report max wire version 17, which predates this cutoff, so
                // the fallback applies.
                cutoff_wire_version: 99,
            });
        let suitable = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].server_type, ServerType::RsPrimary);

        let criteria =
            SelectionCriteria::ReadPreferenceWithFallback(ReadPreferenceWithFallback {
                preferred: ReadPreference::Secondary {
                    options: Default::default(),
                },
                fallback: ReadPreference::Primary,
                cutoff_wire_version: 8,
            });
        let suitable = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].server_type, ServerType::RsSecondary);
    }

    #[test]
    fn selection_is_stable_under_noise() {
        let description = rs_description(&[
            ("a:27017", 5, true),
            ("b:27017", 10, false),
            ("c:27017", 100, false),
        ]);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest {
            options: Default::default(),
        });

        let mut expected: Vec<_> = description
            .suitable_servers_in_latency_window(&criteria)
            .unwrap()
            .iter()
            .map(|s| s.address.clone())
            .collect();
        expected.sort_by_key(|a| a.to_string());

        for _ in 0..10 {
            let mut actual: Vec<_> = description
                .suitable_servers_in_latency_window(&criteria)
                .unwrap()
                .iter()
                .map(|s| s.address.clone())
                .collect();
            actual.sort_by_key(|a| a.to_string());
            assert_eq!(actual, expected);
        }
    }
}

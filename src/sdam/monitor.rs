use std::time::{Duration, Instant};

use super::{
    description::server::{ServerDescription, TopologyVersion},
    topology::{CheckRequestReceiver, TopologyUpdater, TopologyWatcher},
};
use crate::{
    cmap::{conn::Connection, ConnectionEstablisher},
    error::{Error, Result},
    event::sdam::{
        SdamEventEmitter,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, AwaitableHelloOptions, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime,
    sdam::description::topology::DEFAULT_HEARTBEAT_FREQUENCY,
};

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Monitor that performs regular heartbeats to determine server status. One monitor runs per
/// non-load-balanced server; it exits when the topology is dropped or its server is removed
/// from the topology.
pub(crate) struct Monitor {
    address: ServerAddress,

    /// The dedicated monitoring connection. Never drawn from the server's pool.
    connection: Option<Connection>,

    /// The check mode state machine. Polling flips to streaming after two successive
    /// successful polls that carry a topology version; any connection error flips it back.
    mode: CheckMode,

    /// Exponentially weighted moving average of this server's check round-trip time.
    average_rtt: Option<Duration>,

    establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    event_emitter: SdamEventEmitter,
    check_request_receiver: CheckRequestReceiver,
    options: ClientOptions,
}

#[derive(Debug, Clone, Copy)]
enum CheckMode {
    Polling {
        /// How many successive successful polls have reported a topology version.
        successive_topology_versions: u8,
    },
    Streaming {
        topology_version: TopologyVersion,
    },
}

impl CheckMode {
    fn polling() -> Self {
        CheckMode::Polling {
            successive_topology_versions: 0,
        }
    }
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        event_emitter: SdamEventEmitter,
        check_request_receiver: CheckRequestReceiver,
        establisher: ConnectionEstablisher,
        options: ClientOptions,
    ) {
        let monitor = Self {
            address,
            connection: None,
            mode: CheckMode::polling(),
            average_rtt: None,
            establisher,
            topology_updater,
            topology_watcher,
            event_emitter,
            check_request_receiver,
            options,
        };
        runtime::spawn(monitor.execute());
    }

    fn heartbeat_frequency(&self) -> Duration {
        self.options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self.heartbeat_frequency();

        while self.is_alive() {
            self.check_server().await;

            if !self.is_alive() {
                break;
            }

            match self.mode {
                // In streaming mode the server pushes changes through awaitable hellos, so the
                // next check is issued immediately.
                CheckMode::Streaming { .. } => continue,
                CheckMode::Polling { .. } => {
                    #[cfg(test)]
                    let min_frequency = self
                        .options
                        .test_options
                        .as_ref()
                        .and_then(|to| to.min_heartbeat_freq)
                        .unwrap_or(MIN_HEARTBEAT_FREQUENCY);
                    #[cfg(not(test))]
                    let min_frequency = MIN_HEARTBEAT_FREQUENCY;

                    runtime::delay_for(min_frequency).await;
                    self.check_request_receiver
                        .wait_for_check_request(
                            heartbeat_frequency.saturating_sub(min_frequency),
                        )
                        .await;
                }
            }
        }

        if let Some(mut connection) = self.connection.take() {
            connection.shutdown();
        }
    }

    /// Whether the monitor should keep running: its topology is alive and its server is still
    /// part of the topology.
    fn is_alive(&self) -> bool {
        self.topology_watcher.is_alive()
            && self
                .topology_watcher
                .server_description(&self.address)
                .is_some()
    }

    /// Checks the server by running a hello command. If the check fails with a network error
    /// and the server was previously available, the check is retried once on a fresh
    /// connection before the server is marked Unknown.
    async fn check_server(&mut self) -> bool {
        self.check_request_receiver.clear_check_requests();
        let mut retried = false;
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let previous_description =
                    self.topology_watcher.server_description(&self.address);
                if e.is_network_error()
                    && previous_description
                        .map(|sd| sd.is_available())
                        .unwrap_or(false)
                {
                    self.handle_error(e).await;
                    retried = true;
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                self.transition_check_mode(&reply);
                let server_description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    self.average_rtt.unwrap_or(Duration::ZERO),
                );
                self.topology_updater.update(server_description).await
            }
            Err(e) => self.handle_error(e).await || retried,
        }
    }

    /// Advance the Polling ⇄ Streaming state machine after a successful check.
    fn transition_check_mode(&mut self, reply: &HelloReply) {
        self.mode = next_check_mode(self.mode, reply.command_response.topology_version);
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        let awaitable_options = match (&self.mode, &self.connection) {
            (CheckMode::Streaming { topology_version }, Some(_)) => {
                Some(AwaitableHelloOptions {
                    topology_version: *topology_version,
                    max_await_time: self.heartbeat_frequency(),
                })
            }
            _ => None,
        };
        let awaited = awaitable_options.is_some();

        self.emit_event(|| {
            ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                awaited,
            }
            .into()
        });

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                let command = hello_command(
                    None,
                    Some(conn.stream_description()?.hello_ok),
                    awaitable_options,
                );
                match awaitable_options {
                    Some(options) => {
                        // Bound the awaitable hello so a hung server cannot wedge the monitor
                        // past its await window.
                        let limit = options.max_await_time + MONITOR_TIMEOUT_BUFFER;
                        runtime::timeout(limit, run_hello(conn, command))
                            .await
                            .and_then(std::convert::identity)
                    }
                    None => run_hello(conn, command).await,
                }
            }
            None => {
                let result = self
                    .establisher
                    .establish_monitoring_connection(self.address.clone())
                    .await;
                match result {
                    Ok((connection, reply)) => {
                        self.connection = Some(connection);
                        Ok(reply)
                    }
                    Err(e) => Err(e),
                }
            }
        };
        let duration = start.elapsed();

        match result {
            Ok(ref reply) => {
                // Awaitable hellos spend up to maxAwaitTimeMS parked on the server, so they
                // are not round-trip samples.
                if !awaited {
                    self.update_average_rtt(duration);
                }
                let reply_doc = reply.raw_command_response.clone();
                self.emit_event(|| {
                    ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply_doc,
                        server_address: self.address.clone(),
                        awaited,
                    }
                    .into()
                });
            }
            Err(ref e) => {
                if let Some(mut connection) = self.connection.take() {
                    connection.shutdown();
                }
                self.mode = CheckMode::polling();
                self.average_rtt = None;
                self.emit_event(|| {
                    ServerHeartbeatFailedEvent {
                        duration,
                        failure: e.clone(),
                        server_address: self.address.clone(),
                        awaited,
                    }
                    .into()
                });
            }
        }

        result
    }

    /// Fold a new sample into the RTT moving average: `0.2·sample + 0.8·previous`.
    fn update_average_rtt(&mut self, sample: Duration) {
        self.average_rtt = Some(match self.average_rtt {
            Some(previous) => {
                Duration::from_secs_f64(0.2 * sample.as_secs_f64() + 0.8 * previous.as_secs_f64())
            }
            None => sample,
        });
    }

    async fn handle_error(&mut self, error: Error) -> bool {
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }

    fn emit_event<F>(&self, event: F)
    where
        F: FnOnce() -> crate::event::sdam::SdamEvent,
    {
        self.event_emitter.emit_event(event)
    }
}

/// Slack added on top of `maxAwaitTimeMS` before an awaitable hello is abandoned.
const MONITOR_TIMEOUT_BUFFER: Duration = Duration::from_secs(10);

/// The successor of `mode` after a successful check that reported `topology_version`.
/// Streaming requires two successive successful polls carrying a topology version; a server
/// that stops reporting one no longer supports awaitable hellos.
fn next_check_mode(mode: CheckMode, topology_version: Option<TopologyVersion>) -> CheckMode {
    match (mode, topology_version) {
        (
            CheckMode::Polling {
                successive_topology_versions,
            },
            Some(tv),
        ) => {
            if successive_topology_versions + 1 >= 2 {
                CheckMode::Streaming {
                    topology_version: tv,
                }
            } else {
                CheckMode::Polling {
                    successive_topology_versions: successive_topology_versions + 1,
                }
            }
        }
        (CheckMode::Streaming { .. }, Some(tv)) => CheckMode::Streaming {
            topology_version: tv,
        },
        (_, None) => CheckMode::polling(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sdam::description::server::test_helpers::hello_reply;

    fn reply_with_tv(counter: i64) -> HelloReply {
        let mut reply = hello_reply("a:27017");
        reply.command_response.topology_version = Some(TopologyVersion {
            process_id: bson::oid::ObjectId::new(),
            counter,
        });
        reply
    }

    #[test]
    fn streaming_requires_two_successive_topology_versions() {
        let mut mode = CheckMode::polling();

        mode = next_check_mode(mode, reply_with_tv(1).command_response.topology_version);
        assert!(matches!(
            mode,
            CheckMode::Polling {
                successive_topology_versions: 1
            }
        ));

        mode = next_check_mode(mode, reply_with_tv(2).command_response.topology_version);
        assert!(matches!(mode, CheckMode::Streaming { .. }));

        // A reply with no topology version falls back to polling from scratch.
        mode = next_check_mode(mode, None);
        assert!(matches!(
            mode,
            CheckMode::Polling {
                successive_topology_versions: 0
            }
        ));
    }

    #[test]
    fn rtt_ewma_weighting() {
        let mut average = None::<Duration>;
        let mut update = |avg: &mut Option<Duration>, sample_ms: u64| {
            let sample = Duration::from_millis(sample_ms);
            *avg = Some(match *avg {
                Some(previous) => Duration::from_secs_f64(
                    0.2 * sample.as_secs_f64() + 0.8 * previous.as_secs_f64(),
                ),
                None => sample,
            });
        };

        update(&mut average, 100);
        assert_eq!(average, Some(Duration::from_millis(100)));

        update(&mut average, 200);
        // 0.2 * 200 + 0.8 * 100 = 120
        let avg = average.unwrap();
        assert!((avg.as_secs_f64() - 0.120).abs() < 1e-9);
    }
}

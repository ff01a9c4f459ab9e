use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use super::{
    description::server::ServerDescription,
    topology::{TopologyCheckRequestReceiver, TopologyUpdater, TopologyWatcher},
    TopologyVersion,
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::{Error, Result},
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, AwaitableHelloOptions, HelloReply},
    options::{ClientOptions, ServerAddress, ServerMonitoringMode},
    runtime,
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// The weight applied to a new round-trip-time sample when folding it into the exponentially
/// weighted moving average.
const RTT_EWMA_WEIGHT: f64 = 0.2;

/// Monitor that performs regular heartbeats to determine server status.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    event_emitter: SdamEventEmitter,
    update_request_receiver: TopologyCheckRequestReceiver,
    client_options: ClientOptions,

    /// The most recent topology version returned by the server. Used to issue awaitable hello
    /// commands in streaming mode.
    topology_version: Option<TopologyVersion>,

    /// The handle to the RTT monitor, spawned lazily when streaming mode begins. In streaming
    /// mode, the heartbeat connection blocks in reads, so a separate single-purpose connection
    /// measures round trip times.
    rtt_monitor_started: bool,

    rtt_info: RttInfo,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        event_emitter: SdamEventEmitter,
        update_request_receiver: TopologyCheckRequestReceiver,
        establisher: ConnectionEstablisher,
        client_options: ClientOptions,
    ) {
        let monitor = Self {
            address,
            client_options,
            establisher,
            topology_updater,
            topology_watcher,
            event_emitter,
            update_request_receiver,
            connection: None,
            topology_version: None,
            rtt_monitor_started: false,
            rtt_info: RttInfo::default(),
        };
        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self.heartbeat_frequency();

        while self.is_alive() {
            self.check_server().await;

            if !self.is_alive() {
                break;
            }

            // In streaming mode the server pushes updates over the held-open reply, so the
            // next iteration can block in the read immediately.
            if self.is_streaming() {
                continue;
            }

            let min_frequency = self.min_heartbeat_frequency();

            runtime::delay_for(min_frequency).await;
            self.update_request_receiver
                .wait_for_check_request(
                    heartbeat_frequency
                        .checked_sub(min_frequency)
                        .unwrap_or(Duration::from_millis(0)),
                )
                .await;
        }
    }

    fn is_alive(&self) -> bool {
        self.topology_watcher.is_alive() && self.topology_watcher.server_exists(&self.address)
    }

    fn is_streaming(&self) -> bool {
        self.connection
            .as_ref()
            .map(|conn| conn.is_streaming())
            .unwrap_or(false)
    }

    fn heartbeat_frequency(&self) -> Duration {
        self.client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    fn min_heartbeat_frequency(&self) -> Duration {
        #[cfg(test)]
        {
            self.client_options
                .test_options
                .as_ref()
                .and_then(|to| to.min_heartbeat_freq)
                .unwrap_or(MIN_HEARTBEAT_FREQUENCY)
        }

        #[cfg(not(test))]
        MIN_HEARTBEAT_FREQUENCY
    }

    fn streaming_enabled(&self) -> bool {
        !matches!(
            self.client_options.server_monitoring_mode,
            Some(ServerMonitoringMode::Poll)
        )
    }

    /// Checks the server by running a hello command. If an I/O error occurs, the connection is
    /// replaced with a new one and one immediate retry is attempted.
    ///
    /// Returns true if the topology has changed and false otherwise.
    async fn check_server(&mut self) -> bool {
        self.update_request_receiver.clear_check_requests();
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
                let server_description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    self.rtt_info.average().unwrap_or(Duration::from_millis(0)),
                );
                self.topology_version = server_description.topology_version();
                self.topology_updater.update(server_description).await
            }
            Err(e) => self.handle_error(e).await || retried,
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        let awaited = self.is_streaming()
            || (self.streaming_enabled()
                && self.connection.is_some()
                && self.topology_version.is_some());

        self.event_emitter.emit_event(|| {
            SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                awaited,
            })
        });

        let heartbeat_frequency = self.heartbeat_frequency();
        let streaming_enabled = self.streaming_enabled();
        // Allow the server the full maxAwaitTimeMS plus time for the reply to cross the
        // network before giving up on a streamed check.
        let streaming_read_timeout = heartbeat_frequency
            + self
                .client_options
                .connect_timeout
                .unwrap_or(crate::runtime::stream::DEFAULT_CONNECT_TIMEOUT);

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) if conn.is_streaming() => {
                runtime::timeout(streaming_read_timeout, conn.receive_message())
                    .await
                    .and_then(std::convert::identity)
                    .and_then(|response| response.into_hello_reply())
            }
            Some(ref mut conn) => {
                let command = match (streaming_enabled, self.topology_version) {
                    (true, Some(topology_version)) => {
                        // Begin streaming: ask the server to hold the reply open and push
                        // state changes as they happen.
                        if !self.rtt_monitor_started {
                            RttMonitor::start(
                                self.address.clone(),
                                self.establisher.clone(),
                                self.topology_watcher.clone(),
                                self.rtt_info.clone(),
                                heartbeat_frequency,
                            );
                            self.rtt_monitor_started = true;
                        }
                        hello_command(
                            self.client_options.load_balanced,
                            Some(conn.stream_description()?.hello_ok),
                            Some(AwaitableHelloOptions {
                                topology_version,
                                max_await_time: heartbeat_frequency,
                            }),
                        )
                    }
                    _ => hello_command(
                        self.client_options.load_balanced,
                        Some(conn.stream_description()?.hello_ok),
                        None,
                    ),
                };

                let result = runtime::timeout(streaming_read_timeout, async {
                    conn.send_command(command, None)
                        .await
                        .and_then(|response| response.into_hello_reply())
                })
                .await
                .and_then(std::convert::identity);

                if !awaited {
                    // In polling mode this connection doubles as the RTT measurement
                    // connection.
                    if result.is_ok() {
                        self.rtt_info.add_sample(start.elapsed());
                    }
                }

                result
            }
            None => {
                let establish_result = self
                    .establisher
                    .establish_monitoring_connection(self.address.clone())
                    .await;

                match establish_result {
                    Ok((connection, reply)) => {
                        self.rtt_info.add_sample(start.elapsed());
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
                self.event_emitter.emit_event(|| {
                    let mut reply_doc = reply.raw_command_response.clone();
                    // If this hello reply is from a handshake, remove any speculative
                    // authentication information before publishing an event.
                    reply_doc.remove("speculativeAuthenticate");
                    SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply_doc,
                        server_address: self.address.clone(),
                        awaited,
                    })
                });
            }
            Err(ref e) => {
                self.connection.take();
                self.topology_version.take();
                self.event_emitter.emit_event(|| {
                    SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                        duration,
                        failure: e.clone(),
                        server_address: self.address.clone(),
                        awaited,
                    })
                });
            }
        }

        result
    }

    async fn handle_error(&mut self, error: Error) -> bool {
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }
}

/// The shared round-trip-time estimate for a server, exponentially smoothed and seeded with the
/// first sample.
#[derive(Clone, Debug, Default)]
pub(crate) struct RttInfo {
    average: Arc<Mutex<Option<Duration>>>,
}

impl RttInfo {
    pub(crate) fn add_sample(&self, sample: Duration) {
        let mut average = self.average.lock().unwrap();
        *average = Some(match *average {
            Some(old_rtt) => Duration::from_secs_f64(
                sample.as_secs_f64() * RTT_EWMA_WEIGHT
                    + old_rtt.as_secs_f64() * (1.0 - RTT_EWMA_WEIGHT),
            ),
            None => sample,
        })
    }

    pub(crate) fn average(&self) -> Option<Duration> {
        *self.average.lock().unwrap()
    }
}

/// A monitor that issues periodic (non-awaitable) hello commands on a dedicated connection to
/// measure server round trip time while the heartbeat connection is blocked streaming.
struct RttMonitor {
    address: ServerAddress,
    establisher: ConnectionEstablisher,
    topology_watcher: TopologyWatcher,
    rtt_info: RttInfo,
    frequency: Duration,
    connection: Option<Connection>,
}

impl RttMonitor {
    fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        topology_watcher: TopologyWatcher,
        rtt_info: RttInfo,
        frequency: Duration,
    ) {
        let monitor = Self {
            address,
            establisher,
            topology_watcher,
            rtt_info,
            frequency,
            connection: None,
        };
        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        while self.topology_watcher.is_alive()
            && self.topology_watcher.server_exists(&self.address)
        {
            let start = Instant::now();
            let result = match self.connection {
                Some(ref mut conn) => {
                    let command = hello_command(None, Some(true), None);
                    conn.send_command(command, None).await.map(|_| ())
                }
                None => self
                    .establisher
                    .establish_monitoring_connection(self.address.clone())
                    .await
                    .map(|(connection, _)| {
                        self.connection = Some(connection);
                    }),
            };

            match result {
                Ok(()) => self.rtt_info.add_sample(start.elapsed()),
                Err(_) => {
                    self.connection.take();
                }
            }

            runtime::delay_for(self.frequency).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rtt_average_is_seeded_and_smoothed() {
        let rtt = RttInfo::default();
        assert_eq!(rtt.average(), None);

        rtt.add_sample(Duration::from_millis(100));
        assert_eq!(rtt.average(), Some(Duration::from_millis(100)));

        // new_avg = 0.2 * 200ms + 0.8 * 100ms = 120ms
        rtt.add_sample(Duration::from_millis(200));
        let average = rtt.average().unwrap();
        assert!((average.as_secs_f64() - 0.120).abs() < 0.001, "{:?}", average);
    }
}

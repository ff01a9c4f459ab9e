use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use bson::oid::ObjectId;
use tokio::sync::{broadcast, mpsc, watch};

use super::{
    description::topology::server_selection::{self, SelectedServer},
    monitor::Monitor,
    Server,
    ServerDescription,
    TopologyDescription,
    TopologyType,
};
use crate::{
    client::session::ClusterTime,
    cmap::{
        conn::ConnectionGeneration,
        establish::{ConnectionEstablisher, EstablisherOptions},
        Connection,
        PoolGeneration,
    },
    error::{load_balanced_mode_mismatch, Error, ErrorKind, Result},
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerClosedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    options::{ClientOptions, ServerAddress},
    runtime::{self, AcknowledgedMessage, WorkerRef, WorkerRefListener},
    selection_criteria::SelectionCriteria,
};

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The aggregator of the driver's view of the deployment. It owns one `Server` (and therefore
/// one connection pool) and one monitor per known address, maintains the current
/// `TopologyDescription`, and publishes immutable snapshots of both to interested parties.
///
/// All mutation of topology state is serialized through a background worker task; this handle
/// exposes the watch/update channels into it.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: TopologyCheckRequester,
    server_selection_timeout: Duration,
    _worker_ref: WorkerRef,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Topology> {
        let event_emitter = SdamEventEmitter::new(options.sdam_event_handler.clone());
        let id = ObjectId::new();

        event_emitter.emit_event(|| {
            SdamEvent::TopologyOpening(TopologyOpeningEvent { topology_id: id })
        });

        let establisher =
            ConnectionEstablisher::new(EstablisherOptions::from_client_options(&options))?;

        let (updater, update_receiver) = TopologyUpdater::channel();
        let (worker_ref, ref_listener) = WorkerRefListener::pair();
        let check_requester = TopologyCheckRequester::new();

        let mut description = TopologyDescription::default();
        description.initialize(&options);

        if description.topology_type() == TopologyType::LoadBalanced {
            // Load-balanced deployments are not monitored, so the load balancer is synthesized
            // as a selectable server with an RTT of zero.
            for address in options.hosts.iter() {
                let mut sd = ServerDescription::new(address);
                sd.server_type = super::ServerType::LoadBalancer;
                sd.average_round_trip_time = Some(Duration::from_nanos(0));
                description.servers.insert(address.clone(), sd);
            }
        }

        let (publisher, watch_receiver) = watch::channel(TopologyState {
            description: description.clone(),
            servers: HashMap::new(),
        });
        let watcher = TopologyWatcher {
            receiver: watch_receiver,
        };

        event_emitter.emit_event(|| {
            SdamEvent::TopologyDescriptionChanged(Box::new(TopologyDescriptionChangedEvent {
                topology_id: id,
                previous_description: crate::sdam::public::TopologyDescription {
                    description: TopologyDescription::default(),
                },
                new_description: crate::sdam::public::TopologyDescription {
                    description: description.clone(),
                },
            }))
        });

        let server_selection_timeout = options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);

        let mut worker = TopologyWorker {
            id,
            description,
            servers: HashMap::new(),
            update_receiver,
            publisher,
            options,
            establisher,
            event_emitter,
            check_requester: check_requester.clone(),
            updater: updater.clone(),
            watcher: watcher.clone(),
            ref_listener,
        };

        for address in worker.options.hosts.clone() {
            worker.add_server(address);
        }
        worker.publish_state();

        runtime::spawn(worker.run());

        Ok(Topology {
            watcher,
            updater,
            check_requester,
            server_selection_timeout,
            _worker_ref: worker_ref,
        })
    }

    pub(crate) fn watch(&self) -> TopologyWatcher {
        self.watcher.clone()
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.watcher.topology_type()
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher.peek_latest().description.cluster_time().cloned()
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.watcher.peek_latest().description.logical_session_timeout
    }

    /// Update the topology's highest seen cluster time.
    pub(crate) async fn advance_cluster_time(&self, cluster_time: ClusterTime) {
        self.updater.advance_cluster_time(cluster_time).await;
    }

    /// Handle an error that occurred during operation execution (or connection establishment),
    /// updating the topology and clearing the relevant pool as necessary.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Shut the topology down: stop the monitors and close the pools. Awaits until the worker
    /// has finished its cleanup.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }

    /// Selects a server with the given criteria, waiting for topology changes (and requesting
    /// immediate topology checks) until one becomes available or the server selection timeout
    /// elapses.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        operation_name: &str,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<SelectedServer> {
        let start_time = Instant::now();
        let mut watcher = self.watch();

        loop {
            let state = watcher.observe_latest();

            if let Some(selected) = server_selection::pick_server(
                criteria,
                &state.description,
                &state.servers,
                deprioritized,
            )? {
                tracing::debug!(
                    operation = operation_name,
                    server = %selected.address,
                    "selected server"
                );
                return Ok(selected);
            }

            // The current topology is insufficient; request immediate checks and wait for it
            // to change.
            self.check_requester.request();

            let remaining = match self
                .server_selection_timeout
                .checked_sub(start_time.elapsed())
            {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return Err(ErrorKind::ServerSelection {
                        message: state
                            .description
                            .server_selection_timeout_error_message(criteria),
                    }
                    .into())
                }
            };

            watcher.wait_for_update(remaining).await;
        }
    }
}

/// An immutable snapshot of the deployment's observed state along with the live per-address
/// server handles, published on every accepted change.
#[derive(Clone, Debug)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// A handle used for observing changes that occur in the topology.
#[derive(Clone, Debug)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    /// Whether the topology that this handle points to is still alive.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    /// Clone the latest state, marking it as seen so that `wait_for_update` only returns for
    /// subsequent changes.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Clone the latest state without marking it as seen.
    pub(crate) fn peek_latest(&self) -> TopologyState {
        self.receiver.borrow().clone()
    }

    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .servers
            .get(address)
            .cloned()
    }

    pub(crate) fn server_exists(&self, address: &ServerAddress) -> bool {
        self.receiver.borrow().description.servers.contains_key(address)
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.receiver.borrow().description.topology_type
    }

    /// Wait for a new state to be published or for the timeout to be reached, returning a bool
    /// indicating whether an update was seen or not.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        matches!(
            runtime::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }
}

/// Handle used to update the topology. Each update is processed and acknowledged by the
/// topology worker, serializing all mutations of topology state.
#[derive(Clone, Debug)]
pub(crate) struct TopologyUpdater {
    sender: mpsc::UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (TopologyUpdater, UpdateReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (TopologyUpdater { sender }, UpdateReceiver { receiver })
    }

    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    /// Update the topology using the provided server description, returning a bool indicating
    /// whether the topology changed as a result of the update.
    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd))).await
    }

    /// Handle an error that occurred during a monitor check.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    /// Handle an error that occurred during operation execution or connection establishment.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.send_message(UpdateMessage::AdvanceClusterTime(to)).await;
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Shutdown).await;
    }
}

/// The receiving end of a `TopologyUpdater`.
pub(crate) struct UpdateReceiver {
    receiver: mpsc::UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl UpdateReceiver {
    pub(crate) async fn recv(&mut self) -> Option<AcknowledgedMessage<UpdateMessage, bool>> {
        self.receiver.recv().await
    }
}

/// The messages a `TopologyUpdater` can send to the topology worker.
#[derive(Debug)]
pub(crate) enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    AdvanceClusterTime(ClusterTime),
    Shutdown,
}

/// Handle for requesting that the monitors perform immediate checks of their servers.
#[derive(Clone, Debug)]
pub(crate) struct TopologyCheckRequester {
    sender: broadcast::Sender<()>,
}

impl TopologyCheckRequester {
    fn new() -> TopologyCheckRequester {
        let (sender, _) = broadcast::channel(1);
        TopologyCheckRequester { sender }
    }

    /// Request that all monitors perform immediate checks.
    fn request(&self) {
        let _: std::result::Result<usize, _> = self.sender.send(());
    }

    fn subscribe(&self) -> TopologyCheckRequestReceiver {
        TopologyCheckRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiver used to listen for check requests.
pub(crate) struct TopologyCheckRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyCheckRequestReceiver {
    /// Wait until a check request is seen or the timeout is reached.
    pub(crate) async fn wait_for_check_request(&mut self, timeout: Duration) {
        let _: std::result::Result<_, _> =
            runtime::timeout(timeout, self.receiver.recv()).await;
    }

    /// Discard any check requests that have been received so far, so that a subsequent wait
    /// only returns for fresh requests.
    pub(crate) fn clear_check_requests(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

/// The phase of connection establishment or use that an application error occurred in. The
/// phase determines whether the error can still be relevant to the current topology (via the
/// generation recorded at the start of establishment) and whether server-side error codes have
/// been observed yet.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// An error occurred before the hello reply was received.
    PreHello { generation: PoolGeneration },

    /// An error occurred after the hello reply but before the handshake fully completed
    /// (e.g. during authentication).
    PostHello { generation: ConnectionGeneration },

    /// The handshake completed; the error occurred while executing an operation.
    AfterCompletion {
        generation: ConnectionGeneration,
        max_wire_version: Option<i32>,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(handshaked_connection: &Connection) -> Self {
        Self::AfterCompletion {
            generation: handshaked_connection.generation.clone(),
            max_wire_version: handshaked_connection
                .stream_description
                .as_ref()
                .and_then(|sd| sd.max_wire_version),
        }
    }

    /// The wire version of the server as reported by the handshake. If the handshake did not
    /// complete, this returns `None`.
    fn wire_version(&self) -> Option<i32> {
        match self {
            Self::AfterCompletion {
                max_wire_version, ..
            } => *max_wire_version,
            _ => None,
        }
    }

    /// Whether this phase is before the handshake completed or not.
    fn is_before_completion(&self) -> bool {
        !matches!(self, Self::AfterCompletion { .. })
    }

    fn service_id(&self) -> Option<ObjectId> {
        match self {
            Self::PreHello { .. } => None,
            Self::PostHello { generation, .. } | Self::AfterCompletion { generation, .. } => {
                generation.service_id()
            }
        }
    }
}

/// The background task that owns all topology state and applies updates to it serially.
struct TopologyWorker {
    id: ObjectId,
    description: TopologyDescription,
    servers: HashMap<ServerAddress, Arc<Server>>,
    update_receiver: UpdateReceiver,
    publisher: watch::Sender<TopologyState>,
    options: ClientOptions,
    establisher: ConnectionEstablisher,
    event_emitter: SdamEventEmitter,
    check_requester: TopologyCheckRequester,

    /// Handles for passing into newly-created servers and monitors.
    updater: TopologyUpdater,
    watcher: TopologyWatcher,

    /// Resolves once every user-facing handle to this topology is gone.
    ref_listener: WorkerRefListener,
}

impl TopologyWorker {
    async fn run(mut self) {
        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                Some(update) = self.update_receiver.recv() => {
                    let (update, ack) = update.into_parts();
                    match update {
                        UpdateMessage::ServerUpdate(sd) => {
                            let changed = self.update_server(*sd).await;
                            ack.acknowledge(changed);
                        }
                        UpdateMessage::MonitorError { address, error } => {
                            let updated = self.handle_monitor_error(address, error).await;
                            ack.acknowledge(updated);
                        }
                        UpdateMessage::ApplicationError { address, error, phase } => {
                            let updated = self
                                .handle_application_error(address, error, phase)
                                .await;
                            ack.acknowledge(updated);
                        }
                        UpdateMessage::AdvanceClusterTime(to) => {
                            self.description.advance_cluster_time(&to);
                            self.publish_state();
                            ack.acknowledge(true);
                        }
                        UpdateMessage::Shutdown => {
                            shutdown_ack = Some(ack);
                            break;
                        }
                    }
                },
                _ = self.ref_listener.released() => {
                    break
                }
            }
        }

        // Dropping the servers closes their pools and, via the published state, stops their
        // monitors.
        for address in self.servers.keys() {
            let id = self.id;
            let address = address.clone();
            self.event_emitter.emit_event(|| {
                SdamEvent::ServerClosed(ServerClosedEvent {
                    topology_id: id,
                    address,
                })
            });
        }
        self.servers.clear();
        self.description.servers.clear();
        self.publish_state();

        self.event_emitter
            .emit_event(|| SdamEvent::TopologyClosed(TopologyClosedEvent { topology_id: self.id }));

        if let Some(ack) = shutdown_ack {
            ack.acknowledge(true);
        }
    }

    /// Publish the current state, notifying any server selection operations that are waiting
    /// for updates.
    fn publish_state(&self) {
        let _ = self.publisher.send(TopologyState {
            description: self.description.clone(),
            servers: self.servers.clone(),
        });
    }

    /// Create a `Server` (and its pool) for the given address and start monitoring it.
    fn add_server(&mut self, address: ServerAddress) {
        let server = Server::new(
            address.clone(),
            &self.options,
            self.establisher.clone(),
            self.updater.clone(),
        );
        self.servers.insert(address.clone(), server);

        let id = self.id;
        let opening_address = address.clone();
        self.event_emitter.emit_event(|| {
            SdamEvent::ServerOpening(ServerOpeningEvent {
                topology_id: id,
                address: opening_address,
            })
        });

        #[cfg(test)]
        let disable_monitoring = self
            .options
            .test_options
            .as_ref()
            .map(|to| to.disable_monitoring_threads)
            .unwrap_or(false);
        #[cfg(not(test))]
        let disable_monitoring = false;

        let load_balanced = self.description.topology_type() == TopologyType::LoadBalanced;
        if !load_balanced && !disable_monitoring {
            Monitor::start(
                address,
                self.updater.clone(),
                self.watcher.clone(),
                self.event_emitter.clone(),
                self.check_requester.subscribe(),
                self.establisher.clone(),
                self.options.clone(),
            );
        }
    }

    /// Apply the given server description to the topology, starting and stopping servers and
    /// monitors as needed and publishing the resulting state. Returns whether the topology
    /// changed.
    async fn update_server(&mut self, sd: ServerDescription) -> bool {
        let server_type = sd.server_type;
        let server_address = sd.address.clone();

        let old_description = self.description.clone();
        if let Err(error) = self.description.update(sd) {
            tracing::warn!(
                address = %server_address,
                error = %error,
                "could not apply server description to topology"
            );
            return false;
        }

        let diff = old_description.diff(&self.description);
        let topology_changed = diff.is_some();

        // A server that has been successfully described can begin serving checkouts. This must
        // happen before the new state is published so that a selected server's pool is never
        // still paused.
        if server_type.is_available() {
            if let Some(server) = self.servers.get(&server_address) {
                server.pool.mark_as_ready().await;
            }
        }

        if let Some(diff) = diff {
            let added: Vec<ServerAddress> =
                diff.added_addresses.into_iter().cloned().collect();
            let removed: Vec<ServerAddress> =
                diff.removed_addresses.into_iter().cloned().collect();
            let changed: Vec<ServerAddress> = diff
                .changed_servers
                .keys()
                .map(|address| (*address).clone())
                .collect();

            for address in added {
                self.add_server(address);
            }

            for address in removed {
                // Dropping the server closes its pool once operations have released it; the
                // monitor stops when it observes the server is gone from the published state.
                self.servers.remove(&address);
                let id = self.id;
                self.event_emitter.emit_event(|| {
                    SdamEvent::ServerClosed(ServerClosedEvent {
                        topology_id: id,
                        address,
                    })
                });
            }

            self.publish_state();

            for address in changed {
                let (Some(previous), Some(new)) = (
                    old_description.servers.get(&address),
                    self.description.servers.get(&address),
                ) else {
                    continue;
                };
                let id = self.id;
                let event_address = address.clone();
                let previous = previous.clone();
                let new = new.clone();
                self.event_emitter.emit_event(move || {
                    SdamEvent::ServerDescriptionChanged(Box::new(
                        crate::event::sdam::ServerDescriptionChangedEvent {
                            topology_id: id,
                            address: event_address,
                            previous_description: crate::sdam::public::ServerDescription {
                                description: previous,
                            },
                            new_description: crate::sdam::public::ServerDescription {
                                description: new,
                            },
                        },
                    ))
                });
            }

            let id = self.id;
            let previous_description = old_description;
            let new_description = self.description.clone();
            self.event_emitter.emit_event(move || {
                SdamEvent::TopologyDescriptionChanged(Box::new(TopologyDescriptionChangedEvent {
                    topology_id: id,
                    previous_description: crate::sdam::public::TopologyDescription {
                        description: previous_description,
                    },
                    new_description: crate::sdam::public::TopologyDescription {
                        description: new_description,
                    },
                }))
            });
        }

        topology_changed
    }

    /// Marks a server in the topology as unknown due to the given `error`, returning whether
    /// the topology changed as a result.
    async fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address, error);
        self.update_server(description).await
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        match self.servers.get(&address).cloned() {
            Some(server) => {
                let updated = self.mark_server_as_unknown(address, error.clone()).await;
                if updated {
                    // The heartbeat monitor is disabled in load-balanced mode, so this will
                    // never have a service id.
                    server.pool.clear(error, None);
                }
                updated
            }
            None => false,
        }
    }

    /// Handle an error that occurred during operation execution or connection establishment,
    /// applying the appropriate topology and pool transitions.
    ///
    /// Returns whether the topology changed as a result of the error.
    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let server = match self.servers.get(&address).cloned() {
            Some(server) => server,
            None => return false,
        };

        // Errors from stale connections or handshakes must not overwrite newer state.
        match &phase {
            HandshakePhase::PreHello { generation } => {
                match (generation, server.pool.generation()) {
                    (PoolGeneration::Normal(hgen), PoolGeneration::Normal(sgen)) => {
                        if *hgen < sgen {
                            return false;
                        }
                    }
                    // Pre-hello handshake errors are ignored in load-balanced mode.
                    (PoolGeneration::LoadBalanced(_), PoolGeneration::LoadBalanced(_)) => {
                        return false
                    }
                    _ => load_balanced_mode_mismatch!(false),
                }
            }
            HandshakePhase::PostHello { generation }
            | HandshakePhase::AfterCompletion { generation, .. } => {
                if generation.is_stale(&server.pool.generation()) {
                    return false;
                }
            }
        }

        let is_load_balanced =
            self.description.topology_type() == TopologyType::LoadBalanced;

        if error.is_state_change_error() {
            let updated = is_load_balanced
                || self
                    .mark_server_as_unknown(address.clone(), error.clone())
                    .await;

            if updated && (error.is_shutting_down() || phase.wire_version().unwrap_or(0) < 8) {
                server.pool.clear(error, phase.service_id());
            }
            self.check_requester.request();

            updated
        } else if error.is_network_io_error()
            || (phase.is_before_completion()
                && (error.is_auth_error() || error.is_command_error()))
        {
            let updated = is_load_balanced
                || self
                    .mark_server_as_unknown(address.clone(), error.clone())
                    .await;
            if updated {
                server.pool.clear(error, phase.service_id());
            }
            updated
        } else {
            false
        }
    }
}

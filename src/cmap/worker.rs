use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use bson::oid::ObjectId;

use super::{
    checkout,
    checkout::{CheckoutGrant, CheckoutQueue, CheckoutRequest, CheckoutRequester},
    conn::PendingConnection,
    establish::ConnectionEstablisher,
    manager,
    manager::{ConnectionSucceeded, ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    options::ConnectionPoolOptions,
    status,
    status::{PoolGenerationPublisher, PoolGenerationSubscriber},
    Connection,
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    client::auth::Credential,
    error::{load_balanced_mode_mismatch, Error, ErrorKind, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolReadyEvent,
    },
    options::ServerAddress,
    runtime::{self, WorkerRefListener},
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAX_CONNECTING: u32 = 2;

/// How often the worker wakes up on its own to evict perished connections and to top the
/// pool up to `min_pool_size`.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(500);

/// The background task that owns all of a pool's mutable state. Every interaction with the
/// pool flows through one of its three inputs: the checkout queue, the management channel
/// (check-ins, clears, readiness), and the maintenance timer.
pub(crate) struct ConnectionPoolWorker {
    address: ServerAddress,

    /// Whether checkouts may currently be served. Cleared pools sit in `Paused` until a
    /// monitor (or, for load balancers, construction) marks them ready again.
    state: PoolState,

    /// Every connection this pool is responsible for: idle ones, checked-out ones, and ones
    /// still being established.
    total_connections: u32,

    /// How many of `total_connections` are still being established.
    establishing: u32,

    /// Id assigned to the next connection this pool creates.
    next_id: u32,

    /// Bumped on every clear; connections created under an older generation are destroyed
    /// the next time the worker touches them.
    generation: PoolGeneration,

    /// In load-balanced mode, how many live connections exist per backend. When a backend's
    /// count reaches zero its generation entry is forgotten.
    service_counts: HashMap<ObjectId, u32>,

    /// Connections awaiting reuse, oldest at the front.
    idle: VecDeque<Connection>,

    establisher: ConnectionEstablisher,

    credential: Option<Credential>,

    event_emitter: CmapEventEmitter,

    /// Idle connections older than this are evicted. `None` disables idle eviction.
    max_idle_time: Option<Duration>,

    /// Background establishment keeps the pool at least this large while it is ready.
    min_pool_size: Option<u32>,

    /// Upper bound on `total_connections`; zero means unbounded.
    max_pool_size: u32,

    /// Upper bound on `establishing`.
    max_connecting: u32,

    /// Resolves once nothing that could request a connection exists anymore, at which point
    /// the worker closes the pool and exits.
    ref_listener: WorkerRefListener,

    /// Incoming checkouts, in arrival order.
    checkout_queue: CheckoutQueue,

    /// Checkouts admitted while the pool was ready, still waiting for an idle connection or
    /// for establishment capacity.
    waiters: VecDeque<CheckoutRequest>,

    management: ManagementRequestReceiver,

    /// Publishes the generation so checked-out connections can be judged against it.
    status: PoolGenerationPublisher,

    /// Cloned onto checked-out connections so that dropping them finds the way back here.
    manager: PoolManager,

    /// Where establishment failures are reported so the server can transition to Unknown.
    topology: TopologyUpdater,
}

impl ConnectionPoolWorker {
    /// Spawns a worker, returning the handles the pool facade needs: the management channel,
    /// the checkout requester (which keeps the worker alive), and the generation subscriber.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        topology: TopologyUpdater,
        event_emitter: CmapEventEmitter,
        options: Option<ConnectionPoolOptions>,
    ) -> (PoolManager, CheckoutRequester, PoolGenerationSubscriber) {
        let options = options.unwrap_or_default();

        // An explicit zero max idle time disables idle eviction entirely.
        let max_idle_time = options
            .max_idle_time
            .filter(|max_idle_time| !max_idle_time.is_zero());

        let load_balanced = options.load_balanced.unwrap_or(false);
        let generation = if load_balanced {
            PoolGeneration::load_balanced()
        } else {
            PoolGeneration::normal()
        };

        // A load balancer has no monitor to mark its pool ready, so such pools start out
        // ready; everything else starts paused until the server is first described.
        let state = if options.ready.unwrap_or(false) {
            PoolState::Ready
        } else {
            PoolState::Startup
        };

        let (worker_ref, ref_listener) = WorkerRefListener::pair();
        let (requester, checkout_queue) = checkout::channel(worker_ref);
        let (manager, management) = manager::channel();
        let (status, generation_subscriber) = status::channel(generation.clone());

        let worker = ConnectionPoolWorker {
            address,
            state,
            total_connections: 0,
            establishing: 0,
            next_id: 1,
            generation,
            service_counts: HashMap::new(),
            idle: VecDeque::new(),
            establisher,
            credential: options.credential,
            event_emitter,
            max_idle_time,
            min_pool_size: options.min_pool_size,
            max_pool_size: options.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE),
            max_connecting: options.max_connecting.unwrap_or(DEFAULT_MAX_CONNECTING),
            ref_listener,
            checkout_queue,
            waiters: VecDeque::new(),
            management,
            status,
            manager: manager.clone(),
            topology,
        };

        runtime::spawn(worker.execute());

        (manager, requester, generation_subscriber)
    }

    async fn execute(mut self) {
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            tokio::select! {
                // Polled in order: management traffic (check-ins, clears, readiness)
                // outranks shutdown and new checkouts, so returning or invalidating
                // connections always wins over handing them out.
                biased;

                Some(request) = self.management.recv() => self.handle_management(request),
                _ = self.ref_listener.released() => break,
                Some(request) = self.checkout_queue.next() => self.admit(request),
                _ = maintenance.tick() => self.perform_maintenance(),
                else => break,
            }

            self.serve_waiters();
        }

        // Nothing can request a connection anymore; close what's left and report the pool
        // closed.
        while let Some(connection) = self.idle.pop_front() {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }
        self.event_emitter.emit_event(|| {
            PoolClosedEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    fn handle_management(&mut self, request: PoolManagementRequest) {
        match request {
            PoolManagementRequest::CheckIn(connection) => self.check_in(*connection),
            PoolManagementRequest::Clear { cause, service_id } => self.clear(cause, service_id),
            PoolManagementRequest::MarkAsReady { completion_handler } => {
                self.mark_as_ready();
                let (_, ack) = completion_handler.into_parts();
                ack.acknowledge(());
            }
            PoolManagementRequest::HandleConnectionSucceeded(outcome) => {
                self.establishment_succeeded(outcome)
            }
            PoolManagementRequest::HandleConnectionFailed => self.establishment_failed(),
        }
    }

    /// Accepts or refuses an incoming checkout based on the pool state. Accepted checkouts
    /// join the waiter queue and are answered by `serve_waiters`.
    fn admit(&mut self, request: CheckoutRequest) {
        match self.state {
            PoolState::Ready => self.waiters.push_back(request),
            PoolState::Paused(ref cause) => {
                // The requester may have stopped listening; that's fine either way.
                let _ = request.grant(CheckoutGrant::Refused(cause.clone()));
            }
            PoolState::Startup => {
                let _ = request.grant(CheckoutGrant::Refused(
                    ErrorKind::Internal {
                        message: "checked out from a pool that was never marked ready"
                            .to_string(),
                    }
                    .into(),
                ));
            }
        }
    }

    fn has_capacity(&self) -> bool {
        self.max_pool_size == 0 || self.total_connections < self.max_pool_size
    }

    /// Answers as many queued waiters as the pool currently can: each gets either a vetted
    /// idle connection or a freshly-started establishment, in FIFO order. Waiters the pool
    /// has no capacity for stay queued.
    fn serve_waiters(&mut self) {
        if !matches!(self.state, PoolState::Ready) {
            return;
        }

        while !self.waiters.is_empty() {
            // Prefer reuse: most-recently-returned first, evicting perished connections
            // along the way.
            let vetted = loop {
                match self.idle.pop_back() {
                    Some(conn) if conn.generation.is_stale(&self.generation) => {
                        self.discard(conn, ConnectionClosedReason::Stale);
                    }
                    Some(conn) if conn.is_idle(self.max_idle_time) => {
                        self.discard(conn, ConnectionClosedReason::Idle);
                    }
                    other => break other,
                }
            };

            match vetted {
                Some(mut conn) => {
                    let request = self.waiters.pop_front().unwrap();
                    conn.mark_as_in_use(self.manager.clone());
                    if let Err(grant) = request.grant(CheckoutGrant::Idle(Box::new(conn))) {
                        // The waiter hit its deadline while queued; reclaim the connection
                        // for the next one.
                        let mut conn = grant.into_idle_connection();
                        conn.mark_as_available();
                        self.idle.push_back(conn);
                    }
                }
                None if self.has_capacity() && self.establishing < self.max_connecting => {
                    let request = self.waiters.pop_front().unwrap();
                    let job = self.begin_establishment();
                    let handle = runtime::spawn(async move {
                        let manager = job.manager.clone();
                        let mut established = job.run().await;
                        if let Ok(ref mut connection) = established {
                            // Hand the connection straight to the waiter. If the waiter
                            // gave up in the meantime, the handle's result is dropped and
                            // the connection finds its way back via its pool manager.
                            connection.mark_as_in_use(manager.clone());
                            manager.handle_connection_succeeded(ConnectionSucceeded::Used {
                                service_id: connection.service_id(),
                            });
                        }
                        established
                    });
                    // A waiter that stopped listening just leaves the establishment running
                    // for the pool's benefit.
                    let _ = request.grant(CheckoutGrant::Establishing(handle));
                }
                None => break,
            }
        }
    }

    /// Reserves the bookkeeping for one new connection and returns the job that will
    /// establish it.
    fn begin_establishment(&mut self) -> EstablishmentJob {
        self.total_connections += 1;
        self.establishing += 1;

        let pending = PendingConnection {
            id: self.next_id,
            address: self.address.clone(),
            generation: self.generation.clone(),
            event_emitter: self.event_emitter.clone(),
            time_created: Instant::now(),
        };
        self.next_id += 1;
        self.event_emitter
            .emit_event(|| pending.created_event().into());

        EstablishmentJob {
            pending,
            establisher: self.establisher.clone(),
            credential: self.credential.clone(),
            manager: self.manager.clone(),
            topology: self.topology.clone(),
            event_emitter: self.event_emitter.clone(),
        }
    }

    fn establishment_succeeded(&mut self, outcome: ConnectionSucceeded) {
        self.establishing -= 1;
        if let Some(service_id) = outcome.service_id() {
            *self.service_counts.entry(service_id).or_insert(0) += 1;
        }
        if let ConnectionSucceeded::ForPool(connection) = outcome {
            let mut connection = *connection;
            connection.mark_as_available();
            self.idle.push_back(connection);
        }
    }

    fn establishment_failed(&mut self) {
        // The reserved slot never materialized into a connection.
        self.establishing -= 1;
        self.total_connections -= 1;
    }

    fn check_in(&mut self, mut conn: Connection) {
        self.event_emitter
            .emit_event(|| conn.checked_in_event().into());

        conn.mark_as_available();

        let discard_reason = if conn.has_errored() {
            Some(ConnectionClosedReason::Error)
        } else if conn.generation.is_stale(&self.generation) {
            Some(ConnectionClosedReason::Stale)
        } else if conn.is_executing() {
            // The operation holding this connection was cancelled with a reply still in
            // flight; the socket may hold a partial frame and cannot be reused.
            Some(ConnectionClosedReason::Dropped)
        } else {
            None
        };

        match discard_reason {
            Some(reason) => self.discard(conn, reason),
            None => self.idle.push_back(conn),
        }
    }

    fn clear(&mut self, cause: Error, service_id: Option<ObjectId>) {
        let announce = match (&mut self.generation, service_id) {
            (PoolGeneration::Normal(generation), None) => {
                *generation += 1;
                let prior = std::mem::replace(&mut self.state, PoolState::Paused(cause.clone()));
                // Clearing an already-paused pool bumps the generation silently.
                matches!(prior, PoolState::Ready)
            }
            (PoolGeneration::LoadBalanced(generations), Some(service_id)) => {
                // Only the one backend is invalidated; the pool keeps serving the others.
                *generations.entry(service_id).or_insert(0) += 1;
                true
            }
            (..) => load_balanced_mode_mismatch!(),
        };
        self.status.publish(self.generation.clone());

        if !announce {
            return;
        }

        tracing::debug!(address = %self.address, "connection pool cleared");
        self.event_emitter.emit_event(|| {
            PoolClearedEvent {
                address: self.address.clone(),
                service_id,
            }
            .into()
        });

        if matches!(self.state, PoolState::Paused(_)) {
            // Queued checkouts cannot be satisfied by a paused pool; fail them with the
            // error that cleared it. (Load-balanced pools never pause, so their waiters
            // ride out per-backend clears.)
            for waiter in self.waiters.drain(..) {
                let _ = waiter.grant(CheckoutGrant::Refused(cause.clone()));
            }
        }
    }

    fn mark_as_ready(&mut self) {
        if matches!(self.state, PoolState::Ready) {
            return;
        }

        self.state = PoolState::Ready;
        self.event_emitter.emit_event(|| {
            PoolReadyEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    /// Destroys a connection the pool is responsible for, keeping the per-backend counts in
    /// sync in load-balanced mode.
    fn discard(&mut self, connection: Connection, reason: ConnectionClosedReason) {
        if let Some(service_id) = connection.generation.service_id() {
            match (&mut self.generation, self.service_counts.get_mut(&service_id)) {
                (PoolGeneration::LoadBalanced(generations), Some(count)) => {
                    *count -= 1;
                    if *count == 0 {
                        generations.remove(&service_id);
                        self.service_counts.remove(&service_id);
                    }
                }
                _ => load_balanced_mode_mismatch!(),
            }
        }
        connection.close_and_drop(reason);
        self.total_connections -= 1;
    }

    fn perform_maintenance(&mut self) {
        self.sweep_idle();
        if matches!(self.state, PoolState::Ready) {
            self.top_up();
        }
    }

    /// Evicts perished connections. Idle connections age from the front of the queue, so the
    /// sweep can stop at the first one worth keeping.
    fn sweep_idle(&mut self) {
        loop {
            let reason = match self.idle.front() {
                Some(conn) if conn.generation.is_stale(&self.generation) => {
                    ConnectionClosedReason::Stale
                }
                Some(conn) if conn.is_idle(self.max_idle_time) => ConnectionClosedReason::Idle,
                _ => break,
            };
            if let Some(conn) = self.idle.pop_front() {
                self.discard(conn, reason);
            }
        }
    }

    /// Starts background establishments until the pool is on track to reach
    /// `min_pool_size`, without exceeding the establishment concurrency bound.
    fn top_up(&mut self) {
        let target = match self.min_pool_size {
            Some(target) => target,
            None => return,
        };

        while self.total_connections < target && self.establishing < self.max_connecting {
            let job = self.begin_establishment();
            runtime::spawn(async move {
                let manager = job.manager.clone();
                if let Ok(connection) = job.run().await {
                    manager.handle_connection_succeeded(ConnectionSucceeded::ForPool(Box::new(
                        connection,
                    )));
                }
            });
        }
    }
}

/// Everything needed to take one reserved connection slot through handshake and
/// authentication, shared by waiter-driven and background establishment.
struct EstablishmentJob {
    pending: PendingConnection,
    establisher: ConnectionEstablisher,
    credential: Option<Credential>,
    manager: PoolManager,
    topology: TopologyUpdater,
    event_emitter: CmapEventEmitter,
}

impl EstablishmentJob {
    /// Establishes the connection. On failure the topology hears about the error (so the
    /// server can transition to Unknown), the closure is reported as an event, and the
    /// pool's reserved slot is released.
    async fn run(self) -> Result<Connection> {
        let id = self.pending.id;
        let address = self.pending.address.clone();

        match self
            .establisher
            .establish_connection(self.pending, self.credential.as_ref())
            .await
        {
            Ok(connection) => {
                self.event_emitter
                    .emit_event(|| connection.ready_event().into());
                Ok(connection)
            }
            Err(establish_error) => {
                self.topology
                    .handle_application_error(
                        address.clone(),
                        establish_error.cause.clone(),
                        establish_error.handshake_phase,
                    )
                    .await;
                self.event_emitter.emit_event(|| {
                    ConnectionClosedEvent {
                        address,
                        connection_id: id,
                        reason: ConnectionClosedReason::Error,
                    }
                    .into()
                });
                self.manager.handle_connection_failed();
                Err(establish_error.cause)
            }
        }
    }
}

/// Whether the pool may serve checkouts, and if not, why.
#[derive(Debug)]
enum PoolState {
    /// A freshly-created pool that no monitor has vouched for yet. Behaves like `Paused`
    /// without an error to point at.
    Startup,

    /// A clear happened; no checkouts are served and no background connections are created
    /// until the server is described again.
    Paused(Error),

    /// Fully operational.
    Ready,
}

/// The pool's invalidation epoch. Ordinary pools carry a single counter; load-balanced
/// pools carry one per backend, keyed by the serviceId learned during the handshake, so one
/// misbehaving backend doesn't invalidate the others' connections.
#[derive(Debug, Clone)]
pub(crate) enum PoolGeneration {
    Normal(u32),
    LoadBalanced(HashMap<ObjectId, u32>),
}

impl PoolGeneration {
    pub(crate) fn normal() -> Self {
        Self::Normal(0)
    }

    fn load_balanced() -> Self {
        Self::LoadBalanced(HashMap::new())
    }

    #[cfg(test)]
    pub(crate) fn as_normal(&self) -> Option<u32> {
        match self {
            PoolGeneration::Normal(generation) => Some(*generation),
            _ => None,
        }
    }
}

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    cmap::{
        establish::{ConnectionEstablisher, EstablisherOptions},
        options::ConnectionPoolOptions,
        ConnectionPool,
    },
    error::Error,
    event::cmap::{
        CmapEvent,
        CmapEventHandler,
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionCheckoutFailedEvent,
        ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent,
        ConnectionClosedEvent,
        ConnectionCreatedEvent,
        ConnectionReadyEvent,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolCreatedEvent,
        PoolReadyEvent,
    },
    options::{ClientOptions, ServerAddress},
    runtime,
    sdam::{TopologyUpdater, UpdateMessage},
};

/// An event handler that stores all received events for later inspection.
#[derive(Debug, Default)]
pub(crate) struct EventSink {
    events: Mutex<Vec<CmapEvent>>,
}

impl EventSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    fn push(&self, event: CmapEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub(crate) fn contains(&self, predicate: impl Fn(&CmapEvent) -> bool) -> bool {
        self.events.lock().unwrap().iter().any(predicate)
    }

    /// Repeatedly poll for an event matching the predicate, failing after a few seconds.
    pub(crate) async fn wait_for(&self, predicate: impl Fn(&CmapEvent) -> bool) {
        for _ in 0..200 {
            if self.contains(&predicate) {
                return;
            }
            runtime::delay_for(Duration::from_millis(25)).await;
        }
        panic!(
            "expected event did not occur; events seen: {:?}",
            self.events.lock().unwrap()
        );
    }
}

impl CmapEventHandler for EventSink {
    fn handle_pool_created_event(&self, event: PoolCreatedEvent) {
        self.push(CmapEvent::PoolCreated(event))
    }
    fn handle_pool_ready_event(&self, event: PoolReadyEvent) {
        self.push(CmapEvent::PoolReady(event))
    }
    fn handle_pool_cleared_event(&self, event: PoolClearedEvent) {
        self.push(CmapEvent::PoolCleared(event))
    }
    fn handle_pool_closed_event(&self, event: PoolClosedEvent) {
        self.push(CmapEvent::PoolClosed(event))
    }
    fn handle_connection_created_event(&self, event: ConnectionCreatedEvent) {
        self.push(CmapEvent::ConnectionCreated(event))
    }
    fn handle_connection_ready_event(&self, event: ConnectionReadyEvent) {
        self.push(CmapEvent::ConnectionReady(event))
    }
    fn handle_connection_closed_event(&self, event: ConnectionClosedEvent) {
        self.push(CmapEvent::ConnectionClosed(event))
    }
    fn handle_connection_checkout_started_event(&self, event: ConnectionCheckoutStartedEvent) {
        self.push(CmapEvent::ConnectionCheckoutStarted(event))
    }
    fn handle_connection_checkout_failed_event(&self, event: ConnectionCheckoutFailedEvent) {
        self.push(CmapEvent::ConnectionCheckoutFailed(event))
    }
    fn handle_connection_checked_out_event(&self, event: ConnectionCheckedOutEvent) {
        self.push(CmapEvent::ConnectionCheckedOut(event))
    }
    fn handle_connection_checked_in_event(&self, event: ConnectionCheckedInEvent) {
        self.push(CmapEvent::ConnectionCheckedIn(event))
    }
}

/// Spawns a task that acknowledges all topology updates (no topology worker runs in these
/// tests) and forwards them for inspection.
fn spawn_update_acker(
    mut receiver: crate::sdam::UpdateReceiver,
) -> tokio::sync::mpsc::UnboundedReceiver<String> {
    let (sender, observed) = tokio::sync::mpsc::unbounded_channel();
    runtime::spawn(async move {
        while let Some(update) = receiver.recv().await {
            let (message, ack) = update.into_parts();
            let name = match message {
                UpdateMessage::ServerUpdate(_) => "ServerUpdate",
                UpdateMessage::MonitorError { .. } => "MonitorError",
                UpdateMessage::ApplicationError { .. } => "ApplicationError",
                UpdateMessage::AdvanceClusterTime(_) => "AdvanceClusterTime",
                UpdateMessage::Shutdown => "Shutdown",
            };
            let _ = sender.send(name.to_string());
            ack.acknowledge(false);
        }
    });
    observed
}

fn new_pool(
    address: ServerAddress,
    options: ConnectionPoolOptions,
) -> (
    ConnectionPool,
    Arc<EventSink>,
    tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    let sink = EventSink::new();
    let mut options = options;
    options.cmap_event_handler = Some(sink.clone() as Arc<dyn CmapEventHandler>);

    let (updater, receiver) = TopologyUpdater::channel();
    let observed = spawn_update_acker(receiver);

    let establisher = ConnectionEstablisher::new(EstablisherOptions::from_client_options(
        &ClientOptions::default(),
    ))
    .unwrap();

    let pool = ConnectionPool::new(address, establisher, updater, Some(options));
    (pool, sink, observed)
}

fn unreachable_address() -> ServerAddress {
    // Port 1 is reserved and virtually never listening; connections to it fail fast.
    ServerAddress::Tcp {
        host: "127.0.0.1".to_string(),
        port: Some(1),
    }
}

#[tokio::test]
async fn pool_lifecycle_events() {
    let (pool, sink, _observed) = new_pool(unreachable_address(), Default::default());

    sink.wait_for(|e| matches!(e, CmapEvent::PoolCreated(_))).await;

    pool.mark_as_ready().await;
    sink.wait_for(|e| matches!(e, CmapEvent::PoolReady(_))).await;

    pool.clear(Error::network_timeout(), None);
    sink.wait_for(|e| matches!(e, CmapEvent::PoolCleared(_))).await;

    drop(pool);
    sink.wait_for(|e| matches!(e, CmapEvent::PoolClosed(_))).await;
}

#[tokio::test]
async fn checkout_fails_on_paused_pool() {
    let (pool, sink, _observed) = new_pool(unreachable_address(), Default::default());

    // The pool starts paused (it has not been marked ready by a monitor yet).
    let error = pool.check_out().await.unwrap_err();
    assert!(
        matches!(
            *error.kind,
            crate::error::ErrorKind::Internal { .. }
                | crate::error::ErrorKind::ConnectionPoolCleared { .. }
        ),
        "{:?}",
        error
    );

    sink.wait_for(|e| matches!(e, CmapEvent::ConnectionCheckoutStarted(_))).await;
    sink.wait_for(|e| matches!(e, CmapEvent::ConnectionCheckoutFailed(_))).await;
}

#[tokio::test]
async fn clear_increments_generation_and_interrupts_checkouts() {
    let (pool, sink, _observed) = new_pool(unreachable_address(), Default::default());
    pool.mark_as_ready().await;

    let mut subscriber = pool.generation_subscriber();
    assert_eq!(subscriber.generation().as_normal(), Some(0));

    pool.clear(Error::network_timeout(), None);
    let generation = subscriber
        .wait_for_generation_change(Duration::from_secs(5))
        .await
        .expect("generation should change after clear");
    assert_eq!(generation.as_normal(), Some(1));

    // A checkout after the clear observes the paused state.
    let error = pool.check_out().await.unwrap_err();
    assert!(error.is_pool_cleared(), "{:?}", error);
    assert!(error.is_read_retryable());

    sink.wait_for(|e| {
        matches!(
            e,
            CmapEvent::ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent {
                reason: ConnectionCheckoutFailedReason::PoolCleared,
                ..
            })
        )
    })
    .await;
}

#[tokio::test]
async fn establishment_failure_fails_checkout_and_reports_to_topology() {
    let (pool, sink, mut observed) = new_pool(unreachable_address(), Default::default());
    pool.mark_as_ready().await;

    let error = crate::runtime::timeout(Duration::from_secs(30), pool.check_out())
        .await
        .expect("checkout should not hang")
        .unwrap_err();
    assert!(error.is_network_error(), "{:?}", error);

    sink.wait_for(|e| matches!(e, CmapEvent::ConnectionCreated(_))).await;
    sink.wait_for(|e| {
        matches!(
            e,
            CmapEvent::ConnectionClosed(ConnectionClosedEvent {
                reason: crate::event::cmap::ConnectionClosedReason::Error,
                ..
            })
        )
    })
    .await;
    sink.wait_for(|e| matches!(e, CmapEvent::ConnectionCheckoutFailed(_))).await;

    // The establishment failure must surface to the topology so the server can transition to
    // Unknown.
    let observed_update = crate::runtime::timeout(Duration::from_secs(5), observed.recv())
        .await
        .unwrap();
    assert_eq!(observed_update.as_deref(), Some("ApplicationError"));
}

#[tokio::test]
async fn wait_queue_timeout_elapses_while_establishing() {
    // A listener that accepts connections but never responds to the handshake, so
    // establishment hangs past the checkout deadline.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = ServerAddress::Tcp {
        host: "127.0.0.1".to_string(),
        port: Some(listener.local_addr().unwrap().port()),
    };
    let _accept_task = runtime::spawn(async move {
        let mut held = Vec::new();
        loop {
            if let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        }
    });

    let options = ConnectionPoolOptions {
        wait_queue_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let (pool, sink, _observed) = new_pool(address, options);
    pool.mark_as_ready().await;

    let error = pool.check_out().await.unwrap_err();
    assert!(
        matches!(*error.kind, crate::error::ErrorKind::WaitQueueTimeout { .. }),
        "{:?}",
        error
    );

    sink.wait_for(|e| {
        matches!(
            e,
            CmapEvent::ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent {
                reason: ConnectionCheckoutFailedReason::Timeout,
                ..
            })
        )
    })
    .await;
}

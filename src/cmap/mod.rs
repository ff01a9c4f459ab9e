#[cfg(test)]
pub(crate) mod test;

mod checkout;
pub(crate) mod conn;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;
mod status;
mod worker;

use std::time::Duration;

use bson::oid::ObjectId;

pub use self::conn::ConnectionInfo;
pub(crate) use self::{
    conn::{Command, Connection, RawCommandResponse, StreamDescription, REDACTED_COMMANDS},
    status::PoolGenerationSubscriber,
    worker::PoolGeneration,
};

use self::{
    checkout::{CheckoutGrant, CheckoutRequester},
    establish::ConnectionEstablisher,
    manager::PoolManager,
    options::ConnectionPoolOptions,
    worker::ConnectionPoolWorker,
};
use crate::{
    error::{Error, ErrorKind, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionCheckoutFailedEvent,
        ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent,
        PoolCreatedEvent,
    },
    options::ServerAddress,
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// A pool of connections to a single server, bounding the number of concurrent in-flight
/// operations against it. All of the mutable state is managed by a background worker task; this
/// handle forwards requests to it over channels.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    checkout_requester: CheckoutRequester,
    generation_subscriber: PoolGenerationSubscriber,
    event_emitter: CmapEventEmitter,

    /// If a checkout takes longer than this, it fails with a wait queue timeout error. If
    /// `None`, checkouts wait as long as the operation-level deadline allows.
    wait_queue_timeout: Option<Duration>,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        connection_establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let event_emitter = CmapEventEmitter::new(
            options
                .as_ref()
                .and_then(|opts| opts.cmap_event_handler.clone()),
        );

        let wait_queue_timeout = options.as_ref().and_then(|opts| opts.wait_queue_timeout);

        let (manager, checkout_requester, generation_subscriber) = ConnectionPoolWorker::start(
            address.clone(),
            connection_establisher,
            server_updater,
            event_emitter.clone(),
            options,
        );

        event_emitter.emit_event(|| {
            PoolCreatedEvent {
                address: address.clone(),
            }
            .into()
        });

        ConnectionPool {
            address,
            manager,
            checkout_requester,
            generation_subscriber,
            event_emitter,
            wait_queue_timeout,
        }
    }

    /// Checks out a connection from the pool. This method will yield until this request is at
    /// the front of the wait queue, and then will block again if no available connections are
    /// in the pool and the total number of connections is not less than the max pool size.
    pub(crate) async fn check_out(&self) -> Result<Connection> {
        self.event_emitter.emit_event(|| {
            ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        let request = self.checkout_requester.request();

        let conn_result = match self.wait_queue_timeout {
            Some(timeout) => match crate::runtime::timeout(timeout, request).await {
                Ok(grant) => self.redeem_grant(grant).await,
                Err(_) => Err(ErrorKind::WaitQueueTimeout {
                    address: self.address.clone(),
                }
                .into()),
            },
            None => {
                let grant = request.await;
                self.redeem_grant(grant).await
            }
        };

        match conn_result {
            Ok(conn) => {
                self.event_emitter
                    .emit_event(|| conn.checked_out_event().into());
                Ok(conn)
            }
            Err(error) => {
                self.event_emitter.emit_event(|| {
                    let reason = if matches!(*error.kind, ErrorKind::WaitQueueTimeout { .. }) {
                        ConnectionCheckoutFailedReason::Timeout
                    } else if error.is_pool_cleared() {
                        ConnectionCheckoutFailedReason::PoolCleared
                    } else {
                        ConnectionCheckoutFailedReason::ConnectionError
                    };
                    ConnectionCheckoutFailedEvent {
                        address: self.address.clone(),
                        reason,
                    }
                    .into()
                });
                Err(error)
            }
        }
    }

    async fn redeem_grant(&self, grant: CheckoutGrant) -> Result<Connection> {
        match grant {
            CheckoutGrant::Idle(conn) => Ok(*conn),
            CheckoutGrant::Establishing(handle) => handle.await,
            CheckoutGrant::Refused(cause) => {
                Err(Error::pool_cleared_error(&self.address, &cause))
            }
        }
    }

    /// Increment the pool's generation (or the generation of a single load-balancer backend),
    /// transitioning it to the paused state and interrupting queued checkouts.
    pub(crate) fn clear(&self, cause: Error, service_id: Option<ObjectId>) {
        self.manager.clear(cause, service_id);
    }

    /// Mark the pool as "ready", allowing connections to be created and checked out.
    pub(crate) async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().wait_for_acknowledgment().await;
    }

    pub(crate) fn generation(&self) -> PoolGeneration {
        self.generation_subscriber.generation()
    }

    #[cfg(test)]
    pub(crate) fn generation_subscriber(&self) -> PoolGenerationSubscriber {
        self.generation_subscriber.clone()
    }
}

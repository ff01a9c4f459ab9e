use tokio::sync::{mpsc, oneshot};

use super::Connection;
use crate::{
    error::{Error, Result},
    runtime::{AsyncJoinHandle, WorkerRef},
};

/// Opens the checkout channel for a pool worker: a clonable requester for operations and the
/// queue the worker drains. The requester side embeds a [`WorkerRef`], so the worker stays
/// alive exactly as long as something that could still ask it for a connection.
pub(super) fn channel(worker_ref: WorkerRef) -> (CheckoutRequester, CheckoutQueue) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        CheckoutRequester {
            sender,
            _worker: worker_ref,
        },
        CheckoutQueue { receiver },
    )
}

/// The operation-facing end of the checkout channel.
#[derive(Clone, Debug)]
pub(super) struct CheckoutRequester {
    sender: mpsc::UnboundedSender<oneshot::Sender<CheckoutGrant>>,
    _worker: WorkerRef,
}

impl CheckoutRequester {
    /// Asks the pool for a connection, resolving once the worker decides how the request
    /// will be satisfied.
    pub(super) async fn request(&self) -> CheckoutGrant {
        let (grant_in, grant_out) = oneshot::channel();

        // Neither side of this exchange can disappear while we hold a ref to the worker, so
        // failures here are bugs rather than runtime conditions.
        self.sender
            .send(grant_in)
            .expect("pool worker exited while checkout requesters were live");
        grant_out
            .await
            .expect("pool worker dropped a checkout request without answering it")
    }
}

/// The worker-side end of the checkout channel.
#[derive(Debug)]
pub(super) struct CheckoutQueue {
    receiver: mpsc::UnboundedReceiver<oneshot::Sender<CheckoutGrant>>,
}

impl CheckoutQueue {
    pub(super) async fn next(&mut self) -> Option<CheckoutRequest> {
        let grant_in = self.receiver.recv().await?;
        Some(CheckoutRequest { grant_in })
    }
}

/// A single queued checkout, waiting for the worker to answer it.
#[derive(Debug)]
pub(super) struct CheckoutRequest {
    grant_in: oneshot::Sender<CheckoutGrant>,
}

impl CheckoutRequest {
    /// Answers the checkout. If the requesting task already gave up (e.g. its wait-queue
    /// deadline elapsed), the grant is handed back so the worker can recover anything
    /// valuable inside it.
    pub(super) fn grant(self, grant: CheckoutGrant) -> std::result::Result<(), CheckoutGrant> {
        self.grant_in.send(grant)
    }
}

/// The ways the worker can answer a checkout.
#[derive(Debug)]
pub(super) enum CheckoutGrant {
    /// An idle connection, handed over directly.
    Idle(Box<Connection>),

    /// Establishment of a fresh connection was started on the requester's behalf; awaiting
    /// the handle yields the outcome.
    Establishing(AsyncJoinHandle<Result<Connection>>),

    /// The pool is paused and cannot serve the request; the error that paused it is
    /// attached.
    Refused(Error),
}

impl CheckoutGrant {
    /// Extracts the idle connection from a grant that is known to carry one.
    pub(super) fn into_idle_connection(self) -> Connection {
        match self {
            CheckoutGrant::Idle(connection) => *connection,
            other => panic!("checkout grant did not carry an idle connection: {:?}", other),
        }
    }
}

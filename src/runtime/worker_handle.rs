use tokio::sync::watch;

/// A clonable token that ties a background worker's lifetime to its holders. Every handle to
/// the worker (a pool's checkout requester, a topology's public handle) embeds one of these;
/// the worker itself polls the paired [`WorkerRefListener`] and shuts down once the last
/// token is gone.
#[derive(Clone, Debug)]
pub(crate) struct WorkerRef {
    _alive: watch::Receiver<()>,
}

/// The worker-side half of a [`WorkerRef`] pair.
#[derive(Debug)]
pub(crate) struct WorkerRefListener {
    alive: watch::Sender<()>,
}

impl WorkerRefListener {
    /// Creates a listener along with the first token tied to it. Further tokens are cheap
    /// clones of the first.
    pub(crate) fn pair() -> (WorkerRef, WorkerRefListener) {
        let (alive, receiver) = watch::channel(());
        (WorkerRef { _alive: receiver }, WorkerRefListener { alive })
    }

    /// Resolves once every token tied to this listener has been dropped. While any token is
    /// live this never resolves, so it should only be polled from a select loop.
    pub(crate) async fn released(&self) {
        self.alive.closed().await
    }
}

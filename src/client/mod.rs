pub(crate) mod auth;
mod executor;
pub(crate) mod options;
pub(crate) mod session;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bson::Document;

use self::session::ServerSessionPool;
use crate::{
    error::{ErrorKind, Result},
    event::command::CommandEventEmitter,
    operation::RunCommand,
    options::{ClientOptions, SelectionCriteria, ServerAddress},
    sdam::{SelectedServer, Topology, TopologyType},
    selection_criteria::ReadPreference,
};

/// This is the main entry point for the core API. A `Client` is used to connect to a
/// deployment, discover and monitor its topology, and route operations to it.
///
/// `Client` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html)
/// internally, so it can be shared safely across threads or async tasks. Cloning it is cheap
/// and produces a new handle to the same underlying topology.
///
/// ```rust
/// # use ferrodb::{bson::doc, Client, error::Result};
/// # async fn start_workers() -> Result<()> {
/// let client = Client::with_uri_str("mongodb://example.com").await?;
///
/// for i in 0..5 {
///     let client_ref = client.clone();
///
///     tokio::task::spawn(async move {
///         let reply = client_ref
///             .run_command("items", doc! { "ping": 1 })
///             .await;
///     });
/// }
/// #
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    topology: Topology,
    options: ClientOptions,
    session_pool: ServerSessionPool,
    shutdown: AtomicBool,
    command_event_emitter: CommandEventEmitter,
}

impl Client {
    /// Creates a new `Client` connected to the deployment specified by the given connection
    /// string. Monitoring of the deployment starts immediately.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri.as_ref()).await?;

        Client::with_options(options)
    }

    /// Creates a new `Client` connected to the deployment specified by the given options.
    /// Monitoring of the deployment starts immediately.
    ///
    /// This must be called from within an async runtime, since it spawns the background tasks
    /// that monitor the deployment and maintain the connection pools.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let command_event_emitter =
            CommandEventEmitter::new(options.command_event_handler.clone());
        let inner = Arc::new(ClientInner {
            topology: Topology::new(options.clone())?,
            session_pool: ServerSessionPool::new(),
            options,
            shutdown: AtomicBool::new(false),
            command_event_emitter,
        });

        Ok(Client { inner })
    }

    /// Run a command against the `db` database, using the client's default selection criteria
    /// to route it.
    pub async fn run_command(&self, db: &str, command: Document) -> Result<Document> {
        self.run_command_with_criteria(db, command, None).await
    }

    /// Run a command against the `db` database, routed according to `selection_criteria`.
    pub async fn run_command_with_criteria(
        &self,
        db: &str,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let mut op = RunCommand::new(db.to_string(), command, selection_criteria.into())?;
        self.execute_operation(&mut op).await
    }

    /// Shut down this client, stopping the server monitors and closing the connection pools.
    /// Any in-flight operations will be allowed to finish, but subsequent operations will fail
    /// with a shutdown error.
    pub async fn shutdown(self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.topology.shutdown().await;
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Select a server for the given criteria (or the client's defaults), optionally
    /// deprioritizing the server an earlier attempt of the same operation failed on.
    pub(crate) async fn select_server(
        &self,
        criteria: Option<&SelectionCriteria>,
        operation_name: &str,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<SelectedServer> {
        if self.is_shutdown() {
            return Err(ErrorKind::Shutdown.into());
        }

        let default_criteria;
        let criteria = match criteria.or(self.inner.options.selection_criteria.as_ref()) {
            Some(criteria) => criteria,
            None => {
                default_criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
                &default_criteria
            }
        };

        self.inner
            .topology
            .select_server(criteria, operation_name, deprioritized)
            .await
    }

    /// The current type of the monitored topology.
    pub fn topology_type(&self) -> TopologyType {
        self.inner.topology.topology_type()
    }
}

use std::{sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{client::auth::Credential, event::cmap::CmapEventHandler, options::ClientOptions};

/// Contains the options for creating a connection pool.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolOptions {
    /// The application name specified by the user. This is sent to the server as part of the
    /// handshake that each connection makes when it's created.
    pub(crate) app_name: Option<String>,

    /// The credential to use for authenticating connections in this pool.
    #[serde(skip)]
    pub(crate) credential: Option<Credential>,

    /// Processes all events generated by the pool.
    #[serde(skip)]
    pub(crate) cmap_event_handler: Option<Arc<dyn CmapEventHandler>>,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time`
    /// will not be used.
    #[serde(rename = "maxIdleTimeMS")]
    #[serde(default)]
    pub(crate) max_idle_time: Option<Duration>,

    /// The maximum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. A value of zero means there is
    /// no maximum.
    ///
    /// The default is 100.
    pub(crate) max_pool_size: Option<u32>,

    /// The maximum number of new connections that can be created concurrently.
    ///
    /// The default is 2.
    pub(crate) max_connecting: Option<u32>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    ///
    /// The default is that no minimum is enforced.
    pub(crate) min_pool_size: Option<u32>,

    /// Whether to start the pool in the "ready" state.
    ///
    /// Load-balancer backends have no monitor to mark their pool ready, so those pools start
    /// ready.
    #[serde(skip)]
    pub(crate) ready: Option<bool>,

    /// Whether the pool is in load-balanced mode.
    pub(crate) load_balanced: Option<bool>,

    /// The timeout for a socket read or write on established connections.
    #[serde(skip)]
    pub(crate) socket_timeout: Option<Duration>,

    /// The amount of time a checkout request is allowed to wait for a connection to become
    /// available.
    #[serde(rename = "waitQueueTimeoutMS")]
    #[serde(default)]
    pub(crate) wait_queue_timeout: Option<Duration>,
}

impl std::fmt::Debug for ConnectionPoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolOptions")
            .field("app_name", &self.app_name)
            .field("max_idle_time", &self.max_idle_time)
            .field("max_pool_size", &self.max_pool_size)
            .field("max_connecting", &self.max_connecting)
            .field("min_pool_size", &self.min_pool_size)
            .field("load_balanced", &self.load_balanced)
            .field("socket_timeout", &self.socket_timeout)
            .field("wait_queue_timeout", &self.wait_queue_timeout)
            .finish()
    }
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            app_name: options.app_name.clone(),
            credential: options.credential.clone(),
            cmap_event_handler: options.cmap_event_handler.clone(),
            max_idle_time: options.max_idle_time,
            max_pool_size: options.max_pool_size,
            max_connecting: options.max_connecting,
            min_pool_size: options.min_pool_size,
            ready: options.load_balanced,
            load_balanced: options.load_balanced,
            socket_timeout: options.socket_timeout,
            wait_queue_timeout: options.wait_queue_timeout,
        }
    }
}

mod handshake;

use std::time::Duration;

use self::handshake::{Handshaker, HandshakerOptions};
use super::conn::{Connection, ConnectionGeneration, PendingConnection};
use crate::{
    client::auth::{self, Credential},
    error::{Error, Result},
    hello::HelloReply,
    options::{ClientOptions, ServerAddress},
    runtime::{self, AsyncStream},
    sdam::HandshakePhase,
};

#[cfg(feature = "rustls-tls")]
use crate::runtime::TlsConfig;

/// Contains the logic to establish a connection, including handshaking, authenticating, and
/// potentially more.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    /// Contains the logic for handshaking a connection.
    handshaker: Handshaker,

    connect_timeout: Duration,

    socket_timeout: Option<Duration>,

    #[cfg(feature = "rustls-tls")]
    tls_config: Option<TlsConfig>,
}

/// The inputs to connection establishment that are derived once from the client options.
#[derive(Debug)]
pub(crate) struct EstablisherOptions {
    handshake_options: HandshakerOptions,
    connect_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
    #[cfg(feature = "rustls-tls")]
    tls_options: Option<crate::options::TlsOptions>,
}

impl EstablisherOptions {
    pub(crate) fn from_client_options(opts: &ClientOptions) -> Self {
        Self {
            handshake_options: HandshakerOptions::from_client_options(opts),
            connect_timeout: opts.connect_timeout,
            socket_timeout: opts.socket_timeout,
            #[cfg(feature = "rustls-tls")]
            tls_options: opts.tls_options().cloned(),
        }
    }
}

impl ConnectionEstablisher {
    /// Creates a new ConnectionEstablisher from the given options.
    pub(crate) fn new(options: EstablisherOptions) -> Result<Self> {
        let handshaker = Handshaker::new(options.handshake_options);

        let connect_timeout = match options.connect_timeout {
            Some(d) if d.is_zero() => crate::runtime::stream::DEFAULT_CONNECT_TIMEOUT,
            Some(d) => d,
            None => crate::runtime::stream::DEFAULT_CONNECT_TIMEOUT,
        };

        #[cfg(feature = "rustls-tls")]
        let tls_config = match options.tls_options {
            Some(ref tls_opts) => Some(TlsConfig::new(tls_opts)?),
            None => None,
        };

        Ok(Self {
            handshaker,
            connect_timeout,
            socket_timeout: options.socket_timeout,
            #[cfg(feature = "rustls-tls")]
            tls_config,
        })
    }

    async fn make_stream(&self, address: &ServerAddress) -> Result<AsyncStream> {
        #[cfg(feature = "rustls-tls")]
        {
            AsyncStream::connect(address, Some(self.connect_timeout), self.tls_config.as_ref())
                .await
        }
        #[cfg(not(feature = "rustls-tls"))]
        {
            AsyncStream::connect(address, Some(self.connect_timeout)).await
        }
    }

    /// Establishes a connection for use in the pool: connect, handshake, and authenticate.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
        credential: Option<&Credential>,
    ) -> std::result::Result<Connection, EstablishError> {
        let pool_generation = pending_connection.generation.clone();
        let address = pending_connection.address.clone();

        let stream = self
            .make_stream(&address)
            .await
            .map_err(|e| EstablishError::pre_hello(e, pool_generation.clone()))?;

        let mut connection =
            Connection::new(pending_connection, stream, self.socket_timeout);

        let handshake_result = self
            .handshaker
            .handshake(&mut connection, credential)
            .await
            .map_err(|e| EstablishError::pre_hello(e, pool_generation.clone()))?;

        // In load-balanced mode, the service-scoped generation can only be pinned once the
        // handshake reveals which backend the load balancer selected.
        if let super::worker::PoolGeneration::LoadBalanced(ref gen_map) = pool_generation {
            let service_id = match handshake_result.hello_reply.command_response.service_id {
                Some(service_id) => service_id,
                None => {
                    let error = Error::invalid_response(
                        "load balancer did not include a serviceId in its hello response",
                    );
                    return Err(EstablishError::post_hello(
                        error,
                        connection.generation.clone(),
                    ));
                }
            };
            connection.generation = ConnectionGeneration::LoadBalanced {
                generation: *gen_map.get(&service_id).unwrap_or(&0),
                service_id,
            };
        }

        if let Some(credential) = credential {
            auth::authenticate_stream(
                &mut connection,
                credential,
                handshake_result.first_round,
            )
            .await
            .map_err(|e| EstablishError::post_hello(e, connection.generation.clone()))?;
        }

        Ok(connection)
    }

    /// Establishes a monitoring connection: connect and handshake only, no authentication.
    /// Returns the resulting connection along with the hello reply from the handshake.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
    ) -> Result<(Connection, HelloReply)> {
        let stream = self.make_stream(&address).await?;
        let mut connection = Connection::new_monitoring(address, stream);

        let hello_reply = runtime::timeout(self.connect_timeout, async {
            self.handshaker
                .handshake(&mut connection, None)
                .await
                .map(|result| result.hello_reply)
        })
        .await??;

        Ok((connection, hello_reply))
    }
}

/// An error that occurred during connection establishment, annotated with the phase of the
/// handshake it occurred in so the topology can classify it correctly.
#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}

impl EstablishError {
    fn pre_hello(cause: Error, generation: super::worker::PoolGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PreHello { generation },
        }
    }

    fn post_hello(cause: Error, generation: ConnectionGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PostHello { generation },
        }
    }
}

use std::{
    net::SocketAddr,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
};

#[cfg(feature = "rustls-tls")]
use super::tls_rustls::TlsConfig;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A stream to a server, possibly wrapped in TLS.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// Placeholder used when moving the stream out of a connection that is being torn down.
    Null,

    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    #[cfg(feature = "rustls-tls")]
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncStream {
    /// Creates a new stream connected to `address`, wrapping it in TLS if `tls_cfg` is present.
    pub(crate) async fn connect(
        address: &ServerAddress,
        connect_timeout: Option<Duration>,
        #[cfg(feature = "rustls-tls")] tls_cfg: Option<&TlsConfig>,
    ) -> Result<Self> {
        let timeout = match connect_timeout {
            Some(d) if d != Duration::from_secs(0) => d,
            _ => DEFAULT_CONNECT_TIMEOUT,
        };
        let inner = super::timeout(timeout, tcp_connect(address)).await??;

        #[cfg(feature = "rustls-tls")]
        if let Some(cfg) = tls_cfg {
            let host = address.host().to_string();
            let stream = cfg.connect(host.as_str(), inner).await?;
            return Ok(Self::Tls(stream));
        }

        Ok(Self::Tcp(inner))
    }
}

async fn tcp_connect(address: &ServerAddress) -> Result<TcpStream> {
    let mut socket_addrs: Vec<SocketAddr> = tokio::net::lookup_host(address.to_string())
        .await
        .map_err(Error::network)?
        .collect();

    if socket_addrs.is_empty() {
        return Err(ErrorKind::DnsResolve {
            message: format!("no addresses found for {}", address),
        }
        .into());
    }

    // Try each of the resolved addresses in sequence with a preference for IPv4.
    socket_addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

    let mut connect_error = None;
    for socket_addr in &socket_addrs {
        match TcpStream::connect(socket_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(Error::network)?;
                return Ok(stream);
            }
            Err(err) => connect_error = Some(Error::network(err)),
        }
    }

    Err(connect_error.unwrap_or_else(|| Error::network_timeout()))
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(0)),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}

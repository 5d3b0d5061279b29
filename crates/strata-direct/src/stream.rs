//! Socket establishment and TCP/TLS stream unification.
//!
//! Framing is unaware of TLS: when an endpoint's scheme asks for it, the
//! TLS session wraps the raw TCP stream beneath the frame codec and
//! everything above sees one [`NodeStream`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::health::{Endpoint, TransportScheme};

/// One established socket to a storage node, plain or TLS.
#[derive(Debug)]
pub(crate) enum NodeStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Open a socket to `endpoint`, applying `connect_timeout` to the TCP
/// connect and the configured handshake timeout to TLS, when in play.
pub(crate) async fn connect(
    endpoint: &Endpoint,
    config: &TransportConfig,
    connect_timeout: Duration,
) -> TransportResult<NodeStream> {
    let tcp = timeout(
        connect_timeout,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| TransportError::Timeout {
        operation: "connect",
        elapsed: connect_timeout,
    })??;
    tcp.set_nodelay(true)?;

    match endpoint.scheme {
        TransportScheme::Tcp => {
            debug!(endpoint = %endpoint, "tcp connection established");
            Ok(NodeStream::Plain(tcp))
        }
        TransportScheme::Tls => {
            let Some(tls) = config.tls.clone() else {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("endpoint {endpoint} requires TLS but no TLS configuration was provided"),
                )));
            };

            let server_name = ServerName::try_from(endpoint.host.clone()).map_err(|e| {
                TransportError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid server name {}: {e}", endpoint.host),
                ))
            })?;

            let connector = TlsConnector::from(tls);
            let stream = timeout(
                config.tls_handshake_timeout,
                connector.connect(server_name, tcp),
            )
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "tls handshake",
                elapsed: config.tls_handshake_timeout,
            })??;

            debug!(endpoint = %endpoint, "tls connection established");
            Ok(NodeStream::Tls(Box::new(stream)))
        }
    }
}

impl AsyncRead for NodeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NodeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Plain(s) => s.is_write_vectored(),
            Self::Tls(s) => s.is_write_vectored(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_failure_surfaces_as_io_error() {
        // Port 1 on localhost is essentially never listening.
        let endpoint = Endpoint::tcp("127.0.0.1", 1);
        let config = TransportConfig::default();

        let err = connect(&endpoint, &config, Duration::from_secs(1))
            .await
            .expect_err("refused");
        assert!(matches!(
            err,
            TransportError::Io(_) | TransportError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn tls_without_configuration_is_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let endpoint = Endpoint::tls("127.0.0.1", port);
        let config = TransportConfig::default();

        let err = connect(&endpoint, &config, Duration::from_secs(1))
            .await
            .expect_err("no tls config");
        assert!(
            matches!(err, TransportError::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput)
        );
    }
}

//! Byte transport with an in-place STARTTLS upgrade.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::types::TransportKind;
use crate::XmppError;

/// Any byte stream a connection can run over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Io for T {}

/// The transport underneath one connection.
pub enum Transport {
    /// Plaintext stream (pre-STARTTLS)
    Plain(Box<dyn Io>),
    /// TLS stream (post-STARTTLS)
    Tls(Box<TlsStream<Box<dyn Io>>>),
}

/// A failed STARTTLS upgrade.
pub struct UpgradeError {
    pub error: XmppError,
    /// The plaintext transport, when the handshake failed cleanly enough to
    /// hand it back.
    pub transport: Option<Transport>,
}

impl Transport {
    /// Wrap a plaintext stream.
    pub fn plain(io: impl Io) -> Self {
        Transport::Plain(Box::new(io))
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Plain(_) => TransportKind::Tcp,
            Transport::Tls(_) => TransportKind::TcpTls,
        }
    }

    /// Run the server side of a TLS handshake over this transport.
    pub async fn starttls(
        self,
        acceptor: &TlsAcceptor,
        handshake_timeout: Duration,
    ) -> Result<Transport, UpgradeError> {
        let plain = match self {
            Transport::Plain(io) => io,
            tls @ Transport::Tls(_) => {
                return Err(UpgradeError {
                    error: XmppError::tls_handshake("Transport is already encrypted"),
                    transport: Some(tls),
                })
            }
        };

        match tokio::time::timeout(handshake_timeout, acceptor.accept(plain).into_fallible()).await
        {
            Ok(Ok(tls)) => {
                debug!("TLS handshake complete");
                Ok(Transport::Tls(Box::new(tls)))
            }
            Ok(Err((e, io))) => Err(UpgradeError {
                error: XmppError::tls_handshake(e.to_string()),
                transport: Some(Transport::Plain(io)),
            }),
            Err(_) => Err(UpgradeError {
                error: XmppError::tls_handshake(format!(
                    "Handshake timed out after {:?}",
                    handshake_timeout
                )),
                transport: None,
            }),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transport({})", self.kind())
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(io) => Pin::new(io).poll_read(cx, buf),
            Transport::Tls(tls) => Pin::new(tls).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(io) => Pin::new(io).poll_write(cx, buf),
            Transport::Tls(tls) => Pin::new(tls).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(io) => Pin::new(io).poll_flush(cx),
            Transport::Tls(tls) => Pin::new(tls).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(io) => Pin::new(io).poll_shutdown(cx),
            Transport::Tls(tls) => Pin::new(tls).poll_shutdown(cx),
        }
    }
}

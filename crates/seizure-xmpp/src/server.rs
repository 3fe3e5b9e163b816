//! XMPP server implementation.
//!
//! The server listens on TCP port 5222 for client-to-server (C2S)
//! connections and runs one task per accepted connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::connection::{ConnectionActor, ConnectionContext};
use crate::registry::ConnectionRegistry;
use crate::XmppError;

/// XMPP server configuration.
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    /// Address to bind for C2S connections (default: 0.0.0.0:5222)
    pub c2s_addr: SocketAddr,
    /// Server domain (e.g., "localhost")
    pub domain: String,
    /// Limit on the STARTTLS handshake (default: 10s)
    pub tls_handshake_timeout: Duration,
    /// Idle read timeout; None disables it (default)
    pub read_timeout: Option<Duration>,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        Self {
            c2s_addr: SocketAddr::from(([0, 0, 0, 0], 5222)),
            domain: "localhost".to_string(),
            tls_handshake_timeout: Duration::from_secs(10),
            read_timeout: None,
        }
    }
}

/// XMPP server instance.
pub struct XmppServer {
    config: XmppServerConfig,
    listener: TcpListener,
    tls_acceptor: TlsAcceptor,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl XmppServer {
    /// Serve on an already bound listener.
    pub fn from_listener(
        listener: TcpListener,
        config: XmppServerConfig,
        tls_acceptor: TlsAcceptor,
    ) -> Self {
        Self {
            config,
            listener,
            tls_acceptor,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Bind `config.c2s_addr` and create the server.
    pub async fn bind(config: XmppServerConfig, tls_acceptor: TlsAcceptor) -> Result<Self, XmppError> {
        let listener = TcpListener::bind(config.c2s_addr).await?;
        Ok(Self::from_listener(listener, config, tls_acceptor))
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, XmppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Get the server configuration.
    pub fn config(&self) -> &XmppServerConfig {
        &self.config
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn connection_context(&self) -> ConnectionContext {
        ConnectionContext::new(
            self.config.domain.clone(),
            self.tls_acceptor.clone(),
            Arc::clone(&self.registry),
        )
        .with_tls_handshake_timeout(self.config.tls_handshake_timeout)
        .with_read_timeout(self.config.read_timeout)
    }

    /// Accept connections until [`stop`](Self::stop) is called.
    ///
    /// Accept errors are logged and do not end the loop.
    pub async fn run(&self) -> Result<(), XmppError> {
        let addr = self.local_addr()?;
        info!(addr = %addr, domain = %self.config.domain, "XMPP C2S server listening");

        let ctx = self.connection_context();

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept C2S connection");
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }

            let ctx = ctx.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = ConnectionActor::handle_connection(stream, peer_addr, ctx).await {
                        warn!(error = %e, "Connection error");
                    }
                }
                .instrument(info_span!(
                    "xmpp.connection.lifecycle",
                    client_ip = %peer_addr,
                    transport = "tcp",
                )),
            );
        }

        info!("XMPP C2S server stopped accepting");
        Ok(())
    }

    /// Close every live connection and stop accepting. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(connections = self.registry.connection_count(), "Stopping XMPP server");
        self.shutdown.cancel();
        let connections = self.registry.stop();
        futures::future::join_all(connections.iter().map(|conn| conn.close())).await;
    }
}

impl std::fmt::Debug for XmppServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppServer")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish()
    }
}

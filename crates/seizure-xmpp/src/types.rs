//! Common types for the XMPP front door.

/// Connection state in the XMPP stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, waiting for the first stream header
    Opened,
    /// Stream opened, negotiating features
    StreamNegotiating,
    /// STARTTLS upgrade in progress
    TlsUpgrading,
    /// SASL authentication in progress
    Authenticating,
    /// Authenticated, binding resource
    Binding,
    /// Resource bound
    SessionEstablished,
    /// Connection closed
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Opened => write!(f, "opened"),
            ConnectionState::StreamNegotiating => write!(f, "stream-negotiating"),
            ConnectionState::TlsUpgrading => write!(f, "tls-upgrading"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Binding => write!(f, "binding"),
            ConnectionState::SessionEstablished => write!(f, "session-established"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Transport type for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain TCP (pre-STARTTLS)
    Tcp,
    /// TCP with TLS (post-STARTTLS)
    TcpTls,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::TcpTls => write!(f, "tcp+tls"),
        }
    }
}

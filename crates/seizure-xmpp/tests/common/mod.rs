//! Test utilities for XMPP negotiation testing.
//!
//! Provides helpers for starting test servers, generating TLS certificates,
//! and driving raw XMPP client connections.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, ServerName};
use seizure_xmpp::registry::ConnectionRegistry;
use seizure_xmpp::{XmppServer, XmppServerConfig};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Install the ring crypto provider for rustls.
/// Must be called once before any TLS operations.
pub fn install_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(seizure_xmpp::tls::install_crypto_provider);
}

/// Initialize tracing and crypto provider for tests (only once).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        install_crypto_provider();

        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Self-signed TLS credentials for a test domain.
pub struct TestTlsCredentials {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub cert_der: CertificateDer<'static>,
}

impl TestTlsCredentials {
    /// Generate self-signed TLS credentials for testing.
    pub fn generate(domain: &str) -> Self {
        let subject_alt_names = vec![domain.to_string(), "localhost".to_string()];
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
            .expect("Failed to generate test certificate");

        Self {
            cert_pem: cert.pem().into_bytes(),
            key_pem: key_pair.serialize_pem().into_bytes(),
            cert_der: CertificateDer::from(cert.der().to_vec()),
        }
    }

    /// Create a TLS acceptor (server-side) from these credentials.
    pub fn tls_acceptor(&self) -> TlsAcceptor {
        seizure_xmpp::tls::acceptor_from_pem(&self.cert_pem, &self.key_pem)
            .expect("Failed to create TLS acceptor")
    }

    /// Create a TLS connector (client-side) that trusts this certificate.
    pub fn tls_connector(&self) -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        root_store.add(self.cert_der.clone()).expect("Failed to add cert");

        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        TlsConnector::from(Arc::new(client_config))
    }
}

/// Test server handle.
pub struct TestServer {
    pub addr: SocketAddr,
    pub domain: String,
    pub tls_credentials: TestTlsCredentials,
    server: Arc<XmppServer>,
    runner: JoinHandle<()>,
}

impl TestServer {
    /// Start a test XMPP server for `localhost` on an available port.
    pub async fn start() -> Self {
        Self::start_with_config(XmppServerConfig::default()).await
    }

    /// Start a test server with a custom configuration; `c2s_addr` is ignored.
    pub async fn start_with_config(config: XmppServerConfig) -> Self {
        install_crypto_provider();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test server");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let domain = config.domain.clone();
        let tls_credentials = TestTlsCredentials::generate(&domain);
        let server = Arc::new(XmppServer::from_listener(
            listener,
            config,
            tls_credentials.tls_acceptor(),
        ));

        let runner = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                if let Err(e) = server.run().await {
                    eprintln!("Test server error: {}", e);
                }
            }
        });

        Self {
            addr,
            domain,
            tls_credentials,
            server,
            runner,
        }
    }

    /// The server's live-connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.server.registry()
    }

    /// Stop the server and close all connections.
    pub async fn stop(&self) {
        self.server.stop().await;
    }

    /// Get a TLS connector that trusts this server.
    pub fn tls_connector(&self) -> TlsConnector {
        self.tls_credentials.tls_connector()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.runner.abort();
    }
}

/// Client side of the transport, before or after STARTTLS.
enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient state while the upgrade owns the socket
    Upgrading,
}

/// A client that speaks raw XML for byte-level control over negotiation.
pub struct RawXmppClient {
    stream: ClientStream,
    buffer: String,
}

impl RawXmppClient {
    /// Connect to a server.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            stream: ClientStream::Plain(TcpStream::connect(addr).await?),
            buffer: String::new(),
        })
    }

    /// Send raw data.
    pub async fn send(&mut self, data: &str) -> io::Result<()> {
        match &mut self.stream {
            ClientStream::Plain(tcp) => write_flush(tcp, data).await,
            ClientStream::Tls(tls) => write_flush(tls.as_mut(), data).await,
            ClientStream::Upgrading => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Read one chunk into the buffer. Returns the number of bytes read;
    /// zero means the server closed the transport.
    async fn fill(&mut self, limit: Duration) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let read = async {
            match &mut self.stream {
                ClientStream::Plain(tcp) => tcp.read(&mut chunk).await,
                ClientStream::Tls(tls) => tls.read(&mut chunk).await,
                ClientStream::Upgrading => Err(io::ErrorKind::NotConnected.into()),
            }
        };
        let n = timeout(limit, read)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "Timeout"))??;
        self.buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
        Ok(n)
    }

    /// Read until any of `patterns` shows up in the buffer.
    async fn fill_until(&mut self, patterns: &[&str], limit: Duration) -> io::Result<()> {
        let deadline = tokio::time::Instant::now() + limit;
        while !patterns.iter().any(|p| self.buffer.contains(p)) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("Timeout waiting for {:?}; got {:?}", patterns, self.buffer),
                ));
            }
            if self.fill(remaining).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("Stream ended waiting for {:?}; got {:?}", patterns, self.buffer),
                ));
            }
        }
        Ok(())
    }

    /// Read until `pattern` shows up; returns everything buffered so far.
    pub async fn read_until(&mut self, pattern: &str, limit: Duration) -> io::Result<String> {
        self.fill_until(&[pattern], limit).await?;
        Ok(self.buffer.clone())
    }

    /// Read until any of `patterns` shows up and drain the buffer.
    pub async fn read_until_any(&mut self, patterns: &[&str]) -> io::Result<String> {
        self.fill_until(patterns, DEFAULT_TIMEOUT).await?;
        Ok(self.take_buffer())
    }

    /// Read until the server closes the transport.
    pub async fn read_to_end(&mut self, limit: Duration) -> io::Result<String> {
        while self.fill(limit).await? > 0 {}
        Ok(self.take_buffer())
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn take_buffer(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    /// Run the client side of the TLS handshake after `<proceed/>`.
    pub async fn upgrade_tls(&mut self, connector: TlsConnector, domain: &str) -> io::Result<()> {
        let ClientStream::Plain(tcp) = std::mem::replace(&mut self.stream, ClientStream::Upgrading)
        else {
            return Err(io::Error::new(io::ErrorKind::Other, "Not a plaintext stream"));
        };

        let server_name: ServerName<'static> = domain
            .to_string()
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid server name"))?;

        let tls = connector.connect(server_name, tcp).await?;
        self.stream = ClientStream::Tls(Box::new(tls));
        self.buffer.clear();
        Ok(())
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, ClientStream::Tls(_))
    }

    /// Open a stream to `domain` and drain everything up to the features,
    /// or up to the stream error for a rejected domain.
    pub async fn open_stream(&mut self, domain: &str) -> io::Result<String> {
        self.clear();
        self.send(&stream_open(domain)).await?;
        self.fill_until(&["</stream:features>", "</stream:error>"], DEFAULT_TIMEOUT)
            .await?;
        Ok(self.take_buffer())
    }

    /// Run SASL PLAIN for `name` and return the server's answer.
    pub async fn auth_plain(&mut self, name: &str, password: &str) -> io::Result<String> {
        self.clear();
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            encode_sasl_plain(name, password)
        ))
        .await?;
        self.read_until_any(&["<success", "</failure>"]).await
    }

    /// Send a bind request and return the reply.
    pub async fn bind(&mut self, id: &str, resource: Option<&str>) -> io::Result<String> {
        self.clear();
        let resource = resource
            .map(|r| format!("<resource>{}</resource>", r))
            .unwrap_or_default();
        self.send(&format!(
            "<iq type='set' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>{}</bind></iq>",
            id, resource
        ))
        .await?;
        self.read_until_any(&["</iq>"]).await
    }
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, data: &str) -> io::Result<()> {
    writer.write_all(data.as_bytes()).await?;
    writer.flush().await
}

/// Client stream header for `domain`.
pub fn stream_open(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?>\
        <stream:stream \
        xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' \
        to='{}' \
        version='1.0'>",
        domain
    )
}

/// Connect and authenticate over plaintext, ready for binding.
pub async fn authenticated_client(server: &TestServer, name: &str) -> RawXmppClient {
    let mut client = RawXmppClient::connect(server.addr).await.unwrap();
    client.open_stream(&server.domain).await.unwrap();
    let reply = client.auth_plain(name, "secret").await.unwrap();
    assert!(reply.contains("<success"), "auth failed: {}", reply);
    let features = client.open_stream(&server.domain).await.unwrap();
    assert!(features.contains("urn:ietf:params:xml:ns:xmpp-bind"));
    client
}

/// Poll `condition` until it holds or the default timeout passes.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < DEFAULT_TIMEOUT {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Helper to encode SASL PLAIN credentials.
pub fn encode_sasl_plain(name: &str, password: &str) -> String {
    let data = format!("\0{}\0{}", name, password);
    BASE64_STANDARD.encode(data.as_bytes())
}

/// Helper to check stream header attributes, accepting either quote style.
pub fn validate_stream_header(response: &str) -> Result<(), String> {
    let has = |attr: &str| {
        response.contains(&format!("{}='", attr)) || response.contains(&format!("{}=\"", attr))
    };

    if !response.contains("xmlns='jabber:client'") && !response.contains("xmlns=\"jabber:client\"") {
        return Err("Missing xmlns='jabber:client'".to_string());
    }
    if !has("xmlns:stream") {
        return Err("Missing xmlns:stream".to_string());
    }
    if !response.contains("version='1.0'") && !response.contains("version=\"1.0\"") {
        return Err("Missing or incorrect version attribute".to_string());
    }
    if !has("id") {
        return Err("Missing id attribute".to_string());
    }
    if !has("from") {
        return Err("Missing from attribute".to_string());
    }

    Ok(())
}

/// Extract a JID from a bind result.
pub fn extract_bound_jid(response: &str) -> Option<String> {
    let open = response.find("<jid")?;
    let start = open + response[open..].find('>')? + 1;
    let end = start + response[start..].find("</jid>")?;
    Some(response[start..end].to_string())
}

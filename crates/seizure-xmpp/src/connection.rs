//! Connection state and the actor driving one client connection.
//!
//! A [`Connection`] is the shared handle: identity, the serialized write
//! path and idempotent close. The [`ConnectionActor`] owns the read half and
//! the parser and runs the negotiation state machine on its own task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use jid::{BareJid, FullJid};
use minidom::Element;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::auth::{decode_plain, SaslMechanism};
use crate::error::{generate_iq_error, generate_stream_error, SaslFailureCondition, StreamErrorCondition};
use crate::parser::{element_to_string, ns, StreamEvent, StreamHeader, XmlParser};
use crate::registry::ConnectionRegistry;
use crate::session::Session;
use crate::stanza::iq_result;
use crate::stream::{
    sasl_failure, sasl_success, stream_header, tls_failure, tls_proceed, StreamFeatures,
    STREAM_CLOSE,
};
use crate::transport::{Io, Transport, UpgradeError};
use crate::types::{ConnectionState, TransportKind};
use crate::XmppError;

const READ_BUFFER_SIZE: usize = 8192;

/// Upper bound on flushing the closing tag during close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type Reader = ReadHalf<Transport>;
type Writer = WriteHalf<Transport>;

/// A failed upgrade, with the read half when the transport survived.
type StartTlsError = (XmppError, Option<Reader>);

/// Shared handle to one client connection.
pub struct Connection {
    id: String,
    peer_addr: SocketAddr,
    session: RwLock<Session>,
    /// Write half. `None` once closed or while an upgrade holds the transport.
    writer: Mutex<Option<Writer>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl Connection {
    /// Wrap `transport` in a new connection, returning the read half for the
    /// task that drives it.
    pub(crate) fn new(
        transport: Transport,
        peer_addr: SocketAddr,
        domain: &str,
        registry: Arc<ConnectionRegistry>,
    ) -> (Arc<Self>, Reader) {
        let id = Uuid::new_v4().to_string();
        let (reader, writer) = tokio::io::split(transport);

        let connection = Arc::new(Self {
            session: RwLock::new(Session::new(id.clone(), domain)),
            id,
            peer_addr,
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            registry,
        });

        (connection, reader)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `f` against the session under its read lock.
    pub fn with_session<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
        f(&session)
    }

    pub(crate) fn with_session_mut<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut session)
    }

    pub fn bare_jid(&self) -> Option<BareJid> {
        self.with_session(|s| s.bare_jid().cloned())
    }

    pub fn full_jid(&self) -> Option<FullJid> {
        self.with_session(|s| s.full_jid().cloned())
    }

    pub fn transport_kind(&self) -> TransportKind {
        if self.with_session(Session::is_tls_started) {
            TransportKind::TcpTls
        } else {
            TransportKind::Tcp
        }
    }

    /// Write raw XML to the peer.
    ///
    /// Writes are serialized through the writer lock and complete in the
    /// order they were submitted. A write error closes the connection.
    pub async fn send_raw(&self, data: &str) {
        if self.is_closed() {
            return;
        }

        let result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => write_frame(writer, data.as_bytes()).await,
                None => return,
            }
        };

        match result {
            Ok(()) => trace!(conn_id = %self.id, bytes = data.len(), "Sent"),
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "Write failed, closing connection");
                self.close().await;
            }
        }
    }

    /// Serialize and send a stanza.
    pub async fn send_element(&self, element: &Element) {
        match element_to_string(element) {
            Ok(xml) => self.send_raw(&xml).await,
            Err(e) => warn!(conn_id = %self.id, error = %e, "Failed to serialize stanza"),
        }
    }

    /// Close the connection.
    ///
    /// Only the first call does anything: it stops the read loop, deregisters,
    /// sends the closing stream tag best-effort, releases the transport and
    /// disposes the session. Later and concurrent calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.registry.remove(&self.id);

        let flushed = tokio::time::timeout(CLOSE_TIMEOUT, async {
            let mut guard = self.writer.lock().await;
            match guard.take() {
                Some(mut writer) => {
                    write_frame(&mut writer, STREAM_CLOSE.as_bytes()).await?;
                    writer.shutdown().await
                }
                None => Ok(()),
            }
        })
        .await;

        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(conn_id = %self.id, error = %e, "Failed to send stream close"),
            Err(_) => debug!(conn_id = %self.id, "Timed out sending stream close"),
        }

        let (jid, duration_ms) = self.with_session_mut(|session| {
            let jid = session
                .full_jid()
                .map(ToString::to_string)
                .or_else(|| session.bare_jid().map(ToString::to_string));
            let duration_ms = (Utc::now() - session.created_at()).num_milliseconds();
            session.dispose();
            (jid, duration_ms)
        });

        info!(
            conn_id = %self.id,
            peer = %self.peer_addr,
            jid = jid.as_deref().unwrap_or("-"),
            duration_ms,
            "Connection closed"
        );
    }

    /// Swap the plaintext transport for TLS.
    ///
    /// The writer lock is held for the whole handshake, so nothing is written
    /// to the connection until the upgrade has finished one way or the other.
    pub(crate) async fn starttls(
        &self,
        reader: Reader,
        acceptor: &TlsAcceptor,
        handshake_timeout: Duration,
    ) -> Result<Reader, StartTlsError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.take() else {
            return Err((XmppError::stream("Connection already closed"), Some(reader)));
        };

        match reader.unsplit(writer).starttls(acceptor, handshake_timeout).await {
            Ok(tls) => {
                let (reader, writer) = tokio::io::split(tls);
                *guard = Some(writer);
                Ok(reader)
            }
            Err(UpgradeError {
                error,
                transport: Some(plain),
            }) => {
                let (reader, writer) = tokio::io::split(plain);
                *guard = Some(writer);
                Err((error, Some(reader)))
            }
            Err(UpgradeError {
                error,
                transport: None,
            }) => Err((error, None)),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .field("full_jid", &self.full_jid())
            .finish()
    }
}

async fn write_frame(writer: &mut Writer, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

/// Everything a connection needs from the server that accepted it.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Service domain
    pub domain: String,
    /// TLS material for STARTTLS
    pub tls_acceptor: TlsAcceptor,
    /// Shared live-connection registry
    pub registry: Arc<ConnectionRegistry>,
    /// Limit on the STARTTLS handshake
    pub tls_handshake_timeout: Duration,
    /// Close the connection after this long without inbound data
    pub read_timeout: Option<Duration>,
}

impl ConnectionContext {
    pub fn new(
        domain: impl Into<String>,
        tls_acceptor: TlsAcceptor,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            domain: domain.into(),
            tls_acceptor,
            registry,
            tls_handshake_timeout: Duration::from_secs(10),
            read_timeout: None,
        }
    }

    pub fn with_tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.tls_handshake_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Actor managing a single XMPP client connection.
pub struct ConnectionActor {
    connection: Arc<Connection>,
    /// Read half; taken out while STARTTLS rebuilds the transport
    reader: Option<Reader>,
    parser: XmlParser,
    state: ConnectionState,
    ctx: ConnectionContext,
}

impl ConnectionActor {
    /// Set up an actor for a freshly accepted transport.
    pub fn new(io: impl Io, peer_addr: SocketAddr, ctx: ConnectionContext) -> Self {
        let (connection, reader) = Connection::new(
            Transport::plain(io),
            peer_addr,
            &ctx.domain,
            Arc::clone(&ctx.registry),
        );

        Self {
            connection,
            reader: Some(reader),
            parser: XmlParser::new(),
            state: ConnectionState::Opened,
            ctx,
        }
    }

    /// Handle a new incoming connection until it closes.
    #[instrument(
        name = "xmpp.connection.handle",
        skip(io, ctx),
        fields(
            peer = %peer_addr,
            conn_id = tracing::field::Empty,
            jid = tracing::field::Empty,
        )
    )]
    pub async fn handle_connection(
        io: impl Io,
        peer_addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), XmppError> {
        info!("New connection from {}", peer_addr);
        let actor = Self::new(io, peer_addr, ctx);
        tracing::Span::current().record("conn_id", actor.connection.id());
        actor.run().await
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Register, process input until the stream ends, then close.
    pub async fn run(mut self) -> Result<(), XmppError> {
        if !self.ctx.registry.add(Arc::clone(&self.connection)) {
            self.connection.close().await;
            self.transition(ConnectionState::Closed);
            return Ok(());
        }

        let result = self.read_loop().await;

        self.connection.close().await;
        self.transition(ConnectionState::Closed);
        result
    }

    async fn read_loop(&mut self) -> Result<(), XmppError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let shutdown = self.connection.shutdown.clone();
        let read_timeout = self.ctx.read_timeout;

        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(());
            };

            let read = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                read = read_chunk(reader, &mut buf, read_timeout) => read,
            };

            let n = match read {
                Ok(Some(n)) => n,
                Ok(None) => {
                    debug!(timeout = ?read_timeout, "Read timed out");
                    return Ok(());
                }
                Err(e) => {
                    debug!(error = %e, "Read failed");
                    return Ok(());
                }
            };

            if n == 0 {
                debug!("Peer closed transport");
                return Ok(());
            }

            self.parser.feed(&buf[..n]);

            while let Some(event) = self.parser.next_event()? {
                self.handle_event(event).await?;
                if self.connection.is_closed() {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_event(&mut self, event: StreamEvent) -> Result<(), XmppError> {
        match event {
            StreamEvent::Opened(header) => {
                self.handle_stream_open(header).await;
                Ok(())
            }
            StreamEvent::Stanza(stanza) => self.handle_stanza(stanza).await,
            StreamEvent::Closed => {
                debug!("Peer closed stream");
                self.connection.close().await;
                Ok(())
            }
        }
    }

    async fn handle_stream_open(&mut self, header: StreamHeader) {
        self.transition(ConnectionState::StreamNegotiating);

        let stream_id = Uuid::new_v4().to_string();
        self.connection
            .send_raw(&stream_header(&stream_id, &self.ctx.domain))
            .await;

        let domain_matches = header
            .to
            .as_deref()
            .is_some_and(|to| to.eq_ignore_ascii_case(&self.ctx.domain));

        if !domain_matches {
            // The stream stays open so the client may reopen it correctly.
            debug!(expected = %self.ctx.domain, got = ?header.to, "Domain mismatch in stream header");
            self.connection
                .send_raw(&generate_stream_error(StreamErrorCondition::HostUnknown, None))
                .await;
            return;
        }

        let features = self
            .connection
            .with_session(|s| StreamFeatures::for_session(s.is_authenticated(), s.is_tls_started()));
        self.connection.send_raw(&features.to_xml()).await;
    }

    async fn handle_stanza(&mut self, stanza: Element) -> Result<(), XmppError> {
        if stanza.is("starttls", ns::TLS) {
            self.handle_starttls().await
        } else if stanza.is("auth", ns::SASL) {
            self.handle_auth(&stanza).await;
            Ok(())
        } else if stanza.is("iq", ns::JABBER_CLIENT) {
            self.handle_iq(&stanza).await
        } else {
            debug!(name = %stanza.name(), ns = %stanza.ns(), "Ignoring stanza");
            Ok(())
        }
    }

    async fn handle_starttls(&mut self) -> Result<(), XmppError> {
        if self.connection.with_session(Session::is_tls_started) {
            warn!("STARTTLS requested on an encrypted stream");
            self.connection.send_raw(&tls_failure()).await;
            self.connection.close().await;
            return Ok(());
        }

        self.transition(ConnectionState::TlsUpgrading);
        self.connection.send_raw(&tls_proceed()).await;

        let reader = self
            .reader
            .take()
            .ok_or_else(|| XmppError::internal("Read half missing at STARTTLS"))?;

        match self
            .connection
            .starttls(reader, &self.ctx.tls_acceptor, self.ctx.tls_handshake_timeout)
            .await
        {
            Ok(reader) => {
                self.reader = Some(reader);
                self.connection.with_session_mut(Session::mark_tls_started);
                self.parser.reset();
                self.transition(ConnectionState::StreamNegotiating);
                info!("TLS established");
            }
            Err((error, reader)) => {
                warn!(error = %error, "STARTTLS failed");
                self.reader = reader;
                self.connection.send_raw(&tls_failure()).await;
                self.connection.close().await;
            }
        }
        Ok(())
    }

    async fn handle_auth(&mut self, auth: &Element) {
        self.transition(ConnectionState::Authenticating);

        match self.authenticate(auth) {
            Ok(jid) => {
                debug!(jid = %jid, "Authentication successful");
                tracing::Span::current().record("jid", jid.to_string());
                self.connection.send_raw(&sasl_success()).await;
                self.parser.reset();
                self.transition(ConnectionState::StreamNegotiating);
            }
            Err(XmppError::AuthFailed { condition, text }) => {
                debug!(%condition, text = text.as_deref().unwrap_or_default(), "Authentication failed");
                self.connection.send_raw(&sasl_failure(condition)).await;
            }
            Err(e) => {
                warn!(error = %e, "Authentication error");
                self.connection
                    .send_raw(&sasl_failure(SaslFailureCondition::TemporaryAuthFailure))
                    .await;
            }
        }
    }

    fn authenticate(&self, auth: &Element) -> Result<BareJid, XmppError> {
        let mechanism = auth.attr("mechanism").unwrap_or_default();
        if SaslMechanism::from_name(mechanism) != Some(SaslMechanism::Plain) {
            return Err(XmppError::auth_failed(
                SaslFailureCondition::InvalidMechanism,
                Some(format!("Unsupported mechanism {:?}", mechanism)),
            ));
        }

        let credentials = decode_plain(&auth.text())?;

        self.connection.with_session_mut(|session| {
            session.authenticate(&credentials.username)?;
            session
                .bare_jid()
                .cloned()
                .ok_or_else(|| XmppError::internal("Authenticated session without identity"))
        })
    }

    async fn handle_iq(&mut self, iq: &Element) -> Result<(), XmppError> {
        let Some(payload) = iq.children().next() else {
            debug!(id = ?iq.attr("id"), "Ignoring IQ without payload");
            return Ok(());
        };

        let result = if payload.is("bind", ns::BIND) {
            self.handle_bind(iq, payload)
        } else if payload.is("session", ns::SESSION) {
            debug!("Legacy session established");
            Ok(iq_result(iq, None))
        } else {
            debug!(name = %payload.name(), ns = %payload.ns(), "Ignoring IQ");
            return Ok(());
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(XmppError::Stanza {
                condition,
                error_type,
                text,
            }) => generate_iq_error(iq, condition, error_type, text.as_deref()),
            Err(e) => return Err(e),
        };

        self.connection.send_element(&reply).await;
        Ok(())
    }

    fn handle_bind(&mut self, iq: &Element, bind: &Element) -> Result<Element, XmppError> {
        self.transition(ConnectionState::Binding);

        let resource = bind
            .get_child("resource", ns::BIND)
            .map(|r| r.text().trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(generate_resource);

        let full_jid = self.ctx.registry.claim_full_jid(&self.connection, &resource)?;

        self.transition(ConnectionState::SessionEstablished);
        info!(jid = %full_jid, "Session established");

        let payload = Element::builder("bind", ns::BIND)
            .append(Element::builder("jid", ns::BIND).append(full_jid.to_string()))
            .build();
        Ok(iq_result(iq, Some(payload)))
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            trace!(from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }
}

/// Read one chunk. `Ok(None)` means the read timed out.
async fn read_chunk(
    reader: &mut Reader,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> std::io::Result<Option<usize>> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(read) => read.map(Some),
            Err(_) => Ok(None),
        },
        None => reader.read(buf).await.map(Some),
    }
}

fn generate_resource() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("seizure-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const OPEN: &str = "<?xml version='1.0'?><stream:stream to='localhost' version='1.0' \
        xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    fn context(registry: &Arc<ConnectionRegistry>) -> ConnectionContext {
        crate::tls::install_crypto_provider();
        ConnectionContext::new("localhost", crate::tls::test_acceptor(), Arc::clone(registry))
    }

    type ActorTask = tokio::task::JoinHandle<Result<(), XmppError>>;

    fn spawn_actor(ctx: ConnectionContext) -> (Arc<Connection>, DuplexStream, ActorTask) {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let actor = ConnectionActor::new(server, "127.0.0.1:40000".parse().unwrap(), ctx);
        let connection = Arc::clone(actor.connection());
        (connection, client, tokio::spawn(actor.run()))
    }

    /// Read until `needle` shows up in what the server has sent.
    async fn read_until(client: &mut DuplexStream, seen: &mut String, needle: &str) {
        let mut buf = [0u8; 4096];
        tokio::time::timeout(Duration::from_secs(5), async {
            while !seen.contains(needle) {
                let n = client.read(&mut buf).await.unwrap();
                assert!(n > 0, "stream ended before {:?}; got {:?}", needle, seen);
                seen.push_str(std::str::from_utf8(&buf[..n]).unwrap());
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}; got {:?}", needle, seen));
    }

    fn plain_auth(name: &str, password: &str) -> String {
        format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            BASE64_STANDARD.encode(format!("\0{}\0{}", name, password))
        )
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut client, server) = tokio::io::duplex(1024);
        let (connection, _reader) = Connection::new(
            Transport::plain(server),
            "127.0.0.1:40000".parse().unwrap(),
            "localhost",
            Arc::clone(&registry),
        );
        assert!(registry.add(Arc::clone(&connection)));

        tokio::join!(connection.close(), connection.close(), connection.close());
        connection.close().await;

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received.matches(STREAM_CLOSE).count(), 1);
        assert!(connection.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_send_after_close_is_noop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut client, server) = tokio::io::duplex(1024);
        let (connection, _reader) = Connection::new(
            Transport::plain(server),
            "127.0.0.1:40000".parse().unwrap(),
            "localhost",
            registry,
        );

        connection.send_raw("<presence/>").await;
        connection.close().await;
        connection.send_raw("<message/>").await;

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, format!("<presence/>{}", STREAM_CLOSE));
    }

    #[tokio::test]
    async fn test_write_failure_closes_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (client, server) = tokio::io::duplex(64);
        let (connection, _reader) = Connection::new(
            Transport::plain(server),
            "127.0.0.1:40000".parse().unwrap(),
            "localhost",
            Arc::clone(&registry),
        );
        assert!(registry.add(Arc::clone(&connection)));
        drop(client);

        connection.send_raw("<presence/>").await;

        assert!(connection.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sends_arrive_whole_and_in_order() {
        let registry = Arc::new(ConnectionRegistry::new());
        // Smaller than one frame, so every write is split across reads.
        let (mut client, server) = tokio::io::duplex(16);
        let (connection, _reader) = Connection::new(
            Transport::plain(server),
            "127.0.0.1:40000".parse().unwrap(),
            "localhost",
            registry,
        );

        let frames: Vec<String> = (0..32)
            .map(|i| format!("<message id='m{:02}'><body>payload {:02}</body></message>", i, i))
            .collect();

        let drain = tokio::spawn(async move {
            let mut received = String::new();
            client.read_to_string(&mut received).await.unwrap();
            received
        });

        futures::future::join_all(frames.iter().map(|frame| connection.send_raw(frame))).await;
        connection.close().await;

        let received = drain.await.unwrap();
        assert_eq!(received, format!("{}{}", frames.concat(), STREAM_CLOSE));
    }

    #[tokio::test]
    async fn test_failed_tls_handshake_closes_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let ctx = context(&registry).with_tls_handshake_timeout(Duration::from_secs(2));
        let (connection, mut client, task) = spawn_actor(ctx);
        let mut seen = String::new();

        client.write_all(OPEN.as_bytes()).await.unwrap();
        read_until(&mut client, &mut seen, "</stream:features>").await;

        seen.clear();
        client
            .write_all(b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await
            .unwrap();
        read_until(&mut client, &mut seen, "<proceed").await;

        client.write_all(b"this is not a tls client hello\r\n").await.unwrap();
        task.await.unwrap().unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        let rest = String::from_utf8_lossy(&rest);
        assert!(rest.contains("<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'"));
        assert!(rest.ends_with(STREAM_CLOSE));
        assert!(connection.is_closed());
        assert!(!connection.with_session(Session::is_tls_started));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_plaintext_negotiation_to_bind() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, mut client, _task) = spawn_actor(context(&registry));
        let mut seen = String::new();

        client.write_all(OPEN.as_bytes()).await.unwrap();
        read_until(&mut client, &mut seen, "</stream:features>").await;
        assert!(seen.contains("<required/>"));
        assert!(seen.contains("<mechanism>PLAIN</mechanism>"));

        seen.clear();
        client.write_all(plain_auth("alice", "secret").as_bytes()).await.unwrap();
        read_until(&mut client, &mut seen, "<success").await;
        assert_eq!(connection.bare_jid().unwrap().to_string(), "alice@localhost");

        seen.clear();
        client.write_all(OPEN.as_bytes()).await.unwrap();
        read_until(&mut client, &mut seen, "</stream:features>").await;
        assert!(seen.contains("urn:ietf:params:xml:ns:xmpp-bind"));
        assert!(!seen.contains("<mechanisms"));

        seen.clear();
        client
            .write_all(
                b"<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                  <resource>game1</resource></bind></iq>",
            )
            .await
            .unwrap();
        read_until(&mut client, &mut seen, "</iq>").await;
        assert!(seen.contains("alice@localhost/game1"));

        let found = registry
            .find_by_full_jid(&"alice@localhost/game1".parse().unwrap())
            .unwrap();
        assert_eq!(found.id(), connection.id());
    }

    #[tokio::test]
    async fn test_wrong_domain_keeps_stream_open() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, mut client, _task) = spawn_actor(context(&registry));
        let mut seen = String::new();

        client
            .write_all(OPEN.replace("to='localhost'", "to='elsewhere'").as_bytes())
            .await
            .unwrap();
        read_until(&mut client, &mut seen, "</stream:error>").await;
        assert!(seen.contains("<host-unknown"));
        assert!(!seen.contains("<stream:features>"));
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_sasl_failure_keeps_stream_open() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, mut client, _task) = spawn_actor(context(&registry));
        let mut seen = String::new();

        client.write_all(OPEN.as_bytes()).await.unwrap();
        read_until(&mut client, &mut seen, "</stream:features>").await;

        seen.clear();
        client
            .write_all(b"<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='DIGEST-MD5'>AAAA</auth>")
            .await
            .unwrap();
        read_until(&mut client, &mut seen, "</failure>").await;
        assert!(seen.contains("<invalid-mechanism/>"));

        seen.clear();
        client.write_all(plain_auth("alice", "").as_bytes()).await.unwrap();
        read_until(&mut client, &mut seen, "</failure>").await;
        assert!(seen.contains("<not-authorized/>"));

        assert!(!connection.is_closed());
        assert!(connection.bare_jid().is_none());
    }

    #[tokio::test]
    async fn test_peer_disconnect_deregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, mut client, task) = spawn_actor(context(&registry));
        let mut seen = String::new();

        client.write_all(OPEN.as_bytes()).await.unwrap();
        read_until(&mut client, &mut seen, "</stream:features>").await;
        assert_eq!(registry.connection_count(), 1);

        client.write_all(STREAM_CLOSE.as_bytes()).await.unwrap();
        task.await.unwrap().unwrap();

        assert!(connection.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_parse_error_closes_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, mut client, task) = spawn_actor(context(&registry));

        client.write_all(OPEN.as_bytes()).await.unwrap();
        client.write_all(b"<iq><query></iq></query>").await.unwrap();

        assert!(matches!(task.await.unwrap(), Err(XmppError::XmlParse(_))));
        assert!(connection.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_read_timeout_closes_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let ctx = context(&registry).with_read_timeout(Some(Duration::from_millis(50)));
        let (connection, mut client, task) = spawn_actor(ctx);

        task.await.unwrap().unwrap();

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, STREAM_CLOSE);
        assert!(connection.is_closed());
    }

    #[test]
    fn test_generated_resource_shape() {
        let resource = generate_resource();
        assert!(resource.starts_with("seizure-"));
        assert_eq!(resource.len(), "seizure-".len() + 8);
    }
}

//! # seizure-xmpp
//!
//! XMPP client-to-server front door.
//!
//! This crate takes a TCP connection from accept to a bound session
//! following RFC 6120: stream open, STARTTLS, SASL PLAIN, resource binding
//! and legacy session establishment (RFC 3921). Live connections are kept in
//! a [`ConnectionRegistry`] that answers identity lookups and rejects
//! duplicate resource binds.
//!
//! ## Architecture
//!
//! - **Server**: TCP listener on port 5222 (C2S), one task per connection
//! - **Connection Actors**: own the read half and the incremental parser and
//!   drive negotiation; writes go through a shared, serialized [`Connection`]
//! - **Registry**: the set of live connections, the only state shared
//!   between connections
//!
//! Routing, presence, rosters and federation are out of scope.

pub mod auth;
pub mod connection;
pub mod parser;
pub mod registry;
pub mod server;
pub mod session;
pub mod stanza;
pub mod stream;
pub mod tls;
pub mod transport;

mod error;
mod types;

pub use connection::{Connection, ConnectionActor, ConnectionContext};
pub use error::{
    generate_iq_error, generate_stream_error, SaslFailureCondition, StanzaErrorCondition,
    StanzaErrorType, StreamErrorCondition, XmppError,
};
pub use parser::{ns, StreamEvent, StreamHeader, XmlParser};
pub use registry::ConnectionRegistry;
pub use server::{XmppServer, XmppServerConfig};
pub use session::Session;
pub use types::*;

//! SASL authentication mechanisms.
//!
//! Only PLAIN (RFC 4616) is offered. Credentials are not verified against a
//! store: any non-empty name/password pair authenticates.

pub mod plain;

pub use plain::{decode_plain, PlainCredentials};

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    /// PLAIN mechanism (RFC 4616)
    Plain,
}

impl SaslMechanism {
    /// Mechanisms advertised to unauthenticated streams.
    pub const OFFERED: &'static [SaslMechanism] = &[SaslMechanism::Plain];

    /// Parse a mechanism name into a SaslMechanism.
    ///
    /// Mechanism names are case-sensitive (RFC 4422 Section 3.1).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "PLAIN" => Some(SaslMechanism::Plain),
            _ => None,
        }
    }

    /// The wire name of the mechanism.
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
        }
    }
}

impl std::fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

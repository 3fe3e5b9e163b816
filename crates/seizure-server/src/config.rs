//! Server configuration from command-line flags and environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use seizure_xmpp::XmppServerConfig;
use tracing::info;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable multi-line output
    Pretty,
    /// One JSON object per line
    Json,
}

/// Seizure - XMPP client-to-server front door
#[derive(Debug, Parser)]
#[command(name = "seizure-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address to accept C2S connections on
    #[arg(long, env = "SEIZURE_BIND", default_value = "0.0.0.0:5222")]
    pub bind: SocketAddr,

    /// Service domain clients must address in their stream header
    #[arg(short, long, env = "SEIZURE_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// TLS certificate chain (PEM)
    #[arg(long, env = "SEIZURE_TLS_CERT")]
    pub tls_cert: PathBuf,

    /// TLS private key (PEM)
    #[arg(long, env = "SEIZURE_TLS_KEY")]
    pub tls_key: PathBuf,

    /// STARTTLS handshake limit in seconds
    #[arg(long, env = "SEIZURE_TLS_HANDSHAKE_TIMEOUT", default_value_t = 10)]
    pub tls_handshake_timeout: u64,

    /// Close connections idle for this many seconds (disabled when unset)
    #[arg(long, env = "SEIZURE_READ_TIMEOUT")]
    pub read_timeout: Option<u64>,

    /// Log output format
    #[arg(long, env = "SEIZURE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// The library-level configuration for these settings.
    pub fn xmpp_config(&self) -> XmppServerConfig {
        XmppServerConfig {
            c2s_addr: self.bind,
            domain: self.domain.clone(),
            tls_handshake_timeout: Duration::from_secs(self.tls_handshake_timeout),
            read_timeout: self.read_timeout.map(Duration::from_secs),
        }
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        info!("Domain: {}", self.domain);
        info!("C2S address: {}", self.bind);
        info!("TLS certificate: {}", self.tls_cert.display());
        info!("TLS handshake timeout: {}s", self.tls_handshake_timeout);
        match self.read_timeout {
            Some(secs) => info!("Idle read timeout: {}s", secs),
            None => info!("Idle read timeout: disabled"),
        }
    }
}

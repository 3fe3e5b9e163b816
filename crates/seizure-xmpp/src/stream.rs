//! Stream-level wire elements: headers, features and negotiation replies.
//!
//! These are written as raw text because they either live outside any
//! complete element (the stream header) or use the `stream:` prefix the
//! stream header declared.

use crate::auth::SaslMechanism;
use crate::error::SaslFailureCondition;
use crate::parser::{escape, ns};

/// Closing tag of the outbound stream.
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Build the server's stream header.
pub fn stream_header(stream_id: &str, domain: &str) -> String {
    format!(
        "<?xml version='1.0'?>\
        <stream:stream xmlns='{}' \
        xmlns:stream='{}' \
        id='{}' from='{}' version='1.0'>",
        ns::JABBER_CLIENT,
        ns::STREAM,
        escape(stream_id),
        escape(domain)
    )
}

/// Stream features offered after a stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFeatures {
    /// Mandatory STARTTLS
    pub starttls: bool,
    /// SASL mechanisms on offer
    pub mechanisms: Vec<SaslMechanism>,
    /// Resource binding
    pub bind: bool,
    /// Legacy session establishment
    pub session: bool,
}

impl StreamFeatures {
    /// Features for a stream in the given negotiation state.
    pub fn for_session(authenticated: bool, tls_started: bool) -> Self {
        if authenticated {
            Self {
                starttls: false,
                mechanisms: Vec::new(),
                bind: true,
                session: true,
            }
        } else {
            Self {
                starttls: !tls_started,
                mechanisms: SaslMechanism::OFFERED.to_vec(),
                bind: false,
                session: false,
            }
        }
    }

    /// Serialize as a `<stream:features/>` element.
    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<stream:features>");

        if self.starttls {
            xml.push_str(&format!("<starttls xmlns='{}'><required/></starttls>", ns::TLS));
        }

        if !self.mechanisms.is_empty() {
            xml.push_str(&format!("<mechanisms xmlns='{}'>", ns::SASL));
            for mechanism in &self.mechanisms {
                xml.push_str(&format!("<mechanism>{}</mechanism>", mechanism));
            }
            xml.push_str("</mechanisms>");
        }

        if self.bind {
            xml.push_str(&format!("<bind xmlns='{}'/>", ns::BIND));
        }

        if self.session {
            xml.push_str(&format!("<session xmlns='{}'/>", ns::SESSION));
        }

        xml.push_str("</stream:features>");
        xml
    }
}

/// `<proceed/>` reply to STARTTLS.
pub fn tls_proceed() -> String {
    format!("<proceed xmlns='{}'/>", ns::TLS)
}

/// `<failure/>` reply to STARTTLS.
pub fn tls_failure() -> String {
    format!("<failure xmlns='{}'/>", ns::TLS)
}

/// `<success/>` reply to SASL auth.
pub fn sasl_success() -> String {
    format!("<success xmlns='{}'/>", ns::SASL)
}

/// `<failure/>` reply to SASL auth.
pub fn sasl_failure(condition: SaslFailureCondition) -> String {
    format!("<failure xmlns='{}'><{}/></failure>", ns::SASL, condition.as_str())
}

//! SASL PLAIN payload decoding.

use base64::prelude::*;

use crate::error::SaslFailureCondition;
use crate::XmppError;

/// Credentials carried by a SASL PLAIN payload.
#[derive(Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    /// Authorization identity, when the client sent a non-empty one
    pub authzid: Option<String>,
    /// Authentication identity (the account name)
    pub username: String,
    /// Password
    pub password: String,
}

impl std::fmt::Debug for PlainCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainCredentials")
            .field("authzid", &self.authzid)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Decode the base64 text of a PLAIN `<auth/>` element.
///
/// The payload is either `authzid NUL name NUL password` or
/// `name NUL password`. The authorization identity is accepted but unused.
pub fn decode_plain(payload: &str) -> Result<PlainCredentials, XmppError> {
    let payload = payload.trim();
    let data = if payload == "=" {
        Vec::new()
    } else {
        BASE64_STANDARD.decode(payload).map_err(|e| {
            XmppError::auth_failed(
                SaslFailureCondition::IncorrectEncoding,
                Some(format!("Invalid base64: {}", e)),
            )
        })?
    };

    let parts: Vec<&[u8]> = data.split(|&b| b == 0).collect();
    let (authzid, username, password) = match parts.as_slice() {
        [authzid, username, password] => (Some(*authzid), *username, *password),
        [username, password] => (None, *username, *password),
        _ => {
            return Err(XmppError::auth_failed(
                SaslFailureCondition::IncorrectEncoding,
                Some(format!("Expected 2 or 3 fields, got {}", parts.len())),
            ))
        }
    };

    let username = utf8_field(username)?;
    let password = utf8_field(password)?;
    let authzid = authzid.map(utf8_field).transpose()?.filter(|a| !a.is_empty());

    if username.is_empty() || password.is_empty() {
        return Err(XmppError::auth_failed(
            SaslFailureCondition::NotAuthorized,
            Some("Empty username or password".to_string()),
        ));
    }

    Ok(PlainCredentials {
        authzid,
        username,
        password,
    })
}

fn utf8_field(field: &[u8]) -> Result<String, XmppError> {
    String::from_utf8(field.to_vec()).map_err(|_| {
        XmppError::auth_failed(
            SaslFailureCondition::IncorrectEncoding,
            Some("Field is not valid UTF-8".to_string()),
        )
    })
}

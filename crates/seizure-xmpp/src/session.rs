//! Per-connection authentication and binding state.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::{BareJid, FullJid};

use crate::error::SaslFailureCondition;
use crate::XmppError;

/// Extension payload stored in a session.
pub type SessionVariable = Arc<dyn Any + Send + Sync>;

/// Authentication and binding state of one connection.
///
/// `authenticate` and `bind` only ever take effect once; later calls leave
/// the recorded identity untouched.
pub struct Session {
    id: String,
    domain: String,
    created_at: DateTime<Utc>,
    authenticated: bool,
    tls_started: bool,
    bound: bool,
    bare_jid: Option<BareJid>,
    full_jid: Option<FullJid>,
    variables: DashMap<String, SessionVariable>,
}

impl Session {
    /// Create a fresh session for the service `domain`.
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            created_at: Utc::now(),
            authenticated: false,
            tls_started: false,
            bound: false,
            bare_jid: None,
            full_jid: None,
            variables: DashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_tls_started(&self) -> bool {
        self.tls_started
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// The bare identity, once authenticated.
    pub fn bare_jid(&self) -> Option<&BareJid> {
        self.bare_jid.as_ref()
    }

    /// The full identity, once bound.
    pub fn full_jid(&self) -> Option<&FullJid> {
        self.full_jid.as_ref()
    }

    /// Build the bare identity `name@domain`.
    pub fn identity_for(name: &str, domain: &str) -> Result<BareJid, XmppError> {
        if name.contains(['@', '/']) {
            return Err(XmppError::auth_failed(
                SaslFailureCondition::MalformedRequest,
                Some(format!("Name {:?} is not a valid localpart", name)),
            ));
        }
        format!("{}@{}", name, domain).parse().map_err(|e| {
            XmppError::auth_failed(
                SaslFailureCondition::MalformedRequest,
                Some(format!("Invalid identity for {:?}: {}", name, e)),
            )
        })
    }

    /// Mark the session authenticated as `name`.
    ///
    /// Returns `Ok(false)` without touching the identity when the session is
    /// already authenticated.
    pub fn authenticate(&mut self, name: &str) -> Result<bool, XmppError> {
        if self.authenticated {
            return Ok(false);
        }
        self.bare_jid = Some(Self::identity_for(name, &self.domain)?);
        self.authenticated = true;
        Ok(true)
    }

    /// Record that the transport is now encrypted.
    pub fn mark_tls_started(&mut self) -> bool {
        !std::mem::replace(&mut self.tls_started, true)
    }

    /// Full identity this session would hold with `resource`.
    pub fn candidate_jid(&self, resource: &str) -> Result<FullJid, XmppError> {
        let bare = self
            .bare_jid
            .as_ref()
            .ok_or_else(|| XmppError::not_authorized(Some("Not authenticated".to_string())))?;
        bare.with_resource_str(resource)
            .map_err(|e| XmppError::bad_request(Some(format!("Invalid resource: {}", e))))
    }

    /// Bind the session to `resource`.
    ///
    /// An already bound session keeps its identity and returns it.
    pub fn bind(&mut self, resource: &str) -> Result<&FullJid, XmppError> {
        if !self.bound {
            let full = self.candidate_jid(resource)?;
            self.full_jid = Some(full);
            self.bound = true;
        }
        self.full_jid
            .as_ref()
            .ok_or_else(|| XmppError::internal("Bound session without identity"))
    }

    /// Fetch an extension value, if present and of type `T`.
    pub fn get_variable<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.variables.get(key).map(|v| Arc::clone(v.value()))?;
        value.downcast::<T>().ok()
    }

    /// Store an extension value, replacing any previous one.
    pub fn set_variable<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.variables.insert(key.into(), Arc::new(value));
    }

    /// Remove an extension value.
    pub fn remove_variable(&self, key: &str) -> Option<SessionVariable> {
        self.variables.remove(key).map(|(_, v)| v)
    }

    /// Drop identity and extension state when the connection ends.
    pub fn dispose(&mut self) {
        self.variables.clear();
        self.bare_jid = None;
        self.full_jid = None;
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Session {}

impl std::hash::Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("authenticated", &self.authenticated)
            .field("tls_started", &self.tls_started)
            .field("bound", &self.bound)
            .field("bare_jid", &self.bare_jid)
            .field("full_jid", &self.full_jid)
            .field("variables", &self.variables.len())
            .finish()
    }
}

//! Connection Registry implementation.
//!
//! Tracks live connections and answers identity queries against them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jid::{BareJid, FullJid};
use tracing::{debug, info, instrument};

use crate::connection::Connection;
use crate::XmppError;

/// Registry of live XMPP connections.
///
/// Connections are keyed by connection id; identities live in each
/// connection's session and are matched on lookup.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    /// Set under the write lock once the server stops; `add` refuses after.
    stopped: AtomicBool,
}

impl ConnectionRegistry {
    /// Create a new connection registry.
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            connections: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a newly opened connection.
    ///
    /// Returns `false` if the connection was already closed or the registry
    /// has been stopped, in which case it is not added.
    #[instrument(skip(self, connection), fields(conn_id = %connection.id()))]
    pub fn add(&self, connection: Arc<Connection>) -> bool {
        let mut connections = self.write();
        // Checked under the lock: close() sets the flag before it removes.
        if connection.is_closed() {
            debug!("Connection closed before registration");
            return false;
        }
        if self.stopped.load(Ordering::Acquire) {
            debug!("Registry stopped, refusing connection");
            return false;
        }
        connections.insert(connection.id().to_string(), connection);
        debug!(connection_count = connections.len(), "Registered connection");
        true
    }

    /// Remove a connection.
    ///
    /// Returns the connection if it was registered, None otherwise.
    #[instrument(skip(self))]
    pub fn remove(&self, conn_id: &str) -> Option<Arc<Connection>> {
        let removed = self.write().remove(conn_id);
        if removed.is_some() {
            debug!("Unregistered connection");
        } else {
            debug!("Connection was not registered");
        }
        removed
    }

    /// Refuse further registrations and return the connections still live.
    ///
    /// Every connection registered before this call is in the returned set;
    /// none can be registered after it.
    pub fn stop(&self) -> Vec<Arc<Connection>> {
        let connections = self.write();
        self.stopped.store(true, Ordering::Release);
        info!(connection_count = connections.len(), "Registry stopped");
        connections.values().cloned().collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Snapshot of every live connection.
    pub fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.read().values().cloned().collect()
    }

    /// The live connection bound to exactly `jid`, if any.
    pub fn find_by_full_jid(&self, jid: &FullJid) -> Option<Arc<Connection>> {
        self.all_connections()
            .into_iter()
            .find(|conn| conn.full_jid().as_ref() == Some(jid))
    }

    /// All live connections authenticated as `jid`, whatever their resource.
    pub fn find_by_bare_jid(&self, jid: &BareJid) -> Vec<Arc<Connection>> {
        self.all_connections()
            .into_iter()
            .filter(|conn| conn.bare_jid().as_ref() == Some(jid))
            .collect()
    }

    /// Bind `connection` to `resource` unless another live connection
    /// already holds the resulting full JID.
    ///
    /// The conflict check and the bind happen under the registry's write
    /// lock, so two connections racing for the same resource cannot both
    /// win. A connection that is already bound gets its existing identity
    /// back.
    #[instrument(skip(self, connection), fields(conn_id = %connection.id()))]
    pub fn claim_full_jid(
        &self,
        connection: &Arc<Connection>,
        resource: &str,
    ) -> Result<FullJid, XmppError> {
        let connections = self.write();

        if let Some(bound) = connection.full_jid() {
            debug!(jid = %bound, "Connection already bound");
            return Ok(bound);
        }

        let candidate = connection.with_session(|session| session.candidate_jid(resource))?;

        if let Some(holder) = connections
            .values()
            .filter(|conn| conn.id() != connection.id())
            .find(|conn| conn.full_jid().as_ref() == Some(&candidate))
        {
            debug!(jid = %candidate, holder = %holder.id(), "Resource already bound");
            return Err(XmppError::conflict(Some(format!(
                "{} is already bound",
                candidate
            ))));
        }

        connection.with_session_mut(|session| session.bind(resource).cloned())
    }

    /// Get the number of live connections.
    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connection_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

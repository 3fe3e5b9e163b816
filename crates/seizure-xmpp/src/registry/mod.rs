//! Connection Registry for identity lookup and bind-conflict detection.
//!
//! Every connection adds itself when it opens and removes itself when it
//! closes. The registry is the only component that sees all connections.
//!
//! ```text
//! ConnectionActor (alice@domain/mobile) --add/remove--> ConnectionRegistry <--lookup-- ConnectionActor (alice@domain/desktop)
//!                                                              |
//!                                                              v
//!                                             RwLock<HashMap<conn id, Arc<Connection>>>
//! ```
//!
//! Lookups copy the live set under the lock and filter the copy, so they
//! never observe a half-applied add/remove and never hold the lock while
//! inspecting sessions.

mod connection_registry;

pub use connection_registry::ConnectionRegistry;

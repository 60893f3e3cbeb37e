//! wagate-core - Core library for the wagate chat gateway
//!
//! This crate provides the session-management core shared by the gateway
//! process:
//!
//! - **store**: SQLite-backed session store, keyed by (session id, item id)
//! - **auth**: credential store adapter and key-material accessors
//! - **session**: in-memory registry and the connection lifecycle controller
//! - **messaging**: recipient normalization, verification, and sends
//! - **socket**: the messaging-backend collaborator boundary

pub mod auth;
pub mod config;
pub mod error;
pub mod messaging;
pub mod session;
pub mod socket;
pub mod store;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use messaging::Messenger;
pub use session::{SessionManager, SessionRegistry, SessionStatus};
pub use store::SessionStore;

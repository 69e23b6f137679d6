//! Policy storage for the Gosub engine.
//!
//! This module defines the [`PolicyStore`], the keyed table of per-site
//! [`CookiePolicyItem`](crate::policy::CookiePolicyItem)s, and the backends it writes
//! through to.
//!
//! # Choosing a backend
//!
//! - [`InMemoryPolicyBackend`] keeps nothing on disk (private sessions, tests).
//! - [`JsonPolicyBackend`] keeps everything in one JSON file.
//! - [`SqlitePolicyBackend`] keeps one row per site in SQLite (feature
//!   `sqlite_policy_store`, enabled by default).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gosub_cookie_policy::storage::{JsonPolicyBackend, PolicyStore};
//!
//! let backend = JsonPolicyBackend::new("policies.json".into()).unwrap();
//! let store = PolicyStore::open(Arc::new(backend)).unwrap();
//! println!("{} stored policies", store.len());
//! ```

/// Backend trait for durable policy storage.
mod backend;
/// In-memory backend.
mod in_memory;
/// JSON file backend.
mod json;
/// SQLite backend.
#[cfg(feature = "sqlite_policy_store")]
mod sqlite;
/// The policy store itself.
mod store;

pub use backend::{PolicyBackend, PolicyBackendHandle};
pub use in_memory::InMemoryPolicyBackend;
pub use json::JsonPolicyBackend;
#[cfg(feature = "sqlite_policy_store")]
pub use sqlite::SqlitePolicyBackend;
pub use store::{resolve_accessor, LogAction, PolicyStore};

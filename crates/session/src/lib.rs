//! Session storage for opsloop.
//!
//! Backends:
//! - **File**: one JSON document per session, atomic temp-file + rename writes
//! - **In-memory**: for tests and ephemeral runs
//!
//! [`expire_idle`] implements the inactivity TTL sweep.

pub mod file_store;
pub mod in_memory;
pub mod sweep;

pub use file_store::FileSessionStore;
pub use in_memory::InMemorySessionStore;
pub use sweep::expire_idle;

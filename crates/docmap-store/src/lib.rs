//! In-memory document store for the docmap document mapper.
//!
//! [`MemoryStore`] implements [`CommandExecutor`](docmap_types::CommandExecutor)
//! over JSON documents grouped by collection. It understands the update
//! operators the persister emits and matches filters the way the persister
//! builds them, which makes it the reference executor for tests and local
//! tooling.
//!
//! # Architecture
//!
//! ```text
//! UpdateCommand
//!     |
//!     +-- filter::matches()     --> first matching document
//!     +-- operators::apply()    --> applied to a copy, committed on success
//!     |
//!     +-- no match + upsert     --> seeded from filter equalities
//! ```
//!
//! # Modules
//!
//! - [`memory`] -- The store and its compatibility switches
//! - [`operators`] -- Update operator semantics
//! - [`filter`] -- Filter matching
//! - [`path`] -- Dotted path navigation
//! - [`error`] -- Shared error types

pub mod error;
pub mod filter;
pub mod memory;
pub mod operators;
pub mod path;

// Re-export primary types for convenience.
pub use error::StoreError;
pub use memory::{MemoryStore, StoreCompat};

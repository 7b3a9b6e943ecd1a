//! Change-set to atomic update compiler for the docmap document mapper.
//!
//! Given the recorded changes of a managed document, this crate produces the
//! minimal set of partial update operators that brings the stored document
//! in line with memory, guards the write against concurrent modification,
//! and synchronizes collection-valued associations in separate commands.
//!
//! # Architecture
//!
//! ```text
//! DocumentPersister ──▶ PersistenceBuilder ──▶ AtomicUpdateCompiler
//!        │                     │                   │
//!        │                     │                   ├── AssociationResolver ──▶ coercer
//!        │                     │                   └── discriminator
//!        │                     └── OptimisticConcurrencyGuard
//!        ├── CollectionPersister ──▶ CollectionStrategyResolver
//!        │
//!        ▼
//! CommandExecutor (filter, update)
//! ```
//!
//! # Modules
//!
//! - [`builder`] -- Insert, update, and upsert payloads of one document
//! - [`update_compiler`] -- Change-set walk producing update operators
//! - [`association`] -- Storable forms of embedded and referenced values
//! - [`coercer`] -- Scalar conversion to storage types
//! - [`discriminator`] -- Class discriminators of polymorphic documents
//! - [`collection_strategy`] -- Operators synchronizing one collection
//! - [`collection_persister`] -- Collection path resolution and commands
//! - [`concurrency`] -- Version and lock guards
//! - [`document_persister`] -- Command execution and flush
//! - [`metadata`] -- Mapping metadata provider and YAML registry
//! - [`unit_of_work`] -- Managed documents and their change sets
//! - [`context`] -- Collaborators shared by compilation steps
//! - [`config`] -- Compiler settings
//! - [`error`] -- Error types

pub mod association;
pub mod builder;
pub mod coercer;
pub mod collection_persister;
pub mod collection_strategy;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod discriminator;
pub mod document_persister;
pub mod error;
pub mod metadata;
pub mod unit_of_work;
pub mod update_compiler;

#[cfg(test)]
pub(crate) mod test_support;

pub use association::AssociationResolver;
pub use builder::{CompiledInsert, CompiledWrite, PersistenceBuilder};
pub use collection_persister::{CollectionPath, CollectionPersister, CollectionWrite};
pub use collection_strategy::CollectionStrategyResolver;
pub use concurrency::{GuardState, OptimisticConcurrencyGuard};
pub use config::{ConfigError, EachWrapping, PersisterConfig};
pub use context::PersistContext;
pub use document_persister::{Clock, DocumentPersister, FlushReport, UpdateOutcome};
pub use error::PersistError;
pub use metadata::{MetadataProvider, MetadataRegistry};
pub use unit_of_work::{ChangeSetProvider, ManagedDocument, ParentAssociation, UnitOfWork};
pub use update_compiler::AtomicUpdateCompiler;

//! Shared data model for the docmap document mapper.
//!
//! This crate holds every type that crosses a boundary between the mapper
//! core, its collaborators, and the store: mapping metadata, in-memory field
//! values, change sets, compiled updates, and the executor trait.
//!
//! # Modules
//!
//! - [`ids`] -- Surrogate document keys and identifier generation
//! - [`value`] -- In-memory field values and scalar types
//! - [`mapping`] -- Field and class mapping metadata
//! - [`change`] -- Change sets, collection diffs, concurrency tokens
//! - [`update`] -- Compiled updates, filters, and commands
//! - [`executor`] -- The command executor trait and its errors

pub mod change;
pub mod executor;
pub mod ids;
pub mod mapping;
pub mod update;
pub mod value;

// Re-export all public types at crate root for convenience.
pub use change::{ChangeSet, CollectionDiff, CollectionSchedule, ConcurrencyToken, FieldChange};
pub use executor::{CommandExecutor, ExecutorError};
pub use ids::{DocumentKey, generate_identifier};
pub use mapping::{
    AssociationKind, ClassMetadata, CollectionStrategy, FieldKind, FieldMapping, MappingError,
    ReferenceMapping, ReferenceStorage, TargetMapping, VersionScheme,
};
pub use update::{
    CommandResult, CompiledUpdate, Filter, InsertCommand, UpdateCommand, UpdateOperator,
};
pub use value::{CollectionEntry, ElementKey, ScalarType, Value};

//! Error types for the persister.
//!
//! Compilation errors carry the dotted path of the field that failed so a
//! failure deep inside an embedded document can be traced back to its
//! origin. A command is either compiled completely or not at all; nothing
//! is sent to the executor after a compilation error.

use docmap_types::{DocumentKey, ExecutorError, MappingError, ScalarType};

/// Errors that can occur while compiling or executing writes.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// A value cannot be converted to the declared storage type.
    #[error("cannot convert {found} value to {expected} at {path}")]
    TypeConversion {
        /// Dotted path of the field.
        path: String,
        /// Declared storage type.
        expected: ScalarType,
        /// Kind of the offending value.
        found: &'static str,
    },

    /// A reference form that needs a known target type has none.
    #[error("reference at {path} to {class} uses {storage} storage but has no target document")]
    AmbiguousReference {
        /// Dotted path of the field.
        path: String,
        /// Class of the referenced document.
        class: String,
        /// Storage form name.
        storage: &'static str,
    },

    /// The field's association kind cannot be handled here.
    #[error("unsupported association kind {kind} at {path}")]
    UnsupportedAssociationKind {
        /// Dotted path of the field.
        path: String,
        /// Association kind name.
        kind: String,
    },

    /// The field's collection strategy cannot be handled here.
    #[error("unsupported collection strategy {strategy} at {path}")]
    UnsupportedCollectionStrategy {
        /// Dotted path of the field.
        path: String,
        /// Strategy name.
        strategy: String,
    },

    /// A guarded write matched no document.
    #[error("optimistic lock conflict on {class} {id}")]
    OptimisticLockConflict {
        /// Class of the document.
        class: String,
        /// Identifier of the document, rendered as JSON.
        id: String,
    },

    /// The store rejected every form of an identifier-only upsert.
    #[error("store rejected the identifier-only upsert of {class} {id}")]
    IllegalEmptyUpdate {
        /// Class of the document.
        class: String,
        /// Identifier of the document, rendered as JSON.
        id: String,
        /// Rejection reported by the last attempt.
        #[source]
        source: ExecutorError,
    },

    /// A referenced or updated document has no identifier yet.
    #[error("{class} at {path} has no identifier; persist it first")]
    MissingIdentifier {
        /// Class of the document.
        class: String,
        /// Dotted path of the field.
        path: String,
    },

    /// A class is absent from the discriminator map with no fallback.
    #[error("class {class} is not listed in the discriminator map at {path}")]
    UnlistedDiscriminator {
        /// Class of the document.
        class: String,
        /// Dotted path of the field.
        path: String,
    },

    /// No metadata is registered for the class.
    #[error("no metadata for class {0}")]
    UnknownClass(String),

    /// A change set names a field the class does not map.
    #[error("class {class} has no field {field}")]
    UnknownField {
        /// Class of the document.
        class: String,
        /// The unmapped field.
        field: String,
    },

    /// The document key is not managed by the unit of work.
    #[error("document {0} is not managed by this unit of work")]
    UnmanagedDocument(DocumentKey),

    /// Embedded documents are written through their owner only.
    #[error("{class} is an embedded class and cannot be written on its own")]
    EmbeddedRoot {
        /// Class of the document.
        class: String,
    },

    /// Mapping metadata is invalid.
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// The executor failed.
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

impl PersistError {
    /// Whether the caller may retry after reloading the document.
    ///
    /// Only concurrency conflicts qualify; every other error is a defect in
    /// the data or the mapping and would fail again.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OptimisticLockConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_error_names_the_path() {
        let err = PersistError::TypeConversion {
            path: String::from("address.zip"),
            expected: ScalarType::Int,
            found: "string",
        };
        let msg = format!("{err}");
        assert!(msg.contains("address.zip"));
        assert!(msg.contains("int"));
    }

    #[test]
    fn only_lock_conflicts_are_retryable() {
        let conflict = PersistError::OptimisticLockConflict {
            class: String::from("User"),
            id: String::from("\"abc\""),
        };
        assert!(conflict.is_retryable());
        assert!(!PersistError::UnknownClass(String::from("User")).is_retryable());
    }

    #[test]
    fn executor_error_converts() {
        let err = PersistError::from(ExecutorError::EmptyUpdate);
        assert!(format!("{err}").contains("at least one operator"));
    }
}

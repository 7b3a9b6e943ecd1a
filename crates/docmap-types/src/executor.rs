//! The command executor boundary.
//!
//! The persister never talks to a transport. It hands compiled commands to
//! a [`CommandExecutor`] and interprets the [`CommandResult`] it gets back.

use crate::update::{CommandResult, InsertCommand, UpdateCommand};

/// Errors reported by a command executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// The update document carried no operators at all.
    #[error("update document must contain at least one operator")]
    EmptyUpdate,

    /// The update tried to modify the identifier field.
    #[error("modifying the identifier field {field} is not allowed")]
    IdentifierModification {
        /// The identifier field name.
        field: String,
    },

    /// An insert collided with an existing identifier.
    #[error("duplicate key in collection {collection}: {id}")]
    DuplicateKey {
        /// Target collection.
        collection: String,
        /// The colliding identifier, rendered as JSON.
        id: String,
    },

    /// The command is not well formed for the executor.
    #[error("malformed command: {0}")]
    Malformed(String),

    /// The backend failed for a reason unrelated to the command.
    #[error("executor backend error: {0}")]
    Backend(String),
}

/// Executes write commands against a document store.
pub trait CommandExecutor {
    /// Insert one document.
    fn insert(&mut self, command: &InsertCommand) -> Result<CommandResult, ExecutorError>;

    /// Apply one update to the first matching document.
    fn update(&mut self, command: &UpdateCommand) -> Result<CommandResult, ExecutorError>;
}

impl<E: CommandExecutor + ?Sized> CommandExecutor for &mut E {
    fn insert(&mut self, command: &InsertCommand) -> Result<CommandResult, ExecutorError> {
        (**self).insert(command)
    }

    fn update(&mut self, command: &UpdateCommand) -> Result<CommandResult, ExecutorError> {
        (**self).update(command)
    }
}

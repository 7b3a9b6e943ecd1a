//! Error types for the in-memory store.
//!
//! Operator failures are reported as [`StoreError`] and surface to the
//! persister as [`ExecutorError::Malformed`], except for configuration
//! problems which never reach the executor boundary.

use docmap_types::ExecutorError;

/// Errors that can occur while applying a command.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An array operator targeted a value that is not an array.
    #[error("{operator} on {path}: field is not an array")]
    NotAnArray {
        /// Operator name.
        operator: &'static str,
        /// Dotted path.
        path: String,
    },

    /// `$inc` targeted or carried a value that is not a number.
    #[error("$inc on {path}: non-numeric value")]
    NotANumber {
        /// Dotted path.
        path: String,
    },

    /// `$inc` overflowed the integer range.
    #[error("$inc on {path}: integer overflow")]
    Overflow {
        /// Dotted path.
        path: String,
    },

    /// A path runs through a scalar or uses a non-numeric array index.
    #[error("cannot traverse {segment} in {path}")]
    PathConflict {
        /// Dotted path.
        path: String,
        /// Segment that could not be traversed.
        segment: String,
    },

    /// `$pushAll` carried something other than an array.
    #[error("$pushAll on {path}: operand must be an array")]
    InvalidOperand {
        /// Dotted path.
        path: String,
    },

    /// Store compatibility settings could not be parsed.
    #[error("invalid store configuration: {0}")]
    Config(#[from] serde_yml::Error),

    /// Store compatibility settings could not be read.
    #[error("cannot read store configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for ExecutorError {
    fn from(err: StoreError) -> Self {
        Self::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_errors_become_malformed_commands() {
        let err = StoreError::NotAnArray {
            operator: "$push",
            path: "tags".to_owned(),
        };
        assert_eq!(
            ExecutorError::from(err),
            ExecutorError::Malformed("$push on tags: field is not an array".to_owned())
        );
    }
}

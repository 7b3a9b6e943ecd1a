//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Managed documents are addressed by a stable surrogate key instead of by
//! object identity. Keys use UUID v7 (time-ordered).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Surrogate key of a document managed by a unit of work.
    ///
    /// Embedded documents get their own key too; their position inside the
    /// owning document is recorded separately as a parent association.
    DocumentKey
}

/// Generate a fresh document identifier for an insert that has none.
///
/// Identifiers are rendered as the hyphenated UUID v7 string.
pub fn generate_identifier() -> String {
    Uuid::now_v7().to_string()
}

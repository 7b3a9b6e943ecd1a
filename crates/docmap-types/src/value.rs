//! In-memory field values and the scalar type vocabulary.
//!
//! A [`Value`] is what a mapped object holds in one of its fields before it
//! is converted into its storable form. Associations never hold the child
//! object inline: one-valued associations point at another managed document
//! through its [`DocumentKey`], many-valued associations hold an ordered
//! list of keyed [`CollectionEntry`] values.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::DocumentKey;
use crate::mapping::MappingError;

// ---------------------------------------------------------------------------
// Scalar types
// ---------------------------------------------------------------------------

/// Storage type of a scalar field, driving value conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    /// Boolean.
    Bool,
    /// Signed 64-bit integer.
    Int,
    /// Double precision float.
    Float,
    /// Arbitrary precision decimal, stored as `$numberDecimal`.
    Decimal,
    /// UTF-8 string.
    String,
    /// Point in time, stored as the store's native date.
    Timestamp,
    /// Calendar date, stored as a native date at midnight UTC.
    Date,
    /// Document identifier, stored as-is.
    Id,
    /// Free-form key/value object.
    Hash,
    /// List of raw values.
    Collection,
    /// Any value, stored without conversion.
    Raw,
}

impl ScalarType {
    /// Return the lowercase type name used in mapping files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::String => "string",
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Id => "id",
            Self::Hash => "hash",
            Self::Collection => "collection",
            Self::Raw => "raw",
        }
    }

    /// Whether the type can back an increment field.
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float | Self::Decimal)
    }
}

impl core::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ScalarType {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(Self::Bool),
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "decimal" => Ok(Self::Decimal),
            "string" => Ok(Self::String),
            "timestamp" => Ok(Self::Timestamp),
            "date" => Ok(Self::Date),
            "id" => Ok(Self::Id),
            "hash" => Ok(Self::Hash),
            "collection" => Ok(Self::Collection),
            "raw" => Ok(Self::Raw),
            other => Err(MappingError::UnsupportedScalarType(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Collection elements
// ---------------------------------------------------------------------------

/// Stable position or key of an element inside a collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ElementKey {
    /// Zero-based list position.
    Index(usize),
    /// Hash key of a keyed collection.
    Name(String),
}

impl core::fmt::Display for ElementKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<usize> for ElementKey {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for ElementKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

/// One keyed element of a many-valued association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    /// Position or key of the element.
    pub key: ElementKey,
    /// The element, normally a [`Value::Document`].
    pub value: Value,
}

impl CollectionEntry {
    /// Build an entry from a key and value.
    pub fn new(key: impl Into<ElementKey>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A field value held by a managed document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Absent / null.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Decimal.
    Decimal(Decimal),
    /// String.
    String(String),
    /// Point in time.
    Timestamp(DateTime<Utc>),
    /// Calendar date.
    Date(NaiveDate),
    /// Free-form JSON (hashes, raw payloads).
    Json(serde_json::Value),
    /// List of scalar values.
    List(Vec<Self>),
    /// One-valued association to another managed document.
    Document(DocumentKey),
    /// Many-valued association, ordered by insertion.
    Collection(Vec<CollectionEntry>),
}

impl Value {
    /// Whether this is [`Value::Null`].
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Return the referenced document key, if this is a one-valued association.
    pub const fn as_document(&self) -> Option<DocumentKey> {
        match self {
            Self::Document(key) => Some(*key),
            _ => None,
        }
    }

    /// Return the collection entries, if this is a many-valued association.
    pub fn as_collection(&self) -> Option<&[CollectionEntry]> {
        match self {
            Self::Collection(entries) => Some(entries),
            _ => None,
        }
    }

    /// Short variant name used in diagnostics.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::String(_) => "string",
            Self::Timestamp(_) => "timestamp",
            Self::Date(_) => "date",
            Self::Json(_) => "json",
            Self::List(_) => "list",
            Self::Document(_) => "document",
            Self::Collection(_) => "collection",
        }
    }

    /// Build a collection value from documents in list order.
    pub fn collection_of(keys: impl IntoIterator<Item = DocumentKey>) -> Self {
        Self::Collection(
            keys.into_iter()
                .enumerate()
                .map(|(index, key)| CollectionEntry::new(index, Self::Document(key)))
                .collect(),
        )
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Self::Decimal(value)
    }
}

impl From<DocumentKey> for Value {
    fn from(key: DocumentKey) -> Self {
        Self::Document(key)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

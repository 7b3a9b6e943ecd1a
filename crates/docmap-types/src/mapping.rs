//! Static mapping metadata: how each field of a class is stored.
//!
//! Field kinds are a closed sum type so that every routing decision made by
//! the update compiler is checked for exhaustiveness at compile time. Names
//! coming from mapping files are parsed into these types once, at load time;
//! an unknown kind or strategy name is a configuration defect reported as a
//! [`MappingError`].

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::value::ScalarType;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while parsing or validating mapping metadata.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    /// The association kind name is not one of the known kinds.
    #[error("unsupported association kind: {0}")]
    UnsupportedAssociationKind(String),

    /// The collection strategy name is not one of the known strategies.
    #[error("unsupported collection strategy: {0}")]
    UnsupportedCollectionStrategy(String),

    /// The reference storage form is not one of the known forms.
    #[error("unsupported reference storage form: {0}")]
    UnsupportedReferenceStorage(String),

    /// The scalar type name is not one of the known types.
    #[error("unsupported scalar type: {0}")]
    UnsupportedScalarType(String),

    /// A field name referenced by class-level metadata does not exist.
    #[error("class {class} has no field named {field}")]
    UnknownField {
        /// The class being validated.
        class: String,
        /// The missing field.
        field: String,
    },

    /// The version field has a type no version scheme supports.
    #[error("version field {class}::{field} must be int or timestamp, got {ty}")]
    InvalidVersionType {
        /// The class being validated.
        class: String,
        /// The version field.
        field: String,
        /// The declared type.
        ty: ScalarType,
    },

    /// An increment field has a non-numeric type.
    #[error("increment field {class}::{field} must be numeric, got {ty}")]
    InvalidIncrementType {
        /// The class being validated.
        class: String,
        /// The increment field.
        field: String,
        /// The declared type.
        ty: ScalarType,
    },

    /// A class was registered twice.
    #[error("duplicate class metadata: {0}")]
    DuplicateClass(String),
}

// ---------------------------------------------------------------------------
// Collection strategies
// ---------------------------------------------------------------------------

/// Policy governing how a many-valued association is synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CollectionStrategy {
    /// Replace the whole collection, keeping its keys.
    Set,
    /// Replace the whole collection as a dense list.
    SetArray,
    /// Remove deleted elements, then push inserted ones.
    PushAll,
    /// Remove deleted elements, then add inserted ones to the set.
    AddToSet,
    /// Like [`Set`](Self::Set), written inside the owner's own update.
    AtomicSet,
    /// Like [`SetArray`](Self::SetArray), written inside the owner's own update.
    AtomicSetArray,
}

impl CollectionStrategy {
    /// Return the strategy name used in mapping files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::SetArray => "setArray",
            Self::PushAll => "pushAll",
            Self::AddToSet => "addToSet",
            Self::AtomicSet => "atomicSet",
            Self::AtomicSetArray => "atomicSetArray",
        }
    }

    /// Whether the collection is written as part of the owner's update.
    pub const fn is_atomic(self) -> bool {
        matches!(self, Self::AtomicSet | Self::AtomicSetArray)
    }

    /// Whether the collection is written by replacing it wholesale.
    pub const fn uses_set(self) -> bool {
        matches!(
            self,
            Self::Set | Self::SetArray | Self::AtomicSet | Self::AtomicSetArray
        )
    }

    /// Whether the stored form is a dense list rather than a keyed hash.
    pub const fn is_list(self) -> bool {
        !matches!(self, Self::Set | Self::AtomicSet)
    }
}

impl FromStr for CollectionStrategy {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(Self::Set),
            "setArray" => Ok(Self::SetArray),
            "pushAll" => Ok(Self::PushAll),
            "addToSet" => Ok(Self::AddToSet),
            "atomicSet" => Ok(Self::AtomicSet),
            "atomicSetArray" => Ok(Self::AtomicSetArray),
            other => Err(MappingError::UnsupportedCollectionStrategy(other.to_owned())),
        }
    }
}

impl TryFrom<String> for CollectionStrategy {
    type Error = MappingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CollectionStrategy> for String {
    fn from(strategy: CollectionStrategy) -> Self {
        strategy.as_str().to_owned()
    }
}

impl core::fmt::Display for CollectionStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Reference storage
// ---------------------------------------------------------------------------

/// How a reference to another document is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReferenceStorage {
    /// Bare identifier value.
    #[default]
    Id,
    /// `{ref, id, db}` object, plus a discriminator when not pinned.
    Ref,
    /// Bare identifier; the target type must be known statically.
    Simple,
    /// `{$ref, $id}` object, plus a discriminator when not pinned.
    DbRef,
    /// `{$ref, $id, $db}` object, plus a discriminator when not pinned.
    DbRefWithDb,
}

impl ReferenceStorage {
    /// Return the storage form name used in mapping files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Ref => "ref",
            Self::Simple => "simple",
            Self::DbRef => "dbRef",
            Self::DbRefWithDb => "dbRefWithDb",
        }
    }
}

impl FromStr for ReferenceStorage {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(Self::Id),
            "ref" => Ok(Self::Ref),
            "simple" => Ok(Self::Simple),
            "dbRef" => Ok(Self::DbRef),
            "dbRefWithDb" => Ok(Self::DbRefWithDb),
            other => Err(MappingError::UnsupportedReferenceStorage(other.to_owned())),
        }
    }
}

impl TryFrom<String> for ReferenceStorage {
    type Error = MappingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReferenceStorage> for String {
    fn from(storage: ReferenceStorage) -> Self {
        storage.as_str().to_owned()
    }
}

// ---------------------------------------------------------------------------
// Association details
// ---------------------------------------------------------------------------

/// Polymorphism settings shared by embedded and referenced associations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMapping {
    /// The single class this association is pinned to, if any.
    #[serde(default)]
    pub target_document: Option<String>,
    /// Field holding the discriminator inside the stored value.
    #[serde(default)]
    pub discriminator_field: Option<String>,
    /// Discriminator value to class name.
    #[serde(default)]
    pub discriminator_map: BTreeMap<String, String>,
    /// Value used when the class is absent from the discriminator map.
    #[serde(default)]
    pub default_discriminator_value: Option<String>,
}

impl TargetMapping {
    /// An association pinned to exactly one class.
    pub fn pinned(class: impl Into<String>) -> Self {
        Self {
            target_document: Some(class.into()),
            ..Self::default()
        }
    }

    /// An association that accepts any class and records a discriminator.
    pub fn polymorphic() -> Self {
        Self::default()
    }

    /// Set the discriminator field name.
    #[must_use]
    pub fn discriminated_by(mut self, field: impl Into<String>) -> Self {
        self.discriminator_field = Some(field.into());
        self
    }

    /// Add a discriminator map entry.
    #[must_use]
    pub fn map_discriminator(mut self, value: impl Into<String>, class: impl Into<String>) -> Self {
        self.discriminator_map.insert(value.into(), class.into());
        self
    }

    /// Set the default discriminator value.
    #[must_use]
    pub fn default_discriminator(mut self, value: impl Into<String>) -> Self {
        self.default_discriminator_value = Some(value.into());
        self
    }

    /// Whether the association is pinned to a single target class.
    pub const fn is_pinned(&self) -> bool {
        self.target_document.is_some()
    }

    /// Look up the discriminator value registered for `class`.
    pub fn discriminator_for(&self, class: &str) -> Option<&str> {
        self.discriminator_map
            .iter()
            .find(|(_, mapped)| mapped.as_str() == class)
            .map(|(value, _)| value.as_str())
    }
}

/// Settings of a reference association.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceMapping {
    /// Stored form of the reference.
    #[serde(default)]
    pub storage: ReferenceStorage,
    /// Target class and discriminator settings.
    #[serde(default, flatten)]
    pub target: TargetMapping,
    /// Whether this side owns the reference. Inverse sides are never written.
    #[serde(default = "default_true")]
    pub owning_side: bool,
}

impl ReferenceMapping {
    /// An owning reference with the given storage form and target settings.
    pub const fn new(storage: ReferenceStorage, target: TargetMapping) -> Self {
        Self {
            storage,
            target,
            owning_side: true,
        }
    }

    /// Mark this reference as the inverse side.
    #[must_use]
    pub const fn inverse(mut self) -> Self {
        self.owning_side = false;
        self
    }
}

const fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Field kinds
// ---------------------------------------------------------------------------

/// Name-level classification of a field, as written in mapping files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationKind {
    /// Plain stored value.
    Scalar,
    /// Numeric value updated with `$inc`.
    Increment,
    /// Single embedded document.
    EmbeddedOne,
    /// Collection of embedded documents.
    EmbeddedMany,
    /// Single referenced document.
    ReferenceOne,
    /// Collection of referenced documents.
    ReferenceMany,
}

impl AssociationKind {
    /// Return the kind name used in mapping files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Increment => "increment",
            Self::EmbeddedOne => "embedded-one",
            Self::EmbeddedMany => "embedded-many",
            Self::ReferenceOne => "reference-one",
            Self::ReferenceMany => "reference-many",
        }
    }
}

impl FromStr for AssociationKind {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scalar" => Ok(Self::Scalar),
            "increment" => Ok(Self::Increment),
            "embedded-one" => Ok(Self::EmbeddedOne),
            "embedded-many" => Ok(Self::EmbeddedMany),
            "reference-one" => Ok(Self::ReferenceOne),
            "reference-many" => Ok(Self::ReferenceMany),
            other => Err(MappingError::UnsupportedAssociationKind(other.to_owned())),
        }
    }
}

impl core::fmt::Display for AssociationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed description of how one field is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain stored value of the given type.
    Scalar(ScalarType),
    /// Numeric value whose changes are written as deltas.
    Increment(ScalarType),
    /// Single embedded document.
    EmbedOne(TargetMapping),
    /// Collection of embedded documents.
    EmbedMany {
        /// Target class and discriminator settings.
        target: TargetMapping,
        /// Synchronization strategy.
        strategy: CollectionStrategy,
    },
    /// Single referenced document.
    ReferenceOne(ReferenceMapping),
    /// Collection of referenced documents.
    ReferenceMany {
        /// Storage form and target settings.
        reference: ReferenceMapping,
        /// Synchronization strategy.
        strategy: CollectionStrategy,
    },
}

impl FieldKind {
    /// Name-level classification of this kind.
    pub const fn association_kind(&self) -> AssociationKind {
        match self {
            Self::Scalar(_) => AssociationKind::Scalar,
            Self::Increment(_) => AssociationKind::Increment,
            Self::EmbedOne(_) => AssociationKind::EmbeddedOne,
            Self::EmbedMany { .. } => AssociationKind::EmbeddedMany,
            Self::ReferenceOne(_) => AssociationKind::ReferenceOne,
            Self::ReferenceMany { .. } => AssociationKind::ReferenceMany,
        }
    }
}

// ---------------------------------------------------------------------------
// Field mapping
// ---------------------------------------------------------------------------

/// Static description of one mapped field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    /// Name of the field on the mapped object.
    pub field_name: String,
    /// Name of the field in the stored document.
    pub name: String,
    /// How the field is stored.
    pub kind: FieldKind,
    /// Whether `null` is stored explicitly instead of removing the field.
    pub nullable: bool,
    /// Whether the field is loaded but never written.
    pub not_saved: bool,
    /// Whether the field holds the document identifier.
    pub identifier: bool,
}

impl FieldMapping {
    /// A field stored under its own name.
    pub fn new(field_name: impl Into<String>, kind: FieldKind) -> Self {
        let field_name = field_name.into();
        Self {
            name: field_name.clone(),
            field_name,
            kind,
            nullable: false,
            not_saved: false,
            identifier: false,
        }
    }

    /// A scalar field.
    pub fn scalar(field_name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(field_name, FieldKind::Scalar(ty))
    }

    /// An increment field.
    pub fn increment(field_name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(field_name, FieldKind::Increment(ty))
    }

    /// An embedded-one field.
    pub fn embed_one(field_name: impl Into<String>, target: TargetMapping) -> Self {
        Self::new(field_name, FieldKind::EmbedOne(target))
    }

    /// An embedded-many field.
    pub fn embed_many(
        field_name: impl Into<String>,
        target: TargetMapping,
        strategy: CollectionStrategy,
    ) -> Self {
        Self::new(field_name, FieldKind::EmbedMany { target, strategy })
    }

    /// A reference-one field.
    pub fn reference_one(field_name: impl Into<String>, reference: ReferenceMapping) -> Self {
        Self::new(field_name, FieldKind::ReferenceOne(reference))
    }

    /// A reference-many field.
    pub fn reference_many(
        field_name: impl Into<String>,
        reference: ReferenceMapping,
        strategy: CollectionStrategy,
    ) -> Self {
        Self::new(field_name, FieldKind::ReferenceMany { reference, strategy })
    }

    /// The identifier field, stored as `_id`.
    pub fn id(field_name: impl Into<String>) -> Self {
        Self::scalar(field_name, ScalarType::Id)
            .stored_as("_id")
            .identifier()
    }

    /// Use a different name in the stored document.
    #[must_use]
    pub fn stored_as(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Store `null` explicitly.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Never write this field.
    #[must_use]
    pub const fn not_saved(mut self) -> Self {
        self.not_saved = true;
        self
    }

    /// Mark this field as the identifier.
    #[must_use]
    pub const fn identifier(mut self) -> Self {
        self.identifier = true;
        self
    }

    /// Collection strategy of a many-valued field.
    pub const fn collection_strategy(&self) -> Option<CollectionStrategy> {
        match &self.kind {
            FieldKind::EmbedMany { strategy, .. } | FieldKind::ReferenceMany { strategy, .. } => {
                Some(*strategy)
            }
            _ => None,
        }
    }

    /// Whether this side of the association is written at all.
    pub const fn is_owning_side(&self) -> bool {
        match &self.kind {
            FieldKind::ReferenceOne(reference)
            | FieldKind::ReferenceMany { reference, .. } => reference.owning_side,
            _ => true,
        }
    }

    /// Whether the field holds embedded documents.
    pub const fn is_embedded(&self) -> bool {
        matches!(self.kind, FieldKind::EmbedOne(_) | FieldKind::EmbedMany { .. })
    }

    /// Whether the field is a many-valued association.
    pub const fn is_many(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::EmbedMany { .. } | FieldKind::ReferenceMany { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Class metadata
// ---------------------------------------------------------------------------

/// Scheme used to produce the next version token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionScheme {
    /// Integer counter advanced with `$inc: 1`.
    Integer,
    /// Timestamp replaced with `$set` of the write time.
    Timestamp,
}

impl VersionScheme {
    /// Pick the scheme backing a version field of the given type.
    pub const fn for_type(ty: ScalarType) -> Option<Self> {
        match ty {
            ScalarType::Int => Some(Self::Integer),
            ScalarType::Timestamp | ScalarType::Date => Some(Self::Timestamp),
            _ => None,
        }
    }
}

/// Structural description of a mapped class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMetadata {
    /// Class name; doubles as the variant tag of managed documents.
    pub name: String,
    /// Collection the class is stored in (empty for embedded classes).
    pub collection: String,
    /// Database the collection lives in, if not the default one.
    pub database: Option<String>,
    /// Whether the class is only ever stored embedded in another document.
    pub embedded: bool,
    /// Mapped fields, in declaration order.
    pub fields: Vec<FieldMapping>,
    /// Field name of the version field.
    pub version_field: Option<String>,
    /// Field name of the lock field.
    pub lock_field: Option<String>,
    /// Field written with the class discriminator.
    pub discriminator_field: Option<String>,
    /// Discriminator value of this class.
    pub discriminator_value: Option<String>,
    /// Whether documents of this class share storage with other classes.
    pub polymorphic: bool,
}

impl ClassMetadata {
    /// Metadata for a top-level document class.
    pub fn document(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            database: None,
            embedded: false,
            fields: Vec::new(),
            version_field: None,
            lock_field: None,
            discriminator_field: None,
            discriminator_value: None,
            polymorphic: false,
        }
    }

    /// Metadata for an embedded document class.
    pub fn embedded(name: impl Into<String>) -> Self {
        Self {
            embedded: true,
            ..Self::document(name, String::new())
        }
    }

    /// Add a field mapping.
    #[must_use]
    pub fn field(mut self, mapping: FieldMapping) -> Self {
        self.fields.push(mapping);
        self
    }

    /// Store the collection in a specific database.
    #[must_use]
    pub fn in_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Guard writes with the given version field.
    #[must_use]
    pub fn versioned_by(mut self, field_name: impl Into<String>) -> Self {
        self.version_field = Some(field_name.into());
        self
    }

    /// Guard writes with the given lock field.
    #[must_use]
    pub fn lockable_by(mut self, field_name: impl Into<String>) -> Self {
        self.lock_field = Some(field_name.into());
        self
    }

    /// Write `field: value` into every stored document of this class.
    #[must_use]
    pub fn discriminated(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.discriminator_field = Some(field.into());
        self.discriminator_value = Some(value.into());
        self.polymorphic = true;
        self
    }

    /// Look up a field mapping by field name.
    pub fn field_mapping(&self, field_name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.field_name == field_name)
    }

    /// The identifier field mapping, if one is declared.
    pub fn identifier_mapping(&self) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.identifier)
    }

    /// The version field mapping, if the class is versioned.
    pub fn version_mapping(&self) -> Option<&FieldMapping> {
        self.version_field
            .as_deref()
            .and_then(|name| self.field_mapping(name))
    }

    /// The lock field mapping, if the class is lockable.
    pub fn lock_mapping(&self) -> Option<&FieldMapping> {
        self.lock_field
            .as_deref()
            .and_then(|name| self.field_mapping(name))
    }

    /// Discriminator value written for this class, falling back to its name.
    pub fn discriminator_value_or_name(&self) -> &str {
        self.discriminator_value.as_deref().unwrap_or(&self.name)
    }

    /// Check that class-level references point at valid fields.
    pub fn validate(&self) -> Result<(), MappingError> {
        if let Some(version) = self.version_field.as_deref() {
            let mapping = self.field_mapping(version).ok_or_else(|| MappingError::UnknownField {
                class: self.name.clone(),
                field: version.to_owned(),
            })?;
            let ty = match mapping.kind {
                FieldKind::Scalar(ty) | FieldKind::Increment(ty) => ty,
                _ => ScalarType::Raw,
            };
            if VersionScheme::for_type(ty).is_none() {
                return Err(MappingError::InvalidVersionType {
                    class: self.name.clone(),
                    field: version.to_owned(),
                    ty,
                });
            }
        }

        if let Some(lock) = self.lock_field.as_deref() {
            if self.field_mapping(lock).is_none() {
                return Err(MappingError::UnknownField {
                    class: self.name.clone(),
                    field: lock.to_owned(),
                });
            }
        }

        for mapping in &self.fields {
            if let FieldKind::Increment(ty) = mapping.kind {
                if !ty.is_numeric() {
                    return Err(MappingError::InvalidIncrementType {
                        class: self.name.clone(),
                        field: mapping.field_name.clone(),
                        ty,
                    });
                }
            }
        }

        Ok(())
    }
}

//! Metadata provider: structural answers about mapped classes.
//!
//! The compiler only ever asks questions through [`MetadataProvider`]. The
//! [`MetadataRegistry`] implementation holds class metadata in memory and can
//! be loaded from a YAML mapping file, where kind, type, strategy, and
//! storage names are validated into their typed forms.
//!
//! ```yaml
//! classes:
//!   - name: User
//!     collection: users
//!     version_field: version
//!     fields:
//!       - { name: id, kind: scalar, type: id, stored_as: _id, identifier: true }
//!       - { name: version, kind: scalar, type: int }
//!       - { name: address, kind: embedded-one, target: Address }
//!       - { name: tags, kind: reference-many, storage: ref, strategy: addToSet, target: Tag }
//!   - name: Address
//!     embedded: true
//!     fields:
//!       - { name: city, kind: scalar, type: string }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use docmap_types::{
    AssociationKind, ClassMetadata, CollectionStrategy, FieldKind, FieldMapping, MappingError,
    ReferenceMapping, ReferenceStorage, ScalarType, TargetMapping,
};

use crate::config::ConfigError;
use crate::error::PersistError;

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Answers structural questions about mapped classes.
pub trait MetadataProvider {
    /// Metadata of a class, if registered.
    fn class_metadata(&self, class: &str) -> Option<&ClassMetadata>;

    /// Metadata of a class, or [`PersistError::UnknownClass`].
    fn require_class(&self, class: &str) -> Result<&ClassMetadata, PersistError> {
        self.class_metadata(class)
            .ok_or_else(|| PersistError::UnknownClass(class.to_owned()))
    }

    /// Mapping of one field of a class.
    fn field_mapping(&self, class: &str, field: &str) -> Option<&FieldMapping> {
        self.class_metadata(class)?.field_mapping(field)
    }

    /// Collection strategy of a many-valued field.
    fn collection_strategy(&self, mapping: &FieldMapping) -> Option<CollectionStrategy> {
        mapping.collection_strategy()
    }

    /// Version field of a class, if versioned.
    fn version_field(&self, class: &str) -> Option<&FieldMapping> {
        self.class_metadata(class)?.version_mapping()
    }

    /// Lock field of a class, if lockable.
    fn lock_field(&self, class: &str) -> Option<&FieldMapping> {
        self.class_metadata(class)?.lock_mapping()
    }

    /// Whether documents of the class carry a discriminator.
    fn is_polymorphic(&self, class: &str) -> bool {
        self.class_metadata(class)
            .is_some_and(|meta| meta.polymorphic || meta.discriminator_field.is_some())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-memory [`MetadataProvider`] keyed by class name.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    classes: BTreeMap<String, ClassMetadata>,
}

impl MetadataRegistry {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            classes: BTreeMap::new(),
        }
    }

    /// Validate and register a class.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::DuplicateClass`] if the name is taken, or the
    /// validation error of the class itself.
    pub fn register(&mut self, class: ClassMetadata) -> Result<(), MappingError> {
        class.validate()?;
        if self.classes.contains_key(&class.name) {
            return Err(MappingError::DuplicateClass(class.name));
        }
        self.classes.insert(class.name.clone(), class);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub fn with(mut self, class: ClassMetadata) -> Result<Self, MappingError> {
        self.register(class)?;
        Ok(self)
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether no class is registered.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Load mapping metadata from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if it is not valid YAML, or
    /// [`ConfigError::Mapping`] if it describes invalid metadata.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Load mapping metadata from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Mapping`] if it describes invalid metadata.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: MappingFile = serde_yml::from_str(yaml)?;
        let mut registry = Self::new();
        for raw in file.classes {
            registry.register(raw.into_metadata()?)?;
        }
        tracing::debug!(classes = registry.len(), "Loaded mapping metadata");
        Ok(registry)
    }
}

impl MetadataProvider for MetadataRegistry {
    fn class_metadata(&self, class: &str) -> Option<&ClassMetadata> {
        self.classes.get(class)
    }
}

// ---------------------------------------------------------------------------
// YAML mapping file
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MappingFile {
    #[serde(default)]
    classes: Vec<RawClass>,
}

#[derive(Debug, Deserialize)]
struct RawClass {
    name: String,
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    embedded: bool,
    #[serde(default)]
    version_field: Option<String>,
    #[serde(default)]
    lock_field: Option<String>,
    #[serde(default)]
    discriminator_field: Option<String>,
    #[serde(default)]
    discriminator_value: Option<String>,
    #[serde(default)]
    polymorphic: bool,
    #[serde(default)]
    fields: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    name: String,
    kind: String,
    #[serde(default, rename = "type")]
    ty: Option<String>,
    #[serde(default)]
    stored_as: Option<String>,
    #[serde(default)]
    nullable: bool,
    #[serde(default)]
    not_saved: bool,
    #[serde(default)]
    identifier: bool,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    storage: Option<String>,
    #[serde(default)]
    inverse: bool,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    discriminator_field: Option<String>,
    #[serde(default)]
    discriminator_map: BTreeMap<String, String>,
    #[serde(default)]
    default_discriminator_value: Option<String>,
}

impl RawClass {
    fn into_metadata(self) -> Result<ClassMetadata, MappingError> {
        let mut class = if self.embedded {
            ClassMetadata::embedded(self.name)
        } else {
            let collection = self.collection.unwrap_or_else(|| self.name.to_lowercase());
            ClassMetadata::document(self.name, collection)
        };
        class.database = self.database;
        class.version_field = self.version_field;
        class.lock_field = self.lock_field;
        class.discriminator_field = self.discriminator_field;
        class.discriminator_value = self.discriminator_value;
        class.polymorphic = self.polymorphic || class.discriminator_field.is_some();
        class.fields = self
            .fields
            .into_iter()
            .map(RawField::into_mapping)
            .collect::<Result<_, _>>()?;
        Ok(class)
    }
}

impl RawField {
    fn into_mapping(self) -> Result<FieldMapping, MappingError> {
        let association: AssociationKind = self.kind.parse()?;
        let target = TargetMapping {
            target_document: self.target,
            discriminator_field: self.discriminator_field,
            discriminator_map: self.discriminator_map,
            default_discriminator_value: self.default_discriminator_value,
        };
        let strategy = self
            .strategy
            .as_deref()
            .map_or(Ok(CollectionStrategy::PushAll), str::parse)?;
        let storage = self
            .storage
            .as_deref()
            .map_or(Ok(ReferenceStorage::Id), str::parse)?;
        let reference = ReferenceMapping {
            storage,
            target: target.clone(),
            owning_side: !self.inverse,
        };

        let kind = match association {
            AssociationKind::Scalar => FieldKind::Scalar(parse_type(self.ty.as_deref(), ScalarType::Raw)?),
            AssociationKind::Increment => {
                FieldKind::Increment(parse_type(self.ty.as_deref(), ScalarType::Int)?)
            }
            AssociationKind::EmbeddedOne => FieldKind::EmbedOne(target),
            AssociationKind::EmbeddedMany => FieldKind::EmbedMany { target, strategy },
            AssociationKind::ReferenceOne => FieldKind::ReferenceOne(reference),
            AssociationKind::ReferenceMany => FieldKind::ReferenceMany {
                reference,
                strategy,
            },
        };

        Ok(FieldMapping {
            name: self.stored_as.unwrap_or_else(|| self.name.clone()),
            field_name: self.name,
            kind,
            nullable: self.nullable,
            not_saved: self.not_saved,
            identifier: self.identifier,
        })
    }
}

fn parse_type(name: Option<&str>, default: ScalarType) -> Result<ScalarType, MappingError> {
    name.map_or(Ok(default), str::parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = r"
classes:
  - name: User
    collection: users
    version_field: version
    lock_field: locked
    fields:
      - { name: id, kind: scalar, type: id, stored_as: _id, identifier: true }
      - { name: version, kind: scalar, type: int }
      - { name: locked, kind: scalar, type: bool }
      - { name: logins, kind: increment }
      - { name: address, kind: embedded-one, target: Address }
      - { name: tags, kind: reference-many, storage: ref, strategy: addToSet, target: Tag }
      - { name: posts, kind: reference-many, inverse: true }
  - name: Address
    embedded: true
    fields:
      - { name: city, kind: scalar, type: string, nullable: true }
  - name: Tag
    fields:
      - { name: id, kind: scalar, type: id, stored_as: _id, identifier: true }
";

    #[test]
    fn loads_classes_and_fields() {
        let registry = MetadataRegistry::from_yaml_str(MAPPING);
        assert!(registry.is_ok(), "{registry:?}");
        let registry = registry.unwrap_or_default();
        assert_eq!(registry.len(), 3);

        let user = registry.require_class("User");
        assert!(user.is_ok());
        let tags = registry.field_mapping("User", "tags");
        assert_eq!(
            tags.and_then(|m| registry.collection_strategy(m)),
            Some(CollectionStrategy::AddToSet)
        );
        assert_eq!(
            registry.version_field("User").map(|m| m.name.as_str()),
            Some("version")
        );
        assert!(registry.lock_field("User").is_some());
        assert!(!registry.is_polymorphic("User"));
        assert_eq!(
            registry.field_mapping("User", "logins").map(|m| &m.kind),
            Some(&FieldKind::Increment(ScalarType::Int))
        );
        assert!(
            registry
                .field_mapping("User", "posts")
                .is_some_and(|m| !m.is_owning_side())
        );
    }

    #[test]
    fn unknown_kind_is_a_mapping_error() {
        let yaml = r"
classes:
  - name: User
    fields:
      - { name: friends, kind: graph-many }
";
        let result = MetadataRegistry::from_yaml_str(yaml);
        assert!(matches!(
            result,
            Err(ConfigError::Mapping {
                source: MappingError::UnsupportedAssociationKind(_)
            })
        ));
    }

    #[test]
    fn unknown_strategy_is_a_mapping_error() {
        let yaml = r"
classes:
  - name: User
    fields:
      - { name: tags, kind: reference-many, strategy: pullAll }
";
        let result = MetadataRegistry::from_yaml_str(yaml);
        assert!(matches!(
            result,
            Err(ConfigError::Mapping {
                source: MappingError::UnsupportedCollectionStrategy(_)
            })
        ));
    }

    #[test]
    fn duplicate_class_is_rejected() {
        let registry = MetadataRegistry::new()
            .with(ClassMetadata::document("User", "users"))
            .and_then(|r| r.with(ClassMetadata::document("User", "people")));
        assert_eq!(
            registry.map(|r| r.len()),
            Err(MappingError::DuplicateClass("User".to_owned()))
        );
    }

    #[test]
    fn unknown_class_is_reported() {
        let registry = MetadataRegistry::new();
        assert!(matches!(
            registry.require_class("Ghost"),
            Err(PersistError::UnknownClass(_))
        ));
    }
}

//! Association resolution: storable forms of embedded and referenced values.
//!
//! Scalars are handed to the [`coercer`](crate::coercer). Embedded documents
//! are always materialized in full, never diffed. References are turned into
//! one of the reference storage forms:
//!
//! | Storage       | Stored value                                   |
//! |---------------|------------------------------------------------|
//! | `id`          | bare identifier                                |
//! | `simple`      | bare identifier, target class must be pinned   |
//! | `ref`         | `{ref, id, db}` plus discriminator             |
//! | `dbRef`       | `{$ref, $id}` plus discriminator               |
//! | `dbRefWithDb` | `{$ref, $id, $db}` plus discriminator          |

use serde_json::{Map, Value as JsonValue};

use docmap_types::{
    ClassMetadata, CollectionEntry, CollectionSchedule, DocumentKey, ElementKey, FieldKind,
    FieldMapping, ReferenceMapping, ReferenceStorage, ScalarType, TargetMapping, Value,
};

use crate::coercer;
use crate::context::PersistContext;
use crate::discriminator;
use crate::error::PersistError;
use crate::metadata::MetadataProvider;
use crate::unit_of_work::ChangeSetProvider;

/// Join a dotted path prefix and a segment.
pub fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_owned()
    } else {
        format!("{prefix}.{segment}")
    }
}

/// Resolves field values of any kind to their storable form.
#[derive(Debug, Clone, Copy)]
pub struct AssociationResolver<'a> {
    ctx: PersistContext<'a>,
}

impl<'a> AssociationResolver<'a> {
    /// Create a resolver over the given collaborators.
    pub const fn new(ctx: PersistContext<'a>) -> Self {
        Self { ctx }
    }

    /// Storable form of a field value.
    ///
    /// Returns `None` when the value is null and the mapping does not store
    /// nulls.
    ///
    /// # Errors
    ///
    /// Propagates conversion, reference, and discriminator errors, tagged
    /// with `path`.
    pub fn to_storable(
        &self,
        mapping: &FieldMapping,
        value: &Value,
        path: &str,
    ) -> Result<Option<JsonValue>, PersistError> {
        if value.is_null() {
            return Ok(mapping.nullable.then_some(JsonValue::Null));
        }

        match (&mapping.kind, value) {
            (FieldKind::Scalar(ty) | FieldKind::Increment(ty), _) => {
                coercer::to_storable(mapping, *ty, value, path)
            }
            (FieldKind::EmbedOne(target), Value::Document(key)) => self
                .embedded_document_value(target, *key, path)
                .map(|document| Some(JsonValue::Object(document))),
            (FieldKind::ReferenceOne(reference), Value::Document(key)) => {
                self.reference_value(reference, *key, path).map(Some)
            }
            (FieldKind::EmbedMany { .. } | FieldKind::ReferenceMany { .. }, Value::Collection(entries)) => {
                self.collection_value(mapping, entries, path).map(Some)
            }
            _ => Err(mismatched(mapping, value, path)),
        }
    }

    /// Storable form of one element of a many-valued association.
    ///
    /// # Errors
    ///
    /// Same as [`to_storable`](Self::to_storable).
    pub fn element_value(
        &self,
        mapping: &FieldMapping,
        value: &Value,
        path: &str,
    ) -> Result<JsonValue, PersistError> {
        match (&mapping.kind, value) {
            (_, Value::Null) => Ok(JsonValue::Null),
            (FieldKind::EmbedMany { target, .. }, Value::Document(key)) => self
                .embedded_document_value(target, *key, path)
                .map(JsonValue::Object),
            (FieldKind::ReferenceMany { reference, .. }, Value::Document(key)) => {
                self.reference_value(reference, *key, path)
            }
            _ => Err(mismatched(mapping, value, path)),
        }
    }

    /// Full stored form of a collection, in element order.
    ///
    /// List strategies always produce an array. Keyed strategies produce an
    /// array when the keys are exactly `0..n` in order, and an object keyed
    /// by element key otherwise.
    ///
    /// # Errors
    ///
    /// Same as [`to_storable`](Self::to_storable).
    pub fn collection_value(
        &self,
        mapping: &FieldMapping,
        entries: &[CollectionEntry],
        path: &str,
    ) -> Result<JsonValue, PersistError> {
        let keyed = self
            .ctx
            .metadata
            .collection_strategy(mapping)
            .is_some_and(|strategy| !strategy.is_list());
        let dense = entries
            .iter()
            .enumerate()
            .all(|(index, entry)| entry.key == ElementKey::Index(index));

        if keyed && !dense {
            let mut object = Map::new();
            for entry in entries {
                let key = entry.key.to_string();
                let value = self.element_value(mapping, &entry.value, &join_path(path, &key))?;
                object.insert(key, value);
            }
            return Ok(JsonValue::Object(object));
        }

        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                self.element_value(mapping, &entry.value, &join_path(path, &index.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array)
    }

    /// Complete stored form of an embedded document.
    ///
    /// Every saved field is written; an embed with no storable fields is an
    /// empty object. Collections scheduled for deletion are left out.
    ///
    /// # Errors
    ///
    /// Same as [`to_storable`](Self::to_storable), plus
    /// [`PersistError::UnmanagedDocument`] and [`PersistError::UnknownClass`].
    pub fn embedded_document_value(
        &self,
        target: &TargetMapping,
        key: DocumentKey,
        path: &str,
    ) -> Result<Map<String, JsonValue>, PersistError> {
        let document = self.ctx.documents.require_document(key)?;
        let class = self.ctx.metadata.require_class(&document.class)?;
        let mut stored = Map::new();

        for mapping in &class.fields {
            if mapping.not_saved || !mapping.is_owning_side() {
                continue;
            }
            let field_path = join_path(path, &mapping.name);

            if mapping.identifier {
                if let Some(id) = document.identifier() {
                    let id = identifier_json(class, id, &field_path)?;
                    stored.insert(mapping.name.clone(), id);
                }
                continue;
            }

            if mapping.is_many()
                && self.ctx.documents.collection_schedule(key, &mapping.field_name)
                    == CollectionSchedule::Deletion
            {
                continue;
            }

            let value = document.value(&mapping.field_name);
            if let Some(json) = self.to_storable(mapping, value, &field_path)? {
                stored.insert(mapping.name.clone(), json);
            }
        }

        discriminator::annotate_embedded(target, class, &mut stored);
        Ok(stored)
    }

    /// Stored form of a reference to `key`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::MissingIdentifier`] if the target has no
    /// identifier yet, [`PersistError::AmbiguousReference`] for a `simple`
    /// reference without a pinned target, and
    /// [`PersistError::UnlistedDiscriminator`] for an unmapped class.
    pub fn reference_value(
        &self,
        reference: &ReferenceMapping,
        key: DocumentKey,
        path: &str,
    ) -> Result<JsonValue, PersistError> {
        let document = self.ctx.documents.require_document(key)?;
        let class = self.ctx.metadata.require_class(&document.class)?;
        let id = document
            .identifier()
            .ok_or_else(|| PersistError::MissingIdentifier {
                class: class.name.clone(),
                path: path.to_owned(),
            })?;
        let id = identifier_json(class, id, path)?;

        let (ref_key, id_key, db_key) = match reference.storage {
            ReferenceStorage::Id => return Ok(id),
            ReferenceStorage::Simple => {
                if !reference.target.is_pinned() {
                    return Err(PersistError::AmbiguousReference {
                        path: path.to_owned(),
                        class: class.name.clone(),
                        storage: reference.storage.as_str(),
                    });
                }
                return Ok(id);
            }
            ReferenceStorage::Ref => ("ref", "id", Some("db")),
            ReferenceStorage::DbRef => ("$ref", "$id", None),
            ReferenceStorage::DbRefWithDb => ("$ref", "$id", Some("$db")),
        };

        let mut stored = Map::new();
        stored.insert(ref_key.to_owned(), JsonValue::String(class.collection.clone()));
        stored.insert(id_key.to_owned(), id);
        if let Some(db_key) = db_key {
            let database = class
                .database
                .clone()
                .unwrap_or_else(|| self.ctx.config.default_database.clone());
            stored.insert(db_key.to_owned(), JsonValue::String(database));
        }
        if let Some((field, value)) =
            discriminator::reference_discriminator(&reference.target, class, path)?
        {
            stored.insert(field, value);
        }
        Ok(JsonValue::Object(stored))
    }

    /// Stored identifier of a managed document.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::MissingIdentifier`] if none is assigned.
    pub fn document_identifier(&self, key: DocumentKey) -> Result<JsonValue, PersistError> {
        let document = self.ctx.documents.require_document(key)?;
        let class = self.ctx.metadata.require_class(&document.class)?;
        let id = document
            .identifier()
            .ok_or_else(|| PersistError::MissingIdentifier {
                class: class.name.clone(),
                path: identifier_name(class, &self.ctx.config.identifier_field).to_owned(),
            })?;
        identifier_json(class, id, identifier_name(class, &self.ctx.config.identifier_field))
    }
}

/// Stored name of the identifier field of a class.
pub fn identifier_name<'c>(class: &'c ClassMetadata, fallback: &'c str) -> &'c str {
    class
        .identifier_mapping()
        .map_or(fallback, |mapping| mapping.name.as_str())
}

fn identifier_json(class: &ClassMetadata, id: &Value, path: &str) -> Result<JsonValue, PersistError> {
    let ty = class
        .identifier_mapping()
        .and_then(|mapping| match mapping.kind {
            FieldKind::Scalar(ty) => Some(ty),
            _ => None,
        })
        .unwrap_or(ScalarType::Id);
    coercer::convert(ty, id, path)
}

pub(crate) fn mismatched(mapping: &FieldMapping, value: &Value, path: &str) -> PersistError {
    PersistError::UnsupportedAssociationKind {
        path: path.to_owned(),
        kind: format!(
            "{} holding a {} value",
            mapping.kind.association_kind(),
            value.kind_name()
        ),
    }
}

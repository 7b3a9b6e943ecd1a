//! Persistence builder: insert, update, and upsert payloads of one document.
//!
//! This is the entry point of compilation. Each method produces a complete
//! command for the executor or an error; nothing is half-built.
//!
//! ```text
//! compile_insert  ──▶ full document   (+ identifier, initial version, discriminator)
//! compile_update  ──▶ AtomicUpdateCompiler ──▶ drop identifier ──▶ concurrency guard
//! compile_upsert  ──▶ upsert body ──▶ identifier into filter ──▶ no-op shim if empty
//! ```

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};

use docmap_types::{
    ClassMetadata, CollectionStrategy, CompiledUpdate, DocumentKey, Filter, InsertCommand,
    UpdateCommand, Value, generate_identifier,
};

use crate::association::{AssociationResolver, identifier_name};
use crate::concurrency::{OptimisticConcurrencyGuard, initial_version, version_scheme};
use crate::context::PersistContext;
use crate::discriminator;
use crate::error::PersistError;
use crate::metadata::MetadataProvider;
use crate::unit_of_work::{ChangeSetProvider, ManagedDocument};
use crate::update_compiler::AtomicUpdateCompiler;

/// A compiled insert and the state to record once it succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledInsert {
    /// The insert command.
    pub command: InsertCommand,
    /// Stored identifier of the new document.
    pub identifier: JsonValue,
    /// Identifier generated because the document had none.
    pub generated_identifier: Option<String>,
    /// Version field name and initial version written.
    pub version: Option<(String, Value)>,
}

/// A compiled update or upsert and the state to record once it succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledWrite {
    /// The update command.
    pub command: UpdateCommand,
    /// Guard used to classify the outcome.
    pub guard: OptimisticConcurrencyGuard,
    /// Stored identifier of the document.
    pub identifier: JsonValue,
    /// Version field name and version written.
    pub version: Option<(String, Value)>,
    /// Whether the update is the identifier no-op of an empty upsert.
    pub identifier_only: bool,
}

impl CompiledWrite {
    /// Whether there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.command.update.is_empty()
    }
}

/// Compiles insert, update, and upsert commands for single documents.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceBuilder<'a> {
    ctx: PersistContext<'a>,
    resolver: AssociationResolver<'a>,
    compiler: AtomicUpdateCompiler<'a>,
}

impl<'a> PersistenceBuilder<'a> {
    /// Create a builder over the given collaborators.
    pub const fn new(ctx: PersistContext<'a>) -> Self {
        Self {
            ctx,
            resolver: AssociationResolver::new(ctx),
            compiler: AtomicUpdateCompiler::new(ctx),
        }
    }

    /// Materialize a new document for insertion.
    ///
    /// Every non-null saved field is written, plus nullable nulls. Inverse
    /// references, `addToSet` collections, and empty collections are left
    /// out. A missing identifier is generated and a missing version is
    /// initialized.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::EmbeddedRoot`] for embedded classes, and
    /// propagates coercion and association errors.
    pub fn compile_insert(
        &self,
        key: DocumentKey,
        now: DateTime<Utc>,
    ) -> Result<CompiledInsert, PersistError> {
        let (document, class) = self.root(key)?;
        let id_name = identifier_name(class, &self.ctx.config.identifier_field);
        let mut stored = Map::new();

        let (identifier, generated_identifier) = if document.identifier().is_some() {
            (self.resolver.document_identifier(key)?, None)
        } else {
            let generated = generate_identifier();
            (JsonValue::String(generated.clone()), Some(generated))
        };
        stored.insert(id_name.to_owned(), identifier.clone());

        let version = self.initial_version(class, document, now)?;
        if let Some((field, value)) = &version {
            if let Some(mapping) = class.field_mapping(field) {
                if let Some(json) = self.resolver.to_storable(mapping, value, &mapping.name)? {
                    stored.insert(mapping.name.clone(), json);
                }
            }
        }

        let version_mapping = self.ctx.metadata.version_field(&class.name);
        for mapping in &class.fields {
            if mapping.identifier
                || mapping.not_saved
                || !mapping.is_owning_side()
                || version_mapping.is_some_and(|v| v.field_name == mapping.field_name)
                || self.ctx.metadata.collection_strategy(mapping) == Some(CollectionStrategy::AddToSet)
            {
                continue;
            }

            let value = document.value(&mapping.field_name);
            if value.as_collection().is_some_and(<[_]>::is_empty) {
                continue;
            }
            if let Some(json) = self.resolver.to_storable(mapping, value, &mapping.name)? {
                stored.insert(mapping.name.clone(), json);
            }
        }

        if self.ctx.metadata.is_polymorphic(&class.name) {
            discriminator::annotate_document(class, &mut stored);
        }

        tracing::debug!(
            class = %class.name,
            collection = %class.collection,
            fields = stored.len(),
            generated = generated_identifier.is_some(),
            "Compiled insert"
        );

        Ok(CompiledInsert {
            command: InsertCommand {
                collection: class.collection.clone(),
                document: stored,
            },
            identifier,
            generated_identifier,
            version,
        })
    }

    /// Compile the guarded update of a stored document.
    ///
    /// The identifier is never rewritten. Guards are only folded in when
    /// there is something to write; an empty result means no command.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::EmbeddedRoot`] for embedded classes,
    /// [`PersistError::MissingIdentifier`] for documents never stored, and
    /// propagates compilation errors.
    pub fn compile_update(
        &self,
        key: DocumentKey,
        now: DateTime<Utc>,
    ) -> Result<CompiledWrite, PersistError> {
        let (document, class) = self.root(key)?;
        let id_name = identifier_name(class, &self.ctx.config.identifier_field);
        let identifier = self.resolver.document_identifier(key)?;

        let mut update = self.compiler.compile(key)?;
        update.remove_path(id_name);

        let mut filter = Filter::by_id(id_name, identifier.clone());
        let guard = OptimisticConcurrencyGuard::for_document(self.ctx.metadata, class, document, now)?;
        let mut version = None;
        if !update.is_empty() {
            guard.apply(&mut filter, &mut update)?;
            version = guard
                .version()
                .map(|v| (v.token.field.clone(), v.next.clone()));
        }

        tracing::debug!(
            class = %class.name,
            operators = update.operator_count(),
            paths = update.path_count(),
            guard = ?guard.state(),
            "Compiled update"
        );

        Ok(CompiledWrite {
            command: UpdateCommand::new(class.collection.clone(), filter, update),
            guard,
            identifier,
            version,
            identifier_only: false,
        })
    }

    /// Compile the upsert of a document with a known identifier.
    ///
    /// The identifier moves into the filter. When no operator remains, the
    /// update becomes `$set` of the identifier onto itself, since an empty
    /// update document is rejected by the store.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::EmbeddedRoot`] for embedded classes,
    /// [`PersistError::MissingIdentifier`] without an identifier, and
    /// propagates compilation errors.
    pub fn compile_upsert(
        &self,
        key: DocumentKey,
        now: DateTime<Utc>,
    ) -> Result<CompiledWrite, PersistError> {
        let (document, class) = self.root(key)?;
        let id_name = identifier_name(class, &self.ctx.config.identifier_field);
        let identifier = self.resolver.document_identifier(key)?;

        let mut update = self.compiler.compile_upsert(key)?;
        let version = self.initial_version(class, document, now)?;
        if let Some((field, value)) = &version {
            if let Some(mapping) = class.field_mapping(field) {
                if let Some(json) = self.resolver.to_storable(mapping, value, &mapping.name)? {
                    update.remove_path(&mapping.name);
                    update.set(mapping.name.clone(), json);
                }
            }
        }

        let filter = Filter::by_id(id_name, identifier.clone());
        for (field, _) in filter.iter() {
            update.remove_path(field);
        }

        let identifier_only = update.is_empty();
        if identifier_only {
            tracing::trace!(class = %class.name, "Upsert carries only its identifier");
            update.set(id_name, identifier.clone());
        }

        tracing::debug!(
            class = %class.name,
            operators = update.operator_count(),
            paths = update.path_count(),
            identifier_only,
            "Compiled upsert command"
        );

        Ok(CompiledWrite {
            command: UpdateCommand {
                collection: class.collection.clone(),
                filter,
                update,
                upsert: true,
            },
            guard: OptimisticConcurrencyGuard::unguarded(),
            identifier,
            version,
            identifier_only,
        })
    }

    /// The document and metadata of a top-level document.
    fn root(&self, key: DocumentKey) -> Result<(&'a ManagedDocument, &'a ClassMetadata), PersistError> {
        let document = self.ctx.documents.require_document(key)?;
        let class = self.ctx.metadata.require_class(&document.class)?;
        if class.embedded {
            return Err(PersistError::EmbeddedRoot {
                class: class.name.clone(),
            });
        }
        Ok((document, class))
    }

    /// The version to write with a first store: the current one, or the
    /// scheme's initial value when unset.
    fn initial_version(
        &self,
        class: &ClassMetadata,
        document: &ManagedDocument,
        now: DateTime<Utc>,
    ) -> Result<Option<(String, Value)>, PersistError> {
        let Some(mapping) = self.ctx.metadata.version_field(&class.name) else {
            return Ok(None);
        };
        let (_, scheme) = version_scheme(class, mapping)?;
        let current = document.value(&mapping.field_name);
        let value = if current.is_null() {
            initial_version(scheme, now)
        } else {
            current.clone()
        };
        Ok(Some((mapping.field_name.clone(), value)))
    }
}

/// An empty update to retry a rejected identifier-only upsert with.
pub fn empty_upsert_fallback(write: &CompiledWrite) -> UpdateCommand {
    UpdateCommand {
        update: CompiledUpdate::empty_set(),
        ..write.command.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    #[test]
    fn insert_materializes_saved_fields() {
        let mut fx = Fixture::new();
        let tag = fx.loaded(fx.tag("t1"));
        let user = fx.pending(
            fx.user("u1")
                .with("name", "Ada")
                .with("bio", Value::Null)
                .with("nickname", Value::Null)
                .with("secret", "s")
                .with("tags", Value::collection_of([tag])),
        );

        let ctx = fx.ctx();
        let insert = PersistenceBuilder::new(ctx).compile_insert(user, now());
        assert_eq!(
            insert.map(|i| JsonValue::Object(i.command.document)).ok(),
            Some(json!({"_id": "u1", "name": "Ada", "bio": null}))
        );
    }

    #[test]
    fn insert_generates_identifier_and_initial_version() {
        let mut fx = Fixture::new();
        let article = fx.pending(ManagedDocument::new("Article").with("title", "t"));

        let ctx = fx.ctx();
        let insert = PersistenceBuilder::new(ctx).compile_insert(article, now());
        assert!(insert.is_ok());
        if let Ok(insert) = insert {
            let generated = insert.generated_identifier.clone().unwrap_or_default();
            assert!(!generated.is_empty());
            assert_eq!(insert.command.collection, "articles");
            assert_eq!(insert.command.document.get("_id"), Some(&json!(generated)));
            assert_eq!(insert.command.document.get("version"), Some(&json!(1)));
            assert_eq!(insert.version, Some(("version".to_owned(), Value::Int(1))));
        }
    }

    #[test]
    fn embedded_classes_cannot_be_roots() {
        let mut fx = Fixture::new();
        let address = fx.pending(ManagedDocument::new("Address"));
        let ctx = fx.ctx();
        let insert = PersistenceBuilder::new(ctx).compile_insert(address, now());
        assert!(matches!(insert, Err(PersistError::EmbeddedRoot { .. })));
    }

    #[test]
    fn update_is_guarded_and_keeps_identifier_out() {
        let mut fx = Fixture::new();
        let article = fx.loaded(
            ManagedDocument::new("Article")
                .with_identifier("a1")
                .with("version", 5_i64),
        );
        fx.change(article, "title", "new");

        let ctx = fx.ctx();
        let write = PersistenceBuilder::new(ctx).compile_update(article, now());
        assert!(write.is_ok());
        if let Ok(write) = write {
            assert_eq!(
                write.command.filter.to_document(),
                json!({"_id": "a1", "version": 5, "locked": {"$exists": false}})
            );
            assert_eq!(
                write.command.update.to_document(),
                json!({"$inc": {"version": 1}, "$set": {"title": "new"}})
            );
            assert_eq!(write.version, Some(("version".to_owned(), Value::Int(6))));
        }
    }

    #[test]
    fn empty_update_is_not_guarded() {
        let mut fx = Fixture::new();
        let article = fx.loaded(
            ManagedDocument::new("Article")
                .with_identifier("a1")
                .with("version", 5_i64),
        );

        let ctx = fx.ctx();
        let write = PersistenceBuilder::new(ctx).compile_update(article, now());
        assert!(write.is_ok_and(|w| w.is_empty() && w.version.is_none()));
    }

    #[test]
    fn identifier_only_upsert_sets_identifier_onto_itself() {
        let mut fx = Fixture::new();
        let tag = fx.pending(fx.tag("t1"));

        let ctx = fx.ctx();
        let write = PersistenceBuilder::new(ctx).compile_upsert(tag, now());
        assert!(write.is_ok());
        if let Ok(write) = write {
            assert!(write.identifier_only);
            assert!(write.command.upsert);
            assert_eq!(write.command.filter.to_document(), json!({"_id": "t1"}));
            assert_eq!(write.command.update.to_document(), json!({"$set": {"_id": "t1"}}));
            assert_eq!(
                empty_upsert_fallback(&write).update.to_document(),
                json!({"$set": {}})
            );
        }
    }

    #[test]
    fn upsert_moves_identifier_into_filter() {
        let mut fx = Fixture::new();
        let tag = fx.pending(fx.tag("t1").with("label", "rust"));

        let ctx = fx.ctx();
        let write = PersistenceBuilder::new(ctx).compile_upsert(tag, now());
        assert_eq!(
            write.map(|w| (w.identifier_only, w.command.update.to_document())).ok(),
            Some((false, json!({"$set": {"label": "rust"}})))
        );
    }

    #[test]
    fn upsert_without_identifier_is_rejected() {
        let mut fx = Fixture::new();
        let tag = fx.pending(ManagedDocument::new("Tag"));
        let ctx = fx.ctx();
        let write = PersistenceBuilder::new(ctx).compile_upsert(tag, now());
        assert!(matches!(write, Err(PersistError::MissingIdentifier { .. })));
    }
}

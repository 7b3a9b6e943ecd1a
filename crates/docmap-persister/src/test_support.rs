//! Shared mapping and unit-of-work fixture for unit tests.

use docmap_types::{
    ClassMetadata, CollectionStrategy, DocumentKey, ElementKey, FieldMapping, ReferenceMapping,
    ReferenceStorage, ScalarType, TargetMapping, Value,
};

use crate::config::PersisterConfig;
use crate::context::PersistContext;
use crate::metadata::MetadataRegistry;
use crate::unit_of_work::{ManagedDocument, UnitOfWork};

/// Registered classes `User`, `Address`, `Phone`, `Tag`, and `Article`.
pub struct Fixture {
    pub metadata: MetadataRegistry,
    pub uow: UnitOfWork,
    pub config: PersisterConfig,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(PersisterConfig::default())
    }

    pub fn with_config(config: PersisterConfig) -> Self {
        Self {
            metadata: registry(),
            uow: UnitOfWork::new(),
            config,
        }
    }

    #[allow(clippy::unused_self)]
    pub fn user(&self, id: &str) -> ManagedDocument {
        ManagedDocument::new("User").with_identifier(id)
    }

    #[allow(clippy::unused_self)]
    pub fn tag(&self, id: &str) -> ManagedDocument {
        ManagedDocument::new("Tag").with_identifier(id)
    }

    pub fn loaded(&mut self, document: ManagedDocument) -> DocumentKey {
        self.uow.register(document)
    }

    pub fn pending(&mut self, document: ManagedDocument) -> DocumentKey {
        self.uow.register_new(document)
    }

    pub fn embed(
        &mut self,
        parent: DocumentKey,
        field: &str,
        key: Option<ElementKey>,
        document: ManagedDocument,
    ) -> DocumentKey {
        let child = self.uow.embed(parent, field, key, document);
        assert!(child.is_ok());
        child.unwrap_or_default()
    }

    pub fn embed_new(
        &mut self,
        parent: DocumentKey,
        field: &str,
        key: Option<ElementKey>,
        document: ManagedDocument,
    ) -> DocumentKey {
        let child = self.uow.embed_new(parent, field, key, document);
        assert!(child.is_ok());
        child.unwrap_or_default()
    }

    pub fn change(&mut self, key: DocumentKey, field: &str, value: impl Into<Value>) {
        assert!(self.uow.record_change(key, field, value).is_ok());
    }

    pub fn ctx(&self) -> PersistContext<'_> {
        PersistContext::new(&self.metadata, &self.uow, &self.config)
    }
}

fn registry() -> MetadataRegistry {
    let user = ClassMetadata::document("User", "users")
        .field(FieldMapping::id("id"))
        .field(FieldMapping::scalar("name", ScalarType::String))
        .field(FieldMapping::scalar("nickname", ScalarType::String))
        .field(FieldMapping::scalar("bio", ScalarType::String).nullable())
        .field(FieldMapping::increment("logins", ScalarType::Int))
        .field(FieldMapping::scalar("secret", ScalarType::String).not_saved())
        .field(FieldMapping::embed_one("address", TargetMapping::pinned("Address")))
        .field(FieldMapping::embed_many(
            "history",
            TargetMapping::pinned("Phone"),
            CollectionStrategy::AtomicSetArray,
        ))
        .field(FieldMapping::reference_many(
            "tags",
            ReferenceMapping::new(ReferenceStorage::Id, TargetMapping::pinned("Tag")),
            CollectionStrategy::AddToSet,
        ))
        .field(FieldMapping::reference_many(
            "followers",
            ReferenceMapping::new(ReferenceStorage::Id, TargetMapping::pinned("User")).inverse(),
            CollectionStrategy::PushAll,
        ))
        .field(FieldMapping::reference_one(
            "best_friend",
            ReferenceMapping::new(ReferenceStorage::Id, TargetMapping::pinned("User")),
        ));

    let address = ClassMetadata::embedded("Address")
        .field(FieldMapping::scalar("city", ScalarType::String))
        .field(FieldMapping::scalar("zip", ScalarType::Int))
        .field(FieldMapping::embed_many(
            "phones",
            TargetMapping::pinned("Phone"),
            CollectionStrategy::PushAll,
        ));

    let phone =
        ClassMetadata::embedded("Phone").field(FieldMapping::scalar("number", ScalarType::String));

    let tag = ClassMetadata::document("Tag", "tags")
        .field(FieldMapping::id("id"))
        .field(FieldMapping::scalar("label", ScalarType::String));

    let article = ClassMetadata::document("Article", "articles")
        .field(FieldMapping::id("id"))
        .field(FieldMapping::scalar("title", ScalarType::String))
        .field(FieldMapping::scalar("version", ScalarType::Int))
        .field(FieldMapping::scalar("locked", ScalarType::Bool))
        .versioned_by("version")
        .lockable_by("locked");

    let mut registry = MetadataRegistry::new();
    for class in [user, address, phone, tag, article] {
        assert!(registry.register(class).is_ok());
    }
    registry
}

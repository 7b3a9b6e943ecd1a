//! Collection strategy resolution: operators that synchronize one collection.
//!
//! ```text
//! set / setArray      ──▶ [ {$set: {path: <whole collection>}} ]
//!
//! pushAll / addToSet  ──▶ [ {$unset: {path.<key>: true, ...}},   removal
//!                           {$pull:  {path: null}},
//!                           {$push | $addToSet: {path: ...}} ]    insertion
//! ```
//!
//! Removal and insertion are separate updates and are never merged into one
//! document: the store rejects mixed pull and push semantics on one path in
//! a single update. A failure between them leaves deletions applied and
//! insertions pending.

use serde_json::{Map, Value as JsonValue};

use docmap_types::{
    CollectionDiff, CollectionEntry, CollectionStrategy, CompiledUpdate, FieldMapping,
    UpdateOperator,
};

use crate::association::{AssociationResolver, join_path};
use crate::config::EachWrapping;
use crate::context::PersistContext;
use crate::error::PersistError;
use crate::metadata::MetadataProvider;

/// Emits the updates that synchronize a collection with its diff.
#[derive(Debug, Clone, Copy)]
pub struct CollectionStrategyResolver<'a> {
    ctx: PersistContext<'a>,
    resolver: AssociationResolver<'a>,
}

impl<'a> CollectionStrategyResolver<'a> {
    /// Create a resolver over the given collaborators.
    pub const fn new(ctx: PersistContext<'a>) -> Self {
        Self {
            ctx,
            resolver: AssociationResolver::new(ctx),
        }
    }

    /// Compile the sequential updates for a collection stored at `path`.
    ///
    /// `current` is the collection's present content, used by the `set`
    /// strategies. An empty diff yields no update.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::UnsupportedCollectionStrategy`] for atomic
    /// strategies and non-collection fields, and propagates element
    /// resolution errors.
    pub fn compile(
        &self,
        mapping: &FieldMapping,
        path: &str,
        current: &[CollectionEntry],
        diff: &CollectionDiff,
    ) -> Result<Vec<CompiledUpdate>, PersistError> {
        let strategy = self
            .ctx
            .metadata
            .collection_strategy(mapping)
            .ok_or_else(|| PersistError::UnsupportedCollectionStrategy {
                path: path.to_owned(),
                strategy: mapping.kind.association_kind().to_string(),
            })?;

        if strategy.is_atomic() {
            return Err(PersistError::UnsupportedCollectionStrategy {
                path: path.to_owned(),
                strategy: strategy.to_string(),
            });
        }

        if diff.is_empty() {
            return Ok(Vec::new());
        }

        tracing::trace!(
            path,
            strategy = %strategy,
            inserted = diff.inserted.len(),
            deleted = diff.deleted.len(),
            "Compiling collection synchronization"
        );

        match strategy {
            CollectionStrategy::Set | CollectionStrategy::SetArray => {
                let value = self.resolver.collection_value(mapping, current, path)?;
                let mut update = CompiledUpdate::new();
                update.set(path, value);
                Ok(vec![update])
            }
            CollectionStrategy::PushAll | CollectionStrategy::AddToSet => {
                let mut updates = self.removal(path, diff);
                if let Some(insertion) = self.insertion(mapping, strategy, path, diff)? {
                    updates.push(insertion);
                }
                Ok(updates)
            }
            CollectionStrategy::AtomicSet | CollectionStrategy::AtomicSetArray => {
                Err(PersistError::UnsupportedCollectionStrategy {
                    path: path.to_owned(),
                    strategy: strategy.to_string(),
                })
            }
        }
    }

    /// `$unset` of each deleted slot, then `$pull` of the nulls it leaves.
    fn removal(&self, path: &str, diff: &CollectionDiff) -> Vec<CompiledUpdate> {
        if diff.deleted.is_empty() {
            return Vec::new();
        }

        let mut unset = CompiledUpdate::new();
        for entry in &diff.deleted {
            unset.unset(join_path(path, &entry.key.to_string()));
        }

        let mut pull = CompiledUpdate::new();
        pull.insert(UpdateOperator::Pull, path, JsonValue::Null);

        vec![unset, pull]
    }

    /// `$push`, `$pushAll`, or `$addToSet` of the inserted elements.
    fn insertion(
        &self,
        mapping: &FieldMapping,
        strategy: CollectionStrategy,
        path: &str,
        diff: &CollectionDiff,
    ) -> Result<Option<CompiledUpdate>, PersistError> {
        let mut values = diff
            .inserted
            .iter()
            .map(|entry| {
                let element_path = join_path(path, &entry.key.to_string());
                self.resolver.element_value(mapping, &entry.value, &element_path)
            })
            .collect::<Result<Vec<_>, _>>()?;

        if values.is_empty() {
            return Ok(None);
        }

        let operator = match strategy {
            CollectionStrategy::AddToSet => UpdateOperator::AddToSet,
            _ if self.ctx.config.legacy_push_all => UpdateOperator::PushAll,
            _ => UpdateOperator::Push,
        };

        let value = if operator == UpdateOperator::PushAll {
            JsonValue::Array(values)
        } else if values.len() == 1 && self.ctx.config.each_wrapping == EachWrapping::WhenMultiple
        {
            values.remove(0)
        } else {
            let mut each = Map::new();
            each.insert("$each".to_owned(), JsonValue::Array(values));
            JsonValue::Object(each)
        };

        let mut update = CompiledUpdate::new();
        update.insert(operator, path, value);
        Ok(Some(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersisterConfig;
    use crate::test_support::Fixture;
    use docmap_types::{ElementKey, ReferenceMapping, ReferenceStorage, TargetMapping, Value};
    use serde_json::json;

    fn tags(strategy: CollectionStrategy) -> FieldMapping {
        FieldMapping::reference_many(
            "tags",
            ReferenceMapping::new(ReferenceStorage::Id, TargetMapping::pinned("Tag")),
            strategy,
        )
    }

    fn documents(updates: &[CompiledUpdate]) -> Vec<JsonValue> {
        updates.iter().map(CompiledUpdate::to_document).collect()
    }

    #[test]
    fn push_all_splits_removal_from_insertion() {
        let mut fx = Fixture::new();
        let b = fx.loaded(fx.tag("b"));
        let c = fx.loaded(fx.tag("c"));
        let diff = CollectionDiff {
            inserted: vec![CollectionEntry::new(3, Value::Document(c))],
            deleted: vec![CollectionEntry::new(2, Value::Document(b))],
        };

        let ctx = fx.ctx();
        let updates = CollectionStrategyResolver::new(ctx).compile(
            &tags(CollectionStrategy::PushAll),
            "items.tags",
            &[],
            &diff,
        );

        assert_eq!(
            updates.map(|u| documents(&u)).ok(),
            Some(vec![
                json!({"$unset": {"items.tags.2": true}}),
                json!({"$pull": {"items.tags": null}}),
                json!({"$push": {"items.tags": "c"}}),
            ])
        );
    }

    #[test]
    fn several_insertions_are_wrapped_in_each() {
        let mut fx = Fixture::new();
        let a = fx.loaded(fx.tag("a"));
        let b = fx.loaded(fx.tag("b"));
        let diff = CollectionDiff {
            inserted: vec![
                CollectionEntry::new(0, Value::Document(a)),
                CollectionEntry::new(1, Value::Document(b)),
            ],
            deleted: Vec::new(),
        };

        let ctx = fx.ctx();
        let updates = CollectionStrategyResolver::new(ctx).compile(
            &tags(CollectionStrategy::AddToSet),
            "tags",
            &[],
            &diff,
        );

        assert_eq!(
            updates.map(|u| documents(&u)).ok(),
            Some(vec![json!({"$addToSet": {"tags": {"$each": ["a", "b"]}}})])
        );
    }

    #[test]
    fn legacy_push_all_emits_push_all_arrays() {
        let mut fx = Fixture::with_config(PersisterConfig {
            legacy_push_all: true,
            ..PersisterConfig::default()
        });
        let c = fx.loaded(fx.tag("c"));
        let diff = CollectionDiff {
            inserted: vec![CollectionEntry::new(0, Value::Document(c))],
            deleted: Vec::new(),
        };

        let ctx = fx.ctx();
        let updates = CollectionStrategyResolver::new(ctx).compile(
            &tags(CollectionStrategy::PushAll),
            "tags",
            &[],
            &diff,
        );

        assert_eq!(
            updates.map(|u| documents(&u)).ok(),
            Some(vec![json!({"$pushAll": {"tags": ["c"]}})])
        );
    }

    #[test]
    fn set_array_replaces_with_a_dense_list() {
        let mut fx = Fixture::new();
        let a = fx.loaded(fx.tag("a"));
        let c = fx.loaded(fx.tag("c"));
        let current = vec![
            CollectionEntry::new(0, Value::Document(a)),
            CollectionEntry::new(ElementKey::Index(2), Value::Document(c)),
        ];
        let diff = CollectionDiff {
            inserted: vec![CollectionEntry::new(2, Value::Document(c))],
            deleted: Vec::new(),
        };

        let ctx = fx.ctx();
        let resolver = CollectionStrategyResolver::new(ctx);
        let array = resolver.compile(&tags(CollectionStrategy::SetArray), "tags", &current, &diff);
        let keyed = resolver.compile(&tags(CollectionStrategy::Set), "tags", &current, &diff);

        assert_eq!(
            array.map(|u| documents(&u)).ok(),
            Some(vec![json!({"$set": {"tags": ["a", "c"]}})])
        );
        assert_eq!(
            keyed.map(|u| documents(&u)).ok(),
            Some(vec![json!({"$set": {"tags": {"0": "a", "2": "c"}}})])
        );
    }

    #[test]
    fn atomic_strategies_are_refused() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let result = CollectionStrategyResolver::new(ctx).compile(
            &tags(CollectionStrategy::AtomicSet),
            "tags",
            &[],
            &CollectionDiff::default(),
        );
        assert!(matches!(
            result,
            Err(PersistError::UnsupportedCollectionStrategy { .. })
        ));
    }

    #[test]
    fn empty_diff_writes_nothing() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let result = CollectionStrategyResolver::new(ctx).compile(
            &tags(CollectionStrategy::PushAll),
            "tags",
            &[],
            &CollectionDiff::default(),
        );
        assert!(result.is_ok_and(|updates| updates.is_empty()));
    }
}

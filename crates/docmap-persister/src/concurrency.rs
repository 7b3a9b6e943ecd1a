//! Optimistic concurrency guard: version and lock tokens in write filters.
//!
//! ```text
//!                 ┌────────────┐
//!                 │ Unguarded  │  no version, no lock field
//!                 └────────────┘
//!  ┌────────────────┐      ┌─────────────┐
//!  │ VersionGuarded │      │ LockGuarded │
//!  └────────────────┘      └─────────────┘
//!           └───── VersionAndLockGuarded ─────┘
//! ```
//!
//! | Guard          | Update                         | Filter                       |
//! |----------------|--------------------------------|------------------------------|
//! | int version    | `$inc: {v: 1}`                 | `{v: <loaded value>}`        |
//! | time version   | `$set: {v: <now>}`             | `{v: <loaded value>}`        |
//! | locked         | `$unset: {lock: true}`         |                              |
//! | unlocked       |                                | `{lock: {$exists: false}}`   |
//!
//! A guarded write that matches no document lost a race with another
//! writer and is reported as [`PersistError::OptimisticLockConflict`].

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use docmap_types::{
    ClassMetadata, CommandResult, CompiledUpdate, ConcurrencyToken, FieldKind, FieldMapping,
    Filter, MappingError, ScalarType, Value, VersionScheme,
};

use crate::coercer;
use crate::error::PersistError;
use crate::metadata::MetadataProvider;
use crate::unit_of_work::ManagedDocument;

/// Which guards are active for one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// The class has neither a version nor a lock field.
    Unguarded,
    /// Only the version field guards the write.
    VersionGuarded,
    /// Only the lock field guards the write.
    LockGuarded,
    /// Both guards are active and compose.
    VersionAndLockGuarded,
}

/// Version token of one write attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionGuard {
    /// Field name and the value read at load time.
    pub token: ConcurrencyToken,
    /// Stored name of the version field.
    pub path: String,
    /// Declared type of the version field.
    pub ty: ScalarType,
    /// How the next version is produced.
    pub scheme: VersionScheme,
    /// Version written by this attempt.
    pub next: Value,
}

/// Lock state of one write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    /// Stored name of the lock field.
    pub path: String,
    /// Whether the document is currently locked by this writer.
    pub locked: bool,
}

/// Version and lock guards derived from a document's loaded state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimisticConcurrencyGuard {
    version: Option<VersionGuard>,
    lock: Option<LockGuard>,
}

impl OptimisticConcurrencyGuard {
    /// A guard that changes nothing.
    pub const fn unguarded() -> Self {
        Self {
            version: None,
            lock: None,
        }
    }

    /// Read the guards of `document`, producing the next version for `now`.
    ///
    /// The version and lock fields are looked up through `metadata`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Mapping`] for a version field of unsupported
    /// type, or [`PersistError::TypeConversion`] if the integer version
    /// cannot be advanced.
    pub fn for_document(
        metadata: &dyn MetadataProvider,
        class: &ClassMetadata,
        document: &ManagedDocument,
        now: DateTime<Utc>,
    ) -> Result<Self, PersistError> {
        let version = metadata
            .version_field(&class.name)
            .map(|mapping| version_guard(class, mapping, document, now))
            .transpose()?;

        let lock = metadata.lock_field(&class.name).map(|mapping| LockGuard {
            path: mapping.name.clone(),
            locked: is_locked(document.value(&mapping.field_name)),
        });

        Ok(Self { version, lock })
    }

    /// Active guards.
    pub const fn state(&self) -> GuardState {
        match (&self.version, &self.lock) {
            (None, None) => GuardState::Unguarded,
            (Some(_), None) => GuardState::VersionGuarded,
            (None, Some(_)) => GuardState::LockGuarded,
            (Some(_), Some(_)) => GuardState::VersionAndLockGuarded,
        }
    }

    /// Whether a zero-match result means a conflict.
    pub const fn is_guarded(&self) -> bool {
        !matches!(self.state(), GuardState::Unguarded)
    }

    /// Version guard, if the class is versioned.
    pub const fn version(&self) -> Option<&VersionGuard> {
        self.version.as_ref()
    }

    /// Lock guard, if the class is lockable.
    pub const fn lock(&self) -> Option<&LockGuard> {
        self.lock.as_ref()
    }

    /// Fold every guard into a filter and update.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::TypeConversion`] if a version value cannot
    /// be stored.
    pub fn apply(&self, filter: &mut Filter, update: &mut CompiledUpdate) -> Result<(), PersistError> {
        if let Some(version) = &self.version {
            self.version_filter(filter)?;
            let replaced = match version.scheme {
                VersionScheme::Integer => update.inc(version.path.clone(), JsonValue::from(1)),
                VersionScheme::Timestamp => update.set(
                    version.path.clone(),
                    coercer::convert(version.ty, &version.next, &version.path)?,
                ),
            };
            if let Some(previous) = replaced {
                tracing::warn!(
                    path = %version.path,
                    previous = %previous,
                    "Version field was changed directly; the guard overrides it"
                );
            }
        }

        if let Some(lock) = &self.lock {
            if lock.locked {
                update.unset(lock.path.clone());
            } else {
                filter.require_absent(lock.path.clone());
            }
        }
        Ok(())
    }

    /// Require the loaded version only, without advancing it.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::TypeConversion`] if the loaded version cannot
    /// be stored.
    pub fn version_filter(&self, filter: &mut Filter) -> Result<(), PersistError> {
        if let Some(version) = &self.version {
            let expected = coercer::convert(version.ty, &version.token.expected, &version.path)?;
            filter.insert(version.path.clone(), expected);
        }
        Ok(())
    }

    /// Classify the outcome of a guarded write.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::OptimisticLockConflict`] if the write was
    /// guarded and matched nothing.
    pub fn classify(
        &self,
        result: &CommandResult,
        class: &str,
        id: &JsonValue,
    ) -> Result<(), PersistError> {
        if self.is_guarded() && result.matched_count == 0 {
            tracing::debug!(class, id = %id, state = ?self.state(), "Guarded write matched nothing");
            return Err(PersistError::OptimisticLockConflict {
                class: class.to_owned(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

/// Version value written when a document is first stored.
pub fn initial_version(scheme: VersionScheme, now: DateTime<Utc>) -> Value {
    match scheme {
        VersionScheme::Integer => Value::Int(1),
        VersionScheme::Timestamp => Value::Timestamp(now),
    }
}

/// Declared scalar type and version scheme of a version field.
///
/// # Errors
///
/// Returns [`MappingError::InvalidVersionType`] for unsupported types.
pub fn version_scheme(
    class: &ClassMetadata,
    mapping: &FieldMapping,
) -> Result<(ScalarType, VersionScheme), MappingError> {
    let ty = match mapping.kind {
        FieldKind::Scalar(ty) | FieldKind::Increment(ty) => ty,
        _ => ScalarType::Raw,
    };
    VersionScheme::for_type(ty)
        .map(|scheme| (ty, scheme))
        .ok_or_else(|| MappingError::InvalidVersionType {
            class: class.name.clone(),
            field: mapping.field_name.clone(),
            ty,
        })
}

fn version_guard(
    class: &ClassMetadata,
    mapping: &FieldMapping,
    document: &ManagedDocument,
    now: DateTime<Utc>,
) -> Result<VersionGuard, PersistError> {
    let (ty, scheme) = version_scheme(class, mapping)?;
    let expected = document.value(&mapping.field_name).clone();
    let next = match (scheme, &expected) {
        (VersionScheme::Integer, Value::Null) => Value::Int(1),
        (VersionScheme::Integer, Value::Int(current)) => {
            current
                .checked_add(1)
                .map(Value::Int)
                .ok_or_else(|| PersistError::TypeConversion {
                    path: mapping.name.clone(),
                    expected: ty,
                    found: "out-of-range int",
                })?
        }
        (VersionScheme::Integer, other) => {
            return Err(PersistError::TypeConversion {
                path: mapping.name.clone(),
                expected: ty,
                found: other.kind_name(),
            });
        }
        (VersionScheme::Timestamp, _) => Value::Timestamp(now),
    };

    Ok(VersionGuard {
        token: ConcurrencyToken {
            field: mapping.field_name.clone(),
            expected,
        },
        path: mapping.name.clone(),
        ty,
        scheme,
        next,
    })
}

const fn is_locked(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false) | Value::Int(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataRegistry;
    use docmap_types::UpdateOperator;
    use serde_json::json;

    fn article() -> ClassMetadata {
        ClassMetadata::document("Article", "articles")
            .field(FieldMapping::id("id"))
            .field(FieldMapping::scalar("version", ScalarType::Int))
            .field(FieldMapping::scalar("locked", ScalarType::Bool))
            .versioned_by("version")
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    fn guard_for(class: &ClassMetadata, document: &ManagedDocument) -> OptimisticConcurrencyGuard {
        let registry = MetadataRegistry::new().with(class.clone()).unwrap_or_default();
        OptimisticConcurrencyGuard::for_document(&registry, class, document, now()).unwrap_or_default()
    }

    /// Registry that turns optimistic locking off for every class.
    struct Unversioned(MetadataRegistry);

    impl MetadataProvider for Unversioned {
        fn class_metadata(&self, class: &str) -> Option<&ClassMetadata> {
            self.0.class_metadata(class)
        }

        fn version_field(&self, _class: &str) -> Option<&FieldMapping> {
            None
        }
    }

    #[test]
    fn integer_version_filters_and_increments() {
        let doc = ManagedDocument::new("Article").with("version", 5_i64);
        let guard = guard_for(&article(), &doc);
        assert_eq!(guard.state(), GuardState::VersionGuarded);
        assert_eq!(guard.version().map(|v| &v.next), Some(&Value::Int(6)));

        let mut filter = Filter::by_id("_id", json!("a1"));
        let mut update = CompiledUpdate::new();
        update.set("title", json!("t"));
        assert!(guard.apply(&mut filter, &mut update).is_ok());

        assert_eq!(filter.to_document(), json!({"_id": "a1", "version": 5}));
        assert_eq!(
            update.to_document(),
            json!({"$inc": {"version": 1}, "$set": {"title": "t"}})
        );
    }

    #[test]
    fn timestamp_version_sets_the_write_time() {
        let class = ClassMetadata::document("Article", "articles")
            .field(FieldMapping::scalar("updated", ScalarType::Timestamp))
            .versioned_by("updated");
        let loaded = DateTime::from_timestamp(1_600_000_000, 0).unwrap_or_default();
        let doc = ManagedDocument::new("Article").with("updated", loaded);
        let guard = guard_for(&class, &doc);

        let mut filter = Filter::new();
        let mut update = CompiledUpdate::new();
        assert!(guard.apply(&mut filter, &mut update).is_ok());

        assert_eq!(
            filter.to_document(),
            json!({"updated": {"$date": {"$numberLong": "1600000000000"}}})
        );
        assert_eq!(
            update.to_document(),
            json!({"$set": {"updated": {"$date": {"$numberLong": "1700000000000"}}}})
        );
    }

    #[test]
    fn lock_guard_releases_or_requires_absence() {
        let class = article().lockable_by("locked");
        let unlocked = ManagedDocument::new("Article").with("version", 1_i64);
        let locked = unlocked.clone().with("locked", true);

        let guard = guard_for(&class, &unlocked);
        assert_eq!(guard.state(), GuardState::VersionAndLockGuarded);
        let mut filter = Filter::new();
        let mut update = CompiledUpdate::new();
        assert!(guard.apply(&mut filter, &mut update).is_ok());
        assert_eq!(filter.get("locked"), Some(&json!({"$exists": false})));
        assert!(update.get(UpdateOperator::Unset, "locked").is_none());

        let guard = guard_for(&class, &locked);
        let mut filter = Filter::new();
        let mut update = CompiledUpdate::new();
        assert!(guard.apply(&mut filter, &mut update).is_ok());
        assert!(filter.get("locked").is_none());
        assert_eq!(update.get(UpdateOperator::Unset, "locked"), Some(&json!(true)));
    }

    #[test]
    fn zero_match_on_guarded_write_is_a_conflict() {
        let doc = ManagedDocument::new("Article").with("version", 5_i64);
        let guard = guard_for(&article(), &doc);
        let missed = CommandResult::default();
        let hit = CommandResult {
            matched_count: 1,
            modified_count: 1,
            upserted_id: None,
        };

        let conflict = guard.classify(&missed, "Article", &json!("a1"));
        assert!(conflict.as_ref().is_err_and(PersistError::is_retryable));
        assert!(guard.classify(&hit, "Article", &json!("a1")).is_ok());
        assert!(
            OptimisticConcurrencyGuard::unguarded()
                .classify(&missed, "Article", &json!("a1"))
                .is_ok()
        );
    }

    #[test]
    fn initial_versions() {
        assert_eq!(initial_version(VersionScheme::Integer, now()), Value::Int(1));
        assert_eq!(
            initial_version(VersionScheme::Timestamp, now()),
            Value::Timestamp(now())
        );
    }

    #[test]
    fn guards_follow_the_metadata_provider() {
        let class = article().lockable_by("locked");
        let provider = Unversioned(MetadataRegistry::new().with(class.clone()).unwrap_or_default());
        let doc = ManagedDocument::new("Article").with("version", 5_i64);

        let guard = OptimisticConcurrencyGuard::for_document(&provider, &class, &doc, now()).unwrap_or_default();
        assert_eq!(guard.state(), GuardState::LockGuarded);
        assert!(guard.version().is_none());
    }
}

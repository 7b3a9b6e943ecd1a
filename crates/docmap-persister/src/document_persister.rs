//! Document persister: executes compiled writes and records their outcome.
//!
//! The persister compiles through [`PersistenceBuilder`] and
//! [`CollectionPersister`], hands each command to a [`CommandExecutor`], and
//! only touches the unit of work once the store confirmed the write.
//!
//! # Flush order
//!
//! ```text
//! flush
//!   |
//!   +-- insert()   new top-level documents, embedded content included
//!   +-- upsert()   documents with a known identifier, maybe stored
//!   +-- update()   stored documents with changes
//!         |
//!         +-- guarded owner update         --> version advanced, changes committed
//!         +-- collection commands, in order, filtered by the new version
//!               each collection's schedule cleared once its commands applied
//! ```
//!
//! Nothing is rolled back: a failure leaves earlier commands applied and
//! only the work that did not reach the store pending.

use chrono::{DateTime, Utc};

use docmap_types::{CollectionStrategy, CommandExecutor, DocumentKey, ExecutorError, UpdateOperator};

use crate::builder::{CompiledWrite, PersistenceBuilder, empty_upsert_fallback};
use crate::collection_persister::CollectionPersister;
use crate::config::PersisterConfig;
use crate::context::PersistContext;
use crate::error::PersistError;
use crate::metadata::MetadataProvider;
use crate::unit_of_work::{ChangeSetProvider, UnitOfWork};

/// A collection field of one document in a flushed subtree.
type ScheduledCollection = (DocumentKey, String);

/// Source of the current time for timestamp versions.
pub type Clock = fn() -> DateTime<Utc>;

/// Counts of what one flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Documents inserted.
    pub inserted: usize,
    /// Documents upserted.
    pub upserted: usize,
    /// Documents whose owner update was sent.
    pub updated: usize,
    /// Collection commands sent.
    pub collection_commands: usize,
}

/// Writes managed documents through a command executor.
pub struct DocumentPersister<'a, E> {
    metadata: &'a dyn MetadataProvider,
    config: &'a PersisterConfig,
    executor: E,
    clock: Clock,
}

impl<'a, E: CommandExecutor> DocumentPersister<'a, E> {
    /// Create a persister writing through `executor`.
    pub const fn new(metadata: &'a dyn MetadataProvider, config: &'a PersisterConfig, executor: E) -> Self {
        Self {
            metadata,
            config,
            executor,
            clock: Utc::now,
        }
    }

    /// Use a different clock for timestamp versions.
    #[must_use]
    pub const fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The executor.
    pub const fn executor(&self) -> &E {
        &self.executor
    }

    /// Give back the executor.
    pub fn into_executor(self) -> E {
        self.executor
    }

    /// Write every pending insert, upsert, and update of the unit of work.
    ///
    /// # Errors
    ///
    /// Stops at the first failing document and returns its error.
    pub fn flush(&mut self, uow: &mut UnitOfWork) -> Result<FlushReport, PersistError> {
        let mut report = FlushReport::default();

        for key in uow.pending_inserts() {
            self.insert(uow, key)?;
            report.inserted = report.inserted.saturating_add(1);
        }

        for key in uow.pending_upserts() {
            self.upsert(uow, key)?;
            report.upserted = report.upserted.saturating_add(1);
        }

        for key in uow.pending_updates() {
            let outcome = self.update(uow, key)?;
            if outcome.owner_updated {
                report.updated = report.updated.saturating_add(1);
            }
            report.collection_commands = report
                .collection_commands
                .saturating_add(outcome.collection_commands);
        }

        tracing::info!(
            inserted = report.inserted,
            upserted = report.upserted,
            updated = report.updated,
            collection_commands = report.collection_commands,
            "Flushed unit of work"
        );
        Ok(report)
    }

    /// Insert a new top-level document with everything embedded in it.
    ///
    /// A generated identifier and the initial version are recorded on the
    /// document after the insert succeeds.
    ///
    /// # Errors
    ///
    /// Returns compilation errors, or [`PersistError::Executor`] if the
    /// store rejects the insert.
    pub fn insert(&mut self, uow: &mut UnitOfWork, key: DocumentKey) -> Result<(), PersistError> {
        let now = (self.clock)();
        let compiled = PersistenceBuilder::new(self.context(uow)).compile_insert(key, now)?;

        self.executor.insert(&compiled.command)?;

        if let Some(generated) = compiled.generated_identifier {
            uow.assign_identifier(key, generated)?;
        }
        if let Some((field, version)) = compiled.version {
            uow.set_field(key, &field, version)?;
        }
        uow.commit(key);

        tracing::debug!(
            collection = %compiled.command.collection,
            id = %compiled.identifier,
            "Inserted document"
        );
        Ok(())
    }

    /// Send the guarded update of a stored document, then synchronize its
    /// scheduled collections.
    ///
    /// An empty update is skipped. The in-memory version is advanced only
    /// after the store confirmed the update, and collection commands are
    /// filtered by that new version. Field changes are committed as soon as
    /// the owner update is confirmed and each collection schedule once its
    /// commands are applied, so a retried flush resumes where this one
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::OptimisticLockConflict`] when a guarded
    /// command matched nothing, compilation errors, or the executor's error.
    pub fn update(&mut self, uow: &mut UnitOfWork, key: DocumentKey) -> Result<UpdateOutcome, PersistError> {
        let now = (self.clock)();
        let write = PersistenceBuilder::new(self.context(uow)).compile_update(key, now)?;
        let class = uow.require_document(key)?.class.clone();
        let (atomic, element_wise) = self.scheduled_collections(uow, key)?;

        let owner_updated = !write.is_empty();
        if owner_updated {
            let result = self.executor.update(&write.command)?;
            write.guard.classify(&result, &class, &write.identifier)?;
            if let Some((field, version)) = write.version {
                uow.set_field(key, &field, version)?;
            }
        } else {
            tracing::trace!(class = %class, id = %write.identifier, "Nothing to update");
        }
        uow.commit_changes(key);
        for (owner, field) in &atomic {
            uow.complete_collection(*owner, field);
        }

        let mut collection_commands: usize = 0;
        for (owner, field) in &element_wise {
            let writes = CollectionPersister::new(self.context(uow)).compile(*owner, field, now)?;
            for pending in &writes {
                let applied = CollectionPersister::execute(&mut self.executor, core::slice::from_ref(pending))?;
                collection_commands = collection_commands.saturating_add(applied);
                if pending.command.update.operator(UpdateOperator::Pull).is_some() {
                    uow.removals_applied(*owner, field);
                }
            }
            uow.complete_collection(*owner, field);
        }

        uow.commit(key);

        tracing::debug!(
            class = %class,
            id = %write.identifier,
            owner_updated,
            collection_commands,
            "Updated document"
        );
        Ok(UpdateOutcome {
            owner_updated,
            collection_commands,
        })
    }

    /// Upsert a document with a known identifier.
    ///
    /// When only the identifier is left to write and the store rejects the
    /// identifier no-op, the upsert is retried once with an empty `$set`
    /// (if enabled).
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::IllegalEmptyUpdate`] if every form of an
    /// identifier-only upsert is rejected, compilation errors, or the
    /// executor's error.
    pub fn upsert(&mut self, uow: &mut UnitOfWork, key: DocumentKey) -> Result<(), PersistError> {
        let now = (self.clock)();
        let write = PersistenceBuilder::new(self.context(uow)).compile_upsert(key, now)?;
        let class = uow.require_document(key)?.class.clone();

        self.send_upsert(&class, &write)?;

        if let Some((field, version)) = write.version {
            uow.set_field(key, &field, version)?;
        }
        uow.commit(key);

        tracing::debug!(class = %class, id = %write.identifier, "Upserted document");
        Ok(())
    }

    fn send_upsert(&mut self, class: &str, write: &CompiledWrite) -> Result<(), PersistError> {
        let rejection = match self.executor.update(&write.command) {
            Ok(_) => return Ok(()),
            Err(err) if !write.identifier_only => return Err(err.into()),
            Err(err) => err,
        };

        let illegal = |source: ExecutorError| PersistError::IllegalEmptyUpdate {
            class: class.to_owned(),
            id: write.identifier.to_string(),
            source,
        };

        let retryable = matches!(
            rejection,
            ExecutorError::IdentifierModification { .. } | ExecutorError::EmptyUpdate
        );
        if !retryable || !self.config.upsert_empty_set_fallback {
            return Err(illegal(rejection));
        }

        tracing::warn!(
            class,
            id = %write.identifier,
            error = %rejection,
            "Identifier-only upsert rejected, retrying with an empty $set"
        );
        self.executor
            .update(&empty_upsert_fallback(write))
            .map(drop)
            .map_err(illegal)
    }

    /// Collections scheduled in the subtree of `root`, split into those
    /// written with their owner and those synchronized element-wise.
    fn scheduled_collections(
        &self,
        uow: &UnitOfWork,
        root: DocumentKey,
    ) -> Result<(Vec<ScheduledCollection>, Vec<ScheduledCollection>), PersistError> {
        let mut atomic = Vec::new();
        let mut element_wise = Vec::new();

        for owner in uow.subtree_of(root) {
            let class = self.metadata.require_class(&uow.require_document(owner)?.class)?;
            for (field, _) in uow.scheduled_collections(owner) {
                let is_atomic = class
                    .field_mapping(&field)
                    .and_then(|mapping| self.metadata.collection_strategy(mapping))
                    .is_some_and(CollectionStrategy::is_atomic);
                if is_atomic {
                    atomic.push((owner, field));
                } else {
                    element_wise.push((owner, field));
                }
            }
        }
        Ok((atomic, element_wise))
    }

    fn context<'s>(&'s self, uow: &'s UnitOfWork) -> PersistContext<'s> {
        PersistContext::new(self.metadata, uow, self.config)
    }
}

impl<E> core::fmt::Debug for DocumentPersister<'_, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DocumentPersister")
            .field("config", self.config)
            .finish_non_exhaustive()
    }
}

/// What one document update sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Whether the owner update was sent.
    pub owner_updated: bool,
    /// Collection commands sent.
    pub collection_commands: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use crate::unit_of_work::ManagedDocument;
    use docmap_types::{CommandResult, InsertCommand, UpdateCommand, Value};
    use serde_json::{Value as JsonValue, json};

    /// Records commands and answers updates from a script.
    #[derive(Default)]
    struct Recorder {
        inserts: Vec<JsonValue>,
        updates: Vec<(JsonValue, JsonValue)>,
        matched: u64,
        reject_identifier_noop: bool,
        reject_empty: bool,
    }

    impl CommandExecutor for Recorder {
        fn insert(&mut self, command: &InsertCommand) -> Result<CommandResult, ExecutorError> {
            self.inserts.push(JsonValue::Object(command.document.clone()));
            Ok(CommandResult::default())
        }

        fn update(&mut self, command: &UpdateCommand) -> Result<CommandResult, ExecutorError> {
            let update = command.update.to_document();
            self.updates.push((command.filter.to_document(), update.clone()));
            if self.reject_identifier_noop && update.pointer("/$set/_id").is_some() {
                return Err(ExecutorError::IdentifierModification {
                    field: "_id".to_owned(),
                });
            }
            if self.reject_empty && update == json!({"$set": {}}) {
                return Err(ExecutorError::EmptyUpdate);
            }
            Ok(CommandResult {
                matched_count: self.matched,
                modified_count: self.matched,
                upserted_id: None,
            })
        }
    }

    fn fixed_clock() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    #[test]
    fn insert_records_generated_identifier_and_version() {
        let mut fx = Fixture::new();
        let article = fx.pending(ManagedDocument::new("Article").with("title", "t"));

        let mut persister = DocumentPersister::new(&fx.metadata, &fx.config, Recorder::default())
            .with_clock(fixed_clock);
        assert!(persister.insert(&mut fx.uow, article).is_ok());

        let document = fx.uow.document(article);
        assert!(document.and_then(ManagedDocument::identifier).is_some());
        assert_eq!(document.map(|d| d.value("version")), Some(&Value::Int(1)));
        assert!(!fx.uow.is_scheduled_for_insert(article));
        assert_eq!(persister.executor().inserts.len(), 1);
    }

    #[test]
    fn successful_update_advances_the_version() {
        let mut fx = Fixture::new();
        let article = fx.loaded(
            ManagedDocument::new("Article")
                .with_identifier("a1")
                .with("version", 5_i64),
        );
        fx.change(article, "title", "new");

        let executor = Recorder {
            matched: 1,
            ..Recorder::default()
        };
        let mut persister = DocumentPersister::new(&fx.metadata, &fx.config, executor);
        let outcome = persister.update(&mut fx.uow, article);

        assert_eq!(
            outcome.ok(),
            Some(UpdateOutcome {
                owner_updated: true,
                collection_commands: 0,
            })
        );
        assert_eq!(
            fx.uow.document(article).map(|d| d.value("version")),
            Some(&Value::Int(6))
        );
        assert!(fx.uow.change_set(article).is_none());
    }

    #[test]
    fn conflicting_update_keeps_version_and_changes() {
        let mut fx = Fixture::new();
        let article = fx.loaded(
            ManagedDocument::new("Article")
                .with_identifier("a1")
                .with("version", 5_i64),
        );
        fx.change(article, "title", "new");

        let mut persister = DocumentPersister::new(&fx.metadata, &fx.config, Recorder::default());
        let outcome = persister.update(&mut fx.uow, article);

        assert!(matches!(outcome, Err(PersistError::OptimisticLockConflict { .. })));
        assert!(outcome.is_err_and(|e| e.is_retryable()));
        assert_eq!(
            fx.uow.document(article).map(|d| d.value("version")),
            Some(&Value::Int(5))
        );
        assert!(fx.uow.change_set(article).is_some());
    }

    #[test]
    fn empty_update_sends_nothing() {
        let mut fx = Fixture::new();
        let user = fx.loaded(fx.user("u1"));

        let mut persister = DocumentPersister::new(&fx.metadata, &fx.config, Recorder::default());
        let outcome = persister.update(&mut fx.uow, user);

        assert_eq!(outcome.ok(), Some(UpdateOutcome::default()));
        assert!(persister.executor().updates.is_empty());
    }

    #[test]
    fn rejected_identifier_noop_is_retried_with_empty_set() {
        let mut fx = Fixture::new();
        let tag = fx.uow.register_upsert(fx.tag("t1"));

        let executor = Recorder {
            reject_identifier_noop: true,
            ..Recorder::default()
        };
        let mut persister = DocumentPersister::new(&fx.metadata, &fx.config, executor);
        assert!(persister.upsert(&mut fx.uow, tag).is_ok());

        let sent: Vec<JsonValue> = persister
            .executor()
            .updates
            .iter()
            .map(|(_, update)| update.clone())
            .collect();
        assert_eq!(sent, vec![json!({"$set": {"_id": "t1"}}), json!({"$set": {}})]);
    }

    #[test]
    fn exhausted_fallback_is_an_illegal_empty_update() {
        let mut fx = Fixture::new();
        let tag = fx.uow.register_upsert(fx.tag("t1"));

        let executor = Recorder {
            reject_identifier_noop: true,
            reject_empty: true,
            ..Recorder::default()
        };
        let mut persister = DocumentPersister::new(&fx.metadata, &fx.config, executor);
        let result = persister.upsert(&mut fx.uow, tag);

        assert!(matches!(
            result,
            Err(PersistError::IllegalEmptyUpdate {
                source: ExecutorError::EmptyUpdate,
                ..
            })
        ));
    }

    #[test]
    fn disabled_fallback_fails_on_first_rejection() {
        let mut fx = Fixture::with_config(PersisterConfig {
            upsert_empty_set_fallback: false,
            ..PersisterConfig::default()
        });
        let tag = fx.uow.register_upsert(fx.tag("t1"));

        let executor = Recorder {
            reject_identifier_noop: true,
            ..Recorder::default()
        };
        let mut persister = DocumentPersister::new(&fx.metadata, &fx.config, executor);
        let result = persister.upsert(&mut fx.uow, tag);

        assert!(matches!(
            result,
            Err(PersistError::IllegalEmptyUpdate {
                source: ExecutorError::IdentifierModification { .. },
                ..
            })
        ));
        assert_eq!(persister.executor().updates.len(), 1);
    }

    #[test]
    fn flush_reports_what_was_written() {
        let mut fx = Fixture::new();
        let fresh = fx.pending(fx.user("u2").with("name", "new"));
        let stored = fx.loaded(fx.user("u1"));
        let tag = fx.loaded(fx.tag("t1"));
        fx.change(stored, "name", "renamed");
        fx.uow.schedule_collection_update(
            stored,
            "tags",
            docmap_types::CollectionDiff {
                inserted: vec![docmap_types::CollectionEntry::new(0, Value::Document(tag))],
                deleted: Vec::new(),
            },
        );

        let executor = Recorder {
            matched: 1,
            ..Recorder::default()
        };
        let mut persister = DocumentPersister::new(&fx.metadata, &fx.config, executor);
        let report = persister.flush(&mut fx.uow);

        assert_eq!(
            report.ok(),
            Some(FlushReport {
                inserted: 1,
                upserted: 0,
                updated: 1,
                collection_commands: 1,
            })
        );
        assert!(!fx.uow.is_scheduled_for_insert(fresh));
        assert_eq!(
            persister.executor().updates,
            vec![
                (json!({"_id": "u1"}), json!({"$set": {"name": "renamed"}})),
                (json!({"_id": "u1"}), json!({"$addToSet": {"tags": "t1"}})),
            ]
        );
    }
}

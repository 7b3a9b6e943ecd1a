//! Read-only collaborators shared by every compilation step.

use crate::config::PersisterConfig;
use crate::metadata::MetadataProvider;
use crate::unit_of_work::ChangeSetProvider;

/// Borrowed view of metadata, tracked documents, and settings.
///
/// Compilation never mutates any of these, so one context can be copied
/// freely into each nested step of a compile call.
#[derive(Clone, Copy)]
pub struct PersistContext<'a> {
    /// Structural answers about mapped classes.
    pub metadata: &'a dyn MetadataProvider,
    /// Managed documents and their pending changes.
    pub documents: &'a dyn ChangeSetProvider,
    /// Compiler settings.
    pub config: &'a PersisterConfig,
}

impl<'a> PersistContext<'a> {
    /// Bundle the collaborators of one compile call.
    pub const fn new(
        metadata: &'a dyn MetadataProvider,
        documents: &'a dyn ChangeSetProvider,
        config: &'a PersisterConfig,
    ) -> Self {
        Self {
            metadata,
            documents,
            config,
        }
    }
}

impl core::fmt::Debug for PersistContext<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PersistContext")
            .field("config", self.config)
            .finish_non_exhaustive()
    }
}

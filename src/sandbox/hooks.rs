//! Host-trusted delegate hooks.
//!
//! A rule's script column may, instead of script text, hold a delegate
//! reference of the form `module:exportName`. The sandbox resolves it against
//! hook sets registered by the embedding application without ever entering the
//! untrusted script path. Delegates are trusted code but still run under the
//! same per-call time budgets as scripts, so the scheduler's containment
//! guarantees hold uniformly.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{DownloadedFile, Entry, FileDescriptor};

use super::RuleContext;

/// A host-registered pair of rule hooks
#[async_trait]
pub trait RuleHooks: Send + Sync {
    /// Decide whether a feed entry should be admitted for download
    async fn validate(&self, entry: &Entry, ctx: &RuleContext) -> Result<bool>;

    /// Classify a produced file; `None` leaves the file undescribed
    async fn describe(
        &self,
        entry: &Entry,
        file: &DownloadedFile,
        ctx: &RuleContext,
    ) -> Result<Option<FileDescriptor>>;
}

//! Change-data sources.
//!
//! The container consumes a source through two traits:
//! - [`ChangeSource::subscribe`] opens a cursor over one collection
//! - [`ChangeCursor::next`] pulls the next record, blocking up to a timeout
//!
//! A cursor is live once `subscribe` returns: every record written to the
//! collection afterwards is observable through it. Dropping the cursor
//! releases it.
//!
//! [`MemoryChangeSource`] is an in-process implementation that also acts as
//! the document store writing the changes.

mod memory;

pub use memory::{MemoryChangeSource, MemorySourceConfig};

use crate::error::Result;
use crate::filter::ChangeFilter;
use crate::types::{RawChangeRecord, ResumeToken};
use std::time::Duration;

/// Whether update records carry the post-image of the document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FullDocument {
    /// Updates carry only the update description.
    #[default]
    Default,
    /// Updates also carry the current full document.
    UpdateLookup,
}

/// Options for opening a cursor.
#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    /// Filter the source may apply before delivery. The container applies it
    /// again, so sources are free to ignore it.
    pub filter: ChangeFilter,

    /// Resume strictly after this token (None = live only).
    pub resume_after: Option<ResumeToken>,

    pub full_document: FullDocument,
}

/// Outcome of one cursor poll.
#[derive(Debug)]
pub enum CursorPoll {
    Record(RawChangeRecord),
    /// Nothing arrived within the timeout.
    Idle,
    /// The stream ended normally and will yield nothing more.
    EndOfStream,
}

/// Open cursor over a change stream. Owned by a single worker.
pub trait ChangeCursor: Send {
    /// Wait up to `timeout` for the next record.
    ///
    /// Errors are connection failures; the caller may reopen the cursor.
    fn next(&mut self, timeout: Duration) -> Result<CursorPoll>;

    /// Position of the cursor: reopening with `resume_after` set to this
    /// token continues exactly where this cursor stands.
    fn resume_token(&self) -> Option<ResumeToken> {
        None
    }
}

/// Source of change streams.
pub trait ChangeSource: Send + Sync {
    fn subscribe(
        &self,
        collection: &str,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn ChangeCursor>>;
}

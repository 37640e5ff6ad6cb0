//! The versioned edit history.
//!
//! Each history entry is an immutable snapshot of one operation instance at
//! one point in time; the stack plus its cursor fully determine the pipeline
//! contents. The stack itself is a plain value — the develop state wraps it
//! in the history mutex and every mutating call here happens under that lock.
//!
//! Appends coalesce: re-committing the tail entry with identical parameters,
//! mask set, and focus token updates it in place instead of growing the
//! stack. Truncating the redo tail preserves always-on operations and
//! entries whose module already occurs in the active prefix, so undoing past
//! them cannot silently change the image.

pub mod checkpoint;
pub mod entry;
pub mod stack;

pub use checkpoint::{CheckpointGate, CheckpointWindows};
pub use entry::{HistoryEntry, MaskForm, MaskKind};
pub use stack::{AppendRequest, HistoryStack, PopOutcome};

bitflags::bitflags! {
    /// What a history mutation requires of the pipelines. A superset of the
    /// reaction the pipeline change-flag machine implements: the develop
    /// controller maps these bits onto each pipeline's flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StackChange: u8 {
        /// Tail entry parameters changed; refresh the tail node only.
        const TOP_CHANGED = 1 << 0;
        /// Entry set changed but the module topology is identical.
        const SYNCH = 1 << 1;
        /// Module topology changed; nodes must be rebuilt.
        const REMOVE = 1 << 2;
    }
}

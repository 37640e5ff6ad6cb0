//! Unified error taxonomy for the develop engine.
//!
//! Every crate in the workspace reports failures through [`DevError`] so the
//! controller surface exposes one result type instead of a mix of sentinel
//! ints and booleans. `PipelineInterrupted` is internal control flow: it must
//! be consumed by the render loop (restart or clean exit) and never surfaced
//! to a caller.

use crate::ImageId;

pub type DevResult<T> = Result<T, DevError>;

#[derive(Debug, thiserror::Error)]
pub enum DevError {
    /// Unknown image id or unreadable raw. The pipeline goes `Dirty` and the
    /// invalid-image counter is bumped for UI messaging.
    #[error("invalid image {0}")]
    InvalidImage(ImageId),

    /// A render request was dropped because the scheduler queue was full. The
    /// next invalidation re-enqueues, so callers treat this as a soft failure.
    #[error("render queue saturated for {pipe}")]
    ScheduleSaturated { pipe: &'static str },

    /// A persisted history entry references an operation that is not
    /// installed. The entry is dropped; history continues.
    #[error("image {imgid}: operation `{op}` is not installed, entry dropped")]
    ModuleMismatch { imgid: ImageId, op: String },

    /// `legacy_params` refused a stored parameter record.
    #[error(
        "image {imgid}: `{op}` cannot migrate params from version {stored} to {current}, entry dropped"
    )]
    LegacyMigrationFailed {
        imgid: ImageId,
        op: String,
        stored: i32,
        current: i32,
    },

    /// Internal sentinel: a module observed the shutdown flag mid-run. Causes
    /// a render-loop restart or clean exit, never an error the caller sees.
    #[error("pipeline interrupted")]
    PipelineInterrupted,

    /// Autosave took too long; autosave is disabled for the session.
    #[error("autosave took {elapsed_ms} ms, disabled for this session")]
    AutosaveSlowDriveDetected { elapsed_ms: u64 },

    /// The catalog refused a write transaction. In-memory state is unchanged.
    #[error("catalog write refused: {0}")]
    PersistenceConflict(String),

    /// A module's processing entry point failed for a reason other than
    /// cooperative interruption. Fatal to the run, not to the process.
    #[error("operation `{op}` failed: {reason}")]
    ModuleProcessFailed { op: String, reason: String },

    /// Malformed persisted blob (sidecar, ordering list, parameter record).
    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
}

impl DevError {
    /// True when the error is the cooperative-interruption sentinel.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, DevError::PipelineInterrupted)
    }
}

//! The pixel pipeline: nodes, fingerprints, the intermediate-result cache,
//! and the render run loop.
//!
//! Three pipelines coexist per image — full, preview, secondary — with the
//! same semantics at different source resolutions. A run holds its
//! pipeline's state mutex for the whole duration; everything a concurrent
//! party may touch mid-run (shutdown, input timestamp, change flags, status)
//! lives outside that mutex in atomics or its own small lock.
//!
//! The run loop is an explicit state machine instead of label-and-goto:
//! every iteration re-reads the change flags and the leave flag, and a node
//! returning `Interrupted` either replans (the pipeline changed under us) or
//! exits invalid (the source is being replaced). A completed run publishes
//! the back-buffer and a `Valid` status only if no new change arrived while
//! it processed, so a stale frame is never presented as current.

pub mod cache;
pub mod fingerprint;
pub mod node;
pub mod pipe;
pub mod waithash;

pub use cache::{CacheEntry, PipelineCache};
pub use fingerprint::{combine, fold_node, node_self_hash, pipeline_fingerprint};
pub use node::{DevicePlacement, NodeSpec, node_specs, placement_for};
pub use pipe::{BackBuffer, Pipeline, RunCtx, RunOutcome, ViewportRequest};
pub use waithash::{HashWaitDirection, HashWaitOutcome, WaitHashConfig, wait_hash};

/// Which of the three per-image pipelines a value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeKind {
    /// Center view at full working resolution.
    Full,
    /// Whole-image downsampled navigation/scope source.
    Preview,
    /// Second darkroom window.
    Secondary,
}

impl PipeKind {
    pub const ALL: [PipeKind; 3] = [PipeKind::Full, PipeKind::Preview, PipeKind::Secondary];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipeKind::Full => "full",
            PipeKind::Preview => "preview",
            PipeKind::Secondary => "secondary",
        }
    }
}

/// Pipeline status word, readable without the state mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    /// No usable output; a run is required.
    Invalid,
    /// Source not ready or output outdated; the next trigger re-runs.
    Dirty,
    Running,
    Valid,
}

impl PipeStatus {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            PipeStatus::Invalid => 0,
            PipeStatus::Dirty => 1,
            PipeStatus::Running => 2,
            PipeStatus::Valid => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> PipeStatus {
        match v {
            1 => PipeStatus::Dirty,
            2 => PipeStatus::Running,
            3 => PipeStatus::Valid,
            _ => PipeStatus::Invalid,
        }
    }
}

bitflags::bitflags! {
    /// Change-flag bitset of a pipeline. Empty means unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChangeFlags: u8 {
        /// Tail history entry's parameters changed.
        const TOP_CHANGED = 1 << 0;
        /// Viewport / roi changed.
        const ZOOMED = 1 << 1;
        /// History topology changed, module set identical.
        const SYNCH = 1 << 2;
        /// Module set changed; tear down and rebuild nodes.
        const REMOVE = 1 << 3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_word_round_trips() {
        for s in [
            PipeStatus::Invalid,
            PipeStatus::Dirty,
            PipeStatus::Running,
            PipeStatus::Valid,
        ] {
            assert_eq!(PipeStatus::from_u8(s.to_u8()), s);
        }
    }

    #[test]
    fn unchanged_is_the_empty_set() {
        assert!(ChangeFlags::empty().is_empty());
        assert!(!(ChangeFlags::SYNCH | ChangeFlags::ZOOMED).is_empty());
    }
}

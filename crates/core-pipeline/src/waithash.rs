//! Hash-wait protocol.
//!
//! Geometric consumers (mask outlines, crop handles) need the pipeline to
//! have processed up to a given module before mapping coordinates through
//! it. They compute the expected pipeline hash at that point, then poll here
//! until the published chain matches, a relevant change flag proves the wait
//! pointless (the caller requests a reprocess instead), the shutdown flag
//! short-circuits, or the timeout expires.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::pipe::Pipeline;
use crate::ChangeFlags;

/// Which side of the module at `iop_order` the hash refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashWaitDirection {
    ForwardIncl,
    ForwardExcl,
    BackIncl,
    BackExcl,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitHashConfig {
    pub period: Duration,
    pub timeout: Duration,
}

impl Default for WaitHashConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(5),
            timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashWaitOutcome {
    /// The published hash matches the expectation.
    Match,
    /// A `TOP_CHANGED | SYNCH | REMOVE` flag was raised during the wait; the
    /// caller should trigger a reprocess and retry afterwards.
    ReprocessRequested,
    TimedOut,
    /// The pipeline is shutting down; abandon the query.
    Shutdown,
}

/// Poll until `pipe`'s published hash at (`iop_order`, `direction`) equals
/// `expected`. Never blocks the pipeline: reads only the published chain.
pub fn wait_hash(
    pipe: &Pipeline,
    iop_order: u32,
    direction: HashWaitDirection,
    expected: u64,
    cfg: WaitHashConfig,
) -> HashWaitOutcome {
    let deadline = Instant::now() + cfg.timeout;
    loop {
        if pipe.shutdown_requested() {
            return HashWaitOutcome::Shutdown;
        }
        if pipe
            .peek_change()
            .intersects(ChangeFlags::TOP_CHANGED | ChangeFlags::SYNCH | ChangeFlags::REMOVE)
        {
            trace!(target: "pipeline.waithash", pipe = pipe.kind.as_str(), "flags raised during wait");
            return HashWaitOutcome::ReprocessRequested;
        }
        if pipe.hash_at(iop_order, direction) == Some(expected) {
            return HashWaitOutcome::Match;
        }
        if Instant::now() >= deadline {
            return HashWaitOutcome::TimedOut;
        }
        std::thread::sleep(cfg.period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipeKind;

    fn cfg() -> WaitHashConfig {
        WaitHashConfig {
            period: Duration::from_millis(1),
            timeout: Duration::from_millis(20),
        }
    }

    #[test]
    fn unpublished_pipeline_times_out() {
        let pipe = Pipeline::new(PipeKind::Preview, 4);
        let out = wait_hash(&pipe, 0, HashWaitDirection::ForwardIncl, 1, cfg());
        assert_eq!(out, HashWaitOutcome::TimedOut);
    }

    #[test]
    fn raised_flag_requests_reprocess_instead_of_stale_match() {
        let pipe = Pipeline::new(PipeKind::Preview, 4);
        pipe.add_change(ChangeFlags::TOP_CHANGED);
        let out = wait_hash(&pipe, 0, HashWaitDirection::ForwardIncl, 1, cfg());
        assert_eq!(out, HashWaitOutcome::ReprocessRequested);
    }

    #[test]
    fn zoom_flag_alone_does_not_request_reprocess() {
        let pipe = Pipeline::new(PipeKind::Preview, 4);
        pipe.add_change(ChangeFlags::ZOOMED);
        let out = wait_hash(&pipe, 0, HashWaitDirection::ForwardIncl, 1, cfg());
        assert_eq!(out, HashWaitOutcome::TimedOut);
    }

    #[test]
    fn shutdown_short_circuits() {
        let pipe = Pipeline::new(PipeKind::Preview, 4);
        pipe.request_shutdown();
        let out = wait_hash(&pipe, 0, HashWaitDirection::ForwardIncl, 1, cfg());
        assert_eq!(out, HashWaitOutcome::Shutdown);
    }
}

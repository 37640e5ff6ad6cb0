//! Undo checkpoint coalescing.
//!
//! A checkpoint marks a point the user can undo back to. Successive edits
//! driven by the same widget (the opaque target token) inside the merge
//! window collapse into one checkpoint, so a slider drag undoes as a unit.
//! The review window bounds how long a single checkpoint may keep absorbing
//! edits regardless of cadence.

use std::time::{Duration, Instant};

use tracing::trace;

/// User-configurable coalescing windows, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointWindows {
    /// Maximum gap between two edits to the same target for them to merge.
    pub merge_same_secs: f32,
    /// Maximum total age of an open checkpoint before a new one opens.
    pub review_secs: f32,
}

impl Default for CheckpointWindows {
    fn default() -> Self {
        Self {
            merge_same_secs: 2.0,
            review_secs: 8.0,
        }
    }
}

/// Tracks the currently open checkpoint, if any.
#[derive(Debug, Default)]
pub struct CheckpointGate {
    current_target: Option<u64>,
    opened_at: Option<Instant>,
    last_edit_at: Option<Instant>,
}

impl CheckpointGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edit to `target` at `now`. Returns `true` when a new undo
    /// checkpoint must open (the edit does not merge into the current one).
    pub fn observe(&mut self, target: u64, now: Instant, windows: CheckpointWindows) -> bool {
        let merge = Duration::from_secs_f32(windows.merge_same_secs.max(0.0));
        let review = Duration::from_secs_f32(windows.review_secs.max(0.0));

        let merges = match (self.current_target, self.last_edit_at, self.opened_at) {
            (Some(t), Some(last), Some(opened)) => {
                t == target
                    && now.saturating_duration_since(last) <= merge
                    && now.saturating_duration_since(opened) <= review
            }
            _ => false,
        };

        if merges {
            self.last_edit_at = Some(now);
            trace!(target: "history.undo", token = target, "edit merged into open checkpoint");
            false
        } else {
            self.current_target = Some(target);
            self.opened_at = Some(now);
            self.last_edit_at = Some(now);
            trace!(target: "history.undo", token = target, "checkpoint opened");
            true
        }
    }

    /// Close the open checkpoint (mode change, image switch, explicit undo).
    pub fn reset(&mut self) {
        self.current_target = None;
        self.opened_at = None;
        self.last_edit_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: CheckpointWindows = CheckpointWindows {
        merge_same_secs: 2.0,
        review_secs: 8.0,
    };

    #[test]
    fn same_target_inside_window_merges() {
        let mut gate = CheckpointGate::new();
        let t0 = Instant::now();
        assert!(gate.observe(1, t0, W));
        assert!(!gate.observe(1, t0 + Duration::from_millis(500), W));
        assert!(!gate.observe(1, t0 + Duration::from_millis(900), W));
    }

    #[test]
    fn target_switch_opens_new_checkpoint() {
        let mut gate = CheckpointGate::new();
        let t0 = Instant::now();
        assert!(gate.observe(1, t0, W));
        assert!(gate.observe(2, t0 + Duration::from_millis(100), W));
    }

    #[test]
    fn merge_gap_expires() {
        let mut gate = CheckpointGate::new();
        let t0 = Instant::now();
        assert!(gate.observe(1, t0, W));
        assert!(gate.observe(1, t0 + Duration::from_secs(3), W));
    }

    #[test]
    fn review_window_caps_checkpoint_age() {
        let mut gate = CheckpointGate::new();
        let t0 = Instant::now();
        assert!(gate.observe(1, t0, W));
        // Keep editing every second; the ninth edit exceeds review_secs.
        let mut opened = 0;
        for i in 1..=9 {
            if gate.observe(1, t0 + Duration::from_secs(i), W) {
                opened += 1;
            }
        }
        assert_eq!(opened, 1, "exactly one re-open once the checkpoint ages out");
    }

    #[test]
    fn reset_forces_new_checkpoint() {
        let mut gate = CheckpointGate::new();
        let t0 = Instant::now();
        assert!(gate.observe(1, t0, W));
        gate.reset();
        assert!(gate.observe(1, t0 + Duration::from_millis(10), W));
    }
}

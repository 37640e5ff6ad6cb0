//! The history stack: append, truncate-then-append, pop-to replay.

use std::collections::BTreeSet;

use tracing::{debug, trace, warn};

use core_module::instance::InstanceList;
use core_module::{ModuleInstance, Registry};

use crate::StackChange;
use crate::entry::{HistoryEntry, MaskForm};

/// Parameters of one append call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendRequest<'a> {
    pub enable: bool,
    /// Force a new item even when the tail entry could be overwritten.
    pub new_item: bool,
    /// Record (and compare) the mask set.
    pub include_masks: bool,
    pub masks: Option<&'a [MaskForm]>,
    /// Opaque coalescing token supplied by the caller (widget identity).
    pub focus_hash: u64,
}

/// Result of a pop-to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopOutcome {
    pub change: StackChange,
    /// The set of mask forms referenced by the active prefix changed; the
    /// mask list UI must refresh.
    pub masks_changed: bool,
}

/// Ordered log of edit entries with a cursor. Indices `[0, history_end)` are
/// active; `[history_end, len)` are the redo tail.
#[derive(Debug, Clone, Default)]
pub struct HistoryStack {
    entries: Vec<HistoryEntry>,
    history_end: usize,
}

impl HistoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted parts. The cursor is clamped into bounds.
    pub fn from_parts(entries: Vec<HistoryEntry>, history_end: usize) -> Self {
        let history_end = history_end.min(entries.len());
        Self {
            entries,
            history_end,
        }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// The active prefix `[0, history_end)`.
    pub fn active(&self) -> &[HistoryEntry] {
        &self.entries[..self.history_end]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn history_end(&self) -> usize {
        self.history_end
    }

    pub fn set_cursor(&mut self, n: usize) {
        self.history_end = n.min(self.entries.len());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.history_end = 0;
    }

    /// Loader-side append: no truncation, no coalescing, cursor untouched.
    pub fn push_loaded(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    /// Drop obsolete entries above the cursor. Always-on operations and
    /// entries whose instance already occurs in the active prefix are
    /// preserved (re-activated); everything else in the tail is removed.
    /// Returns the number of preserved entries; the cursor advances by it.
    pub fn truncate_redo_tail(&mut self, registry: &Registry) -> usize {
        if self.history_end >= self.entries.len() {
            return 0;
        }
        let tail = self.entries.split_off(self.history_end);
        let dropped_total = tail.len();
        let mut preserved = 0usize;
        for e in tail {
            let always_on = registry
                .get(&e.op)
                .map(|o| o.descriptor().flags.is_always_on())
                .unwrap_or(false);
            let dup_earlier = self.entries[..self.history_end]
                .iter()
                .any(|p| p.key() == e.key());
            if always_on || dup_earlier {
                self.entries.push(e);
                preserved += 1;
            }
        }
        self.history_end += preserved;
        debug!(
            target: "history.stack",
            dropped = dropped_total - preserved,
            preserved,
            history_end = self.history_end,
            "redo tail truncated"
        );
        preserved
    }

    /// Append a snapshot of `instance`, coalescing into the tail entry when
    /// it carries the identical parameter bytes, mask set (when included),
    /// and focus token. Returns the pipeline reaction: `TOP_CHANGED` for the
    /// in-place update, `TOP_CHANGED | SYNCH` for a new item — changed
    /// parameter bytes always push a new item.
    pub fn append(
        &mut self,
        registry: &Registry,
        instance: &ModuleInstance,
        req: AppendRequest<'_>,
    ) -> StackChange {
        let masks = if req.include_masks { req.masks } else { None };
        let Some(entry) =
            HistoryEntry::snapshot(registry, instance, req.enable, masks, req.focus_hash)
        else {
            warn!(target: "history.stack", op = %instance.op, "append refused (not history-capable)");
            return StackChange::empty();
        };
        self.truncate_redo_tail(registry);

        if !req.new_item
            && let Some(last) = self.entries[..self.history_end].last()
            && last.replaceable_by(&entry, req.include_masks)
        {
            let idx = self.history_end - 1;
            self.entries[idx] = entry;
            trace!(
                target: "history.stack",
                op = %instance.op,
                multi_priority = instance.multi_priority,
                "tail entry coalesced"
            );
            return StackChange::TOP_CHANGED;
        }

        trace!(
            target: "history.stack",
            op = %instance.op,
            multi_priority = instance.multi_priority,
            num = self.entries.len(),
            "entry appended"
        );
        self.entries.push(entry);
        self.history_end = self.entries.len();
        StackChange::TOP_CHANGED | StackChange::SYNCH
    }

    /// Reset all instances to defaults, then replay entries `[0, n)` into
    /// them (parameters, blend parameters, enabled, labels, rank). Reports
    /// whether the resulting module topology still matches the one the
    /// caller's pipelines were built from.
    pub fn pop_to(
        &mut self,
        registry: &Registry,
        instances: &mut InstanceList,
        n: usize,
    ) -> PopOutcome {
        let n = n.min(self.entries.len());
        let topo_before = instances.topology_key();
        let masks_before = self.mask_ids_in_prefix(self.history_end);

        for m in instances.iter_mut() {
            m.reset_to_defaults(registry);
        }
        for e in &self.entries[..n] {
            match instances.find_or_create(registry, &e.op, e.multi_priority) {
                Some(m) => {
                    m.params = e.params.clone();
                    m.blend_params = e.blend_params.clone();
                    m.enabled = e.enabled;
                    m.multi_name = e.multi_name.clone();
                    m.multi_name_hand_edited = e.multi_name_hand_edited;
                    m.iop_order = e.iop_order;
                }
                None => {
                    warn!(target: "history.stack", op = %e.op, "replay skipped entry for unknown operation");
                }
            }
        }
        self.history_end = n;

        let masks_after = self.mask_ids_in_prefix(n);
        let topo_after = instances.topology_key();
        let change = if topo_after == topo_before {
            StackChange::SYNCH
        } else {
            StackChange::REMOVE
        };
        debug!(
            target: "history.stack",
            history_end = n,
            rebuild = (change == StackChange::REMOVE),
            "pop_to replayed"
        );
        PopOutcome {
            change,
            masks_changed: masks_before != masks_after,
        }
    }

    /// Most recent active entry for `op`, searching from the tail.
    pub fn find_last(&self, op: &str) -> Option<&HistoryEntry> {
        self.entries[..self.history_end]
            .iter()
            .rev()
            .find(|e| e.op == op)
    }

    fn mask_ids_in_prefix(&self, n: usize) -> BTreeSet<u64> {
        self.entries[..n.min(self.entries.len())]
            .iter()
            .flat_map(|e| e.masks.iter().map(|m| m.id))
            .collect()
    }
}

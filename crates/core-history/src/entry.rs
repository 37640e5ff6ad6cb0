//! History entries and mask forms.

use serde::{Deserialize, Serialize};

use core_module::{ModuleInstance, OpFlags, Registry};

/// Drawn-mask geometry kinds. The engine treats the point list as opaque;
/// only identity and deep-copy semantics matter here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskKind {
    Polygon,
    Gradient,
    Brush,
    Ellipse,
    Path,
}

/// A mask form referenced by id from history entries. Entries deep-copy the
/// form at snapshot time, so later edits to the live form never rewrite
/// history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskForm {
    pub id: u64,
    pub kind: MaskKind,
    pub points: Vec<(f32, f32)>,
}

/// Immutable snapshot of one operation instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub op: String,
    pub op_version: i32,
    pub multi_priority: u32,
    pub multi_name: String,
    pub multi_name_hand_edited: bool,
    pub enabled: bool,
    #[serde(with = "serde_bytes_vec")]
    pub params: Vec<u8>,
    #[serde(with = "serde_bytes_vec")]
    pub blend_params: Vec<u8>,
    pub blend_version: i32,
    /// Ordering rank at the time of append.
    pub iop_order: u32,
    pub masks: Vec<MaskForm>,
    /// Opaque caller token gating coalescing; see the append contract.
    pub focus_hash: u64,
}

impl HistoryEntry {
    /// Snapshot `instance` with the requested enable state. Force-enabled
    /// operations are recorded enabled regardless of the request.
    pub fn snapshot(
        registry: &Registry,
        instance: &ModuleInstance,
        enable: bool,
        masks: Option<&[MaskForm]>,
        focus_hash: u64,
    ) -> Option<Self> {
        let operation = registry.get(&instance.op)?;
        let d = operation.descriptor();
        if d.flags.contains(OpFlags::NO_HISTORY_STACK) {
            return None;
        }
        let enabled = enable || d.flags.is_force_enabled();
        Some(Self {
            op: instance.op.clone(),
            op_version: d.version,
            multi_priority: instance.multi_priority,
            multi_name: instance.multi_name.clone(),
            multi_name_hand_edited: instance.multi_name_hand_edited,
            enabled,
            params: instance.params.clone(),
            blend_params: instance.blend_params.clone(),
            blend_version: d.blend_version,
            iop_order: instance.iop_order,
            masks: masks.map(|m| m.to_vec()).unwrap_or_default(),
            focus_hash,
        })
    }

    /// Identity key of the instance this entry snapshots.
    pub fn key(&self) -> (&str, u32) {
        (&self.op, self.multi_priority)
    }

    /// True when `other` may overwrite this entry in place instead of
    /// becoming a new item: same instance, identical parameter and blend
    /// bytes, same focus token, and (when the append included masks) the
    /// same mask set. Differing parameter bytes always push a new entry;
    /// only a re-commit of the identical snapshot (enable toggles, label
    /// edits) coalesces.
    pub fn replaceable_by(&self, other: &HistoryEntry, include_masks: bool) -> bool {
        self.key() == other.key()
            && self.params == other.params
            && self.blend_params == other.blend_params
            && self.focus_hash == other.focus_hash
            && (!include_masks || self.masks == other.masks)
    }
}

/// Byte vectors serialize compactly (and symmetrically) as sequences; this
/// shim keeps the sidecar layout explicit rather than relying on serde's
/// default `Vec<u8>` representation varying by format.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_module::instance::InstanceList;

    #[test]
    fn snapshot_refuses_no_history_ops() {
        let reg = Registry::builtin();
        let list = InstanceList::from_registry(&reg);
        let gamma = list.find("gamma", 0).unwrap();
        assert!(HistoryEntry::snapshot(&reg, gamma, true, None, 0).is_none());
    }

    #[test]
    fn snapshot_force_enables_hidden_defaults() {
        let reg = Registry::builtin();
        let list = InstanceList::from_registry(&reg);
        let raw = list.find("rawprepare", 0).unwrap();
        let e = HistoryEntry::snapshot(&reg, raw, false, None, 0).unwrap();
        assert!(e.enabled, "rawprepare may never be recorded disabled");
    }

    #[test]
    fn replace_gate_requires_matching_focus_token() {
        let reg = Registry::builtin();
        let list = InstanceList::from_registry(&reg);
        let exp = list.find("exposure", 0).unwrap();
        let a = HistoryEntry::snapshot(&reg, exp, true, None, 11).unwrap();
        let b = HistoryEntry::snapshot(&reg, exp, true, None, 11).unwrap();
        let c = HistoryEntry::snapshot(&reg, exp, true, None, 12).unwrap();
        assert!(a.replaceable_by(&b, true));
        assert!(!a.replaceable_by(&c, true));
    }

    #[test]
    fn replace_gate_requires_identical_parameter_bytes() {
        let reg = Registry::builtin();
        let list = InstanceList::from_registry(&reg);
        let exp = list.find("exposure", 0).unwrap();
        let a = HistoryEntry::snapshot(&reg, exp, true, None, 0).unwrap();
        let mut b = HistoryEntry::snapshot(&reg, exp, true, None, 0).unwrap();
        assert!(a.replaceable_by(&b, true));
        b.params = vec![9; b.params.len()];
        assert!(!a.replaceable_by(&b, true), "changed params must not overwrite");
        let mut c = HistoryEntry::snapshot(&reg, exp, true, None, 0).unwrap();
        c.blend_params = vec![0; c.blend_params.len()];
        assert!(!a.replaceable_by(&c, true), "changed blend params must not overwrite");
    }

    #[test]
    fn replace_gate_checks_mask_set_when_included() {
        let reg = Registry::builtin();
        let list = InstanceList::from_registry(&reg);
        let exp = list.find("exposure", 0).unwrap();
        let form = MaskForm {
            id: 1,
            kind: MaskKind::Gradient,
            points: vec![(0.1, 0.2)],
        };
        let a = HistoryEntry::snapshot(&reg, exp, true, Some(&[form.clone()]), 0).unwrap();
        let b = HistoryEntry::snapshot(&reg, exp, true, None, 0).unwrap();
        assert!(!a.replaceable_by(&b, true));
        assert!(a.replaceable_by(&b, false), "mask set ignored when not included");
    }
}

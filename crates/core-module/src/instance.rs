//! Live module instances.
//!
//! One instance exists per (operation type, instance priority) in use by an
//! image. Instances own their current parameter bytes; the history stack
//! writes into them on replay and reads out of them on append. Reshaping the
//! list happens only during load/unload; parameter bytes are mutated only
//! under the history mutex.

use tracing::trace;

use crate::{OpFlags, Registry};

/// Runtime pairing of an operation type with per-instance state.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleInstance {
    pub op: String,
    /// Distinguishes duplicates of the same type. `ONE_INSTANCE` types are
    /// pinned to 0.
    pub multi_priority: u32,
    pub multi_name: String,
    pub multi_name_hand_edited: bool,
    pub enabled: bool,
    pub params: Vec<u8>,
    pub blend_params: Vec<u8>,
    /// Pipeline rank; seeded from the ordering list at load.
    pub iop_order: u32,
}

impl ModuleInstance {
    /// Fresh instance of `op` with the registry defaults.
    pub fn from_defaults(registry: &Registry, op: &str, multi_priority: u32) -> Option<Self> {
        let operation = registry.get(op)?;
        let d = operation.descriptor();
        let multi_priority = if d.flags.contains(OpFlags::ONE_INSTANCE) {
            0
        } else {
            multi_priority
        };
        Some(Self {
            op: d.op.to_string(),
            multi_priority,
            multi_name: String::new(),
            multi_name_hand_edited: false,
            enabled: d.flags.contains(OpFlags::DEFAULT_ENABLED),
            params: d.default_params.clone(),
            blend_params: d.default_blend_params.clone(),
            iop_order: 0,
        })
    }

    /// Reset parameters, blend parameters, and the enabled bit back to the
    /// registry defaults (used by history replay before applying a prefix).
    pub fn reset_to_defaults(&mut self, registry: &Registry) {
        if let Some(operation) = registry.get(&self.op) {
            let d = operation.descriptor();
            self.params = d.default_params.clone();
            self.blend_params = d.default_blend_params.clone();
            self.enabled = d.flags.contains(OpFlags::DEFAULT_ENABLED);
            trace!(target: "module.instance", op = %self.op, multi_priority = self.multi_priority, "reset_to_defaults");
        }
    }

    /// Identity key used by history entries and the ordering list.
    pub fn key(&self) -> (&str, u32) {
        (&self.op, self.multi_priority)
    }
}

/// The per-image instance list plus lookup helpers. Wraps a plain `Vec`; the
/// develop state decides when the list may be reshaped.
#[derive(Debug, Default, Clone)]
pub struct InstanceList {
    items: Vec<ModuleInstance>,
}

impl InstanceList {
    /// One instance per installed type, in registry iteration order.
    pub fn from_registry(registry: &Registry) -> Self {
        let items = registry
            .iter()
            .filter_map(|operation| {
                ModuleInstance::from_defaults(registry, operation.descriptor().op, 0)
            })
            .collect();
        Self { items }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleInstance> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ModuleInstance> {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, op: &str, multi_priority: u32) -> Option<&ModuleInstance> {
        self.items
            .iter()
            .find(|m| m.op == op && m.multi_priority == multi_priority)
    }

    pub fn find_mut(&mut self, op: &str, multi_priority: u32) -> Option<&mut ModuleInstance> {
        self.items
            .iter_mut()
            .find(|m| m.op == op && m.multi_priority == multi_priority)
    }

    /// Find the instance for a persisted row, creating it when the row names
    /// a duplicate that does not exist yet. `ONE_INSTANCE` types resolve to
    /// priority 0 regardless of the requested priority.
    pub fn find_or_create(
        &mut self,
        registry: &Registry,
        op: &str,
        multi_priority: u32,
    ) -> Option<&mut ModuleInstance> {
        let effective = registry
            .get(op)
            .map(|operation| {
                if operation.descriptor().flags.contains(OpFlags::ONE_INSTANCE) {
                    0
                } else {
                    multi_priority
                }
            })?;
        if self.find(op, effective).is_none() {
            let fresh = ModuleInstance::from_defaults(registry, op, effective)?;
            trace!(target: "module.instance", op, multi_priority = effective, "instantiate duplicate");
            self.items.push(fresh);
        }
        self.find_mut(op, effective)
    }

    /// Instances sorted by pipeline rank; the pipeline builds nodes in this
    /// order.
    pub fn sorted_by_order(&self) -> Vec<&ModuleInstance> {
        let mut v: Vec<&ModuleInstance> = self.items.iter().collect();
        v.sort_by_key(|m| m.iop_order);
        v
    }

    /// Topology key: the ordered (op, priority) sequence of enabled-capable
    /// instances. Two lists with equal keys need only a parameter refresh;
    /// differing keys force a node rebuild.
    pub fn topology_key(&self) -> Vec<(String, u32)> {
        self.sorted_by_order()
            .into_iter()
            .map(|m| (m.op.clone(), m.multi_priority))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn one_instance_priority_pinned_to_zero() {
        let reg = Registry::builtin();
        let m = ModuleInstance::from_defaults(&reg, "rawprepare", 5).unwrap();
        assert_eq!(m.multi_priority, 0);
    }

    #[test]
    fn find_or_create_materializes_duplicates() {
        let reg = Registry::builtin();
        let mut list = InstanceList::from_registry(&reg);
        let before = list.len();
        assert!(list.find("exposure", 1).is_none());
        let created = list.find_or_create(&reg, "exposure", 1).unwrap();
        assert_eq!(created.multi_priority, 1);
        assert_eq!(list.len(), before + 1);
        // Second resolve reuses the same instance.
        list.find_or_create(&reg, "exposure", 1).unwrap();
        assert_eq!(list.len(), before + 1);
    }

    #[test]
    fn unknown_op_resolves_to_none() {
        let reg = Registry::builtin();
        let mut list = InstanceList::from_registry(&reg);
        assert!(list.find_or_create(&reg, "vignette", 0).is_none());
    }
}

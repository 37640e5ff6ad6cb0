//! Pipeline node specs.
//!
//! A spec is a value snapshot of one module instance, taken under the
//! history mutex and handed to the run loop. The run owns its specs for the
//! whole iteration, so an edit landing mid-run can never shear a node's
//! parameters — the change flags make the loop re-snapshot instead.

use core_module::OpFlags;
use core_module::instance::InstanceList;
use core_module::Registry;

/// Where a node executes. The engine itself only ever schedules CPU work;
/// the variant exists as the placement seam for accelerator backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePlacement {
    Cpu,
    Accelerator,
}

/// Value snapshot of one instance, in pipeline rank order.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub op: String,
    pub op_version: i32,
    pub multi_priority: u32,
    pub iop_order: u32,
    pub enabled: bool,
    pub params: Vec<u8>,
    pub blend_params: Vec<u8>,
    pub placement: DevicePlacement,
}

impl NodeSpec {
    pub fn key(&self) -> (&str, u32) {
        (&self.op, self.multi_priority)
    }
}

/// Placement policy hook. Tiling-capable operations are the ones an
/// accelerator backend could take over; everything runs on the CPU until one
/// is wired in.
pub fn placement_for(_flags: OpFlags) -> DevicePlacement {
    DevicePlacement::Cpu
}

/// Snapshot the instance list into rank-ordered node specs. Every installed
/// instance becomes a node — disabled ones are carried (and fingerprinted)
/// so toggling an enable bit is a parameter-level change, not a topology
/// change.
pub fn node_specs(registry: &Registry, instances: &InstanceList) -> Vec<NodeSpec> {
    instances
        .sorted_by_order()
        .into_iter()
        .filter_map(|m| {
            let operation = registry.get(&m.op)?;
            let d = operation.descriptor();
            Some(NodeSpec {
                op: m.op.clone(),
                op_version: d.version,
                multi_priority: m.multi_priority,
                iop_order: m.iop_order,
                enabled: m.enabled,
                params: m.params.clone(),
                blend_params: m.blend_params.clone(),
                placement: placement_for(d.flags),
            })
        })
        .collect()
}

/// Topology of a spec list: the rank-ordered identity sequence.
pub fn topology(specs: &[NodeSpec]) -> Vec<(String, u32)> {
    specs
        .iter()
        .map(|s| (s.op.clone(), s.multi_priority))
        .collect()
}

//! Presets and the first-edit auto-apply resolver.
//!
//! A preset is a stored parameter set plus a selector over capture metadata.
//! When an image is opened for the first time (`AUTO_PRESETS_APPLIED` still
//! unset) the resolver collects every matching auto-apply preset, lets user
//! presets shadow built-ins per operation, ranks matches by selector
//! specificity, serializes conflicting multi-instance matches with
//! increasing instance priorities, and separately picks the ordering preset
//! (falling back to the workflow default). The store layer prepends the
//! result to persisted history and flips the flag in the same write.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use core_image::CaptureMeta;
use core_module::{OpFlags, Registry};
use core_order::{OrderList, Workflow};

pub mod matcher;

pub use matcher::selector_matches;

/// Operations a preset may name that are not pixel operations; the resolver
/// never auto-applies them as history entries.
pub const PSEUDO_OPS: [&str; 6] = [
    "ioporder",
    "metadata",
    "modulegroups",
    "export",
    "tagging",
    "collect",
];

/// One row of the preset store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub operation: String,
    pub op_version: i32,
    pub op_params: Vec<u8>,
    pub blendop_params: Vec<u8>,
    pub blendop_version: i32,
    pub enabled: bool,
    pub autoapply: bool,
    /// Write-protected presets ship with the application; user presets are
    /// writable and shadow built-ins on a per-operation basis.
    pub writeprotect: bool,
    pub model: String,
    pub maker: String,
    pub lens: String,
    pub iso_min: f32,
    pub iso_max: f32,
    pub exposure_min: f32,
    pub exposure_max: f32,
    pub aperture_min: f32,
    pub aperture_max: f32,
    pub focal_length_min: f32,
    pub focal_length_max: f32,
    /// Format mask restriction; 0 means any.
    pub format: u32,
    pub multi_name: String,
    pub multi_name_hand_edited: bool,
}

impl Preset {
    /// An unconstrained auto-apply preset; tests and the seed catalog narrow
    /// the fields they care about.
    pub fn auto(name: &str, operation: &str, op_version: i32, op_params: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            operation: operation.to_string(),
            op_version,
            op_params,
            blendop_params: Vec::new(),
            blendop_version: 0,
            enabled: true,
            autoapply: true,
            writeprotect: true,
            model: String::new(),
            maker: String::new(),
            lens: String::new(),
            iso_min: 0.0,
            iso_max: f32::MAX,
            exposure_min: 0.0,
            exposure_max: f32::MAX,
            aperture_min: 0.0,
            aperture_max: f32::MAX,
            focal_length_min: 0.0,
            focal_length_max: f32::MAX,
            format: 0,
            multi_name: String::new(),
            multi_name_hand_edited: false,
        }
    }

    /// Selector specificity: longer literal matches rank first.
    fn specificity(&self) -> usize {
        matcher::literal_len(&self.model)
            + matcher::literal_len(&self.maker)
            + matcher::literal_len(&self.lens)
    }
}

/// A preset the resolver decided to apply, with its assigned instance
/// priority.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedPreset {
    pub preset_name: String,
    pub operation: String,
    pub op_version: i32,
    pub op_params: Vec<u8>,
    pub blendop_params: Vec<u8>,
    pub blendop_version: i32,
    pub enabled: bool,
    pub multi_priority: u32,
    pub multi_name: String,
    pub multi_name_hand_edited: bool,
}

/// Select the pixel-operation presets to auto-apply for `meta`.
pub fn resolve_auto_presets(
    presets: &[Preset],
    meta: &CaptureMeta,
    registry: &Registry,
    workflow: Workflow,
) -> Vec<AppliedPreset> {
    let mut candidates: Vec<&Preset> = presets
        .iter()
        .filter(|p| p.autoapply)
        .filter(|p| !PSEUDO_OPS.contains(&p.operation.as_str()))
        .filter(|p| !(workflow == Workflow::SceneReferred && p.operation == "basecurve"))
        .filter(|p| registry.contains(&p.operation))
        .filter(|p| selector_matches(p, meta))
        .collect();

    // User presets shadow built-ins per operation.
    let user_ops: Vec<&str> = candidates
        .iter()
        .filter(|p| !p.writeprotect)
        .map(|p| p.operation.as_str())
        .collect();
    candidates.retain(|p| !p.writeprotect || !user_ops.contains(&p.operation.as_str()));

    // Specificity first, then name, for a stable order within each op.
    candidates.sort_by(|a, b| {
        a.operation
            .cmp(&b.operation)
            .then(b.specificity().cmp(&a.specificity()))
            .then(a.name.cmp(&b.name))
    });

    let mut out = Vec::new();
    let mut current_op: Option<&str> = None;
    let mut next_priority = 0u32;
    for p in candidates {
        if current_op != Some(p.operation.as_str()) {
            current_op = Some(p.operation.as_str());
            next_priority = 0;
        } else if registry
            .get(&p.operation)
            .map(|o| o.descriptor().flags.contains(OpFlags::ONE_INSTANCE))
            .unwrap_or(false)
        {
            // A single-instance op takes only its best match.
            trace!(target: "presets.resolve", preset = %p.name, op = %p.operation, "shadowed by more specific match");
            continue;
        }
        out.push(AppliedPreset {
            preset_name: p.name.clone(),
            operation: p.operation.clone(),
            op_version: p.op_version,
            op_params: p.op_params.clone(),
            blendop_params: p.blendop_params.clone(),
            blendop_version: p.blendop_version,
            enabled: p.enabled,
            multi_priority: next_priority,
            multi_name: p.multi_name.clone(),
            multi_name_hand_edited: p.multi_name_hand_edited,
        });
        next_priority += 1;
    }
    debug!(target: "presets.resolve", applied = out.len(), "auto presets resolved");
    out
}

/// Select the ordering for `meta`: the best matching auto-apply `ioporder`
/// preset, or the workflow default when none applies. The preset's
/// `op_params` carry a serialized ordering blob; a malformed blob falls back
/// to the default as well (logged).
pub fn resolve_order(presets: &[Preset], meta: &CaptureMeta, workflow: Workflow) -> OrderList {
    let mut matches: Vec<&Preset> = presets
        .iter()
        .filter(|p| p.autoapply && p.operation == "ioporder")
        .filter(|p| selector_matches(p, meta))
        .collect();
    matches.sort_by(|a, b| {
        // User presets first, then specificity.
        a.writeprotect
            .cmp(&b.writeprotect)
            .then(b.specificity().cmp(&a.specificity()))
            .then(a.name.cmp(&b.name))
    });
    for p in matches {
        match std::str::from_utf8(&p.op_params)
            .ok()
            .and_then(|blob| OrderList::from_blob(blob).ok())
        {
            Some(list) => {
                debug!(target: "presets.resolve", preset = %p.name, "ordering preset selected");
                return list;
            }
            None => {
                tracing::warn!(target: "presets.resolve", preset = %p.name, "ordering preset blob malformed, skipped");
            }
        }
    }
    OrderList::builtin(workflow)
}

//! History load and store.
//!
//! `read_history` turns persisted rows back into a live stack: it seeds the
//! ordering, runs the preset resolver exactly once per image lifetime,
//! validates every row against the installed module set (migrating or
//! dropping what no longer fits), force-enables what may never be off, and
//! replays the result into the module instances. `write_history` is the
//! inverse, wrapped in one catalog transaction.

use std::collections::HashMap;

use tracing::{info, warn};

use core_history::{HistoryEntry, HistoryStack, MaskForm};
use core_image::{DevError, DevResult, ImageFlags, ImageId};
use core_module::instance::InstanceList;
use core_module::{OpFlags, Registry};
use core_order::{OrderList, Workflow};
use core_presets::{resolve_auto_presets, resolve_order};

use crate::catalog::{Catalog, HistoryRow, MaskRow};
use crate::hash::content_hash;

/// Result of a history load.
pub struct LoadOutcome {
    pub stack: HistoryStack,
    pub order: OrderList,
    /// At least one row was migrated, merged, or dropped; the content hash
    /// was recomputed and persisted.
    pub migrated: bool,
    /// Number of auto-applied preset entries prepended by this load.
    pub auto_applied: usize,
    pub content_hash: u64,
}

/// Load an image's history, applying presets on first edit and migrating
/// legacy rows. Instances come back replayed to the restored cursor.
pub fn read_history(
    catalog: &dyn Catalog,
    registry: &Registry,
    instances: &mut InstanceList,
    imgid: ImageId,
    workflow: Workflow,
) -> DevResult<LoadOutcome> {
    let image = catalog.image(imgid)?;
    let presets = catalog.presets()?;

    // Ordering: the per-image override wins; otherwise an ordering preset or
    // the workflow default.
    let mut order = match image.order_blob.as_deref() {
        Some(blob) => OrderList::from_blob(blob).unwrap_or_else(|e| {
            warn!(target: "store.history", imgid = %imgid, error = %e, "per-image ordering blob malformed, falling back");
            resolve_order(&presets, &image.meta, workflow)
        }),
        None => resolve_order(&presets, &image.meta, workflow),
    };
    order.seed_instances(instances);

    let mut rows = catalog.history_rows(imgid)?;
    let mut mask_rows = catalog.mask_rows(imgid)?;
    let mut effective_end = image.history_end;

    // First-edit auto presets: defaults for a fresh image, then the resolver
    // output, prepended ahead of whatever already exists.
    let mut flags = image.flags;
    let mut auto_applied = 0usize;
    let mut merged = false;
    if !flags.contains(ImageFlags::AUTO_PRESETS_APPLIED) {
        let mut transient: Vec<HistoryRow> = Vec::new();
        if rows.is_empty() {
            for operation in registry.iter() {
                let d = operation.descriptor();
                if d.flags.contains(OpFlags::DEFAULT_ENABLED)
                    && !d.flags.contains(OpFlags::NO_HISTORY_STACK)
                {
                    transient.push(HistoryRow {
                        imgid,
                        num: 0,
                        operation: d.op.to_string(),
                        op_params: operation.reload_defaults(&image.meta),
                        module_version: d.version,
                        enabled: true,
                        blendop_params: d.default_blend_params.clone(),
                        blendop_version: d.blend_version,
                        multi_priority: 0,
                        multi_name: String::new(),
                        multi_name_hand_edited: false,
                    });
                }
            }
        }
        for ap in resolve_auto_presets(&presets, &image.meta, registry, workflow) {
            let row = HistoryRow {
                imgid,
                num: 0,
                operation: ap.operation,
                op_params: ap.op_params,
                module_version: ap.op_version,
                enabled: ap.enabled,
                blendop_params: ap.blendop_params,
                blendop_version: ap.blendop_version,
                multi_priority: ap.multi_priority,
                multi_name: ap.multi_name,
                multi_name_hand_edited: ap.multi_name_hand_edited,
            };
            match transient
                .iter_mut()
                .find(|t| t.operation == row.operation && t.multi_priority == row.multi_priority)
            {
                Some(slot) => *slot = row,
                None => transient.push(row),
            }
        }
        let inserted = transient.len();
        if inserted > 0 {
            for r in &mut rows {
                r.num += inserted as u32;
            }
            for m in &mut mask_rows {
                m.num += inserted as u32;
            }
            for (i, r) in transient.iter_mut().enumerate() {
                r.num = i as u32;
            }
            rows.splice(0..0, transient);
            effective_end += inserted;
            auto_applied = inserted;
            merged = true;
            info!(target: "store.history", imgid = %imgid, inserted, "auto presets prepended");
        }
        flags |= ImageFlags::AUTO_PRESETS_APPLIED | ImageFlags::AUTO_PRESETS_APPLIED_SET_ONCE;
    }

    // Validate and migrate row by row.
    let mut masks_by_num: HashMap<u32, Vec<MaskForm>> = HashMap::new();
    for m in mask_rows {
        masks_by_num.entry(m.num).or_default().push(m.form);
    }
    let mut entries: Vec<HistoryEntry> = Vec::new();
    let mut migrated = merged;
    let mut new_end = 0usize;
    for (idx, row) in rows.into_iter().enumerate() {
        let active = idx < effective_end;
        let Some(operation) = registry.get(&row.operation) else {
            let e = DevError::ModuleMismatch {
                imgid,
                op: row.operation.clone(),
            };
            warn!(target: "store.history", error = %e, "entry dropped");
            migrated = true;
            continue;
        };
        let d = operation.descriptor();

        let multi_priority = if d.flags.contains(OpFlags::ONE_INSTANCE) && row.multi_priority != 0 {
            warn!(
                target: "store.history",
                imgid = %imgid,
                op = %row.operation,
                stored = row.multi_priority,
                "single-instance operation with nonzero priority, coerced to 0"
            );
            migrated = true;
            0
        } else {
            row.multi_priority
        };

        let (params, op_version) =
            if row.module_version == d.version && row.op_params.len() == d.params_size {
                (row.op_params, d.version)
            } else {
                match operation.legacy_params(&row.op_params, row.module_version) {
                    Ok((p, v)) => {
                        info!(
                            target: "store.history",
                            imgid = %imgid,
                            op = %row.operation,
                            from = row.module_version,
                            to = v,
                            "parameters migrated"
                        );
                        migrated = true;
                        (p, v)
                    }
                    Err(cause) => {
                        let e = DevError::LegacyMigrationFailed {
                            imgid,
                            op: row.operation.clone(),
                            stored: row.module_version,
                            current: d.version,
                        };
                        warn!(
                            target: "store.history",
                            error = %e,
                            cause = %cause,
                            "entry dropped"
                        );
                        migrated = true;
                        continue;
                    }
                }
            };

        let mut enabled = row.enabled;
        // The geometric flip predating its parameter record renders wrong
        // unless it runs; such rows come back enabled with default params.
        if row.operation == "flip" && row.module_version == 1 {
            enabled = true;
        }
        if d.flags.is_force_enabled() {
            enabled = true;
        }

        let (blend_params, blendop_version) = if row.blendop_version == d.blend_version
            && row.blendop_params.len() == d.default_blend_params.len()
        {
            (row.blendop_params, d.blend_version)
        } else {
            if !row.blendop_params.is_empty() || row.blendop_version != 0 {
                warn!(
                    target: "store.history",
                    imgid = %imgid,
                    op = %row.operation,
                    stored = row.blendop_version,
                    current = d.blend_version,
                    "blend parameters replaced with defaults"
                );
                migrated = true;
            }
            (d.default_blend_params.clone(), d.blend_version)
        };

        // Make sure the instance exists (duplicates materialize here).
        if instances
            .find_or_create(registry, &row.operation, multi_priority)
            .is_none()
        {
            continue;
        }
        let iop_order = order.ensure_entry(&row.operation, multi_priority);

        entries.push(HistoryEntry {
            op: row.operation,
            op_version,
            multi_priority,
            multi_name: row.multi_name,
            multi_name_hand_edited: row.multi_name_hand_edited,
            enabled,
            params,
            blend_params,
            blend_version: blendop_version,
            iop_order,
            masks: masks_by_num.remove(&row.num).unwrap_or_default(),
            focus_hash: 0,
        });
        if active {
            new_end += 1;
        }
    }

    let mut stack = HistoryStack::from_parts(entries, new_end);
    stack.pop_to(registry, instances, new_end);

    let hash = content_hash(&stack, &order);
    if migrated || flags != image.flags {
        // Re-persist the cleaned state; the flag write rides the same load.
        let (rows, masks) = rows_from_stack(imgid, &stack);
        let blob = order.to_blob()?;
        catalog.replace_history(imgid, rows, masks, stack.history_end(), blob, hash)?;
        catalog.set_flags(imgid, flags)?;
    }

    Ok(LoadOutcome {
        stack,
        order,
        migrated,
        auto_applied,
        content_hash: hash,
    })
}

/// Persist the full stack (active prefix and redo tail) plus the ordering
/// blob and content hash in one transaction. Returns the written hash.
pub fn write_history(
    catalog: &dyn Catalog,
    imgid: ImageId,
    stack: &HistoryStack,
    order: &OrderList,
) -> DevResult<u64> {
    let (rows, masks) = rows_from_stack(imgid, stack);
    let blob = order.to_blob()?;
    let hash = content_hash(stack, order);
    catalog.replace_history(imgid, rows, masks, stack.history_end(), blob, hash)?;
    info!(
        target: "store.history",
        imgid = %imgid,
        rows = stack.len(),
        history_end = stack.history_end(),
        "history written"
    );
    Ok(hash)
}

fn rows_from_stack(imgid: ImageId, stack: &HistoryStack) -> (Vec<HistoryRow>, Vec<MaskRow>) {
    let mut rows = Vec::with_capacity(stack.len());
    let mut masks = Vec::new();
    for (num, e) in stack.entries().iter().enumerate() {
        let num = num as u32;
        rows.push(HistoryRow {
            imgid,
            num,
            operation: e.op.clone(),
            op_params: e.params.clone(),
            module_version: e.op_version,
            enabled: e.enabled,
            blendop_params: e.blend_params.clone(),
            blendop_version: e.blend_version,
            multi_priority: e.multi_priority,
            multi_name: e.multi_name.clone(),
            multi_name_hand_edited: e.multi_name_hand_edited,
        });
        for form in &e.masks {
            masks.push(MaskRow {
                imgid,
                num,
                form: form.clone(),
            });
        }
    }
    (rows, masks)
}

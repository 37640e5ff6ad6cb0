//! Load/store round trips: first-run preset application, legacy migration,
//! row validation, and the write/read identity law.

use core_image::{CaptureMeta, ImageFlags, ImageId};
use core_module::Registry;
use core_module::builtin::{ExposureParams, exposure_v1_bytes};
use core_module::instance::InstanceList;
use core_order::Workflow;
use core_presets::Preset;
use core_store::{Catalog, HistoryRow, MemoryCatalog, read_history, write_history};

fn meta() -> CaptureMeta {
    CaptureMeta {
        maker: "Fujifilm".into(),
        model: "X-T4".into(),
        camera_alias: "X-T4".into(),
        lens: "XF 35mm".into(),
        iso: 400.0,
        exposure: 1.0 / 250.0,
        aperture: 2.0,
        focal_length: 35.0,
        is_raw: true,
        is_hdr: false,
        is_ldr: false,
        is_monochrome: false,
        change_timestamp: 100,
    }
}

fn row(imgid: ImageId, num: u32, op: &str, params: Vec<u8>, version: i32) -> HistoryRow {
    HistoryRow {
        imgid,
        num,
        operation: op.into(),
        op_params: params,
        module_version: version,
        enabled: true,
        blendop_params: vec![],
        blendop_version: 0,
        multi_priority: 0,
        multi_name: String::new(),
        multi_name_hand_edited: false,
    }
}

#[test]
fn first_run_seeds_defaults_and_presets_once() {
    let cat = MemoryCatalog::new();
    let reg = Registry::builtin();
    let id = cat.insert_image(6000, 4000, meta());
    let mut preset = Preset::auto(
        "bright start",
        "exposure",
        2,
        ExposureParams { ev: 0.5, black: 0.0 }.to_bytes(),
    );
    preset.maker = "Fujifilm".into();
    cat.seed_presets(vec![preset]);

    let mut instances = InstanceList::from_registry(&reg);
    let out = read_history(&cat, &reg, &mut instances, id, Workflow::SceneReferred).unwrap();
    assert!(out.auto_applied >= 1, "defaults + matching preset prepended");
    assert!(out.stack.find_last("exposure").is_some());
    assert!(out.stack.find_last("rawprepare").is_some(), "default module seeded");
    assert_eq!(out.stack.history_end(), out.stack.len());

    let flags = cat.image(id).unwrap().flags;
    assert!(flags.contains(ImageFlags::AUTO_PRESETS_APPLIED));
    assert!(flags.contains(ImageFlags::AUTO_PRESETS_APPLIED_SET_ONCE));

    // A second load must not prepend anything further.
    let mut instances2 = InstanceList::from_registry(&reg);
    let again = read_history(&cat, &reg, &mut instances2, id, Workflow::SceneReferred).unwrap();
    assert_eq!(again.auto_applied, 0);
    assert_eq!(again.stack.len(), out.stack.len());
}

#[test]
fn legacy_exposure_row_migrates_and_round_trips() {
    let cat = MemoryCatalog::new();
    let reg = Registry::builtin();
    let id = cat.insert_image(6000, 4000, meta());
    // Mark presets done so the fixture row is the whole history.
    cat.set_flags(id, ImageFlags::AUTO_PRESETS_APPLIED).unwrap();
    cat.seed_history_row(row(id, 0, "exposure", exposure_v1_bytes(150), 1));
    cat.set_history_end(id, 1).unwrap();

    let mut instances = InstanceList::from_registry(&reg);
    let out = read_history(&cat, &reg, &mut instances, id, Workflow::SceneReferred).unwrap();
    assert!(out.migrated);
    let e = out.stack.find_last("exposure").unwrap();
    assert_eq!(e.op_version, 2);
    let p = ExposureParams::from_bytes(&e.params).unwrap();
    assert!((p.ev - 1.5).abs() < 1e-6);

    // The migration was re-persisted: the stored row now carries v2.
    let stored = cat.history_rows(id).unwrap();
    let stored_exposure = stored.iter().find(|r| r.operation == "exposure").unwrap();
    assert_eq!(stored_exposure.module_version, 2);

    // And a fresh read yields the identical in-memory state.
    let mut instances2 = InstanceList::from_registry(&reg);
    let again = read_history(&cat, &reg, &mut instances2, id, Workflow::SceneReferred).unwrap();
    assert!(!again.migrated, "second load sees current versions");
    assert_eq!(again.stack.entries(), out.stack.entries());
    assert_eq!(again.content_hash, out.content_hash);
}

#[test]
fn unknown_operation_row_is_dropped_with_survivors_intact() {
    let cat = MemoryCatalog::new();
    let reg = Registry::builtin();
    let id = cat.insert_image(100, 100, meta());
    cat.set_flags(id, ImageFlags::AUTO_PRESETS_APPLIED).unwrap();
    cat.seed_history_row(row(id, 0, "vignette", vec![1, 2], 1));
    cat.seed_history_row(row(
        id,
        1,
        "exposure",
        ExposureParams { ev: 1.0, black: 0.0 }.to_bytes(),
        2,
    ));
    cat.set_history_end(id, 2).unwrap();

    let mut instances = InstanceList::from_registry(&reg);
    let out = read_history(&cat, &reg, &mut instances, id, Workflow::SceneReferred).unwrap();
    assert_eq!(out.stack.len(), 1, "unknown op dropped, history continues");
    assert_eq!(out.stack.history_end(), 1);
    assert_eq!(out.stack.entries()[0].op, "exposure");
}

#[test]
fn flip_v1_row_comes_back_force_enabled_with_defaults() {
    let cat = MemoryCatalog::new();
    let reg = Registry::builtin();
    let id = cat.insert_image(100, 100, meta());
    cat.set_flags(id, ImageFlags::AUTO_PRESETS_APPLIED).unwrap();
    let mut r = row(id, 0, "flip", vec![], 1);
    r.enabled = false;
    cat.seed_history_row(r);
    cat.set_history_end(id, 1).unwrap();

    let mut instances = InstanceList::from_registry(&reg);
    let out = read_history(&cat, &reg, &mut instances, id, Workflow::SceneReferred).unwrap();
    let e = out.stack.find_last("flip").unwrap();
    assert!(e.enabled);
    assert_eq!(e.op_version, 2);
    assert_eq!(e.params, reg.get("flip").unwrap().descriptor().default_params);
}

#[test]
fn one_instance_priority_is_coerced_to_zero() {
    let cat = MemoryCatalog::new();
    let reg = Registry::builtin();
    let id = cat.insert_image(100, 100, meta());
    cat.set_flags(id, ImageFlags::AUTO_PRESETS_APPLIED).unwrap();
    let mut r = row(
        id,
        0,
        "temperature",
        reg.get("temperature").unwrap().descriptor().default_params.clone(),
        1,
    );
    r.multi_priority = 3;
    cat.seed_history_row(r);
    cat.set_history_end(id, 1).unwrap();

    let mut instances = InstanceList::from_registry(&reg);
    let out = read_history(&cat, &reg, &mut instances, id, Workflow::SceneReferred).unwrap();
    assert_eq!(out.stack.entries()[0].multi_priority, 0);
}

#[test]
fn write_then_read_is_identity_for_current_versions() {
    let cat = MemoryCatalog::new();
    let reg = Registry::builtin();
    let id = cat.insert_image(6000, 4000, meta());

    // Build an edited state through a real load.
    let mut instances = InstanceList::from_registry(&reg);
    let mut out = read_history(&cat, &reg, &mut instances, id, Workflow::SceneReferred).unwrap();
    instances.find_mut("exposure", 0).unwrap().params =
        ExposureParams { ev: 0.7, black: 0.01 }.to_bytes();
    out.stack.append(
        &reg,
        instances.find("exposure", 0).unwrap(),
        core_history::AppendRequest {
            enable: true,
            new_item: true,
            ..Default::default()
        },
    );
    let written_hash = write_history(&cat, id, &out.stack, &out.order).unwrap();

    let mut instances2 = InstanceList::from_registry(&reg);
    let back = read_history(&cat, &reg, &mut instances2, id, Workflow::SceneReferred).unwrap();
    assert_eq!(back.stack.entries(), out.stack.entries());
    assert_eq!(back.stack.history_end(), out.stack.history_end());
    assert_eq!(back.order, out.order);
    assert_eq!(back.content_hash, written_hash);
    assert_eq!(
        instances2.find("exposure", 0).unwrap().params,
        instances.find("exposure", 0).unwrap().params,
        "replayed instances match the edited ones"
    );
}

#[test]
fn refused_transaction_leaves_memory_state_untouched() {
    let cat = MemoryCatalog::new();
    let reg = Registry::builtin();
    let id = cat.insert_image(100, 100, meta());
    let mut instances = InstanceList::from_registry(&reg);
    let out = read_history(&cat, &reg, &mut instances, id, Workflow::SceneReferred).unwrap();
    let rows_before = cat.history_rows(id).unwrap();

    cat.set_write_locked(true);
    let res = write_history(&cat, id, &out.stack, &out.order);
    assert!(res.is_err());
    cat.set_write_locked(false);
    assert_eq!(cat.history_rows(id).unwrap(), rows_before, "no partial write");
}

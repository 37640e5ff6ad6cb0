//! Property tests for the pure viewport math the run loop leans on, plus the
//! fingerprint soundness condition the cache depends on.

use core_image::zoom::{check_zoom_bounds, viewport_roi};
use core_image::{Dimensions, Roi};
use core_pipeline::node::NodeSpec;
use core_pipeline::{DevicePlacement, fold_node, pipeline_fingerprint};
use proptest::prelude::*;

fn arb_spec() -> impl Strategy<Value = NodeSpec> {
    (
        "[a-z]{3,10}",
        1i32..5,
        0u32..4,
        0u32..32,
        any::<bool>(),
        proptest::collection::vec(any::<u8>(), 0..16),
    )
        .prop_map(|(op, version, prio, rank, enabled, params)| NodeSpec {
            op,
            op_version: version,
            multi_priority: prio,
            iop_order: rank,
            enabled,
            params,
            blend_params: vec![],
            placement: DevicePlacement::Cpu,
        })
}

proptest! {
    #[test]
    fn zoom_center_always_lands_in_bounds(
        zx in -2.0f32..2.0,
        zy in -2.0f32..2.0,
        bw in 0.01f32..2.0,
        bh in 0.01f32..2.0,
    ) {
        let b = check_zoom_bounds(zx, zy, bw, bh);
        prop_assert!(b.zoom_x.abs() <= 0.5);
        prop_assert!(b.zoom_y.abs() <= 0.5);
        if bw >= 1.0 {
            prop_assert_eq!(b.zoom_x, 0.0);
        }
        if bh >= 1.0 {
            prop_assert_eq!(b.zoom_y, 0.0);
        }
    }

    #[test]
    fn clamping_is_idempotent(
        zx in -2.0f32..2.0,
        zy in -2.0f32..2.0,
        bw in 0.01f32..2.0,
        bh in 0.01f32..2.0,
    ) {
        let once = check_zoom_bounds(zx, zy, bw, bh);
        let twice = check_zoom_bounds(once.zoom_x, once.zoom_y, bw, bh);
        prop_assert_eq!(once.zoom_x, twice.zoom_x);
        prop_assert_eq!(once.zoom_y, twice.zoom_y);
        prop_assert!(!twice.clamped);
    }

    #[test]
    fn viewport_roi_stays_inside_image(
        w in 16u32..4000,
        h in 16u32..4000,
        win_w in 16u32..2000,
        win_h in 16u32..2000,
        zx in -0.5f32..0.5,
        zy in -0.5f32..0.5,
        closeup in 0u32..3,
    ) {
        let dims = Dimensions::new(w, h);
        let r = viewport_roi(dims, win_w, win_h, 1.0, zx, zy, closeup);
        prop_assert!(r.x >= 0);
        prop_assert!(r.y >= 0);
        prop_assert!(r.x as u32 + r.width <= w);
        prop_assert!(r.y as u32 + r.height <= h);
    }

    #[test]
    fn equal_spec_chains_fingerprint_equal(specs in proptest::collection::vec(arb_spec(), 1..6)) {
        let roi = Roi::new(0, 0, 128, 96, 1.0);
        let dims = Dimensions::new(128, 96);
        let a = pipeline_fingerprint(&specs, &roi, dims, 1.0);
        let b = pipeline_fingerprint(&specs.clone(), &roi, dims, 1.0);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn param_bytes_always_reach_the_fingerprint(
        spec in arb_spec(),
        extra in 1u8..255,
    ) {
        let roi = Roi::new(0, 0, 64, 64, 1.0);
        let dims = Dimensions::new(64, 64);
        let base = fold_node(0, &spec, &roi, dims, 1.0);
        let mut changed = spec.clone();
        changed.params.push(extra);
        prop_assert_ne!(base, fold_node(0, &changed, &roi, dims, 1.0));
    }
}

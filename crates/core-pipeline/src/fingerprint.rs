//! Node and pipeline fingerprints.
//!
//! A node fingerprint folds everything that can influence the node's output:
//! the previous node's fingerprint, the operation identity and schema
//! version, rank and instance priority, the enabled bit, both parameter
//! records, the node roi, and the source geometry. Equal fingerprints imply
//! equal outputs, which is what makes the intermediate cache sound.
//!
//! Hashing strategy: one `ahash` pass per node seeded with the previous
//! fingerprint, field order fixed. Field order is part of the cache-key
//! contract; changing it silently invalidates every cached intermediate.

use std::hash::Hasher;

use ahash::AHasher;

use core_image::{Dimensions, Roi};

use crate::node::NodeSpec;

/// Combine two hashes in sequence (the fold step). Not commutative.
pub fn combine(prev: u64, next: u64) -> u64 {
    let mut h = AHasher::default();
    h.write_u64(prev);
    h.write_u64(next);
    h.finish()
}

/// Hash of a single node in isolation (no chain context). The forward fold
/// combines these left to right, the backward fold right to left, so one
/// pass yields both directions for the hash-wait protocol.
pub fn node_self_hash(spec: &NodeSpec, roi: &Roi, src_dims: Dimensions, src_scale: f32) -> u64 {
    let mut h = AHasher::default();
    h.write(spec.op.as_bytes());
    h.write_u8(0); // field separator: op name is variable-length
    h.write_i32(spec.op_version);
    h.write_u32(spec.iop_order);
    h.write_u32(spec.multi_priority);
    h.write_u8(spec.enabled as u8);
    h.write_usize(spec.params.len());
    h.write(&spec.params);
    h.write_usize(spec.blend_params.len());
    h.write(&spec.blend_params);
    h.write(&roi.hash_bytes());
    h.write_u32(src_dims.width);
    h.write_u32(src_dims.height);
    h.write_u32(src_scale.to_bits());
    h.finish()
}

/// Fold one node over the running pipeline fingerprint.
pub fn fold_node(prev: u64, spec: &NodeSpec, roi: &Roi, src_dims: Dimensions, src_scale: f32) -> u64 {
    combine(prev, node_self_hash(spec, roi, src_dims, src_scale))
}

/// Fingerprint of the whole pipeline: the fold across all nodes in rank
/// order, starting from a fixed seed.
pub fn pipeline_fingerprint(
    specs: &[NodeSpec],
    roi: &Roi,
    src_dims: Dimensions,
    src_scale: f32,
) -> u64 {
    let mut fp = PIPELINE_SEED;
    for spec in specs {
        fp = fold_node(fp, spec, roi, src_dims, src_scale);
    }
    fp
}

/// Seed of the fold; distinguishes "no nodes" from a zero hash.
pub const PIPELINE_SEED: u64 = 0x5f3c_91d2_a6b4_e807;

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(op: &str) -> NodeSpec {
        NodeSpec {
            op: op.to_string(),
            op_version: 1,
            multi_priority: 0,
            iop_order: 0,
            enabled: true,
            params: vec![1, 2, 3],
            blend_params: vec![],
            placement: crate::DevicePlacement::Cpu,
        }
    }

    const ROI: Roi = Roi::new(0, 0, 64, 64, 1.0);
    const DIMS: Dimensions = Dimensions::new(64, 64);

    #[test]
    fn identical_inputs_identical_fingerprints() {
        let a = fold_node(PIPELINE_SEED, &spec("exposure"), &ROI, DIMS, 1.0);
        let b = fold_node(PIPELINE_SEED, &spec("exposure"), &ROI, DIMS, 1.0);
        assert_eq!(a, b);
    }

    #[test]
    fn every_field_contributes() {
        let base = fold_node(PIPELINE_SEED, &spec("exposure"), &ROI, DIMS, 1.0);

        let mut s = spec("exposure");
        s.enabled = false;
        assert_ne!(base, fold_node(PIPELINE_SEED, &s, &ROI, DIMS, 1.0), "enabled");

        let mut s = spec("exposure");
        s.params = vec![1, 2, 4];
        assert_ne!(base, fold_node(PIPELINE_SEED, &s, &ROI, DIMS, 1.0), "params");

        let mut s = spec("exposure");
        s.op_version = 2;
        assert_ne!(base, fold_node(PIPELINE_SEED, &s, &ROI, DIMS, 1.0), "version");

        let mut s = spec("exposure");
        s.iop_order = 7;
        assert_ne!(base, fold_node(PIPELINE_SEED, &s, &ROI, DIMS, 1.0), "rank");

        let other_roi = Roi::new(0, 0, 32, 64, 1.0);
        assert_ne!(
            base,
            fold_node(PIPELINE_SEED, &spec("exposure"), &other_roi, DIMS, 1.0),
            "roi"
        );

        assert_ne!(
            base,
            fold_node(PIPELINE_SEED, &spec("exposure"), &ROI, DIMS, 0.5),
            "source scale"
        );
    }

    #[test]
    fn chain_order_matters() {
        let ab = {
            let fp = fold_node(PIPELINE_SEED, &spec("a"), &ROI, DIMS, 1.0);
            fold_node(fp, &spec("b"), &ROI, DIMS, 1.0)
        };
        let ba = {
            let fp = fold_node(PIPELINE_SEED, &spec("b"), &ROI, DIMS, 1.0);
            fold_node(fp, &spec("a"), &ROI, DIMS, 1.0)
        };
        assert_ne!(ab, ba);
    }

    #[test]
    fn pipeline_fold_equals_manual_fold() {
        let specs = [spec("a"), spec("b")];
        let manual = {
            let fp = fold_node(PIPELINE_SEED, &specs[0], &ROI, DIMS, 1.0);
            fold_node(fp, &specs[1], &ROI, DIMS, 1.0)
        };
        assert_eq!(manual, pipeline_fingerprint(&specs, &ROI, DIMS, 1.0));
    }
}

//! History content hash.
//!
//! A 64-bit digest over the active history prefix and the ordering blob,
//! written alongside every history transaction. Change detection between
//! autosaves and sidecar exports compares digests instead of row sets.

use std::hash::Hasher;

use ahash::AHasher;

use core_history::HistoryStack;
use core_order::OrderList;

pub fn content_hash(stack: &HistoryStack, order: &OrderList) -> u64 {
    let mut h = AHasher::default();
    h.write_usize(stack.history_end());
    for e in stack.active() {
        h.write(e.op.as_bytes());
        h.write_u8(0);
        h.write_i32(e.op_version);
        h.write_u32(e.multi_priority);
        h.write_u8(e.enabled as u8);
        h.write_usize(e.params.len());
        h.write(&e.params);
        h.write_usize(e.blend_params.len());
        h.write(&e.blend_params);
        h.write_u32(e.iop_order);
        for m in &e.masks {
            h.write_u64(m.id);
            h.write_usize(m.points.len());
        }
    }
    for entry in order.entries() {
        h.write(entry.op.as_bytes());
        h.write_u8(0);
        h.write_u32(entry.multi_priority);
        h.write_u32(entry.rank);
    }
    h.finish()
}

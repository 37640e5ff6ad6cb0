//! Per-image sidecar files.
//!
//! A sidecar carries the same history, ordering, and content hash the
//! catalog holds, so an image travels with its edits. Written by autosave
//! and on demand; read back for import and for the round-trip tests.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use core_history::{HistoryEntry, HistoryStack};
use core_image::{DevError, DevResult, ImageId};
use core_order::OrderList;

pub const SIDECAR_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    pub format_version: u32,
    pub imgid: ImageId,
    pub history: Vec<HistoryEntry>,
    pub history_end: usize,
    pub order: OrderList,
    pub content_hash: u64,
}

impl Sidecar {
    pub fn capture(
        imgid: ImageId,
        stack: &HistoryStack,
        order: &OrderList,
        content_hash: u64,
    ) -> Self {
        Self {
            format_version: SIDECAR_FORMAT_VERSION,
            imgid,
            history: stack.entries().to_vec(),
            history_end: stack.history_end(),
            order: order.clone(),
            content_hash,
        }
    }
}

/// Serialize the sidecar next to the image (or wherever the caller points).
pub fn export_sidecar(path: &Path, sidecar: &Sidecar) -> DevResult<()> {
    let body = serde_json::to_string_pretty(sidecar).map_err(|e| DevError::Malformed {
        what: "sidecar",
        detail: e.to_string(),
    })?;
    fs::write(path, body).map_err(|e| DevError::PersistenceConflict(format!(
        "sidecar write to {} failed: {e}",
        path.display()
    )))?;
    info!(target: "store.sidecar", imgid = %sidecar.imgid, path = %path.display(), "sidecar written");
    Ok(())
}

pub fn read_sidecar(path: &Path) -> DevResult<Sidecar> {
    let body = fs::read_to_string(path).map_err(|e| DevError::Malformed {
        what: "sidecar",
        detail: format!("{}: {e}", path.display()),
    })?;
    let sidecar: Sidecar = serde_json::from_str(&body).map_err(|e| DevError::Malformed {
        what: "sidecar",
        detail: e.to_string(),
    })?;
    Ok(sidecar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_history::AppendRequest;
    use core_module::Registry;
    use core_module::instance::InstanceList;
    use core_order::Workflow;

    #[test]
    fn sidecar_round_trips_history_and_order() {
        let reg = Registry::builtin();
        let list = InstanceList::from_registry(&reg);
        let mut stack = HistoryStack::new();
        stack.append(
            &reg,
            list.find("exposure", 0).unwrap(),
            AppendRequest {
                enable: true,
                ..Default::default()
            },
        );
        let order = OrderList::builtin(Workflow::SceneReferred);
        let sc = Sidecar::capture(ImageId(4), &stack, &order, 0xfeed);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.raw.dks");
        export_sidecar(&path, &sc).unwrap();
        let back = read_sidecar(&path).unwrap();
        assert_eq!(back.imgid, ImageId(4));
        assert_eq!(back.history, stack.entries().to_vec());
        assert_eq!(back.history_end, 1);
        assert_eq!(back.order, order);
        assert_eq!(back.content_hash, 0xfeed);
    }

    #[test]
    fn unreadable_sidecar_is_malformed_not_panic() {
        let err = read_sidecar(Path::new("/nonexistent/x.dks"));
        assert!(matches!(err, Err(DevError::Malformed { .. })));
    }
}

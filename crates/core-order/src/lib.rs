//! Operation ordering.
//!
//! A total order over (operation, instance priority) decides where each node
//! sits in the pipeline. A global default exists per workflow; an image may
//! carry its own serialized override. Ranks are dense and unique within a
//! list; duplicating an instance inserts its rank immediately after the base
//! instance and shifts everything behind it.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use core_image::{DevError, DevResult};
use core_module::instance::InstanceList;

/// Version of the builtin default orders; recorded in persisted blobs so a
/// later default change can migrate old images.
pub const ORDER_VERSION: i32 = 3;

/// Named default ordering + preset family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Workflow {
    #[default]
    SceneReferred,
    DisplayReferred,
    Legacy,
    None,
}

impl Workflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::SceneReferred => "scene-referred",
            Workflow::DisplayReferred => "display-referred",
            Workflow::Legacy => "legacy",
            Workflow::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Workflow> {
        match s {
            "scene-referred" => Some(Workflow::SceneReferred),
            "display-referred" => Some(Workflow::DisplayReferred),
            "legacy" => Some(Workflow::Legacy),
            "none" => Some(Workflow::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEntry {
    pub op: String,
    pub multi_priority: u32,
    pub rank: u32,
}

/// The ordering list of one image (or a workflow default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderList {
    pub version: i32,
    entries: Vec<OrderEntry>,
}

impl OrderList {
    /// Builtin default for `workflow`. The scene-referred order runs the
    /// geometric flip before exposure; the display-referred and legacy orders
    /// run it after the tonal stage, matching their historical pipelines.
    pub fn builtin(workflow: Workflow) -> Self {
        let ops: &[&str] = match workflow {
            Workflow::SceneReferred | Workflow::None => {
                &["rawprepare", "temperature", "flip", "exposure", "sharpen", "gamma"]
            }
            Workflow::DisplayReferred => {
                &["rawprepare", "temperature", "exposure", "flip", "sharpen", "gamma"]
            }
            Workflow::Legacy => {
                &["rawprepare", "flip", "temperature", "exposure", "sharpen", "gamma"]
            }
        };
        let entries = ops
            .iter()
            .enumerate()
            .map(|(i, op)| OrderEntry {
                op: (*op).to_string(),
                multi_priority: 0,
                rank: i as u32,
            })
            .collect();
        Self {
            version: ORDER_VERSION,
            entries,
        }
    }

    pub fn entries(&self) -> &[OrderEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn rank_of(&self, op: &str, multi_priority: u32) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.op == op && e.multi_priority == multi_priority)
            .map(|e| e.rank)
    }

    /// Ranks must be unique per image.
    pub fn validate(&self) -> DevResult<()> {
        let mut ranks: Vec<u32> = self.entries.iter().map(|e| e.rank).collect();
        ranks.sort_unstable();
        ranks.dedup();
        if ranks.len() != self.entries.len() {
            return Err(DevError::Malformed {
                what: "ordering list",
                detail: "duplicate rank".into(),
            });
        }
        Ok(())
    }

    /// Insert a new instance of `op` directly after its base instance,
    /// shifting every later rank up by one. Returns the new rank.
    pub fn insert_duplicate_after(
        &mut self,
        op: &str,
        base_priority: u32,
        new_priority: u32,
    ) -> DevResult<u32> {
        let base_rank = self.rank_of(op, base_priority).ok_or(DevError::Malformed {
            what: "ordering list",
            detail: format!("`{op}` priority {base_priority} not in ordering"),
        })?;
        let new_rank = base_rank + 1;
        for e in self.entries.iter_mut() {
            if e.rank >= new_rank {
                e.rank += 1;
            }
        }
        self.entries.push(OrderEntry {
            op: op.to_string(),
            multi_priority: new_priority,
            rank: new_rank,
        });
        self.entries.sort_by_key(|e| e.rank);
        debug!(target: "order", op, new_priority, new_rank, "duplicate inserted");
        Ok(new_rank)
    }

    /// Rank for `(op, multi_priority)`, creating the entry if missing: a
    /// duplicate slots in right after its base instance, anything else is
    /// appended behind the current maximum.
    pub fn ensure_entry(&mut self, op: &str, multi_priority: u32) -> u32 {
        if let Some(r) = self.rank_of(op, multi_priority) {
            return r;
        }
        if multi_priority > 0
            && self.rank_of(op, 0).is_some()
            && let Ok(r) = self.insert_duplicate_after(op, 0, multi_priority)
        {
            return r;
        }
        let next = self.entries.iter().map(|e| e.rank + 1).max().unwrap_or(0);
        self.entries.push(OrderEntry {
            op: op.to_string(),
            multi_priority,
            rank: next,
        });
        next
    }

    /// Write each instance's `iop_order` from this list. Instances the list
    /// does not know get appended behind the current maximum (and recorded),
    /// so a newly installed module still lands somewhere deterministic.
    pub fn seed_instances(&mut self, instances: &mut InstanceList) {
        let mut next = self.entries.iter().map(|e| e.rank + 1).max().unwrap_or(0);
        for m in instances.iter_mut() {
            match self.rank_of(&m.op, m.multi_priority) {
                Some(rank) => m.iop_order = rank,
                None => {
                    warn!(target: "order", op = %m.op, multi_priority = m.multi_priority, rank = next, "instance missing from ordering, appended");
                    self.entries.push(OrderEntry {
                        op: m.op.clone(),
                        multi_priority: m.multi_priority,
                        rank: next,
                    });
                    m.iop_order = next;
                    next += 1;
                }
            }
        }
    }

    /// Serialized per-image blob.
    pub fn to_blob(&self) -> DevResult<String> {
        serde_json::to_string(self).map_err(|e| DevError::Malformed {
            what: "ordering list",
            detail: e.to_string(),
        })
    }

    pub fn from_blob(blob: &str) -> DevResult<Self> {
        let list: OrderList = serde_json::from_str(blob).map_err(|e| DevError::Malformed {
            what: "ordering list",
            detail: e.to_string(),
        })?;
        list.validate()?;
        Ok(list)
    }
}

//! The immutable operation registry.
//!
//! Discovered once at process start; lookups thereafter are lock-free reads.
//! Iteration order is the installation order, which is deterministic for the
//! built-in set so tests and the default ordering agree across runs.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::Operation;
use crate::builtin;

pub struct Registry {
    ops: Vec<Arc<dyn Operation>>,
    by_name: HashMap<&'static str, usize>,
}

impl Registry {
    /// Build a registry from an explicit module set. Later registrations of a
    /// duplicated name are ignored.
    pub fn from_modules(modules: Vec<Arc<dyn Operation>>) -> Self {
        let mut ops: Vec<Arc<dyn Operation>> = Vec::with_capacity(modules.len());
        let mut by_name = HashMap::new();
        for m in modules {
            let name = m.descriptor().op;
            if by_name.contains_key(name) {
                continue;
            }
            by_name.insert(name, ops.len());
            ops.push(m);
        }
        info!(target: "module.registry", installed = ops.len(), "registry sealed");
        Self { ops, by_name }
    }

    /// The built-in reference operation set.
    pub fn builtin() -> Self {
        Self::from_modules(builtin::all())
    }

    pub fn get(&self, op: &str) -> Option<&Arc<dyn Operation>> {
        self.by_name.get(op).map(|&i| &self.ops[i])
    }

    pub fn contains(&self, op: &str) -> bool {
        self.by_name.contains_key(op)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Operation>> {
        self.ops.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_set_resolves_by_name() {
        let reg = Registry::builtin();
        for op in ["rawprepare", "exposure", "temperature", "flip", "sharpen", "gamma"] {
            assert!(reg.contains(op), "missing builtin `{op}`");
        }
        assert!(!reg.contains("basecurve"));
    }

    #[test]
    fn duplicate_registration_keeps_first() {
        let reg = Registry::from_modules(vec![
            Arc::new(builtin::Exposure::default()),
            Arc::new(builtin::Exposure::default()),
        ]);
        assert_eq!(reg.len(), 1);
    }
}

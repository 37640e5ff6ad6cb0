//! Operation module contract and registry.
//!
//! Every pixel operation is an opaque module behind the [`Operation`] trait:
//! a static self-description ([`OpDescriptor`]) plus processing, geometric
//! distortion, and parameter-migration hooks. Modules are discovered once at
//! process start and the [`Registry`] is immutable afterwards; all runtime
//! mutability lives in [`ModuleInstance`] values owned by the develop state.
//!
//! History entries never hold references into the instance list; they carry
//! `(op, multi_priority)` and resolve through the registry, so removing an
//! instance cannot leave dangling back-pointers.

use std::sync::atomic::AtomicBool;

use core_image::{CaptureMeta, DevError, DevResult, PixelBuffer, Roi};

pub mod builtin;
pub mod instance;
pub mod registry;

pub use instance::ModuleInstance;
pub use registry::Registry;

bitflags::bitflags! {
    /// Capability flags advertised by an operation's static descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        /// Not shown in module lists; still processes when enabled.
        const HIDDEN = 1 << 0;
        /// Kept for old edits only; never offered for new ones.
        const DEPRECATED = 1 << 1;
        /// At most one instance per image; instance priority pinned to 0.
        const ONE_INSTANCE = 1 << 2;
        /// Never recorded in the history stack (display-only tail ops).
        const NO_HISTORY_STACK = 1 << 3;
        /// The enable toggle is not user-accessible.
        const HIDE_ENABLE_BUTTON = 1 << 4;
        /// Enabled by default on a fresh image.
        const DEFAULT_ENABLED = 1 << 5;
        /// Accepts blend parameters.
        const SUPPORTS_BLENDING = 1 << 6;
        /// Output may be produced in independent tiles.
        const ALLOW_TILING = 1 << 7;
    }
}

impl OpFlags {
    /// "Always-on" operations survive redo-tail truncation: they are enabled
    /// by default and the user can still toggle them, so dropping their
    /// entries would silently change the image.
    pub fn is_always_on(&self) -> bool {
        self.contains(OpFlags::DEFAULT_ENABLED) && !self.contains(OpFlags::HIDE_ENABLE_BUTTON)
    }

    /// Force-enabled operations may never be persisted as disabled.
    pub fn is_force_enabled(&self) -> bool {
        self.contains(OpFlags::DEFAULT_ENABLED) && self.contains(OpFlags::HIDE_ENABLE_BUTTON)
    }
}

/// Static self-description of an installed operation type.
#[derive(Debug, Clone)]
pub struct OpDescriptor {
    /// Stable textual identifier; the persistence key.
    pub op: &'static str,
    /// Current parameter schema version.
    pub version: i32,
    /// Size in bytes of a valid parameter record.
    pub params_size: usize,
    pub default_params: Vec<u8>,
    pub default_blend_params: Vec<u8>,
    /// Current blend parameter schema version.
    pub blend_version: i32,
    pub flags: OpFlags,
}

/// Outcome of a processing call. Failures are reported through `DevResult`;
/// `Interrupted` means the module observed the shutdown flag at a chunk
/// boundary and stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Done,
    Interrupted,
}

/// Per-invocation context handed to [`Operation::process`].
pub struct ProcessCtx<'a> {
    pub params: &'a [u8],
    pub blend_params: &'a [u8],
    /// Cooperative cancellation flag; modules poll it at chunk boundaries.
    pub shutdown: &'a AtomicBool,
    pub roi_in: Roi,
    pub roi_out: Roi,
}

/// The module contract. Implementations must be deterministic given identical
/// (params, blend params, input bytes, roi) and must not mutate their input.
pub trait Operation: Send + Sync {
    fn descriptor(&self) -> &OpDescriptor;

    /// Produce `output` from `input`. `output` arrives allocated at the
    /// `roi_out` dimensions.
    fn process(
        &self,
        ctx: &ProcessCtx<'_>,
        input: &PixelBuffer,
        output: &mut PixelBuffer,
    ) -> DevResult<ProcessOutcome>;

    /// Forward-map a point set through this operation's geometry. Identity
    /// for non-geometric modules.
    fn distort_transform(&self, _params: &[u8], _dims: (u32, u32), _points: &mut [(f32, f32)]) {}

    /// Inverse of [`Operation::distort_transform`].
    fn distort_backtransform(&self, _params: &[u8], _dims: (u32, u32), _points: &mut [(f32, f32)]) {
    }

    /// Migrate a parameter record stored at `old_version` to the current
    /// schema. The default refuses anything but the current version.
    fn legacy_params(&self, old: &[u8], old_version: i32) -> DevResult<(Vec<u8>, i32)> {
        let d = self.descriptor();
        if old_version == d.version && old.len() == d.params_size {
            return Ok((old.to_vec(), d.version));
        }
        Err(DevError::Malformed {
            what: "op params",
            detail: format!(
                "`{}` has no migration from version {} (current {})",
                d.op, old_version, d.version
            ),
        })
    }

    /// Validate a parameter record before it is written into an instance.
    fn commit_params(&self, params: &[u8]) -> DevResult<()> {
        let d = self.descriptor();
        if params.len() != d.params_size {
            return Err(DevError::Malformed {
                what: "op params",
                detail: format!(
                    "`{}` expects {} param bytes, got {}",
                    d.op,
                    d.params_size,
                    params.len()
                ),
            });
        }
        Ok(())
    }

    /// Per-pipeline setup/teardown hooks. The reference operations hold no
    /// pipeline-local resources, so the defaults are empty.
    fn init_pipe(&self) {}
    fn cleanup_pipe(&self) {}

    /// Image-dependent defaults (e.g. camera-specific black levels). The
    /// default returns the static record.
    fn reload_defaults(&self, _meta: &CaptureMeta) -> Vec<u8> {
        self.descriptor().default_params.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_on_excludes_hidden_toggle() {
        let on = OpFlags::DEFAULT_ENABLED;
        assert!(on.is_always_on());
        let forced = OpFlags::DEFAULT_ENABLED | OpFlags::HIDE_ENABLE_BUTTON;
        assert!(!forced.is_always_on());
        assert!(forced.is_force_enabled());
    }
}

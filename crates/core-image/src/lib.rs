//! Image handles, capture metadata, pixel buffers, roi rectangles, and the
//! pure viewport/zoom math shared by every other crate.
//!
//! This crate is the leaf of the workspace: it owns the vocabulary types the
//! develop engine passes across crate seams (image ids, flags, rois, buffer
//! handles) plus the unified error taxonomy. Nothing here takes locks or does
//! IO; zoom computations in [`zoom`] are deliberately pure so GUI layers can
//! call them without touching pipeline state.

use serde::{Deserialize, Serialize};

pub mod buffer;
pub mod error;
pub mod roi;
pub mod zoom;

pub use buffer::{ColorSpace, PixelBuffer, SharedBuffer};
pub use error::{DevError, DevResult};
pub use roi::Roi;

/// Opaque identifier of a loaded image. Assigned by the catalog at import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub u32);

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags::bitflags! {
    /// Persistent per-image flag bits stored in the catalog's image row.
    /// Persisted as the raw `bits()` word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageFlags: u32 {
        /// Auto-apply presets have run for this image; the resolver must not
        /// run again while this bit is set.
        const AUTO_PRESETS_APPLIED = 1 << 0;
        /// Image opted out of legacy preset compatibility shims.
        const NO_LEGACY_PRESETS = 1 << 1;
        /// `AUTO_PRESETS_APPLIED` has been set at least once in this image's
        /// lifetime (survives an explicit clear of the applied bit).
        const AUTO_PRESETS_APPLIED_SET_ONCE = 1 << 2;
    }
}

/// Immutable capture metadata carried by an image handle. Matched by the
/// preset resolver against preset selectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMeta {
    pub maker: String,
    pub model: String,
    /// Normalized camera alias (maker-specific model aliases collapse here).
    pub camera_alias: String,
    pub lens: String,
    pub iso: f32,
    /// Exposure time in seconds.
    pub exposure: f32,
    pub aperture: f32,
    /// Focal length in millimeters.
    pub focal_length: f32,
    pub is_raw: bool,
    pub is_hdr: bool,
    pub is_ldr: bool,
    pub is_monochrome: bool,
    /// Seconds since the epoch of the last catalog-visible change.
    pub change_timestamp: i64,
}

impl CaptureMeta {
    /// Bit mask of capture formats, used by preset selectors' `format` field.
    pub fn format_mask(&self) -> u32 {
        let mut mask = 0;
        if self.is_raw {
            mask |= format_mask::RAW;
        }
        if self.is_ldr {
            mask |= format_mask::LDR;
        }
        if self.is_hdr {
            mask |= format_mask::HDR;
        }
        if self.is_monochrome {
            mask |= format_mask::MONOCHROME;
        }
        mask
    }
}

/// Format bits combined into [`CaptureMeta::format_mask`]. Presets store the
/// set of formats they apply to; `0` in a preset means "any".
pub mod format_mask {
    pub const RAW: u32 = 1 << 0;
    pub const LDR: u32 = 1 << 1;
    pub const HDR: u32 = 1 << 2;
    pub const MONOCHROME: u32 = 1 << 3;
}

/// Width/height pair in sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// An image handle: the identifier plus everything the engine may read
/// without consulting the catalog again.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHandle {
    pub id: ImageId,
    pub dims: Dimensions,
    pub meta: CaptureMeta,
    pub flags: ImageFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

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
            change_timestamp: 0,
        }
    }

    #[test]
    fn format_mask_reflects_capture_kind() {
        let mut m = meta();
        assert_eq!(m.format_mask(), format_mask::RAW);
        m.is_monochrome = true;
        assert_eq!(m.format_mask(), format_mask::RAW | format_mask::MONOCHROME);
    }

    #[test]
    fn image_flags_round_trip_bits() {
        let f = ImageFlags::AUTO_PRESETS_APPLIED | ImageFlags::AUTO_PRESETS_APPLIED_SET_ONCE;
        let raw = f.bits();
        let back = ImageFlags::from_bits_truncate(raw);
        assert_eq!(back, f);
        assert!(!back.contains(ImageFlags::NO_LEGACY_PRESETS));
    }
}

//! Region-of-interest rectangles in pipeline-local coordinates.

use serde::{Deserialize, Serialize};

/// A rectangle plus the scale factor relating pipeline coordinates to full
/// sensor coordinates. `scale == 1.0` means native resolution; the preview
/// pipeline typically runs at a fraction of it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub scale: f32,
}

impl Roi {
    pub const fn new(x: i32, y: i32, width: u32, height: u32, scale: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            scale,
        }
    }

    /// Whole-image roi at the given scale.
    pub fn full(width: u32, height: u32, scale: f32) -> Self {
        Self::new(0, 0, width, height, scale)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clamp this roi into `[0, bounds)`. Offsets are pulled inside the image
    /// first, then the extent is trimmed to what remains.
    pub fn clamped_to(&self, bounds_w: u32, bounds_h: u32) -> Roi {
        let x = self.x.clamp(0, bounds_w as i32);
        let y = self.y.clamp(0, bounds_h as i32);
        let width = self.width.min(bounds_w.saturating_sub(x as u32));
        let height = self.height.min(bounds_h.saturating_sub(y as u32));
        Roi {
            x,
            y,
            width,
            height,
            scale: self.scale,
        }
    }

    /// Bytes the fingerprint fold consumes for this roi. Field order is part
    /// of the cache-key contract and must not change between runs.
    pub fn hash_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[0..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
        out[8..12].copy_from_slice(&self.width.to_le_bytes());
        out[12..16].copy_from_slice(&self.height.to_le_bytes());
        out[16..20].copy_from_slice(&self.scale.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_trims_offsets_and_extent() {
        let r = Roi::new(-10, 20, 100, 100, 1.0).clamped_to(64, 64);
        assert_eq!((r.x, r.y), (0, 20));
        assert_eq!((r.width, r.height), (64, 44));
    }

    #[test]
    fn clamp_beyond_bounds_is_empty() {
        let r = Roi::new(80, 80, 16, 16, 1.0).clamped_to(64, 64);
        assert!(r.is_empty());
    }

    #[test]
    fn hash_bytes_distinguish_scale() {
        let a = Roi::new(0, 0, 8, 8, 1.0);
        let b = Roi { scale: 0.5, ..a };
        assert_ne!(a.hash_bytes(), b.hash_bytes());
    }
}

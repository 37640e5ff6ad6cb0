//! Built-in reference operations.
//!
//! The real operation library is pluggable; these six modules exist so the
//! engine, the headless driver, and the test suites have a deterministic set
//! covering every capability class: a hidden force-enabled raw preparation
//! stage, point operations with blending, a convolution with interior
//! chunking, a geometric operation with a distort pair and a legacy
//! migration, and a display-only tail stage excluded from history.
//!
//! Parameter records are little-endian packed floats/ints with explicit
//! sizes, so persisted byte counts can be validated against the descriptor
//! exactly the way the loader does for third-party modules.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use core_image::{CaptureMeta, ColorSpace, DevError, DevResult, PixelBuffer};

use crate::{OpDescriptor, OpFlags, Operation, ProcessCtx, ProcessOutcome};

/// Rows processed between two shutdown polls.
const CHUNK_ROWS: u32 = 64;

pub fn all() -> Vec<Arc<dyn Operation>> {
    vec![
        Arc::new(RawPrepare::default()),
        Arc::new(Temperature::default()),
        Arc::new(Exposure::default()),
        Arc::new(Flip::default()),
        Arc::new(Sharpen::default()),
        Arc::new(Gamma::default()),
    ]
}

// --- parameter records ---------------------------------------------------

fn read_f32(bytes: &[u8], off: usize) -> Option<f32> {
    bytes
        .get(off..off + 4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u32(bytes: &[u8], off: usize) -> Option<u32> {
    bytes
        .get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn bad_params(op: &str) -> DevError {
    DevError::Malformed {
        what: "op params",
        detail: format!("`{op}` received a parameter record of the wrong shape"),
    }
}

/// Blend parameters shared by every `SUPPORTS_BLENDING` operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendParams {
    pub opacity: f32,
}

pub const BLEND_VERSION: i32 = 1;
pub const BLEND_PARAMS_SIZE: usize = 4;

impl BlendParams {
    pub const OPAQUE: BlendParams = BlendParams { opacity: 1.0 };

    pub fn to_bytes(self) -> Vec<u8> {
        self.opacity.to_le_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        read_f32(bytes, 0).map(|opacity| Self { opacity })
    }
}

/// Mix the processed output back toward the input by the blend opacity.
/// An empty record means the module ran without blending (fully opaque).
fn apply_blend(blend_bytes: &[u8], input: &PixelBuffer, output: &mut PixelBuffer) {
    let Some(blend) = BlendParams::from_bytes(blend_bytes) else {
        return;
    };
    let opacity = blend.opacity.clamp(0.0, 1.0);
    if opacity >= 1.0 {
        return;
    }
    let src = input.data();
    for (o, i) in output.data_mut().iter_mut().zip(src.iter()) {
        *o = *i * (1.0 - opacity) + *o * opacity;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureParams {
    /// Exposure correction in EV.
    pub ev: f32,
    /// Black point lift subtracted before the gain.
    pub black: f32,
}

impl ExposureParams {
    pub fn to_bytes(self) -> Vec<u8> {
        let mut v = Vec::with_capacity(8);
        v.extend_from_slice(&self.ev.to_le_bytes());
        v.extend_from_slice(&self.black.to_le_bytes());
        v
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            ev: read_f32(bytes, 0)?,
            black: read_f32(bytes, 4)?,
        })
    }
}

/// Version-1 exposure records stored EV as a little-endian i32 in hundredths
/// and had no black point. Kept for loader migration tests.
pub fn exposure_v1_bytes(centi_ev: i32) -> Vec<u8> {
    centi_ev.to_le_bytes().to_vec()
}

pub struct Exposure {
    desc: OpDescriptor,
}

impl Default for Exposure {
    fn default() -> Self {
        Self {
            desc: OpDescriptor {
                op: "exposure",
                version: 2,
                params_size: 8,
                default_params: ExposureParams { ev: 0.0, black: 0.0 }.to_bytes(),
                default_blend_params: BlendParams::OPAQUE.to_bytes(),
                blend_version: BLEND_VERSION,
                flags: OpFlags::SUPPORTS_BLENDING | OpFlags::ALLOW_TILING,
            },
        }
    }
}

impl Operation for Exposure {
    fn descriptor(&self) -> &OpDescriptor {
        &self.desc
    }

    fn process(
        &self,
        ctx: &ProcessCtx<'_>,
        input: &PixelBuffer,
        output: &mut PixelBuffer,
    ) -> DevResult<ProcessOutcome> {
        let p = ExposureParams::from_bytes(ctx.params).ok_or_else(|| bad_params("exposure"))?;
        let gain = 2f32.powf(p.ev);
        let (w, h) = (input.width(), input.height());
        for y0 in (0..h).step_by(CHUNK_ROWS as usize) {
            if ctx.shutdown.load(Ordering::Relaxed) {
                return Ok(ProcessOutcome::Interrupted);
            }
            let y1 = (y0 + CHUNK_ROWS).min(h);
            let span = (y0 as usize * w as usize * 4)..(y1 as usize * w as usize * 4);
            let src = &input.data()[span.clone()];
            let dst = &mut output.data_mut()[span];
            for (i, (o, v)) in dst.iter_mut().zip(src.iter()).enumerate() {
                // Alpha passes through untouched.
                *o = if i % 4 == 3 {
                    *v
                } else {
                    ((*v - p.black) * gain).max(0.0)
                };
            }
        }
        apply_blend(ctx.blend_params, input, output);
        Ok(ProcessOutcome::Done)
    }

    fn legacy_params(&self, old: &[u8], old_version: i32) -> DevResult<(Vec<u8>, i32)> {
        match old_version {
            1 => {
                let raw = old
                    .get(0..4)
                    .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .ok_or_else(|| bad_params("exposure"))?;
                let migrated = ExposureParams {
                    ev: raw as f32 / 100.0,
                    black: 0.0,
                };
                Ok((migrated.to_bytes(), self.desc.version))
            }
            v if v == self.desc.version && old.len() == self.desc.params_size => {
                Ok((old.to_vec(), v))
            }
            v => Err(DevError::Malformed {
                what: "op params",
                detail: format!("`exposure` has no migration from version {v}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureParams {
    pub red_gain: f32,
    pub blue_gain: f32,
}

impl TemperatureParams {
    pub fn to_bytes(self) -> Vec<u8> {
        let mut v = Vec::with_capacity(8);
        v.extend_from_slice(&self.red_gain.to_le_bytes());
        v.extend_from_slice(&self.blue_gain.to_le_bytes());
        v
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            red_gain: read_f32(bytes, 0)?,
            blue_gain: read_f32(bytes, 4)?,
        })
    }
}

pub struct Temperature {
    desc: OpDescriptor,
}

impl Default for Temperature {
    fn default() -> Self {
        Self {
            desc: OpDescriptor {
                op: "temperature",
                version: 1,
                params_size: 8,
                default_params: TemperatureParams {
                    red_gain: 1.0,
                    blue_gain: 1.0,
                }
                .to_bytes(),
                default_blend_params: BlendParams::OPAQUE.to_bytes(),
                blend_version: BLEND_VERSION,
                flags: OpFlags::ONE_INSTANCE | OpFlags::SUPPORTS_BLENDING | OpFlags::ALLOW_TILING,
            },
        }
    }
}

impl Operation for Temperature {
    fn descriptor(&self) -> &OpDescriptor {
        &self.desc
    }

    fn process(
        &self,
        ctx: &ProcessCtx<'_>,
        input: &PixelBuffer,
        output: &mut PixelBuffer,
    ) -> DevResult<ProcessOutcome> {
        let p =
            TemperatureParams::from_bytes(ctx.params).ok_or_else(|| bad_params("temperature"))?;
        let (w, h) = (input.width(), input.height());
        for y0 in (0..h).step_by(CHUNK_ROWS as usize) {
            if ctx.shutdown.load(Ordering::Relaxed) {
                return Ok(ProcessOutcome::Interrupted);
            }
            let y1 = (y0 + CHUNK_ROWS).min(h);
            let span = (y0 as usize * w as usize * 4)..(y1 as usize * w as usize * 4);
            let src = &input.data()[span.clone()];
            let dst = &mut output.data_mut()[span];
            for (i, (o, v)) in dst.iter_mut().zip(src.iter()).enumerate() {
                *o = match i % 4 {
                    0 => *v * p.red_gain,
                    2 => *v * p.blue_gain,
                    _ => *v,
                };
            }
        }
        apply_blend(ctx.blend_params, input, output);
        Ok(ProcessOutcome::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharpenParams {
    pub amount: f32,
}

impl SharpenParams {
    pub fn to_bytes(self) -> Vec<u8> {
        self.amount.to_le_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        read_f32(bytes, 0).map(|amount| Self { amount })
    }
}

pub struct Sharpen {
    desc: OpDescriptor,
}

impl Default for Sharpen {
    fn default() -> Self {
        Self {
            desc: OpDescriptor {
                op: "sharpen",
                version: 1,
                params_size: 4,
                default_params: SharpenParams { amount: 0.5 }.to_bytes(),
                default_blend_params: BlendParams::OPAQUE.to_bytes(),
                blend_version: BLEND_VERSION,
                flags: OpFlags::SUPPORTS_BLENDING,
            },
        }
    }
}

impl Operation for Sharpen {
    fn descriptor(&self) -> &OpDescriptor {
        &self.desc
    }

    /// Unsharp mask against a 3x3 box blur, edge-clamped.
    fn process(
        &self,
        ctx: &ProcessCtx<'_>,
        input: &PixelBuffer,
        output: &mut PixelBuffer,
    ) -> DevResult<ProcessOutcome> {
        let p = SharpenParams::from_bytes(ctx.params).ok_or_else(|| bad_params("sharpen"))?;
        let (w, h) = (input.width() as i64, input.height() as i64);
        for y0 in (0..h).step_by(CHUNK_ROWS as usize) {
            if ctx.shutdown.load(Ordering::Relaxed) {
                return Ok(ProcessOutcome::Interrupted);
            }
            let y1 = (y0 + CHUNK_ROWS as i64).min(h);
            for y in y0..y1 {
                for x in 0..w {
                    let mut blur = [0.0f32; 3];
                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            let sx = (x + dx).clamp(0, w - 1) as u32;
                            let sy = (y + dy).clamp(0, h - 1) as u32;
                            let px = input.pixel(sx, sy).unwrap_or([0.0; 4]);
                            for c in 0..3 {
                                blur[c] += px[c] / 9.0;
                            }
                        }
                    }
                    let center = input.pixel(x as u32, y as u32).unwrap_or([0.0; 4]);
                    let base = (y as usize * w as usize + x as usize) * 4;
                    let dst = output.data_mut();
                    for c in 0..3 {
                        dst[base + c] = (center[c] + p.amount * (center[c] - blur[c])).max(0.0);
                    }
                    dst[base + 3] = center[3];
                }
            }
        }
        apply_blend(ctx.blend_params, input, output);
        Ok(ProcessOutcome::Done)
    }
}

/// Orientation bits for [`Flip`].
pub mod orientation {
    pub const NONE: u32 = 0;
    pub const FLIP_X: u32 = 1;
    pub const FLIP_Y: u32 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlipParams {
    pub orientation: u32,
}

impl FlipParams {
    pub fn to_bytes(self) -> Vec<u8> {
        self.orientation.to_le_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        read_u32(bytes, 0).map(|orientation| Self { orientation })
    }
}

pub struct Flip {
    desc: OpDescriptor,
}

impl Default for Flip {
    fn default() -> Self {
        Self {
            desc: OpDescriptor {
                op: "flip",
                version: 2,
                params_size: 4,
                default_params: FlipParams {
                    orientation: orientation::NONE,
                }
                .to_bytes(),
                default_blend_params: Vec::new(),
                blend_version: 0,
                flags: OpFlags::ONE_INSTANCE | OpFlags::HIDE_ENABLE_BUTTON | OpFlags::DEFAULT_ENABLED,
            },
        }
    }
}

impl Operation for Flip {
    fn descriptor(&self) -> &OpDescriptor {
        &self.desc
    }

    fn process(
        &self,
        ctx: &ProcessCtx<'_>,
        input: &PixelBuffer,
        output: &mut PixelBuffer,
    ) -> DevResult<ProcessOutcome> {
        let p = FlipParams::from_bytes(ctx.params).ok_or_else(|| bad_params("flip"))?;
        let (w, h) = (input.width(), input.height());
        let flip_x = p.orientation & orientation::FLIP_X != 0;
        let flip_y = p.orientation & orientation::FLIP_Y != 0;
        for y0 in (0..h).step_by(CHUNK_ROWS as usize) {
            if ctx.shutdown.load(Ordering::Relaxed) {
                return Ok(ProcessOutcome::Interrupted);
            }
            let y1 = (y0 + CHUNK_ROWS).min(h);
            for y in y0..y1 {
                let sy = if flip_y { h - 1 - y } else { y };
                for x in 0..w {
                    let sx = if flip_x { w - 1 - x } else { x };
                    let px = input.pixel(sx, sy).unwrap_or([0.0; 4]);
                    let base = (y as usize * w as usize + x as usize) * 4;
                    output.data_mut()[base..base + 4].copy_from_slice(&px);
                }
            }
        }
        Ok(ProcessOutcome::Done)
    }

    fn distort_transform(&self, params: &[u8], dims: (u32, u32), points: &mut [(f32, f32)]) {
        let Some(p) = FlipParams::from_bytes(params) else {
            return;
        };
        let (w, h) = (dims.0 as f32, dims.1 as f32);
        for pt in points.iter_mut() {
            if p.orientation & orientation::FLIP_X != 0 {
                pt.0 = w - pt.0;
            }
            if p.orientation & orientation::FLIP_Y != 0 {
                pt.1 = h - pt.1;
            }
        }
    }

    fn distort_backtransform(&self, params: &[u8], dims: (u32, u32), points: &mut [(f32, f32)]) {
        // Mirroring is involutive; forward and backward coincide.
        self.distort_transform(params, dims, points);
    }

    /// Version-1 flip rows predate the orientation record entirely; they are
    /// migrated to the default orientation (the loader also force-enables
    /// such rows so the image keeps rendering).
    fn legacy_params(&self, old: &[u8], old_version: i32) -> DevResult<(Vec<u8>, i32)> {
        match old_version {
            1 => Ok((self.desc.default_params.clone(), self.desc.version)),
            v if v == self.desc.version && old.len() == self.desc.params_size => {
                Ok((old.to_vec(), v))
            }
            v => Err(DevError::Malformed {
                what: "op params",
                detail: format!("`flip` has no migration from version {v}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPrepareParams {
    pub black_level: f32,
    pub white_point: f32,
}

impl RawPrepareParams {
    pub fn to_bytes(self) -> Vec<u8> {
        let mut v = Vec::with_capacity(8);
        v.extend_from_slice(&self.black_level.to_le_bytes());
        v.extend_from_slice(&self.white_point.to_le_bytes());
        v
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            black_level: read_f32(bytes, 0)?,
            white_point: read_f32(bytes, 4)?,
        })
    }
}

pub struct RawPrepare {
    desc: OpDescriptor,
}

impl Default for RawPrepare {
    fn default() -> Self {
        Self {
            desc: OpDescriptor {
                op: "rawprepare",
                version: 1,
                params_size: 8,
                default_params: RawPrepareParams {
                    black_level: 0.002,
                    white_point: 1.0,
                }
                .to_bytes(),
                default_blend_params: Vec::new(),
                blend_version: 0,
                flags: OpFlags::HIDDEN
                    | OpFlags::ONE_INSTANCE
                    | OpFlags::DEFAULT_ENABLED
                    | OpFlags::HIDE_ENABLE_BUTTON
                    | OpFlags::ALLOW_TILING,
            },
        }
    }
}

impl Operation for RawPrepare {
    fn descriptor(&self) -> &OpDescriptor {
        &self.desc
    }

    fn process(
        &self,
        ctx: &ProcessCtx<'_>,
        input: &PixelBuffer,
        output: &mut PixelBuffer,
    ) -> DevResult<ProcessOutcome> {
        let p =
            RawPrepareParams::from_bytes(ctx.params).ok_or_else(|| bad_params("rawprepare"))?;
        let range = (p.white_point - p.black_level).max(f32::EPSILON);
        let (w, h) = (input.width(), input.height());
        for y0 in (0..h).step_by(CHUNK_ROWS as usize) {
            if ctx.shutdown.load(Ordering::Relaxed) {
                return Ok(ProcessOutcome::Interrupted);
            }
            let y1 = (y0 + CHUNK_ROWS).min(h);
            let span = (y0 as usize * w as usize * 4)..(y1 as usize * w as usize * 4);
            let src = &input.data()[span.clone()];
            let dst = &mut output.data_mut()[span];
            for (i, (o, v)) in dst.iter_mut().zip(src.iter()).enumerate() {
                *o = if i % 4 == 3 {
                    *v
                } else {
                    ((*v - p.black_level) / range).clamp(0.0, 1.0)
                };
            }
        }
        output.colorspace = ColorSpace::LinearRgb;
        Ok(ProcessOutcome::Done)
    }

    /// High-ISO captures get a raised black level.
    fn reload_defaults(&self, meta: &CaptureMeta) -> Vec<u8> {
        let black_level = if meta.iso >= 3200.0 { 0.004 } else { 0.002 };
        RawPrepareParams {
            black_level,
            white_point: 1.0,
        }
        .to_bytes()
    }
}

pub struct Gamma {
    desc: OpDescriptor,
}

impl Default for Gamma {
    fn default() -> Self {
        Self {
            desc: OpDescriptor {
                op: "gamma",
                version: 1,
                params_size: 0,
                default_params: Vec::new(),
                default_blend_params: Vec::new(),
                blend_version: 0,
                flags: OpFlags::HIDDEN
                    | OpFlags::ONE_INSTANCE
                    | OpFlags::NO_HISTORY_STACK
                    | OpFlags::DEFAULT_ENABLED
                    | OpFlags::HIDE_ENABLE_BUTTON,
            },
        }
    }
}

impl Operation for Gamma {
    fn descriptor(&self) -> &OpDescriptor {
        &self.desc
    }

    fn process(
        &self,
        ctx: &ProcessCtx<'_>,
        input: &PixelBuffer,
        output: &mut PixelBuffer,
    ) -> DevResult<ProcessOutcome> {
        let (w, h) = (input.width(), input.height());
        let inv = 1.0 / 2.2;
        for y0 in (0..h).step_by(CHUNK_ROWS as usize) {
            if ctx.shutdown.load(Ordering::Relaxed) {
                return Ok(ProcessOutcome::Interrupted);
            }
            let y1 = (y0 + CHUNK_ROWS).min(h);
            let span = (y0 as usize * w as usize * 4)..(y1 as usize * w as usize * 4);
            let src = &input.data()[span.clone()];
            let dst = &mut output.data_mut()[span];
            for (i, (o, v)) in dst.iter_mut().zip(src.iter()).enumerate() {
                *o = if i % 4 == 3 { *v } else { v.max(0.0).powf(inv) };
            }
        }
        output.colorspace = ColorSpace::DisplayRgb;
        Ok(ProcessOutcome::Done)
    }
}

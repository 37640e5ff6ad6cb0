//! Configuration loading and parsing.
//!
//! Parses `darkroom.toml` (or an override path provided by the binary).
//! Unknown fields are ignored (TOML deserialization tolerance) so the file
//! can grow without breaking older builds; every section carries serde
//! defaults so a partial file is as good as a full one. Values with hard
//! validity constraints (preview downsample divisor, queue depth) are
//! clamped at load and the raw parsed value retained.

use anyhow::Result;
use serde::Deserialize;
use std::{fs, path::PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
pub struct AutosaveConfig {
    #[serde(default = "AutosaveConfig::default_enabled")]
    pub enabled: bool,
    /// Minimum seconds between two autosave writes.
    #[serde(default = "AutosaveConfig::default_delay_secs")]
    pub delay_secs: f32,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            delay_secs: Self::default_delay_secs(),
        }
    }
}

impl AutosaveConfig {
    const fn default_enabled() -> bool {
        true
    }
    const fn default_delay_secs() -> f32 {
        10.0
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UndoConfig {
    /// Edits to the same target within this window merge into one
    /// checkpoint.
    #[serde(default = "UndoConfig::default_merge_same_secs")]
    pub merge_same_secs: f32,
    /// Hard cap on how long one checkpoint keeps absorbing edits.
    #[serde(default = "UndoConfig::default_review_secs")]
    pub review_secs: f32,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            merge_same_secs: Self::default_merge_same_secs(),
            review_secs: Self::default_review_secs(),
        }
    }
}

impl UndoConfig {
    const fn default_merge_same_secs() -> f32 {
        2.0
    }
    const fn default_review_secs() -> f32 {
        8.0
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreviewConfig {
    /// Downsampling divisor of the preview source; valid values 1..=4.
    #[serde(default = "PreviewConfig::default_downsample")]
    pub downsample: u32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            downsample: Self::default_downsample(),
        }
    }
}

impl PreviewConfig {
    const fn default_downsample() -> u32 {
        1
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_max_entries")]
    pub max_entries_per_pipe: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries_per_pipe: Self::default_max_entries(),
        }
    }
}

impl CacheConfig {
    const fn default_max_entries() -> usize {
        24
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "ScheduleConfig::default_queue_cap")]
    pub queue_cap: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            queue_cap: Self::default_queue_cap(),
        }
    }
}

impl ScheduleConfig {
    const fn default_queue_cap() -> usize {
        4
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WaitHashConfigFile {
    #[serde(default = "WaitHashConfigFile::default_period_ms")]
    pub period_ms: u64,
    #[serde(default = "WaitHashConfigFile::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for WaitHashConfigFile {
    fn default() -> Self {
        Self {
            period_ms: Self::default_period_ms(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl WaitHashConfigFile {
    const fn default_period_ms() -> u64 {
        5
    }
    const fn default_timeout_ms() -> u64 {
        250
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkflowConfig {
    /// One of `scene-referred`, `display-referred`, `legacy`, `none`.
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub autosave: AutosaveConfig,
    #[serde(default)]
    pub undo: UndoConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub waithash: WaitHashConfigFile,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub raw: Option<String>, // original file string (optional)
    pub file: ConfigFile,    // parsed (or default) data
    /// Downsample divisor after clamping into the supported set.
    pub effective_downsample: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_file(None, ConfigFile::default())
    }
}

impl Config {
    fn from_file(raw: Option<String>, file: ConfigFile) -> Self {
        let effective_downsample = file.preview.downsample.clamp(1, 4);
        Self {
            raw,
            file,
            effective_downsample,
        }
    }
}

/// Best-effort config path following platform conventions.
pub fn discover() -> PathBuf {
    // Prefer a working-directory `darkroom.toml` before the platform config
    // dir.
    let local = PathBuf::from("darkroom.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("darkroom").join("darkroom.toml");
    }
    PathBuf::from("darkroom.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => {
                info!(target: "config", path = %path.display(), "config loaded");
                Ok(Config::from_file(Some(content), file))
            }
            Err(e) => {
                tracing::warn!(target: "config", path = %path.display(), error = %e, "config parse failed, using defaults");
                Ok(Config::from_file(Some(content), ConfigFile::default()))
            }
        }
    } else {
        Ok(Config::from_file(None, ConfigFile::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let cfg = load_from(Some(PathBuf::from("/nonexistent/darkroom.toml"))).unwrap();
        assert!(cfg.file.autosave.enabled);
        assert_eq!(cfg.file.preview.downsample, 1);
        assert_eq!(cfg.effective_downsample, 1);
        assert!(cfg.raw.is_none());
    }

    #[test]
    fn partial_file_fills_missing_sections() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[preview]\ndownsample = 2\n").unwrap();
        let cfg = load_from(Some(f.path().to_path_buf())).unwrap();
        assert_eq!(cfg.effective_downsample, 2);
        assert_eq!(cfg.file.undo.merge_same_secs, 2.0, "untouched section defaults");
    }

    #[test]
    fn out_of_range_downsample_clamps() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[preview]\ndownsample = 9\n").unwrap();
        let cfg = load_from(Some(f.path().to_path_buf())).unwrap();
        assert_eq!(cfg.effective_downsample, 4);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[future_section]\nsetting = true\n[autosave]\ndelay_secs = 3.5\n").unwrap();
        let cfg = load_from(Some(f.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.autosave.delay_secs, 3.5);
    }

    #[test]
    fn malformed_file_degrades_to_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "not [valid toml").unwrap();
        let cfg = load_from(Some(f.path().to_path_buf())).unwrap();
        assert!(cfg.raw.is_some(), "raw content retained for diagnostics");
        assert!(cfg.file.autosave.enabled);
    }
}

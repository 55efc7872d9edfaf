//! Book and render settings, plus the per-page crop store
//!
//! Settings are read by the render thread and snapshotted into a
//! [`DecodeOptions`] at submission time, so decodes already in flight are
//! unaffected by settings changes.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::geometry::RectF;

/// Neutral contrast level, in percent
pub const DEFAULT_CONTRAST: i32 = 100;

/// Neutral exposure level; the applied delta is `exposure - DEFAULT_EXPOSURE`
pub const DEFAULT_EXPOSURE: i32 = 100;

/// Per-book viewing settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BookSettings {
    /// Crop page margins to the detected or manual content region
    #[serde(default)]
    pub crop_pages: bool,

    /// Invert page colors for night reading
    #[serde(default)]
    pub night_mode: bool,

    /// Contrast in percent, 100 = unchanged
    #[serde(default = "default_contrast")]
    pub contrast: i32,

    /// Exposure level, 100 = unchanged
    #[serde(default = "default_exposure")]
    pub exposure: i32,

    /// Stretch the page's luminance range to full scale
    #[serde(default)]
    pub auto_levels: bool,
}

fn default_contrast() -> i32 {
    DEFAULT_CONTRAST
}

fn default_exposure() -> i32 {
    DEFAULT_EXPOSURE
}

impl Default for BookSettings {
    fn default() -> Self {
        Self {
            crop_pages: false,
            night_mode: false,
            contrast: DEFAULT_CONTRAST,
            exposure: DEFAULT_EXPOSURE,
            auto_levels: false,
        }
    }
}

/// Process-wide render configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Replace pixel content of an already-allocated tile bitmap in place
    /// instead of allocating a new one
    #[serde(default = "default_texture_reuse")]
    pub texture_reuse: bool,
}

fn default_texture_reuse() -> bool {
    true
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { texture_reuse: true }
    }
}

/// Immutable per-submission snapshot of everything a decode needs to know
/// about correction and bitmap handling.
#[derive(Clone, Copy, Debug)]
pub struct DecodeOptions {
    pub contrast: i32,
    pub exposure: i32,
    pub auto_levels: bool,
    pub invert: bool,
    pub texture_reuse: bool,
}

impl DecodeOptions {
    #[must_use]
    pub fn snapshot(book: &BookSettings, config: &RenderConfig) -> Self {
        Self {
            contrast: book.contrast,
            exposure: book.exposure,
            auto_levels: book.auto_levels,
            invert: book.night_mode,
            texture_reuse: config.texture_reuse,
        }
    }

    /// Whether any pixel-level correction must run on the decoded payload
    #[must_use]
    pub fn needs_correction(&self) -> bool {
        self.contrast != DEFAULT_CONTRAST
            || self.exposure != DEFAULT_EXPOSURE
            || self.auto_levels
            || self.invert
    }
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self::snapshot(&BookSettings::default(), &RenderConfig::default())
    }
}

/// Persisted cropping state for one page's root tile
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PageInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_cropping: Option<RectF>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_cropping: Option<RectF>,
}

/// Root-tile crop rectangles per page, persisted as YAML.
///
/// Read once at tree construction and written only on committed root-node
/// crop edits. A store without a backing path keeps everything in memory,
/// which is what tests and short-lived embedders use.
#[derive(Debug, Default)]
pub struct PageCropStore {
    path: Option<PathBuf>,
    entries: HashMap<usize, PageInfo>,
}

impl PageCropStore {
    /// In-memory store with no persistence
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a file-backed store, loading existing entries if the file exists
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read crop store {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse crop store {}", path.display()))?
        } else {
            HashMap::new()
        };

        debug!(
            "crop store opened: {} ({} pages)",
            path.display(),
            entries.len()
        );

        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    #[must_use]
    pub fn get(&self, page: usize) -> Option<&PageInfo> {
        self.entries.get(&page)
    }

    pub fn update_auto(&mut self, page: usize, crop: Option<RectF>) -> Result<()> {
        self.entries.entry(page).or_default().auto_cropping = crop;
        self.save()
    }

    pub fn update_manual(&mut self, page: usize, crop: Option<RectF>) -> Result<()> {
        self.entries.entry(page).or_default().manual_cropping = crop;
        self.save()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let contents = serde_yaml::to_string(&self.entries).context("failed to serialize crops")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write crop store {}", path.display()))?;

        info!("crop store saved: {} pages", self.entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_need_no_correction() {
        let opts = DecodeOptions::default();
        assert!(!opts.needs_correction());
    }

    #[test]
    fn night_mode_needs_correction() {
        let book = BookSettings {
            night_mode: true,
            ..BookSettings::default()
        };
        let opts = DecodeOptions::snapshot(&book, &RenderConfig::default());
        assert!(opts.needs_correction());
        assert!(opts.invert);
    }

    #[test]
    fn contrast_off_default_needs_correction() {
        let book = BookSettings {
            contrast: 140,
            ..BookSettings::default()
        };
        let opts = DecodeOptions::snapshot(&book, &RenderConfig::default());
        assert!(opts.needs_correction());
    }

    #[test]
    fn store_round_trip_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("crops.yaml");

        let mut store = PageCropStore::open(path.clone()).expect("open");
        store
            .update_manual(10, Some(RectF::new(0.1, 0.1, 0.9, 0.9)))
            .expect("update");
        store
            .update_auto(3, Some(RectF::new(0.0, 0.05, 1.0, 0.95)))
            .expect("update");

        let reloaded = PageCropStore::open(path).expect("reopen");
        let info = reloaded.get(10).expect("page 10 present");
        let manual = info.manual_cropping.expect("manual crop present");
        assert!((manual.left - 0.1).abs() < 1e-6);
        assert!((manual.bottom - 0.9).abs() < 1e-6);
        assert!(reloaded
            .get(3)
            .expect("page 3 present")
            .auto_cropping
            .is_some());
        assert!(reloaded.get(7).is_none());
    }

    #[test]
    fn in_memory_store_does_not_touch_disk() {
        let mut store = PageCropStore::in_memory();
        store
            .update_manual(0, Some(RectF::new(0.2, 0.2, 0.8, 0.8)))
            .expect("update");
        assert!(store.get(0).is_some());
    }
}

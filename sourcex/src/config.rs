//! Run configuration, read from YAML.
//!
//! Every section has defaults, so an empty document is a valid
//! configuration. Plugin settings live under `plugins`, one section per
//! name; each section must be claimed by a task factory through
//! [`ConfigDependencies`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tile::{PixelKind, TileStoreConfig};

// ============================================================================
// Sections
// ============================================================================

/// One input image and its photometric description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Raw row-major image file.
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub pixel_kind: PixelKind,
    pub background: f64,
    pub gain: f64,
    /// Pixel value at which the detector saturates. `0` disables the check.
    pub saturation: f64,
    /// Pixel offset of this frame relative to the detection frame.
    pub offset_x: f64,
    pub offset_y: f64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            width: 0,
            height: 0,
            pixel_kind: PixelKind::Float32,
            background: 0.0,
            gain: 1.0,
            saturation: 0.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub detection: Option<FrameConfig>,
    pub measurement: Vec<FrameConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Detection threshold above background, in pixel units.
    pub threshold: f64,
    /// Detections with fewer pixels are discarded.
    pub min_area: usize,
    /// Rows scanned between two progress reports.
    pub progress_interval_rows: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 1.5,
            min_area: 3,
            progress_interval_rows: 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Measurement worker count. `0` means one per available core.
    pub thread_count: usize,
    /// Canonical id given to the first source of a run.
    pub first_source_id: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            first_source_id: 1,
        }
    }
}

impl PipelineConfig {
    pub fn effective_thread_count(&self) -> usize {
        if self.thread_count > 0 {
            return self.thread_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Columns to write, in order. Empty selects every registered column.
    pub columns: Vec<String>,
    /// Catalog file; standard output when unset.
    pub path: Option<PathBuf>,
    /// Writes detected groups to this file for a later recovered run.
    pub store_bypass: Option<PathBuf>,
    /// Replays groups from this file instead of running detection.
    pub recover_bypass: Option<PathBuf>,
}

// ============================================================================
// Config
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input: InputConfig,
    pub detection: DetectionConfig,
    pub tiles: TileStoreConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
    pub plugins: BTreeMap<String, serde_yml::Value>,
}

impl Config {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config = serde_yml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.tiles.validate()?;
        if !self.detection.threshold.is_finite() {
            return Err(Error::Config(format!(
                "detection threshold must be finite, got {}",
                self.detection.threshold
            )));
        }
        if self.detection.progress_interval_rows == 0 {
            return Err(Error::Config(
                "progress_interval_rows must be at least 1".to_string(),
            ));
        }
        if self.pipeline.first_source_id == 0 {
            return Err(Error::Config("first_source_id must be at least 1".to_string()));
        }
        if self.output.store_bypass.is_some()
            && self.output.store_bypass == self.output.recover_bypass
        {
            return Err(Error::Config(
                "store_bypass and recover_bypass point to the same file".to_string(),
            ));
        }
        let frames = self.input.detection.iter().chain(&self.input.measurement);
        for frame in frames {
            if frame.gain <= 0.0 {
                return Err(Error::Config(format!(
                    "gain of '{}' must be positive, got {}",
                    frame.path.display(),
                    frame.gain
                )));
            }
        }
        Ok(())
    }

    /// Deserializes plugin section `name`, or returns `T::default()` when
    /// the section is absent.
    pub fn plugin_section<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        match self.plugins.get(name) {
            None => Ok(T::default()),
            Some(value) => serde_yml::from_value(value.clone()).map_err(|err| {
                Error::Config(format!("plugin section '{}': {}", name, err))
            }),
        }
    }

    /// Fails on the first plugin section no factory declared.
    pub fn check_sections(&self, deps: &ConfigDependencies) -> Result<()> {
        match self.plugins.keys().find(|name| !deps.contains(name)) {
            Some(name) => Err(Error::UnknownConfigSection(name.clone())),
            None => Ok(()),
        }
    }
}

/// Plugin sections declared by task factories.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigDependencies {
    sections: BTreeSet<String>,
}

impl ConfigDependencies {
    pub fn declare(&mut self, section: impl Into<String>) {
        self.sections.insert(section.into());
    }

    pub fn contains(&self, section: &str) -> bool {
        self.sections.contains(section)
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Photometry {
        magnitude_zero_point: f64,
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_yaml_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.tiles.tile_width, 256);
        assert_eq!(config.pipeline.first_source_id, 1);
    }

    #[test]
    fn parses_sections_and_plugins() {
        let config = Config::from_yaml_str(
            r#"
detection:
  threshold: 4.0
  min_area: 5
tiles:
  tile_width: 64
  tile_height: 32
  max_memory_bytes: 1048576
pipeline:
  thread_count: 3
input:
  detection:
    path: image.raw
    width: 100
    height: 80
    pixel_kind: float64
    saturation: 60000.0
output:
  columns: [source_id, isophotal_flux]
plugins:
  photometry:
    magnitude_zero_point: 25.0
"#,
        )
        .unwrap();

        assert_eq!(config.detection.threshold, 4.0);
        assert_eq!(config.detection.min_area, 5);
        assert_eq!(config.detection.progress_interval_rows, 16);
        assert_eq!(config.tiles.tile_height, 32);
        assert_eq!(config.pipeline.effective_thread_count(), 3);
        let detection = config.input.detection.as_ref().unwrap();
        assert_eq!(detection.pixel_kind, PixelKind::Float64);
        assert_eq!(detection.gain, 1.0);
        assert_eq!(config.output.columns, ["source_id", "isophotal_flux"]);

        let photometry: Photometry = config.plugin_section("photometry").unwrap();
        assert_eq!(photometry.magnitude_zero_point, 25.0);
        let missing: Photometry = config.plugin_section("astrometry").unwrap();
        assert_eq!(missing, Photometry::default());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            Config::from_yaml_str("tiles: {tile_width: 0}"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_yaml_str("pipeline: {first_source_id: 0}"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_yaml_str("detection: 7"),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn unclaimed_plugin_section_is_an_error() {
        let config = Config::from_yaml_str("plugins: {photometry: {}, psf: {}}").unwrap();
        let mut deps = ConfigDependencies::default();
        deps.declare("photometry");

        match config.check_sections(&deps) {
            Err(Error::UnknownConfigSection(name)) => assert_eq!(name, "psf"),
            other => panic!("expected UnknownConfigSection, got {:?}", other),
        }
        deps.declare("psf");
        config.check_sections(&deps).unwrap();
    }

    #[test]
    fn from_file_reports_path() {
        let err = Config::from_file("/nonexistent/sourcex.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/sourcex.yaml"));
    }
}

//! Export job configuration
//!
//! Read from a TOML file with `[grid]`, `[output]` and `[data]` sections.
//! Every field has a default, so an empty file is a valid configuration.
//! Relative paths are resolved against the directory of the file they were
//! read from.

use std::path::{Path, PathBuf};

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::builder::{BuildOptions, TilePolicy};
use crate::codec::{ByteOrder, ValueEncoding, ValueType};
use crate::container::{BlockCompression, WriteOptions, DEFAULT_GRID_NAME};
use crate::error::{config_error, IoContext, VdbError, VdbResult};
use crate::tree::TreeLayout;
use crate::volume::Roi;

/// Frames or channels to export
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawSelection", into = "RawSelection")]
pub enum Selection {
    #[default]
    All,
    Only(Vec<usize>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawSelection {
    Keyword(String),
    Single(usize),
    List(Vec<usize>),
}

impl TryFrom<RawSelection> for Selection {
    type Error = String;

    fn try_from(raw: RawSelection) -> Result<Self, Self::Error> {
        match raw {
            RawSelection::Keyword(word) if word == "all" => Ok(Selection::All),
            RawSelection::Keyword(word) => Err(format!(
                "expected \"all\" or a list of indices, found {:?}",
                word
            )),
            RawSelection::Single(index) => Ok(Selection::Only(vec![index])),
            RawSelection::List(indices) => Ok(Selection::Only(indices)),
        }
    }
}

impl From<Selection> for RawSelection {
    fn from(selection: Selection) -> Self {
        match selection {
            Selection::All => RawSelection::Keyword("all".to_string()),
            Selection::Only(indices) => RawSelection::List(indices),
        }
    }
}

impl Selection {
    /// Sorted, de-duplicated indices below `total`
    pub fn resolve(&self, total: usize, what: &str) -> VdbResult<Vec<usize>> {
        match self {
            Selection::All => Ok((0..total).collect()),
            Selection::Only(indices) => {
                if let Some(bad) = indices.iter().find(|&&i| i >= total) {
                    return Err(config_error(format!(
                        "{} {} is out of range (have {})",
                        what, bad, total
                    )));
                }
                let mut indices = indices.clone();
                indices.sort_unstable();
                indices.dedup();
                Ok(indices)
            }
        }
    }
}

/// `[grid]`: how volumes become trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridSection {
    pub name: String,
    pub background: f32,
    pub tolerance: f32,
    /// Branching factors, top internal level first, leaf last
    pub log2_dims: Vec<u32>,
    pub tile_policy: TilePolicy,
    /// Worker threads, 0 for all cores
    pub workers: usize,
}

impl Default for GridSection {
    fn default() -> Self {
        Self {
            name: DEFAULT_GRID_NAME.to_string(),
            background: 0.0,
            tolerance: 0.0,
            log2_dims: TreeLayout::default().log2_dims().to_vec(),
            tile_policy: TilePolicy::default(),
            workers: 0,
        }
    }
}

/// `[output]`: where and how files are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSection {
    pub dir: PathBuf,
    pub value_type: ValueType,
    pub byte_order: ByteOrder,
    pub compression: BlockCompression,
    pub checksum: bool,
    pub write_stats: bool,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("openvdb"),
            value_type: ValueType::F32,
            byte_order: ByteOrder::Little,
            compression: BlockCompression::None,
            checksum: true,
            write_stats: true,
        }
    }
}

/// Sample width of a raw input file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    U8,
    #[default]
    U16,
}

impl SampleType {
    pub fn width(self) -> usize {
        match self {
            SampleType::U8 => 1,
            SampleType::U16 => 2,
        }
    }
}

/// Raw little-endian stack, x fastest, then y, z, frame and channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSource {
    pub path: PathBuf,
    /// `[x, y, z, frames, channels]`
    pub dims: [usize; 5],
    #[serde(default)]
    pub sample: SampleType,
}

/// `[data]`: which part of the input to export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataSection {
    pub frames: Selection,
    pub channels: Selection,
    pub um_per_pix: f64,
    pub um_per_z: f64,
    pub roi: Option<Roi>,
    /// Rescale each channel's time series to 0..=255
    pub normalize: bool,
    pub raw: Option<RawSource>,
}

impl DataSection {
    /// Frames to export; a ROI bound to a frame overrides `frames`
    pub fn frame_selection(&self) -> Selection {
        match self.roi.and_then(|roi| roi.t) {
            Some(t) => Selection::Only(vec![t]),
            None => self.frames.clone(),
        }
    }
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            frames: Selection::All,
            channels: Selection::All,
            um_per_pix: 1.0,
            um_per_z: 1.0,
            roi: None,
            normalize: true,
            raw: None,
        }
    }
}

/// Complete export configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    pub grid: GridSection,
    pub output: OutputSection,
    pub data: DataSection,
}

impl ExportConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> VdbResult<Self> {
        let config: ExportConfig =
            toml::from_str(raw).map_err(|e| config_error(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, resolving relative paths against its directory
    pub fn load(path: &Path) -> VdbResult<Self> {
        let raw = std::fs::read_to_string(path).io_context("read config", path)?;
        let mut config = Self::from_toml_str(&raw).map_err(|e| match e {
            VdbError::Config(reason) => config_error(format!("{}: {}", path.display(), reason)),
            other => other,
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        log::info!("Loaded export configuration from {}", path.display());
        Ok(config)
    }

    /// Make relative paths relative to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.output.dir.is_relative() {
            self.output.dir = base.join(&self.output.dir);
        }
        if let Some(raw) = self.data.raw.as_mut() {
            if raw.path.is_relative() {
                raw.path = base.join(&raw.path);
            }
        }
    }

    pub fn validate(&self) -> VdbResult<()> {
        if self.grid.name.is_empty() {
            return Err(config_error("grid name must not be empty"));
        }
        self.build_options()?.validate()?;

        self.output
            .compression
            .ensure_available()
            .map_err(|e| config_error(e.to_string()))?;

        for (what, value) in [("um_per_pix", self.data.um_per_pix), ("um_per_z", self.data.um_per_z)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(config_error(format!("{} must be positive, got {}", what, value)));
            }
        }

        if let Some(roi) = &self.data.roi {
            if roi.width() == 0 || roi.height() == 0 {
                return Err(config_error(format!("region of interest {:?} is empty", roi)));
            }
        }

        if let Some(raw) = &self.data.raw {
            if raw.dims.iter().any(|&d| d == 0) {
                return Err(config_error(format!(
                    "raw dimensions {:?} contain zero",
                    raw.dims
                )));
            }
        }
        Ok(())
    }

    pub fn build_options(&self) -> VdbResult<BuildOptions> {
        Ok(BuildOptions {
            layout: TreeLayout::new(self.grid.log2_dims.clone())?,
            background: self.grid.background,
            tolerance: self.grid.tolerance,
            tile_policy: self.grid.tile_policy,
            workers: self.grid.workers,
        })
    }

    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            encoding: ValueEncoding::new(self.output.value_type, self.output.byte_order),
            compression: self.output.compression,
            checksum: self.output.checksum,
            write_stats: self.output.write_stats,
        }
    }

    /// Voxel spacing in micrometres
    pub fn spacing(&self) -> DVec3 {
        DVec3::new(self.data.um_per_pix, self.data.um_per_pix, self.data.um_per_z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ExportConfig::from_toml_str("").expect("empty config is valid");
        assert_eq!(config, ExportConfig::default());
        assert_eq!(config.grid.name, "density");
        assert_eq!(config.grid.log2_dims, vec![5, 4, 3]);
        assert!(config.output.checksum);
        assert!(config.data.normalize);
    }

    #[test]
    fn test_full_document() {
        let raw = r#"
            [grid]
            name = "nuclei"
            background = 1.0
            tolerance = 0.5
            log2_dims = [4, 3]
            tile_policy = "disabled"
            workers = 2

            [output]
            dir = "out"
            value_type = "u16"
            byte_order = "big"
            compression = "zlib"
            checksum = false
            write_stats = false

            [data]
            frames = [3, 1, 3]
            channels = "all"
            um_per_pix = 0.2
            um_per_z = 0.5
            roi = { left = 10, top = 4, right = 2, bottom = 20 }
            normalize = false
            raw = { path = "stack.raw", dims = [64, 64, 10, 5, 2], sample = "u8" }
        "#;
        let config = ExportConfig::from_toml_str(raw).expect("config is valid");

        assert_eq!(config.grid.tile_policy, TilePolicy::Disabled);
        assert_eq!(config.write_options().encoding.byte_order, ByteOrder::Big);
        assert_eq!(config.write_options().compression, BlockCompression::Zlib);
        assert_eq!(config.data.frames, Selection::Only(vec![3, 1, 3]));
        assert_eq!(config.data.frames.resolve(5, "frame").expect("in range"), vec![1, 3]);
        assert_eq!(config.data.channels.resolve(2, "channel").expect("in range"), vec![0, 1]);
        assert_eq!(config.spacing(), DVec3::new(0.2, 0.2, 0.5));

        let roi = config.data.roi.expect("roi present");
        assert_eq!((roi.width(), roi.height()), (8, 16));

        let options = config.build_options().expect("valid layout");
        assert_eq!(options.layout.log2_dims(), &[4, 3]);
        assert_eq!(options.workers, 2);
    }

    #[test]
    fn test_single_index_selection() {
        let config = ExportConfig::from_toml_str("[data]\nchannels = 1\n").expect("valid");
        assert_eq!(config.data.channels, Selection::Only(vec![1]));
    }

    #[test]
    fn test_rejections() {
        let cases = [
            "[grid]\nlog2_dims = []\n",
            "[grid]\nlog2_dims = [9]\n",
            "[grid]\ntolerance = -1.0\n",
            "[grid]\nname = \"\"\n",
            "[data]\num_per_z = 0.0\n",
            "[data]\nframes = \"some\"\n",
            "[data]\nroi = { left = 3, top = 0, right = 3, bottom = 5 }\n",
            "[output]\nvalue_type = \"i8\"\n",
            "[unknown]\nkey = 1\n",
        ];
        for raw in cases {
            let result = ExportConfig::from_toml_str(raw);
            assert!(matches!(result, Err(VdbError::Config(_))), "{:?} -> {:?}", raw, result);
        }
    }

    #[test]
    fn test_roi_frame_narrows_frames() {
        let raw = r#"
            [data]
            frames = "all"
            roi = { left = 0, top = 0, right = 4, bottom = 4, t = 2 }
        "#;
        let config = ExportConfig::from_toml_str(raw).expect("valid");
        assert_eq!(config.data.roi.and_then(|roi| roi.t), Some(2));
        assert_eq!(config.data.frame_selection(), Selection::Only(vec![2]));

        let config = ExportConfig::from_toml_str("[data]\nframes = [1, 3]\n").expect("valid");
        assert_eq!(config.data.frame_selection(), Selection::Only(vec![1, 3]));
    }

    #[test]
    fn test_out_of_range_selection() {
        let selection = Selection::Only(vec![0, 7]);
        assert!(matches!(selection.resolve(3, "frame"), Err(VdbError::Config(_))));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("export.toml");
        std::fs::write(
            &path,
            "[data]\nraw = { path = \"stack.raw\", dims = [2, 2, 2, 1, 1] }\n",
        )
        .expect("config written");

        let config = ExportConfig::load(&path).expect("config loads");
        assert_eq!(config.output.dir, dir.path().join("openvdb"));
        assert_eq!(
            config.data.raw.as_ref().map(|r| r.path.clone()),
            Some(dir.path().join("stack.raw"))
        );
    }
}

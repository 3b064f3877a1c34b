use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::ConfigError;
use super::mask_converter::{RunMode, WriteMode};
use super::unit_cell::refined_cell_path;

const HIT_LIST_SUFFIX: &str = "_hits.lst";

/// Settings of the crystal cell check on an indexing stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CellCheckConfig {
    pub stream_path: PathBuf,
    /// Reference cell, `.cell` or `.pdb`
    pub cell_path: PathBuf,
    /// Relative tolerance on each cell constant
    pub tolerance: f64,
    /// Defaults to `<stream stem>_hits.lst` next to the stream
    pub hit_list_path: Option<PathBuf>,
    pub refine_cell: bool,
    /// Defaults to the directory of the reference cell
    pub refined_cell_dir: Option<PathBuf>,
}

impl Default for CellCheckConfig {
    fn default() -> Self {
        Self {
            stream_path: PathBuf::from("None"),
            cell_path: PathBuf::from("None"),
            tolerance: 0.05,
            hit_list_path: None,
            refine_cell: true,
            refined_cell_dir: None,
        }
    }
}

impl CellCheckConfig {
    /// Get the path of the list of accepted frames
    pub fn get_hit_list_path(&self) -> PathBuf {
        if let Some(path) = &self.hit_list_path {
            return path.clone();
        }
        let stem = self
            .stream_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.stream_path
            .with_file_name(format!("{stem}{HIT_LIST_SUFFIX}"))
    }

    /// Get the path of the refined cell file
    pub fn get_refined_cell_path(&self) -> PathBuf {
        refined_cell_path(&self.cell_path, self.refined_cell_dir.as_deref())
    }

    pub fn is_tolerance_valid(&self) -> bool {
        self.tolerance.is_finite() && (0.0..1.0).contains(&self.tolerance)
    }
}

/// Settings of the conversion between an HDF5 mask and geometry bad areas
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    pub hdf_path: PathBuf,
    pub geometry_path: PathBuf,
    pub run_mode: RunMode,
    pub write_mode: WriteMode,
    pub dataset_path: String,
    /// Mask used when the dataset holds a stack of masks
    pub entry: usize,
    /// Guessed from the files if not set
    pub detector: Option<String>,
    /// Guessed from the files if not set
    pub data_type: Option<String>,
    /// Swap masked and unmasked pixels of the HDF5 mask
    pub invert: bool,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            hdf_path: PathBuf::from("None"),
            geometry_path: PathBuf::from("None"),
            run_mode: RunMode::HdfToGeometry,
            write_mode: WriteMode::Replace,
            dataset_path: String::from("/entry_1/data_1/mask"),
            entry: 0,
            detector: None,
            data_type: None,
            invert: false,
        }
    }
}

/// Structure representing the application configuration. Each task runs if its section is present.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cell_check: Option<CellCheckConfig>,
    pub mask: Option<MaskConfig>,
}

impl Default for Config {
    /// Generate a new Config object with every section present. All paths will be invalid
    fn default() -> Self {
        Self {
            cell_check: Some(CellCheckConfig::default()),
            mask: Some(MaskConfig::default()),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        if let Some(cell_check) = &config.cell_check {
            if !cell_check.is_tolerance_valid() {
                return Err(ConfigError::BadTolerance(cell_check.tolerance));
            }
        }
        Ok(config)
    }

    pub fn has_cell_check(&self) -> bool {
        self.cell_check.is_some()
    }

    pub fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    /// Number of tasks to run
    pub fn n_tasks(&self) -> usize {
        usize::from(self.has_cell_check()) + usize::from(self.has_mask())
    }
}

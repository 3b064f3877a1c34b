//! Detector masks stored in HDF5 files.
//!
//! The mask dataset holds either one mask of the layout shape or a stack of
//! them, `(n_entries, ...)`, of which one entry is used.
use std::path::Path;

use hdf5::{File, Group};
use ndarray::{ArrayD, Axis};

use super::detector_info::DetectorLayout;
use super::error::MaskHdfError;
use super::mask_converter::check_mask_shape;

/// Dataset used when the configuration does not name one
pub const DEFAULT_DATASET: &str = "/entry_1/data_1/mask";

fn split_dataset_path(dataset: &str) -> (Vec<&str>, &str) {
    let mut parts: Vec<&str> = dataset.split('/').filter(|part| !part.is_empty()).collect();
    let name = parts.pop().unwrap_or("");
    (parts, name)
}

/// Shape of the mask dataset, without reading the data
pub fn read_mask_shape(path: &Path, dataset: &str) -> Result<Vec<usize>, MaskHdfError> {
    if !path.exists() {
        return Err(MaskHdfError::BadFilePath(path.to_path_buf()));
    }
    let file = File::open(path)?;
    let data = file
        .dataset(dataset)
        .map_err(|_| MaskHdfError::MissingDataset(dataset.to_string(), path.to_path_buf()))?;
    Ok(data.shape())
}

/// Read one mask as booleans (`true` is masked)
pub fn read_mask(
    path: &Path,
    dataset: &str,
    entry: usize,
    layout: &DetectorLayout,
    invert: bool,
) -> Result<ArrayD<bool>, MaskHdfError> {
    if !path.exists() {
        return Err(MaskHdfError::BadFilePath(path.to_path_buf()));
    }
    let file = File::open(path)?;
    let data = file
        .dataset(dataset)
        .map_err(|_| MaskHdfError::MissingDataset(dataset.to_string(), path.to_path_buf()))?;
    let shape = data.shape();
    check_mask_shape(&shape, layout, entry)?;

    let mut values = data.read_dyn::<i64>()?;
    if shape.len() > layout.shape.len() {
        values = values.index_axis_move(Axis(0), entry);
    }
    let mask = values.mapv(|value| layout.convention.is_masked(value) != invert);
    log::info!(
        "Read mask {dataset} (entry {entry}) from {}: {} masked pixels",
        path.to_string_lossy(),
        mask.iter().filter(|&&masked| masked).count()
    );
    Ok(mask)
}

fn require_group(file: &File, parts: &[&str]) -> Result<Group, MaskHdfError> {
    let mut group = file.group("/")?;
    for part in parts {
        group = match group.group(part) {
            Ok(existing) => existing,
            Err(_) => group.create_group(part)?,
        };
    }
    Ok(group)
}

/// Write one mask, creating the file and dataset if needed.
///
/// An existing stack of masks only has `entry` overwritten.
pub fn write_mask(
    path: &Path,
    dataset: &str,
    entry: usize,
    layout: &DetectorLayout,
    mask: &ArrayD<bool>,
    invert: bool,
) -> Result<(), MaskHdfError> {
    let values: ArrayD<i32> = mask.mapv(|masked| layout.convention.encode(masked != invert));
    let file = File::append(path)?;

    match file.dataset(dataset) {
        Ok(data) => {
            let shape = data.shape();
            check_mask_shape(&shape, layout, entry)?;
            if shape.len() > layout.shape.len() {
                let mut all = data.read_dyn::<i32>()?;
                all.index_axis_mut(Axis(0), entry).assign(&values);
                data.write(&all)?;
            } else {
                data.write(&values)?;
            }
        }
        Err(_) => {
            check_mask_shape(mask.shape(), layout, entry)?;
            let (groups, name) = split_dataset_path(dataset);
            let group = require_group(&file, &groups)?;
            group
                .new_dataset_builder()
                .with_data(&values)
                .create(name)?;
        }
    }
    log::info!(
        "Wrote mask {dataset} (entry {entry}) to {}",
        path.to_string_lossy()
    );
    Ok(())
}

//! Layouts of the supported detectors.
//!
//! A layout fixes the shape of a mask array for one detector and data type, how
//! masked pixels are encoded in HDF5 and, for data with one array per panel, the
//! panel and asic names used in geometry files along with each asic's pixel
//! region within its panel.
use std::ops::Range;

use super::error::DetectorInfoError;

pub const JUNGFRAU: &str = "JUNGFRAU";
pub const AGIPD: &str = "AGIPD";
pub const VDS: &str = "vds";
pub const CHEETAH: &str = "cheetah";

const JUNGFRAU_ASIC_SIZE: usize = 256;
const AGIPD_ASIC_HEIGHT: usize = 64;

/// How a masked pixel is encoded in HDF5 mask data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskConvention {
    /// Non-zero values are masked (bad pixel bitmask)
    NonZeroMasked,
    /// Zero values are masked (good pixel flag)
    ZeroMasked,
}

impl MaskConvention {
    pub fn is_masked(&self, value: i64) -> bool {
        match self {
            Self::NonZeroMasked => value != 0,
            Self::ZeroMasked => value == 0,
        }
    }

    pub fn encode(&self, masked: bool) -> i32 {
        match self {
            Self::NonZeroMasked => i32::from(masked),
            Self::ZeroMasked => i32::from(!masked),
        }
    }
}

/// Pixel region of one asic within its panel array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsicRegion {
    /// Slow scan (row) range
    pub ss: Range<usize>,
    /// Fast scan (column) range
    pub fs: Range<usize>,
}

impl AsicRegion {
    pub fn new(ss: Range<usize>, fs: Range<usize>) -> Self {
        Self { ss, fs }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorLayout {
    pub detector: String,
    pub data_type: String,
    /// Shape of a single mask; `(panels, ss, fs)` or `(ss, fs)`
    pub shape: Vec<usize>,
    pub convention: MaskConvention,
    pub panel_names: Vec<String>,
    pub asic_names: Vec<String>,
    /// `asic_regions[panel][asic]`
    pub asic_regions: Vec<Vec<AsicRegion>>,
}

impl DetectorLayout {
    /// Layout of a single 2D array without panel information
    pub fn flat(
        detector: &str,
        data_type: &str,
        shape: (usize, usize),
        convention: MaskConvention,
    ) -> Self {
        Self {
            detector: detector.to_string(),
            data_type: data_type.to_string(),
            shape: vec![shape.0, shape.1],
            convention,
            panel_names: Vec::new(),
            asic_names: Vec::new(),
            asic_regions: Vec::new(),
        }
    }

    /// Layout of a stack of panels, each divided into asics
    pub fn panelled(
        detector: &str,
        data_type: &str,
        panel_shape: (usize, usize),
        convention: MaskConvention,
        panel_names: Vec<String>,
        asic_names: Vec<String>,
        asic_regions: Vec<Vec<AsicRegion>>,
    ) -> Self {
        Self {
            detector: detector.to_string(),
            data_type: data_type.to_string(),
            shape: vec![panel_names.len(), panel_shape.0, panel_shape.1],
            convention,
            panel_names,
            asic_names,
            asic_regions,
        }
    }

    pub fn is_panelled(&self) -> bool {
        self.shape.len() == 3
    }

    pub fn panel_index(&self, name: &str) -> Option<usize> {
        self.panel_names.iter().position(|panel| panel == name)
    }

    pub fn asic_index(&self, name: &str) -> Option<usize> {
        self.asic_names.iter().position(|asic| asic == name)
    }

    pub fn asic_region(&self, panel: usize, asic: usize) -> Option<&AsicRegion> {
        self.asic_regions.get(panel).and_then(|asics| asics.get(asic))
    }

    /// Shape of one panel (or of the whole mask if there are no panels)
    pub fn panel_shape(&self) -> (usize, usize) {
        let n = self.shape.len();
        (self.shape[n - 2], self.shape[n - 1])
    }
}

fn names(prefix: &str, numbers: Range<usize>) -> Vec<String> {
    numbers.map(|n| format!("{prefix}{n}")).collect()
}

fn jungfrau_vds() -> DetectorLayout {
    let panel_names = names("p", 1..9);
    let asic_names = names("a", 1..9);
    let lower = 0..JUNGFRAU_ASIC_SIZE;
    let upper = JUNGFRAU_ASIC_SIZE..2 * JUNGFRAU_ASIC_SIZE;
    let column = |block: usize| block * JUNGFRAU_ASIC_SIZE..(block + 1) * JUNGFRAU_ASIC_SIZE;

    // Modules 1-4 are mounted rotated by 180 degrees relative to modules 5-8
    let asic_regions = (0..panel_names.len())
        .map(|panel| {
            (0..asic_names.len())
                .map(|asic| {
                    let (first_row, second_row) = if panel < 4 {
                        (upper.clone(), lower.clone())
                    } else {
                        (lower.clone(), upper.clone())
                    };
                    let ss = if asic < 4 { first_row } else { second_row };
                    let block = if panel < 4 { 3 - asic % 4 } else { asic % 4 };
                    AsicRegion::new(ss, column(block))
                })
                .collect()
        })
        .collect();

    DetectorLayout::panelled(
        JUNGFRAU,
        VDS,
        (2 * JUNGFRAU_ASIC_SIZE, 4 * JUNGFRAU_ASIC_SIZE),
        MaskConvention::NonZeroMasked,
        panel_names,
        asic_names,
        asic_regions,
    )
}

fn agipd_vds() -> DetectorLayout {
    let panel_names = names("p", 0..16);
    let asic_names = names("a", 0..8);
    let width = 128;
    let asic_regions = (0..panel_names.len())
        .map(|_| {
            (0..asic_names.len())
                .map(|asic| {
                    AsicRegion::new(
                        asic * AGIPD_ASIC_HEIGHT..(asic + 1) * AGIPD_ASIC_HEIGHT,
                        0..width,
                    )
                })
                .collect()
        })
        .collect();

    DetectorLayout::panelled(
        AGIPD,
        VDS,
        (asic_names.len() * AGIPD_ASIC_HEIGHT, width),
        MaskConvention::NonZeroMasked,
        panel_names,
        asic_names,
        asic_regions,
    )
}

/// All detector layouts known to the converter
pub fn builtin_layouts() -> Vec<DetectorLayout> {
    vec![
        jungfrau_vds(),
        DetectorLayout::flat(JUNGFRAU, CHEETAH, (4096, 1024), MaskConvention::ZeroMasked),
        agipd_vds(),
        DetectorLayout::flat(AGIPD, CHEETAH, (8192, 128), MaskConvention::ZeroMasked),
    ]
}

pub fn detector_names() -> Vec<String> {
    let mut detectors: Vec<String> = Vec::new();
    for layout in builtin_layouts() {
        if !detectors.contains(&layout.detector) {
            detectors.push(layout.detector);
        }
    }
    detectors
}

/// Data types known for any of `detectors` (all detectors if None)
pub fn data_types(detectors: Option<&[String]>) -> Vec<String> {
    let mut types: Vec<String> = Vec::new();
    for layout in builtin_layouts() {
        let wanted = detectors.map_or(true, |detectors| contains_name(detectors, &layout.detector));
        if wanted && !types.contains(&layout.data_type) {
            types.push(layout.data_type);
        }
    }
    types
}

fn same_name(first: &str, second: &str) -> bool {
    first.eq_ignore_ascii_case(second)
}

fn contains_name(names: &[String], name: &str) -> bool {
    names.iter().any(|known| same_name(known, name))
}

/// Layout of a detector and data type; names are case insensitive
pub fn lookup(detector: &str, data_type: &str) -> Result<DetectorLayout, DetectorInfoError> {
    let layouts: Vec<DetectorLayout> = builtin_layouts()
        .into_iter()
        .filter(|layout| same_name(&layout.detector, detector))
        .collect();
    if layouts.is_empty() {
        return Err(DetectorInfoError::UnknownDetector(detector.to_string()));
    }
    layouts
        .into_iter()
        .find(|layout| same_name(&layout.data_type, data_type))
        .ok_or_else(|| {
            DetectorInfoError::MissingDataType(detector.to_string(), data_type.to_string())
        })
}

/// What the files at hand tell about the detector
#[derive(Debug, Clone, Default)]
pub struct DetectorHints<'a> {
    pub detector: Option<&'a str>,
    pub data_type: Option<&'a str>,
    /// Shape of the HDF5 mask dataset
    pub hdf_shape: Option<&'a [usize]>,
    pub geometry_name: Option<&'a str>,
    pub geometry_contents: Option<&'a str>,
}

fn shape_fits(hdf_shape: &[usize], layout: &DetectorLayout) -> bool {
    hdf_shape.len() >= layout.shape.len()
        && hdf_shape.len() <= layout.shape.len() + 1
        && hdf_shape.ends_with(&layout.shape)
}

fn mentions(text: &str, name: &str) -> bool {
    text.to_lowercase().contains(&name.to_lowercase())
}

/// Find the single layout consistent with the hints.
///
/// A candidate (detector, data type) has to exist in the layout table. It should
/// then agree with the HDF5 mask shape and with the geometry file (by file name,
/// or by file contents if the name is not conclusive). A candidate agreeing with
/// both wins; failing that, one agreeing with either.
pub fn guess_detector_info(hints: &DetectorHints) -> Result<DetectorLayout, DetectorInfoError> {
    if let (Some(detector), Some(data_type)) = (hints.detector, hints.data_type) {
        return lookup(detector, data_type);
    }
    let detectors: Vec<String> = match hints.detector {
        Some(detector) => vec![detector.to_string()],
        None => detector_names(),
    };
    let types: Vec<String> = match hints.data_type {
        Some(data_type) => vec![data_type.to_string()],
        None => data_types(Some(&detectors)),
    };

    let candidates: Vec<DetectorLayout> = builtin_layouts()
        .into_iter()
        .filter(|layout| {
            contains_name(&detectors, &layout.detector) && contains_name(&types, &layout.data_type)
        })
        .collect();
    if candidates.is_empty() {
        return Err(match hints.detector {
            Some(detector) => DetectorInfoError::UnknownDetector(detector.to_string()),
            None => DetectorInfoError::CannotGuess("detector".to_string()),
        });
    }

    let fits_hdf: Vec<bool> = candidates
        .iter()
        .map(|layout| hints.hdf_shape.map_or(false, |shape| shape_fits(shape, layout)))
        .collect();

    let geometry_fits = |text: &str| -> Vec<bool> {
        candidates
            .iter()
            .map(|layout| {
                let detector_fits = hints.detector.is_some() || mentions(text, &layout.detector);
                let type_fits = hints.data_type.is_some() || mentions(text, &layout.data_type);
                detector_fits && type_fits
            })
            .collect()
    };
    let mut fits_geometry = match hints.geometry_name {
        Some(name) => geometry_fits(name),
        None => vec![false; candidates.len()],
    };
    if fits_geometry.iter().filter(|&&fits| fits).count() != 1 {
        if let Some(contents) = hints.geometry_contents {
            fits_geometry = geometry_fits(contents);
        }
    }

    let select = |combine: fn(bool, bool) -> bool| -> Option<usize> {
        let matching: Vec<usize> = (0..candidates.len())
            .filter(|&idx| combine(fits_hdf[idx], fits_geometry[idx]))
            .collect();
        match matching.as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    };

    let chosen = if candidates.len() == 1 {
        Some(0)
    } else {
        select(|hdf, geometry| hdf && geometry).or_else(|| select(|hdf, geometry| hdf || geometry))
    };

    match chosen {
        Some(idx) => {
            let layout = candidates[idx].clone();
            if hints.detector.is_none() || hints.data_type.is_none() {
                log::info!(
                    "Estimated detector {} with {} data from the HDF5 and geometry files",
                    layout.detector,
                    layout.data_type
                );
            }
            Ok(layout)
        }
        None => {
            let what = match (hints.detector, hints.data_type) {
                (None, None) => "detector and data type",
                (None, Some(_)) => "detector",
                _ => "data type",
            };
            Err(DetectorInfoError::CannotGuess(what.to_string()))
        }
    }
}

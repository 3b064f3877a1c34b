//! Conversion of whole detector masks to and from geometry file bad areas.
//!
//! For data with one array per panel the pixels masked on every panel are
//! written once, without a panel restriction. What is left on each panel is
//! decomposed asic by asic, since a bad area in a geometry file can only be
//! restricted to a single asic.
use ndarray::{s, Array2, Array3, ArrayD, ArrayViewD, ArrayViewMut2, Axis, Ix2, Ix3, Zip};
use serde::{Deserialize, Serialize};

use super::decomposition::{decompose, MaskRectangle};
use super::detector_info::DetectorLayout;
use super::error::{GeometryError, MaskConverterError};
use super::geometry::{read_bad_areas, write_bad_areas, BadArea, PanelTag};

/// Direction of the conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// HDF5 mask to geometry file
    #[serde(rename = "hd52geom")]
    HdfToGeometry,
    /// Geometry file to HDF5 mask
    #[serde(rename = "geom2hd5")]
    GeometryToHdf,
}

/// What happens to a mask already present in the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Replace,
    Add,
}

/// Check a stored mask shape against the layout; a stack of masks
/// `(n_entries, ...)` is accepted if `entry` is in range.
pub fn check_mask_shape(
    found: &[usize],
    layout: &DetectorLayout,
    entry: usize,
) -> Result<(), MaskConverterError> {
    let expected = &layout.shape;
    let wrong_shape = || MaskConverterError::WrongMaskShape {
        found: found.to_vec(),
        expected: expected.clone(),
    };
    if found == expected.as_slice() {
        return Ok(());
    }
    if found.len() != expected.len() + 1 || !found.ends_with(expected) {
        return Err(wrong_shape());
    }
    if entry >= found[0] {
        return Err(MaskConverterError::EntryOutOfRange {
            entry,
            max: found[0].saturating_sub(1),
        });
    }
    Ok(())
}

fn tag_all(rectangles: Vec<MaskRectangle>) -> impl Iterator<Item = BadArea> {
    rectangles
        .into_iter()
        .map(|rectangle| BadArea::from_rectangle(&rectangle, PanelTag::All))
}

/// Bad areas covering the masked pixels of a whole detector mask
pub fn decompose_detector_mask(
    mask: ArrayViewD<bool>,
    layout: &DetectorLayout,
) -> Result<Vec<BadArea>, MaskConverterError> {
    let wrong_shape = || MaskConverterError::WrongMaskShape {
        found: mask.shape().to_vec(),
        expected: layout.shape.clone(),
    };
    if mask.shape() != layout.shape.as_slice() {
        return Err(wrong_shape());
    }

    if !layout.is_panelled() {
        let mask = mask.view().into_dimensionality::<Ix2>().map_err(|_| wrong_shape())?;
        return Ok(tag_all(decompose(mask)).collect());
    }

    let stack = mask.view().into_dimensionality::<Ix3>().map_err(|_| wrong_shape())?;
    let common: Array2<bool> = stack.map_axis(Axis(0), |pixel| pixel.iter().all(|&masked| masked));
    let mut areas: Vec<BadArea> = tag_all(decompose(common.view())).collect();

    for (panel_idx, panel) in stack.outer_iter().enumerate() {
        let remaining = Zip::from(&panel)
            .and(&common)
            .map_collect(|&masked, &shared| masked && !shared);
        let regions = layout.asic_regions.get(panel_idx).map_or(&[][..], Vec::as_slice);
        for (asic_idx, region) in regions.iter().enumerate() {
            let asic = remaining.slice(s![region.ss.clone(), region.fs.clone()]);
            let tag = PanelTag::Asic {
                panel: layout.panel_names[panel_idx].clone(),
                asic: layout.asic_names[asic_idx].clone(),
            };
            areas.extend(decompose(asic).into_iter().map(|rectangle| {
                let rectangle = rectangle.offset(region.ss.start, region.fs.start);
                BadArea::from_rectangle(&rectangle, tag.clone())
            }));
        }
    }
    Ok(areas)
}

fn fill_clipped(
    mut mask: ArrayViewMut2<bool>,
    area: &BadArea,
    bounds: (usize, usize, usize, usize),
) {
    let (ss_start, ss_end, fs_start, fs_end) = bounds;
    let ss = area.min_ss.max(ss_start)..(area.max_ss + 1).min(ss_end);
    let fs = area.min_fs.max(fs_start)..(area.max_fs + 1).min(fs_end);
    if ss.is_empty() || fs.is_empty() {
        return;
    }
    mask.slice_mut(s![ss, fs]).fill(true);
}

/// Detector mask with the pixels of every bad area set.
///
/// Areas are clipped to the mask, and areas restricted to an asic are further
/// clipped to that asic's region of its panel.
pub fn compose_detector_mask(
    areas: &[BadArea],
    layout: &DetectorLayout,
) -> Result<ArrayD<bool>, MaskConverterError> {
    let (height, width) = layout.panel_shape();
    let full_panel = (0, height, 0, width);

    if !layout.is_panelled() {
        let mut mask = Array2::from_elem((height, width), false);
        for area in areas {
            if let PanelTag::Asic { .. } = area.panel {
                return Err(MaskConverterError::PanelOnFlatMask(area.panel.to_string()));
            }
            fill_clipped(mask.view_mut(), area, full_panel);
        }
        return Ok(mask.into_dyn());
    }

    let mut mask = Array3::from_elem((layout.shape[0], height, width), false);
    for area in areas {
        match &area.panel {
            PanelTag::All => {
                for panel in mask.outer_iter_mut() {
                    fill_clipped(panel, area, full_panel);
                }
            }
            PanelTag::Asic { panel, asic } => {
                let unsuitable = || GeometryError::UnsuitablePanel(area.panel.to_string());
                let panel_idx = layout.panel_index(panel).ok_or_else(unsuitable)?;
                let asic_idx = layout.asic_index(asic).ok_or_else(unsuitable)?;
                let region = layout
                    .asic_region(panel_idx, asic_idx)
                    .ok_or_else(unsuitable)?;
                fill_clipped(
                    mask.index_axis_mut(Axis(0), panel_idx),
                    area,
                    (region.ss.start, region.ss.end, region.fs.start, region.fs.end),
                );
            }
        }
    }
    Ok(mask.into_dyn())
}

/// In-memory conversion between a detector mask and geometry file contents
#[derive(Debug, Clone)]
pub struct MaskConverter {
    layout: DetectorLayout,
    write_mode: WriteMode,
}

impl MaskConverter {
    pub fn new(layout: DetectorLayout, write_mode: WriteMode) -> Self {
        Self { layout, write_mode }
    }

    pub fn layout(&self) -> &DetectorLayout {
        &self.layout
    }

    /// Geometry file contents with the bad areas of `mask` written into
    /// `geometry` (the existing file contents, if any).
    ///
    /// When adding, pixels already covered by the existing bad areas are not
    /// written again.
    pub fn mask_to_geometry(
        &self,
        mask: ArrayViewD<bool>,
        geometry: Option<&str>,
    ) -> Result<String, MaskConverterError> {
        let mut mask = mask.to_owned();
        if let (WriteMode::Add, Some(text)) = (self.write_mode, geometry) {
            let existing = compose_detector_mask(&read_bad_areas(text, &self.layout)?, &self.layout)?;
            if existing.shape() == mask.shape() {
                Zip::from(&mut mask)
                    .and(&existing)
                    .for_each(|masked, &known| *masked = *masked && !known);
            }
        }
        let areas = decompose_detector_mask(mask.view(), &self.layout)?;
        log::info!(
            "Converted mask to {} bad areas ({} restricted to an asic)",
            areas.len(),
            areas
                .iter()
                .filter(|area| area.panel != PanelTag::All)
                .count()
        );
        Ok(write_bad_areas(geometry, &areas, self.write_mode))
    }

    /// Detector mask from the bad areas of geometry file contents; when adding,
    /// combined with the `existing` mask.
    pub fn geometry_to_mask(
        &self,
        geometry: &str,
        existing: Option<ArrayD<bool>>,
    ) -> Result<ArrayD<bool>, MaskConverterError> {
        let areas = read_bad_areas(geometry, &self.layout)?;
        log::info!("Read {} bad areas from the geometry", areas.len());
        let mut mask = compose_detector_mask(&areas, &self.layout)?;
        if let (WriteMode::Add, Some(existing)) = (self.write_mode, existing) {
            if existing.shape() != mask.shape() {
                return Err(MaskConverterError::WrongMaskShape {
                    found: existing.shape().to_vec(),
                    expected: self.layout.shape.clone(),
                });
            }
            Zip::from(&mut mask)
                .and(&existing)
                .for_each(|masked, &known| *masked = *masked || known);
        }
        Ok(mask)
    }
}

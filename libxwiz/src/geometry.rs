//! Bad pixel areas in CrystFEL geometry files.
//!
//! A bad area is a block of keyword lines
//!
//! ```text
//! bad_area3/min_fs = 0
//! bad_area3/max_fs = 255
//! bad_area3/min_ss = 64
//! bad_area3/max_ss = 127
//! bad_area3/panel = p2a1
//! ```
//!
//! with inclusive pixel bounds and an optional panel (asic) restriction.
use std::fmt;

use fxhash::FxHashMap;
use regex::Regex;

use super::decomposition::MaskRectangle;
use super::detector_info::DetectorLayout;
use super::error::GeometryError;
use super::mask_converter::WriteMode;

const BAD_PREFIX: &str = "bad_";
const RIGID_GROUP: &str = "rigid_group";
const COMMENT: char = ';';

const DEFAULT_CLEN: &str = "0.9999";
const DEFAULT_PHOTON_ENERGY: &str = "9999";
const DEFAULT_MASK_BAD: &str = "0xffff";

/// Which part of the detector a bad area applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PanelTag {
    All,
    Asic { panel: String, asic: String },
}

impl fmt::Display for PanelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Asic { panel, asic } => write!(f, "{panel}{asic}"),
        }
    }
}

impl PanelTag {
    /// Parse a `p<N>a<M>` panel value, checking the names against the layout
    pub fn parse(value: &str, layout: &DetectorLayout) -> Result<Self, GeometryError> {
        let panel_re = Regex::new(r"^(p\d+)(a\d+)$").expect("static regex is valid");
        let unsuitable = || GeometryError::UnsuitablePanel(value.to_string());
        let caps = panel_re.captures(value).ok_or_else(unsuitable)?;
        let panel = &caps[1];
        let asic = &caps[2];
        if layout.panel_index(panel).is_none() || layout.asic_index(asic).is_none() {
            return Err(unsuitable());
        }
        Ok(Self::Asic {
            panel: panel.to_string(),
            asic: asic.to_string(),
        })
    }
}

/// A bad area with inclusive pixel bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadArea {
    pub min_fs: usize,
    pub max_fs: usize,
    pub min_ss: usize,
    pub max_ss: usize,
    pub panel: PanelTag,
}

impl BadArea {
    /// From a non-empty rectangle (exclusive bounds)
    pub fn from_rectangle(rectangle: &MaskRectangle, panel: PanelTag) -> Self {
        Self {
            min_fs: rectangle.x_min,
            max_fs: rectangle.x_max - 1,
            min_ss: rectangle.y_min,
            max_ss: rectangle.y_max - 1,
            panel,
        }
    }

    pub fn to_rectangle(&self) -> MaskRectangle {
        MaskRectangle::new(self.min_fs, self.max_fs + 1, self.min_ss, self.max_ss + 1)
    }
}

#[derive(Debug, Default)]
struct PartialArea {
    min_fs: Option<usize>,
    max_fs: Option<usize>,
    min_ss: Option<usize>,
    max_ss: Option<usize>,
    panel: Option<PanelTag>,
}

fn strip_comment(line: &str) -> &str {
    line.split_once(COMMENT).map_or(line, |(content, _)| content)
}

/// Read the bad areas of geometry file contents, in order of first appearance.
///
/// Incomplete areas are skipped with a warning. Panel restrictions are only
/// allowed for layouts with panels.
pub fn read_bad_areas(text: &str, layout: &DetectorLayout) -> Result<Vec<BadArea>, GeometryError> {
    let area_re = Regex::new(r"bad_(.+)/(\S+)\s*=\s*(\S+)").expect("static regex is valid");
    let mut names: Vec<String> = Vec::new();
    let mut partials: FxHashMap<String, PartialArea> = FxHashMap::default();

    for (idx, line) in text.lines().enumerate() {
        let Some(caps) = area_re.captures(strip_comment(line)) else {
            continue;
        };
        let (name, key, value) = (&caps[1], &caps[2], &caps[3]);
        if !partials.contains_key(name) {
            names.push(name.to_string());
        }
        let area = partials.entry(name.to_string()).or_default();
        let parse_bound = || {
            value.parse::<usize>().map_err(|_| GeometryError::ParsingError {
                line: idx + 1,
                value: value.to_string(),
            })
        };
        match key {
            "min_fs" => area.min_fs = Some(parse_bound()?),
            "max_fs" => area.max_fs = Some(parse_bound()?),
            "min_ss" => area.min_ss = Some(parse_bound()?),
            "max_ss" => area.max_ss = Some(parse_bound()?),
            "panel" => {
                if !layout.is_panelled() {
                    return Err(GeometryError::UnexpectedPanel(
                        value.to_string(),
                        layout.data_type.clone(),
                    ));
                }
                area.panel = Some(PanelTag::parse(value, layout)?);
            }
            _ => log::warn!("Unsupported bad area keyword '{key}' at line {}", idx + 1),
        }
    }

    let mut areas = Vec::with_capacity(names.len());
    for name in names {
        let Some(area) = partials.remove(&name) else {
            continue;
        };
        match (area.min_fs, area.max_fs, area.min_ss, area.max_ss) {
            (Some(min_fs), Some(max_fs), Some(min_ss), Some(max_ss))
                if min_fs <= max_fs && min_ss <= max_ss =>
            {
                areas.push(BadArea {
                    min_fs,
                    max_fs,
                    min_ss,
                    max_ss,
                    panel: area.panel.unwrap_or(PanelTag::All),
                });
            }
            _ => log::warn!("Geometry file - incomplete bad area 'bad_{name}' is skipped"),
        }
    }
    Ok(areas)
}

fn area_lines(number: usize, area: &BadArea) -> String {
    let mut lines = format!(
        "bad_area{number}/min_fs = {}\nbad_area{number}/max_fs = {}\nbad_area{number}/min_ss = {}\nbad_area{number}/max_ss = {}\n",
        area.min_fs, area.max_fs, area.min_ss, area.max_ss
    );
    if let PanelTag::Asic { .. } = area.panel {
        lines.push_str(&format!("bad_area{number}/panel = {}\n", area.panel));
    }
    lines.push('\n');
    lines
}

/// Geometry file contents with `areas` added to `existing`.
///
/// New areas are numbered after the highest existing `bad_area<N>` and placed
/// after the last line mentioning a bad area, else before the first rigid group,
/// else at the end. In [`WriteMode::Replace`] the existing bad area lines are
/// commented out.
pub fn write_bad_areas(existing: Option<&str>, areas: &[BadArea], mode: WriteMode) -> String {
    let number_re = Regex::new(r"bad_area(\d+)/").expect("static regex is valid");
    let mut lines: Vec<String> = existing
        .unwrap_or("")
        .split_inclusive('\n')
        .map(str::to_string)
        .collect();

    let n_lines = lines.len();
    let mut insert_at = n_lines;
    let mut first_number = 0;
    for (idx, line) in lines.iter_mut().enumerate() {
        if line.contains(BAD_PREFIX) {
            insert_at = idx + 1;
            if let Some(number) = number_re
                .captures(line)
                .and_then(|caps| caps[1].parse::<usize>().ok())
            {
                first_number = first_number.max(number + 1);
            }
            if mode == WriteMode::Replace && strip_comment(line).contains(BAD_PREFIX) {
                line.insert_str(0, "; ");
            }
        }
        if insert_at == n_lines && line.contains(RIGID_GROUP) {
            insert_at = idx;
        }
    }

    let (before, after) = lines.split_at(insert_at);
    let mut output = before.concat();
    if before.last().is_some_and(|line| !line.trim().is_empty()) {
        output.push('\n');
    }
    for (offset, area) in areas.iter().enumerate() {
        output.push_str(&area_lines(first_number + offset, area));
    }
    output.push_str(&after.concat());
    output
}

/// Value of a `key = value` line at the start of a line, else `default`
fn keyword_value(text: &str, key: &str, default: &str) -> String {
    text.lines()
        .filter(|line| line.starts_with(key))
        .filter_map(|line| {
            let content = strip_comment(line);
            let (name, value) = content.split_once('=')?;
            (name.trim() == key).then(|| value.split_whitespace().last())?
        })
        .next()
        .unwrap_or(default)
        .to_string()
}

/// Detector distance (`clen`); either metres or the name of a data source
pub fn detector_distance(text: &str) -> String {
    keyword_value(text, "clen", DEFAULT_CLEN)
}

/// Photon energy in eV, or the name of a data source
pub fn photon_energy(text: &str) -> String {
    keyword_value(text, "photon_energy", DEFAULT_PHOTON_ENERGY)
}

/// Bitmask of bad pixel flags in the mask data (`mask_bad`)
pub fn bad_pixel_value(text: &str) -> String {
    keyword_value(text, "mask_bad", DEFAULT_MASK_BAD)
}

//! Reader for CrystFEL stream files.
//!
//! A stream file is a sequence of chunks, one per diffraction frame. Each chunk
//! carries the frame identification, peak search results, an optional list of
//! peaks and (for indexed frames) a crystal block with the unit cell, refinement
//! diagnostics and integrated reflections.
//!
//! The reader is a single pass over the lines with an explicit state machine;
//! it never touches the filesystem itself (see [`parse_stream_file`] for the
//! convenience wrapper which does).
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use fxhash::FxHashMap;

use super::error::StreamError;

pub(crate) const BEGIN_CHUNK: &str = "----- Begin chunk -----";
pub(crate) const END_CHUNK: &str = "----- End chunk -----";
const BEGIN_PEAKS: &str = "Peaks from peak search";
const PEAKS_HEADER: &str = "  fs/px";
const END_PEAKS: &str = "End of peak list";
pub(crate) const BEGIN_CRYSTAL: &str = "--- Begin crystal";
pub(crate) const END_CRYSTAL: &str = "--- End crystal";
const BEGIN_REFLECTIONS: &str = "Reflections measured after indexing";
const REFLECTIONS_HEADER: &str = "   h    k    l";
const END_REFLECTIONS: &str = "End of reflections";

// `key = value`: the value is always the third whitespace token
pub(crate) const VALUE_TOKEN: usize = 2;
const NM_TO_ANGSTROM: f64 = 10.0;

/// Chunk level lines, matched by prefix in this order (first match wins)
#[derive(Debug, Clone, Copy)]
enum ChunkLine {
    Hit,
    IndexedBy,
    NIndexingTries,
    PhotonEnergy,
    BeamDivergence,
    BeamBandwidth,
    AverageCameraLength,
    NumPeaks,
    PeakResolution,
    ImageFilename,
    Event,
}

const CHUNK_LINES: [(&str, ChunkLine); 11] = [
    ("hit", ChunkLine::Hit),
    ("indexed_by", ChunkLine::IndexedBy),
    ("n_indexing_tries", ChunkLine::NIndexingTries),
    ("photon_energy_eV", ChunkLine::PhotonEnergy),
    ("beam_divergence", ChunkLine::BeamDivergence),
    ("beam_bandwidth", ChunkLine::BeamBandwidth),
    ("average_camera_length", ChunkLine::AverageCameraLength),
    ("num_peaks", ChunkLine::NumPeaks),
    ("peak_resolution", ChunkLine::PeakResolution),
    ("Image filename:", ChunkLine::ImageFilename),
    ("Event:", ChunkLine::Event),
];

/// Crystal block lines, matched by prefix in this order (first match wins)
#[derive(Debug, Clone, Copy)]
enum CrystalLine {
    LatticeType,
    Centering,
    UniqueAxis,
    ProfileRadius,
    DiffractionResolutionLimit,
    NumReflections,
    NumSaturatedReflections,
    NumImplausibleReflections,
    CellParameters,
    FinalResidual,
    DetShift,
    AStar,
    BStar,
    CStar,
}

const CRYSTAL_LINES: [(&str, CrystalLine); 14] = [
    ("lattice_type", CrystalLine::LatticeType),
    ("centering", CrystalLine::Centering),
    ("unique_axis", CrystalLine::UniqueAxis),
    ("profile_radius", CrystalLine::ProfileRadius),
    (
        "diffraction_resolution_limit",
        CrystalLine::DiffractionResolutionLimit,
    ),
    ("num_reflections", CrystalLine::NumReflections),
    (
        "num_saturated_reflections",
        CrystalLine::NumSaturatedReflections,
    ),
    (
        "num_implausible_reflections",
        CrystalLine::NumImplausibleReflections,
    ),
    ("Cell parameters", CrystalLine::CellParameters),
    ("predict_refine/final_residual", CrystalLine::FinalResidual),
    ("predict_refine/det_shift", CrystalLine::DetShift),
    ("astar", CrystalLine::AStar),
    ("bstar", CrystalLine::BStar),
    ("cstar", CrystalLine::CStar),
];

/// Find the first entry of a prefix table matching the line
fn dispatch<T: Copy>(table: &[(&str, T)], text: &str) -> Option<T> {
    table
        .iter()
        .find(|(prefix, _)| text.starts_with(prefix))
        .map(|(_, kind)| *kind)
}

/// The nesting level the reader is currently in. Used for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserMode {
    Outside,
    Chunk,
    Peaks,
    Crystal,
    Reflections,
}

impl fmt::Display for ParserMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Outside => "outside of chunk",
            Self::Chunk => "in chunk",
            Self::Peaks => "in peak list",
            Self::Crystal => "in crystal",
            Self::Reflections => "in reflection list",
        };
        write!(f, "{name}")
    }
}

/// Identification of a frame: image file plus event index within the file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameKey {
    pub file_name: String,
    pub event: i64,
}

impl FrameKey {
    pub fn new(file_name: &str, event: i64) -> Self {
        Self {
            file_name: file_name.to_string(),
            event,
        }
    }
}

impl fmt::Display for FrameKey {
    /// Frame identifier in the CrystFEL list-file format, `file //event`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} //{}", self.file_name, self.event)
    }
}

/// A single peak found by the peak search
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Peak {
    pub fs: f64,
    pub ss: f64,
    /// Resolution, 1/d in nm^-1
    pub one_over_d: f64,
    pub intensity: f64,
    pub panel: String,
}

/// A reflection measured after indexing
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reflection {
    pub h: i32,
    pub k: i32,
    pub l: i32,
    pub intensity: f64,
    pub sigma_intensity: f64,
    pub peak: f64,
    pub background: f64,
    pub fs: f64,
    pub ss: f64,
    pub panel: String,
}

/// The indexing/integration result of a crystal block.
///
/// Cell edges are in Å, angles in degrees. Reciprocal basis vectors are kept in
/// the nm^-1 of the stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Crystal {
    pub cell_parameters: Option<[f64; 6]>,
    pub astar: Option<[f64; 3]>,
    pub bstar: Option<[f64; 3]>,
    pub cstar: Option<[f64; 3]>,
    pub lattice_type: Option<String>,
    pub centering: Option<String>,
    pub unique_axis: Option<String>,
    pub profile_radius: Option<f64>,
    pub final_residual: Option<f64>,
    pub det_shift: Option<[f64; 2]>,
    pub diffraction_resolution_limit: Option<f64>,
    pub num_reflections: Option<usize>,
    pub num_saturated_reflections: Option<usize>,
    pub num_implausible_reflections: Option<usize>,
    /// None if the block had no reflection list
    pub reflections: Option<Vec<Reflection>>,
}

/// Everything the stream says about one frame.
///
/// Fields are None when the corresponding line was absent from the chunk.
/// In particular `peaks == None` means no peak list was written, while
/// `Some(vec![])` means a peak list with zero peaks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamRecord {
    pub file_name: String,
    pub event: i64,
    pub hit: Option<i32>,
    pub indexed_by: Option<String>,
    pub n_indexing_tries: Option<i32>,
    pub photon_energy_ev: Option<f64>,
    pub beam_divergence: Option<f64>,
    pub beam_bandwidth: Option<f64>,
    pub average_camera_length: Option<f64>,
    pub num_peaks: Option<usize>,
    pub peak_resolution: Option<f64>,
    pub peaks: Option<Vec<Peak>>,
    pub crystal: Option<Crystal>,
}

impl StreamRecord {
    pub fn key(&self) -> FrameKey {
        FrameKey::new(&self.file_name, self.event)
    }
}

/// One line of input along with where it was found
#[derive(Debug, Clone, Copy)]
pub(crate) struct Line<'a> {
    number: usize,
    text: &'a str,
    mode: ParserMode,
}

impl<'a> Line<'a> {
    pub(crate) fn new(number: usize, text: &'a str, mode: ParserMode) -> Self {
        Self { number, text, mode }
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.text.starts_with(prefix)
    }

    fn error(&self, message: String) -> StreamError {
        StreamError::Parse {
            line: self.number,
            mode: self.mode,
            message,
        }
    }

    pub(crate) fn token(&self, index: usize) -> Result<&'a str, StreamError> {
        self.text.split_whitespace().nth(index).ok_or_else(|| {
            self.error(format!(
                "expected at least {} fields in '{}'",
                index + 1,
                self.text.trim_end()
            ))
        })
    }

    fn value<T>(&self, index: usize) -> Result<T, StreamError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let token = self.token(index)?;
        token.parse::<T>().map_err(|e| {
            self.error(format!(
                "could not parse '{token}' as {}: {e}",
                std::any::type_name::<T>()
            ))
        })
    }

    fn values<T, const N: usize>(&self, indices: [usize; N]) -> Result<[T; N], StreamError>
    where
        T: FromStr + Default + Copy,
        T::Err: fmt::Display,
    {
        let mut values = [T::default(); N];
        for (value, index) in values.iter_mut().zip(indices) {
            *value = self.value(index)?;
        }
        Ok(values)
    }

    /// The integer after the `//` of an `Event:` line
    pub(crate) fn event_index(&self) -> Result<i64, StreamError> {
        let event = self
            .text
            .split("//")
            .nth(1)
            .ok_or_else(|| self.error(format!("no '//' in '{}'", self.text.trim_end())))?
            .trim();
        event
            .parse::<i64>()
            .map_err(|e| self.error(format!("could not parse event '{event}': {e}")))
    }

    /// Cell constants of a `Cell parameters` line with edges converted to Å.
    ///
    /// `Cell parameters 7.90 8.10 9.20 nm, 90.00 90.00 120.00 deg`: the unit
    /// label at token 5 is skipped.
    pub(crate) fn cell_parameters(&self) -> Result<[f64; 6], StreamError> {
        let mut cell: [f64; 6] = self.values([2, 3, 4, 6, 7, 8])?;
        if cell.iter().any(|value| !value.is_finite()) {
            return Err(self.error(format!(
                "non-finite cell constant in '{}'",
                self.text.trim_end()
            )));
        }
        for edge in cell.iter_mut().take(3) {
            *edge *= NM_TO_ANGSTROM;
        }
        Ok(cell)
    }
}

impl Peak {
    fn from_line(line: &Line) -> Result<Self, StreamError> {
        Ok(Self {
            fs: line.value(0)?,
            ss: line.value(1)?,
            one_over_d: line.value(2)?,
            intensity: line.value(3)?,
            panel: line.token(4)?.to_string(),
        })
    }
}

impl Reflection {
    fn from_line(line: &Line) -> Result<Self, StreamError> {
        Ok(Self {
            h: line.value(0)?,
            k: line.value(1)?,
            l: line.value(2)?,
            intensity: line.value(3)?,
            sigma_intensity: line.value(4)?,
            peak: line.value(5)?,
            background: line.value(6)?,
            fs: line.value(7)?,
            ss: line.value(8)?,
            panel: line.token(9)?.to_string(),
        })
    }
}

impl Crystal {
    fn read_line(&mut self, line: &Line) -> Result<(), StreamError> {
        let Some(kind) = dispatch(&CRYSTAL_LINES, line.text) else {
            return Ok(());
        };
        match kind {
            CrystalLine::LatticeType => {
                self.lattice_type = Some(line.token(VALUE_TOKEN)?.to_string())
            }
            CrystalLine::Centering => self.centering = Some(line.token(VALUE_TOKEN)?.to_string()),
            CrystalLine::UniqueAxis => {
                self.unique_axis = Some(line.token(VALUE_TOKEN)?.to_string())
            }
            CrystalLine::ProfileRadius => self.profile_radius = Some(line.value(VALUE_TOKEN)?),
            CrystalLine::DiffractionResolutionLimit => {
                self.diffraction_resolution_limit = Some(line.value(VALUE_TOKEN)?)
            }
            CrystalLine::NumReflections => self.num_reflections = Some(line.value(VALUE_TOKEN)?),
            CrystalLine::NumSaturatedReflections => {
                self.num_saturated_reflections = Some(line.value(VALUE_TOKEN)?)
            }
            CrystalLine::NumImplausibleReflections => {
                self.num_implausible_reflections = Some(line.value(VALUE_TOKEN)?)
            }
            CrystalLine::CellParameters => self.cell_parameters = Some(line.cell_parameters()?),
            CrystalLine::FinalResidual => self.final_residual = Some(line.value(2)?),
            // predict_refine/det_shift x = 0.01 y = -0.02 mm
            CrystalLine::DetShift => self.det_shift = Some(line.values([3, 6])?),
            CrystalLine::AStar => self.astar = Some(line.values([2, 3, 4])?),
            CrystalLine::BStar => self.bstar = Some(line.values([2, 3, 4])?),
            CrystalLine::CStar => self.cstar = Some(line.values([2, 3, 4])?),
        }
        Ok(())
    }
}

/// A chunk under construction
#[derive(Debug)]
struct ChunkBuilder {
    start_line: usize,
    file_name: Option<String>,
    event: Option<i64>,
    record: StreamRecord,
}

impl ChunkBuilder {
    fn new(start_line: usize) -> Self {
        Self {
            start_line,
            file_name: None,
            event: None,
            record: StreamRecord::default(),
        }
    }

    fn read_line(&mut self, line: &Line) -> Result<(), StreamError> {
        let Some(kind) = dispatch(&CHUNK_LINES, line.text) else {
            return Ok(());
        };
        let record = &mut self.record;
        match kind {
            ChunkLine::Hit => record.hit = Some(line.value(VALUE_TOKEN)?),
            ChunkLine::IndexedBy => {
                record.indexed_by = Some(line.token(VALUE_TOKEN)?.to_string())
            }
            ChunkLine::NIndexingTries => record.n_indexing_tries = Some(line.value(VALUE_TOKEN)?),
            ChunkLine::PhotonEnergy => record.photon_energy_ev = Some(line.value(VALUE_TOKEN)?),
            ChunkLine::BeamDivergence => record.beam_divergence = Some(line.value(VALUE_TOKEN)?),
            ChunkLine::BeamBandwidth => record.beam_bandwidth = Some(line.value(VALUE_TOKEN)?),
            ChunkLine::AverageCameraLength => {
                record.average_camera_length = Some(line.value(VALUE_TOKEN)?)
            }
            ChunkLine::NumPeaks => record.num_peaks = Some(line.value(VALUE_TOKEN)?),
            ChunkLine::PeakResolution => record.peak_resolution = Some(line.value(VALUE_TOKEN)?),
            ChunkLine::ImageFilename => {
                self.file_name = Some(line.token(VALUE_TOKEN)?.to_string())
            }
            ChunkLine::Event => self.event = Some(line.event_index()?),
        }
        Ok(())
    }

    fn attach_crystal(&mut self, crystal: Crystal) {
        if self.record.crystal.is_some() {
            log::warn!(
                "Chunk starting at line {} has more than one crystal; keeping the last one",
                self.start_line
            );
        }
        self.record.crystal = Some(crystal);
    }

    /// Move the finished record into the output map
    fn finish(self, records: &mut FxHashMap<FrameKey, StreamRecord>) {
        let (Some(file_name), Some(event)) = (self.file_name, self.event) else {
            log::warn!(
                "Chunk starting at line {} has no image filename or event; it was skipped",
                self.start_line
            );
            return;
        };
        let mut record = self.record;
        record.file_name = file_name;
        record.event = event;
        let key = record.key();
        if records.insert(key, record).is_some() {
            log::warn!(
                "Chunk starting at line {} repeats an earlier frame and replaces it",
                self.start_line
            );
        }
    }
}

/// Where the reader is, along with the data being collected at that level
#[derive(Debug)]
enum ParserState {
    Outside,
    InChunk(ChunkBuilder),
    InPeaks(ChunkBuilder),
    InCrystal(ChunkBuilder, Crystal),
    InReflections(ChunkBuilder, Crystal),
}

impl ParserState {
    fn mode(&self) -> ParserMode {
        match self {
            Self::Outside => ParserMode::Outside,
            Self::InChunk(_) => ParserMode::Chunk,
            Self::InPeaks(_) => ParserMode::Peaks,
            Self::InCrystal(..) => ParserMode::Crystal,
            Self::InReflections(..) => ParserMode::Reflections,
        }
    }

    /// Consume one line and return the next state
    fn advance(
        self,
        line: &Line,
        records: &mut FxHashMap<FrameKey, StreamRecord>,
    ) -> Result<Self, StreamError> {
        let next = match self {
            Self::Outside => {
                if line.starts_with(BEGIN_CHUNK) {
                    Self::InChunk(ChunkBuilder::new(line.number))
                } else {
                    Self::Outside
                }
            }
            Self::InChunk(mut chunk) => {
                if line.starts_with(END_CHUNK) {
                    chunk.finish(records);
                    Self::Outside
                } else if line.starts_with(BEGIN_PEAKS) {
                    chunk.record.peaks = Some(Vec::new());
                    Self::InPeaks(chunk)
                } else if line.starts_with(BEGIN_CRYSTAL) {
                    Self::InCrystal(chunk, Crystal::default())
                } else {
                    chunk.read_line(line)?;
                    Self::InChunk(chunk)
                }
            }
            Self::InPeaks(mut chunk) => {
                if line.starts_with(END_CHUNK) {
                    chunk.finish(records);
                    Self::Outside
                } else if line.starts_with(END_PEAKS) {
                    Self::InChunk(chunk)
                } else {
                    if !line.starts_with(PEAKS_HEADER) {
                        let peak = Peak::from_line(line)?;
                        chunk.record.peaks.get_or_insert_with(Vec::new).push(peak);
                    }
                    Self::InPeaks(chunk)
                }
            }
            Self::InCrystal(mut chunk, mut crystal) => {
                if line.starts_with(END_CHUNK) {
                    log::warn!(
                        "Crystal block not closed before the end of chunk at line {}",
                        line.number
                    );
                    chunk.attach_crystal(crystal);
                    chunk.finish(records);
                    Self::Outside
                } else if line.starts_with(END_CRYSTAL) {
                    chunk.attach_crystal(crystal);
                    Self::InChunk(chunk)
                } else if line.starts_with(BEGIN_REFLECTIONS) {
                    crystal.reflections = Some(Vec::new());
                    Self::InReflections(chunk, crystal)
                } else {
                    crystal.read_line(line)?;
                    Self::InCrystal(chunk, crystal)
                }
            }
            Self::InReflections(mut chunk, mut crystal) => {
                if line.starts_with(END_CHUNK) {
                    log::warn!(
                        "Crystal block not closed before the end of chunk at line {}",
                        line.number
                    );
                    chunk.attach_crystal(crystal);
                    chunk.finish(records);
                    Self::Outside
                } else if line.starts_with(END_CRYSTAL) {
                    chunk.attach_crystal(crystal);
                    Self::InChunk(chunk)
                } else if line.starts_with(END_REFLECTIONS) {
                    Self::InCrystal(chunk, crystal)
                } else {
                    if !line.starts_with(REFLECTIONS_HEADER) {
                        let reflection = Reflection::from_line(line)?;
                        crystal
                            .reflections
                            .get_or_insert_with(Vec::new)
                            .push(reflection);
                    }
                    Self::InReflections(chunk, crystal)
                }
            }
        };
        Ok(next)
    }
}

/// Parse the lines of a stream into one record per frame.
///
/// Records are keyed by `(image filename, event)`. Malformed numeric fields abort
/// the parse with an error naming the line and the nesting level.
pub fn parse<I>(lines: I) -> Result<FxHashMap<FrameKey, StreamRecord>, StreamError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut records = FxHashMap::default();
    let mut state = ParserState::Outside;
    for (idx, text) in lines.into_iter().enumerate() {
        let line = Line::new(idx + 1, text.as_ref(), state.mode());
        state = state.advance(&line, &mut records)?;
    }
    if !matches!(state, ParserState::Outside) {
        log::warn!("Stream ended inside a chunk; the incomplete chunk was dropped");
    }
    Ok(records)
}

/// Read and parse a stream file
pub fn parse_stream_file(path: &Path) -> Result<FxHashMap<FrameKey, StreamRecord>, StreamError> {
    if !path.exists() {
        return Err(StreamError::BadFilePath(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;
    log::info!(
        "Parsing stream file {} ({})",
        path.to_string_lossy(),
        human_bytes::human_bytes(contents.len() as f64)
    );
    parse(contents.lines()).map_err(|e| StreamError::InFile(path.to_path_buf(), Box::new(e)))
}

/// Frame counts of a parsed stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub n_frames: usize,
    pub n_hits: usize,
    pub n_crystals: usize,
    pub n_peaks: usize,
}

pub fn summarize(records: &FxHashMap<FrameKey, StreamRecord>) -> StreamSummary {
    records
        .values()
        .fold(StreamSummary::default(), |mut summary, record| {
            summary.n_frames += 1;
            if matches!(record.hit, Some(hit) if hit > 0) {
                summary.n_hits += 1;
            }
            if record.crystal.is_some() {
                summary.n_crystals += 1;
            }
            summary.n_peaks += record.peaks.as_ref().map_or(0, Vec::len);
            summary
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SIMPLE_CHUNK: &str = "\
----- Begin chunk -----
Image filename: run1.h5
Event: //42
hit = 1
num_peaks = 120
--- Begin crystal ---
Cell parameters 7.90 8.10 9.20 nm, 90.00 90.00 120.00 deg
lattice_type = hexagonal
--- End crystal ---
----- End chunk -----
";

    const FULL_STREAM: &str = "\
CrystFEL stream format 2.3
Generated by CrystFEL 0.9.1
----- Begin geometry file -----
clen = 0.1
----- End geometry file -----
----- Begin chunk -----
Image filename: /data/vds_r0042.cxi
Event: //7
Image serial number: 8
hit = 1
indexed_by = xgandalf-nolatt-cell
n_indexing_tries = 2
photon_energy_eV = 9300.000000
beam_divergence = 0.00e+00 rad
beam_bandwidth = 1.00e-08 (fraction)
average_camera_length = 0.120000 m
num_peaks = 2
peak_resolution = 2.345 nm^-1 or 4.264 A
Peaks from peak search
  fs/px   ss/px (1/d)/nm^-1   Intensity  Panel
  423.12  111.55       2.13     1234.50  p0a3
   17.00   45.25       0.87      310.25  p2a0
End of peak list
--- Begin crystal
Cell parameters 7.91 7.92 3.79 nm, 90.01 89.98 90.02 deg
astar = +0.1263 -0.0012 +0.0004 nm^-1
bstar = -0.0011 -0.1262 +0.0021 nm^-1
cstar = +0.0003 +0.0056 -0.2634 nm^-1
lattice_type = tetragonal
centering = P
unique_axis = c
profile_radius = 0.00184 nm^-1
predict_refine/final_residual = 0.125430
predict_refine/det_shift x = 0.012 y = -0.034 mm
diffraction_resolution_limit = 4.07 nm^-1 or 2.46 A
num_reflections = 2
num_saturated_reflections = 0
num_implausible_reflections = 1
Reflections measured after indexing
   h    k    l          I   sigma(I)       peak background  fs/px  ss/px panel
  -3    1    0     512.30      20.10     150.00      10.25  300.1  120.9 p1a2
   0    2   -1      -4.50      12.00       9.00      11.00  155.4   98.7 p1a3
End of reflections
--- End crystal
----- End chunk -----
----- Begin chunk -----
Image filename: /data/vds_r0042.cxi
Event: //8
hit = 0
num_peaks = 0
Peaks from peak search
  fs/px   ss/px (1/d)/nm^-1   Intensity  Panel
End of peak list
----- End chunk -----
";

    #[test]
    fn test_simple_chunk() {
        let records = parse(SIMPLE_CHUNK.lines()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[&FrameKey::new("run1.h5", 42)];
        assert_eq!(record.hit, Some(1));
        assert_eq!(record.num_peaks, Some(120));
        assert_eq!(record.peaks, None);
        let crystal = record.crystal.as_ref().unwrap();
        let expected = [79.0, 81.0, 92.0, 90.0, 90.0, 120.0];
        for (value, exp) in crystal.cell_parameters.unwrap().iter().zip(expected) {
            assert_relative_eq!(*value, exp, epsilon = 1e-9);
        }
        assert_eq!(crystal.lattice_type.as_deref(), Some("hexagonal"));
        assert_eq!(crystal.reflections, None);
        assert_eq!(crystal.profile_radius, None);
    }

    #[test]
    fn test_full_stream() {
        let records = parse(FULL_STREAM.lines()).unwrap();
        assert_eq!(records.len(), 2);

        let indexed = &records[&FrameKey::new("/data/vds_r0042.cxi", 7)];
        assert_eq!(indexed.indexed_by.as_deref(), Some("xgandalf-nolatt-cell"));
        assert_eq!(indexed.n_indexing_tries, Some(2));
        assert_relative_eq!(indexed.photon_energy_ev.unwrap(), 9300.0);
        assert_relative_eq!(indexed.beam_bandwidth.unwrap(), 1.0e-8);
        assert_relative_eq!(indexed.average_camera_length.unwrap(), 0.12);
        assert_relative_eq!(indexed.peak_resolution.unwrap(), 2.345);

        let peaks = indexed.peaks.as_ref().unwrap();
        assert_eq!(peaks.len(), 2);
        assert_relative_eq!(peaks[0].fs, 423.12);
        assert_relative_eq!(peaks[1].one_over_d, 0.87);
        assert_eq!(peaks[1].panel, "p2a0");

        let crystal = indexed.crystal.as_ref().unwrap();
        assert_relative_eq!(crystal.cell_parameters.unwrap()[2], 37.9, epsilon = 1e-9);
        assert_eq!(crystal.astar, Some([0.1263, -0.0012, 0.0004]));
        assert_eq!(crystal.cstar, Some([0.0003, 0.0056, -0.2634]));
        assert_eq!(crystal.centering.as_deref(), Some("P"));
        assert_eq!(crystal.unique_axis.as_deref(), Some("c"));
        assert_eq!(crystal.final_residual, Some(0.12543));
        assert_eq!(crystal.det_shift, Some([0.012, -0.034]));
        assert_eq!(crystal.diffraction_resolution_limit, Some(4.07));
        assert_eq!(crystal.num_reflections, Some(2));
        assert_eq!(crystal.num_saturated_reflections, Some(0));
        assert_eq!(crystal.num_implausible_reflections, Some(1));

        let reflections = crystal.reflections.as_ref().unwrap();
        assert_eq!(reflections.len(), 2);
        assert_eq!((reflections[0].h, reflections[0].k, reflections[0].l), (-3, 1, 0));
        assert_relative_eq!(reflections[1].intensity, -4.5);
        assert_relative_eq!(reflections[1].ss, 98.7);
        assert_eq!(reflections[1].panel, "p1a3");

        // An empty peak list is not the same as no peak list
        let blank = &records[&FrameKey::new("/data/vds_r0042.cxi", 8)];
        assert_eq!(blank.hit, Some(0));
        assert_eq!(blank.peaks, Some(vec![]));
        assert_eq!(blank.crystal, None);
    }

    #[test]
    fn test_parse_is_repeatable() {
        let first = parse(FULL_STREAM.lines()).unwrap();
        let second = parse(FULL_STREAM.lines()).unwrap();
        assert_eq!(first, second);
        for (key, record) in first.iter() {
            assert_eq!(*key, record.key());
        }
    }

    #[test]
    fn test_malformed_number_names_line_and_mode() {
        let text = SIMPLE_CHUNK.replace("num_peaks = 120", "num_peaks = many");
        match parse(text.lines()) {
            Err(StreamError::Parse { line, mode, .. }) => {
                assert_eq!(line, 5);
                assert_eq!(mode, ParserMode::Chunk);
            }
            other => panic!("Expected a parse error, got {other:?}"),
        }

        let text = SIMPLE_CHUNK.replace("9.20 nm", "9.2x nm");
        match parse(text.lines()) {
            Err(StreamError::Parse { line, mode, .. }) => {
                assert_eq!(line, 7);
                assert_eq!(mode, ParserMode::Crystal);
            }
            other => panic!("Expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_short_reflection_line_is_an_error() {
        let text = FULL_STREAM.replace("  11.00  155.4   98.7 p1a3", "");
        match parse(text.lines()) {
            Err(StreamError::Parse { mode, .. }) => assert_eq!(mode, ParserMode::Reflections),
            other => panic!("Expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_chunk_without_event_is_skipped() {
        let text = SIMPLE_CHUNK.replace("Event: //42\n", "");
        let records = parse(text.lines()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_unterminated_chunk_is_dropped() {
        let text = SIMPLE_CHUNK.replace("----- End chunk -----\n", "");
        let records = parse(text.lines()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_lines_outside_chunks_are_ignored() {
        let text = format!("hit = 5\nEvent: //3\n{SIMPLE_CHUNK}num_peaks = x\n");
        let records = parse(text.lines()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[&FrameKey::new("run1.h5", 42)].hit, Some(1));
    }

    #[test]
    fn test_unclosed_crystal_is_kept() {
        let text = SIMPLE_CHUNK.replace("--- End crystal ---\n", "");
        let records = parse(text.lines()).unwrap();
        let crystal = records[&FrameKey::new("run1.h5", 42)].crystal.as_ref().unwrap();
        assert_relative_eq!(crystal.cell_parameters.unwrap()[0], 79.0, epsilon = 1e-9);
        assert_eq!(crystal.lattice_type.as_deref(), Some("hexagonal"));
    }

    #[test]
    fn test_second_crystal_replaces_first() {
        let text = SIMPLE_CHUNK.replace(
            "--- End crystal ---\n",
            "--- End crystal ---\n--- Begin crystal\nCell parameters 5.00 5.00 5.00 nm, 90.00 90.00 90.00 deg\n--- End crystal\n",
        );
        let records = parse(text.lines()).unwrap();
        let crystal = records[&FrameKey::new("run1.h5", 42)].crystal.as_ref().unwrap();
        assert_relative_eq!(crystal.cell_parameters.unwrap()[0], 50.0, epsilon = 1e-9);
        assert_eq!(crystal.lattice_type, None);
    }

    #[test]
    fn test_repeated_frame_replaces_earlier() {
        let repeat = SIMPLE_CHUNK
            .replace("hit = 1", "hit = 0")
            .replace("num_peaks = 120", "num_peaks = 3");
        let text = format!("{SIMPLE_CHUNK}{repeat}");
        let records = parse(text.lines()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[&FrameKey::new("run1.h5", 42)];
        assert_eq!(record.hit, Some(0));
        assert_eq!(record.num_peaks, Some(3));
    }

    #[test]
    fn test_non_finite_cell_is_an_error() {
        for bad in ["nan", "inf"] {
            let text = SIMPLE_CHUNK.replace("7.90 8.10", &format!("7.90 {bad}"));
            match parse(text.lines()) {
                Err(StreamError::Parse { line, mode, .. }) => {
                    assert_eq!(line, 7);
                    assert_eq!(mode, ParserMode::Crystal);
                }
                other => panic!("Expected a parse error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_stream_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.stream");
        std::fs::write(&path, FULL_STREAM).unwrap();
        let records = parse_stream_file(&path).unwrap();
        assert_eq!(summarize(&records).n_frames, 2);

        assert!(matches!(
            parse_stream_file(&dir.path().join("missing.stream")),
            Err(StreamError::BadFilePath(_))
        ));

        let bad = dir.path().join("bad.stream");
        std::fs::write(&bad, SIMPLE_CHUNK.replace("num_peaks = 120", "num_peaks = x")).unwrap();
        match parse_stream_file(&bad) {
            Err(StreamError::InFile(file, inner)) => {
                assert_eq!(file, bad);
                assert!(matches!(*inner, StreamError::Parse { line: 5, .. }));
            }
            other => panic!("Expected an in-file parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_frame_key_display() {
        assert_eq!(FrameKey::new("vds.cxi", 12).to_string(), "vds.cxi //12");
    }

    #[test]
    fn test_summary() {
        let records = parse(FULL_STREAM.lines()).unwrap();
        let summary = summarize(&records);
        assert_eq!(
            summary,
            StreamSummary {
                n_frames: 2,
                n_hits: 1,
                n_crystals: 1,
                n_peaks: 2,
            }
        );
    }
}

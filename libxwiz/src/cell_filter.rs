use std::io::{BufWriter, Write};
use std::path::Path;

use fxhash::FxHashMap;

use super::error::{CellFilterError, StreamError};
use super::stream::{
    FrameKey, Line, ParserMode, StreamRecord, BEGIN_CHUNK, BEGIN_CRYSTAL, END_CHUNK, END_CRYSTAL,
    VALUE_TOKEN,
};
use super::unit_cell::UnitCell;

const IMAGE_FILENAME: &str = "Image filename:";
const EVENT: &str = "Event:";
const CELL_PARAMETERS: &str = "Cell parameters";

/// Check that every cell constant lies within `tolerance` (relative, inclusive)
/// of the reference.
pub fn is_within_tolerance(candidate: &[f64; 6], reference: &[f64; 6], tolerance: f64) -> bool {
    candidate.iter().zip(reference).all(|(value, reference)| {
        *value >= reference * (1.0 - tolerance) && *value <= reference * (1.0 + tolerance)
    })
}

fn accepts(reference: Option<&UnitCell>, cell: &[f64; 6], tolerance: f64) -> bool {
    reference.map_or(true, |reference| {
        is_within_tolerance(cell, &reference.constants, tolerance)
    })
}

/// Accepted crystals of a stream, in stream order.
///
/// `frames[i]` is the frame identifier (`"file //event"`) of the crystal whose
/// constants (Å and degrees) are `cells[i]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrystalFrames {
    pub frames: Vec<String>,
    pub cells: Vec<[f64; 6]>,
    /// Number of chunks seen, whether indexed or not
    pub n_chunks: usize,
}

impl CrystalFrames {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn push(&mut self, key: &FrameKey, cell: [f64; 6]) {
        self.frames.push(key.to_string());
        self.cells.push(cell);
    }

    /// Fraction of chunks with an accepted crystal
    pub fn indexing_rate(&self) -> f64 {
        if self.n_chunks == 0 {
            0.0
        } else {
            self.len() as f64 / self.n_chunks as f64
        }
    }
}

/// Collect the accepted crystals from stream lines.
///
/// Only chunk boundaries, the frame identification and `Cell parameters` lines are
/// looked at. Each crystal block is judged on its own, so a frame with several
/// crystals contributes one entry per accepted crystal. A `reference` of None
/// accepts everything.
pub fn scan_crystal_lines<I>(
    lines: I,
    reference: Option<&UnitCell>,
    tolerance: f64,
) -> Result<CrystalFrames, StreamError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut frames = CrystalFrames::default();
    let mut mode = ParserMode::Outside;
    let mut file_name: Option<String> = None;
    let mut event: Option<i64> = None;

    for (idx, text) in lines.into_iter().enumerate() {
        let text = text.as_ref();
        let line = Line::new(idx + 1, text, mode);
        match mode {
            ParserMode::Outside => {
                if text.starts_with(BEGIN_CHUNK) {
                    mode = ParserMode::Chunk;
                    file_name = None;
                    event = None;
                    frames.n_chunks += 1;
                }
            }
            ParserMode::Crystal => {
                if text.starts_with(END_CHUNK) {
                    log::warn!(
                        "Crystal block not closed before the end of chunk at line {}",
                        idx + 1
                    );
                    mode = ParserMode::Outside;
                } else if text.starts_with(END_CRYSTAL) {
                    mode = ParserMode::Chunk;
                } else if text.starts_with(CELL_PARAMETERS) {
                    let cell = line.cell_parameters()?;
                    match (&file_name, event) {
                        (Some(file_name), Some(event)) => {
                            if accepts(reference, &cell, tolerance) {
                                frames.push(&FrameKey::new(file_name, event), cell);
                            }
                        }
                        _ => log::warn!(
                            "Crystal at line {} belongs to a chunk without image filename or event; skipped",
                            idx + 1
                        ),
                    }
                }
            }
            _ => {
                if text.starts_with(END_CHUNK) {
                    mode = ParserMode::Outside;
                } else if text.starts_with(BEGIN_CRYSTAL) {
                    mode = ParserMode::Crystal;
                } else if text.starts_with(IMAGE_FILENAME) {
                    file_name = Some(line.token(VALUE_TOKEN)?.to_string());
                } else if text.starts_with(EVENT) {
                    event = Some(line.event_index()?);
                }
            }
        }
    }
    Ok(frames)
}

/// Collect the accepted crystals from already parsed stream records, sorted by frame.
///
/// Gives the same decisions as [`scan_crystal_lines`] for streams with at most one
/// crystal per frame.
pub fn crystal_frames_from_records(
    records: &FxHashMap<FrameKey, StreamRecord>,
    reference: Option<&UnitCell>,
    tolerance: f64,
) -> CrystalFrames {
    let mut keys: Vec<&FrameKey> = records.keys().collect();
    keys.sort();

    let mut frames = CrystalFrames {
        n_chunks: records.len(),
        ..Default::default()
    };
    for key in keys {
        let cell = records[key]
            .crystal
            .as_ref()
            .and_then(|crystal| crystal.cell_parameters);
        if let Some(cell) = cell {
            if accepts(reference, &cell, tolerance) {
                frames.push(key, cell);
            }
        }
    }
    frames
}

/// Scan a stream file for crystals whose cell matches the reference cell file
pub fn scan_crystal_frames(
    stream_path: &Path,
    cell_path: &Path,
    tolerance: f64,
) -> Result<CrystalFrames, CellFilterError> {
    let reference = UnitCell::read(cell_path)?;
    if reference.is_none() {
        log::warn!("Reference cell cannot be used for validation; every crystal is accepted");
    }

    if !stream_path.exists() {
        return Err(StreamError::BadFilePath(stream_path.to_path_buf()).into());
    }
    let contents = std::fs::read_to_string(stream_path).map_err(StreamError::from)?;
    log::info!(
        "Scanning stream file {} ({})",
        stream_path.to_string_lossy(),
        human_bytes::human_bytes(contents.len() as f64)
    );
    let frames = scan_crystal_lines(contents.lines(), reference.as_ref(), tolerance)
        .map_err(|e| StreamError::InFile(stream_path.to_path_buf(), Box::new(e)))?;
    log::info!(
        "{} crystals within tolerance {tolerance} out of {} frames",
        frames.len(),
        frames.n_chunks
    );
    Ok(frames)
}

/// Write the accepted frame identifiers, one per line
pub fn write_hit_list(path: &Path, frames: &CrystalFrames) -> Result<(), std::io::Error> {
    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    for frame in frames.frames.iter() {
        writeln!(writer, "{frame}")?;
    }
    writer.flush()?;
    log::info!(
        "Wrote {} frames to hit list {}",
        frames.len(),
        path.to_string_lossy()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::parse;
    use approx::assert_relative_eq;

    const REFERENCE: [f64; 6] = [79.0, 79.0, 38.0, 90.0, 90.0, 90.0];

    fn chunk(file: &str, event: i64, cell: Option<&str>) -> String {
        let mut text = format!(
            "----- Begin chunk -----\nImage filename: {file}\nEvent: //{event}\nhit = 1\n"
        );
        if let Some(cell) = cell {
            text.push_str("--- Begin crystal\n");
            text.push_str(&format!("Cell parameters {cell}\n"));
            text.push_str("lattice_type = tetragonal\n--- End crystal\n");
        }
        text.push_str("----- End chunk -----\n");
        text
    }

    fn stream() -> String {
        [
            chunk("r0001.cxi", 1, Some("7.90 7.91 3.80 nm, 90.00 90.00 90.00 deg")),
            chunk("r0001.cxi", 2, None),
            chunk("r0001.cxi", 3, Some("6.10 6.10 3.80 nm, 90.00 90.00 90.00 deg")),
            chunk("r0002.cxi", 1, Some("7.85 7.95 3.82 nm, 90.20 89.80 90.10 deg")),
        ]
        .concat()
    }

    #[test]
    fn test_tolerance_bounds_are_inclusive() {
        let tolerance = 0.05;
        let mut candidate = REFERENCE;
        assert!(is_within_tolerance(&candidate, &REFERENCE, tolerance));

        candidate[0] = REFERENCE[0] * (1.0 + tolerance);
        candidate[5] = REFERENCE[5] * (1.0 - tolerance);
        assert!(is_within_tolerance(&candidate, &REFERENCE, tolerance));

        candidate[2] = REFERENCE[2] * (1.0 + tolerance) + 1e-9;
        assert!(!is_within_tolerance(&candidate, &REFERENCE, tolerance));
    }

    #[test]
    fn test_zero_tolerance() {
        let mut candidate = REFERENCE;
        assert!(is_within_tolerance(&candidate, &REFERENCE, 0.0));
        candidate[4] = 90.01;
        assert!(!is_within_tolerance(&candidate, &REFERENCE, 0.0));
    }

    #[test]
    fn test_scan_crystal_lines() {
        let reference = UnitCell::new(REFERENCE);
        let frames = scan_crystal_lines(stream().lines(), Some(&reference), 0.05).unwrap();
        assert_eq!(frames.frames, vec!["r0001.cxi //1", "r0002.cxi //1"]);
        for (value, expected) in frames.cells[0].iter().zip([79.0, 79.1, 38.0, 90.0, 90.0, 90.0]) {
            assert_relative_eq!(*value, expected, epsilon = 1e-9);
        }
        assert_eq!(frames.n_chunks, 4);
        assert_eq!(frames.indexing_rate(), 0.5);
    }

    #[test]
    fn test_scan_without_reference_accepts_all() {
        let frames = scan_crystal_lines(stream().lines(), None, 0.05).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames.frames[1], "r0001.cxi //3");
    }

    #[test]
    fn test_scan_matches_parsed_records() {
        let text = stream();
        let reference = UnitCell::new(REFERENCE);
        let scanned = scan_crystal_lines(text.lines(), Some(&reference), 0.05).unwrap();
        let records = parse(text.lines()).unwrap();
        let from_records = crystal_frames_from_records(&records, Some(&reference), 0.05);
        assert_eq!(scanned, from_records);
    }

    #[test]
    fn test_unclosed_crystal_ends_with_its_chunk() {
        let text = [
            chunk("a.cxi", 1, Some("7.90 7.90 3.80 nm, 90.00 90.00 90.00 deg"))
                .replace("--- End crystal\n", ""),
            chunk("a.cxi", 2, Some("7.92 7.88 3.81 nm, 90.00 90.00 90.00 deg")),
        ]
        .concat();
        let reference = UnitCell::new(REFERENCE);
        let scanned = scan_crystal_lines(text.lines(), Some(&reference), 0.05).unwrap();
        assert_eq!(scanned.frames, vec!["a.cxi //1", "a.cxi //2"]);
        assert_eq!(scanned.n_chunks, 2);

        let records = parse(text.lines()).unwrap();
        let from_records = crystal_frames_from_records(&records, Some(&reference), 0.05);
        assert_eq!(scanned, from_records);
    }

    #[test]
    fn test_scan_malformed_cell() {
        let text = chunk("r0001.cxi", 1, Some("7.90 x.91 3.80 nm, 90.00 90.00 90.00 deg"));
        match scan_crystal_lines(text.lines(), None, 0.05) {
            Err(StreamError::Parse { line, .. }) => assert_eq!(line, 6),
            other => panic!("Expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_scan_crystal_frames_and_hit_list() {
        let dir = tempfile::tempdir().unwrap();
        let stream_path = dir.path().join("xwiz.stream");
        let cell_path = dir.path().join("ref.cell");
        let hits_path = dir.path().join("xwiz_hits.lst");
        std::fs::write(&stream_path, stream()).unwrap();
        std::fs::write(
            &cell_path,
            "a = 79.0 A\nb = 79.0 A\nc = 38.0 A\nal = 90 deg\nbe = 90 deg\nga = 90 deg\n",
        )
        .unwrap();

        let frames = scan_crystal_frames(&stream_path, &cell_path, 0.05).unwrap();
        assert_eq!(frames.len(), 2);
        write_hit_list(&hits_path, &frames).unwrap();
        assert_eq!(
            std::fs::read_to_string(&hits_path).unwrap(),
            "r0001.cxi //1\nr0002.cxi //1\n"
        );

        let missing = dir.path().join("missing.stream");
        assert!(matches!(
            scan_crystal_frames(&missing, &cell_path, 0.05),
            Err(CellFilterError::StreamError(StreamError::BadFilePath(_)))
        ));
    }
}

use std::path::{Path, PathBuf};

use regex::Regex;

use super::error::CellFileError;

/// Keys of the six cell constants in a CrystFEL `.cell` file, in a,b,c,alpha,beta,gamma order
pub const CELL_KEYS: [&str; 6] = ["a", "b", "c", "al", "be", "ga"];
const ANGSTROM: &str = "A";
const DEGREE: &str = "deg";

const CRYST1: &str = "CRYST1";
// Column layout of the six constants in a CRYST1 record (0-based, end exclusive)
const CRYST1_COLUMNS: [(usize, usize); 6] = [(6, 15), (15, 24), (24, 33), (33, 40), (40, 47), (47, 54)];
const CRYST1_END: usize = 54;

/// Cell file flavours, recognized by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellFormat {
    /// CrystFEL `.cell`, `key = value unit` lines
    CrystFel,
    /// PDB, `CRYST1` record
    Pdb,
    Unknown,
}

impl CellFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("cell") => Self::CrystFel,
            Some("pdb") => Self::Pdb,
            _ => Self::Unknown,
        }
    }
}

/// The six constants of a unit cell: edges a, b, c in Å and angles alpha, beta,
/// gamma in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitCell {
    pub constants: [f64; 6],
}

impl UnitCell {
    pub fn new(constants: [f64; 6]) -> Self {
        Self { constants }
    }

    /// Read the reference cell from a `.cell` or `.pdb` file.
    ///
    /// Returns None, after a warning, if the format cannot be told from the
    /// extension.
    pub fn read(path: &Path) -> Result<Option<Self>, CellFileError> {
        if !path.exists() {
            return Err(CellFileError::BadFilePath(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        match CellFormat::from_path(path) {
            CellFormat::CrystFel => Self::parse_crystfel(path, &contents).map(Some),
            CellFormat::Pdb => Self::parse_pdb(path, &contents).map(Some),
            CellFormat::Unknown => {
                log::warn!(
                    "Cell file {} is of unknown type (by extension)",
                    path.to_string_lossy()
                );
                Ok(None)
            }
        }
    }

    fn parse_crystfel(path: &Path, contents: &str) -> Result<Self, CellFileError> {
        let mut values: [Option<f64>; 6] = [None; 6];
        for (idx, line) in contents.lines().enumerate() {
            if !line.contains(" = ") {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let Some(position) = CELL_KEYS.iter().position(|key| Some(key) == tokens.first())
            else {
                continue;
            };
            let token = tokens.get(2).copied().unwrap_or("");
            let value = token
                .parse::<f64>()
                .map_err(|_| CellFileError::ParsingError {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    message: format!("'{token}' is not a number"),
                })?;
            values[position] = Some(value);
        }

        let mut constants = [0.0; 6];
        for (idx, value) in values.iter().enumerate() {
            constants[idx] =
                value.ok_or_else(|| CellFileError::MissingConstant(path.to_path_buf(), CELL_KEYS[idx]))?;
        }
        Ok(Self { constants })
    }

    fn parse_pdb(path: &Path, contents: &str) -> Result<Self, CellFileError> {
        let (idx, line) = contents
            .lines()
            .enumerate()
            .find(|(_, line)| line.starts_with(CRYST1))
            .ok_or_else(|| CellFileError::MissingCryst1(path.to_path_buf()))?;

        if let Some(constants) = cryst1_fixed_columns(line) {
            return Ok(Self { constants });
        }

        // Not column aligned; fall back to whitespace separated fields
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let mut constants = [0.0; 6];
        for (position, constant) in constants.iter_mut().enumerate() {
            let token = tokens.get(position + 1).copied().unwrap_or("");
            *constant = token.parse().map_err(|_| CellFileError::ParsingError {
                path: path.to_path_buf(),
                line: idx + 1,
                message: format!("'{token}' is not a valid CRYST1 cell constant"),
            })?;
        }
        Ok(Self { constants })
    }

    pub fn edges(&self) -> &[f64] {
        &self.constants[..3]
    }

    pub fn angles(&self) -> &[f64] {
        &self.constants[3..]
    }
}

fn cryst1_fixed_columns(line: &str) -> Option<[f64; 6]> {
    let mut constants = [0.0; 6];
    for (constant, (start, end)) in constants.iter_mut().zip(CRYST1_COLUMNS) {
        *constant = line.get(start..end)?.trim().parse().ok()?;
    }
    Some(constants)
}

/// Name of the refined cell file: `<stem>_refined.<ext>`, placed in `directory`
/// if given, otherwise next to `cell_path`.
pub fn refined_cell_path(cell_path: &Path, directory: Option<&Path>) -> PathBuf {
    let stem = cell_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match cell_path.extension() {
        Some(ext) => format!("{stem}_refined.{}", ext.to_string_lossy()),
        None => format!("{stem}_refined"),
    };
    match directory {
        Some(dir) => dir.join(file_name),
        None => cell_path.with_file_name(file_name),
    }
}

/// Write a copy of `source` with the cell constants replaced by `refined`.
///
/// Only the constant lines (`.cell`) or the CRYST1 record (`.pdb`) change; every
/// other line is copied as is. Returns false, after a warning, when the format
/// is unknown and nothing was written.
pub fn write_refined_cell(
    source: &Path,
    target: &Path,
    refined: &UnitCell,
) -> Result<bool, CellFileError> {
    if !source.exists() {
        return Err(CellFileError::BadFilePath(source.to_path_buf()));
    }
    let contents = std::fs::read_to_string(source)?;
    let new_contents = match CellFormat::from_path(source) {
        CellFormat::CrystFel => replace_crystfel_constants(&contents, refined),
        CellFormat::Pdb => replace_cryst1_record(&contents, refined),
        CellFormat::Unknown => {
            log::warn!(
                "Cell file {} is of unknown type (by extension); no refined cell written",
                source.to_string_lossy()
            );
            return Ok(false);
        }
    };
    std::fs::write(target, new_contents)?;
    log::info!("Refined cell written to {}", target.to_string_lossy());
    Ok(true)
}

fn replace_crystfel_constants(contents: &str, refined: &UnitCell) -> String {
    let mut output = String::with_capacity(contents.len());
    for line in contents.split_inclusive('\n') {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let position = tokens
            .first()
            .and_then(|key| CELL_KEYS.iter().position(|name| name == key));
        match position {
            Some(position) if tokens.len() >= 3 => {
                let mut fields: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
                fields[2] = format!("{:.2}", refined.constants[position]);
                if fields.len() == 3 {
                    let unit = if position < 3 { ANGSTROM } else { DEGREE };
                    fields.push(unit.to_string());
                }
                output.push_str(&fields.join(" "));
                output.push('\n');
            }
            _ => output.push_str(line),
        }
    }
    output
}

fn replace_cryst1_record(contents: &str, refined: &UnitCell) -> String {
    let mut output = String::with_capacity(contents.len());
    let mut replaced = false;
    for line in contents.split_inclusive('\n') {
        if replaced || !line.starts_with(CRYST1) {
            output.push_str(line);
            continue;
        }
        let record = line.trim_end_matches(['\n', '\r']);
        let tail = match record.get(CRYST1_END..) {
            Some(tail) if cryst1_fixed_columns(record).is_some() => tail.to_string(),
            _ => format!(
                " {}",
                record.split_whitespace().skip(7).collect::<Vec<_>>().join(" ")
            ),
        };
        let mut new_record = String::from(CRYST1);
        for edge in refined.edges() {
            new_record.push_str(&format!("{edge:9.3}"));
        }
        for angle in refined.angles() {
            new_record.push_str(&format!("{angle:7.2}"));
        }
        new_record.push_str(&tail);
        output.push_str(&new_record);
        output.push_str(&line[record.len()..]);
        replaced = true;
    }
    output
}

/// One-line summary of a cell file for the log: the file name followed by the
/// values it defines.
pub fn describe_cell_file(path: &Path) -> Result<String, CellFileError> {
    if !path.exists() {
        return Err(CellFileError::BadFilePath(path.to_path_buf()));
    }
    let name = path.to_string_lossy();
    let mut description = if name.len() < 20 {
        format!("{name:20}")
    } else {
        format!("{name}\n{:20}", "")
    };
    let contents = std::fs::read_to_string(path)?;
    match CellFormat::from_path(path) {
        CellFormat::CrystFel => {
            let value_re = Regex::new(r"( = )(\S+)").expect("static regex is valid");
            let values: Vec<&str> = value_re
                .captures_iter(&contents)
                .filter_map(|caps| caps.get(2).map(|m| m.as_str()))
                .collect();
            description.push_str(&values.join("  "));
        }
        CellFormat::Pdb => {
            let fields: Vec<&str> = contents
                .lines()
                .next()
                .unwrap_or("")
                .split_whitespace()
                .skip(1)
                .collect();
            let split = fields.len().min(6);
            let (constants, space_group) = fields.split_at(split);
            description.push_str(&space_group.join("  "));
            description.push_str("  ");
            description.push_str(&constants.join("  "));
        }
        CellFormat::Unknown => {
            log::warn!("Cell file {name} is of unknown type (by extension)");
        }
    }
    Ok(description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const CELL_FILE: &str = "\
CrystFEL unit cell file version 1.0

lattice_type = tetragonal
centering = P
unique_axis = c

a = 79.10 A
b = 79.20 A
c = 37.90 A
al = 90.00 deg
be = 90.00 deg
ga = 90.00 deg
";

    const PDB_FILE: &str = "\
CRYST1   79.100   79.200   37.900  90.00  90.00  90.00 P 43 21 2     8
ATOM      1  N   LYS A   1       3.287  10.092  10.329  1.00  5.89           N
";

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_read_crystfel_cell() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "lyso.cell", CELL_FILE);
        let cell = UnitCell::read(&path).unwrap().unwrap();
        assert_eq!(cell.constants, [79.1, 79.2, 37.9, 90.0, 90.0, 90.0]);
    }

    #[test]
    fn test_read_pdb_cell() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "lyso.pdb", PDB_FILE);
        let cell = UnitCell::read(&path).unwrap().unwrap();
        assert_eq!(cell.constants, [79.1, 79.2, 37.9, 90.0, 90.0, 90.0]);

        // Loosely formatted record
        let path = write_file(dir.path(), "loose.pdb", "CRYST1 79.1 79.2 37.9 90 90 90 P 1\n");
        let cell = UnitCell::read(&path).unwrap().unwrap();
        assert_eq!(cell.constants, [79.1, 79.2, 37.9, 90.0, 90.0, 90.0]);
    }

    #[test]
    fn test_read_unknown_or_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "lyso.txt", CELL_FILE);
        assert!(UnitCell::read(&path).unwrap().is_none());

        let missing = dir.path().join("missing.cell");
        assert!(matches!(
            UnitCell::read(&missing),
            Err(CellFileError::BadFilePath(_))
        ));
    }

    #[test]
    fn test_read_malformed_cell() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "bad.cell", &CELL_FILE.replace("79.20", "7x.20"));
        match UnitCell::read(&path) {
            Err(CellFileError::ParsingError { line, .. }) => assert_eq!(line, 8),
            other => panic!("Expected a parsing error, got {other:?}"),
        }

        let path = write_file(dir.path(), "short.cell", &CELL_FILE.replace("ga = 90.00 deg\n", ""));
        assert!(matches!(
            UnitCell::read(&path),
            Err(CellFileError::MissingConstant(_, "ga"))
        ));

        let path = write_file(dir.path(), "nocryst.pdb", "HEADER    LYSOZYME\n");
        assert!(matches!(
            UnitCell::read(&path),
            Err(CellFileError::MissingCryst1(_))
        ));
    }

    #[test]
    fn test_refined_cell_path() {
        assert_eq!(
            refined_cell_path(Path::new("/data/cells/lyso.cell"), None),
            PathBuf::from("/data/cells/lyso_refined.cell")
        );
        assert_eq!(
            refined_cell_path(Path::new("/data/cells/lyso.pdb"), Some(Path::new("/scratch"))),
            PathBuf::from("/scratch/lyso_refined.pdb")
        );
    }

    #[test]
    fn test_write_refined_crystfel_cell() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "lyso.cell", &CELL_FILE.replace("ga = 90.00 deg", "ga = 90.00"));
        let target = refined_cell_path(&source, None);
        let refined = UnitCell::new([79.123, 79.2, 38.004, 90.0, 89.996, 120.0]);
        assert!(write_refined_cell(&source, &target, &refined).unwrap());

        let written = std::fs::read_to_string(&target).unwrap();
        let expected = "\
CrystFEL unit cell file version 1.0

lattice_type = tetragonal
centering = P
unique_axis = c

a = 79.12 A
b = 79.20 A
c = 38.00 A
al = 90.00 deg
be = 90.00 deg
ga = 120.00 deg
";
        assert_eq!(written, expected);
        let reread = UnitCell::read(&target).unwrap().unwrap();
        assert_relative_eq!(reread.constants[0], 79.12);
    }

    #[test]
    fn test_write_refined_pdb_cell() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "lyso.pdb", PDB_FILE);
        let target = refined_cell_path(&source, None);
        let refined = UnitCell::new([79.0, 80.5, 37.25, 90.0, 90.0, 119.996]);
        assert!(write_refined_cell(&source, &target, &refined).unwrap());

        let written = std::fs::read_to_string(&target).unwrap();
        let mut lines = written.lines();
        assert_eq!(
            lines.next().unwrap(),
            "CRYST1   79.000   80.500   37.250  90.00  90.00 120.00 P 43 21 2     8"
        );
        assert_eq!(lines.next().unwrap(), PDB_FILE.lines().nth(1).unwrap());
    }

    #[test]
    fn test_write_refined_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "lyso.txt", CELL_FILE);
        let target = dir.path().join("lyso_refined.txt");
        let refined = UnitCell::new([1.0; 6]);
        assert!(!write_refined_cell(&source, &target, &refined).unwrap());
        assert!(!target.exists());
    }

    #[test]
    fn test_describe_cell_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "lyso.cell", CELL_FILE);
        let description = describe_cell_file(&path).unwrap();
        assert!(description.ends_with("tetragonal  P  c  79.10  79.20  37.90  90.00  90.00  90.00"));

        let path = write_file(dir.path(), "lyso.pdb", PDB_FILE);
        let description = describe_cell_file(&path).unwrap();
        assert!(description.ends_with("P  43  21  2  8  79.100  79.200  37.900  90.00  90.00  90.00"));
    }
}

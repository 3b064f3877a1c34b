use std::path::PathBuf;
use thiserror::Error;

use super::stream::ParserMode;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream parsing failed at line {line} ({mode}): {message}")]
    Parse {
        line: usize,
        mode: ParserMode,
        message: String,
    },
    #[error("Could not open stream file because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Stream file {0:?} is malformed: {1}")]
    InFile(PathBuf, Box<StreamError>),
    #[error("Stream reading failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CellFileError {
    #[error("Could not open cell file because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Cell file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Cell file {path:?} could not be parsed at line {line}: {message}")]
    ParsingError {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("Cell file {0:?} does not define the cell constant '{1}'")]
    MissingConstant(PathBuf, &'static str),
    #[error("PDB file {0:?} does not contain a CRYST1 record")]
    MissingCryst1(PathBuf),
}

#[derive(Debug, Error)]
pub enum CellFilterError {
    #[error("Crystal frame scan failed due to stream error: {0}")]
    StreamError(#[from] StreamError),
    #[error("Crystal frame scan failed due to cell file error: {0}")]
    CellFileError(#[from] CellFileError),
}

#[derive(Debug, Error)]
pub enum CellFitError {
    #[error("Cannot refine the unit cell from an empty crystal ensemble")]
    EmptyEnsemble,
}

#[derive(Debug, Error)]
pub enum DecompositionError {
    #[error("Expected a two-dimensional boolean mask, found {0} dimensions")]
    NotTwoDimensional(usize),
    #[error("Rectangle x: {x_min}..{x_max}, y: {y_min}..{y_max} does not fit in a {height}x{width} mask")]
    RectangleOutOfBounds {
        x_min: usize,
        x_max: usize,
        y_min: usize,
        y_max: usize,
        height: usize,
        width: usize,
    },
}

#[derive(Debug, Error)]
pub enum DetectorInfoError {
    #[error("Unknown detector: {0}")]
    UnknownDetector(String),
    #[error("Missing info on '{1}' data type for detector {0}")]
    MissingDataType(String, String),
    #[error("The {0} could not be guessed from the HDF5 or geometry file")]
    CannotGuess(String),
}

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("Could not open geometry file because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Geometry file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Geometry file - panel description ({0}) not expected for {1} data")]
    UnexpectedPanel(String, String),
    #[error("Geometry file - not suitable panel description: {0}")]
    UnsuitablePanel(String),
    #[error("Geometry file - could not parse value '{value}' at line {line}")]
    ParsingError { line: usize, value: String },
}

#[derive(Debug, Error)]
pub enum MaskConverterError {
    #[error("Mask converter failed due to geometry error: {0}")]
    GeometryError(#[from] GeometryError),
    #[error("Mask converter failed due to decomposition error: {0}")]
    DecompositionError(#[from] DecompositionError),
    #[error("Mask converter failed due to detector info error: {0}")]
    DetectorInfoError(#[from] DetectorInfoError),
    #[error("Wrong mask shape: {found:?}; expected: {expected:?} or (n_data, {expected:?})")]
    WrongMaskShape {
        found: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error("Mask entry {entry} outside of range (0,{max})")]
    EntryOutOfRange { entry: usize, max: usize },
    #[error("Bad area with panel {0} cannot be applied to a mask without panels")]
    PanelOnFlatMask(String),
}

#[cfg(feature = "hdf5")]
#[derive(Debug, Error)]
pub enum MaskHdfError {
    #[error("Mask HDF5 access failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("Could not open HDF5 file because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Could not read '{0}' from {1:?}")]
    MissingDataset(String, PathBuf),
    #[error("Mask HDF5 access failed due to mask error: {0}")]
    MaskError(#[from] MaskConverterError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid tolerance {0}; expected a value in [0, 1)")]
    BadTolerance(f64),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to CellFilter error: {0}")]
    CellFilterError(#[from] CellFilterError),
    #[error("Processor failed due to cell file error: {0}")]
    CellFileError(#[from] CellFileError),
    #[error("Processor failed due to cell fit error: {0}")]
    CellFitError(#[from] CellFitError),
    #[error("Processor failed due to geometry error: {0}")]
    GeometryError(#[from] GeometryError),
    #[error("Processor failed due to detector info error: {0}")]
    DetectorInfoError(#[from] DetectorInfoError),
    #[error("Processor failed due to MaskConverter error: {0}")]
    MaskConverterError(#[from] MaskConverterError),
    #[cfg(feature = "hdf5")]
    #[error("Processor failed due to mask HDF5 error: {0}")]
    MaskHdfError(#[from] MaskHdfError),
    #[error("Processor was asked to convert masks but was built without HDF5 support")]
    NoHdf5Support,
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
}

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::cell_filter::{scan_crystal_frames, write_hit_list};
use super::config::{CellCheckConfig, Config, MaskConfig};
use super::error::{CellFilterError, ProcessorError};
use super::gauss_fit::{fit_unit_cell, refined_constants, FitOutcome};
use super::stream::{parse_stream_file, summarize, StreamSummary};
use super::unit_cell::{describe_cell_file, write_refined_cell, UnitCell};

#[cfg(feature = "hdf5")]
use super::{
    detector_info::{guess_detector_info, DetectorHints},
    error::GeometryError,
    geometry::bad_pixel_value,
    mask_converter::{MaskConverter, RunMode, WriteMode},
    mask_hdf::{read_mask, read_mask_shape, write_mask},
};

/// What the cell check found
#[derive(Debug, Clone)]
pub struct CellCheckSummary {
    pub n_frames: usize,
    pub n_crystals: usize,
    pub hit_list_path: PathBuf,
    pub stream: StreamSummary,
    pub refined: Option<[FitOutcome; 6]>,
    /// Set if a refined cell file was written
    pub refined_cell_path: Option<PathBuf>,
}

fn set_progress(status: &Mutex<f32>, progress: f32) {
    match status.lock() {
        Ok(mut stat) => *stat = progress,
        Err(e) => log::error!("Could not update progress: {e}"),
    }
}

/// Select the crystals matching the reference cell, write their frames to the
/// hit list and, if asked, write a refined cell file.
pub fn run_cell_check(config: &CellCheckConfig) -> Result<CellCheckSummary, ProcessorError> {
    log::info!("Reference cell: {}", describe_cell_file(&config.cell_path)?);
    let stream = summarize(&parse_stream_file(&config.stream_path).map_err(CellFilterError::from)?);
    log::info!(
        "Stream has {} frames: {} hits, {} with a crystal, {} peaks in total",
        stream.n_frames,
        stream.n_hits,
        stream.n_crystals,
        stream.n_peaks
    );
    let frames = scan_crystal_frames(&config.stream_path, &config.cell_path, config.tolerance)?;
    log::info!(
        "Overall indexing rate is {:.2}%",
        frames.indexing_rate() * 100.0
    );

    let hit_list_path = config.get_hit_list_path();
    write_hit_list(&hit_list_path, &frames)?;

    let mut summary = CellCheckSummary {
        n_frames: frames.n_chunks,
        n_crystals: frames.len(),
        hit_list_path,
        stream,
        refined: None,
        refined_cell_path: None,
    };
    if !config.refine_cell {
        return Ok(summary);
    }
    if frames.is_empty() {
        log::warn!("No crystals within tolerance; the cell is not refined");
        return Ok(summary);
    }

    let outcomes = fit_unit_cell(&frames.cells)?;
    let refined = UnitCell::new(refined_constants(&outcomes));
    let target = config.get_refined_cell_path();
    if write_refined_cell(&config.cell_path, &target, &refined)? {
        log::info!("Refined cell: {}", describe_cell_file(&target)?);
        summary.refined_cell_path = Some(target);
    }
    summary.refined = Some(outcomes);
    Ok(summary)
}

#[cfg(feature = "hdf5")]
fn convert_mask(config: &MaskConfig) -> Result<(), ProcessorError> {
    let geometry = if config.geometry_path.exists() {
        Some(std::fs::read_to_string(&config.geometry_path)?)
    } else {
        None
    };
    // Writing a mask may create the dataset
    let hdf_shape = match (config.hdf_path.exists(), config.run_mode) {
        (false, _) => None,
        (true, RunMode::HdfToGeometry) => {
            Some(read_mask_shape(&config.hdf_path, &config.dataset_path)?)
        }
        (true, RunMode::GeometryToHdf) => {
            read_mask_shape(&config.hdf_path, &config.dataset_path).ok()
        }
    };
    let geometry_name = config
        .geometry_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());

    let layout = guess_detector_info(&DetectorHints {
        detector: config.detector.as_deref(),
        data_type: config.data_type.as_deref(),
        hdf_shape: hdf_shape.as_deref(),
        geometry_name: geometry_name.as_deref(),
        geometry_contents: geometry.as_deref(),
    })?;
    log::info!(
        "Detector {} with {} data, mask shape {:?}",
        layout.detector,
        layout.data_type,
        layout.shape
    );
    if let Some(text) = &geometry {
        log::info!("Geometry bad pixel value (mask_bad): {}", bad_pixel_value(text));
    }
    let converter = MaskConverter::new(layout, config.write_mode);

    match config.run_mode {
        RunMode::HdfToGeometry => {
            let mask = read_mask(
                &config.hdf_path,
                &config.dataset_path,
                config.entry,
                converter.layout(),
                config.invert,
            )?;
            let text = converter.mask_to_geometry(mask.view(), geometry.as_deref())?;
            std::fs::write(&config.geometry_path, text)?;
            log::info!(
                "Wrote bad areas to {}",
                config.geometry_path.to_string_lossy()
            );
        }
        RunMode::GeometryToHdf => {
            let Some(text) = geometry else {
                return Err(GeometryError::BadFilePath(config.geometry_path.clone()).into());
            };
            let existing = if config.write_mode == WriteMode::Add && hdf_shape.is_some() {
                Some(read_mask(
                    &config.hdf_path,
                    &config.dataset_path,
                    config.entry,
                    converter.layout(),
                    config.invert,
                )?)
            } else {
                None
            };
            let mask = converter.geometry_to_mask(&text, existing)?;
            write_mask(
                &config.hdf_path,
                &config.dataset_path,
                config.entry,
                converter.layout(),
                &mask,
                config.invert,
            )?;
        }
    }
    Ok(())
}

/// Convert between the HDF5 mask and the geometry file bad areas
pub fn run_mask_conversion(config: &MaskConfig) -> Result<(), ProcessorError> {
    #[cfg(feature = "hdf5")]
    {
        convert_mask(config)
    }
    #[cfg(not(feature = "hdf5"))]
    {
        log::error!(
            "Cannot convert mask {}: built without HDF5 support",
            config.hdf_path.to_string_lossy()
        );
        Err(ProcessorError::NoHdf5Support)
    }
}

/// The main entry of xwiz.
///
/// Runs every task configured, reporting the fraction of tasks done through `status`.
pub fn process(config: Config, status: Arc<Mutex<f32>>) -> Result<(), ProcessorError> {
    let n_tasks = config.n_tasks().max(1) as f32;
    let mut n_done = 0.0;
    set_progress(&status, 0.0);

    if let Some(cell_check) = &config.cell_check {
        log::info!("Checking crystal cells...");
        let summary = run_cell_check(cell_check)?;
        log::info!(
            "Kept {} crystals out of {} frames.",
            summary.n_crystals,
            summary.n_frames
        );
        n_done += 1.0;
        set_progress(&status, n_done / n_tasks);
    }

    if let Some(mask) = &config.mask {
        log::info!("Converting mask...");
        run_mask_conversion(mask)?;
        n_done += 1.0;
        set_progress(&status, n_done / n_tasks);
    }

    set_progress(&status, 1.0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn chunk(event: i64, cell: &str) -> String {
        format!(
            "----- Begin chunk -----\nImage filename: r0100.cxi\nEvent: //{event}\nhit = 1\n--- Begin crystal\nCell parameters {cell} deg\n--- End crystal\n----- End chunk -----\n"
        )
    }

    fn write_inputs(dir: &std::path::Path) -> CellCheckConfig {
        let stream: String = (0..40)
            .map(|event| {
                let b = 7.9 + 0.01 * (event % 5) as f64;
                chunk(event, &format!("7.90 {b:.2} 3.80 nm, 90.00 90.00 90.00"))
            })
            .chain(std::iter::once(chunk(40, "5.00 5.00 5.00 nm, 90.00 90.00 90.00")))
            .collect();
        let stream_path = dir.join("lyso.stream");
        std::fs::write(&stream_path, stream).unwrap();
        let cell_path = dir.join("lyso.pdb");
        std::fs::write(
            &cell_path,
            "CRYST1   79.000   79.000   38.000  90.00  90.00  90.00 P 43 21 2     8\n",
        )
        .unwrap();
        CellCheckConfig {
            stream_path,
            cell_path,
            ..Default::default()
        }
    }

    #[test]
    fn test_run_cell_check() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_inputs(dir.path());
        let summary = run_cell_check(&config).unwrap();
        assert_eq!(summary.n_frames, 41);
        assert_eq!(summary.n_crystals, 40);
        assert_eq!(summary.stream.n_frames, 41);
        assert_eq!(summary.stream.n_hits, 41);
        assert_eq!(summary.stream.n_crystals, 41);
        assert_eq!(summary.hit_list_path, dir.path().join("lyso_hits.lst"));
        let hits = std::fs::read_to_string(&summary.hit_list_path).unwrap();
        assert_eq!(hits.lines().count(), 40);
        assert_eq!(hits.lines().next(), Some("r0100.cxi //0"));

        let refined_path = summary.refined_cell_path.unwrap();
        assert_eq!(refined_path, dir.path().join("lyso_refined.pdb"));
        let refined = UnitCell::read(&refined_path).unwrap().unwrap();
        assert_relative_eq!(refined.constants[0], 79.0, epsilon = 1e-3);
        assert!(refined.constants[1] > 79.0 && refined.constants[1] < 79.4);
        let written = std::fs::read_to_string(&refined_path).unwrap();
        assert!(written.ends_with(" P 43 21 2     8\n"));
    }

    #[test]
    fn test_run_cell_check_without_refinement() {
        let dir = tempfile::tempdir().unwrap();
        let config = CellCheckConfig {
            refine_cell: false,
            tolerance: 0.0,
            ..write_inputs(dir.path())
        };
        let summary = run_cell_check(&config).unwrap();
        assert_eq!(summary.n_crystals, 8);
        assert!(summary.refined.is_none());
        assert!(!dir.path().join("lyso_refined.pdb").exists());
    }

    #[test]
    fn test_process_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cell_check: Some(write_inputs(dir.path())),
            mask: None,
        };
        let status = Arc::new(Mutex::new(0.0));
        process(config, status.clone()).unwrap();
        assert_eq!(*status.lock().unwrap(), 1.0);
    }

    #[cfg(not(feature = "hdf5"))]
    #[test]
    fn test_mask_conversion_needs_hdf5() {
        assert!(matches!(
            run_mask_conversion(&MaskConfig::default()),
            Err(ProcessorError::NoHdf5Support)
        ));
    }
}

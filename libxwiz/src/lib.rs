//! # libxwiz
//!
//! libxwiz holds the data handling pieces of the xwiz serial crystallography workflow,
//! written in Rust. It reads the CrystFEL stream files produced by indexing, selects the
//! crystals whose unit cell matches a reference cell and refines that cell from the
//! selected ensemble. It also converts detector masks between the HDF5 pixel masks used
//! by the data and the `bad_area` blocks of CrystFEL geometry files.
//!
//! ## HDF5
//!
//! Mask conversion reads and writes HDF5 files and is behind the `hdf5` feature. HDF5
//! must be installed for it; typically the Rust libraries will auto detect the location
//! of the install. If not, point them at it in `.cargo/config.toml`:
//!
//! ```toml
//! [env]
//! HDF5_DIR="/path/to/my/hdf5/install/"
//! ```
//!
//! ## Configuration
//!
//! Both tasks are driven by a YAML configuration. A task runs if its section is present:
//!
//! ```yml
//! cell_check:
//!   stream_path: /scratch/xwiz/lyso.stream
//!   cell_path: /home/user/lyso.cell
//!   tolerance: 0.05
//!   hit_list_path: null
//!   refine_cell: true
//!   refined_cell_dir: null
//! mask:
//!   hdf_path: /home/user/mask_agipd.h5
//!   geometry_path: /home/user/agipd.geom
//!   run_mode: hd52geom
//!   write_mode: replace
//!   dataset_path: /entry_1/data_1/mask
//!   entry: 0
//!   detector: AGIPD
//!   data_type: null
//!   invert: false
//! ```
//!
//! - `tolerance`: relative tolerance applied to each of the six cell constants
//! - `hit_list_path`: if `null`, `<stream name>_hits.lst` next to the stream
//! - `refined_cell_dir`: if `null`, the refined cell (`<cell name>_refined.<ext>`) is
//!   written next to the reference cell
//! - `run_mode`: `hd52geom` (HDF5 mask to geometry) or `geom2hd5` (geometry to HDF5 mask)
//! - `write_mode`: `replace` comments out the existing mask, `add` merges with it
//! - `detector`, `data_type`: if `null`, guessed from the HDF5 mask shape and the
//!   geometry file
//!
//! ## Units
//!
//! Stream files give cell edges in nm. Every cell handled by libxwiz, including the
//! cells of parsed stream records, has edges in Å and angles in degrees.
pub mod cell_filter;
pub mod config;
pub mod decomposition;
pub mod detector_info;
pub mod error;
pub mod gauss_fit;
pub mod geometry;
pub mod mask_converter;
#[cfg(feature = "hdf5")]
pub mod mask_hdf;
pub mod process;
pub mod stream;
pub mod unit_cell;

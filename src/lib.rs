//! MeFMRI-Core: multi-echo fMRI S0 and R2* estimation
//!
//! This crate fits the mono-exponential decay `S(TE) = S0 * exp(-TE * R2*)`
//! to every voxel and time frame of a multi-echo fMRI acquisition, with
//! temporal outlier detection, gap filling and spatial repair.
//!
//! # Modules
//! - `echo_series`: In-memory multi-echo signal cube
//! - `params`: Run configuration
//! - `utils`: Histograms and spatial averaging
//! - `solvers`: Straight-line fits, Gauss-Jordan, Marquardt with priors
//! - `r2star`: Decay model and population-restart nonlinear fit
//! - `pipeline`: Mask, frame classification, resolution and repair
//! - `nifti_io`: NIfTI read/write for echo series and result maps
//!
//! # Example
//! ```no_run
//! use mefmri_core::{fit_multi_echo, EchoSeries, MeFitParams};
//!
//! let dims = (4, 4, 1);
//! let n = dims.0 * dims.1 * dims.2;
//! let echo1 = vec![1000.0; n * 10];
//! let echo2 = vec![600.0; n * 10];
//! let series = EchoSeries::from_echoes(&[echo1, echo2], dims, 10, vec![0.015, 0.040])?;
//! let result = fit_multi_echo(&series, &MeFitParams::default())?;
//! println!("{} voxels in mask", result.summary.n_masked);
//! # Ok::<(), mefmri_core::MeFitError>(())
//! ```

// Core modules
pub mod error;
pub mod params;
pub mod echo_series;

// Algorithm modules
pub mod utils;
pub mod solvers;
pub mod r2star;
pub mod pipeline;

// I/O modules
pub mod nifti_io;

pub use echo_series::{EchoSeries, VoxelSeries};
pub use error::{MeFitError, Result};
pub use params::{LocalAverage, MeFitParams, PriorParams, Regularization, RepairWindow};
pub use pipeline::{fit_multi_echo, fit_multi_echo_with_progress, FitSummary, MeFitResult, QualityMask};

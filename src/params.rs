//! Run configuration for multi-echo S0/R2* estimation
//!
//! All tunable constants of the pipeline live here with their customary
//! defaults. `MeFitParams::validate` performs the configuration checks that
//! must pass before any voxel is touched.

use crate::error::{MeFitError, Result};

/// Regularization of the S0 time series
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Regularization {
    /// Per-frame estimates are used as-is (bad frames are still repaired)
    #[default]
    None,
    /// S0 held at the trusted-frame average, R2* re-solved per frame
    Mean,
    /// S0 held at a temporally smoothed curve, R2* re-solved per frame
    Smooth,
}

impl Regularization {
    /// Map the numeric convention (0 = none, 1 = mean, 2 = smooth)
    pub fn from_flag(flag: i32) -> Self {
        match flag {
            1 => Regularization::Mean,
            2 => Regularization::Smooth,
            _ => Regularization::None,
        }
    }

    pub fn from_str(s: &str) -> Self {
        Self::try_from_str(s).unwrap_or_default()
    }

    /// Recognized mode names, `None` for anything else
    pub fn try_from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" | "0" => Some(Regularization::None),
            "mean" | "avg" | "average" | "1" => Some(Regularization::Mean),
            "smooth" | "smoothed" | "curve" | "2" => Some(Regularization::Smooth),
            _ => None,
        }
    }

    /// True when S0 is pinned and only R2* is estimated per frame
    #[inline]
    pub fn is_active(self) -> bool {
        self != Regularization::None
    }
}

/// Local box-car averaging applied to the input before fitting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LocalAverage {
    /// 3x3 in-plane
    InPlane3,
    /// 5x5 in-plane
    InPlane5,
    /// 3x3x3
    Volume3,
    /// 5x5x5
    Volume5,
}

impl LocalAverage {
    /// Map the numeric convention (1 = 2d3x3, 2 = 2d5x5, 3 = 3d3x3, 4 = 3d5x5)
    pub fn from_flag(flag: i32) -> Option<Self> {
        match flag {
            1 => Some(LocalAverage::InPlane3),
            2 => Some(LocalAverage::InPlane5),
            3 => Some(LocalAverage::Volume3),
            4 => Some(LocalAverage::Volume5),
            _ => None,
        }
    }

    /// Half-widths of the window along (x, y, z)
    pub fn half_widths(self) -> (usize, usize, usize) {
        match self {
            LocalAverage::InPlane3 => (1, 1, 0),
            LocalAverage::InPlane5 => (2, 2, 0),
            LocalAverage::Volume3 => (1, 1, 1),
            LocalAverage::Volume5 => (2, 2, 2),
        }
    }
}

/// Neighborhood used to repair pathological voxels
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RepairWindow {
    /// Half-width in x and y (default 2, i.e. 5x5 in-plane)
    pub in_plane: usize,
    /// Half-width in z (default 1); ignored in single-slice mode
    pub through_plane: usize,
}

impl Default for RepairWindow {
    fn default() -> Self {
        Self {
            in_plane: 2,
            through_plane: 1,
        }
    }
}

/// Settings of the population-restart Levenberg-Marquardt refinement
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PriorParams {
    /// Number of independent restarts (default 50)
    pub n_population: usize,
    /// Consecutive small-change steps that end a restart (default 3)
    pub n_iterations: usize,
    /// Log-probability change regarded as "no progress" (default 0.1)
    pub min_logprob_change: f64,
    /// Lower search bound as a multiple of the prior mean (default 0.2)
    pub lower_factor: f64,
    /// Upper search bound as a multiple of the prior mean (default 2.0)
    pub upper_factor: f64,
    /// Sampling width = (upper - lower) / width_divisor (default 4)
    pub width_divisor: f64,
    /// Rejection-sampling attempts per parameter before giving up (default 100)
    pub max_draws: usize,
    /// Hard cap on damped steps per restart (default 200)
    pub max_steps: usize,
    /// Base seed for the restart generator (default 47)
    pub seed: u64,
}

impl Default for PriorParams {
    fn default() -> Self {
        Self {
            n_population: 50,
            n_iterations: 3,
            min_logprob_change: 0.1,
            lower_factor: 0.2,
            upper_factor: 2.0,
            width_divisor: 4.0,
            max_draws: 100,
            max_steps: 200,
            seed: 47,
        }
    }
}

/// Parameters for a multi-echo fitting run
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeFitParams {
    /// Brain/background threshold on the time-averaged first echo (default 100)
    pub mask_threshold: f64,
    /// Refine good frames with the nonlinear Bayesian fit
    pub nonlinear: bool,
    /// S0 regularization mode
    pub regularization: Regularization,
    /// Restrict processing to one slice (counting from 0)
    pub slice: Option<usize>,
    /// Use only the first N frames
    pub n_frames: Option<usize>,
    /// Echo time (seconds) at which the fitted signal is reported;
    /// defaults to the second echo time
    pub te_fit: Option<f64>,
    /// Optional local averaging of the input
    pub local_average: Option<LocalAverage>,
    /// Minimum fraction of good frames for a voxel to be trusted (default 0.40)
    pub bad_frame_fraction: f64,
    /// Passes of the (0.25, 0.5, 0.25) kernel in smooth mode (default 20)
    pub n_smooth: usize,
    /// Nonlinear refinement settings
    pub prior: PriorParams,
    /// Spatial repair neighborhood
    pub repair: RepairWindow,
}

impl Default for MeFitParams {
    fn default() -> Self {
        Self {
            mask_threshold: 100.0,
            nonlinear: false,
            regularization: Regularization::None,
            slice: None,
            n_frames: None,
            te_fit: None,
            local_average: None,
            bad_frame_fraction: 0.40,
            n_smooth: 20,
            prior: PriorParams::default(),
            repair: RepairWindow::default(),
        }
    }
}

impl MeFitParams {
    /// Reference echo time for the fitted-signal output
    pub fn reference_te(&self, echo_times: &[f64]) -> f64 {
        self.te_fit
            .unwrap_or_else(|| echo_times.get(1).copied().unwrap_or(echo_times[0]))
    }

    /// Effective repair window (no through-plane reach in single-slice mode)
    pub fn effective_repair_window(&self) -> RepairWindow {
        let mut window = self.repair;
        if self.slice.is_some() {
            window.through_plane = 0;
        }
        window
    }

    /// Check the configuration against the data geometry
    ///
    /// # Arguments
    /// * `nz` - Number of slices
    /// * `n_frames` - Frames available in the series (before selection)
    pub fn validate(&self, nz: usize, n_frames: usize) -> Result<()> {
        if !self.mask_threshold.is_finite() {
            return Err(MeFitError::InvalidParameter {
                name: "mask_threshold",
                reason: format!("must be finite, got {}", self.mask_threshold),
            });
        }
        if let Some(slice) = self.slice {
            if slice >= nz {
                return Err(MeFitError::InvalidSlice { slice, nz });
            }
        }
        if let Some(requested) = self.n_frames {
            if requested == 0 || requested > n_frames {
                return Err(MeFitError::InvalidFrameSelection {
                    requested,
                    available: n_frames,
                });
            }
        }
        if let Some(te) = self.te_fit {
            if !(te > 0.0 && te.is_finite()) {
                return Err(MeFitError::InvalidReferenceTe(te));
            }
        }
        if !(self.bad_frame_fraction >= 0.0 && self.bad_frame_fraction <= 1.0) {
            return Err(MeFitError::InvalidParameter {
                name: "bad_frame_fraction",
                reason: format!("must lie in [0, 1], got {}", self.bad_frame_fraction),
            });
        }
        let prior = &self.prior;
        if prior.n_population == 0 {
            return Err(MeFitError::InvalidParameter {
                name: "n_population",
                reason: "at least one restart is required".to_string(),
            });
        }
        if !(prior.lower_factor > 0.0 && prior.lower_factor < prior.upper_factor) {
            return Err(MeFitError::InvalidParameter {
                name: "lower_factor",
                reason: format!(
                    "need 0 < lower_factor < upper_factor, got {} and {}",
                    prior.lower_factor, prior.upper_factor
                ),
            });
        }
        if !(prior.width_divisor > 0.0) {
            return Err(MeFitError::InvalidParameter {
                name: "width_divisor",
                reason: format!("must be positive, got {}", prior.width_divisor),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regularization_from_flag() {
        assert_eq!(Regularization::from_flag(0), Regularization::None);
        assert_eq!(Regularization::from_flag(1), Regularization::Mean);
        assert_eq!(Regularization::from_flag(2), Regularization::Smooth);
        assert_eq!(Regularization::from_flag(7), Regularization::None);
    }

    #[test]
    fn test_regularization_from_str() {
        assert_eq!(Regularization::from_str("mean"), Regularization::Mean);
        assert_eq!(Regularization::from_str("Smooth"), Regularization::Smooth);
        assert_eq!(Regularization::from_str("2"), Regularization::Smooth);
        assert_eq!(Regularization::from_str("none"), Regularization::None);
        assert_eq!(Regularization::from_str("bogus"), Regularization::None);
    }

    #[test]
    fn test_regularization_try_from_str() {
        assert_eq!(Regularization::try_from_str(" Mean "), Some(Regularization::Mean));
        assert_eq!(Regularization::try_from_str("off"), Some(Regularization::None));
        assert_eq!(Regularization::try_from_str("smoth"), None);
        assert_eq!(Regularization::try_from_str(""), None);
        assert!(!Regularization::None.is_active());
        assert!(Regularization::Mean.is_active());
    }

    #[test]
    fn test_local_average_flags() {
        assert_eq!(LocalAverage::from_flag(0), None);
        assert_eq!(LocalAverage::from_flag(1), Some(LocalAverage::InPlane3));
        assert_eq!(LocalAverage::from_flag(4), Some(LocalAverage::Volume5));
        assert_eq!(LocalAverage::InPlane5.half_widths(), (2, 2, 0));
        assert_eq!(LocalAverage::Volume3.half_widths(), (1, 1, 1));
    }

    #[test]
    fn test_defaults() {
        let p = MeFitParams::default();
        assert_eq!(p.mask_threshold, 100.0);
        assert_eq!(p.bad_frame_fraction, 0.40);
        assert_eq!(p.n_smooth, 20);
        assert_eq!(p.prior.n_population, 50);
        assert_eq!(p.repair, RepairWindow { in_plane: 2, through_plane: 1 });
    }

    #[test]
    fn test_reference_te_defaults_to_second_echo() {
        let tes = [0.015, 0.028, 0.042];
        let mut p = MeFitParams::default();
        assert_eq!(p.reference_te(&tes), 0.028);
        p.te_fit = Some(0.030);
        assert_eq!(p.reference_te(&tes), 0.030);
    }

    #[test]
    fn test_single_slice_repair_window() {
        let mut p = MeFitParams::default();
        assert_eq!(p.effective_repair_window().through_plane, 1);
        p.slice = Some(0);
        assert_eq!(p.effective_repair_window().through_plane, 0);
        assert_eq!(p.effective_repair_window().in_plane, 2);
    }

    #[test]
    fn test_validate() {
        let p = MeFitParams::default();
        assert!(p.validate(4, 10).is_ok());

        let p = MeFitParams { slice: Some(4), ..Default::default() };
        assert_eq!(p.validate(4, 10), Err(MeFitError::InvalidSlice { slice: 4, nz: 4 }));

        let p = MeFitParams { n_frames: Some(11), ..Default::default() };
        assert!(matches!(p.validate(4, 10), Err(MeFitError::InvalidFrameSelection { .. })));

        let p = MeFitParams { te_fit: Some(-1.0), ..Default::default() };
        assert!(matches!(p.validate(4, 10), Err(MeFitError::InvalidReferenceTe(_))));

        let p = MeFitParams { bad_frame_fraction: 1.5, ..Default::default() };
        assert!(p.validate(4, 10).is_err());
    }
}

//! Per-frame fits, good/bad classification and gap filling
//!
//! Every frame of a voxel is fitted on its own with the closed-form
//! log-linear fit. Frames with a non-physical result are bad; the residuals
//! of the good ones define a robust threshold (histogram mode + 2 std) that
//! selects the trusted frames whose averages back up the gap filling.

use crate::echo_series::VoxelSeries;
use crate::r2star::model::{is_physical, rms_residual};
use crate::solvers::linear_fit::fit_line;
use crate::utils::histogram::HistogramTable;

/// Closed-form estimate of one frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameFit {
    pub s0: f64,
    pub r2star: f64,
    pub good: bool,
    /// RMS model error over all echoes (0 for bad frames)
    pub residual: f64,
}

impl FrameFit {
    fn bad() -> Self {
        Self { s0: 0.0, r2star: 0.0, good: false, residual: 0.0 }
    }
}

/// Why a voxel was handed to spatial repair
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pathology {
    /// Fewer good frames than the configured fraction
    TooFewGoodFrames { good: usize, total: usize },
    /// Some frames still had S0 = 0 after gap filling
    ZeroAfterGapFill { frames: usize },
    /// Final parameters of a frame were not finite
    NonFiniteResult { frame: usize },
}

#[inline]
fn is_valid_sample(y: f64) -> bool {
    y > 0.0 && y.is_finite()
}

/// Weighted log-linear fit over the given echoes; weights are `ln(y)²`
fn log_linear_fit(echo_times: &[f64], samples: &[f64], echoes: &[usize]) -> Option<(f64, f64)> {
    let x: Vec<f64> = echoes.iter().map(|&e| echo_times[e]).collect();
    let lny: Vec<f64> = echoes.iter().map(|&e| samples[e].ln()).collect();
    let sig: Vec<f64> = lny.iter().map(|l| 1.0 / l).collect();
    let fit = fit_line(&x, &lny, Some(&sig))?;
    Some((fit.a.exp(), -fit.b))
}

/// Fit and classify one frame
///
/// With every sample valid all echoes are fitted. An invalid first echo or
/// more than two invalid samples gives a bad frame. Otherwise the valid
/// samples are fitted (three or more) or joined by a straight line in log
/// space (exactly two: the first echo and the last valid one).
///
/// # Arguments
/// * `echo_times` - Echo times (s)
/// * `samples` - Signal per echo for this frame
pub fn classify_frame(echo_times: &[f64], samples: &[f64]) -> FrameFit {
    let n_echoes = samples.len();
    let valid: Vec<usize> = (0..n_echoes).filter(|&e| is_valid_sample(samples[e])).collect();
    let n_invalid = n_echoes - valid.len();

    let estimate = if n_invalid == 0 {
        log_linear_fit(echo_times, samples, &valid)
    } else if !is_valid_sample(samples[0]) || n_invalid > 2 {
        None
    } else if valid.len() >= 3 {
        log_linear_fit(echo_times, samples, &valid)
    } else if valid.len() == 2 {
        let last = valid[1];
        let b = (samples[last].ln() - samples[0].ln()) / (echo_times[last] - echo_times[0]);
        let a = samples[0].ln() - b * echo_times[0];
        Some((a.exp(), -b))
    } else {
        None
    };

    match estimate {
        Some((s0, r2star)) if is_physical(s0, r2star) => FrameFit {
            s0,
            r2star,
            good: true,
            residual: rms_residual(echo_times, samples, s0, r2star),
        },
        _ => FrameFit::bad(),
    }
}

/// Sums over the trusted frames of a voxel
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrustedStats {
    pub count: usize,
    pub sum_s0: f64,
    pub sum_sq_s0: f64,
    pub sum_r2star: f64,
    pub sum_sq_r2star: f64,
}

impl TrustedStats {
    fn push(&mut self, s0: f64, r2star: f64) {
        self.count += 1;
        self.sum_s0 += s0;
        self.sum_sq_s0 += s0 * s0;
        self.sum_r2star += r2star;
        self.sum_sq_r2star += r2star * r2star;
    }

    #[inline]
    pub fn mean_s0(&self) -> f64 {
        self.sum_s0 / self.count as f64
    }

    #[inline]
    pub fn mean_r2star(&self) -> f64 {
        self.sum_r2star / self.count as f64
    }
}

/// Per-frame parameter series of one voxel
#[derive(Clone, Debug, PartialEq)]
pub struct FrameSeries {
    pub s0: Vec<f64>,
    pub r2star: Vec<f64>,
    pub bad: Vec<bool>,
    pub residual: Vec<f64>,
}

impl FrameSeries {
    #[inline]
    pub fn len(&self) -> usize {
        self.s0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.s0.is_empty()
    }

    pub fn n_good(&self) -> usize {
        self.bad.iter().filter(|&&b| !b).count()
    }
}

/// Classify all frames of a voxel and compute the trusted-frame sums
///
/// # Arguments
/// * `echo_times` - Echo times (s)
/// * `voxel` - Signal of the voxel, `[frame][echo]`
/// * `min_good_fraction` - Minimum fraction of good frames
/// * `hist` - Scratch histogram table for the residual mode
///
/// # Returns
/// The frame series with trusted sums, or the pathology that stops the voxel
pub fn classify_voxel(
    echo_times: &[f64],
    voxel: &VoxelSeries,
    min_good_fraction: f64,
    hist: &mut HistogramTable,
) -> Result<(FrameSeries, TrustedStats), Pathology> {
    let n_frames = voxel.n_frames();
    let mut series = FrameSeries {
        s0: vec![0.0; n_frames],
        r2star: vec![0.0; n_frames],
        bad: vec![true; n_frames],
        residual: vec![0.0; n_frames],
    };
    let mut pool = Vec::with_capacity(n_frames);

    for f in 0..n_frames {
        let fit = classify_frame(echo_times, voxel.frame(f));
        if fit.good {
            series.s0[f] = fit.s0;
            series.r2star[f] = fit.r2star;
            series.bad[f] = false;
            series.residual[f] = fit.residual;
            pool.push(fit.residual);
        }
    }

    let good = pool.len();
    if good == 0 || (good as f64) < min_good_fraction * n_frames as f64 {
        return Err(Pathology::TooFewGoodFrames { good, total: n_frames });
    }

    let (mode, std) = hist.mode_with_std(&pool);
    let cutoff = mode + 2.0 * std;
    let mut trusted = TrustedStats::default();
    for f in 0..n_frames {
        if !series.bad[f] && series.residual[f] <= cutoff {
            trusted.push(series.s0[f], series.r2star[f]);
        }
    }
    if trusted.count == 0 {
        for f in (0..n_frames).filter(|&f| !series.bad[f]) {
            trusted.push(series.s0[f], series.r2star[f]);
        }
    }
    Ok((series, trusted))
}

/// Fill the parameters of bad frames in place
///
/// Edges copy the nearest good frame (or the second-nearest, then both edge
/// frames take it). Each bad frame then falls back to the trusted averages
/// where still non-positive, takes the mean of its two neighbors when both
/// are good, and for a pair of bad frames between good ones both frames take
/// the mean of the bracketing pair.
///
/// # Returns
/// `Err` with the number of frames whose S0 is still exactly zero
pub fn fill_gaps(series: &mut FrameSeries, trusted: &TrustedStats) -> Result<(), Pathology> {
    let n = series.len();
    let bad = series.bad.clone();
    let s0 = &mut series.s0;
    let r2 = &mut series.r2star;

    // Front edge
    if n >= 2 && bad[0] && !bad[1] {
        s0[0] = s0[1];
        r2[0] = r2[1];
    } else if n >= 3 && bad[0] && bad[1] && !bad[2] {
        s0[0] = s0[2];
        s0[1] = s0[2];
        r2[0] = r2[2];
        r2[1] = r2[2];
    }

    // Back edge
    if n >= 2 && bad[n - 1] && !bad[n - 2] {
        s0[n - 1] = s0[n - 2];
        r2[n - 1] = r2[n - 2];
    } else if n >= 3 && bad[n - 1] && bad[n - 2] && !bad[n - 3] {
        s0[n - 1] = s0[n - 3];
        s0[n - 2] = s0[n - 3];
        r2[n - 1] = r2[n - 3];
        r2[n - 2] = r2[n - 3];
    }

    for l in 0..n {
        if !bad[l] {
            continue;
        }
        if s0[l] <= 0.0 {
            s0[l] = trusted.mean_s0();
        }
        // Lower-quality backup: R2* is re-estimated later where possible
        if r2[l] <= 0.0 {
            r2[l] = trusted.mean_r2star();
        }

        if l >= 1 && l + 2 <= n && !bad[l - 1] && !bad[l + 1] {
            s0[l] = 0.5 * (s0[l - 1] + s0[l + 1]);
            r2[l] = 0.5 * (r2[l - 1] + r2[l + 1]);
        }

        if l >= 1 && l + 3 <= n && !bad[l - 1] && bad[l + 1] && !bad[l + 2] {
            let s = 0.5 * (s0[l - 1] + s0[l + 2]);
            let r = 0.5 * (r2[l - 1] + r2[l + 2]);
            s0[l] = s;
            s0[l + 1] = s;
            r2[l] = r;
            r2[l + 1] = r;
        }
    }

    let zeros = s0.iter().filter(|&&v| v == 0.0).count();
    if zeros > 0 {
        return Err(Pathology::ZeroAfterGapFill { frames: zeros });
    }
    Ok(())
}

/// Binomial (0.25, 0.5, 0.25) smoothing of the interior, `passes` times
///
/// The first and last values are never changed.
pub fn smooth_s0(s0: &mut [f64], passes: usize) {
    let n = s0.len();
    if n < 3 {
        return;
    }
    let mut next = s0.to_vec();
    for _ in 0..passes {
        for l in 1..n - 1 {
            next[l] = 0.25 * (s0[l - 1] + 2.0 * s0[l] + s0[l + 1]);
        }
        s0[1..n - 1].copy_from_slice(&next[1..n - 1]);
    }
}

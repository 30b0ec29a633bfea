//! Brain mask, time-averaged maps and global echo statistics
//!
//! One pass over every voxel: echoes are averaged over time, voxels whose
//! first-echo average does not exceed the threshold are background, and the
//! rest get a weighted log-linear fit of the averaged decay. The fit slope
//! also defines per-echo weights for the weighted-combination signal.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::echo_series::EchoSeries;
use crate::params::PriorParams;
use crate::r2star::model::rms_residual;
use crate::r2star::population::{fit_population, ParamPrior, PriorFit};
use crate::solvers::linear_fit::fit_line;

/// Echo whose population statistics bound the fitted signal
pub const CLIP_ECHO: usize = 1;

/// Signal substituted for non-positive averages before taking logs
const LOG_FLOOR_SIGNAL: f64 = 1.0;

/// Population mean and standard deviation of each echo over masked voxels
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GlobalStats {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
    /// Number of masked voxels
    pub n_voxels: usize,
}

impl GlobalStats {
    /// Statistics from per-echo sums and sums of squares over `n` voxels
    pub fn from_sums(sum: &[f64], sum_sq: &[f64], n: usize) -> Self {
        let nf = n as f64;
        let mean = sum
            .iter()
            .map(|&s| if n > 0 { s / nf } else { 0.0 })
            .collect();
        let std = sum
            .iter()
            .zip(sum_sq)
            .map(|(&s, &s2)| {
                if n < 2 {
                    0.0
                } else {
                    ((nf * s2 - s * s) / (nf * (nf - 1.0))).max(0.0).sqrt()
                }
            })
            .collect();
        Self { mean, std, n_voxels: n }
    }

    /// True when `value` lies strictly within mean ± 3 std of `echo`
    pub fn within_bounds(&self, echo: usize, value: f64) -> bool {
        match (self.mean.get(echo), self.std.get(echo)) {
            (Some(&m), Some(&s)) => value < m + 3.0 * s && value > m - 3.0 * s,
            _ => false,
        }
    }
}

/// Output of the mask pass
#[derive(Clone, Debug)]
pub struct MaskStats {
    /// 1 for voxels above threshold, 0 for background
    pub mask: Vec<u8>,
    /// S0 of the time-averaged signal (0 outside the mask)
    pub mean_s0: Vec<f64>,
    /// R2* of the time-averaged signal (0 outside the mask)
    pub mean_r2star: Vec<f64>,
    /// Echo weights `te * exp(-te * R2*)`, laid out `echo * n_voxels + voxel`
    pub echo_weights: Vec<f64>,
    pub global: GlobalStats,
}

impl MaskStats {
    #[inline]
    pub fn in_mask(&self, voxel: usize) -> bool {
        self.mask[voxel] != 0
    }

    pub fn n_masked(&self) -> usize {
        self.global.n_voxels
    }
}

/// Threshold, fit and accumulate over all voxels
///
/// # Arguments
/// * `series` - Multi-echo signal
/// * `threshold` - A voxel is in the mask iff its time-averaged first echo
///   is greater than this
///
/// # Returns
/// Mask statistics and the weighted-combination signal
/// (`frame * n_voxels + voxel`, 0 outside the mask)
pub fn compute_mask_stats(series: &EchoSeries, threshold: f64) -> (MaskStats, Vec<f64>) {
    let n_voxels = series.n_voxels();
    let n_echoes = series.n_echoes();
    let n_frames = series.n_frames();
    let echo_times = series.echo_times();

    let mut mask = vec![0u8; n_voxels];
    let mut mean_s0 = vec![0.0; n_voxels];
    let mut mean_r2star = vec![0.0; n_voxels];
    let mut echo_weights = vec![0.0; n_echoes * n_voxels];
    let mut s_weighted = vec![0.0; n_frames * n_voxels];

    let mut sum = vec![0.0; n_echoes];
    let mut sum_sq = vec![0.0; n_echoes];
    let mut n_masked = 0usize;

    let mut means = vec![0.0; n_echoes];
    let mut lny = vec![0.0; n_echoes];
    let mut sig = vec![0.0; n_echoes];

    for v in 0..n_voxels {
        for (e, m) in means.iter_mut().enumerate() {
            let mut acc = 0.0;
            for f in 0..n_frames {
                acc += series.signal(e, f, v);
            }
            *m = acc / n_frames as f64;
        }
        if !(means[0] > threshold) {
            continue;
        }

        n_masked += 1;
        mask[v] = 1;
        for e in 0..n_echoes {
            if !(means[e] > 0.0 && means[e].is_finite()) {
                means[e] = LOG_FLOOR_SIGNAL;
            }
            lny[e] = means[e].ln();
            sig[e] = 1.0 / lny[e];
            sum[e] += means[e];
            sum_sq[e] += means[e] * means[e];
        }

        let slope = match fit_line(echo_times, &lny, Some(&sig)) {
            Some(fit) => {
                mean_s0[v] = fit.a.exp();
                mean_r2star[v] = -fit.b;
                fit.b
            }
            None => 0.0,
        };

        let mut weight_sum = 0.0;
        for (e, &te) in echo_times.iter().enumerate() {
            let w = te * (te * slope).exp();
            echo_weights[e * n_voxels + v] = w;
            weight_sum += w;
        }
        for f in 0..n_frames {
            let mut acc = 0.0;
            for e in 0..n_echoes {
                acc += echo_weights[e * n_voxels + v] * series.signal(e, f, v);
            }
            s_weighted[f * n_voxels + v] = acc / weight_sum;
        }
    }

    let global = GlobalStats::from_sums(&sum, &sum_sq, n_masked);
    log::info!(
        "mask: {} of {} voxels above threshold {}",
        n_masked, n_voxels, threshold
    );
    if n_masked == 0 {
        log::warn!("no voxel exceeds the mask threshold {}", threshold);
    }

    let stats = MaskStats { mask, mean_s0, mean_r2star, echo_weights, global };
    (stats, s_weighted)
}

/// Fits of the population-averaged decay
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalCalibration {
    /// Population mean signal per echo
    pub samples: Vec<f64>,
    pub linear_s0: f64,
    pub linear_r2star: f64,
    /// RMS model error of the linear estimate
    pub linear_rms: f64,
    /// Nonlinear refinement seeded at the linear estimate, if it was usable
    pub nonlinear: Option<PriorFit>,
    /// RMS model error of the nonlinear estimate
    pub nonlinear_rms: Option<f64>,
}

/// Fit the global per-echo means linearly, then with the population fit
///
/// # Returns
/// `None` when there are no masked voxels or the linear fit fails
pub fn calibrate_global(
    echo_times: &[f64],
    global: &GlobalStats,
    settings: &PriorParams,
) -> Option<GlobalCalibration> {
    if global.n_voxels == 0 {
        return None;
    }
    let samples = global.mean.clone();
    let lny: Vec<f64> = samples.iter().map(|y| y.ln()).collect();
    let sig: Vec<f64> = lny.iter().map(|l| 1.0 / l).collect();
    let fit = fit_line(echo_times, &lny, Some(&sig))?;

    let linear_s0 = fit.a.exp();
    let linear_r2star = -fit.b;
    let linear_rms = rms_residual(echo_times, &samples, linear_s0, linear_r2star);
    log::info!(
        "global linear fit: S0 = {:.3}, R2* = {:.3} 1/s, rms = {:.4}",
        linear_s0, linear_r2star, linear_rms
    );

    let (nonlinear, nonlinear_rms) = if linear_s0 > 0.0 && linear_r2star > 0.0 && linear_s0.is_finite() {
        let priors = [
            ParamPrior::around(linear_s0, settings),
            ParamPrior::around(linear_r2star, settings),
        ];
        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
        let best = fit_population(echo_times, &samples, &priors, settings, &mut rng);
        let rms = rms_residual(echo_times, &samples, best.s0(), best.r2star());
        log::info!(
            "global nonlinear fit: S0 = {:.3} ({:.3}), R2* = {:.3} ({:.3}) 1/s, logprob = {:.3}, rms = {:.4}",
            best.s0(), best.std[0], best.r2star(), best.std[1], best.logprob, rms
        );
        (Some(best), Some(rms))
    } else {
        log::warn!(
            "global linear fit is not physical (S0 = {}, R2* = {}); skipping nonlinear calibration",
            linear_s0, linear_r2star
        );
        (None, None)
    };

    Some(GlobalCalibration {
        samples,
        linear_s0,
        linear_r2star,
        linear_rms,
        nonlinear,
        nonlinear_rms,
    })
}

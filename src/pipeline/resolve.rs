//! Final per-frame parameters of a classified voxel
//!
//! Bad frames always get their R2* re-derived with S0 pinned to the
//! gap-filled value. Good frames keep the closed-form estimate, go through
//! the population fit (nonlinear mode), or are re-solved with S0 pinned to
//! the trusted mean or the smoothed curve (regularized modes).

use rand::Rng;

use crate::echo_series::VoxelSeries;
use crate::params::{MeFitParams, Regularization};
use crate::r2star::model::{rms_residual, signal};
use crate::r2star::population::{fit_population, ParamPrior};
use crate::solvers::linear_fit::fit_fixed_intercept;
use super::frames::{FrameSeries, Pathology, TrustedStats};
use super::mask::{GlobalStats, CLIP_ECHO};

/// Final parameters and derived outputs of one frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedFrame {
    pub s0: f64,
    pub r2star: f64,
    /// Model signal at the reference echo time (or the raw second echo)
    pub s_fit: f64,
    /// RMS model error over all echoes
    pub residual: f64,
}

/// Shared inputs of the resolution step
pub struct ResolveContext<'a> {
    pub echo_times: &'a [f64],
    pub te_fit: f64,
    pub params: &'a MeFitParams,
    pub global: &'a GlobalStats,
}

/// R2* from the valid echoes with `ln(S0)` held fixed
///
/// # Returns
/// `None` with fewer than two valid echoes
pub fn fixed_intercept_r2star(echo_times: &[f64], samples: &[f64], s0: f64) -> Option<f64> {
    let (x, lny): (Vec<f64>, Vec<f64>) = echo_times
        .iter()
        .zip(samples)
        .filter(|(_, &y)| y > 0.0 && y.is_finite())
        .map(|(&te, &y)| (te, y.ln()))
        .unzip();
    if x.len() < 2 {
        return None;
    }
    fit_fixed_intercept(&x, &lny, None, s0.ln()).map(|b| -b)
}

/// Model signal at `te_fit`, or `fallback` when outside the population bounds
///
/// The bound is mean ± 3 std of the second echo over all masked voxels.
pub fn clipped_fit_signal(global: &GlobalStats, te_fit: f64, s0: f64, r2star: f64, fallback: f64) -> f64 {
    let value = signal(te_fit, s0, r2star);
    if global.within_bounds(CLIP_ECHO, value) {
        value
    } else {
        fallback
    }
}

/// Resolve every frame of a voxel that passed classification
///
/// # Returns
/// One entry per frame (`None` for frames whose parameters were not
/// finite) and the pathology if any frame failed
pub fn resolve_voxel<R: Rng + ?Sized>(
    ctx: &ResolveContext<'_>,
    voxel: &VoxelSeries,
    frames: &FrameSeries,
    trusted: &TrustedStats,
    rng: &mut R,
) -> (Vec<Option<ResolvedFrame>>, Option<Pathology>) {
    let regularization = ctx.params.regularization;
    let settings = &ctx.params.prior;
    let mut resolved = Vec::with_capacity(frames.len());
    let mut pathology = None;

    for l in 0..frames.len() {
        let samples = voxel.frame(l);
        let gap_r2 = frames.r2star[l];

        let (mut s0, mut r2star) = if regularization.is_active() {
            let s0 = match regularization {
                Regularization::Smooth => frames.s0[l],
                _ => trusted.mean_s0(),
            };
            (s0, fixed_intercept_r2star(ctx.echo_times, samples, s0).unwrap_or(gap_r2))
        } else if frames.bad[l] {
            let s0 = frames.s0[l];
            (s0, fixed_intercept_r2star(ctx.echo_times, samples, s0).unwrap_or(gap_r2))
        } else if ctx.params.nonlinear {
            let priors = [
                ParamPrior::around(frames.s0[l], settings),
                ParamPrior::around(frames.r2star[l], settings),
            ];
            let fit = fit_population(ctx.echo_times, samples, &priors, settings, rng);
            (fit.s0(), fit.r2star())
        } else {
            (frames.s0[l], frames.r2star[l])
        };

        if !s0.is_finite() || !r2star.is_finite() {
            log::debug!(
                "frame {}: non-finite parameters (S0 = {}, R2* = {}, bad = {})",
                l, s0, r2star, frames.bad[l]
            );
            pathology.get_or_insert(Pathology::NonFiniteResult { frame: l });
            resolved.push(None);
            continue;
        }
        if s0 <= 0.0 || r2star <= 0.0 {
            s0 = trusted.mean_s0();
            r2star = trusted.mean_r2star();
        }

        let fallback = samples.get(CLIP_ECHO).copied().unwrap_or(0.0);
        resolved.push(Some(ResolvedFrame {
            s0,
            r2star,
            s_fit: clipped_fit_signal(ctx.global, ctx.te_fit, s0, r2star, fallback),
            residual: rms_residual(ctx.echo_times, samples, s0, r2star),
        }));
    }
    (resolved, pathology)
}

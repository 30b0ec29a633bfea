//! Voxel- and frame-wise S0/R2* estimation from multi-echo series
//!
//! Data flows one way through the stages:
//! - `mask`: brain mask, time-averaged maps and global echo statistics
//! - `frames`: per-frame closed-form fits, good/bad classification, gap filling
//! - `resolve`: final parameters per frame (linear, nonlinear or regularized)
//! - `repair`: spatial repair of voxels whose temporal fit failed
//!
//! Voxels of a slice are processed in parallel; each voxel owns its scratch
//! state and random generator, so results do not depend on scheduling.

pub mod mask;
pub mod frames;
pub mod resolve;
pub mod repair;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::echo_series::EchoSeries;
use crate::error::Result;
use crate::params::{MeFitParams, Regularization};
use crate::utils::histogram::HistogramTable;

pub use mask::{calibrate_global, compute_mask_stats, GlobalCalibration, GlobalStats, MaskStats};
pub use frames::{classify_frame, classify_voxel, fill_gaps, smooth_s0, FrameFit, FrameSeries, Pathology, TrustedStats};
pub use resolve::{clipped_fit_signal, fixed_intercept_r2star, resolve_voxel, ResolveContext, ResolvedFrame};
pub use repair::{repair_pathological, ParameterMaps, RepairSummary};

/// Four quality planes, one value per voxel each
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QualityMask {
    /// Voxels above the mask threshold
    pub original_mask: Vec<u8>,
    /// Mask without the voxels that could not be repaired
    pub cleaned_mask: Vec<u8>,
    /// Voxels whose temporal fit failed
    pub pathological: Vec<u8>,
    /// Pathological voxels left after spatial repair
    pub unrepaired: Vec<u8>,
}

impl QualityMask {
    /// Planes for a fresh run: both masks equal `mask`, no pathology
    pub fn from_mask(mask: &[u8]) -> Self {
        Self {
            original_mask: mask.to_vec(),
            cleaned_mask: mask.to_vec(),
            pathological: vec![0; mask.len()],
            unrepaired: vec![0; mask.len()],
        }
    }

    /// Flag a voxel as pathological (and, until repaired, unrepaired)
    pub fn mark_pathological(&mut self, voxel: usize) {
        self.pathological[voxel] = 1;
        self.unrepaired[voxel] = 1;
    }

    /// Planes stacked in order (original, cleaned, pathological, unrepaired)
    pub fn stacked(&self) -> Vec<f64> {
        [&self.original_mask, &self.cleaned_mask, &self.pathological, &self.unrepaired]
            .iter()
            .flat_map(|plane| plane.iter().map(|&v| v as f64))
            .collect()
    }
}

/// Counters of one run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FitSummary {
    pub n_masked: usize,
    /// Masked voxels in the processed slices
    pub n_processed: usize,
    pub n_pathological: usize,
    pub n_too_few_good_frames: usize,
    pub n_zero_after_gap_fill: usize,
    pub n_non_finite: usize,
    pub n_repaired: usize,
    pub n_unrepaired: usize,
}

/// Output of a multi-echo fit
///
/// Per-frame maps are laid out `frame * n_voxels + voxel`.
#[derive(Clone, Debug)]
pub struct MeFitResult {
    pub dims: (usize, usize, usize),
    pub n_frames: usize,
    pub s0: Vec<f64>,
    pub r2star: Vec<f64>,
    /// Model signal at the reference echo time
    pub s_fit: Vec<f64>,
    /// RMS model error per frame
    pub residual: Vec<f64>,
    /// Weighted combination of the echoes per frame
    pub s_weighted: Vec<f64>,
    pub quality: QualityMask,
    pub mask_stats: MaskStats,
    pub calibration: Option<GlobalCalibration>,
    pub summary: FitSummary,
}

impl MeFitResult {
    #[inline]
    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    /// Index into the per-frame maps
    #[inline]
    pub fn index(&self, frame: usize, voxel: usize) -> usize {
        frame * self.n_voxels() + voxel
    }
}

/// Result of the temporal stages for one voxel
struct VoxelOutput {
    voxel: usize,
    frames: Vec<Option<ResolvedFrame>>,
    pathology: Option<Pathology>,
}

/// Classify, gap-fill and resolve one masked voxel
fn process_voxel(
    ctx: &ResolveContext<'_>,
    series: &EchoSeries,
    voxel: usize,
    hist: &mut HistogramTable,
) -> VoxelOutput {
    let params = ctx.params;
    let samples = series.voxel_series(voxel);
    let failed = |pathology: Pathology| VoxelOutput { voxel, frames: Vec::new(), pathology: Some(pathology) };

    let (mut frames, trusted) = match classify_voxel(ctx.echo_times, &samples, params.bad_frame_fraction, hist) {
        Ok(classified) => classified,
        Err(pathology) => return failed(pathology),
    };
    if let Err(pathology) = fill_gaps(&mut frames, &trusted) {
        log::debug!("voxel {}: {:?} after gap filling", voxel, pathology);
        return failed(pathology);
    }
    if params.regularization == Regularization::Smooth {
        smooth_s0(&mut frames.s0, params.n_smooth);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(params.prior.seed.wrapping_add(voxel as u64));
    let (resolved, pathology) = resolve_voxel(ctx, &samples, &frames, &trusted, &mut rng);
    VoxelOutput { voxel, frames: resolved, pathology }
}

/// Estimate S0 and R2* for every voxel and frame
///
/// # Arguments
/// * `series` - Multi-echo signal `[echo][frame][voxel]`
/// * `params` - Run configuration
///
/// # Returns
/// Parameter maps, quality planes and run statistics
pub fn fit_multi_echo(series: &EchoSeries, params: &MeFitParams) -> Result<MeFitResult> {
    fit_multi_echo_with_progress(series, params, |_, _| {})
}

/// Estimate S0 and R2* with a progress callback
///
/// `progress_callback(done, total)` is called after each processed slice.
pub fn fit_multi_echo_with_progress<F>(
    series: &EchoSeries,
    params: &MeFitParams,
    mut progress_callback: F,
) -> Result<MeFitResult>
where
    F: FnMut(usize, usize),
{
    let (nx, ny, nz) = series.dims();
    params.validate(nz, series.n_frames())?;

    let mut working = None;
    if let Some(n) = params.n_frames {
        working = Some(series.select_frames(n)?);
    }
    if let Some(kind) = params.local_average {
        let base = working.as_ref().unwrap_or(series);
        working = Some(base.locally_averaged(kind));
    }
    let series = working.as_ref().unwrap_or(series);

    let n_voxels = series.n_voxels();
    let n_frames = series.n_frames();
    let echo_times = series.echo_times();
    let te_fit = params.reference_te(echo_times);

    let (mask_stats, s_weighted) = compute_mask_stats(series, params.mask_threshold);
    let calibration = calibrate_global(echo_times, &mask_stats.global, &params.prior);

    let mut s0 = vec![0.0; n_frames * n_voxels];
    let mut r2star = vec![0.0; n_frames * n_voxels];
    let mut s_fit = vec![0.0; n_frames * n_voxels];
    let mut residual = vec![0.0; n_frames * n_voxels];
    let mut quality = QualityMask::from_mask(&mask_stats.mask);
    let mut summary = FitSummary { n_masked: mask_stats.n_masked(), ..Default::default() };

    let ctx = ResolveContext {
        echo_times,
        te_fit,
        params,
        global: &mask_stats.global,
    };

    let slices: Vec<usize> = match params.slice {
        Some(k) => vec![k],
        None => (0..nz).collect(),
    };
    let slice_len = nx * ny;

    for (done, &z) in slices.iter().enumerate() {
        let start = z * slice_len;
        let outputs: Vec<VoxelOutput> = (start..start + slice_len)
            .into_par_iter()
            .filter(|&v| mask_stats.in_mask(v))
            .map_init(HistogramTable::new, |hist, v| process_voxel(&ctx, series, v, hist))
            .collect();

        for out in outputs {
            summary.n_processed += 1;
            for (f, frame) in out.frames.iter().enumerate() {
                if let Some(r) = frame {
                    let at = f * n_voxels + out.voxel;
                    s0[at] = r.s0;
                    r2star[at] = r.r2star;
                    s_fit[at] = r.s_fit;
                    residual[at] = r.residual;
                }
            }
            if let Some(pathology) = out.pathology {
                quality.mark_pathological(out.voxel);
                summary.n_pathological += 1;
                match pathology {
                    Pathology::TooFewGoodFrames { .. } => summary.n_too_few_good_frames += 1,
                    Pathology::ZeroAfterGapFill { .. } => summary.n_zero_after_gap_fill += 1,
                    Pathology::NonFiniteResult { .. } => summary.n_non_finite += 1,
                }
            }
        }
        progress_callback(done + 1, slices.len());
    }

    let repair = repair_pathological(
        series,
        &mask_stats.global,
        te_fit,
        params.effective_repair_window(),
        params.slice,
        ParameterMaps { s0: &mut s0, r2star: &mut r2star, s_fit: &mut s_fit },
        &mut quality,
    );
    summary.n_repaired = repair.repaired;
    summary.n_unrepaired = repair.unrepaired;

    log::info!(
        "processed {} voxels: {} pathological ({} too few good frames, {} zero after gap fill, {} non-finite), {} repaired, {} unrepaired",
        summary.n_processed,
        summary.n_pathological,
        summary.n_too_few_good_frames,
        summary.n_zero_after_gap_fill,
        summary.n_non_finite,
        summary.n_repaired,
        summary.n_unrepaired
    );

    Ok(MeFitResult {
        dims: series.dims(),
        n_frames,
        s0,
        r2star,
        s_fit,
        residual,
        s_weighted,
        quality,
        mask_stats,
        calibration,
        summary,
    })
}

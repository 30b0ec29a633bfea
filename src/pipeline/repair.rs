//! Spatial repair of pathological voxels
//!
//! A voxel whose temporal fit failed takes, frame by frame, the mean
//! parameters of the clean masked voxels in a box around it. Pathology flags
//! are read as they were when the pass started, so repaired voxels never
//! feed other repairs.

use crate::echo_series::EchoSeries;
use crate::params::RepairWindow;
use super::mask::{GlobalStats, CLIP_ECHO};
use super::resolve::clipped_fit_signal;
use super::QualityMask;

/// Counts of one repair pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub repaired: usize,
    pub unrepaired: usize,
}

/// Per-frame parameter maps being repaired in place (`frame * n_voxels + voxel`)
pub struct ParameterMaps<'a> {
    pub s0: &'a mut [f64],
    pub r2star: &'a mut [f64],
    pub s_fit: &'a mut [f64],
}

/// Replace pathological voxels by their clean neighborhood mean
///
/// Voxels closer to the volume border than the window half-width are not
/// visited, nor are voxels outside the selected slice: they keep their
/// flags and do not count as failed fixes.
///
/// # Arguments
/// * `series` - Input signal (second-echo fallback for the fitted signal)
/// * `global` - Population statistics bounding the fitted signal
/// * `te_fit` - Reference echo time of the fitted signal
/// * `window` - Neighborhood half-widths
/// * `slice` - Single-slice restriction
/// * `maps` - Parameter maps to update
/// * `quality` - Quality planes; `unrepaired` is cleared on success and
///   `cleaned_mask` on failure
pub fn repair_pathological(
    series: &EchoSeries,
    global: &GlobalStats,
    te_fit: f64,
    window: RepairWindow,
    slice: Option<usize>,
    maps: ParameterMaps<'_>,
    quality: &mut QualityMask,
) -> RepairSummary {
    let (nx, ny, nz) = series.dims();
    let n_voxels = series.n_voxels();
    let n_frames = series.n_frames();
    let h = window.in_plane;
    let hz = window.through_plane;

    let mut summary = RepairSummary::default();
    let mut sum_s0 = vec![0.0; n_frames];
    let mut sum_r2 = vec![0.0; n_frames];

    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let idx = x + y * nx + z * nx * ny;
                if quality.pathological[idx] == 0 {
                    continue;
                }

                let inside = z >= hz && z + hz < nz && y >= h && y + h < ny && x >= h && x + h < nx;
                let in_slice = slice.map_or(true, |k| k == z);
                if !(inside && in_slice) {
                    continue;
                }

                sum_s0.iter_mut().for_each(|v| *v = 0.0);
                sum_r2.iter_mut().for_each(|v| *v = 0.0);
                let mut count = 0usize;
                for k in (z - hz)..=(z + hz) {
                    for j in (y - h)..=(y + h) {
                        for i in (x - h)..=(x + h) {
                            let n = i + j * nx + k * nx * ny;
                            if n == idx || quality.original_mask[n] == 0 || quality.pathological[n] != 0 {
                                continue;
                            }
                            count += 1;
                            for f in 0..n_frames {
                                sum_s0[f] += maps.s0[f * n_voxels + n];
                                sum_r2[f] += maps.r2star[f * n_voxels + n];
                            }
                        }
                    }
                }

                if count == 0 {
                    quality.cleaned_mask[idx] = 0;
                    summary.unrepaired += 1;
                    continue;
                }

                let c = count as f64;
                for f in 0..n_frames {
                    let s0 = sum_s0[f] / c;
                    let r2 = sum_r2[f] / c;
                    let at = f * n_voxels + idx;
                    maps.s0[at] = s0;
                    maps.r2star[at] = r2;
                    maps.s_fit[at] = clipped_fit_signal(global, te_fit, s0, r2, series.signal(CLIP_ECHO, f, idx));
                }
                quality.unrepaired[idx] = 0;
                summary.repaired += 1;
            }
        }
    }

    if summary.unrepaired > 0 {
        log::warn!("{} pathological voxels could not be repaired", summary.unrepaired);
    }
    summary
}

//! End-to-end scenarios for the multi-echo S0/R2* pipeline
//!
//! Volumes are synthesized from known parameter maps, optionally corrupted
//! in specific frames or voxels, and run through `fit_multi_echo`.

mod common;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use common::*;
use mefmri_core::r2star::model::signal;
use mefmri_core::r2star::{fit_population, ParamPrior};
use mefmri_core::{fit_multi_echo, MeFitParams, PriorParams, Regularization};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// S0 between 500 and 1500, R2* between 15 and 45, varying over frames
fn varied_scan(dims: (usize, usize, usize), n_frames: usize) -> SyntheticScan {
    let n = dims.0 * dims.1 * dims.2;
    SyntheticScan::new(dims, n_frames, move |v, f| {
        let s0 = 500.0 + 1000.0 * v as f64 / n as f64;
        let r2 = 15.0 + 30.0 * ((v * 7 + f * 3) % 11) as f64 / 10.0;
        (s0, r2)
    })
}

// ============================================================================
// Recovery of clean data
// ============================================================================

#[test]
fn test_noiseless_volume_is_recovered() {
    let scan = varied_scan((6, 6, 3), 8);
    let echoes = scan.echoes();
    let result = fit_multi_echo(&scan.series_from(&echoes), &MeFitParams::default()).unwrap();

    let n = scan.n_voxels();
    assert_eq!(result.summary.n_masked, n);
    assert_eq!(result.summary.n_pathological, 0);
    for i in 0..n * scan.n_frames {
        assert_relative_eq!(result.s0[i], scan.s0[i], max_relative = 1e-6);
        assert_relative_eq!(result.r2star[i], scan.r2star[i], max_relative = 1e-6);
        assert!(result.residual[i] < 1e-6, "residual {} at {}", result.residual[i], i);
        // Default reference TE is the second echo
        assert_relative_eq!(result.s_fit[i], echoes[1][i], max_relative = 1e-6);
    }
    assert!(result.quality.pathological.iter().all(|&p| p == 0));
    assert!(result.quality.cleaned_mask.iter().all(|&m| m == 1));
}

#[test]
fn test_noisy_volume_tracks_truth() {
    let scan = varied_scan((6, 6, 2), 6);
    let series = scan.series_from(&scan.noisy_echoes(2.0, 11));
    let result = fit_multi_echo(&series, &MeFitParams::default()).unwrap();

    let mask = frame_mask(&scan.support(), scan.n_frames);
    assert!(correlation(&result.r2star, &scan.r2star, &mask) > 0.95);
    assert!(correlation(&result.s0, &scan.s0, &mask) > 0.95);
    assert!(rmse(&result.r2star, &scan.r2star, &mask) < 3.0);
}

#[test]
fn test_negative_second_echo_keeps_frame_good() {
    let dims = (3, 3, 1);
    let scan = SyntheticScan::uniform(dims, 4, 1000.0, 20.0);
    let mut echoes = scan.echoes();
    let v = voxel_index(dims, 1, 1, 0);
    let n = scan.n_voxels();
    // Frame 2 of the centre voxel: [S1, -5, S3, S4]
    echoes[1][2 * n + v] = -5.0;

    let result = fit_multi_echo(&scan.series_from(&echoes), &MeFitParams::default()).unwrap();
    assert_eq!(result.summary.n_pathological, 0);
    let at = result.index(2, v);
    assert_relative_eq!(result.s0[at], 1000.0, max_relative = 1e-6);
    assert_relative_eq!(result.r2star[at], 20.0, max_relative = 1e-6);
}

// ============================================================================
// Bad frames and gap filling
// ============================================================================

#[test]
fn test_bracketed_bad_frames_take_two_sided_averages() {
    let dims = (3, 3, 1);
    let n_frames = 10;
    let scan = SyntheticScan::new(dims, n_frames, |_, f| (1000.0 + 10.0 * f as f64, 20.0));
    let mut echoes = scan.echoes();
    let n = scan.n_voxels();
    let v = voxel_index(dims, 1, 1, 0);
    // A zero first echo makes a frame bad: one isolated, one adjacent pair
    for f in [3, 6, 7] {
        echoes[0][f * n + v] = 0.0;
    }

    let result = fit_multi_echo(&scan.series_from(&echoes), &MeFitParams::default()).unwrap();
    assert_eq!(result.summary.n_pathological, 0);

    // Isolated frame: mean of frames 2 and 4
    assert_abs_diff_eq!(result.s0[result.index(3, v)], 1030.0, epsilon = 1e-6);
    // Its R2* is re-derived from the remaining echoes with S0 pinned
    assert_abs_diff_eq!(result.r2star[result.index(3, v)], 20.0, epsilon = 1e-6);
    // Pair: both take the mean of frames 5 and 8
    assert_abs_diff_eq!(result.s0[result.index(6, v)], 1065.0, epsilon = 1e-6);
    assert_abs_diff_eq!(result.s0[result.index(7, v)], 1065.0, epsilon = 1e-6);
    for f in 0..n_frames {
        assert!(result.s0[result.index(f, v)] > 0.0);
    }
}

#[test]
fn test_mostly_bad_voxel_is_pathological() {
    let dims = (3, 3, 1);
    let scan = SyntheticScan::uniform(dims, 5, 1000.0, 20.0);
    let mut echoes = scan.echoes();
    let n = scan.n_voxels();
    let v = voxel_index(dims, 0, 0, 0);
    // Four of five frames lose all later echoes: 1 good < 0.4 * 5
    for f in 0..4 {
        for echo in echoes.iter_mut().skip(1) {
            echo[f * n + v] = 0.0;
        }
    }

    let result = fit_multi_echo(&scan.series_from(&echoes), &MeFitParams::default()).unwrap();
    assert_eq!(result.summary.n_pathological, 1);
    assert_eq!(result.summary.n_too_few_good_frames, 1);
    assert_eq!(result.quality.pathological[v], 1);
    // Corner voxel lies inside the repair margin: not visited, not a failed fix
    assert_eq!(result.summary.n_unrepaired, 0);
    assert_eq!(result.quality.unrepaired[v], 1);
    assert_eq!(result.quality.cleaned_mask[v], 1);
    assert_eq!(result.quality.original_mask[v], 1);
}

// ============================================================================
// Mask
// ============================================================================

#[test]
fn test_threshold_voxel_is_excluded() {
    let dims = (2, 1, 1);
    let n_frames = 8;
    let echo1 = vec![100.0, 100.5].repeat(n_frames);
    let echo2 = vec![60.0, 60.5].repeat(n_frames);
    let series = mefmri_core::EchoSeries::from_echoes(&[echo1, echo2], dims, n_frames, vec![0.015, 0.040]).unwrap();

    let result = fit_multi_echo(&series, &MeFitParams::default()).unwrap();
    assert_eq!(result.quality.original_mask, vec![0, 1]);
    assert_eq!(result.summary.n_masked, 1);
    for f in 0..n_frames {
        assert_eq!(result.s0[result.index(f, 0)], 0.0);
        assert_eq!(result.r2star[result.index(f, 0)], 0.0);
        assert!(result.s0[result.index(f, 1)] > 0.0);
    }
}

// ============================================================================
// Spatial repair
// ============================================================================

#[test]
fn test_pathological_voxel_takes_neighbor_mean() {
    let dims = (7, 7, 3);
    let scan = SyntheticScan::uniform(dims, 4, 1000.0, 20.0);
    let mut echoes = scan.echoes();
    let n = scan.n_voxels();
    let v = voxel_index(dims, 3, 3, 1);
    // Every frame has three invalid echoes: bad everywhere, first echo intact
    for f in 0..scan.n_frames {
        for echo in echoes.iter_mut().skip(1) {
            echo[f * n + v] = 0.0;
        }
    }

    let result = fit_multi_echo(&scan.series_from(&echoes), &MeFitParams::default()).unwrap();
    assert_eq!(result.summary.n_pathological, 1);
    assert_eq!(result.summary.n_repaired, 1);
    assert_eq!(result.summary.n_unrepaired, 0);
    assert_eq!(result.quality.pathological[v], 1);
    assert_eq!(result.quality.unrepaired[v], 0);
    assert_eq!(result.quality.cleaned_mask[v], 1);
    for f in 0..scan.n_frames {
        let at = result.index(f, v);
        assert_relative_eq!(result.s0[at], 1000.0, max_relative = 1e-6);
        assert_relative_eq!(result.r2star[at], 20.0, max_relative = 1e-6);
        assert_relative_eq!(result.s_fit[at], signal(ECHO_TIMES[1], 1000.0, 20.0), max_relative = 1e-6);
    }
}

#[test]
fn test_border_pathological_voxel_stays_in_cleaned_mask() {
    let dims = (5, 5, 3);
    let scan = SyntheticScan::uniform(dims, 4, 1000.0, 20.0);
    let mut echoes = scan.echoes();
    let n = scan.n_voxels();
    let v = voxel_index(dims, 0, 2, 1);
    for f in 0..scan.n_frames {
        for echo in echoes.iter_mut().skip(1) {
            echo[f * n + v] = 0.0;
        }
    }

    let result = fit_multi_echo(&scan.series_from(&echoes), &MeFitParams::default()).unwrap();
    assert_eq!(result.summary.n_pathological, 1);
    assert_eq!(result.summary.n_repaired, 0);
    assert_eq!(result.summary.n_unrepaired, 0);
    assert_eq!(result.quality.pathological[v], 1);
    assert_eq!(result.quality.cleaned_mask[v], 1);
}

#[test]
fn test_repair_without_clean_neighbors_leaves_voxel() {
    let dims = (5, 5, 3);
    let v = voxel_index(dims, 2, 2, 1);
    let scan = SyntheticScan::new(dims, 4, move |voxel, _| {
        if voxel == v { (1000.0, 20.0) } else { (0.0, 20.0) }
    });
    let mut echoes = scan.echoes();
    let n = scan.n_voxels();
    for f in 0..scan.n_frames {
        for echo in echoes.iter_mut().skip(1) {
            echo[f * n + v] = 0.0;
        }
    }

    let result = fit_multi_echo(&scan.series_from(&echoes), &MeFitParams::default()).unwrap();
    assert_eq!(result.summary.n_masked, 1);
    assert_eq!(result.summary.n_repaired, 0);
    assert_eq!(result.summary.n_unrepaired, 1);
    assert_eq!(result.quality.unrepaired[v], 1);
    assert_eq!(result.quality.cleaned_mask[v], 0);
    for f in 0..scan.n_frames {
        assert_eq!(result.s0[result.index(f, v)], 0.0);
    }
}

// ============================================================================
// Regularized and nonlinear modes
// ============================================================================

#[test]
fn test_mean_regularization_pins_s0() {
    let dims = (3, 3, 1);
    let scan = SyntheticScan::new(dims, 6, |_, f| (900.0, 18.0 + 2.0 * f as f64));
    for regularization in [Regularization::Mean, Regularization::Smooth] {
        let params = MeFitParams { regularization, ..Default::default() };
        let result = fit_multi_echo(&scan.series(), &params).unwrap();
        for i in 0..scan.n_voxels() * scan.n_frames {
            assert_relative_eq!(result.s0[i], 900.0, max_relative = 1e-6);
            assert_relative_eq!(result.r2star[i], scan.r2star[i], max_relative = 1e-6);
        }
    }
}

#[test]
fn test_nonlinear_mode_keeps_exact_solution() {
    let dims = (2, 2, 1);
    let scan = SyntheticScan::uniform(dims, 3, 800.0, 25.0);
    let params = MeFitParams {
        nonlinear: true,
        prior: PriorParams { n_population: 5, ..Default::default() },
        ..Default::default()
    };
    let result = fit_multi_echo(&scan.series(), &params).unwrap();
    assert_eq!(result.summary.n_pathological, 0);
    for i in 0..scan.n_voxels() * scan.n_frames {
        assert_relative_eq!(result.s0[i], 800.0, max_relative = 1e-3);
        assert_relative_eq!(result.r2star[i], 25.0, max_relative = 1e-3);
    }
}

#[test]
fn test_population_fit_not_worse_than_single_start() {
    let scan = SyntheticScan::uniform((1, 1, 1), 1, 1200.0, 35.0);
    let samples: Vec<f64> = scan.noisy_echoes(15.0, 5).into_iter().map(|e| e[0]).collect();
    let settings = PriorParams::default();
    let priors = [ParamPrior::around(1000.0, &settings), ParamPrior::around(30.0, &settings)];

    let single = PriorParams { n_population: 1, ..settings };
    let one = fit_population(&ECHO_TIMES, &samples, &priors, &single, &mut ChaCha8Rng::seed_from_u64(1));
    let many = fit_population(&ECHO_TIMES, &samples, &priors, &settings, &mut ChaCha8Rng::seed_from_u64(1));
    assert!(many.logprob >= one.logprob);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_frame_selection_and_slice_mode() {
    let scan = varied_scan((4, 4, 3), 6);
    let params = MeFitParams { n_frames: Some(4), slice: Some(1), ..Default::default() };
    let result = fit_multi_echo(&scan.series(), &params).unwrap();
    assert_eq!(result.n_frames, 4);
    assert_eq!(result.summary.n_processed, 16);
    let v_in = voxel_index(result.dims, 1, 1, 1);
    let v_out = voxel_index(result.dims, 1, 1, 2);
    assert_relative_eq!(result.s0[v_in], scan.s0[v_in], max_relative = 1e-6);
    assert_eq!(result.s0[v_out], 0.0);
}

#[test]
fn test_out_of_range_slice_is_rejected() {
    let scan = SyntheticScan::uniform((2, 2, 2), 2, 1000.0, 20.0);
    let params = MeFitParams { slice: Some(2), ..Default::default() };
    assert!(matches!(
        fit_multi_echo(&scan.series(), &params),
        Err(mefmri_core::MeFitError::InvalidSlice { slice: 2, nz: 2 })
    ));
}

//! Common test utilities for mefmri-core integration tests

#![allow(dead_code)]

use mefmri_core::r2star::model::signal;
use mefmri_core::EchoSeries;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Four-echo protocol used throughout the scenarios (seconds)
pub const ECHO_TIMES: [f64; 4] = [0.015, 0.028, 0.042, 0.056];

/// Paired samples of two maps where the mask is set
fn masked_pairs<'a>(a: &'a [f64], b: &'a [f64], mask: &'a [u8]) -> impl Iterator<Item = (f64, f64)> + 'a {
    a.iter().zip(b).zip(mask).filter(|(_, &m)| m > 0).map(|((&x, &y), _)| (x, y))
}

/// Root-mean-square difference inside the mask (0 for an empty mask)
pub fn rmse(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let (sum_sq, count) = masked_pairs(a, b, mask)
        .fold((0.0, 0usize), |(s, n), (x, y)| (s + (x - y) * (x - y), n + 1));
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt()
}

/// Pearson correlation inside the mask (0 when either map is constant)
pub fn correlation(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let pairs: Vec<(f64, f64)> = masked_pairs(a, b, mask).collect();
    if pairs.is_empty() {
        return 0.0;
    }
    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / n;

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for &(x, y) in &pairs {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a) * (x - mean_a);
        var_b += (y - mean_b) * (y - mean_b);
    }
    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    cov / denom
}

/// Repeat a voxel mask once per frame to match the per-frame maps
pub fn frame_mask(mask: &[u8], n_frames: usize) -> Vec<u8> {
    mask.iter().copied().cycle().take(mask.len() * n_frames).collect()
}

/// Fortran-order voxel index
pub fn voxel_index(dims: (usize, usize, usize), x: usize, y: usize, z: usize) -> usize {
    x + y * dims.0 + z * dims.0 * dims.1
}

/// Ground-truth S0/R2* maps and the mono-exponential signal they produce
pub struct SyntheticScan {
    pub dims: (usize, usize, usize),
    pub n_frames: usize,
    pub echo_times: Vec<f64>,
    /// True S0, `frame * n_voxels + voxel`
    pub s0: Vec<f64>,
    /// True R2*, `frame * n_voxels + voxel`
    pub r2star: Vec<f64>,
}

impl SyntheticScan {
    /// Build from a per-(voxel, frame) truth function returning `(S0, R2*)`
    pub fn new<F>(dims: (usize, usize, usize), n_frames: usize, truth: F) -> Self
    where
        F: Fn(usize, usize) -> (f64, f64),
    {
        let n_voxels = dims.0 * dims.1 * dims.2;
        let mut s0 = vec![0.0; n_frames * n_voxels];
        let mut r2star = vec![0.0; n_frames * n_voxels];
        for f in 0..n_frames {
            for v in 0..n_voxels {
                let (a, r) = truth(v, f);
                s0[f * n_voxels + v] = a;
                r2star[f * n_voxels + v] = r;
            }
        }
        Self { dims, n_frames, echo_times: ECHO_TIMES.to_vec(), s0, r2star }
    }

    /// Same parameters everywhere
    pub fn uniform(dims: (usize, usize, usize), n_frames: usize, s0: f64, r2star: f64) -> Self {
        Self::new(dims, n_frames, |_, _| (s0, r2star))
    }

    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    /// Noiseless signal, one `[frame][voxel]` buffer per echo
    pub fn echoes(&self) -> Vec<Vec<f64>> {
        self.echo_times
            .iter()
            .map(|&te| {
                self.s0
                    .iter()
                    .zip(&self.r2star)
                    .map(|(&a, &r)| signal(te, a, r))
                    .collect()
            })
            .collect()
    }

    /// Signal with additive Gaussian noise from a seeded generator
    pub fn noisy_echoes(&self, noise_std: f64, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut echoes = self.echoes();
        for echo in echoes.iter_mut() {
            for v in echo.iter_mut() {
                let z: f64 = StandardNormal.sample(&mut rng);
                *v += noise_std * z;
            }
        }
        echoes
    }

    /// Assemble an `EchoSeries` from (possibly edited) echo buffers
    pub fn series_from(&self, echoes: &[Vec<f64>]) -> EchoSeries {
        EchoSeries::from_echoes(echoes, self.dims, self.n_frames, self.echo_times.clone())
            .expect("synthetic scan geometry is consistent")
    }

    pub fn series(&self) -> EchoSeries {
        self.series_from(&self.echoes())
    }

    /// Voxels whose true S0 is non-zero in the first frame
    pub fn support(&self) -> Vec<u8> {
        self.s0[..self.n_voxels()].iter().map(|&a| (a > 0.0) as u8).collect()
    }
}

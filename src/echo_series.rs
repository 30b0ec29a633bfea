//! In-memory multi-echo signal cube
//!
//! Signal is stored echo-major as `[echo][frame][voxel]`, with voxels in
//! Fortran order (`index = x + y*nx + z*nx*ny`) to match NIfTI convention.

use crate::error::{MeFitError, Result};
use crate::params::LocalAverage;
use crate::utils::local_average::box_average_3d;

/// Maximum number of echoes a run may carry
pub const MAX_ECHOES: usize = 9;
/// Minimum number of echoes needed for a two-parameter fit
pub const MIN_ECHOES: usize = 2;

/// Multi-echo time series for a whole volume
#[derive(Clone, Debug)]
pub struct EchoSeries {
    data: Vec<f64>,
    dims: (usize, usize, usize),
    n_frames: usize,
    echo_times: Vec<f64>,
}

/// Check the echo-time vector: 2..=9 positive finite values
pub fn validate_echo_times(echo_times: &[f64]) -> Result<()> {
    if echo_times.len() < MIN_ECHOES || echo_times.len() > MAX_ECHOES {
        return Err(MeFitError::InvalidEchoCount(echo_times.len()));
    }
    for (index, &value) in echo_times.iter().enumerate() {
        if !(value > 0.0 && value.is_finite()) {
            return Err(MeFitError::InvalidEchoTime { index, value });
        }
    }
    Ok(())
}

impl EchoSeries {
    /// Wrap an echo-major buffer
    ///
    /// # Arguments
    /// * `data` - Signal, length `n_echoes * n_frames * nx*ny*nz`
    /// * `dims` - Volume dimensions (nx, ny, nz)
    /// * `n_frames` - Number of time frames
    /// * `echo_times` - Echo times in seconds, one per echo
    pub fn new(
        data: Vec<f64>,
        dims: (usize, usize, usize),
        n_frames: usize,
        echo_times: Vec<f64>,
    ) -> Result<Self> {
        validate_echo_times(&echo_times)?;
        if n_frames == 0 {
            return Err(MeFitError::InvalidFrameSelection { requested: 0, available: 0 });
        }
        let expected = echo_times.len() * n_frames * dims.0 * dims.1 * dims.2;
        if data.len() != expected {
            return Err(MeFitError::DataLengthMismatch { expected, actual: data.len() });
        }
        Ok(Self { data, dims, n_frames, echo_times })
    }

    /// Assemble from one 4D buffer per echo (each `[frame][voxel]`)
    pub fn from_echoes(
        echoes: &[impl AsRef<[f64]>],
        dims: (usize, usize, usize),
        n_frames: usize,
        echo_times: Vec<f64>,
    ) -> Result<Self> {
        if echoes.len() != echo_times.len() {
            return Err(MeFitError::EchoCountMismatch {
                echo_times: echo_times.len(),
                echoes: echoes.len(),
            });
        }
        let per_echo = n_frames * dims.0 * dims.1 * dims.2;
        let mut data = Vec::with_capacity(per_echo * echoes.len());
        for echo in echoes {
            let echo = echo.as_ref();
            if echo.len() != per_echo {
                return Err(MeFitError::DataLengthMismatch { expected: per_echo, actual: echo.len() });
            }
            data.extend_from_slice(echo);
        }
        Self::new(data, dims, n_frames, echo_times)
    }

    #[inline]
    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    #[inline]
    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    #[inline]
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    #[inline]
    pub fn n_echoes(&self) -> usize {
        self.echo_times.len()
    }

    #[inline]
    pub fn echo_times(&self) -> &[f64] {
        &self.echo_times
    }

    /// Signal of one echo, frame and voxel
    #[inline]
    pub fn signal(&self, echo: usize, frame: usize, voxel: usize) -> f64 {
        self.data[(echo * self.n_frames + frame) * self.n_voxels() + voxel]
    }

    /// One 3D volume (echo, frame)
    pub fn volume(&self, echo: usize, frame: usize) -> &[f64] {
        let n = self.n_voxels();
        let start = (echo * self.n_frames + frame) * n;
        &self.data[start..start + n]
    }

    /// Gather the `[frame][echo]` samples of a single voxel
    pub fn voxel_series(&self, voxel: usize) -> VoxelSeries {
        let n_echoes = self.n_echoes();
        let mut samples = vec![0.0; self.n_frames * n_echoes];
        for e in 0..n_echoes {
            for f in 0..self.n_frames {
                samples[f * n_echoes + e] = self.signal(e, f, voxel);
            }
        }
        VoxelSeries { samples, n_echoes, n_frames: self.n_frames }
    }

    /// Keep only the first `n` frames
    pub fn select_frames(&self, n: usize) -> Result<Self> {
        if n == 0 || n > self.n_frames {
            return Err(MeFitError::InvalidFrameSelection { requested: n, available: self.n_frames });
        }
        if n == self.n_frames {
            return Ok(self.clone());
        }
        let mut data = Vec::with_capacity(self.n_echoes() * n * self.n_voxels());
        for e in 0..self.n_echoes() {
            for f in 0..n {
                data.extend_from_slice(self.volume(e, f));
            }
        }
        Ok(Self { data, dims: self.dims, n_frames: n, echo_times: self.echo_times.clone() })
    }

    /// Box-car average every (echo, frame) volume
    pub fn locally_averaged(&self, kind: LocalAverage) -> Self {
        let (nx, ny, nz) = self.dims;
        let mut data = Vec::with_capacity(self.data.len());
        for e in 0..self.n_echoes() {
            for f in 0..self.n_frames {
                data.extend(box_average_3d(self.volume(e, f), nx, ny, nz, kind.half_widths()));
            }
        }
        Self { data, dims: self.dims, n_frames: self.n_frames, echo_times: self.echo_times.clone() }
    }
}

/// Samples of one voxel laid out `[frame][echo]`
#[derive(Clone, Debug)]
pub struct VoxelSeries {
    samples: Vec<f64>,
    n_echoes: usize,
    n_frames: usize,
}

impl VoxelSeries {
    /// Build directly from `[frame][echo]` samples
    pub fn from_frames(frames: &[Vec<f64>]) -> Self {
        let n_echoes = frames.first().map_or(0, |f| f.len());
        let samples = frames.iter().flat_map(|f| f.iter().copied()).collect();
        Self { samples, n_echoes, n_frames: frames.len() }
    }

    #[inline]
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    #[inline]
    pub fn n_echoes(&self) -> usize {
        self.n_echoes
    }

    /// Echo samples of one frame
    #[inline]
    pub fn frame(&self, frame: usize) -> &[f64] {
        &self.samples[frame * self.n_echoes..(frame + 1) * self.n_echoes]
    }

    /// Time-averaged signal per echo
    pub fn echo_means(&self) -> Vec<f64> {
        self.echo_means_and_stds().0
    }

    /// Time-averaged signal and its temporal standard deviation per echo
    pub fn echo_means_and_stds(&self) -> (Vec<f64>, Vec<f64>) {
        let n = self.n_frames as f64;
        let mut sum = vec![0.0; self.n_echoes];
        let mut sum2 = vec![0.0; self.n_echoes];
        for f in 0..self.n_frames {
            for (e, &s) in self.frame(f).iter().enumerate() {
                sum[e] += s;
                sum2[e] += s * s;
            }
        }
        let means: Vec<f64> = sum.iter().map(|&s| s / n).collect();
        let stds = if self.n_frames > 1 {
            sum2.iter()
                .zip(&means)
                .map(|(&s2, &m)| ((s2 - n * m * m) / (n - 1.0)).max(0.0).sqrt())
                .collect()
        } else {
            vec![0.0; self.n_echoes]
        };
        (means, stds)
    }
}

//! Box-car averaging of a 3D volume
//!
//! Used to pre-average noisy input before fitting. The window is clipped at
//! the volume border, so edge voxels average fewer neighbors.

/// Average each voxel with its neighbors inside a rectangular window
///
/// # Arguments
/// * `data` - Input volume (nx * ny * nz)
/// * `nx`, `ny`, `nz` - Dimensions
/// * `half` - Window half-widths (hx, hy, hz); (1, 1, 0) is a 3x3 in-plane window
///
/// # Returns
/// Averaged volume
pub fn box_average_3d(
    data: &[f64],
    nx: usize, ny: usize, nz: usize,
    half: (usize, usize, usize),
) -> Vec<f64> {
    let (hx, hy, hz) = half;

    // Separable: a box window is the product of three 1D windows
    let pass_x = box_pass(data, nx, ny, nz, hx, 1, nx);
    let pass_y = box_pass(&pass_x, nx, ny, nz, hy, nx, ny);
    box_pass(&pass_y, nx, ny, nz, hz, nx * ny, nz)
}

/// One 1D box pass along an axis given by its stride and length
fn box_pass(
    data: &[f64],
    nx: usize, ny: usize, nz: usize,
    half: usize,
    stride: usize,
    len: usize,
) -> Vec<f64> {
    if half == 0 {
        return data.to_vec();
    }
    let mut out = vec![0.0; nx * ny * nz];
    for idx in 0..data.len() {
        let pos = (idx / stride) % len;
        let lo = pos.saturating_sub(half);
        let hi = (pos + half).min(len - 1);
        let base = idx - pos * stride;
        let mut sum = 0.0;
        for p in lo..=hi {
            sum += data[base + p * stride];
        }
        out[idx] = sum / (hi - lo + 1) as f64;
    }
    out
}

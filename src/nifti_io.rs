//! NIfTI file I/O
//!
//! Loads per-echo 4D time series into an `EchoSeries` and writes the
//! per-frame result maps back out. Both .nii and .nii.gz are supported
//! (gzip is auto-detected on read and chosen by extension on write).

use std::borrow::Cow;
use std::io::Read;
use std::path::{Path, PathBuf};
use nifti::{NiftiObject, InMemNiftiObject, NiftiHeader};
use nifti::volume::ndarray::IntoNdArray;
use flate2::read::GzDecoder;
use ndarray::Array;

use crate::echo_series::EchoSeries;
use crate::error::{MeFitError, Result};
use crate::pipeline::MeFitResult;

/// Value written in place of NaN in output volumes
pub const NAN_FILL: f64 = 1.0e-37;

/// 4D NIfTI volume series loaded from bytes
#[derive(Clone, Debug)]
pub struct NiftiSeries {
    /// Voxel data as f64, each volume in Fortran order, volumes stacked
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz, nt); nt is 1 for a 3D file
    pub dims: (usize, usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
    /// Data scaling slope
    pub scl_slope: f64,
    /// Data scaling intercept
    pub scl_inter: f64,
}

impl NiftiSeries {
    #[inline]
    pub fn spatial_dims(&self) -> (usize, usize, usize) {
        (self.dims.0, self.dims.1, self.dims.2)
    }

    #[inline]
    pub fn n_frames(&self) -> usize {
        self.dims.3
    }
}

/// Echo series read from disk together with the geometry of the first echo
#[derive(Clone, Debug)]
pub struct LoadedEchoes {
    pub series: EchoSeries,
    pub voxel_size: (f64, f64, f64),
    pub affine: [f64; 16],
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const NIFTI1_HEADER_LEN: usize = 348;

/// Inflate gzip input; plain input is borrowed as is
fn raw_nifti_bytes(bytes: &[u8]) -> Result<Cow<'_, [u8]>> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Ok(Cow::Borrowed(bytes));
    }
    let mut raw = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut raw)
        .map_err(|e| MeFitError::Nifti(format!("Failed to decompress gzip stream: {}", e)))?;
    Ok(Cow::Owned(raw))
}

/// Short description of a raw header for parse-failure messages
fn header_summary(raw: &[u8]) -> String {
    match raw.get(..NIFTI1_HEADER_LEN) {
        None => format!("{} bytes, shorter than a NIfTI-1 header", raw.len()),
        Some(h) => format!(
            "sizeof_hdr={}, datatype={}, magic={:?}",
            i32::from_le_bytes([h[0], h[1], h[2], h[3]]),
            i16::from_le_bytes([h[70], h[71]]),
            String::from_utf8_lossy(&h[344..348]),
        ),
    }
}

/// Load a 3D or 4D NIfTI file from bytes
///
/// A 3D file is returned as a single-frame series.
pub fn load_nifti(bytes: &[u8]) -> Result<NiftiSeries> {
    let raw = raw_nifti_bytes(bytes)?;
    let obj = InMemNiftiObject::from_reader(&*raw).map_err(|e| {
        MeFitError::Nifti(format!("Failed to parse NIfTI ({}): {}", header_summary(&raw), e))
    })?;

    let header = obj.header();
    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(MeFitError::Nifti(format!("Expected at least 3D volume, got {}D", ndim)));
    }

    let pixdim = header.pixdim;
    let voxel_size = (pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64);
    let scl_slope = if header.scl_slope == 0.0 { 1.0 } else { header.scl_slope as f64 };
    let scl_inter = header.scl_inter as f64;
    let affine = header_affine(header);

    let volume = obj.into_volume();
    let array: Array<f64, _> = volume.into_ndarray()
        .map_err(|e| MeFitError::Nifti(format!("Failed to convert to ndarray: {}", e)))?;

    let shape = array.shape();
    if shape.len() < 3 {
        return Err(MeFitError::Nifti(format!("Expected at least 3D array, got {}D", shape.len())));
    }
    if shape.len() > 4 {
        return Err(MeFitError::Nifti(format!("Expected at most 4D data, got {}D", shape.len())));
    }

    // Use the actual array shape (nifti-rs may reorder)
    let (dim0, dim1, dim2) = (shape[0], shape[1], shape[2]);
    let dim3 = if shape.len() >= 4 { shape[3] } else { 1 };

    // Each volume in Fortran order: index = x + y*nx + z*nx*ny + t*nx*ny*nz
    let mut data = Vec::with_capacity(dim0 * dim1 * dim2 * dim3);
    if shape.len() == 3 {
        for k in 0..dim2 {
            for j in 0..dim1 {
                for i in 0..dim0 {
                    data.push(array[[i, j, k]]);
                }
            }
        }
    } else {
        for t in 0..dim3 {
            for k in 0..dim2 {
                for j in 0..dim1 {
                    for i in 0..dim0 {
                        data.push(array[[i, j, k, t]]);
                    }
                }
            }
        }
    }

    Ok(NiftiSeries {
        data,
        dims: (dim0, dim1, dim2, dim3),
        voxel_size,
        affine,
        scl_slope,
        scl_inter,
    })
}

/// Row-major 4x4 affine from the sform, or voxel scaling when there is none
fn header_affine(header: &NiftiHeader) -> [f64; 16] {
    let mut affine = [0.0; 16];
    affine[15] = 1.0;
    if header.sform_code > 0 {
        for (r, row) in [header.srow_x, header.srow_y, header.srow_z].iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                affine[r * 4 + c] = v as f64;
            }
        }
    } else {
        for d in 0..3 {
            affine[d * 5] = header.pixdim[d + 1] as f64;
        }
    }
    affine
}

/// Save data as NIfTI bytes
///
/// Writes an uncompressed single-file .nii with float32 voxels. A series
/// with one frame gets a 3D header. NaN values are written as `NAN_FILL`.
///
/// # Arguments
/// * `data` - Volumes stacked frame-major, each in Fortran order
/// * `dims` - Dimensions (nx, ny, nz, nt)
/// * `voxel_size` - Voxel sizes in mm
/// * `affine` - Row-major 4x4 affine; the first three rows become the sform
pub fn save_nifti(
    data: &[f64],
    dims: (usize, usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<Vec<u8>> {
    use std::io::Write;

    let (nx, ny, nz, nt) = dims;
    let expected = nx * ny * nz * nt;
    if data.len() != expected {
        return Err(MeFitError::DataLengthMismatch { expected, actual: data.len() });
    }
    let to_dim = |d: usize| {
        i16::try_from(d).map_err(|_| MeFitError::Nifti(format!("Dimension {} exceeds the NIfTI-1 limit", d)))
    };
    let (vsx, vsy, vsz) = voxel_size;

    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]
    let ndim = if nt > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [ndim, to_dim(nx)?, to_dim(ny)?, to_dim(nz)?, to_dim(nt)?, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0..7]
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4 bytes extension)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());

    // scl_slope = 1.0, scl_inter = 0.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    // srow_x, srow_y, srow_z
    for row in 0..3 {
        for i in 0..4 {
            let offset = 280 + row * 16 + i * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[row * 4 + i] as f32).to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + data.len() * 4);
    buffer.write_all(&header)?;
    // Extension (4 bytes, all zeros = no extension)
    buffer.write_all(&[0u8; 4])?;
    for &val in data {
        let val = if val.is_nan() { NAN_FILL } else { val };
        buffer.write_all(&(val as f32).to_le_bytes())?;
    }

    Ok(buffer)
}

/// Save data as gzipped NIfTI bytes (.nii.gz)
pub fn save_nifti_gz(
    data: &[f64],
    dims: (usize, usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let uncompressed = save_nifti(data, dims, voxel_size, affine)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&uncompressed)
        .map_err(|e| MeFitError::Nifti(format!("Gzip compression failed: {}", e)))?;
    encoder.finish()
        .map_err(|e| MeFitError::Nifti(format!("Gzip finish failed: {}", e)))
}

/// Read a NIfTI file from a filesystem path
pub fn read_nifti_file(path: &Path) -> Result<NiftiSeries> {
    let bytes = std::fs::read(path)
        .map_err(|e| MeFitError::Nifti(format!("Failed to read file '{}': {}", path.display(), e)))?;
    load_nifti(&bytes)
}

/// Save NIfTI data to a file
///
/// If the path ends with .nii.gz, the file is gzip compressed.
/// Otherwise it is saved as uncompressed .nii.
pub fn save_nifti_to_file(
    path: &Path,
    data: &[f64],
    dims: (usize, usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<()> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        save_nifti_gz(data, dims, voxel_size, affine)?
    } else {
        save_nifti(data, dims, voxel_size, affine)?
    };

    std::fs::write(path, &bytes)
        .map_err(|e| MeFitError::Nifti(format!("Failed to write file '{}': {}", path.display(), e)))
}

/// Read one 4D file per echo into an `EchoSeries`
///
/// Every echo must share the geometry (including frame count) of the first.
///
/// # Arguments
/// * `paths` - One NIfTI path per echo, in echo order
/// * `echo_times` - Echo times in seconds
///
/// # Returns
/// The assembled series with the first echo's voxel size and affine
pub fn read_echo_series<P: AsRef<Path>>(paths: &[P], echo_times: Vec<f64>) -> Result<LoadedEchoes> {
    if paths.len() != echo_times.len() {
        return Err(MeFitError::EchoCountMismatch {
            echo_times: echo_times.len(),
            echoes: paths.len(),
        });
    }

    let mut echoes: Vec<NiftiSeries> = Vec::with_capacity(paths.len());
    for (echo, path) in paths.iter().enumerate() {
        let loaded = read_nifti_file(path.as_ref())?;
        if let Some(first) = echoes.first() {
            if loaded.dims != first.dims {
                return Err(MeFitError::GeometryMismatch {
                    echo,
                    expected: first.dims,
                    actual: loaded.dims,
                });
            }
        }
        log::debug!("echo {} loaded from '{}' with dims {:?}", echo, path.as_ref().display(), loaded.dims);
        echoes.push(loaded);
    }

    let first = echoes.first().ok_or(MeFitError::InvalidEchoCount(0))?;
    let dims = first.spatial_dims();
    let n_frames = first.n_frames();
    let voxel_size = first.voxel_size;
    let affine = first.affine;

    let buffers: Vec<&[f64]> = echoes.iter().map(|e| e.data.as_slice()).collect();
    let series = EchoSeries::from_echoes(&buffers, dims, n_frames, echo_times)?;
    Ok(LoadedEchoes { series, voxel_size, affine })
}

/// Write every result map of a run next to each other
///
/// Files are named `<stem>_<map>.nii.gz` for the maps S0, R2s, Sfit, Res,
/// Swgt (one volume per frame) and QA (the four quality planes).
///
/// # Returns
/// Paths of the written files
pub fn write_result_maps(
    dir: &Path,
    stem: &str,
    result: &MeFitResult,
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<Vec<PathBuf>> {
    let (nx, ny, nz) = result.dims;
    let per_frame = (nx, ny, nz, result.n_frames);
    let quality = result.quality.stacked();

    let maps: [(&str, &[f64], (usize, usize, usize, usize)); 6] = [
        ("S0", result.s0.as_slice(), per_frame),
        ("R2s", result.r2star.as_slice(), per_frame),
        ("Sfit", result.s_fit.as_slice(), per_frame),
        ("Res", result.residual.as_slice(), per_frame),
        ("Swgt", result.s_weighted.as_slice(), per_frame),
        ("QA", quality.as_slice(), (nx, ny, nz, 4)),
    ];

    let mut written = Vec::with_capacity(maps.len());
    for (name, data, dims) in maps {
        let path = dir.join(format!("{}_{}.nii.gz", stem, name));
        save_nifti_to_file(&path, data, dims, voxel_size, affine)?;
        log::info!("wrote {}", path.display());
        written.push(path);
    }
    Ok(written)
}

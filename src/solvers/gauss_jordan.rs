//! Gauss-Jordan elimination with full pivoting
//!
//! Solves `A X = B` in place, leaving `A⁻¹` in `a` and `X` in `b`. Intended
//! for the tiny (2x2) normal-equation systems of the nonlinear refinement,
//! where an explicit inverse is also needed for the covariance estimate.
//!
//! Reference: Press et al., "Numerical Recipes", §2.1.

use ndarray::Array2;
use thiserror::Error;

/// Pivot failure during elimination
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotError {
    /// Zero pivot: the matrix is singular
    #[error("singular matrix")]
    Singular,
    /// A column was selected as pivot twice
    #[error("ambiguous pivot")]
    Ambiguous,
}

/// Invert `a` and solve for the right-hand sides in `b`
///
/// # Arguments
/// * `a` - Square n x n matrix, replaced by its inverse
/// * `b` - n x m right-hand sides, replaced by the solutions
///
/// # Returns
/// `Err` on a singular or ambiguous pivot; `a` and `b` are then undefined
pub fn gauss_jordan(a: &mut Array2<f64>, b: &mut Array2<f64>) -> Result<(), PivotError> {
    let n = a.nrows();
    let m = b.ncols();
    debug_assert_eq!(a.ncols(), n);
    debug_assert_eq!(b.nrows(), n);

    let mut indxc = vec![0usize; n];
    let mut indxr = vec![0usize; n];
    let mut ipiv = vec![0u32; n];

    for i in 0..n {
        let mut big = 0.0;
        let mut irow = 0;
        let mut icol = 0;
        for j in 0..n {
            if ipiv[j] == 1 {
                continue;
            }
            for k in 0..n {
                if ipiv[k] == 0 {
                    if a[[j, k]].abs() >= big {
                        big = a[[j, k]].abs();
                        irow = j;
                        icol = k;
                    }
                } else if ipiv[k] > 1 {
                    return Err(PivotError::Ambiguous);
                }
            }
        }
        ipiv[icol] += 1;

        if irow != icol {
            for l in 0..n {
                a.swap([irow, l], [icol, l]);
            }
            for l in 0..m {
                b.swap([irow, l], [icol, l]);
            }
        }
        indxr[i] = irow;
        indxc[i] = icol;

        let pivot = a[[icol, icol]];
        if pivot == 0.0 || !pivot.is_finite() {
            return Err(PivotError::Singular);
        }
        let pivinv = 1.0 / pivot;
        a[[icol, icol]] = 1.0;
        for l in 0..n {
            a[[icol, l]] *= pivinv;
        }
        for l in 0..m {
            b[[icol, l]] *= pivinv;
        }

        for ll in 0..n {
            if ll == icol {
                continue;
            }
            let dum = a[[ll, icol]];
            a[[ll, icol]] = 0.0;
            for l in 0..n {
                a[[ll, l]] -= a[[icol, l]] * dum;
            }
            for l in 0..m {
                b[[ll, l]] -= b[[icol, l]] * dum;
            }
        }
    }

    // Undo the column interchanges in reverse order
    for l in (0..n).rev() {
        if indxr[l] != indxc[l] {
            for k in 0..n {
                a.swap([k, indxr[l]], [k, indxc[l]]);
            }
        }
    }
    Ok(())
}

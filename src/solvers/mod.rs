//! Numerical solvers
//!
//! - `linear_fit`: closed-form straight-line least squares
//! - `gauss_jordan`: full-pivot elimination and inversion of small systems
//! - `marquardt`: damped Gauss-Newton step with parameter priors

pub mod linear_fit;
pub mod gauss_jordan;
pub mod marquardt;

pub use linear_fit::{fit_fixed_intercept, fit_line, LineFit};
pub use gauss_jordan::{gauss_jordan, PivotError};
pub use marquardt::{Coefficients, MarquardtState, ParamMode, PriorProblem, FAILED_LOGPROB};

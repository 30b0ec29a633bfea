//! Nonlinear S0/R2* estimation
//!
//! The mono-exponential decay model and a population-restart
//! Levenberg-Marquardt fit with parameter priors, used to refine good
//! frames and to calibrate against the population-averaged signal.

pub mod model;
pub mod population;

pub use model::{decay_with_gradient, is_physical, rms_residual, signal};
pub use population::{draw_start, fit_population, refine_from, ParamPrior, PriorFit};

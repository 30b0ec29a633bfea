//! Levenberg-Marquardt with Gaussian likelihood and parameter priors
//!
//! A variant of the classic damped Gauss-Newton step in which the noise
//! level is estimated from the residuals instead of being supplied, and
//! selected parameters carry a log-prior `ln(a / (ā² + a²))` that keeps
//! them away from zero and from large multiples of the reference `ā`.
//! Accepted steps are scaled by a relaxation factor that starts small and
//! is square-rooted towards 1 on every success.
//!
//! The objective is maximized: `alpha` is the negative Hessian of the log
//! probability and `beta` its gradient.
//!
//! Reference: Press et al., "Numerical Recipes", §15.5 (mrqmin/mrqcof).

use ndarray::{Array1, Array2};

use super::gauss_jordan::gauss_jordan;

/// Log probability reported when a step cannot be solved
pub const FAILED_LOGPROB: f64 = -9.0e9;

/// Floor on the residual sum of squares (noiseless data)
const MIN_SUM_SQUARES: f64 = 1e-20;

const INITIAL_LAMBDA: f64 = 1e-3;
const INITIAL_RELAX: f64 = 0.1;

/// How a parameter takes part in the search
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamMode {
    /// Held at its starting value
    Fixed,
    /// Estimated without a prior
    Free,
    /// Estimated with the log-prior around the reference value
    #[default]
    Prior,
}

impl ParamMode {
    /// Map the numeric convention (0 = fixed, 1 = free, 2 = prior)
    pub fn from_flag(flag: i32) -> Self {
        match flag {
            0 => ParamMode::Fixed,
            1 => ParamMode::Free,
            _ => ParamMode::Prior,
        }
    }

    #[inline]
    pub fn is_active(self) -> bool {
        self != ParamMode::Fixed
    }
}

/// Data, model and parameter settings of one fitting problem
///
/// `model(x, params, dyda)` returns the model value at `x` and writes the
/// partial derivatives with respect to every parameter into `dyda`.
pub struct PriorProblem<'a, F>
where
    F: Fn(f64, &[f64], &mut [f64]) -> f64,
{
    pub x: &'a [f64],
    pub y: &'a [f64],
    pub modes: &'a [ParamMode],
    pub prior_means: &'a [f64],
    pub model: F,
}

/// Curvature, gradient and log probability at one parameter vector
#[derive(Clone, Debug)]
pub struct Coefficients {
    /// Negative Hessian over the active parameters
    pub alpha: Array2<f64>,
    /// Gradient over the active parameters
    pub beta: Array1<f64>,
    pub logprob: f64,
}

impl<'a, F> PriorProblem<'a, F>
where
    F: Fn(f64, &[f64], &mut [f64]) -> f64,
{
    /// Indices of the parameters being estimated
    pub fn active(&self) -> Vec<usize> {
        self.modes
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_active())
            .map(|(i, _)| i)
            .collect()
    }

    /// Evaluate curvature, gradient and log probability at `a`
    ///
    /// # Returns
    /// `None` when a prior parameter is not positive or the result is not
    /// finite
    pub fn coefficients(&self, a: &[f64]) -> Option<Coefficients> {
        let active = self.active();
        let mfit = active.len();
        let ndata = self.x.len().min(self.y.len());
        let mut alpha = Array2::<f64>::zeros((mfit, mfit));
        let mut beta = Array1::<f64>::zeros(mfit);
        let mut dyda = vec![0.0; a.len()];

        let mut sum_sq = 0.0;
        for i in 0..ndata {
            let ymod = (self.model)(self.x[i], a, &mut dyda);
            let dy = self.y[i] - ymod;
            sum_sq += dy * dy;
            for (j, &pj) in active.iter().enumerate() {
                for (k, &pk) in active.iter().enumerate().take(j + 1) {
                    alpha[[j, k]] += dyda[pj] * dyda[pk];
                }
                beta[j] += dy * dyda[pj];
            }
        }
        let sum_sq = sum_sq.max(MIN_SUM_SQUARES);
        let n = ndata as f64;
        let mut logprob = -(n / 2.0) * (sum_sq / 2.0).ln();

        let scale = n / sum_sq;
        for j in 0..mfit {
            for k in 0..=j {
                alpha[[j, k]] *= scale;
            }
            beta[j] *= scale;
        }

        for (j, &p) in active.iter().enumerate() {
            if self.modes[p] != ParamMode::Prior {
                continue;
            }
            let aj = a[p];
            if !(aj > 0.0) {
                return None;
            }
            let mean = self.prior_means[p];
            let den = mean * mean + aj * aj;
            logprob += (aj / den).ln();
            beta[j] += 1.0 / aj - 2.0 * aj / den;
            alpha[[j, j]] += 1.0 / (aj * aj) + 2.0 / den - 4.0 * aj * aj / (den * den);
        }

        // Mirror the lower triangle
        for j in 1..mfit {
            for k in 0..j {
                alpha[[k, j]] = alpha[[j, k]];
            }
        }

        if !logprob.is_finite() || alpha.iter().chain(beta.iter()).any(|v| !v.is_finite()) {
            return None;
        }
        Some(Coefficients { alpha, beta, logprob })
    }
}

/// Optimizer state of one restart
///
/// Scoped to a single run from one starting point; dropped once the best
/// restart has been chosen.
#[derive(Clone, Debug)]
pub struct MarquardtState {
    alpha: Array2<f64>,
    beta: Array1<f64>,
    alamda: f64,
    relax: f64,
    ologprob: f64,
    active: Vec<usize>,
}

impl MarquardtState {
    /// Initialize at the starting parameters `a`
    pub fn new<F>(problem: &PriorProblem<'_, F>, a: &[f64]) -> Self
    where
        F: Fn(f64, &[f64], &mut [f64]) -> f64,
    {
        let active = problem.active();
        let mfit = active.len();
        let (alpha, beta, ologprob) = match problem.coefficients(a) {
            Some(c) => (c.alpha, c.beta, c.logprob),
            None => (Array2::zeros((mfit, mfit)), Array1::zeros(mfit), FAILED_LOGPROB),
        };
        Self {
            alpha,
            beta,
            alamda: INITIAL_LAMBDA,
            relax: INITIAL_RELAX,
            ologprob,
            active,
        }
    }

    /// Log probability of the current (last accepted) parameters
    #[inline]
    pub fn logprob(&self) -> f64 {
        self.ologprob
    }

    /// Current damping factor
    #[inline]
    pub fn lambda(&self) -> f64 {
        self.alamda
    }

    /// Current step relaxation factor
    #[inline]
    pub fn relax(&self) -> f64 {
        self.relax
    }

    /// Attempt one damped step, updating `a` in place on success
    ///
    /// # Returns
    /// The log probability after the step: the improved value on
    /// acceptance, the unchanged value on rejection, or `FAILED_LOGPROB`
    /// when the damped system is singular
    pub fn step<F>(&mut self, problem: &PriorProblem<'_, F>, a: &mut [f64]) -> f64
    where
        F: Fn(f64, &[f64], &mut [f64]) -> f64,
    {
        let mfit = self.active.len();
        if mfit == 0 {
            return self.ologprob;
        }

        let mut covar = self.alpha.clone();
        for j in 0..mfit {
            covar[[j, j]] *= 1.0 + self.alamda;
        }
        let mut da = Array2::<f64>::zeros((mfit, 1));
        for j in 0..mfit {
            da[[j, 0]] = self.beta[j];
        }
        if gauss_jordan(&mut covar, &mut da).is_err() {
            self.alamda *= 10.0;
            return FAILED_LOGPROB;
        }

        let mut atry = a.to_vec();
        for (j, &p) in self.active.iter().enumerate() {
            atry[p] = a[p] + da[[j, 0]] * self.relax;
        }

        match problem.coefficients(&atry) {
            Some(trial) if trial.logprob > self.ologprob => {
                self.relax = self.relax.sqrt();
                self.alamda *= 0.1;
                self.ologprob = trial.logprob;
                self.alpha = trial.alpha;
                self.beta = trial.beta;
                a.copy_from_slice(&atry);
            }
            _ => {
                self.alamda *= 10.0;
            }
        }
        self.ologprob
    }

    /// Parameter covariance at the current solution
    ///
    /// Inverse of the undamped curvature, expanded to the full parameter
    /// vector with zero rows and columns for fixed parameters.
    ///
    /// # Returns
    /// `None` if the curvature matrix is singular
    pub fn covariance(&self, n_params: usize) -> Option<Array2<f64>> {
        let mfit = self.active.len();
        let mut inv = self.alpha.clone();
        let mut rhs = Array2::<f64>::zeros((mfit, 1));
        gauss_jordan(&mut inv, &mut rhs).ok()?;

        let mut covar = Array2::<f64>::zeros((n_params, n_params));
        for (j, &pj) in self.active.iter().enumerate() {
            for (k, &pk) in self.active.iter().enumerate() {
                covar[[pj, pk]] = inv[[j, k]];
            }
        }
        Some(covar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn line(x: f64, a: &[f64], dyda: &mut [f64]) -> f64 {
        dyda[0] = 1.0;
        dyda[1] = x;
        a[0] + a[1] * x
    }

    fn decay(t: f64, a: &[f64], dyda: &mut [f64]) -> f64 {
        let e = (-t * a[1]).exp();
        dyda[0] = e;
        dyda[1] = -a[0] * t * e;
        a[0] * e
    }

    // ========================================================================
    // Coefficients
    // ========================================================================

    #[test]
    fn test_param_mode_from_flag() {
        assert_eq!(ParamMode::from_flag(0), ParamMode::Fixed);
        assert_eq!(ParamMode::from_flag(1), ParamMode::Free);
        assert_eq!(ParamMode::from_flag(2), ParamMode::Prior);
        assert!(!ParamMode::Fixed.is_active());
    }

    #[test]
    fn test_coefficients_free_line() {
        let x = [0.0, 1.0, 2.0];
        let y = [1.0, 2.0, 4.0];
        let modes = [ParamMode::Free, ParamMode::Free];
        let problem = PriorProblem { x: &x, y: &y, modes: &modes, prior_means: &[0.0, 0.0], model: line };

        // Model y = 1 + x: residuals (0, 0, 1)
        let c = problem.coefficients(&[1.0, 1.0]).unwrap();
        let scale = 3.0 / 1.0;
        assert_abs_diff_eq!(c.alpha[[0, 0]], 3.0 * scale, epsilon = 1e-12);
        assert_abs_diff_eq!(c.alpha[[0, 1]], 3.0 * scale, epsilon = 1e-12);
        assert_abs_diff_eq!(c.alpha[[1, 0]], 3.0 * scale, epsilon = 1e-12);
        assert_abs_diff_eq!(c.alpha[[1, 1]], 5.0 * scale, epsilon = 1e-12);
        assert_abs_diff_eq!(c.beta[0], 1.0 * scale, epsilon = 1e-12);
        assert_abs_diff_eq!(c.beta[1], 2.0 * scale, epsilon = 1e-12);
        assert_abs_diff_eq!(c.logprob, -1.5 * 0.5_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_coefficients_fixed_parameter_excluded() {
        let x = [0.0, 1.0, 2.0];
        let y = [1.0, 2.0, 4.0];
        let modes = [ParamMode::Fixed, ParamMode::Free];
        let problem = PriorProblem { x: &x, y: &y, modes: &modes, prior_means: &[0.0, 0.0], model: line };
        let c = problem.coefficients(&[1.0, 1.0]).unwrap();
        assert_eq!(c.alpha.dim(), (1, 1));
        assert_eq!(c.beta.len(), 1);
    }

    #[test]
    fn test_prior_gradient_matches_finite_difference() {
        let t = [0.015, 0.028, 0.042, 0.056];
        let y: Vec<f64> = t.iter().map(|&ti| 1000.0 * (-ti * 25.0_f64).exp() + 3.0 * ti).collect();
        let modes = [ParamMode::Prior, ParamMode::Prior];
        let means = [900.0, 20.0];
        let problem = PriorProblem { x: &t, y: &y, modes: &modes, prior_means: &means, model: decay };

        let a = [950.0, 22.0];
        let c = problem.coefficients(&a).unwrap();
        let h = 1e-4;
        for p in 0..2 {
            let mut up = a;
            let mut dn = a;
            up[p] += h;
            dn[p] -= h;
            let lp_up = problem.coefficients(&up).unwrap().logprob;
            let lp_dn = problem.coefficients(&dn).unwrap().logprob;
            let numeric = (lp_up - lp_dn) / (2.0 * h);
            assert_abs_diff_eq!(c.beta[p], numeric, epsilon = 1e-3 * numeric.abs().max(1.0));
        }
    }

    #[test]
    fn test_prior_rejects_non_positive() {
        let t = [0.01, 0.02];
        let y = [100.0, 80.0];
        let modes = [ParamMode::Prior, ParamMode::Prior];
        let problem = PriorProblem { x: &t, y: &y, modes: &modes, prior_means: &[100.0, 20.0], model: decay };
        assert!(problem.coefficients(&[100.0, -1.0]).is_none());
    }

    // ========================================================================
    // Steps
    // ========================================================================

    #[test]
    fn test_steps_increase_logprob_and_converge() {
        let t = [0.015, 0.028, 0.042, 0.056];
        let y: Vec<f64> = t.iter().map(|&ti| 800.0 * (-ti * 30.0_f64).exp()).collect();
        let modes = [ParamMode::Free, ParamMode::Free];
        let problem = PriorProblem { x: &t, y: &y, modes: &modes, prior_means: &[800.0, 30.0], model: decay };

        let mut a = [700.0, 25.0];
        let mut state = MarquardtState::new(&problem, &a);
        let mut previous = state.logprob();
        for _ in 0..200 {
            let lp = state.step(&problem, &mut a);
            assert!(lp >= previous);
            previous = lp;
        }
        assert_abs_diff_eq!(a[0], 800.0, epsilon = 1e-3);
        assert_abs_diff_eq!(a[1], 30.0, epsilon = 1e-4);
        assert!(state.relax() > INITIAL_RELAX);
    }

    #[test]
    fn test_rejected_step_keeps_parameters() {
        let t = [0.015, 0.028, 0.042, 0.056];
        let y: Vec<f64> = t.iter().map(|&ti| 800.0 * (-ti * 30.0_f64).exp()).collect();
        let modes = [ParamMode::Free, ParamMode::Free];
        let problem = PriorProblem { x: &t, y: &y, modes: &modes, prior_means: &[800.0, 30.0], model: decay };

        // Already at the optimum (up to the residual floor): no improvement possible
        let mut a = [800.0, 30.0];
        let mut state = MarquardtState::new(&problem, &a);
        let before = state.logprob();
        let lambda = state.lambda();
        state.step(&problem, &mut a);
        if state.logprob() == before {
            assert_eq!(a, [800.0, 30.0]);
            assert_abs_diff_eq!(state.lambda(), lambda * 10.0, epsilon = 1e-15);
        }
    }

    #[test]
    fn test_singular_step_reports_sentinel() {
        // Zero signal derivative for R2* at S0 = 0 makes the system singular
        let t = [0.01, 0.02, 0.03];
        let y = [1.0, 2.0, 3.0];
        let modes = [ParamMode::Fixed, ParamMode::Free];
        let problem = PriorProblem { x: &t, y: &y, modes: &modes, prior_means: &[0.0, 1.0], model: decay };
        let mut a = [0.0, 10.0];
        let mut state = MarquardtState::new(&problem, &a);
        assert_eq!(state.step(&problem, &mut a), FAILED_LOGPROB);
        assert_eq!(a, [0.0, 10.0]);
        assert!(state.covariance(2).is_none());
    }

    #[test]
    fn test_covariance_expands_fixed_parameters() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 3.1, 4.9, 7.0];
        let modes = [ParamMode::Fixed, ParamMode::Free];
        let problem = PriorProblem { x: &x, y: &y, modes: &modes, prior_means: &[0.0, 0.0], model: line };
        let state = MarquardtState::new(&problem, &[1.0, 2.0]);
        let covar = state.covariance(2).unwrap();
        assert_eq!(covar[[0, 0]], 0.0);
        assert_eq!(covar[[0, 1]], 0.0);
        assert!(covar[[1, 1]] > 0.0);
    }
}

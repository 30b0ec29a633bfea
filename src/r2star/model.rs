//! Mono-exponential transverse decay `S(t) = S0 * exp(-t * R2*)`

/// Index of S0 in a parameter vector
pub const S0: usize = 0;
/// Index of R2* in a parameter vector
pub const R2STAR: usize = 1;

/// Model signal at echo time `te`
#[inline]
pub fn signal(te: f64, s0: f64, r2star: f64) -> f64 {
    s0 * (-te * r2star).exp()
}

/// Model signal and its partial derivatives
///
/// `params` is `[S0, R2*]`; `dyda` receives `[∂S/∂S0, ∂S/∂R2*]`.
#[inline]
pub fn decay_with_gradient(te: f64, params: &[f64], dyda: &mut [f64]) -> f64 {
    let e = (-te * params[R2STAR]).exp();
    dyda[S0] = e;
    dyda[R2STAR] = -params[S0] * te * e;
    params[S0] * e
}

/// Root-mean-square difference between samples and model over all echoes
///
/// Non-finite samples are skipped.
pub fn rms_residual(echo_times: &[f64], samples: &[f64], s0: f64, r2star: f64) -> f64 {
    let mut ss = 0.0;
    let mut n = 0usize;
    for (&te, &y) in echo_times.iter().zip(samples) {
        if !y.is_finite() {
            continue;
        }
        let d = y - signal(te, s0, r2star);
        ss += d * d;
        n += 1;
    }
    if n == 0 {
        return 0.0;
    }
    (ss / n as f64).sqrt()
}

/// True when both parameters are positive and finite
#[inline]
pub fn is_physical(s0: f64, r2star: f64) -> bool {
    s0 > 0.0 && r2star > 0.0 && s0.is_finite() && r2star.is_finite()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_signal() {
        assert_abs_diff_eq!(signal(0.0, 1000.0, 20.0), 1000.0, epsilon = 1e-12);
        assert_abs_diff_eq!(signal(0.05, 1000.0, 20.0), 1000.0 * (-1.0_f64).exp(), epsilon = 1e-9);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let te = 0.03;
        let p = [800.0, 25.0];
        let mut dyda = [0.0; 2];
        decay_with_gradient(te, &p, &mut dyda);
        let h = 1e-6;
        let ds0 = (signal(te, p[0] + h, p[1]) - signal(te, p[0] - h, p[1])) / (2.0 * h);
        let dr2 = (signal(te, p[0], p[1] + h) - signal(te, p[0], p[1] - h)) / (2.0 * h);
        assert_abs_diff_eq!(dyda[S0], ds0, epsilon = 1e-6);
        assert_abs_diff_eq!(dyda[R2STAR], dr2, epsilon = 1e-4);
    }

    #[test]
    fn test_rms_residual() {
        let tes = [0.01, 0.02, 0.03];
        let exact: Vec<f64> = tes.iter().map(|&t| signal(t, 500.0, 30.0)).collect();
        assert_abs_diff_eq!(rms_residual(&tes, &exact, 500.0, 30.0), 0.0, epsilon = 1e-10);

        let shifted: Vec<f64> = exact.iter().map(|v| v + 2.0).collect();
        assert_abs_diff_eq!(rms_residual(&tes, &shifted, 500.0, 30.0), 2.0, epsilon = 1e-10);

        let mut partial = shifted.clone();
        partial[2] = f64::NAN;
        assert_abs_diff_eq!(rms_residual(&tes, &partial, 500.0, 30.0), 2.0, epsilon = 1e-10);
    }

    #[test]
    fn test_is_physical() {
        assert!(is_physical(1.0, 1.0));
        assert!(!is_physical(0.0, 1.0));
        assert!(!is_physical(1.0, -1.0));
        assert!(!is_physical(f64::NAN, 1.0));
        assert!(!is_physical(1.0, f64::INFINITY));
    }
}

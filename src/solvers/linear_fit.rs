//! Closed-form straight-line least squares
//!
//! Fits `y = a + b*x`, optionally weighted by per-point standard deviations
//! `sig` (weight `1/sig²`). Used on `ln(signal)` vs. echo time, where
//! `a = ln(S0)` and `b = -R2*`.
//!
//! Reference: Press et al., "Numerical Recipes", §15.2 (fitting data to a
//! straight line).

/// Result of a straight-line fit
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineFit {
    /// Intercept
    pub a: f64,
    /// Slope
    pub b: f64,
    /// Standard error of the intercept
    pub sig_a: f64,
    /// Standard error of the slope
    pub sig_b: f64,
    /// Chi-square (weighted) or residual sum of squares (unweighted)
    pub chi2: f64,
    /// Goodness-of-fit probability; 1.0 for unweighted fits
    pub q: f64,
    /// Linear correlation coefficient between x and y
    pub r: f64,
}

/// Weighted or unweighted least-squares line through `(x, y)`
///
/// # Arguments
/// * `x` - Abscissae (echo times)
/// * `y` - Ordinates (log signal)
/// * `sig` - Per-point standard deviations; `None` for an unweighted fit
///
/// # Returns
/// `None` with fewer than two points or zero (weighted) x-variance
pub fn fit_line(x: &[f64], y: &[f64], sig: Option<&[f64]>) -> Option<LineFit> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let weight = |i: usize| -> f64 {
        match sig {
            Some(s) => 1.0 / (s[i] * s[i]),
            None => 1.0,
        }
    };

    let mut ss = 0.0;
    let mut sx = 0.0;
    let mut sy = 0.0;
    for i in 0..n {
        let w = weight(i);
        ss += w;
        sx += x[i] * w;
        sy += y[i] * w;
    }
    if !(ss > 0.0) {
        return None;
    }
    let sxoss = sx / ss;

    // Centered abscissae for numerical stability
    let mut st2 = 0.0;
    let mut b = 0.0;
    for i in 0..n {
        let t = x[i] - sxoss;
        let w = weight(i);
        st2 += t * t * w;
        b += t * y[i] * w;
    }
    if !(st2 > 0.0) || !st2.is_finite() {
        return None;
    }
    b /= st2;
    let a = (sy - sx * b) / ss;
    let mut sig_a = ((1.0 + sx * sx / (ss * st2)) / ss).sqrt();
    let mut sig_b = (1.0 / st2).sqrt();

    let mut chi2 = 0.0;
    for i in 0..n {
        let d = y[i] - a - b * x[i];
        chi2 += d * d * weight(i);
    }

    let q = if sig.is_none() {
        // No per-point errors: scale by the scatter about the line
        if n > 2 {
            let sigdat = (chi2 / (n - 2) as f64).sqrt();
            sig_a *= sigdat;
            sig_b *= sigdat;
        }
        1.0
    } else if n > 2 {
        gammq(0.5 * (n - 2) as f64, 0.5 * chi2)
    } else {
        1.0
    };

    let r = correlation(x, y, n, &weight, sxoss, sy / ss);

    Some(LineFit { a, b, sig_a, sig_b, chi2, q, r })
}

/// Weighted Pearson correlation around precomputed means
fn correlation(x: &[f64], y: &[f64], n: usize, weight: &dyn Fn(usize) -> f64, x_mean: f64, y_mean: f64) -> f64 {
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for i in 0..n {
        let w = weight(i);
        let dx = x[i] - x_mean;
        let dy = y[i] - y_mean;
        sxy += w * dx * dy;
        sxx += w * dx * dx;
        syy += w * dy * dy;
    }
    let den = (sxx * syy).sqrt();
    if den > 0.0 {
        sxy / den
    } else {
        0.0
    }
}

/// Least-squares slope of `y = a + b*x` with the intercept `a` held fixed
///
/// Minimizes `Σ w (y - a - b x)²` over `b` only, so
/// `b = (Σw x y - a Σw x) / Σw x²`.
///
/// # Returns
/// `None` when there are no points or `Σw x²` vanishes
pub fn fit_fixed_intercept(x: &[f64], y: &[f64], sig: Option<&[f64]>, a: f64) -> Option<f64> {
    let n = x.len().min(y.len());
    if n == 0 {
        return None;
    }
    let mut sx = 0.0;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for i in 0..n {
        let w = match sig {
            Some(s) => 1.0 / (s[i] * s[i]),
            None => 1.0,
        };
        sx += x[i] * w;
        sxx += x[i] * x[i] * w;
        sxy += x[i] * y[i] * w;
    }
    if !(sxx > 0.0) {
        return None;
    }
    Some((sxy - a * sx) / sxx)
}

// ============================================================================
// Incomplete gamma function Q(a, x) = 1 - P(a, x)
// ============================================================================

const GAMMA_ITMAX: usize = 200;
const GAMMA_EPS: f64 = 1e-14;
const GAMMA_FPMIN: f64 = 1e-300;

/// Natural log of the gamma function (Lanczos approximation, x > 0)
pub fn ln_gamma(x: f64) -> f64 {
    const COF: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000_000_000_190_015;
    for c in COF {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * ser / x).ln()
}

/// Complementary regularized incomplete gamma function Q(a, x)
pub fn gammq(a: f64, x: f64) -> f64 {
    if !(a > 0.0) || x < 0.0 || !x.is_finite() {
        return if x.is_infinite() { 0.0 } else { 1.0 };
    }
    if x < a + 1.0 {
        1.0 - gamma_series(a, x)
    } else {
        gamma_continued_fraction(a, x)
    }
}

/// P(a, x) by its series representation
fn gamma_series(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let gln = ln_gamma(a);
    let mut ap = a;
    let mut del = 1.0 / a;
    let mut sum = del;
    for _ in 0..GAMMA_ITMAX {
        ap += 1.0;
        del *= x / ap;
        sum += del;
        if del.abs() < sum.abs() * GAMMA_EPS {
            break;
        }
    }
    sum * (-x + a * x.ln() - gln).exp()
}

/// Q(a, x) by its continued fraction (modified Lentz)
fn gamma_continued_fraction(a: f64, x: f64) -> f64 {
    let gln = ln_gamma(a);
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / GAMMA_FPMIN;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..=GAMMA_ITMAX {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < GAMMA_FPMIN {
            d = GAMMA_FPMIN;
        }
        c = b + an / c;
        if c.abs() < GAMMA_FPMIN {
            c = GAMMA_FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < GAMMA_EPS {
            break;
        }
    }
    (-x + a * x.ln() - gln).exp() * h
}

//! Unit cell refinement from an ensemble of indexed crystals.
//!
//! Each of the six cell constants is treated independently: the values are
//! binned into a histogram and a single Gaussian
//! f(x) = A × exp(-(x-μ)²/2σ²)
//! is fitted to the bin centers and counts with Levenberg-Marquardt. The fitted
//! μ is the refined constant. A fit which does not converge falls back to the
//! sample mean.
use super::error::CellFitError;

/// Number of histogram bins per cell constant
pub const N_BINS: usize = 10;

/// Names of the six cell constants, in fit order
pub const CONSTANT_NAMES: [&str; 6] = ["a", "b", "c", "alpha", "beta", "gamma"];

const HISTOGRAM_BAR_LENGTH: usize = 50;

/// Configuration for the Levenberg-Marquardt iterations
#[derive(Debug, Clone)]
pub struct GaussFitConfig {
    pub max_iterations: usize,
    /// Relative parameter change below which the fit has converged
    pub step_tolerance: f64,
    /// Relative chi² decrease below which the fit has converged
    pub chi2_tolerance: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
}

impl Default for GaussFitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            step_tolerance: 1.0e-10,
            chi2_tolerance: 1.0e-12,
            initial_lambda: 0.001,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

/// Result of refining one cell constant
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitOutcome {
    Fitted {
        amplitude: f64,
        mean: f64,
        sigma: f64,
    },
    /// The fit did not converge; `mean` is the sample mean
    FellBack { mean: f64 },
}

impl FitOutcome {
    /// The refined value of the constant
    pub fn value(&self) -> f64 {
        match self {
            Self::Fitted { mean, .. } => *mean,
            Self::FellBack { mean } => *mean,
        }
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self, Self::Fitted { .. })
    }
}

/// Equal width histogram over the sample range
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
}

impl Histogram {
    pub fn centers(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }

    /// Text bars scaled to the fullest bin, for the log
    pub fn bars(&self, length: usize) -> Vec<String> {
        let max_count = self.counts.iter().copied().max().unwrap_or(0).max(1);
        self.centers()
            .iter()
            .zip(self.counts.iter())
            .map(|(center, count)| {
                let n_marks = count * length / max_count;
                format!("{center:10.3} | {:<length$} {count}", "#".repeat(n_marks))
            })
            .collect()
    }
}

/// Bin `sample` into `n_bins` equal bins spanning its range.
///
/// The last bin is closed on the right. A sample with a single distinct value
/// gets the range value ± 0.5.
pub fn histogram(sample: &[f64], n_bins: usize) -> Histogram {
    let n_bins = n_bins.max(1);
    let (mut low, mut high) = sample_range(sample).unwrap_or((0.0, 1.0));
    if low == high {
        low -= 0.5;
        high += 0.5;
    }
    let width = (high - low) / n_bins as f64;
    let edges: Vec<f64> = (0..=n_bins)
        .map(|idx| {
            if idx == n_bins {
                high
            } else {
                low + width * idx as f64
            }
        })
        .collect();

    let mut counts = vec![0; n_bins];
    for value in sample.iter().filter(|value| value.is_finite()) {
        let mut bin = (((value - low) / (high - low)) * n_bins as f64).floor() as usize;
        bin = bin.min(n_bins - 1);
        if bin > 0 && *value < edges[bin] {
            bin -= 1;
        } else if bin < n_bins - 1 && *value >= edges[bin + 1] {
            bin += 1;
        }
        counts[bin] += 1;
    }
    Histogram { edges, counts }
}

fn sample_range(sample: &[f64]) -> Option<(f64, f64)> {
    sample
        .iter()
        .filter(|value| value.is_finite())
        .fold(None, |range, &value| match range {
            None => Some((value, value)),
            Some((low, high)) => Some((value.min(low), value.max(high))),
        })
}

/// Mean and (population) standard deviation; a constant sample gives exactly
/// that constant and zero.
fn moments(sample: &[f64]) -> (f64, f64) {
    if let Some((low, high)) = sample_range(sample) {
        if low == high {
            return (low, 0.0);
        }
    }
    let n = sample.len() as f64;
    let mean = sample.iter().sum::<f64>() / n;
    let variance = sample.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

fn gaussian(x: f64, params: &[f64; 3]) -> f64 {
    let [amplitude, mean, sigma] = *params;
    amplitude * (-(x - mean).powi(2) / (2.0 * sigma * sigma)).exp()
}

fn compute_chi2(xs: &[f64], ys: &[f64], params: &[f64; 3]) -> f64 {
    xs.iter()
        .zip(ys)
        .map(|(x, y)| (y - gaussian(*x, params)).powi(2))
        .sum()
}

/// J^T J and J^T r for the current parameters
fn normal_equations(xs: &[f64], ys: &[f64], params: &[f64; 3]) -> ([[f64; 3]; 3], [f64; 3]) {
    let [amplitude, mean, sigma] = *params;
    let mut hessian = [[0.0; 3]; 3];
    let mut gradient = [0.0; 3];
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean;
        let exponential = (-dx * dx / (2.0 * sigma * sigma)).exp();
        let residual = y - amplitude * exponential;
        let jacobian = [
            exponential,
            amplitude * exponential * dx / (sigma * sigma),
            amplitude * exponential * dx * dx / (sigma * sigma * sigma),
        ];
        for i in 0..3 {
            gradient[i] += jacobian[i] * residual;
            for j in 0..3 {
                hessian[i][j] += jacobian[i] * jacobian[j];
            }
        }
    }
    (hessian, gradient)
}

/// Solve a small dense system with partial pivoting; None if singular
fn solve<const N: usize>(mut a: [[f64; N]; N], mut b: [f64; N]) -> Option<[f64; N]> {
    let scale = a
        .iter()
        .flatten()
        .fold(0.0_f64, |max, value| max.max(value.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }

    for col in 0..N {
        let pivot = (col..N).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() <= f64::EPSILON * scale {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..N {
            let factor = a[row][col] / a[col][col];
            for k in col..N {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; N];
    for row in (0..N).rev() {
        let tail: f64 = ((row + 1)..N).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

/// Levenberg-Marquardt from `initial`; None if it did not converge
fn levenberg_marquardt(
    xs: &[f64],
    ys: &[f64],
    initial: [f64; 3],
    config: &GaussFitConfig,
) -> Option<[f64; 3]> {
    let mut params = initial;
    let mut lambda = config.initial_lambda;
    let mut chi2 = compute_chi2(xs, ys, &params);
    if !chi2.is_finite() {
        return None;
    }

    for _ in 0..config.max_iterations {
        if chi2 == 0.0 {
            return Some(params);
        }
        let (hessian, gradient) = normal_equations(xs, ys, &params);
        let mut damped = hessian;
        for (i, row) in damped.iter_mut().enumerate() {
            row[i] *= 1.0 + lambda;
        }
        let delta = solve(damped, gradient)?;

        let step = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
        let norm = params.iter().map(|p| p * p).sum::<f64>().sqrt();
        if step <= config.step_tolerance * (norm + config.step_tolerance) {
            return Some(params);
        }

        let mut new_params = params;
        for (p, d) in new_params.iter_mut().zip(delta.iter()) {
            *p += d;
        }
        let new_chi2 = compute_chi2(xs, ys, &new_params);

        if new_chi2.is_finite() && new_chi2 <= chi2 {
            let improvement = chi2 - new_chi2;
            params = new_params;
            lambda *= config.lambda_down;
            if improvement <= config.chi2_tolerance * chi2 {
                return Some(params);
            }
            chi2 = new_chi2;
        } else {
            lambda *= config.lambda_up;
        }
    }
    None
}

/// Fit a Gaussian to the histogram of `sample` and report its mean.
///
/// Non-finite values are left out. The initial guess is (count / 2, sample mean,
/// sample standard deviation). Any failure (degenerate sample, singular system, no convergence, or a mean
/// outside the sample range) falls back to the sample mean.
pub fn fit_gauss_curve(sample: &[f64], config: &GaussFitConfig) -> FitOutcome {
    let finite: Vec<f64> = sample.iter().copied().filter(|value| value.is_finite()).collect();
    let sample = finite.as_slice();
    let (mean, std) = moments(sample);
    let fallback = FitOutcome::FellBack { mean };
    let Some((low, high)) = sample_range(sample) else {
        return fallback;
    };
    if std == 0.0 || !std.is_finite() {
        return fallback;
    }

    let hist = histogram(sample, N_BINS);
    let xs = hist.centers();
    let ys: Vec<f64> = hist.counts.iter().map(|&count| count as f64).collect();
    let initial = [(sample.len() / 2) as f64, mean, std];

    match levenberg_marquardt(&xs, &ys, initial, config) {
        Some([amplitude, fit_mean, sigma])
            if amplitude.is_finite()
                && sigma.is_finite()
                && sigma != 0.0
                && fit_mean >= low
                && fit_mean <= high =>
        {
            FitOutcome::Fitted {
                amplitude,
                mean: fit_mean,
                sigma: sigma.abs(),
            }
        }
        _ => fallback,
    }
}

/// Refine each of the six cell constants of an ensemble of accepted crystals
pub fn fit_unit_cell(ensemble: &[[f64; 6]]) -> Result<[FitOutcome; 6], CellFitError> {
    if ensemble.is_empty() {
        return Err(CellFitError::EmptyEnsemble);
    }
    let config = GaussFitConfig::default();
    let outcomes: [FitOutcome; 6] = std::array::from_fn(|dimension| {
        let sample: Vec<f64> = ensemble.iter().map(|cell| cell[dimension]).collect();
        log::info!("Distribution of {}:", CONSTANT_NAMES[dimension]);
        for bar in histogram(&sample, N_BINS).bars(HISTOGRAM_BAR_LENGTH) {
            log::info!("{bar}");
        }
        let outcome = fit_gauss_curve(&sample, &config);
        match outcome {
            FitOutcome::Fitted { mean, sigma, .. } => log::info!(
                "Refined {} = {mean:.3} (sigma {sigma:.3})",
                CONSTANT_NAMES[dimension]
            ),
            FitOutcome::FellBack { mean } => log::warn!(
                "Gaussian fit of {} did not converge; using the sample mean {mean:.3}",
                CONSTANT_NAMES[dimension]
            ),
        }
        outcome
    });
    Ok(outcomes)
}

/// The six refined values of [`fit_unit_cell`]
pub fn refined_constants(outcomes: &[FitOutcome; 6]) -> [f64; 6] {
    std::array::from_fn(|idx| outcomes[idx].value())
}

use crate::types::{PixelEstimate, StackError, StackResult, Vcm};
use nalgebra::{Cholesky, DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// How the robust estimation of one pixel ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// All whitened residuals within `nsig`
    Converged,
    /// Fewer than `pthresh` observations before any fit was attempted
    InsufficientSamples,
    /// Outlier rejection dropped the count below `pthresh`
    Exhausted,
    /// VCM subset not positive definite, design rank deficient, or an
    /// observation index outside the supplied inputs
    NumericalSingularity,
}

/// Estimate plus the history of the rejection loop
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorTrace {
    pub estimate: PixelEstimate,
    pub termination: Termination,
    /// Number of least-squares fits performed
    pub iterations: usize,
    /// Observation indices dropped as outliers, in rejection order
    pub rejected: Vec<usize>,
}

/// Rejection loop states
#[derive(Debug)]
enum EstimatorState {
    Collecting,
    Estimating,
    Rejected { observation: usize },
    Converged(PixelEstimate),
    Exhausted(Termination),
}

/// One weighted least-squares fit over the active observations
#[derive(Debug)]
struct WeightedFit {
    rate: f64,
    error: f64,
    /// Position (within the active set) and magnitude of the largest whitened residual
    worst_position: usize,
    worst_residual: f64,
}

/// Iterative robust weighted least-squares rate estimator for a single pixel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelEstimator {
    /// Outlier threshold on whitened residuals (n-sigma)
    pub nsig: f64,
    /// Minimum number of observations for an estimate
    pub pthresh: usize,
}

impl PixelEstimator {
    pub fn new(nsig: f64, pthresh: usize) -> Self {
        Self { nsig, pthresh }
    }

    /// Estimate rate, standard error and sample count for one pixel.
    ///
    /// `independent` holds the observation indices selected for this pixel;
    /// `time_spans` and `phase` are indexed by observation over the full stack.
    /// An index outside `time_spans`, `phase` or the VCM yields an unresolved
    /// estimate.
    pub fn estimate(
        &self,
        independent: &[usize],
        time_spans: &[f64],
        vcm: &Vcm,
        phase: &[f64],
    ) -> PixelEstimate {
        self.estimate_traced(independent, time_spans, vcm, phase).estimate
    }

    /// Same as [`estimate`](Self::estimate), also reporting iterations and rejections
    pub fn estimate_traced(
        &self,
        independent: &[usize],
        time_spans: &[f64],
        vcm: &Vcm,
        phase: &[f64],
    ) -> EstimatorTrace {
        let original_count = independent.len();
        let mut active: Vec<usize> = Vec::with_capacity(original_count);
        let mut rejected = Vec::new();
        let mut iterations = 0;
        let mut state = EstimatorState::Collecting;

        loop {
            state = match state {
                EstimatorState::Collecting => {
                    active.extend_from_slice(independent);
                    if let Err(e) = check_inputs(&active, time_spans, vcm, phase) {
                        log::debug!("Pixel inputs rejected: {}", e);
                        EstimatorState::Exhausted(Termination::NumericalSingularity)
                    } else if active.len() < self.pthresh {
                        EstimatorState::Exhausted(Termination::InsufficientSamples)
                    } else {
                        EstimatorState::Estimating
                    }
                }
                EstimatorState::Estimating => {
                    iterations += 1;
                    match weighted_fit(&active, time_spans, vcm, phase) {
                        Ok(fit) if fit.worst_residual > self.nsig => EstimatorState::Rejected {
                            observation: active.remove(fit.worst_position),
                        },
                        Ok(fit) => EstimatorState::Converged(PixelEstimate {
                            rate: fit.rate,
                            error: fit.error,
                            samples: active.len(),
                        }),
                        Err(e) => {
                            log::trace!("Pixel fit abandoned: {}", e);
                            EstimatorState::Exhausted(Termination::NumericalSingularity)
                        }
                    }
                }
                EstimatorState::Rejected { observation } => {
                    rejected.push(observation);
                    if active.len() < self.pthresh {
                        EstimatorState::Exhausted(Termination::Exhausted)
                    } else {
                        EstimatorState::Estimating
                    }
                }
                EstimatorState::Converged(estimate) => {
                    return EstimatorTrace {
                        estimate,
                        termination: Termination::Converged,
                        iterations,
                        rejected,
                    };
                }
                EstimatorState::Exhausted(termination) => {
                    return EstimatorTrace {
                        estimate: PixelEstimate::unresolved(original_count),
                        termination,
                        iterations,
                        rejected,
                    };
                }
            };
        }
    }
}

/// Every active index must address `time_spans`, `phase` and a square VCM
fn check_inputs(active: &[usize], time_spans: &[f64], vcm: &Vcm, phase: &[f64]) -> StackResult<()> {
    let (rows, cols) = vcm.dim();
    if rows != cols {
        return Err(StackError::Configuration(format!(
            "VCM must be square, got {}x{}",
            rows, cols
        )));
    }
    let limit = time_spans.len().min(phase.len()).min(rows);
    match active.iter().find(|&&index| index >= limit) {
        Some(index) => Err(StackError::Configuration(format!(
            "observation index {} outside {} time spans, {} phases and a {}x{} VCM",
            index,
            time_spans.len(),
            phase.len(),
            rows,
            cols
        ))),
        None => Ok(()),
    }
}

/// Whitened least-squares fit of `phase = rate * span` over the active observations.
fn weighted_fit(
    active: &[usize],
    time_spans: &[f64],
    vcm: &Vcm,
    phase: &[f64],
) -> StackResult<WeightedFit> {
    let n = active.len();
    if n == 0 {
        return Err(StackError::InsufficientSamples { found: 0, required: 1 });
    }

    let design = DMatrix::from_fn(n, 1, |i, _| time_spans[active[i]]);
    let observed = DVector::from_fn(n, |i, _| phase[active[i]]);
    let vcm_sub = DMatrix::from_fn(n, n, |i, j| vcm[[active[i], active[j]]]);

    let chol = Cholesky::new(vcm_sub)
        .ok_or_else(|| singular("VCM subset is not positive definite"))?;
    let lower = chol.l();

    // Whiten design and observations with the lower Cholesky factor
    let design_w = lower
        .solve_lower_triangular(&design)
        .ok_or_else(|| singular("whitening of design matrix failed"))?;
    let observed_w = lower
        .solve_lower_triangular(&observed)
        .ok_or_else(|| singular("whitening of observations failed"))?;

    // Column-pivoted economy QR, then back-substitution
    let qr = design_w.col_piv_qr();
    let z = qr.q().tr_mul(&observed_w);
    let mut velocity = qr
        .r()
        .solve_upper_triangular(&z)
        .ok_or_else(|| singular("whitened design is rank deficient"))?;
    qr.p().inv_permute_rows(&mut velocity);

    // Standard error from the normal matrix B' V^-1 B
    let vcm_inv = chol.inverse();
    let normal = design.transpose() * &vcm_inv * &design;
    let covariance = normal
        .try_inverse()
        .ok_or_else(|| singular("normal matrix is singular"))?;
    let error = covariance[(0, 0)].sqrt();

    let residuals = &design * &velocity - &observed;

    // Residuals scaled by the upper Cholesky factor of V^-1
    let weight = Cholesky::new(vcm_inv)
        .ok_or_else(|| singular("inverse VCM subset is not positive definite"))?;
    let whitened = weight.l().tr_mul(&residuals);

    let mut worst_position = 0;
    let mut worst_residual = f64::NEG_INFINITY;
    for (position, value) in whitened.iter().enumerate() {
        let magnitude = value.abs();
        if !magnitude.is_finite() {
            return Err(singular("non-finite whitened residual"));
        }
        if magnitude > worst_residual {
            worst_position = position;
            worst_residual = magnitude;
        }
    }

    Ok(WeightedFit {
        rate: velocity[0],
        error,
        worst_position,
        worst_residual,
    })
}

fn singular(reason: &str) -> StackError {
    StackError::NumericalSingularity(reason.to_string())
}

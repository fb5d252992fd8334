//! Built-in penalized GAMM fitter.
//!
//! Fits `y = X beta + Z b + e`, `b_j ~ N(0, tau_j^2 I)`, by solving
//! Henderson's mixed-model equations with ridge penalties
//! `lambda_j = sigma^2 / tau_j^2`. Variance components are updated with
//! the Fellner–Schall fixed point `tau_j^2 = |b_j|^2 / edf_j`. AR1
//! residuals are handled by prewhitening rows within trajectories.
//!
//! Cross-products are formed once per fit; each iteration only factors
//! a (p + q) x (p + q) system.

use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};
use tracing::{debug, trace};

use super::design::{lag1_autocorrelation, Design};
use super::{
    FitError, FitRequest, FittedModel, ModelFitter, ParametricTerm, RhoKeyword, RhoSpec,
    SmoothTerm, VarianceComponent,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Variance-component iteration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GammConfig {
    /// Maximum Fellner–Schall iterations before `NonConvergence`.
    pub max_iterations: usize,
    /// Convergence threshold on the largest change in log(lambda).
    pub tolerance: f64,
    /// Penalty ceiling; a block at the ceiling is treated as a zero
    /// variance component (boundary solution).
    pub max_penalty: f64,
}

impl Default for GammConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-5,
            max_penalty: 1e6,
        }
    }
}

// ---------------------------------------------------------------------------
// Solver state
// ---------------------------------------------------------------------------

/// Cross-products of the (possibly prewhitened) design.
struct CrossProducts {
    wtw: DMatrix<f64>,
    wty: DVector<f64>,
    yty: f64,
    n: usize,
}

impl CrossProducts {
    fn new(design: &Design) -> Self {
        let wt = design.w.transpose();
        Self {
            wtw: &wt * &design.w,
            wty: &wt * &design.y,
            yty: design.y.dot(&design.y),
            n: design.n_obs(),
        }
    }
}

struct Solution {
    theta: DVector<f64>,
    /// Inverse of the penalized normal matrix.
    c_inv: DMatrix<f64>,
    sigma2: f64,
    /// Per random block: (tau^2, edf).
    components: Vec<(f64, f64)>,
    residual_df: f64,
    iterations: usize,
}

// ---------------------------------------------------------------------------
// Fitter
// ---------------------------------------------------------------------------

pub struct PenalizedGamm {
    config: GammConfig,
}

impl PenalizedGamm {
    pub fn new(config: GammConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GammConfig {
        &self.config
    }

    fn solve(&self, design: &Design, deadline: Option<Instant>) -> Result<Solution, FitError> {
        let cp = CrossProducts::new(design);
        let m = design.w.ncols();
        let mut lambdas = vec![1.0_f64; design.random.len()];

        for iteration in 1..=self.config.max_iterations {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(FitError::Timeout { iterations: iteration - 1 });
            }

            let mut a = cp.wtw.clone();
            for (block, &lambda) in design.random.iter().zip(&lambdas) {
                for c in block.cols.clone() {
                    a[(c, c)] += lambda;
                }
            }
            let chol = a.cholesky().ok_or_else(|| {
                FitError::RankDeficient(format!("penalized normal matrix ({m} columns) is not positive definite"))
            })?;
            let theta = chol.solve(&cp.wty);
            let c_inv = chol.inverse();

            let rss = (cp.yty - 2.0 * theta.dot(&cp.wty) + theta.dot(&(&cp.wtw * &theta))).max(0.0);

            let mut components = Vec::with_capacity(lambdas.len());
            let mut edf_total = design.n_fixed() as f64;
            for (block, &lambda) in design.random.iter().zip(&lambdas) {
                let trace: f64 = block.cols.clone().map(|c| c_inv[(c, c)]).sum();
                let edf = (block.cols.len() as f64 - lambda * trace).max(1e-8);
                edf_total += edf;
                let b2: f64 = block.cols.clone().map(|c| theta[c] * theta[c]).sum();
                components.push((b2, edf));
            }

            let residual_df = cp.n as f64 - edf_total;
            if residual_df <= 0.0 {
                return Err(FitError::RankDeficient("no residual degrees of freedom".into()));
            }
            let sigma2 = rss / residual_df;
            if rss <= 1e-10 * cp.yty || !sigma2.is_finite() {
                return Err(FitError::RankDeficient("residual variance collapsed to zero".into()));
            }

            let mut max_change = 0.0_f64;
            let mut next = Vec::with_capacity(lambdas.len());
            for (&(b2, edf), &lambda) in components.iter().zip(&lambdas) {
                let tau2 = b2 / edf;
                let proposed = if tau2 > 0.0 { sigma2 / tau2 } else { self.config.max_penalty };
                let proposed = proposed.clamp(1.0 / self.config.max_penalty, self.config.max_penalty);
                let at_ceiling = proposed >= self.config.max_penalty && lambda >= self.config.max_penalty;
                if !at_ceiling {
                    max_change = max_change.max((proposed.ln() - lambda.ln()).abs());
                }
                next.push(proposed);
            }
            trace!(iteration, sigma2, max_change, "Variance component update");

            if max_change < self.config.tolerance {
                let components = components
                    .iter()
                    .zip(&lambdas)
                    .map(|(&(_, edf), &lambda)| (sigma2 / lambda, edf))
                    .collect();
                return Ok(Solution {
                    theta,
                    c_inv,
                    sigma2,
                    components,
                    residual_df,
                    iterations: iteration,
                });
            }
            lambdas = next;
        }

        Err(FitError::NonConvergence { iterations: self.config.max_iterations })
    }

    fn summarize(
        &self,
        design: &Design,
        solution: &Solution,
        rho: Option<f64>,
    ) -> Result<FittedModel, FitError> {
        let df = solution.residual_df;
        let t_dist = StudentsT::new(0.0, 1.0, df)
            .map_err(|e| FitError::InvalidInput(format!("t distribution: {e}")))?;

        let mut parametric = Vec::new();
        let mut smooths = Vec::new();

        for block in &design.fixed {
            if block.is_parametric() {
                let c = block.cols.start;
                let estimate = solution.theta[c];
                let std_error = (solution.sigma2 * solution.c_inv[(c, c)]).max(0.0).sqrt();
                let t_value = if std_error > 0.0 { estimate / std_error } else { 0.0 };
                let p_value = (2.0 * t_dist.sf(t_value.abs())).min(1.0);
                parametric.push(ParametricTerm {
                    label: block.label.clone(),
                    role: block.role,
                    predictor: block.predictor.clone(),
                    estimate,
                    std_error,
                    t_value,
                    p_value,
                });
            } else {
                let r = block.cols.len();
                let beta = solution.theta.rows(block.cols.start, r).into_owned();
                let v = solution
                    .c_inv
                    .view((block.cols.start, block.cols.start), (r, r))
                    .into_owned()
                    * solution.sigma2;
                let v_chol = v.cholesky().ok_or_else(|| {
                    FitError::RankDeficient(format!("covariance of {} is singular", block.label))
                })?;
                let f_value = beta.dot(&v_chol.solve(&beta)) / r as f64;
                let f_dist = FisherSnedecor::new(r as f64, df)
                    .map_err(|e| FitError::InvalidInput(format!("F distribution: {e}")))?;
                smooths.push(SmoothTerm {
                    label: block.label.clone(),
                    role: block.role,
                    by: block.predictor.clone(),
                    rank: r,
                    f_value,
                    p_value: f_dist.sf(f_value),
                });
            }
        }

        let variance_components = design
            .random
            .iter()
            .zip(&solution.components)
            .map(|(block, &(variance, edf))| VarianceComponent {
                name: block.name.clone(),
                variance,
                edf,
            })
            .collect();

        Ok(FittedModel {
            parametric,
            smooths,
            variance_components,
            residual_variance: solution.sigma2,
            residual_df: df,
            rho,
            n_obs: design.n_obs(),
            iterations: solution.iterations,
        })
    }
}

impl Default for PenalizedGamm {
    fn default() -> Self {
        Self::new(GammConfig::default())
    }
}

impl ModelFitter for PenalizedGamm {
    fn fit(&self, request: &FitRequest) -> Result<FittedModel, FitError> {
        let mut design = Design::build(&request.spec, &request.observations, &request.predictor)?;

        let rho = match request.spec.ar1.map(|a| a.rho) {
            None => None,
            Some(RhoSpec::Fixed(rho)) => {
                if !(rho > -1.0 && rho < 1.0) {
                    return Err(FitError::InvalidInput(format!("AR1 rho {rho} outside (-1, 1)")));
                }
                Some(rho)
            }
            Some(RhoSpec::Keyword(RhoKeyword::Estimate)) => {
                let pilot = self.solve(&design, request.deadline)?;
                let residuals = &design.y - &design.w * &pilot.theta;
                let rho = lag1_autocorrelation(residuals.as_slice(), &design.new_trajectory);
                debug!(variant = %request.spec.name, rho, "Estimated AR1 rho from pilot fit");
                Some(rho)
            }
        };

        if let Some(rho) = rho {
            design.ar1_whiten(rho);
        }

        let solution = self.solve(&design, request.deadline)?;
        debug!(
            variant = %request.spec.name,
            n = design.n_obs(),
            columns = design.w.ncols(),
            iterations = solution.iterations,
            sigma2 = solution.sigma2,
            "Model fitted"
        );
        self.summarize(&design, &solution, rho)
    }

    fn name(&self) -> &str {
        "penalized-gamm"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Design matrix construction for the built-in fitter.
//!
//! Lays out `[X | Z]` as one dense matrix: fixed-effect blocks first
//! (intercept, group indicator, reference smooth, difference smooth),
//! then ridge-penalized random-effect blocks.

use std::collections::BTreeMap;
use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use super::basis::BSplineBasis;
use super::{FitError, Grouping, ModelSpec, RandomKind, TermRole};
use crate::types::{Group, Observation};

/// A block of unpenalized columns reported as one term.
#[derive(Debug, Clone)]
pub struct FixedBlock {
    pub label: String,
    pub role: TermRole,
    /// Predictor coded by the block (`GroupEffect` / `DifferenceSmooth` only).
    pub predictor: Option<String>,
    pub cols: Range<usize>,
}

impl FixedBlock {
    /// Parametric terms are single columns reported with a t-test.
    pub fn is_parametric(&self) -> bool {
        matches!(self.role, TermRole::Intercept | TermRole::GroupEffect)
    }
}

/// A block of ridge-penalized columns sharing one variance component.
#[derive(Debug, Clone)]
pub struct RandomBlock {
    pub name: String,
    pub cols: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct Design {
    pub w: DMatrix<f64>,
    pub y: DVector<f64>,
    pub new_trajectory: Vec<bool>,
    pub fixed: Vec<FixedBlock>,
    pub random: Vec<RandomBlock>,
}

impl Design {
    pub fn build(spec: &ModelSpec, obs: &[Observation], predictor: &str) -> Result<Self, FitError> {
        let n = obs.len();
        if n == 0 {
            return Err(FitError::InvalidInput("no observations".into()));
        }
        let basis = BSplineBasis::new(spec.basis_size).ok_or_else(|| {
            FitError::InvalidInput(format!("basis size {} is below 4", spec.basis_size))
        })?;

        let times: Vec<f64> = obs.iter().map(|o| o.time).collect();
        let smooth = basis.centered_design(&times);
        let indicator: Vec<f64> = obs.iter().map(|o| o.group.indicator()).collect();
        let n_b = obs.iter().filter(|o| o.group == Group::B).count();
        let has_contrast = n_b > 0 && n_b < n;
        if !has_contrast {
            debug!(n, n_b, "Predictor has no contrast, dropping its terms");
        }
        // Constant time collapses the centered basis to zero columns.
        let has_time = smooth.norm() > 1e-8 * (n as f64).sqrt();
        if !has_time {
            debug!(n, "No variation in time, dropping smooth terms");
        }

        let mut columns: Vec<DVector<f64>> = Vec::new();
        let mut fixed = Vec::new();

        let cols = push_block(&mut columns, vec![DVector::from_element(n, 1.0)]);
        fixed.push(FixedBlock {
            label: "(Intercept)".into(),
            role: TermRole::Intercept,
            predictor: None,
            cols,
        });

        if has_contrast {
            let cols = push_block(&mut columns, vec![DVector::from_vec(indicator.clone())]);
            fixed.push(FixedBlock {
                label: format!("{predictor}{}", Group::B),
                role: TermRole::GroupEffect,
                predictor: Some(predictor.to_string()),
                cols,
            });
        }

        if has_time {
            let cols = push_block(&mut columns, smooth.column_iter().map(|c| c.into_owned()).collect());
            fixed.push(FixedBlock {
                label: "s(time)".into(),
                role: TermRole::Smooth,
                predictor: None,
                cols,
            });
        }

        if spec.difference_smooth && has_contrast && has_time {
            let by_cols = smooth
                .column_iter()
                .map(|c| DVector::from_iterator(n, c.iter().zip(&indicator).map(|(v, g)| v * g)))
                .collect();
            let cols = push_block(&mut columns, by_cols);
            fixed.push(FixedBlock {
                label: format!("s(time):{predictor}{}", Group::B),
                role: TermRole::DifferenceSmooth,
                predictor: Some(predictor.to_string()),
                cols,
            });
        }

        let mut random = Vec::new();
        if let Some(re) = &spec.random {
            let level_of: Vec<usize> = match re.grouping {
                Grouping::Subject => obs.iter().map(|o| o.subject).collect(),
                Grouping::Trajectory => obs.iter().map(|o| o.trajectory).collect(),
            };
            let levels = dense_levels(&level_of);
            let n_levels = levels.len();
            if n_levels < 2 {
                return Err(FitError::InvalidInput(format!(
                    "random effect by {} needs at least 2 levels",
                    re.grouping
                )));
            }
            let level_idx: Vec<usize> = level_of.iter().map(|l| levels[l]).collect();

            let mut intercepts = vec![DVector::zeros(n); n_levels];
            for (i, &l) in level_idx.iter().enumerate() {
                intercepts[l][i] = 1.0;
            }
            let cols = push_block(&mut columns, intercepts);
            let name = match re.kind {
                RandomKind::Intercept => format!("s({})", re.grouping),
                RandomKind::Smooth => format!("s(time,{}):offset", re.grouping),
            };
            random.push(RandomBlock { name, cols });

            if re.kind == RandomKind::Smooth && has_time {
                let k = smooth.ncols();
                let mut wiggles = vec![DVector::zeros(n); n_levels * k];
                for (i, &l) in level_idx.iter().enumerate() {
                    for j in 0..k {
                        wiggles[l * k + j][i] = smooth[(i, j)];
                    }
                }
                let cols = push_block(&mut columns, wiggles);
                random.push(RandomBlock {
                    name: format!("s(time,{}):curve", re.grouping),
                    cols,
                });
            }
        }

        let total_cols = columns.len();
        if n <= total_cols {
            return Err(FitError::InvalidInput(format!(
                "{n} observations cannot support {total_cols} coefficients"
            )));
        }

        Ok(Self {
            w: DMatrix::from_columns(&columns),
            y: DVector::from_iterator(n, obs.iter().map(|o| o.response)),
            new_trajectory: obs.iter().map(|o| o.new_trajectory).collect(),
            fixed,
            random,
        })
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_fixed(&self) -> usize {
        self.fixed.last().map(|b| b.cols.end).unwrap_or(0)
    }

    /// Prewhiten response and design within trajectories for AR1 errors
    /// with coefficient `rho`.
    pub fn ar1_whiten(&mut self, rho: f64) {
        let scale = (1.0 - rho * rho).sqrt();
        ar1_transform(self.y.as_mut_slice(), &self.new_trajectory, rho, scale);
        let n = self.w.nrows();
        for j in 0..self.w.ncols() {
            for i in (1..n).rev() {
                if !self.new_trajectory[i] {
                    self.w[(i, j)] = (self.w[(i, j)] - rho * self.w[(i - 1, j)]) / scale;
                }
            }
        }
    }
}

/// In-place AR1 transform. Rows are walked backwards so each row is
/// differenced against its untransformed predecessor.
fn ar1_transform(values: &mut [f64], new_trajectory: &[bool], rho: f64, scale: f64) {
    for i in (1..values.len()).rev() {
        if !new_trajectory[i] {
            values[i] = (values[i] - rho * values[i - 1]) / scale;
        }
    }
}

/// Lag-1 autocorrelation of residuals within trajectories, clamped to (-0.99, 0.99).
pub fn lag1_autocorrelation(residuals: &[f64], new_trajectory: &[bool]) -> f64 {
    let denom: f64 = residuals.iter().map(|r| r * r).sum();
    if denom <= 0.0 {
        return 0.0;
    }
    let num: f64 = (1..residuals.len())
        .filter(|&i| !new_trajectory[i])
        .map(|i| residuals[i] * residuals[i - 1])
        .sum();
    (num / denom).clamp(-0.99, 0.99)
}

fn push_block(columns: &mut Vec<DVector<f64>>, new: Vec<DVector<f64>>) -> Range<usize> {
    let start = columns.len();
    columns.extend(new);
    start..columns.len()
}

fn dense_levels(raw: &[usize]) -> BTreeMap<usize, usize> {
    let mut levels = BTreeMap::new();
    for &r in raw {
        let next = levels.len();
        levels.entry(r).or_insert(next);
    }
    levels
}

//! Model fitting for labeled trajectory samples.
//!
//! Defines the `ModelFitter` trait (the boundary to whatever does the
//! actual regression), the formula-like `ModelSpec`, and the structured
//! `FittedModel` that statistic extraction reads from. The built-in
//! implementation lives in `gamm`.

pub mod basis;
pub mod design;
pub mod gamm;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::types::Observation;

// ---------------------------------------------------------------------------
// Model specification
// ---------------------------------------------------------------------------

/// Grouping factor for a random-effect term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
    Subject,
    Trajectory,
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grouping::Subject => write!(f, "subject"),
            Grouping::Trajectory => write!(f, "trajectory"),
        }
    }
}

/// Structure of a random-effect term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomKind {
    /// One shrunken offset per level.
    Intercept,
    /// One shrunken curve per level (offset and wiggly part penalized separately).
    Smooth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomEffect {
    pub grouping: Grouping,
    pub kind: RandomKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RhoKeyword {
    Estimate,
}

/// AR1 correlation coefficient: supplied, or estimated from the lag-1
/// autocorrelation of a pilot fit without AR1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RhoSpec {
    Fixed(f64),
    Keyword(RhoKeyword),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ar1Spec {
    pub rho: RhoSpec,
}

fn default_basis_size() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// One modelling strategy: `response ~ group + s(time) [+ s(time, by = group)]
/// [+ random term] [+ AR1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Number of B-spline basis functions per smooth (before the centering constraint).
    #[serde(default = "default_basis_size")]
    pub basis_size: usize,
    /// Include the group difference smooth `s(time, by = group)`.
    #[serde(default = "default_true")]
    pub difference_smooth: bool,
    #[serde(default)]
    pub random: Option<RandomEffect>,
    #[serde(default)]
    pub ar1: Option<Ar1Spec>,
}

impl ModelSpec {
    /// Plain GAM: fixed smooths only.
    pub fn naive(name: &str) -> Self {
        Self {
            name: name.to_string(),
            basis_size: default_basis_size(),
            difference_smooth: true,
            random: None,
            ar1: None,
        }
    }

    pub fn with_random(mut self, grouping: Grouping, kind: RandomKind) -> Self {
        self.random = Some(RandomEffect { grouping, kind });
        self
    }

    pub fn with_ar1(mut self, rho: RhoSpec) -> Self {
        self.ar1 = Some(Ar1Spec { rho });
        self
    }

    /// R-style formula, for logs and reports.
    pub fn formula(&self, predictor: &str) -> String {
        let mut terms = vec![
            predictor.to_string(),
            format!("s(time, k = {})", self.basis_size),
        ];
        if self.difference_smooth {
            terms.push(format!("s(time, by = {predictor}, k = {})", self.basis_size));
        }
        if let Some(re) = &self.random {
            match re.kind {
                RandomKind::Intercept => terms.push(format!("s({}, bs = \"re\")", re.grouping)),
                RandomKind::Smooth => terms.push(format!("s(time, {}, bs = \"fs\")", re.grouping)),
            }
        }
        let mut formula = format!("response ~ {}", terms.join(" + "));
        match self.ar1.map(|a| a.rho) {
            Some(RhoSpec::Fixed(rho)) => formula.push_str(&format!(", AR1(rho = {rho})")),
            Some(RhoSpec::Keyword(RhoKeyword::Estimate)) => formula.push_str(", AR1(rho = estimated)"),
            None => {}
        }
        formula
    }
}

// ---------------------------------------------------------------------------
// Fit request / fitted model
// ---------------------------------------------------------------------------

/// Everything a fitter needs for one fit.
#[derive(Debug, Clone)]
pub struct FitRequest {
    pub spec: ModelSpec,
    /// Ordered by trajectory then time; `new_trajectory` marks AR1 boundaries.
    pub observations: Arc<Vec<Observation>>,
    /// Name of the synthetic predictor (used for term labels).
    pub predictor: String,
    /// Cooperative deadline; fitters check it between iterations.
    pub deadline: Option<Instant>,
}

/// Semantic role of a fitted term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermRole {
    Intercept,
    /// Parametric main effect of the predictor.
    GroupEffect,
    /// Reference-level smooth over time.
    Smooth,
    /// Smooth of the difference between predictor levels over time.
    DifferenceSmooth,
}

/// A row of the parametric coefficient table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParametricTerm {
    pub label: String,
    pub role: TermRole,
    /// Predictor coded by this term, if any.
    pub predictor: Option<String>,
    pub estimate: f64,
    pub std_error: f64,
    pub t_value: f64,
    pub p_value: f64,
}

/// A row of the smooth term table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothTerm {
    pub label: String,
    pub role: TermRole,
    /// `by` variable, if the smooth is by-predictor.
    pub by: Option<String>,
    /// Reference df (rank of the coefficient block).
    pub rank: usize,
    pub f_value: f64,
    pub p_value: f64,
}

/// Estimated variance of a random-effect block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponent {
    pub name: String,
    pub variance: f64,
    /// Effective degrees of freedom used by the block.
    pub edf: f64,
}

/// Fitted model summary, keyed by term role rather than generated labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub parametric: Vec<ParametricTerm>,
    pub smooths: Vec<SmoothTerm>,
    pub variance_components: Vec<VarianceComponent>,
    pub residual_variance: f64,
    pub residual_df: f64,
    /// AR1 coefficient actually used (fixed or estimated).
    pub rho: Option<f64>,
    pub n_obs: usize,
    /// Variance-component iterations (1 when there are no random effects).
    pub iterations: usize,
}

impl FittedModel {
    pub fn parametric_by_role(&self, role: TermRole) -> impl Iterator<Item = &ParametricTerm> + '_ {
        self.parametric.iter().filter(move |t| t.role == role)
    }

    pub fn smooths_by_role(&self, role: TermRole) -> impl Iterator<Item = &SmoothTerm> + '_ {
        self.smooths.iter().filter(move |t| t.role == role)
    }
}

/// Model fitting errors. All are per-fit and never fatal to a run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    #[error("Rank deficient model: {0}")]
    RankDeficient(String),

    #[error("Variance components did not converge after {iterations} iterations")]
    NonConvergence { iterations: usize },

    #[error("Fit exceeded its deadline after {iterations} iterations")]
    Timeout { iterations: usize },

    #[error("Invalid fit input: {0}")]
    InvalidInput(String),
}

// ---------------------------------------------------------------------------
// Fitter abstraction
// ---------------------------------------------------------------------------

/// Abstraction over additive-model fitting back-ends.
///
/// Implementors fit `request.spec` to the request's observations and
/// return the coefficient and smooth-term tables with p-values.
pub trait ModelFitter: Send + Sync {
    fn fit(&self, request: &FitRequest) -> Result<FittedModel, FitError>;

    /// Back-end identifier string.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formula_naive() {
        let spec = ModelSpec::naive("naive");
        assert_eq!(
            spec.formula("group"),
            "response ~ group + s(time, k = 5) + s(time, by = group, k = 5)"
        );
    }

    #[test]
    fn test_formula_full() {
        let spec = ModelSpec::naive("full")
            .with_random(Grouping::Subject, RandomKind::Smooth)
            .with_ar1(RhoSpec::Fixed(0.5));
        let f = spec.formula("group");
        assert!(f.contains("s(time, subject, bs = \"fs\")"));
        assert!(f.ends_with("AR1(rho = 0.5)"));
    }

    #[test]
    fn test_model_spec_from_toml() {
        let spec: ModelSpec = toml::from_str(
            r#"
            name = "ar1_re"
            random = { grouping = "subject", kind = "intercept" }
            ar1 = { rho = "estimate" }
            "#,
        )
        .unwrap();
        assert_eq!(spec.basis_size, 5);
        assert!(spec.difference_smooth);
        assert_eq!(spec.random.unwrap().kind, RandomKind::Intercept);
        assert_eq!(spec.ar1.unwrap().rho, RhoSpec::Keyword(RhoKeyword::Estimate));

        let fixed: ModelSpec = toml::from_str("name = \"x\"\nar1 = { rho = 0.4 }").unwrap();
        assert_eq!(fixed.ar1.unwrap().rho, RhoSpec::Fixed(0.4));
    }

    #[test]
    fn test_fit_error_display() {
        let e = FitError::NonConvergence { iterations: 200 };
        assert!(e.to_string().contains("200"));
    }
}

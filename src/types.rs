//! Shared types for the GAMMSIM harness.
//!
//! These types form the data model used across all modules: the
//! trajectory dataset, labeled observations handed to the model fitter,
//! and the per-iteration results collected by the Monte Carlo loop.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Group labels
// ---------------------------------------------------------------------------

/// Synthetic binary group label. `A` is the reference level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Group {
    A,
    B,
}

impl Group {
    /// Indicator value used in design matrices (A = 0, B = 1).
    pub fn indicator(&self) -> f64 {
        match self {
            Group::A => 0.0,
            Group::B => 1.0,
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::A => write!(f, "A"),
            Group::B => write!(f, "B"),
        }
    }
}

impl std::str::FromStr for Group {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Group::A),
            "B" => Ok(Group::B),
            _ => anyhow::bail!("Unknown group label: {s}"),
        }
    }
}

/// Level at which the synthetic label is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LabelScope {
    /// Every trajectory of a subject shares the subject's label (between-subject design).
    #[default]
    Subject,
    /// Each subject's trajectories are split between the two labels (within-subject design).
    Trajectory,
}

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

/// One measured trajectory: a response sampled over normalized time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub id: String,
    /// Index into `Dataset::subjects`.
    pub subject: usize,
    /// Normalized time points in [0, 1], ascending.
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// A subject (speaker) and the trajectories recorded from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    /// Indices into `Dataset::trajectories`.
    pub trajectories: Vec<usize>,
}

/// The full pool of repeated measurements. Read-only during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub subjects: Vec<Subject>,
    pub trajectories: Vec<Trajectory>,
}

impl Dataset {
    pub fn n_subjects(&self) -> usize {
        self.subjects.len()
    }

    pub fn n_trajectories(&self) -> usize {
        self.trajectories.len()
    }

    pub fn n_observations(&self) -> usize {
        self.trajectories.iter().map(Trajectory::len).sum()
    }

    /// Trajectories belonging to one subject.
    pub fn trajectories_of(&self, subject: usize) -> impl Iterator<Item = &Trajectory> + '_ {
        self.subjects[subject]
            .trajectories
            .iter()
            .map(move |&t| &self.trajectories[t])
    }

    /// Append a trajectory, creating the subject on first sight.
    /// Returns the index of the new trajectory.
    pub fn push_trajectory(
        &mut self,
        subject_id: &str,
        trajectory_id: &str,
        times: Vec<f64>,
        values: Vec<f64>,
    ) -> usize {
        let subject = match self.subjects.iter().position(|s| s.id == subject_id) {
            Some(idx) => idx,
            None => {
                self.subjects.push(Subject {
                    id: subject_id.to_string(),
                    trajectories: Vec::new(),
                });
                self.subjects.len() - 1
            }
        };
        let idx = self.trajectories.len();
        self.trajectories.push(Trajectory {
            id: trajectory_id.to_string(),
            subject,
            times,
            values,
        });
        self.subjects[subject].trajectories.push(idx);
        idx
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} subjects, {} trajectories, {} observations",
            self.n_subjects(),
            self.n_trajectories(),
            self.n_observations(),
        )
    }
}

// ---------------------------------------------------------------------------
// Observations
// ---------------------------------------------------------------------------

/// A single labeled measurement as seen by the model fitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Dataset subject index.
    pub subject: usize,
    /// Dataset trajectory index.
    pub trajectory: usize,
    pub time: f64,
    pub response: f64,
    pub group: Group,
    /// Boundary marker: first point of a trajectory (AR1 restarts here).
    pub new_trajectory: bool,
}

/// Shape of an injected group-B effect for type-II (power) setups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EffectShape {
    /// Constant offset over the whole trajectory.
    #[default]
    Constant,
    /// Bump peaking at mid-trajectory: `size * sin(pi * t)`.
    Peak,
}

/// A deliberately injected difference between the groups.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectSpec {
    pub size: f64,
    #[serde(default)]
    pub shape: EffectShape,
}

impl EffectSpec {
    /// Effect added to a group-B response at normalized time `t`.
    pub fn at(&self, t: f64) -> f64 {
        match self.shape {
            EffectShape::Constant => self.size,
            EffectShape::Peak => self.size * (std::f64::consts::PI * t).sin(),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// p-values extracted for the synthetic predictor from one fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PValues {
    /// The single parametric group term.
    pub parametric: f64,
    /// Zero or more smooth terms involving the predictor.
    pub smooth: Vec<f64>,
}

impl PValues {
    /// Significance of the parametric term at `alpha`.
    pub fn parametric_rejects(&self, alpha: f64) -> bool {
        self.parametric < alpha
    }

    /// Whether any smooth term is significant at `alpha`. `None` when the
    /// model had no smooth term for the predictor.
    pub fn smooth_rejects(&self, alpha: f64) -> Option<bool> {
        if self.smooth.is_empty() {
            None
        } else {
            Some(self.smooth.iter().any(|p| *p < alpha))
        }
    }
}

/// Outcome of one (iteration, model variant) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FitOutcome {
    /// Fit and extraction succeeded.
    Tested(PValues),
    /// Failed, but counted as a non-rejection under the configured policy.
    Imputed { reason: String },
    /// Failed and excluded from the rejection rate.
    Missing { reason: String },
}

/// Result of one model variant on one iteration's sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub iteration: usize,
    pub variant: String,
    /// Number of fit attempts used (> 1 only under the retry policy).
    pub attempts: u32,
    pub outcome: FitOutcome,
}

impl FitResult {
    pub fn p_values(&self) -> Option<&PValues> {
        match &self.outcome {
            FitOutcome::Tested(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for FitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            FitOutcome::Tested(p) => {
                let smooth: Vec<String> = p.smooth.iter().map(|v| format!("{v:.4}")).collect();
                write!(
                    f,
                    "#{} {}: p(param)={:.4} p(smooth)=[{}]",
                    self.iteration,
                    self.variant,
                    p.parametric,
                    smooth.join(", "),
                )
            }
            FitOutcome::Imputed { reason } => {
                write!(f, "#{} {}: imputed non-significant ({reason})", self.iteration, self.variant)
            }
            FitOutcome::Missing { reason } => {
                write!(f, "#{} {}: missing ({reason})", self.iteration, self.variant)
            }
        }
    }
}

/// All results of one model variant, ordered by iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationRun {
    pub variant: String,
    pub results: Vec<FitResult>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for the simulation harness.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Insufficient data: need {needed} eligible subjects, found {available}")]
    InsufficientSubjects { needed: usize, available: usize },

    #[error("Invalid sample request: {0}")]
    InvalidSample(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker failed: {0}")]
    Worker(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_display_and_parse() {
        assert_eq!(format!("{}", Group::A), "A");
        assert_eq!("b".parse::<Group>().unwrap(), Group::B);
        assert!("C".parse::<Group>().is_err());
    }

    #[test]
    fn test_group_indicator() {
        assert_eq!(Group::A.indicator(), 0.0);
        assert_eq!(Group::B.indicator(), 1.0);
    }

    #[test]
    fn test_push_trajectory_groups_by_subject() {
        let mut ds = Dataset::default();
        ds.push_trajectory("s1", "t1", vec![0.0, 1.0], vec![1.0, 2.0]);
        ds.push_trajectory("s2", "t2", vec![0.0, 1.0], vec![1.0, 2.0]);
        ds.push_trajectory("s1", "t3", vec![0.0, 0.5, 1.0], vec![1.0, 2.0, 3.0]);

        assert_eq!(ds.n_subjects(), 2);
        assert_eq!(ds.n_trajectories(), 3);
        assert_eq!(ds.n_observations(), 7);
        assert_eq!(ds.subjects[0].trajectories, vec![0, 2]);
        assert_eq!(ds.trajectories_of(0).count(), 2);
        assert_eq!(ds.trajectories[2].subject, 0);
    }

    #[test]
    fn test_effect_shapes() {
        let constant = EffectSpec { size: 2.0, shape: EffectShape::Constant };
        assert_eq!(constant.at(0.0), 2.0);
        assert_eq!(constant.at(0.7), 2.0);

        let peak = EffectSpec { size: 2.0, shape: EffectShape::Peak };
        assert!(peak.at(0.0).abs() < 1e-12);
        assert!((peak.at(0.5) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_p_values_rejection() {
        let p = PValues { parametric: 0.01, smooth: vec![0.2, 0.04] };
        assert!(p.parametric_rejects(0.05));
        assert_eq!(p.smooth_rejects(0.05), Some(true));

        let none = PValues { parametric: 0.5, smooth: vec![] };
        assert!(!none.parametric_rejects(0.05));
        assert_eq!(none.smooth_rejects(0.05), None);
    }

    #[test]
    fn test_fit_outcome_serialization() {
        let outcome = FitOutcome::Missing { reason: "timeout".into() };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"status\":\"missing\""));
        let back: FitOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn test_fit_result_display() {
        let r = FitResult {
            iteration: 3,
            variant: "naive".into(),
            attempts: 1,
            outcome: FitOutcome::Tested(PValues { parametric: 0.5, smooth: vec![0.25] }),
        };
        let s = r.to_string();
        assert!(s.contains("#3 naive"));
        assert!(s.contains("0.5000"));
    }

    #[test]
    fn test_label_scope_default() {
        assert_eq!(LabelScope::default(), LabelScope::Subject);
    }
}

//! Random subject sampling and synthetic label assignment.
//!
//! Eligibility is resolved once in `Sampler::new`; a pool too small for
//! the requested sample is a setup error, never an in-loop one.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{Dataset, EffectSpec, Group, LabelScope, Observation, SimError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Subjects drawn per iteration.
    pub n_subjects: usize,
    /// Cap on trajectories drawn per subject (`None` = all eligible).
    pub trajectories_per_subject: Option<usize>,
    /// Trajectories shorter than this are ignored.
    pub min_points_per_trajectory: usize,
    pub label_scope: LabelScope,
    /// Injected group-B effect (type-II setup). `None` = null setup.
    pub effect: Option<EffectSpec>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_subjects: 20,
            trajectories_per_subject: None,
            min_points_per_trajectory: 3,
            label_scope: LabelScope::Subject,
            effect: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sample
// ---------------------------------------------------------------------------

/// One trajectory drawn into a sample, with its synthetic label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampledTrajectory {
    pub subject: usize,
    pub trajectory: usize,
    pub group: Group,
}

/// A labeled subset of the dataset. Trajectories are referenced, not copied.
#[derive(Debug, Clone)]
pub struct Sample {
    dataset: Arc<Dataset>,
    members: Vec<SampledTrajectory>,
    effect: Option<EffectSpec>,
}

impl Sample {
    pub fn members(&self) -> &[SampledTrajectory] {
        &self.members
    }

    /// Distinct subjects in draw order.
    pub fn subjects(&self) -> Vec<usize> {
        let mut seen = Vec::new();
        for m in &self.members {
            if !seen.contains(&m.subject) {
                seen.push(m.subject);
            }
        }
        seen
    }

    /// Number of distinct subjects carrying `group`.
    pub fn subjects_in(&self, group: Group) -> usize {
        let mut seen: Vec<usize> = self
            .members
            .iter()
            .filter(|m| m.group == group)
            .map(|m| m.subject)
            .collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }

    pub fn n_trajectories(&self) -> usize {
        self.members.len()
    }

    /// Materialize labeled observations, ordered by trajectory then time,
    /// with boundary markers on each trajectory's first point. An injected
    /// effect is added to group-B responses here.
    pub fn observations(&self) -> Vec<Observation> {
        let mut out = Vec::new();
        for m in &self.members {
            let traj = &self.dataset.trajectories[m.trajectory];
            for (i, (&time, &value)) in traj.times.iter().zip(&traj.values).enumerate() {
                let shift = match (&self.effect, m.group) {
                    (Some(effect), Group::B) => effect.at(time),
                    _ => 0.0,
                };
                out.push(Observation {
                    subject: m.subject,
                    trajectory: m.trajectory,
                    time,
                    response: value + shift,
                    group: m.group,
                    new_trajectory: i == 0,
                });
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

pub struct Sampler {
    dataset: Arc<Dataset>,
    config: SamplerConfig,
    /// (subject index, eligible trajectory indices) for every eligible subject.
    eligible: Vec<(usize, Vec<usize>)>,
}

impl Sampler {
    /// Resolve eligible subjects and check the pool can serve `n_subjects`.
    pub fn new(dataset: Arc<Dataset>, config: SamplerConfig) -> Result<Self, SimError> {
        if config.n_subjects < 2 {
            return Err(SimError::InvalidSample(format!(
                "need at least 2 subjects per sample, got {}",
                config.n_subjects
            )));
        }
        let needed_trajectories = match (config.label_scope, config.trajectories_per_subject) {
            (_, Some(0)) => {
                return Err(SimError::InvalidSample("trajectories_per_subject must be positive".into()))
            }
            (LabelScope::Trajectory, Some(m)) if m < 2 => {
                return Err(SimError::InvalidSample(format!(
                    "trajectory scope needs at least 2 trajectories per subject, got {m}"
                )))
            }
            (LabelScope::Trajectory, Some(m)) => m,
            (LabelScope::Trajectory, None) => 2,
            (LabelScope::Subject, Some(m)) => m,
            (LabelScope::Subject, None) => 1,
        };

        let eligible: Vec<(usize, Vec<usize>)> = dataset
            .subjects
            .iter()
            .enumerate()
            .filter_map(|(s, subject)| {
                let trajs: Vec<usize> = subject
                    .trajectories
                    .iter()
                    .copied()
                    .filter(|&t| dataset.trajectories[t].len() >= config.min_points_per_trajectory)
                    .collect();
                (trajs.len() >= needed_trajectories).then_some((s, trajs))
            })
            .collect();

        if eligible.len() < config.n_subjects {
            return Err(SimError::InsufficientSubjects {
                needed: config.n_subjects,
                available: eligible.len(),
            });
        }

        info!(
            eligible = eligible.len(),
            total = dataset.n_subjects(),
            n_subjects = config.n_subjects,
            scope = ?config.label_scope,
            "Sampler ready"
        );

        Ok(Self { dataset, config, eligible })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn n_eligible(&self) -> usize {
        self.eligible.len()
    }

    /// Draw subjects, trajectories and labels.
    ///
    /// Subject scope: floor(n/2) subjects get `A`, the rest `B`.
    /// Trajectory scope: within each subject the m trajectories split as
    /// evenly as possible. Subjects with odd m alternate which group gets
    /// the extra trajectory, starting from a random group, so the overall
    /// trajectory counts differ by at most one.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Sample {
        let n = self.config.n_subjects;
        let mut pool: Vec<usize> = (0..self.eligible.len()).collect();
        let (chosen, _) = pool.partial_shuffle(rng, n);
        let mut chosen = chosen.to_vec();
        chosen.sort_unstable();

        let mut subject_labels = split_labels(n, n / 2);
        subject_labels.shuffle(rng);

        let mut extra_to_a = rng.gen_bool(0.5);
        let mut members = Vec::new();
        for (slot, &e) in chosen.iter().enumerate() {
            let (subject, trajs) = &self.eligible[e];
            let mut picked = trajs.clone();
            if let Some(cap) = self.config.trajectories_per_subject {
                if cap < picked.len() {
                    let (head, _) = picked.partial_shuffle(rng, cap);
                    let mut head = head.to_vec();
                    head.sort_unstable();
                    picked = head;
                }
            }

            let labels = match self.config.label_scope {
                LabelScope::Subject => vec![subject_labels[slot]; picked.len()],
                LabelScope::Trajectory => {
                    let m = picked.len();
                    let mut n_a = m / 2;
                    if m % 2 == 1 {
                        if extra_to_a {
                            n_a += 1;
                        }
                        extra_to_a = !extra_to_a;
                    }
                    let mut l = split_labels(m, n_a);
                    l.shuffle(rng);
                    l
                }
            };

            members.extend(picked.into_iter().zip(labels).map(|(trajectory, group)| SampledTrajectory {
                subject: *subject,
                trajectory,
                group,
            }));
        }

        debug!(subjects = n, trajectories = members.len(), "Sample drawn");
        Sample {
            dataset: Arc::clone(&self.dataset),
            members,
            effect: self.config.effect,
        }
    }
}

/// `n_a` `A` labels followed by `n - n_a` `B` labels.
fn split_labels(n: usize, n_a: usize) -> Vec<Group> {
    (0..n).map(|i| if i < n_a { Group::A } else { Group::B }).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

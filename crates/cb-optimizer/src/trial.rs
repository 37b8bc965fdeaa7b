//! Trial tracking for the model-guided strategies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cb_types::Setpoint;

/// Unique study identifier.
pub type StudyId = Uuid;

/// Lifecycle state of a single trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Running,
    Completed,
    /// Skipped before evaluation (unsafe candidate) or cut short by cancellation.
    Pruned,
    Failed,
}

/// A single candidate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub number: usize,
    pub params: Setpoint,
    pub status: TrialStatus,
    pub value: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl Trial {
    pub fn new(number: usize, params: Setpoint) -> Self {
        Self {
            number,
            params,
            status: TrialStatus::Running,
            value: None,
            started_at: Utc::now(),
            finished_at: None,
            note: None,
        }
    }

    pub fn mark_completed(&mut self, value: f64) {
        self.status = TrialStatus::Completed;
        self.value = Some(value);
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_pruned(&mut self, reason: &str) {
        self.status = TrialStatus::Pruned;
        self.finished_at = Some(Utc::now());
        self.note = Some(reason.to_string());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.note = Some(error);
    }

    pub fn is_finished(&self) -> bool {
        self.status != TrialStatus::Running
    }
}

/// Ordered trials of one minimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub id: StudyId,
    pub started_at: DateTime<Utc>,
    trials: Vec<Trial>,
    best: Option<usize>,
    since_improvement: usize,
}

impl Study {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            trials: Vec::new(),
            best: None,
            since_improvement: 0,
        }
    }

    /// Open a trial for `params`; returns its number.
    pub fn ask(&mut self, params: Setpoint) -> usize {
        let number = self.trials.len();
        self.trials.push(Trial::new(number, params));
        number
    }

    /// Complete a trial. Returns true when it became the new best.
    pub fn tell(&mut self, number: usize, value: f64) -> bool {
        let Some(trial) = self.trials.get_mut(number) else {
            return false;
        };
        trial.mark_completed(value);

        let improved = value.is_finite()
            && match self.best_trial() {
                None => true,
                Some(best) => best.value.map_or(true, |b| value < b),
            };
        if improved {
            self.best = Some(number);
            self.since_improvement = 0;
        } else {
            self.since_improvement += 1;
        }
        improved
    }

    pub fn prune(&mut self, number: usize, reason: &str) {
        if let Some(trial) = self.trials.get_mut(number) {
            trial.mark_pruned(reason);
            self.since_improvement += 1;
        }
    }

    pub fn best_trial(&self) -> Option<&Trial> {
        self.best.and_then(|i| self.trials.get(i))
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    /// Completed trials with a finite value.
    pub fn observations(&self) -> impl Iterator<Item = (&Setpoint, f64)> {
        self.trials.iter().filter_map(|t| match (t.status, t.value) {
            (TrialStatus::Completed, Some(v)) if v.is_finite() => Some((&t.params, v)),
            _ => None,
        })
    }

    pub fn completed_count(&self) -> usize {
        self.count(TrialStatus::Completed)
    }

    pub fn pruned_count(&self) -> usize {
        self.count(TrialStatus::Pruned)
    }

    /// Finished trials since the last improvement.
    pub fn trials_since_improvement(&self) -> usize {
        self.since_improvement
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    fn count(&self, status: TrialStatus) -> usize {
        self.trials.iter().filter(|t| t.status == status).count()
    }
}

impl Default for Study {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_lifecycle() {
        let mut trial = Trial::new(0, Setpoint::default());
        assert_eq!(trial.status, TrialStatus::Running);
        assert!(!trial.is_finished());

        trial.mark_completed(120.0);
        assert_eq!(trial.status, TrialStatus::Completed);
        assert_eq!(trial.value, Some(120.0));
        assert!(trial.finished_at.is_some());
    }

    #[test]
    fn test_failed_trial_keeps_error() {
        let mut trial = Trial::new(3, Setpoint::default());
        trial.mark_failed("objective panicked".to_string());
        assert_eq!(trial.status, TrialStatus::Failed);
        assert_eq!(trial.note.as_deref(), Some("objective panicked"));
    }

    #[test]
    fn test_study_tracks_minimum() {
        let mut study = Study::new();
        let a = study.ask(Setpoint::new(24.0, 50.0, 1));
        let b = study.ask(Setpoint::new(22.0, 45.0, 1));
        let c = study.ask(Setpoint::new(29.0, 45.0, 1));

        assert!(study.tell(a, 150.0));
        assert!(study.tell(b, 100.0));
        assert!(!study.tell(c, f64::INFINITY));

        let best = study.best_trial().unwrap();
        assert_eq!(best.number, b);
        assert_eq!(study.trials_since_improvement(), 1);
        assert_eq!(study.observations().count(), 2);
    }

    #[test]
    fn test_pruned_trials_count_against_patience() {
        let mut study = Study::new();
        let a = study.ask(Setpoint::default());
        study.tell(a, 90.0);
        let b = study.ask(Setpoint::new(29.0, 50.0, 1));
        study.prune(b, "unsafe candidate");

        assert_eq!(study.pruned_count(), 1);
        assert_eq!(study.completed_count(), 1);
        assert_eq!(study.trials_since_improvement(), 1);
        assert!(!study.tell(99, 1.0));
    }
}

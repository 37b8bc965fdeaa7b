//! Sequential model-guided search.

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

use cb_types::{CancellationToken, SafetyBounds, Setpoint, StrategyError, StrategyResult};

use crate::objective::Objective;
use crate::search::{seeded_rng, GridConfig, SearchCore, SearchStrategy, SetpointSpace};
use crate::trial::Study;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BayesianConfig {
    pub n_trials: usize,
    pub timeout_secs: f64,
    /// Random trials before the surrogate takes over.
    pub startup_trials: usize,
    /// Random candidates scored by the acquisition function per trial.
    pub candidates_per_trial: usize,
    /// Weight on the uncertainty bonus in the lower confidence bound.
    pub exploration_weight: f64,
    /// Stop after this many trials without improvement.
    pub patience: usize,
    /// Kernel length scale in normalized coordinates.
    pub length_scale: f64,
    pub seed: Option<u64>,
}

impl Default for BayesianConfig {
    fn default() -> Self {
        Self {
            n_trials: 20,
            timeout_secs: 300.0,
            startup_trials: 5,
            candidates_per_trial: 64,
            exploration_weight: 2.0,
            patience: 10,
            length_scale: 0.25,
            seed: None,
        }
    }
}

impl BayesianConfig {
    fn validate(&self) -> StrategyResult<()> {
        let invalid = |message: String| Err(StrategyError::InvalidConfig { message });
        if self.n_trials == 0 {
            return invalid("bayesian.n_trials must be at least 1".to_string());
        }
        if !(self.timeout_secs.is_finite() && self.timeout_secs > 0.0) {
            return invalid(format!("bayesian.timeout_secs must be positive, got {}", self.timeout_secs));
        }
        if self.candidates_per_trial == 0 {
            return invalid("bayesian.candidates_per_trial must be at least 1".to_string());
        }
        if !(self.length_scale.is_finite() && self.length_scale > 0.0) {
            return invalid(format!("bayesian.length_scale must be positive, got {}", self.length_scale));
        }
        if !(self.exploration_weight.is_finite() && self.exploration_weight >= 0.0) {
            return invalid("bayesian.exploration_weight must be non-negative".to_string());
        }
        Ok(())
    }
}

/// Kernel-regression surrogate with a lower-confidence-bound acquisition.
///
/// Predictions are Nadaraya-Watson means under an RBF kernel on normalized
/// temperature/humidity, with a unit penalty for a mode mismatch. The
/// uncertainty shrinks with the kernel mass near the candidate.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    config: BayesianConfig,
    bounds: SafetyBounds,
    space: SetpointSpace,
    rng: ChaCha8Rng,
    core: SearchCore,
    last_study: Option<Study>,
}

impl BayesianSearch {
    pub fn new(config: BayesianConfig, bounds: &SafetyBounds, cancel: CancellationToken) -> StrategyResult<Self> {
        config.validate()?;
        let grid = GridConfig::default();
        let space = SetpointSpace::from_bounds(bounds, grid.temperature_step, grid.humidity_step);
        if space.is_empty() {
            return Err(StrategyError::InvalidConfig {
                message: "bayesian search space is empty".to_string(),
            });
        }
        Ok(Self {
            rng: seeded_rng(config.seed),
            space,
            bounds: bounds.clone(),
            config,
            core: SearchCore::new(bounds.default_setpoint, cancel),
            last_study: None,
        })
    }

    /// Trials of the most recent run.
    pub fn study(&self) -> Option<&Study> {
        self.last_study.as_ref()
    }

    fn normalize(&self, sp: &Setpoint) -> (f64, f64) {
        let t = &self.bounds.temperature;
        let h = &self.bounds.humidity;
        let span = |lo: f64, hi: f64| if hi > lo { hi - lo } else { 1.0 };
        (
            (sp.temperature - t.min) / span(t.min, t.max),
            (sp.humidity - h.min) / span(h.min, h.max),
        )
    }

    /// Lower confidence bound of `candidate` given the study so far.
    fn acquisition(&self, study: &Study, candidate: &Setpoint) -> f64 {
        let observed: Vec<(&Setpoint, f64)> = study.observations().collect();
        if observed.is_empty() {
            return 0.0;
        }

        let n = observed.len() as f64;
        let prior_mean = observed.iter().map(|(_, v)| v).sum::<f64>() / n;
        let variance = observed.iter().map(|(_, v)| (v - prior_mean).powi(2)).sum::<f64>() / n;
        let prior_std = variance.sqrt().max(prior_mean.abs() * 0.05).max(1e-6);

        let (cx, cy) = self.normalize(candidate);
        let two_l2 = 2.0 * self.config.length_scale * self.config.length_scale;
        let mut mass = 0.0;
        let mut weighted = 0.0;
        for (sp, value) in &observed {
            let (x, y) = self.normalize(sp);
            let mode_gap = if sp.mode == candidate.mode { 0.0 } else { 1.0 };
            let d2 = (x - cx).powi(2) + (y - cy).powi(2) + mode_gap;
            let k = (-d2 / two_l2).exp();
            mass += k;
            weighted += k * value;
        }

        let mean = if mass > 1e-12 { weighted / mass } else { prior_mean };
        let std = prior_std / (1.0 + mass).sqrt();
        mean - self.config.exploration_weight * std
    }

    fn propose(&mut self, study: &Study) -> Setpoint {
        let mut best: Option<(Setpoint, f64)> = None;
        for _ in 0..self.config.candidates_per_trial {
            let candidate = self.space.sample(&mut self.rng);
            if !self.bounds.is_candidate_feasible(&candidate) {
                continue;
            }
            let score = self.acquisition(study, &candidate);
            if best.map_or(true, |(_, s)| score < s) {
                best = Some((candidate, score));
            }
        }
        match best {
            Some((candidate, _)) => candidate,
            None => self.space.sample(&mut self.rng),
        }
    }

    fn run_trial(&mut self, study: &mut Study, objective: &Objective, candidate: Setpoint) {
        let number = study.ask(candidate);
        if !self.bounds.is_candidate_feasible(&candidate) {
            study.prune(number, "candidate outside the safe envelope");
            return;
        }
        let value = self.core.evaluate(objective, &candidate);
        study.tell(number, value);
    }

    fn run_study(
        &mut self,
        study: &mut Study,
        objective: &Objective,
        started: Instant,
        timeout: Duration,
    ) -> StrategyResult<()> {
        if let Some(initial) = self.core.initial() {
            self.core.check_cancel()?;
            self.run_trial(study, objective, initial);
        }

        while study.len() < self.config.n_trials {
            self.core.check_cancel()?;
            if started.elapsed() >= timeout {
                info!(trials = study.len(), "bayesian search reached its time budget");
                break;
            }
            if study.completed_count() >= self.config.startup_trials
                && study.trials_since_improvement() >= self.config.patience
            {
                info!(trials = study.len(), "bayesian search stopped without improvement");
                break;
            }

            let candidate = if study.completed_count() < self.config.startup_trials {
                self.space.sample(&mut self.rng)
            } else {
                self.propose(study)
            };
            self.run_trial(study, objective, candidate);
        }
        Ok(())
    }
}

impl SearchStrategy for BayesianSearch {
    fn optimize(&mut self, objective: &Objective) -> StrategyResult<Setpoint> {
        self.core.begin();
        let started = Instant::now();
        let timeout = Duration::from_secs_f64(self.config.timeout_secs);
        let mut study = Study::new();
        info!(
            n_trials = self.config.n_trials,
            timeout_secs = self.config.timeout_secs,
            study = %study.id,
            "bayesian search started"
        );

        let outcome = self.run_study(&mut study, objective, started, timeout);

        info!(
            completed = study.completed_count(),
            pruned = study.pruned_count(),
            "bayesian study closed"
        );
        self.last_study = Some(study);
        outcome?;
        self.core.finish(self.name())
    }

    fn best_params(&self) -> Setpoint {
        self.core.best_params()
    }

    fn best_objective(&self) -> f64 {
        self.core.best_objective()
    }

    fn set_initial_params(&mut self, params: Setpoint) {
        self.core.set_initial(params);
    }

    fn bind_cancel(&mut self, token: CancellationToken) {
        self.core.bind_cancel(token);
    }

    fn stop(&self) {
        self.core.stop();
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::tests::objective_with_optimum;

    fn seeded(n_trials: usize) -> BayesianConfig {
        BayesianConfig {
            n_trials,
            seed: Some(11),
            ..BayesianConfig::default()
        }
    }

    #[test]
    fn test_trial_budget_is_respected() {
        let mut search = BayesianSearch::new(seeded(15), &SafetyBounds::default(), CancellationToken::new()).unwrap();
        let best = search.optimize(&objective_with_optimum()).unwrap();
        let study = search.study().unwrap();
        assert!(study.len() <= 15);
        assert!(SafetyBounds::default().is_candidate_feasible(&best));
        assert!(search.best_objective().is_finite());
    }

    #[test]
    fn test_initial_params_are_tried_first() {
        let mut search = BayesianSearch::new(seeded(5), &SafetyBounds::default(), CancellationToken::new()).unwrap();
        let seed = Setpoint::new(22.0, 45.0, 1);
        search.set_initial_params(seed);
        let best = search.optimize(&objective_with_optimum()).unwrap();

        let first = &search.study().unwrap().trials()[0];
        assert_eq!(first.params, seed);
        // The seed sits on the historical optimum, nothing beats it.
        assert!((search.best_objective() - (0.7 * 60.0 + 0.3 * 200.0)).abs() < 1e-9);
        assert_eq!(best.mode, 1);
    }

    #[test]
    fn test_unsafe_initial_params_are_pruned() {
        let mut search = BayesianSearch::new(seeded(3), &SafetyBounds::default(), CancellationToken::new()).unwrap();
        search.set_initial_params(Setpoint::new(30.0, 50.0, 1));
        let _ = search.optimize(&objective_with_optimum());
        assert_eq!(search.study().unwrap().trials()[0].status, crate::trial::TrialStatus::Pruned);
    }

    #[test]
    fn test_cancellation_prunes_run() {
        let token = CancellationToken::new();
        let mut search = BayesianSearch::new(seeded(50), &SafetyBounds::default(), token.clone()).unwrap();
        token.cancel();
        assert!(matches!(
            search.optimize(&objective_with_optimum()),
            Err(StrategyError::Pruned { .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = BayesianConfig {
            n_trials: 0,
            ..BayesianConfig::default()
        };
        assert!(BayesianSearch::new(config, &SafetyBounds::default(), CancellationToken::new()).is_err());
    }

    #[test]
    fn test_acquisition_prefers_low_observed_region() {
        let search = BayesianSearch::new(seeded(10), &SafetyBounds::default(), CancellationToken::new()).unwrap();
        let mut study = Study::new();
        let good = study.ask(Setpoint::new(22.0, 45.0, 1));
        study.tell(good, 50.0);
        let bad = study.ask(Setpoint::new(27.0, 65.0, 1));
        study.tell(bad, 500.0);

        let near_good = search.acquisition(&study, &Setpoint::new(22.0, 45.0, 1));
        let near_bad = search.acquisition(&study, &Setpoint::new(27.0, 65.0, 1));
        assert!(near_good < near_bad);
    }
}

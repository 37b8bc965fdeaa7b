//! Search strategy interface, shared bookkeeping and the exhaustive/random
//! strategies.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cb_types::{CancellationToken, SafetyBounds, Setpoint, StrategyError, StrategyResult};

use crate::objective::Objective;

// ---------------------------------------------------------------------------
// Strategy interface
// ---------------------------------------------------------------------------

/// Common trait for all search strategies.
///
/// One instance belongs to one optimization session. `optimize` runs on the
/// session's worker thread and must poll the cancellation token between
/// evaluations, returning [`StrategyError::Pruned`] once it is raised.
pub trait SearchStrategy: Send + Sync {
    /// Search for the lowest-objective setpoint.
    fn optimize(&mut self, objective: &Objective) -> StrategyResult<Setpoint>;

    /// Best setpoint found so far, or the default when nothing was found yet.
    fn best_params(&self) -> Setpoint;

    /// Objective of [`SearchStrategy::best_params`]; `+inf` before any
    /// feasible evaluation in the current run.
    fn best_objective(&self) -> f64;

    /// Starting point for strategies that walk from one.
    fn set_initial_params(&mut self, _params: Setpoint) {}

    /// Watch `token` from now on. Sessions bind a fresh per-run child of the
    /// controller's token before each run.
    fn bind_cancel(&mut self, token: CancellationToken);

    /// Raise the cancellation flag this strategy watches. Idempotent.
    fn stop(&self);

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

/// Bookkeeping every strategy carries: running best, evaluation count and
/// the cancellation token.
#[derive(Debug, Clone)]
pub struct SearchCore {
    best: Option<Setpoint>,
    best_objective: f64,
    default: Setpoint,
    initial: Option<Setpoint>,
    cancel: CancellationToken,
    evaluated: usize,
}

impl SearchCore {
    pub fn new(default: Setpoint, cancel: CancellationToken) -> Self {
        Self {
            best: None,
            best_objective: f64::INFINITY,
            default,
            initial: None,
            cancel,
            evaluated: 0,
        }
    }

    /// Reset per-run counters. The previous best is kept as a hint for
    /// [`SearchCore::start_point`] but no longer counts as the incumbent.
    pub fn begin(&mut self) {
        self.best_objective = f64::INFINITY;
        self.evaluated = 0;
    }

    pub fn evaluate(&mut self, objective: &Objective, candidate: &Setpoint) -> f64 {
        let value = objective.evaluate(candidate);
        self.record(candidate, value);
        value
    }

    /// Record an evaluation computed elsewhere (e.g. on a worker pool).
    /// Returns true when it became the new best.
    pub fn record(&mut self, candidate: &Setpoint, value: f64) -> bool {
        self.evaluated += 1;
        if value < self.best_objective {
            debug!(
                candidate = %candidate,
                objective = value,
                evaluated = self.evaluated,
                "new best candidate"
            );
            self.best = Some(*candidate);
            self.best_objective = value;
            true
        } else {
            false
        }
    }

    pub fn check_cancel(&self) -> StrategyResult<()> {
        if self.cancel.is_cancelled() {
            Err(StrategyError::Pruned {
                evaluated: self.evaluated,
            })
        } else {
            Ok(())
        }
    }

    /// Outcome of a completed run.
    pub fn finish(&self, strategy: &str) -> StrategyResult<Setpoint> {
        match self.best {
            Some(best) if self.best_objective.is_finite() => {
                info!(
                    strategy,
                    best = %best,
                    objective = self.best_objective,
                    evaluated = self.evaluated,
                    "search finished"
                );
                Ok(best)
            }
            _ => Err(StrategyError::NoFeasibleCandidate {
                evaluated: self.evaluated,
            }),
        }
    }

    /// Initial params if set, else the last best, else the default.
    pub fn start_point(&self) -> Setpoint {
        self.initial.or(self.best).unwrap_or(self.default)
    }

    pub fn set_initial(&mut self, params: Setpoint) {
        self.initial = Some(params);
    }

    pub fn initial(&self) -> Option<Setpoint> {
        self.initial
    }

    pub fn best_params(&self) -> Setpoint {
        self.best.unwrap_or(self.default)
    }

    pub fn best_objective(&self) -> f64 {
        self.best_objective
    }

    pub fn evaluated(&self) -> usize {
        self.evaluated
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn bind_cancel(&mut self, token: CancellationToken) {
        self.cancel = token;
    }
}

/// Deterministic when seeded, entropy-seeded otherwise.
pub(crate) fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}

// ---------------------------------------------------------------------------
// Discretized setpoint space
// ---------------------------------------------------------------------------

/// The admissible box discretized into temperature/humidity axes plus the
/// allowed modes.
#[derive(Debug, Clone, PartialEq)]
pub struct SetpointSpace {
    pub temperatures: Vec<f64>,
    pub humidities: Vec<f64>,
    pub modes: Vec<u8>,
}

impl SetpointSpace {
    pub fn from_bounds(bounds: &SafetyBounds, temperature_step: f64, humidity_step: f64) -> Self {
        Self {
            temperatures: axis(bounds.temperature.min, bounds.temperature.max, temperature_step),
            humidities: axis(bounds.humidity.min, bounds.humidity.max, humidity_step),
            modes: bounds.modes.clone(),
        }
    }

    /// Total number of grid points.
    pub fn size(&self) -> usize {
        self.temperatures.len() * self.humidities.len() * self.modes.len()
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.temperatures.len(), self.humidities.len(), self.modes.len())
    }

    pub fn at(&self, t: usize, h: usize, m: usize) -> Setpoint {
        Setpoint::new(self.temperatures[t], self.humidities[h], self.modes[m])
    }

    /// Grid coordinates of the point nearest to `setpoint`.
    pub fn index_of(&self, setpoint: &Setpoint) -> (usize, usize, usize) {
        let t = nearest(&self.temperatures, setpoint.temperature);
        let h = nearest(&self.humidities, setpoint.humidity);
        let m = self
            .modes
            .iter()
            .position(|&mode| mode == setpoint.mode)
            .unwrap_or(0);
        (t, h, m)
    }

    /// Every grid point, temperature-major.
    pub fn iter(&self) -> impl Iterator<Item = Setpoint> + '_ {
        self.temperatures.iter().flat_map(move |&t| {
            self.humidities
                .iter()
                .flat_map(move |&h| self.modes.iter().map(move |&m| Setpoint::new(t, h, m)))
        })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Setpoint {
        self.at(
            rng.gen_range(0..self.temperatures.len()),
            rng.gen_range(0..self.humidities.len()),
            rng.gen_range(0..self.modes.len()),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

fn axis(min: f64, max: f64, step: f64) -> Vec<f64> {
    let mut values = Vec::new();
    let mut k = 0.0;
    loop {
        let v = min + k * step;
        if v > max + 1e-9 {
            break;
        }
        values.push((v * 1e6).round() / 1e6);
        k += 1.0;
    }
    values
}

fn nearest(values: &[f64], target: f64) -> usize {
    values
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - target)
                .abs()
                .partial_cmp(&(*b - target).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn check_step(name: &str, step: f64) -> StrategyResult<()> {
    if step.is_finite() && step > 0.0 {
        Ok(())
    } else {
        Err(StrategyError::InvalidConfig {
            message: format!("{name} must be positive, got {step}"),
        })
    }
}

// ---- Grid search ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub temperature_step: f64,
    pub humidity_step: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            temperature_step: 1.0,
            humidity_step: 5.0,
        }
    }
}

/// Exhaustive grid search over the discretized setpoint space.
#[derive(Debug, Clone)]
pub struct GridSearch {
    space: SetpointSpace,
    core: SearchCore,
}

impl GridSearch {
    pub fn new(config: GridConfig, bounds: &SafetyBounds, cancel: CancellationToken) -> StrategyResult<Self> {
        check_step("grid.temperature_step", config.temperature_step)?;
        check_step("grid.humidity_step", config.humidity_step)?;
        let space = SetpointSpace::from_bounds(bounds, config.temperature_step, config.humidity_step);
        if space.is_empty() {
            return Err(StrategyError::InvalidConfig {
                message: "grid is empty".to_string(),
            });
        }
        Ok(Self {
            space,
            core: SearchCore::new(bounds.default_setpoint, cancel),
        })
    }

    /// Always-available variant used when the configured one cannot be built.
    pub fn fallback(bounds: &SafetyBounds, cancel: CancellationToken) -> Self {
        let defaults = GridConfig::default();
        let mut space = SetpointSpace::from_bounds(bounds, defaults.temperature_step, defaults.humidity_step);
        if space.is_empty() {
            let sp = bounds.default_setpoint;
            space = SetpointSpace {
                temperatures: vec![sp.temperature],
                humidities: vec![sp.humidity],
                modes: vec![sp.mode],
            };
        }
        Self {
            space,
            core: SearchCore::new(bounds.default_setpoint, cancel),
        }
    }

    pub fn grid_size(&self) -> usize {
        self.space.size()
    }
}

impl SearchStrategy for GridSearch {
    fn optimize(&mut self, objective: &Objective) -> StrategyResult<Setpoint> {
        self.core.begin();
        info!(grid_size = self.space.size(), "grid search started");
        for candidate in self.space.iter() {
            self.core.check_cancel()?;
            self.core.evaluate(objective, &candidate);
        }
        self.core.finish(self.name())
    }

    fn best_params(&self) -> Setpoint {
        self.core.best_params()
    }

    fn best_objective(&self) -> f64 {
        self.core.best_objective()
    }

    fn bind_cancel(&mut self, token: CancellationToken) {
        self.core.bind_cancel(token);
    }

    fn stop(&self) {
        self.core.stop();
    }

    fn name(&self) -> &str {
        "grid_search"
    }
}

// ---- Random search ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomConfig {
    pub n_iterations: usize,
    pub seed: Option<u64>,
}

impl Default for RandomConfig {
    fn default() -> Self {
        Self {
            n_iterations: 50,
            seed: None,
        }
    }
}

/// Independent uniform sampling of the admissible box.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    config: RandomConfig,
    bounds: SafetyBounds,
    rng: ChaCha8Rng,
    core: SearchCore,
}

impl RandomSearch {
    pub fn new(config: RandomConfig, bounds: &SafetyBounds, cancel: CancellationToken) -> StrategyResult<Self> {
        if config.n_iterations == 0 {
            return Err(StrategyError::InvalidConfig {
                message: "random.n_iterations must be at least 1".to_string(),
            });
        }
        Ok(Self {
            rng: seeded_rng(config.seed),
            config,
            bounds: bounds.clone(),
            core: SearchCore::new(bounds.default_setpoint, cancel),
        })
    }

    fn sample_one(&mut self) -> Setpoint {
        let t = self
            .rng
            .gen_range(self.bounds.temperature.min..=self.bounds.temperature.max);
        let h = self
            .rng
            .gen_range(self.bounds.humidity.min..=self.bounds.humidity.max);
        let m = self.bounds.modes[self.rng.gen_range(0..self.bounds.modes.len())];
        Setpoint::new((t * 10.0).round() / 10.0, (h * 10.0).round() / 10.0, m)
    }
}

impl SearchStrategy for RandomSearch {
    fn optimize(&mut self, objective: &Objective) -> StrategyResult<Setpoint> {
        self.core.begin();
        info!(n_iterations = self.config.n_iterations, "random search started");
        for _ in 0..self.config.n_iterations {
            self.core.check_cancel()?;
            let candidate = self.sample_one();
            self.core.evaluate(objective, &candidate);
        }
        self.core.finish(self.name())
    }

    fn best_params(&self) -> Setpoint {
        self.core.best_params()
    }

    fn best_objective(&self) -> f64 {
        self.core.best_objective()
    }

    fn bind_cancel(&mut self, token: CancellationToken) {
        self.core.bind_cancel(token);
    }

    fn stop(&self) {
        self.core.stop();
    }

    fn name(&self) -> &str {
        "random_search"
    }
}

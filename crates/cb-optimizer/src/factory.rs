//! Algorithm selection with a guaranteed fallback.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use cb_types::{CancellationToken, SafetyBounds, StrategyError, StrategyResult};

use crate::annealing::{AnnealingConfig, SimulatedAnnealing};
use crate::bayesian::{BayesianConfig, BayesianSearch};
use crate::genetic::{GeneticConfig, GeneticSearch};
use crate::objective::ObjectiveWeights;
use crate::reinforcement::{ReinforcementConfig, ReinforcementSearch};
use crate::search::{GridConfig, GridSearch, RandomConfig, RandomSearch, SearchStrategy};

/// The closed set of available search algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    GridSearch,
    RandomSearch,
    SimulatedAnnealing,
    Genetic,
    Bayesian,
    ReinforcementLearning,
}

impl Algorithm {
    pub const ALL: [Algorithm; 6] = [
        Algorithm::GridSearch,
        Algorithm::RandomSearch,
        Algorithm::SimulatedAnnealing,
        Algorithm::Genetic,
        Algorithm::Bayesian,
        Algorithm::ReinforcementLearning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::GridSearch => "grid_search",
            Algorithm::RandomSearch => "random_search",
            Algorithm::SimulatedAnnealing => "simulated_annealing",
            Algorithm::Genetic => "genetic",
            Algorithm::Bayesian => "bayesian",
            Algorithm::ReinforcementLearning => "reinforcement_learning",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Algorithm::GridSearch => "exhaustive search over the discretized setpoint grid",
            Algorithm::RandomSearch => "uniform random sampling with a fixed iteration budget",
            Algorithm::SimulatedAnnealing => "single-step moves with Metropolis acceptance and geometric cooling",
            Algorithm::Genetic => "tournament selection, single-point crossover, mutation and elitism",
            Algorithm::Bayesian => "kernel surrogate with lower-confidence-bound acquisition",
            Algorithm::ReinforcementLearning => "tabular actor-critic over setpoint moves",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = StrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "grid" | "grid_search" => Ok(Algorithm::GridSearch),
            "random" | "random_search" => Ok(Algorithm::RandomSearch),
            "annealing" | "simulated_annealing" | "sa" => Ok(Algorithm::SimulatedAnnealing),
            "genetic" | "ga" => Ok(Algorithm::Genetic),
            "bayesian" | "bayes" => Ok(Algorithm::Bayesian),
            "reinforcement_learning" | "rl" => Ok(Algorithm::ReinforcementLearning),
            _ => Err(StrategyError::UnknownAlgorithm { name: s.to_string() }),
        }
    }
}

/// Optimizer section of the application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Algorithm name; parsed leniently (case, aliases).
    pub algorithm: String,
    pub objective: ObjectiveWeights,
    pub grid: GridConfig,
    pub random: RandomConfig,
    pub annealing: AnnealingConfig,
    pub genetic: GeneticConfig,
    pub bayesian: BayesianConfig,
    pub reinforcement: ReinforcementConfig,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Bayesian.as_str().to_string(),
            objective: ObjectiveWeights::default(),
            grid: GridConfig::default(),
            random: RandomConfig::default(),
            annealing: AnnealingConfig::default(),
            genetic: GeneticConfig::default(),
            bayesian: BayesianConfig::default(),
            reinforcement: ReinforcementConfig::default(),
        }
    }
}

/// Build the configured strategy, failing on an unknown name or bad config.
pub fn try_build_strategy(
    settings: &OptimizerSettings,
    bounds: &SafetyBounds,
    cancel: CancellationToken,
) -> StrategyResult<Box<dyn SearchStrategy>> {
    let algorithm: Algorithm = settings.algorithm.parse()?;
    let strategy: Box<dyn SearchStrategy> = match algorithm {
        Algorithm::GridSearch => Box::new(GridSearch::new(settings.grid.clone(), bounds, cancel)?),
        Algorithm::RandomSearch => Box::new(RandomSearch::new(settings.random.clone(), bounds, cancel)?),
        Algorithm::SimulatedAnnealing => {
            Box::new(SimulatedAnnealing::new(settings.annealing.clone(), bounds, cancel)?)
        }
        Algorithm::Genetic => Box::new(GeneticSearch::new(settings.genetic.clone(), bounds, cancel)?),
        Algorithm::Bayesian => Box::new(BayesianSearch::new(settings.bayesian.clone(), bounds, cancel)?),
        Algorithm::ReinforcementLearning => Box::new(ReinforcementSearch::new(
            settings.reinforcement.clone(),
            bounds,
            cancel,
        )?),
    };
    Ok(strategy)
}

/// Build the configured strategy, substituting grid search (and logging the
/// reason) when it cannot be constructed. Never fails.
pub fn build_strategy(
    settings: &OptimizerSettings,
    bounds: &SafetyBounds,
    cancel: CancellationToken,
) -> Box<dyn SearchStrategy> {
    match try_build_strategy(settings, bounds, cancel.clone()) {
        Ok(strategy) => {
            info!(algorithm = strategy.name(), "optimizer strategy created");
            strategy
        }
        Err(err) => {
            warn!(
                requested = %settings.algorithm,
                error = %err,
                fallback = Algorithm::GridSearch.as_str(),
                "could not build optimizer strategy, falling back"
            );
            Box::new(GridSearch::fallback(bounds, cancel))
        }
    }
}

//! # cb-optimizer
//!
//! Setpoint search for CoolBack.
//!
//! Provides the power objective shared by all strategies, the
//! [`SearchStrategy`] interface with grid, random, simulated annealing,
//! genetic, Bayesian-style and reinforcement-learning-style variants, trial
//! tracking, and the factory that maps configured algorithm names onto a
//! strategy with a grid-search fallback.

mod annealing;
mod bayesian;
mod factory;
mod genetic;
mod objective;
mod reinforcement;
mod search;
mod trial;

pub use annealing::{AnnealingConfig, SimulatedAnnealing};
pub use bayesian::{BayesianConfig, BayesianSearch};
pub use factory::{build_strategy, try_build_strategy, Algorithm, OptimizerSettings};
pub use genetic::{GeneticConfig, GeneticSearch};
pub use objective::{Objective, ObjectiveWeights};
pub use reinforcement::{ReinforcementConfig, ReinforcementSearch};
pub use search::{
    GridConfig, GridSearch, RandomConfig, RandomSearch, SearchCore, SearchStrategy, SetpointSpace,
};
pub use trial::{Study, StudyId, Trial, TrialStatus};

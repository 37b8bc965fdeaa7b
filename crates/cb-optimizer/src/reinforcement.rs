//! Episodic actor-critic over setpoint moves.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cb_types::{CancellationToken, SafetyBounds, Setpoint, StrategyError, StrategyResult};

use crate::objective::Objective;
use crate::search::{seeded_rng, GridConfig, SearchCore, SearchStrategy, SetpointSpace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReinforcementConfig {
    pub episodes: usize,
    pub max_steps_per_episode: usize,
    /// Actor (policy preference) step size.
    pub learning_rate: f64,
    /// Critic (state value) step size.
    pub value_learning_rate: f64,
    pub gamma: f64,
    /// Objective units per unit of reward.
    pub reward_scale: f64,
    /// Reward assigned to an infeasible state.
    pub infeasible_penalty: f64,
    pub seed: Option<u64>,
}

impl Default for ReinforcementConfig {
    fn default() -> Self {
        Self {
            episodes: 100,
            max_steps_per_episode: 200,
            learning_rate: 0.1,
            value_learning_rate: 0.1,
            gamma: 0.99,
            reward_scale: 1000.0,
            infeasible_penalty: 10.0,
            seed: None,
        }
    }
}

impl ReinforcementConfig {
    fn validate(&self) -> StrategyResult<()> {
        let fail = |message: String| Err(StrategyError::InvalidConfig { message });
        if self.episodes == 0 || self.max_steps_per_episode == 0 {
            return fail("reinforcement episodes and steps must be at least 1".to_string());
        }
        if !(0.0..1.0).contains(&self.gamma) {
            return fail(format!("reinforcement.gamma must be in [0, 1), got {}", self.gamma));
        }
        if !(self.learning_rate > 0.0 && self.value_learning_rate > 0.0) {
            return fail("reinforcement learning rates must be positive".to_string());
        }
        if !(self.reward_scale.is_finite() && self.reward_scale > 0.0) {
            return fail("reinforcement.reward_scale must be positive".to_string());
        }
        Ok(())
    }
}

/// One move: temperature delta, humidity delta (both in grid steps) and
/// whether to switch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Action {
    dt: i8,
    dh: i8,
    switch_mode: bool,
}

fn action_table() -> Vec<Action> {
    let mut actions = Vec::with_capacity(18);
    for dt in [-1, 0, 1] {
        for dh in [-1, 0, 1] {
            for switch_mode in [false, true] {
                actions.push(Action { dt, dh, switch_mode });
            }
        }
    }
    actions
}

type Cell = (usize, usize, usize);

/// Tabular actor-critic: softmax policy preferences and a state-value table
/// over the discretized setpoint grid, trained online with one-step TD
/// errors. Reward is the negated objective scaled by `reward_scale`.
#[derive(Debug, Clone)]
pub struct ReinforcementSearch {
    config: ReinforcementConfig,
    space: SetpointSpace,
    actions: Vec<Action>,
    preferences: Vec<f64>,
    values: Vec<f64>,
    rng: ChaCha8Rng,
    core: SearchCore,
}

impl ReinforcementSearch {
    pub fn new(config: ReinforcementConfig, bounds: &SafetyBounds, cancel: CancellationToken) -> StrategyResult<Self> {
        config.validate()?;
        let grid = GridConfig::default();
        let space = SetpointSpace::from_bounds(bounds, grid.temperature_step, grid.humidity_step);
        if space.is_empty() {
            return Err(StrategyError::InvalidConfig {
                message: "reinforcement state space is empty".to_string(),
            });
        }
        let actions = action_table();
        let states = space.size();
        Ok(Self {
            rng: seeded_rng(config.seed),
            preferences: vec![0.0; states * actions.len()],
            values: vec![0.0; states],
            actions,
            space,
            config,
            core: SearchCore::new(bounds.default_setpoint, cancel),
        })
    }

    fn state_index(&self, cell: Cell) -> usize {
        let (_, nh, nm) = self.space.dims();
        (cell.0 * nh + cell.1) * nm + cell.2
    }

    fn step(&self, cell: Cell, action: Action) -> Cell {
        let (nt, nh, nm) = self.space.dims();
        let shift = |i: usize, d: i8, n: usize| (i as i64 + d as i64).clamp(0, n as i64 - 1) as usize;
        let mode = if action.switch_mode && nm > 1 {
            (cell.2 + 1) % nm
        } else {
            cell.2
        };
        (shift(cell.0, action.dt, nt), shift(cell.1, action.dh, nh), mode)
    }

    fn policy(&self, state: usize) -> Vec<f64> {
        let n = self.actions.len();
        let prefs = &self.preferences[state * n..(state + 1) * n];
        let max = prefs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = prefs.iter().map(|p| (p - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.into_iter().map(|e| e / total).collect()
    }

    fn sample_action(&mut self, probs: &[f64]) -> usize {
        let draw: f64 = self.rng.gen();
        let mut acc = 0.0;
        for (i, p) in probs.iter().enumerate() {
            acc += p;
            if draw < acc {
                return i;
            }
        }
        probs.len() - 1
    }

    fn reward(&self, value: f64) -> f64 {
        if value.is_finite() {
            -value / self.config.reward_scale
        } else {
            -self.config.infeasible_penalty
        }
    }

    fn run_episode(&mut self, objective: &Objective, start: Cell) -> StrategyResult<f64> {
        let mut cell = start;
        let mut total_reward = 0.0;
        let n_actions = self.actions.len();

        for _ in 0..self.config.max_steps_per_episode {
            self.core.check_cancel()?;
            let state = self.state_index(cell);
            let probs = self.policy(state);
            let a = self.sample_action(&probs);
            let next = self.step(cell, self.actions[a]);

            let candidate = self.space.at(next.0, next.1, next.2);
            let value = self.core.evaluate(objective, &candidate);
            let reward = self.reward(value);
            total_reward += reward;

            let next_state = self.state_index(next);
            let td_error = reward + self.config.gamma * self.values[next_state] - self.values[state];
            self.values[state] += self.config.value_learning_rate * td_error;
            for (b, p) in probs.iter().enumerate() {
                let indicator = if b == a { 1.0 } else { 0.0 };
                self.preferences[state * n_actions + b] += self.config.learning_rate * td_error * (indicator - p);
            }

            cell = next;
        }
        Ok(total_reward)
    }
}

impl SearchStrategy for ReinforcementSearch {
    fn optimize(&mut self, objective: &Objective) -> StrategyResult<Setpoint> {
        self.core.begin();
        info!(
            episodes = self.config.episodes,
            max_steps = self.config.max_steps_per_episode,
            "reinforcement search started"
        );

        let start = self.space.index_of(&self.core.start_point());
        self.core.check_cancel()?;
        let start_setpoint = self.space.at(start.0, start.1, start.2);
        self.core.evaluate(objective, &start_setpoint);

        let mut best_episode = f64::NEG_INFINITY;
        for episode in 0..self.config.episodes {
            self.core.check_cancel()?;
            let episode_reward = self.run_episode(objective, start)?;
            best_episode = best_episode.max(episode_reward);
            if episode % 10 == 0 {
                debug!(episode, reward = episode_reward, best_episode, "reinforcement episode");
            }
        }

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
        "reinforcement_learning"
    }
}

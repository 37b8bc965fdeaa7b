use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cb_types::{CancellationToken, SafetyBounds, Setpoint, StrategyError, StrategyResult};

use crate::objective::Objective;
use crate::search::{seeded_rng, SearchCore, SearchStrategy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnealingConfig {
    pub initial_temperature: f64,
    pub min_temperature: f64,
    /// Geometric cooling factor applied after each round.
    pub cooling_rate: f64,
    pub max_iterations: usize,
    pub iterations_per_temp: usize,
    pub temperature_step: f64,
    pub humidity_step: f64,
    pub seed: Option<u64>,
}

impl Default for AnnealingConfig {
    fn default() -> Self {
        Self {
            initial_temperature: 10.0,
            min_temperature: 0.5,
            cooling_rate: 0.85,
            max_iterations: 50,
            iterations_per_temp: 5,
            temperature_step: 1.0,
            humidity_step: 5.0,
            seed: None,
        }
    }
}

impl AnnealingConfig {
    fn validate(&self) -> StrategyResult<()> {
        let fail = |message: String| StrategyError::InvalidConfig { message };
        if !(self.initial_temperature > self.min_temperature && self.min_temperature > 0.0) {
            return Err(fail(format!(
                "annealing temperatures must satisfy initial > min > 0, got {} / {}",
                self.initial_temperature, self.min_temperature
            )));
        }
        if !(self.cooling_rate > 0.0 && self.cooling_rate < 1.0) {
            return Err(fail(format!(
                "annealing.cooling_rate must be in (0, 1), got {}",
                self.cooling_rate
            )));
        }
        if self.max_iterations == 0 || self.iterations_per_temp == 0 {
            return Err(fail("annealing iteration counts must be at least 1".to_string()));
        }
        if !(self.temperature_step > 0.0 && self.humidity_step > 0.0) {
            return Err(fail("annealing steps must be positive".to_string()));
        }
        Ok(())
    }
}

/// Simulated annealing over single-step setpoint moves.
#[derive(Debug, Clone)]
pub struct SimulatedAnnealing {
    config: AnnealingConfig,
    bounds: SafetyBounds,
    rng: ChaCha8Rng,
    core: SearchCore,
}

impl SimulatedAnnealing {
    pub fn new(config: AnnealingConfig, bounds: &SafetyBounds, cancel: CancellationToken) -> StrategyResult<Self> {
        config.validate()?;
        Ok(Self {
            rng: seeded_rng(config.seed),
            config,
            bounds: bounds.clone(),
            core: SearchCore::new(bounds.default_setpoint, cancel),
        })
    }

    /// Move each axis by -step, 0 or +step and possibly switch mode, staying
    /// inside the admissible box.
    fn neighbor(&mut self, current: &Setpoint) -> Setpoint {
        let t_step = self.config.temperature_step;
        let h_step = self.config.humidity_step;
        let dt = *[-t_step, 0.0, t_step].choose(&mut self.rng).unwrap_or(&0.0);
        let dh = *[-h_step, 0.0, h_step].choose(&mut self.rng).unwrap_or(&0.0);
        let mode = if self.rng.gen_bool(0.5) {
            current.mode
        } else {
            self.bounds
                .modes
                .choose(&mut self.rng)
                .copied()
                .unwrap_or(current.mode)
        };

        Setpoint::new(
            self.bounds.temperature.clamp(current.temperature + dt),
            self.bounds.humidity.clamp(current.humidity + dh),
            mode,
        )
    }

    /// Metropolis criterion; infinite deltas are never accepted.
    fn accept(&mut self, delta: f64, temperature: f64) -> bool {
        if delta < 0.0 {
            return true;
        }
        if !delta.is_finite() {
            return false;
        }
        self.rng.gen::<f64>() < (-delta / temperature).exp()
    }
}

impl SearchStrategy for SimulatedAnnealing {
    fn optimize(&mut self, objective: &Objective) -> StrategyResult<Setpoint> {
        self.core.begin();
        info!(
            initial_temperature = self.config.initial_temperature,
            min_temperature = self.config.min_temperature,
            cooling_rate = self.config.cooling_rate,
            max_iterations = self.config.max_iterations,
            "simulated annealing started"
        );

        let mut current = self.bounds.clamp(&self.core.start_point());
        self.core.check_cancel()?;
        let mut current_value = self.core.evaluate(objective, &current);

        let mut temperature = self.config.initial_temperature;
        let mut iteration = 0;
        while temperature > self.config.min_temperature && iteration < self.config.max_iterations {
            for _ in 0..self.config.iterations_per_temp {
                self.core.check_cancel()?;
                iteration += 1;

                let candidate = self.neighbor(&current);
                let value = self.core.evaluate(objective, &candidate);
                let delta = if current_value.is_finite() {
                    value - current_value
                } else if value.is_finite() {
                    // Any feasible move improves on an infeasible start.
                    -1.0
                } else {
                    0.0
                };
                if self.accept(delta, temperature) {
                    current = candidate;
                    current_value = value;
                }

                if iteration >= self.config.max_iterations {
                    break;
                }
            }
            temperature *= self.config.cooling_rate;
            debug!(iteration, temperature, current = %current, "annealing round");
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
        "simulated_annealing"
    }
}

//! Power objective shared by every search strategy.

use serde::{Deserialize, Serialize};

use cb_types::{Observation, ObservedState, SafetyBounds, Setpoint};

/// Tunables for blending historical and current power.
///
/// `historical_weight` and `uncertainty_penalty` have no derivation behind
/// them; they are kept configurable rather than fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveWeights {
    /// Weight `w` in `w * historical + (1 - w) * current`.
    pub historical_weight: f64,
    /// Multiplier on current power when no history matches a candidate.
    pub uncertainty_penalty: f64,
    /// Score used when neither history nor a power reading is available.
    pub no_power_sentinel: f64,
    /// Max |Δ°C| for a historical setpoint to count as a match.
    pub temperature_tolerance: f64,
    /// Max |Δ%RH| for a historical setpoint to count as a match.
    pub humidity_tolerance: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            historical_weight: 0.7,
            uncertainty_penalty: 1.2,
            no_power_sentinel: 10_000.0,
            temperature_tolerance: 0.5,
            humidity_tolerance: 5.0,
        }
    }
}

impl ObjectiveWeights {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.historical_weight) {
            return Err(format!(
                "historical_weight must be in [0, 1], got {}",
                self.historical_weight
            ));
        }
        if !(self.uncertainty_penalty.is_finite() && self.uncertainty_penalty > 0.0) {
            return Err(format!(
                "uncertainty_penalty must be positive, got {}",
                self.uncertainty_penalty
            ));
        }
        if !(self.temperature_tolerance >= 0.0 && self.humidity_tolerance >= 0.0) {
            return Err("match tolerances must be non-negative".to_string());
        }
        if !self.no_power_sentinel.is_finite() {
            return Err("no_power_sentinel must be finite".to_string());
        }
        Ok(())
    }
}

/// Scores candidate setpoints for one device during one run.
///
/// Built from a snapshot of the controller's history so strategies never
/// touch the controller's locks while searching. Lower is better; infeasible
/// candidates score `f64::INFINITY`.
#[derive(Debug, Clone)]
pub struct Objective {
    history: Vec<Observation>,
    observed: ObservedState,
    bounds: SafetyBounds,
    weights: ObjectiveWeights,
}

impl Objective {
    pub fn new(
        history: Vec<Observation>,
        observed: ObservedState,
        bounds: SafetyBounds,
        weights: ObjectiveWeights,
    ) -> Self {
        Self {
            history,
            observed,
            bounds,
            weights,
        }
    }

    pub fn bounds(&self) -> &SafetyBounds {
        &self.bounds
    }

    pub fn observed(&self) -> &ObservedState {
        &self.observed
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Mean power of historical observations near `candidate` (same mode,
    /// within tolerance) whose measured outcome stayed safe.
    pub fn historical_objective(&self, candidate: &Setpoint) -> Option<f64> {
        let (sum, count) = self
            .history
            .iter()
            .filter(|obs| {
                obs.setpoint.matches(
                    candidate,
                    self.weights.temperature_tolerance,
                    self.weights.humidity_tolerance,
                )
            })
            .filter(|obs| self.bounds.is_safe_state(obs.final_temperature, obs.final_humidity))
            .filter(|obs| obs.power.is_finite())
            .fold((0.0, 0usize), |(sum, count), obs| (sum + obs.power, count + 1));

        (count > 0).then(|| sum / count as f64)
    }

    pub fn evaluate(&self, candidate: &Setpoint) -> f64 {
        if !self.bounds.is_candidate_feasible(candidate) {
            return f64::INFINITY;
        }

        let current = self.observed.current_power();
        match (self.historical_objective(candidate), current) {
            (Some(historical), Some(current)) => {
                let w = self.weights.historical_weight;
                w * historical + (1.0 - w) * current
            }
            (Some(historical), None) => historical,
            (None, Some(current)) if current > 0.0 => current * self.weights.uncertainty_penalty,
            (None, _) => self.weights.no_power_sentinel,
        }
    }
}

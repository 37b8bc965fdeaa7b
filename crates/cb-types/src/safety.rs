//! Hard safety envelope for commanded setpoints and observed states.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{CbError, CbResult};
use crate::setpoint::Setpoint;

/// Closed numeric interval `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

/// One field changed by [`SafetyBounds::clamp_with_report`].
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub field: &'static str,
    pub from: f64,
    pub to: f64,
}

/// Read-only safety configuration shared by every optimizer and the final
/// enforcement pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyBounds {
    /// Admissible setpoint temperature range in °C.
    pub temperature: Range,
    /// Admissible setpoint humidity range in %.
    pub humidity: Range,
    /// Operating modes a device may be commanded into.
    pub modes: Vec<u8>,
    /// Highest indoor temperature considered a safe outcome.
    pub max_safe_temperature: f64,
    /// Indoor humidity band considered a safe outcome.
    pub safe_humidity: Range,
    /// Conservative setpoint used whenever an optimization produces nothing usable.
    pub default_setpoint: Setpoint,
}

impl Default for SafetyBounds {
    fn default() -> Self {
        Self {
            temperature: Range::new(16.0, 30.0),
            humidity: Range::new(30.0, 70.0),
            modes: vec![0, 1],
            max_safe_temperature: 28.0,
            safe_humidity: Range::new(30.0, 70.0),
            default_setpoint: Setpoint::new(24.0, 50.0, 1),
        }
    }
}

impl SafetyBounds {
    /// Reject configurations that cannot produce a safe setpoint.
    pub fn validate(&self) -> CbResult<()> {
        if !self.temperature.is_valid() {
            return Err(CbError::Validation(format!(
                "invalid temperature range [{}, {}]",
                self.temperature.min, self.temperature.max
            )));
        }
        if !self.humidity.is_valid() {
            return Err(CbError::Validation(format!(
                "invalid humidity range [{}, {}]",
                self.humidity.min, self.humidity.max
            )));
        }
        if !self.safe_humidity.is_valid() {
            return Err(CbError::Validation(format!(
                "invalid safe humidity band [{}, {}]",
                self.safe_humidity.min, self.safe_humidity.max
            )));
        }
        if !self.max_safe_temperature.is_finite() {
            return Err(CbError::Validation("max_safe_temperature must be finite".to_string()));
        }
        if self.modes.is_empty() {
            return Err(CbError::Validation("at least one operating mode must be allowed".to_string()));
        }
        if !self.is_admissible(&self.default_setpoint) {
            return Err(CbError::Validation(format!(
                "default setpoint {} is outside the admissible ranges",
                self.default_setpoint
            )));
        }
        if !self.is_candidate_feasible(&self.default_setpoint) {
            return Err(CbError::Validation(format!(
                "default setpoint {} violates the safe envelope",
                self.default_setpoint
            )));
        }
        Ok(())
    }

    /// Inside the hard admissible ranges with an allowed mode.
    pub fn is_admissible(&self, setpoint: &Setpoint) -> bool {
        setpoint.is_complete()
            && self.temperature.contains(setpoint.temperature)
            && self.humidity.contains(setpoint.humidity)
            && self.modes.contains(&setpoint.mode)
    }

    /// A candidate is infeasible when its temperature exceeds the safe ceiling
    /// or its humidity leaves the safe band.
    pub fn is_candidate_feasible(&self, setpoint: &Setpoint) -> bool {
        setpoint.is_complete()
            && setpoint.temperature <= self.max_safe_temperature
            && self.safe_humidity.contains(setpoint.humidity)
    }

    /// Whether a measured outcome stayed within the safe envelope.
    pub fn is_safe_state(&self, temperature: f64, humidity: f64) -> bool {
        temperature.is_finite()
            && humidity.is_finite()
            && temperature <= self.max_safe_temperature
            && self.safe_humidity.contains(humidity)
    }

    /// Project a setpoint onto the admissible ranges.
    ///
    /// Non-finite fields are replaced by the default setpoint's value and
    /// disallowed modes by the default mode, so `clamp(clamp(x)) == clamp(x)`.
    pub fn clamp(&self, setpoint: &Setpoint) -> Setpoint {
        self.clamp_with_report(setpoint).0
    }

    pub fn clamp_with_report(&self, setpoint: &Setpoint) -> (Setpoint, Vec<Adjustment>) {
        let mut adjustments = Vec::new();

        let temperature = clamp_field(
            "temperature",
            setpoint.temperature,
            &self.temperature,
            self.default_setpoint.temperature,
            &mut adjustments,
        );
        let humidity = clamp_field(
            "humidity",
            setpoint.humidity,
            &self.humidity,
            self.default_setpoint.humidity,
            &mut adjustments,
        );

        let mode = if self.modes.contains(&setpoint.mode) {
            setpoint.mode
        } else {
            let replacement = if self.modes.contains(&self.default_setpoint.mode) {
                self.default_setpoint.mode
            } else {
                self.modes.iter().copied().min().unwrap_or(self.default_setpoint.mode)
            };
            adjustments.push(Adjustment {
                field: "mode",
                from: setpoint.mode as f64,
                to: replacement as f64,
            });
            replacement
        };

        (Setpoint::new(temperature, humidity, mode), adjustments)
    }

    /// Clamp and log one warning per adjusted field.
    pub fn enforce(&self, device: &str, setpoint: &Setpoint) -> Setpoint {
        let (clamped, adjustments) = self.clamp_with_report(setpoint);
        for adj in &adjustments {
            warn!(
                device = %device,
                field = adj.field,
                from = adj.from,
                to = adj.to,
                "setpoint adjusted into safety bounds"
            );
        }
        clamped
    }
}

fn clamp_field(
    field: &'static str,
    value: f64,
    range: &Range,
    fallback: f64,
    adjustments: &mut Vec<Adjustment>,
) -> f64 {
    let target = if value.is_finite() {
        range.clamp(value)
    } else {
        range.clamp(fallback)
    };
    // NaN never compares equal, so a NaN input is always reported.
    if target != value {
        adjustments.push(Adjustment {
            field,
            from: value,
            to: target,
        });
    }
    target
}

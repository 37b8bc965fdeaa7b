//! Whole-site control plan and its structural validation.
//!
//! Whatever the optimizers produce, the plan that reaches the writer either
//! has exactly one admissible setpoint per device or is replaced wholesale
//! by the safe defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use cb_types::{CbResult, ControlError, DeviceId, SafetyBounds, Setpoint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub fallback: bool,
    pub reason: Option<String>,
}

/// One setpoint per device, stored column-wise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlan {
    pub temperatures: Vec<f64>,
    pub humidities: Vec<f64>,
    pub modes: Vec<u8>,
    pub metadata: PlanMetadata,
}

impl ControlPlan {
    pub fn from_setpoints(setpoints: &[Setpoint]) -> Self {
        Self {
            temperatures: setpoints.iter().map(|s| s.temperature).collect(),
            humidities: setpoints.iter().map(|s| s.humidity).collect(),
            modes: setpoints.iter().map(|s| s.mode).collect(),
            metadata: PlanMetadata {
                timestamp: Utc::now(),
                success: true,
                fallback: false,
                reason: None,
            },
        }
    }

    /// `defaults` repeated for every device.
    pub fn fallback(defaults: &Setpoint, device_count: usize, reason: impl Into<String>) -> Self {
        let mut plan = Self::from_setpoints(&vec![*defaults; device_count]);
        plan.metadata.success = false;
        plan.metadata.fallback = true;
        plan.metadata.reason = Some(reason.into());
        plan
    }

    /// Parse loosely-typed optimizer output.
    pub fn from_json(value: &Value) -> CbResult<Self> {
        let obj = value.as_object().ok_or_else(|| invalid("plan is not an object"))?;

        let column = |key: &str| -> CbResult<Vec<f64>> {
            let items = obj
                .get(key)
                .ok_or_else(|| invalid(format!("missing field '{}'", key)))?
                .as_array()
                .ok_or_else(|| invalid(format!("field '{}' is not a list", key)))?;
            items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    v.as_f64()
                        .ok_or_else(|| invalid(format!("{}[{}] is not a number: {}", key, i, v)))
                })
                .collect()
        };

        let temperatures = column("temperatures")?;
        let humidities = column("humidities")?;
        let modes = column("modes")?
            .into_iter()
            .enumerate()
            .map(|(i, m)| {
                if m.is_finite() && m >= 0.0 && m <= u8::MAX as f64 && m.fract() == 0.0 {
                    Ok(m as u8)
                } else {
                    Err(invalid(format!("modes[{}] is not a mode code: {}", i, m)))
                }
            })
            .collect::<CbResult<Vec<u8>>>()?;

        Ok(Self {
            temperatures,
            humidities,
            modes,
            metadata: PlanMetadata {
                timestamp: Utc::now(),
                success: true,
                fallback: false,
                reason: None,
            },
        })
    }

    pub fn len(&self) -> usize {
        self.temperatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temperatures.is_empty()
    }

    pub fn setpoint(&self, index: usize) -> Option<Setpoint> {
        Some(Setpoint::new(
            *self.temperatures.get(index)?,
            *self.humidities.get(index)?,
            *self.modes.get(index)?,
        ))
    }

    pub fn setpoints(&self) -> Vec<Setpoint> {
        (0..self.len()).filter_map(|i| self.setpoint(i)).collect()
    }

    /// Check cardinality and finiteness against the device count.
    pub fn validate(&self, device_count: usize) -> CbResult<()> {
        let lens = [self.temperatures.len(), self.humidities.len(), self.modes.len()];
        if lens.iter().any(|&n| n != device_count) {
            return Err(invalid(format!(
                "expected {} entries per field, got temperatures={} humidities={} modes={}",
                device_count, lens[0], lens[1], lens[2]
            )));
        }
        if let Some(i) = self
            .temperatures
            .iter()
            .zip(&self.humidities)
            .position(|(t, h)| !t.is_finite() || !h.is_finite())
        {
            return Err(invalid(format!("non-finite setpoint at index {}", i)));
        }
        Ok(())
    }

    /// Clamp every entry into the hard bounds, logging each adjustment.
    pub fn enforce_safety_bounds(mut self, bounds: &SafetyBounds, devices: &[DeviceId]) -> Self {
        for i in 0..self.len() {
            let Some(sp) = self.setpoint(i) else { continue };
            let name = devices.get(i).map(DeviceId::as_str).unwrap_or("unknown");
            let clamped = bounds.enforce(name, &sp);
            self.temperatures[i] = clamped.temperature;
            self.humidities[i] = clamped.humidity;
            self.modes[i] = clamped.mode;
        }
        self
    }

    /// Validate `candidate`, replacing it with the defaults on any structural
    /// problem, then clamp.
    pub fn finalize(
        candidate: CbResult<ControlPlan>,
        bounds: &SafetyBounds,
        defaults: &Setpoint,
        devices: &[DeviceId],
    ) -> Self {
        let checked = candidate.and_then(|plan| plan.validate(devices.len()).map(|_| plan));
        let plan = match checked {
            Ok(plan) => plan,
            Err(err) => {
                warn!(
                    error = %err,
                    devices = devices.len(),
                    "control plan rejected, using safe defaults"
                );
                Self::fallback(defaults, devices.len(), err.to_string())
            }
        };
        let plan = plan.enforce_safety_bounds(bounds, devices);
        info!(
            devices = plan.len(),
            fallback = plan.metadata.fallback,
            "control plan finalized"
        );
        plan
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "temperatures": self.temperatures,
            "humidities": self.humidities,
            "modes": self.modes,
            "metadata": self.metadata,
        })
    }
}

fn invalid(message: impl Into<String>) -> cb_types::CbError {
    ControlError::InvalidPlan {
        message: message.into(),
    }
    .into()
}

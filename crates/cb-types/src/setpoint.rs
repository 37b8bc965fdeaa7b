use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a controlled cooling device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Telemetry point identifier as known by the time-series store
pub type PointId = String;

/// Role a telemetry point plays for its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointRole {
    SetpointTemperature,
    SetpointHumidity,
    ReturnTemperature,
    ReturnHumidity,
    Power,
    Mode,
}

impl PointRole {
    pub const ALL: [PointRole; 6] = [
        PointRole::SetpointTemperature,
        PointRole::SetpointHumidity,
        PointRole::ReturnTemperature,
        PointRole::ReturnHumidity,
        PointRole::Power,
        PointRole::Mode,
    ];

    /// Roles every configured device must expose.
    pub const REQUIRED: [PointRole; 2] = [PointRole::SetpointTemperature, PointRole::SetpointHumidity];

    pub fn as_str(&self) -> &'static str {
        match self {
            PointRole::SetpointTemperature => "setpoint_temperature",
            PointRole::SetpointHumidity => "setpoint_humidity",
            PointRole::ReturnTemperature => "return_temperature",
            PointRole::ReturnHumidity => "return_humidity",
            PointRole::Power => "power",
            PointRole::Mode => "mode",
        }
    }
}

impl fmt::Display for PointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PointRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        PointRole::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == normalized)
            .ok_or_else(|| format!("unknown point role: {s}"))
    }
}

/// A commanded operating point for one cooling unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Setpoint {
    /// Supply/return air temperature target in °C.
    pub temperature: f64,
    /// Relative humidity target in %.
    pub humidity: f64,
    /// Operating mode code (e.g. 0 = economizer, 1 = compressor).
    pub mode: u8,
}

impl Setpoint {
    pub fn new(temperature: f64, humidity: f64, mode: u8) -> Self {
        Self {
            temperature,
            humidity,
            mode,
        }
    }

    /// A setpoint is complete when every numeric field carries a real value.
    pub fn is_complete(&self) -> bool {
        self.temperature.is_finite() && self.humidity.is_finite()
    }

    /// True when `other` lies inside the given tolerance window and runs in
    /// the same mode.
    pub fn matches(&self, other: &Setpoint, temperature_tolerance: f64, humidity_tolerance: f64) -> bool {
        self.mode == other.mode
            && (self.temperature - other.temperature).abs() <= temperature_tolerance
            && (self.humidity - other.humidity).abs() <= humidity_tolerance
    }
}

impl Default for Setpoint {
    fn default() -> Self {
        Self::new(24.0, 50.0, 1)
    }
}

impl fmt::Display for Setpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}°C/{:.1}%/mode {}", self.temperature, self.humidity, self.mode)
    }
}

/// Where an observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservationSource {
    /// The setpoint was commanded by an optimization cycle.
    Optimization,
    /// The setpoint was observed without our intervention.
    Natural,
}

/// One historical record pairing a commanded setpoint with its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub device: DeviceId,
    pub setpoint: Setpoint,
    pub final_temperature: f64,
    pub final_humidity: f64,
    pub power: f64,
    pub timestamp: DateTime<Utc>,
    pub source: ObservationSource,
}

impl Observation {
    pub fn new(
        device: DeviceId,
        setpoint: Setpoint,
        final_temperature: f64,
        final_humidity: f64,
        power: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device,
            setpoint,
            final_temperature,
            final_humidity,
            power,
            timestamp,
            source: ObservationSource::Natural,
        }
    }

    pub fn with_source(mut self, source: ObservationSource) -> Self {
        self.source = source;
        self
    }

    pub fn applied_during_optimization(&self) -> bool {
        self.source == ObservationSource::Optimization
    }
}

/// Latest measured state of a device, as handed to an optimization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    pub device: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub return_temperature: Option<f64>,
    pub return_humidity: Option<f64>,
    pub power: Option<f64>,
    pub setpoint: Option<Setpoint>,
}

impl ObservedState {
    pub fn new(device: DeviceId, timestamp: DateTime<Utc>) -> Self {
        Self {
            device,
            timestamp,
            return_temperature: None,
            return_humidity: None,
            power: None,
            setpoint: None,
        }
    }

    pub fn with_power(mut self, power: f64) -> Self {
        self.power = Some(power);
        self
    }

    pub fn with_return(mut self, temperature: f64, humidity: f64) -> Self {
        self.return_temperature = Some(temperature);
        self.return_humidity = Some(humidity);
        self
    }

    pub fn with_setpoint(mut self, setpoint: Setpoint) -> Self {
        self.setpoint = Some(setpoint);
        self
    }

    /// No measured value at all; an optimization run has nothing to work from.
    pub fn is_empty(&self) -> bool {
        self.return_temperature.is_none()
            && self.return_humidity.is_none()
            && self.power.is_none()
            && self.setpoint.is_none()
    }

    /// Current power draw, ignoring non-finite and negative readings.
    pub fn current_power(&self) -> Option<f64> {
        self.power.filter(|p| p.is_finite() && *p >= 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setpoint_matches_within_tolerance() {
        let candidate = Setpoint::new(22.0, 45.0, 1);
        assert!(candidate.matches(&Setpoint::new(22.4, 49.0, 1), 0.5, 5.0));
        assert!(!candidate.matches(&Setpoint::new(22.6, 45.0, 1), 0.5, 5.0));
        assert!(!candidate.matches(&Setpoint::new(22.0, 45.0, 0), 0.5, 5.0));
    }

    #[test]
    fn test_setpoint_completeness() {
        assert!(Setpoint::default().is_complete());
        assert!(!Setpoint::new(f64::NAN, 50.0, 1).is_complete());
        assert!(!Setpoint::new(24.0, f64::INFINITY, 1).is_complete());
    }

    #[test]
    fn test_point_role_parsing() {
        assert_eq!("setpoint-temperature".parse::<PointRole>(), Ok(PointRole::SetpointTemperature));
        assert_eq!(" Power ".parse::<PointRole>(), Ok(PointRole::Power));
        assert!("voltage".parse::<PointRole>().is_err());
    }

    #[test]
    fn test_observed_state_emptiness() {
        let device = DeviceId::from("crac-01");
        let state = ObservedState::new(device.clone(), Utc::now());
        assert!(state.is_empty());

        let state = state.with_power(-3.0);
        assert!(!state.is_empty());
        assert_eq!(state.current_power(), None);

        let state = ObservedState::new(device, Utc::now()).with_power(12.5);
        assert_eq!(state.current_power(), Some(12.5));
    }

    #[test]
    fn test_observation_source_flag() {
        let obs = Observation::new(
            DeviceId::from("crac-01"),
            Setpoint::default(),
            24.5,
            48.0,
            110.0,
            Utc::now(),
        );
        assert!(!obs.applied_during_optimization());
        assert!(obs
            .with_source(ObservationSource::Optimization)
            .applied_during_optimization());
    }
}

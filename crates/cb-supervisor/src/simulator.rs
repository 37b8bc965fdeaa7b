// Synthetic cooling plant used by the service binary when no live telemetry
// backend is wired in.

use chrono::{DateTime, Duration, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use cb_data::{DeviceSpec, InMemoryTelemetry};
use cb_types::{PointRole, Setpoint};

/// Random-walk plant model: return air tracks the setpoint with noise, and
/// power falls as the setpoint rises.
#[derive(Debug, Clone)]
pub struct PlantSimulator {
    rng: ChaCha8Rng,
    /// kW drawn at a 24 degC setpoint.
    pub base_power: f64,
    /// kW saved per degree of setpoint increase.
    pub power_per_degree: f64,
}

impl PlantSimulator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            base_power: 120.0,
            power_per_degree: 6.0,
        }
    }

    /// One sample for `setpoint`: (return temperature, return humidity, power).
    pub fn respond(&mut self, setpoint: &Setpoint) -> (f64, f64, f64) {
        let rt = setpoint.temperature + 1.5 + self.rng.gen_range(-0.5..0.5);
        let rh = setpoint.humidity + self.rng.gen_range(-2.0..2.0);
        let power = self.base_power - self.power_per_degree * (setpoint.temperature - 24.0)
            + self.rng.gen_range(-3.0..3.0);
        (rt, rh, power.max(0.0))
    }

    /// Fill `store` with `samples` one-minute rows per device ending at `end`.
    pub fn seed_history(
        &mut self,
        store: &InMemoryTelemetry,
        devices: &[DeviceSpec],
        samples: usize,
        end: DateTime<Utc>,
    ) {
        for spec in devices {
            let mut setpoint = Setpoint::default();
            for i in 0..samples {
                let ts = end - Duration::minutes((samples - i) as i64);
                // Operators nudge the setpoint now and then.
                if self.rng.gen_bool(0.1) {
                    setpoint.temperature = (setpoint.temperature + self.rng.gen_range(-1.0..1.0)).clamp(20.0, 27.0);
                    setpoint.humidity = (setpoint.humidity + self.rng.gen_range(-3.0..3.0)).clamp(40.0, 60.0);
                }
                let (rt, rh, power) = self.respond(&setpoint);
                for (role, value) in [
                    (PointRole::SetpointTemperature, setpoint.temperature),
                    (PointRole::SetpointHumidity, setpoint.humidity),
                    (PointRole::ReturnTemperature, rt),
                    (PointRole::ReturnHumidity, rh),
                    (PointRole::Power, power),
                    (PointRole::Mode, setpoint.mode as f64),
                ] {
                    if let Some(point) = spec.points.get(&role) {
                        store.insert(point, ts, value);
                    }
                }
            }
            info!(device = %spec.id, samples, "synthetic history seeded");
        }
    }
}

impl Default for PlantSimulator {
    fn default() -> Self {
        Self::new(42)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_data::{QuerySpec, TelemetryReader};
    use std::collections::HashMap;

    fn device() -> DeviceSpec {
        let points: HashMap<PointRole, String> = [
            (PointRole::SetpointTemperature, "sp_t"),
            (PointRole::SetpointHumidity, "sp_h"),
            (PointRole::ReturnTemperature, "rt"),
            (PointRole::ReturnHumidity, "rh"),
            (PointRole::Power, "kw"),
        ]
        .into_iter()
        .map(|(r, p)| (r, p.to_string()))
        .collect();
        DeviceSpec {
            id: "crac-01".into(),
            name: String::new(),
            points,
        }
    }

    #[test]
    fn test_same_seed_same_history() {
        let end = Utc::now();
        let a = InMemoryTelemetry::new();
        let b = InMemoryTelemetry::new();
        PlantSimulator::new(7).seed_history(&a, &[device()], 50, end);
        PlantSimulator::new(7).seed_history(&b, &[device()], 50, end);

        let query = QuerySpec::trailing(vec!["kw".to_string()], Duration::hours(2));
        let kw_a = a.read("test", &query).unwrap();
        let kw_b = b.read("test", &query).unwrap();
        assert_eq!(kw_a["kw"].samples(), kw_b["kw"].samples());
        assert_eq!(kw_a["kw"].len(), 50);
    }

    #[test]
    fn test_warmer_setpoint_draws_less_power() {
        let mut sim = PlantSimulator::new(1);
        let cool: f64 = (0..100).map(|_| sim.respond(&Setpoint::new(20.0, 50.0, 1)).2).sum();
        let warm: f64 = (0..100).map(|_| sim.respond(&Setpoint::new(27.0, 50.0, 1)).2).sum();
        assert!(warm < cool);
    }
}

//! Time alignment of per-point series into device rows.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

use cb_types::{DeviceId, Observation, ObservedState, PointId, PointRole, Setpoint};

use crate::telemetry::TimeSeries;

/// Per-point series merged onto the union of their timestamps.
///
/// Gaps are forward-filled from the last known sample of the same point;
/// values before a point's first sample stay `None`.
#[derive(Debug, Clone, Default)]
pub struct TelemetryFrame {
    timestamps: Vec<DateTime<Utc>>,
    columns: HashMap<PointId, Vec<Option<f64>>>,
}

impl TelemetryFrame {
    pub fn align(series: &HashMap<PointId, TimeSeries>) -> Self {
        let timestamps: Vec<DateTime<Utc>> = series
            .values()
            .flat_map(|s| s.samples().iter().map(|(ts, _)| *ts))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut columns = HashMap::with_capacity(series.len());
        for (point, s) in series {
            let samples = s.samples();
            let mut column = Vec::with_capacity(timestamps.len());
            let mut cursor = 0;
            let mut last: Option<f64> = None;
            for ts in &timestamps {
                while cursor < samples.len() && samples[cursor].0 <= *ts {
                    if samples[cursor].1.is_finite() {
                        last = Some(samples[cursor].1);
                    }
                    cursor += 1;
                }
                column.push(last);
            }
            columns.insert(point.clone(), column);
        }

        Self { timestamps, columns }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn value(&self, point: &str, row: usize) -> Option<f64> {
        self.columns.get(point).and_then(|c| c.get(row).copied().flatten())
    }

    fn role_value(&self, points: &HashMap<PointRole, PointId>, role: PointRole, row: usize) -> Option<f64> {
        points.get(&role).and_then(|p| self.value(p, row))
    }

    /// Historical observations for one device. Rows without a complete
    /// setpoint, outcome and power reading are skipped.
    pub fn observations(
        &self,
        device: &DeviceId,
        points: &HashMap<PointRole, PointId>,
        default_mode: u8,
    ) -> Vec<Observation> {
        (0..self.len())
            .filter_map(|row| {
                let temperature = self.role_value(points, PointRole::SetpointTemperature, row)?;
                let humidity = self.role_value(points, PointRole::SetpointHumidity, row)?;
                let final_temperature = self.role_value(points, PointRole::ReturnTemperature, row)?;
                let final_humidity = self.role_value(points, PointRole::ReturnHumidity, row)?;
                let power = self.role_value(points, PointRole::Power, row)?;
                let mode = self
                    .role_value(points, PointRole::Mode, row)
                    .map(mode_code)
                    .unwrap_or(default_mode);
                Some(Observation::new(
                    device.clone(),
                    Setpoint::new(temperature, humidity, mode),
                    final_temperature,
                    final_humidity,
                    power,
                    self.timestamps[row],
                ))
            })
            .collect()
    }

    /// Latest row for one device, or `None` when the frame is empty.
    pub fn latest_state(
        &self,
        device: &DeviceId,
        points: &HashMap<PointRole, PointId>,
        default_mode: u8,
    ) -> Option<ObservedState> {
        let row = self.len().checked_sub(1)?;
        let mut state = ObservedState::new(device.clone(), self.timestamps[row]);
        state.return_temperature = self.role_value(points, PointRole::ReturnTemperature, row);
        state.return_humidity = self.role_value(points, PointRole::ReturnHumidity, row);
        state.power = self.role_value(points, PointRole::Power, row);

        let temperature = self.role_value(points, PointRole::SetpointTemperature, row);
        let humidity = self.role_value(points, PointRole::SetpointHumidity, row);
        if let (Some(t), Some(h)) = (temperature, humidity) {
            let mode = self
                .role_value(points, PointRole::Mode, row)
                .map(mode_code)
                .unwrap_or(default_mode);
            state.setpoint = Some(Setpoint::new(t, h, mode));
        }
        Some(state)
    }
}

fn mode_code(value: f64) -> u8 {
    value.round().clamp(0.0, u8::MAX as f64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn roles() -> HashMap<PointRole, PointId> {
        [
            (PointRole::SetpointTemperature, "sp_t"),
            (PointRole::SetpointHumidity, "sp_h"),
            (PointRole::ReturnTemperature, "rt"),
            (PointRole::ReturnHumidity, "rh"),
            (PointRole::Power, "kw"),
        ]
        .into_iter()
        .map(|(r, p)| (r, p.to_string()))
        .collect()
    }

    #[test]
    fn test_align_forward_fills() {
        let t0 = Utc::now();
        let mut series = HashMap::new();
        series.insert(
            "a".to_string(),
            TimeSeries::from_samples(vec![(t0, 1.0), (t0 + Duration::seconds(20), 3.0)]),
        );
        series.insert(
            "b".to_string(),
            TimeSeries::from_samples(vec![(t0 + Duration::seconds(10), 7.0)]),
        );

        let frame = TelemetryFrame::align(&series);
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.value("a", 1), Some(1.0));
        assert_eq!(frame.value("b", 0), None);
        assert_eq!(frame.value("b", 2), Some(7.0));
        assert_eq!(frame.value("missing", 0), None);
    }

    #[test]
    fn test_observations_skip_incomplete_rows() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(1);
        let mut series = HashMap::new();
        series.insert("sp_t".to_string(), TimeSeries::from_samples(vec![(t0, 22.0)]));
        series.insert("sp_h".to_string(), TimeSeries::from_samples(vec![(t0, 45.0)]));
        series.insert("rt".to_string(), TimeSeries::from_samples(vec![(t0, 23.0)]));
        series.insert("rh".to_string(), TimeSeries::from_samples(vec![(t0, 44.0)]));
        series.insert("kw".to_string(), TimeSeries::from_samples(vec![(t1, 100.0)]));

        let frame = TelemetryFrame::align(&series);
        let device = DeviceId::from("crac-01");
        let observations = frame.observations(&device, &roles(), 1);

        // Row t0 has no power yet; row t1 forward-fills everything else.
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].setpoint, Setpoint::new(22.0, 45.0, 1));
        assert_eq!(observations[0].power, 100.0);
        assert_eq!(observations[0].timestamp, t1);
    }

    #[test]
    fn test_latest_state() {
        let t0 = Utc::now();
        let mut series = HashMap::new();
        series.insert("kw".to_string(), TimeSeries::from_samples(vec![(t0, 80.0)]));
        series.insert("rt".to_string(), TimeSeries::from_samples(vec![(t0, 24.5)]));

        let frame = TelemetryFrame::align(&series);
        let state = frame
            .latest_state(&DeviceId::from("crac-01"), &roles(), 1)
            .unwrap();
        assert_eq!(state.power, Some(80.0));
        assert_eq!(state.return_temperature, Some(24.5));
        assert!(state.setpoint.is_none());

        let empty = TelemetryFrame::align(&HashMap::new());
        assert!(empty.latest_state(&DeviceId::from("crac-01"), &roles(), 1).is_none());
    }
}

//! Reference forecaster driving the training and inference loops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use cb_types::{CbResult, PointId};

use crate::telemetry::TimeSeries;

/// Trains on per-point history and predicts future point values.
pub trait Forecaster: Send + Sync {
    /// Fit from scratch. Returns how many points received a model.
    fn fit(&mut self, history: &HashMap<PointId, TimeSeries>) -> usize;

    /// Predicted value of every modelled point at `at`.
    fn predict(&self, at: DateTime<Utc>) -> HashMap<PointId, f64>;

    fn is_trained(&self) -> bool;
}

/// Least-squares line `value = intercept + slope * seconds_since(origin)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearTrend {
    pub origin: DateTime<Utc>,
    pub intercept: f64,
    pub slope: f64,
    pub samples: usize,
}

impl LinearTrend {
    /// Needs at least `min_samples` finite samples; a flat series gives a
    /// zero slope.
    pub fn fit(series: &TimeSeries, min_samples: usize) -> Option<Self> {
        let samples: Vec<(DateTime<Utc>, f64)> = series
            .samples()
            .iter()
            .copied()
            .filter(|(_, v)| v.is_finite())
            .collect();
        if samples.len() < min_samples.max(1) {
            return None;
        }

        let origin = samples[0].0;
        let n = samples.len() as f64;
        let xs: Vec<f64> = samples
            .iter()
            .map(|(ts, _)| (*ts - origin).num_milliseconds() as f64 / 1000.0)
            .collect();
        let mean_x = xs.iter().sum::<f64>() / n;
        let mean_y = samples.iter().map(|(_, v)| v).sum::<f64>() / n;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for (x, (_, y)) in xs.iter().zip(&samples) {
            sxx += (x - mean_x) * (x - mean_x);
            sxy += (x - mean_x) * (y - mean_y);
        }
        let slope = if sxx > f64::EPSILON { sxy / sxx } else { 0.0 };

        Some(Self {
            origin,
            intercept: mean_y - slope * mean_x,
            slope,
            samples: samples.len(),
        })
    }

    pub fn at(&self, ts: DateTime<Utc>) -> f64 {
        let x = (ts - self.origin).num_milliseconds() as f64 / 1000.0;
        self.intercept + self.slope * x
    }
}

/// One linear trend per point, checkpointed as JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinearTrendForecaster {
    models: HashMap<PointId, LinearTrend>,
    min_samples: usize,
    trained_at: Option<DateTime<Utc>>,
}

impl LinearTrendForecaster {
    pub fn new(min_samples: usize) -> Self {
        Self {
            models: HashMap::new(),
            min_samples,
            trained_at: None,
        }
    }

    pub fn trained_at(&self) -> Option<DateTime<Utc>> {
        self.trained_at
    }

    pub fn model(&self, point: &str) -> Option<&LinearTrend> {
        self.models.get(point)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> CbResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        // Write-then-rename so a crash never leaves a torn checkpoint.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> CbResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl Forecaster for LinearTrendForecaster {
    fn fit(&mut self, history: &HashMap<PointId, TimeSeries>) -> usize {
        self.models = history
            .iter()
            .filter_map(|(point, series)| {
                LinearTrend::fit(series, self.min_samples).map(|m| (point.clone(), m))
            })
            .collect();
        self.trained_at = Some(Utc::now());
        self.models.len()
    }

    fn predict(&self, at: DateTime<Utc>) -> HashMap<PointId, f64> {
        self.models
            .iter()
            .map(|(point, model)| (point.clone(), model.at(at)))
            .collect()
    }

    fn is_trained(&self) -> bool {
        !self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ramp(t0: DateTime<Utc>, n: i64, slope_per_min: f64) -> TimeSeries {
        TimeSeries::from_samples(
            (0..n)
                .map(|i| (t0 + Duration::minutes(i), 10.0 + slope_per_min * i as f64))
                .collect(),
        )
    }

    #[test]
    fn test_linear_trend_recovers_slope() {
        let t0 = Utc::now();
        let trend = LinearTrend::fit(&ramp(t0, 10, 2.0), 3).unwrap();
        assert!((trend.slope - 2.0 / 60.0).abs() < 1e-9);
        assert!((trend.at(t0 + Duration::minutes(20)) - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_fit_skips_short_series() {
        let t0 = Utc::now();
        let mut history = HashMap::new();
        history.insert("long".to_string(), ramp(t0, 10, 1.0));
        history.insert("short".to_string(), ramp(t0, 2, 1.0));

        let mut forecaster = LinearTrendForecaster::new(5);
        assert_eq!(forecaster.fit(&history), 1);
        assert!(forecaster.is_trained());
        let prediction = forecaster.predict(t0);
        assert!(prediction.contains_key("long"));
        assert!(!prediction.contains_key("short"));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("trend.json");

        let t0 = Utc::now();
        let mut history = HashMap::new();
        history.insert("kw".to_string(), ramp(t0, 6, 0.5));
        let mut forecaster = LinearTrendForecaster::new(3);
        forecaster.fit(&history);
        forecaster.save(&path).unwrap();

        let restored = LinearTrendForecaster::load(&path).unwrap();
        assert_eq!(restored.model("kw"), forecaster.model("kw"));
        assert!(LinearTrendForecaster::load(dir.path().join("absent.json")).is_err());
    }
}

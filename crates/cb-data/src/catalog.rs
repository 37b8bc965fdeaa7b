use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use cb_types::{CbError, CbResult, DeviceId, PointId, PointRole, TelemetryError};

/// Static description of one cooling device and its telemetry points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: DeviceId,
    #[serde(default)]
    pub name: String,
    pub points: HashMap<PointRole, PointId>,
}

impl DeviceSpec {
    pub fn new(id: &str) -> Self {
        Self {
            id: DeviceId::from(id),
            name: id.to_string(),
            points: HashMap::new(),
        }
    }

    pub fn with_point(mut self, role: PointRole, point: &str) -> Self {
        self.points.insert(role, point.to_string());
        self
    }
}

/// Read-only lookup of devices and their point roles.
pub trait DeviceCatalog: Send + Sync {
    fn get_devices(&self) -> Vec<DeviceId>;

    fn get_device_points(&self, device: &DeviceId) -> CbResult<HashMap<PointRole, PointId>>;

    /// Point id for a single role, failing if the device does not expose it.
    fn point_for(&self, device: &DeviceId, role: PointRole) -> CbResult<PointId> {
        let points = self.get_device_points(device)?;
        points.get(&role).cloned().ok_or_else(|| {
            TelemetryError::MissingPoint {
                device: device.to_string(),
                role: role.to_string(),
            }
            .into()
        })
    }
}

/// Catalog loaded once from configuration
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    devices: Vec<DeviceSpec>,
    index: HashMap<DeviceId, usize>,
}

impl StaticCatalog {
    /// Build the catalog, rejecting empty fleets, duplicate ids and devices
    /// without both setpoint points.
    pub fn new(devices: Vec<DeviceSpec>) -> CbResult<Self> {
        if devices.is_empty() {
            return Err(CbError::Config("device catalog is empty".to_string()));
        }

        let mut index = HashMap::with_capacity(devices.len());
        let mut seen_points = HashSet::new();
        for (i, device) in devices.iter().enumerate() {
            if index.insert(device.id.clone(), i).is_some() {
                return Err(CbError::Config(format!("duplicate device id: {}", device.id)));
            }
            for role in PointRole::REQUIRED {
                if !device.points.contains_key(&role) {
                    return Err(CbError::Config(format!(
                        "device {} is missing required point role {}",
                        device.id, role
                    )));
                }
            }
            for point in device.points.values() {
                if !seen_points.insert(point.clone()) {
                    return Err(CbError::Config(format!(
                        "point {point} is assigned to more than one role"
                    )));
                }
            }
        }

        Ok(Self { devices, index })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device(&self, id: &DeviceId) -> Option<&DeviceSpec> {
        self.index.get(id).map(|&i| &self.devices[i])
    }

    /// Every point id across the fleet, in device order.
    pub fn all_points(&self) -> Vec<PointId> {
        let mut points: Vec<PointId> = Vec::new();
        for device in &self.devices {
            for role in PointRole::ALL {
                if let Some(point) = device.points.get(&role) {
                    points.push(point.clone());
                }
            }
        }
        points
    }
}

impl DeviceCatalog for StaticCatalog {
    fn get_devices(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.id.clone()).collect()
    }

    fn get_device_points(&self, device: &DeviceId) -> CbResult<HashMap<PointRole, PointId>> {
        self.device(device)
            .map(|d| d.points.clone())
            .ok_or_else(|| {
                TelemetryError::UnknownDevice {
                    device: device.to_string(),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crac(id: &str) -> DeviceSpec {
        DeviceSpec::new(id)
            .with_point(PointRole::SetpointTemperature, &format!("{id}.sp_t"))
            .with_point(PointRole::SetpointHumidity, &format!("{id}.sp_h"))
            .with_point(PointRole::Power, &format!("{id}.kw"))
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = StaticCatalog::new(vec![crac("crac-01"), crac("crac-02")]).unwrap();
        assert_eq!(catalog.get_devices().len(), 2);

        let id = DeviceId::from("crac-02");
        let point = catalog.point_for(&id, PointRole::Power).unwrap();
        assert_eq!(point, "crac-02.kw");

        assert!(catalog.point_for(&id, PointRole::ReturnHumidity).is_err());
        assert!(catalog.get_device_points(&DeviceId::from("missing")).is_err());
    }

    #[test]
    fn test_catalog_rejects_missing_setpoint_role() {
        let incomplete = DeviceSpec::new("crac-01").with_point(PointRole::SetpointTemperature, "t");
        assert!(StaticCatalog::new(vec![incomplete]).is_err());
    }

    #[test]
    fn test_catalog_rejects_empty_and_duplicates() {
        assert!(StaticCatalog::new(Vec::new()).is_err());

        let mut dup = crac("crac-01");
        dup.points.insert(PointRole::Power, "other.kw".to_string());
        dup.points.insert(PointRole::SetpointTemperature, "x.sp_t".to_string());
        dup.points.insert(PointRole::SetpointHumidity, "x.sp_h".to_string());
        assert!(StaticCatalog::new(vec![crac("crac-01"), dup]).is_err());
    }

    #[test]
    fn test_all_points_in_device_order() {
        let catalog = StaticCatalog::new(vec![crac("a"), crac("b")]).unwrap();
        let points = catalog.all_points();
        assert_eq!(points.len(), 6);
        assert_eq!(points[0], "a.sp_t");
        assert_eq!(points[3], "b.sp_t");
    }
}

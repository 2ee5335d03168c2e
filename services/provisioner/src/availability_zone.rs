//! Availability zone selection.

use crate::error::{CloudError, Result};

const FALLBACK_ZONE: &str = "us-east-1a";

/// Decides where instances and volumes are placed.
pub trait AvailabilityZoneSelector: Send + Sync {
    /// The one zone shared by the volumes, the requested zone and the
    /// default, or `None` if nothing constrains placement.
    ///
    /// Fails when more than one distinct zone is involved.
    fn common_availability_zone(
        &self,
        volume_zones: &[String],
        requested: Option<&str>,
        default: Option<&str>,
    ) -> Result<Option<String>>;

    /// Zone for a new volume, given the zone of the instance it is for.
    fn select_availability_zone(&self, instance_zone: Option<&str>) -> String;
}

/// Selector derived from the configured region.
#[derive(Debug, Clone, Default)]
pub struct RegionZoneSelector {
    region: Option<String>,
    default_zone: Option<String>,
}

impl RegionZoneSelector {
    pub fn new(region: Option<String>, default_zone: Option<String>) -> Self {
        Self {
            region,
            default_zone,
        }
    }

    fn default_zone(&self) -> String {
        match (&self.default_zone, &self.region) {
            (Some(zone), _) => zone.clone(),
            (None, Some(region)) => format!("{region}b"),
            (None, None) => FALLBACK_ZONE.to_string(),
        }
    }
}

impl AvailabilityZoneSelector for RegionZoneSelector {
    fn common_availability_zone(
        &self,
        volume_zones: &[String],
        requested: Option<&str>,
        default: Option<&str>,
    ) -> Result<Option<String>> {
        let mut zones: Vec<&str> = Vec::new();
        let candidates = volume_zones
            .iter()
            .map(String::as_str)
            .chain(requested)
            .chain(default);
        for zone in candidates {
            if !zones.contains(&zone) {
                zones.push(zone);
            }
        }

        match zones.as_slice() {
            [] => Ok(None),
            [zone] => Ok(Some(zone.to_string())),
            _ => Err(CloudError::cloud(format!(
                "can't use multiple availability zones: {}",
                zones.join(", ")
            ))),
        }
    }

    fn select_availability_zone(&self, instance_zone: Option<&str>) -> String {
        instance_zone
            .map(String::from)
            .unwrap_or_else(|| self.default_zone())
    }
}

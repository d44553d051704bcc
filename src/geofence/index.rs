//! Nearest-location lookup over a static location set

use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::error::Result;
use crate::gps::Fix;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A named point of interest
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Location {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lng")]
    pub longitude: f64,
}

impl Location {
    pub fn new(id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            latitude,
            longitude,
        }
    }
}

/// Closest location to a fix
#[derive(Debug, Clone, PartialEq)]
pub struct ProximityResult {
    pub location_id: String,
    pub distance_meters: f64,
}

/// Great-circle distance in meters (haversine)
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_phi = (lat2 - lat1).to_radians();
    let delta_lambda = (lon2 - lon1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Read-only index over a location set, in input order
#[derive(Debug, Clone, Default)]
pub struct GeofenceIndex {
    locations: Vec<Location>,
}

impl GeofenceIndex {
    pub fn new(locations: Vec<Location>) -> Self {
        Self { locations }
    }

    /// Load a JSON array of `{id, lat, lng}` objects
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not a location array.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let locations: Vec<Location> = serde_json::from_str(&contents)?;
        info!(
            "Loaded {} locations from {}",
            locations.len(),
            path.as_ref().display()
        );
        Ok(Self::new(locations))
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    /// Closest location to `fix`, or `None` for an empty set
    ///
    /// Linear scan; on equal distances the earlier location wins.
    pub fn nearest(&self, fix: &Fix) -> Option<ProximityResult> {
        let mut best: Option<(&Location, f64)> = None;

        for location in &self.locations {
            let distance = haversine_distance(
                fix.latitude,
                fix.longitude,
                location.latitude,
                location.longitude,
            );
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((location, distance)),
            }
        }

        best.map(|(location, distance)| ProximityResult {
            location_id: location.id.clone(),
            distance_meters: distance,
        })
    }
}

/// Holder for the current index, replaced wholesale on reload
#[derive(Debug, Default)]
pub struct SharedIndex {
    current: RwLock<Arc<GeofenceIndex>>,
}

impl SharedIndex {
    pub fn new(index: GeofenceIndex) -> Self {
        Self {
            current: RwLock::new(Arc::new(index)),
        }
    }

    /// The index in effect right now
    pub fn current(&self) -> Arc<GeofenceIndex> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new index; readers holding the old one keep it
    pub fn replace(&self, index: GeofenceIndex) {
        let next = Arc::new(index);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Integer(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Integer(n) => n.to_string(),
    })
}

//! # Geofence Module
//!
//! Proximity detection against a static location set.
//!
//! This module handles:
//! - Haversine distance and nearest-location lookup ([`GeofenceIndex`])
//! - Wholesale index replacement ([`SharedIndex`])
//! - The distance/speed rule with per-location debouncing ([`EventDecider`])

pub mod decider;
pub mod index;

pub use decider::{run_decision_loop, CaptureEvent, EventDecider, TriggerMode};
pub use index::{haversine_distance, GeofenceIndex, Location, ProximityResult, SharedIndex};

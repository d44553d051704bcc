//! # Event Decider
//!
//! Turns the current fix into discrete capture events using the geofence
//! distance rule, a speed gate and per-location debouncing.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::index::{GeofenceIndex, SharedIndex};
use crate::error::Result;
use crate::gps::{Fix, FixCell};

/// Which side of the speed threshold triggers a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Fire when slower than the threshold (vehicle stopped at the location)
    Stationary,
    /// Fire when faster than the threshold
    Moving,
}

/// A debounced "at location X" event
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureEvent {
    pub location_id: String,
    pub fix: Fix,
    pub kind: TriggerMode,
}

impl CaptureEvent {
    /// File stem the capture is stored under
    ///
    /// `<device>_<type>_<yymmdd-HHMMSS>_<lat>,<lng>_<speed>kmh_<location>`
    pub fn file_stem(&self, device_id: &str, device_type: &str) -> String {
        let stamp = self
            .fix
            .timestamp
            .map(|t| t.format("%y%m%d-%H%M%S").to_string())
            .unwrap_or_else(|| "000000-000000".to_string());
        format!(
            "{}_{}_{}_{:.6},{:.6}_{:.1}kmh_{}",
            device_id,
            device_type,
            stamp,
            self.fix.latitude,
            self.fix.longitude,
            self.fix.speed_kmh,
            self.location_id
        )
    }

    /// Image-info body announcing the capture stored as `file_name`
    pub fn image_info(&self, file_name: &str) -> Value {
        let date = self
            .fix
            .timestamp
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        json!({
            "file_name": file_name,
            "date": date,
            "lat": self.fix.latitude.to_string(),
            "lng": self.fix.longitude.to_string(),
            "id": self.location_id,
            "detection": 0,
        })
    }
}

/// Geofence/speed rule with debounce state
#[derive(Debug, Clone)]
pub struct EventDecider {
    distance_threshold_m: f64,
    speed_threshold_kmh: f64,
    mode: TriggerMode,
    active_location: Option<String>,
}

impl EventDecider {
    pub fn new(distance_threshold_m: f64, speed_threshold_kmh: f64, mode: TriggerMode) -> Self {
        Self {
            distance_threshold_m,
            speed_threshold_kmh,
            mode,
            active_location: None,
        }
    }

    /// Location of the current dwell, if any
    pub fn active_location(&self) -> Option<&str> {
        self.active_location.as_deref()
    }

    /// Run one decision cycle
    ///
    /// NoFix cycles are skipped without touching the debounce state. An event
    /// fires when the entry condition holds for a location other than the
    /// active one; the active location clears as soon as the condition fails.
    pub fn decide(&mut self, fix: &Fix, index: &GeofenceIndex) -> Option<CaptureEvent> {
        if !fix.is_valid() {
            return None;
        }

        let entered = index.nearest(fix).filter(|nearest| {
            nearest.distance_meters < self.distance_threshold_m && self.speed_gate(fix.speed_kmh)
        });

        let Some(nearest) = entered else {
            if let Some(previous) = self.active_location.take() {
                debug!("Left geofence of location {}", previous);
            }
            return None;
        };

        if self.active_location.as_deref() == Some(nearest.location_id.as_str()) {
            return None;
        }

        self.active_location = Some(nearest.location_id.clone());
        Some(CaptureEvent {
            location_id: nearest.location_id,
            fix: fix.clone(),
            kind: self.mode,
        })
    }

    fn speed_gate(&self, speed_kmh: f64) -> bool {
        match self.mode {
            TriggerMode::Stationary => speed_kmh < self.speed_threshold_kmh,
            TriggerMode::Moving => speed_kmh > self.speed_threshold_kmh,
        }
    }
}

/// Decision loop: poll the current fix every `interval` and emit events
///
/// Events go out with `try_send`; the loop never waits on the consumer.
pub async fn run_decision_loop(
    mut decider: EventDecider,
    fixes: Arc<FixCell>,
    index: Arc<SharedIndex>,
    events: mpsc::Sender<CaptureEvent>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Starting decision loop ({:?} mode)", decider.mode);

    loop {
        let fix = fixes.snapshot();
        let current = index.current();

        if let Some(event) = decider.decide(&fix, &current) {
            info!(
                "Capture triggered at location {} ({:.6}, {:.6}, {:.1} km/h)",
                event.location_id, fix.latitude, fix.longitude, fix.speed_kmh
            );
            match events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    warn!("Capture consumer busy, dropping event for {}", event.location_id)
                }
                Err(TrySendError::Closed(event)) => {
                    warn!("Capture consumer gone, dropping event for {}", event.location_id)
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Decision loop stopped");
    Ok(())
}

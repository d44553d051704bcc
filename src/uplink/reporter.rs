//! Periodic position pings
//!
//! Every interval the reporter reads the current fix and, when it is valid
//! and far enough from the last reported position, sends it to the location
//! endpoint. Anything that cannot be delivered right now goes to the retry
//! queue.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::RetryQueue;
use super::{Connectivity, UploadTarget, Uplink};
use crate::error::Result;
use crate::geofence::haversine_distance;
use crate::gps::FixCell;

/// What a single reporting cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// NoFix, or too close to the last reported position
    Skipped,
    Delivered,
    Queued,
}

pub struct PositionReporter {
    fixes: Arc<FixCell>,
    queue: Arc<RetryQueue>,
    uplink: Arc<dyn Uplink>,
    connectivity: Arc<dyn Connectivity>,
    min_distance_m: f64,
    last_reported: Option<(f64, f64)>,
}

impl PositionReporter {
    pub fn new(
        fixes: Arc<FixCell>,
        queue: Arc<RetryQueue>,
        uplink: Arc<dyn Uplink>,
        connectivity: Arc<dyn Connectivity>,
        min_distance_m: f64,
    ) -> Self {
        Self {
            fixes,
            queue,
            uplink,
            connectivity,
            min_distance_m,
            last_reported: None,
        }
    }

    /// Report the current fix once
    ///
    /// # Errors
    ///
    /// Returns error only if a ping had to be queued and the queue file could
    /// not be written.
    pub async fn report_once(&mut self) -> Result<ReportOutcome> {
        let fix = self.fixes.snapshot();
        if !fix.is_valid() {
            return Ok(ReportOutcome::Skipped);
        }

        if let Some((lat, lng)) = self.last_reported {
            let moved = haversine_distance(lat, lng, fix.latitude, fix.longitude);
            if moved < self.min_distance_m {
                debug!("Moved {:.1} m since last ping, skipping", moved);
                return Ok(ReportOutcome::Skipped);
            }
        }

        self.last_reported = Some((fix.latitude, fix.longitude));
        let body = fix.upload_body();

        if !self.connectivity.is_online().await {
            debug!("Offline, queueing position ping");
            self.queue.enqueue(body, UploadTarget::Location).await?;
            return Ok(ReportOutcome::Queued);
        }

        match self.uplink.deliver(&body).await {
            Ok(()) => Ok(ReportOutcome::Delivered),
            Err(e) => {
                warn!("Position ping failed, queueing for retry: {}", e);
                self.queue.enqueue(body, UploadTarget::Location).await?;
                Ok(ReportOutcome::Queued)
            }
        }
    }

    /// Report every `interval` until cancelled
    ///
    /// # Errors
    ///
    /// Returns error if the retry queue cannot be written.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) -> Result<()> {
        info!(
            "Starting position reporter every {:?} (min {:.0} m)",
            interval, self.min_distance_m
        );

        loop {
            self.report_once().await?;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Position reporter stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TelemetryError;
    use crate::gps::{Fix, FixQuality};
    use crate::uplink::{MockConnectivity, MockUplink};
    use tempfile::TempDir;

    fn fix(latitude: f64, longitude: f64) -> Fix {
        Fix {
            latitude,
            longitude,
            speed_kmh: 12.0,
            fix_quality: FixQuality::Fix3D,
            ..Fix::no_fix()
        }
    }

    fn connectivity(online: bool) -> Arc<MockConnectivity> {
        let mut connectivity = MockConnectivity::new();
        connectivity.expect_is_online().returning(move || online);
        Arc::new(connectivity)
    }

    async fn reporter(
        dir: &TempDir,
        uplink: MockUplink,
        online: bool,
    ) -> (PositionReporter, Arc<FixCell>, Arc<RetryQueue>) {
        let fixes = Arc::new(FixCell::new());
        let queue = RetryQueue::open(dir.path().join("queue.json"), 8).await.unwrap();
        let queue = Arc::new(queue);
        let reporter = PositionReporter::new(
            fixes.clone(),
            queue.clone(),
            Arc::new(uplink),
            connectivity(online),
            20.0,
        );
        (reporter, fixes, queue)
    }

    #[tokio::test]
    async fn test_no_fix_is_not_reported() {
        let dir = TempDir::new().unwrap();
        let mut uplink = MockUplink::new();
        uplink.expect_deliver().never();
        let (mut reporter, _fixes, queue) = reporter(&dir, uplink, true).await;

        assert_eq!(reporter.report_once().await.unwrap(), ReportOutcome::Skipped);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_small_moves_are_throttled_against_last_report() {
        let dir = TempDir::new().unwrap();
        let mut uplink = MockUplink::new();
        uplink.expect_deliver().times(2).returning(|_| Ok(()));
        let (mut reporter, fixes, _queue) = reporter(&dir, uplink, true).await;

        fixes.publish(fix(41.0, 29.0));
        assert_eq!(reporter.report_once().await.unwrap(), ReportOutcome::Delivered);

        // creeping about 14 m per step, never 20 m from the previous fix
        fixes.publish(fix(41.0001, 29.0001));
        assert_eq!(reporter.report_once().await.unwrap(), ReportOutcome::Skipped);
        fixes.publish(fix(41.0002, 29.0002));
        assert_eq!(reporter.report_once().await.unwrap(), ReportOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_offline_ping_is_queued() {
        let dir = TempDir::new().unwrap();
        let mut uplink = MockUplink::new();
        uplink.expect_deliver().never();
        let (mut reporter, fixes, queue) = reporter(&dir, uplink, false).await;

        let current = fix(41.0, 29.0);
        fixes.publish(current.clone());
        assert_eq!(reporter.report_once().await.unwrap(), ReportOutcome::Queued);
        let queued = queue.records();
        assert_eq!(queued[0].payload, current.upload_body());
        assert_eq!(queued[0].target, UploadTarget::Location);
    }

    #[tokio::test]
    async fn test_failed_ping_is_queued() {
        let dir = TempDir::new().unwrap();
        let mut uplink = MockUplink::new();
        uplink
            .expect_deliver()
            .returning(|_| Err(TelemetryError::Delivery("HTTP 502".to_string())));
        let (mut reporter, fixes, queue) = reporter(&dir, uplink, true).await;

        fixes.publish(fix(41.0, 29.0));
        assert_eq!(reporter.report_once().await.unwrap(), ReportOutcome::Queued);
        assert_eq!(queue.len(), 1);
    }
}

//! # Vehicle Controller
//!
//! Owns the shared state and supervises the background workers:
//!
//! - GPS protocol client (serial port owner, publishes into the fix cell)
//! - Decision loop (fix cell + geofence index -> capture events)
//! - Retry queue drain loop
//! - Position reporter
//!
//! A worker whose task ends, by error or panic, is restarted after a
//! backoff. The GPS worker is additionally restarted when the fix cell goes
//! stale. If the GPS worker keeps being restarted without ever publishing,
//! `run` gives up with `PortUnavailable` so the process can be restarted
//! from outside.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Result, TelemetryError};
use crate::geofence::{run_decision_loop, CaptureEvent, EventDecider, SharedIndex};
use crate::gps::{ClientSettings, FixCell, GpsProtocolClient};
use crate::serial::{PortOpener, SerialChannel};
use crate::telemetry::FixRecorder;
use crate::uplink::{run_drain_loop, Connectivity, PositionReporter, RetryQueue, Uplinks};

/// Worker intervals and supervision limits
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub restart_backoff: Duration,
    pub liveness_timeout: Duration,
    pub max_gps_restarts: u32,
    pub decision_interval: Duration,
    pub drain_interval: Duration,
    pub report_interval: Duration,
    pub min_report_distance_m: f64,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            restart_backoff: Duration::from_millis(config.supervisor.restart_backoff_ms),
            liveness_timeout: Duration::from_millis(config.gps.liveness_timeout_ms),
            max_gps_restarts: config.supervisor.max_gps_restarts,
            decision_interval: Duration::from_millis(config.geofence.decision_interval_ms),
            drain_interval: Duration::from_millis(config.queue.drain_interval_ms),
            report_interval: Duration::from_millis(config.uplink.report_interval_ms),
            min_report_distance_m: config.uplink.min_report_distance_m,
        }
    }
}

/// External collaborators and shared handles injected at startup
#[derive(Clone)]
pub struct Collaborators {
    pub opener: Arc<dyn PortOpener>,
    pub uplinks: Uplinks,
    pub connectivity: Arc<dyn Connectivity>,
    pub queue: Arc<RetryQueue>,
    pub index: Arc<SharedIndex>,
    pub recorder: Option<FixRecorder>,
}

pub struct VehicleController {
    settings: ControllerSettings,
    client_settings: ClientSettings,
    decider: EventDecider,
    parts: Collaborators,
    fixes: Arc<FixCell>,
    events: mpsc::Sender<CaptureEvent>,
}

impl VehicleController {
    pub fn new(
        settings: ControllerSettings,
        client_settings: ClientSettings,
        decider: EventDecider,
        parts: Collaborators,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Self {
        Self {
            settings,
            client_settings,
            decider,
            parts,
            fixes: Arc::new(FixCell::new()),
            events,
        }
    }

    /// The current-fix cell the GPS worker publishes into
    pub fn fixes(&self) -> Arc<FixCell> {
        self.fixes.clone()
    }

    /// Run all workers until `cancel` fires
    ///
    /// Every worker is stopped and joined before this returns.
    ///
    /// # Errors
    ///
    /// Returns `PortUnavailable` after `max_gps_restarts` GPS restarts in a
    /// row without a single publication, or `Protocol` if the GPS client
    /// cannot be built from its settings.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let workers = cancel.child_token();
        info!("Starting vehicle controller");

        let supervisors = vec![
            self.spawn_decision(&workers),
            self.spawn_drain(&workers),
            self.spawn_reporter(&workers),
        ];

        let result = self.supervise_gps(&workers).await;

        workers.cancel();
        for supervisor in supervisors {
            if let Err(e) = supervisor.await {
                error!("Worker supervisor failed: {}", e);
            }
        }

        info!("Vehicle controller stopped");
        result
    }

    async fn supervise_gps(&self, cancel: &CancellationToken) -> Result<()> {
        let mut updates = self.fixes.subscribe();
        let mut restarts_without_fix = 0u32;
        let mut published_at_start = self.fixes.publications();
        let mut gps = self.spawn_gps(cancel)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = &mut gps => log_exit("GPS", outcome),
                changed = tokio::time::timeout(self.settings.liveness_timeout, updates.changed()) => {
                    if changed.is_ok() {
                        continue;
                    }
                    warn!(
                        "No fix published for {:?}, restarting GPS worker",
                        self.settings.liveness_timeout
                    );
                    gps.abort();
                    log_exit("GPS", (&mut gps).await);
                }
            }

            if self.fixes.publications() != published_at_start {
                restarts_without_fix = 0;
            }
            if restarts_without_fix >= self.settings.max_gps_restarts {
                error!(
                    "GPS worker restarted {} times without a fix, giving up",
                    restarts_without_fix
                );
                return Err(TelemetryError::PortUnavailable(format!(
                    "no fix from {} after {} restarts",
                    self.parts.opener.describe(),
                    restarts_without_fix
                )));
            }
            restarts_without_fix += 1;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.settings.restart_backoff) => {}
            }

            info!("Restarting GPS worker (attempt {})", restarts_without_fix);
            published_at_start = self.fixes.publications();
            gps = self.spawn_gps(cancel)?;
        }

        // the client notices the stop signal within one I/O timeout
        log_exit("GPS", gps.await);
        Ok(())
    }

    fn spawn_gps(&self, cancel: &CancellationToken) -> Result<JoinHandle<Result<()>>> {
        let channel = SerialChannel::new(self.parts.opener.clone());
        let mut client =
            GpsProtocolClient::new(channel, self.client_settings.clone(), self.fixes.clone())?;
        if let Some(recorder) = &self.parts.recorder {
            client = client.with_recorder(recorder.clone());
        }
        Ok(tokio::spawn(client.run(cancel.clone())))
    }

    fn spawn_decision(&self, cancel: &CancellationToken) -> JoinHandle<()> {
        let decider = self.decider.clone();
        let fixes = self.fixes.clone();
        let index = self.parts.index.clone();
        let events = self.events.clone();
        let interval = self.settings.decision_interval;

        tokio::spawn(supervise(
            "decision",
            self.settings.restart_backoff,
            cancel.clone(),
            move |token| {
                run_decision_loop(
                    decider.clone(),
                    fixes.clone(),
                    index.clone(),
                    events.clone(),
                    interval,
                    token,
                )
            },
        ))
    }

    fn spawn_drain(&self, cancel: &CancellationToken) -> JoinHandle<()> {
        let queue = self.parts.queue.clone();
        let uplinks = self.parts.uplinks.clone();
        let connectivity = self.parts.connectivity.clone();
        let interval = self.settings.drain_interval;

        tokio::spawn(supervise(
            "drain",
            self.settings.restart_backoff,
            cancel.clone(),
            move |token| {
                run_drain_loop(
                    queue.clone(),
                    uplinks.clone(),
                    connectivity.clone(),
                    interval,
                    token,
                )
            },
        ))
    }

    fn spawn_reporter(&self, cancel: &CancellationToken) -> JoinHandle<()> {
        let fixes = self.fixes.clone();
        let parts = self.parts.clone();
        let interval = self.settings.report_interval;
        let min_distance_m = self.settings.min_report_distance_m;

        tokio::spawn(supervise(
            "reporter",
            self.settings.restart_backoff,
            cancel.clone(),
            move |token| {
                PositionReporter::new(
                    fixes.clone(),
                    parts.queue.clone(),
                    parts.uplinks.location(),
                    parts.connectivity.clone(),
                    min_distance_m,
                )
                .run(interval, token)
            },
        ))
    }
}

/// Keep a worker running until `cancel` fires, restarting it after `backoff`
async fn supervise<F, Fut>(
    name: &'static str,
    backoff: Duration,
    cancel: CancellationToken,
    mut start: F,
) where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        let outcome = tokio::spawn(start(cancel.clone())).await;
        if cancel.is_cancelled() {
            break;
        }
        log_exit(name, outcome);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        info!("Restarting {} worker", name);
    }
}

fn log_exit(name: &str, outcome: std::result::Result<Result<()>, JoinError>) {
    match outcome {
        Ok(Ok(())) => info!("{} worker exited", name),
        Ok(Err(e)) => warn!("{} worker failed: {}", name, e),
        Err(e) if e.is_cancelled() => info!("{} worker aborted", name),
        Err(e) => error!("{} worker panicked: {}", name, e),
    }
}

//! # Vehicle Telemetry
//!
//! Polls the on-board GPS receiver, raises capture events near known
//! locations and uploads position pings with offline buffering.
//!
//! # Usage
//!
//! ```bash
//! vehicle-telemetry [config/default.toml]
//! ```
//!
//! Logs go to stderr and to a daily file under `[logging].dir`. `RUST_LOG`
//! overrides the default INFO level.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use vehicle_telemetry::config::Config;
use vehicle_telemetry::geofence::{CaptureEvent, EventDecider, GeofenceIndex, SharedIndex};
use vehicle_telemetry::gps::ClientSettings;
use vehicle_telemetry::serial::TokioSerialOpener;
use vehicle_telemetry::telemetry::FixRecorder;
use vehicle_telemetry::uplink::{
    HttpConnectivity, HttpUplink, RetryQueue, UploadTarget, Uplinks,
};
use vehicle_telemetry::vehicle::{Collaborators, ControllerSettings, VehicleController};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Buffered capture events before the decision loop starts dropping them
const CAPTURE_CHANNEL_CAPACITY: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _log_guard = init_logging(&config);
    info!("Vehicle Telemetry v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Device {} ({}), config {}",
        config.uplink.device_id, config.uplink.device_type, config_path
    );

    let index = GeofenceIndex::load(&config.geofence.locations_file).with_context(|| {
        format!("Failed to load locations from {}", config.geofence.locations_file)
    })?;
    let queue = RetryQueue::open(&config.queue.path, config.queue.min_payload_bytes)
        .await
        .with_context(|| format!("Failed to open retry queue {}", config.queue.path))?;
    let queue = Arc::new(queue);

    let request_timeout = Duration::from_millis(config.uplink.request_timeout_ms);
    let uplink = HttpUplink::new(
        &config.uplink.location_endpoint,
        &config.uplink.device_id,
        request_timeout,
    )?;
    let connectivity = HttpConnectivity::new(&config.uplink.connectivity_url, request_timeout)?;
    info!("Position pings go to {}", uplink.url());

    let mut uplinks = Uplinks::new(Arc::new(uplink));
    if let Some(endpoint) = &config.uplink.image_info_endpoint {
        let images = HttpUplink::new(endpoint, &config.uplink.device_id, request_timeout)?;
        info!("Capture metadata goes to {}", images.url());
        uplinks = uplinks.with_image_info(Arc::new(images));
    }
    let image_queue = config
        .uplink
        .image_info_endpoint
        .is_some()
        .then(|| queue.clone());

    let parts = Collaborators {
        opener: Arc::new(TokioSerialOpener::new(
            &config.serial.port,
            config.serial.baud_rate,
        )),
        uplinks,
        connectivity: Arc::new(connectivity),
        queue,
        index: Arc::new(SharedIndex::new(index)),
        recorder: config
            .telemetry
            .enabled
            .then(|| FixRecorder::new(&config.telemetry.log_dir)),
    };

    let decider = EventDecider::new(
        config.geofence.distance_threshold_m,
        config.geofence.speed_threshold_kmh,
        config.geofence.mode,
    );
    let (events_tx, events_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
    let controller = VehicleController::new(
        ControllerSettings::from_config(&config),
        ClientSettings::from_config(&config),
        decider,
        parts,
        events_tx,
    );

    let consumer = tokio::spawn(log_captures(
        events_rx,
        image_queue,
        config.uplink.device_id.clone(),
        config.uplink.device_type.clone(),
    ));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
        }
        shutdown.cancel();
    });

    info!("Press Ctrl+C to exit");
    let result = controller.run(cancel).await;

    // the controller owned the last sender, so the consumer drains and ends
    consumer.await.context("Capture consumer failed")?;
    result.context("Vehicle controller stopped")?;

    info!("Shutdown complete");
    Ok(())
}

/// Log to stderr and to a daily file; the guard must outlive the runtime
fn init_logging(config: &Config) -> WorkerGuard {
    let file_appender =
        tracing_appender::rolling::daily(&config.logging.dir, &config.uplink.device_id);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    guard
}

/// Stand-in for the camera collaborator: log each capture request and,
/// when image-info uploads are configured, queue its metadata
async fn log_captures(
    mut events: mpsc::Receiver<CaptureEvent>,
    image_queue: Option<Arc<RetryQueue>>,
    device_id: String,
    device_type: String,
) {
    while let Some(event) = events.recv().await {
        let file_stem = event.file_stem(&device_id, &device_type);
        info!(
            "Capture at {}: {} [{}]",
            event.location_id,
            file_stem,
            event.fix.overlay_text().unwrap_or_default()
        );

        if let Some(queue) = &image_queue {
            let body = event.image_info(&format!("{}.jpg", file_stem));
            if let Err(e) = queue.enqueue(body, UploadTarget::ImageInfo).await {
                warn!("Failed to queue image info for {}: {}", file_stem, e);
            }
        }
    }
}

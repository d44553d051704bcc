//! # Uplink Module
//!
//! Outbound delivery that survives intermittent connectivity.
//!
//! This module handles:
//! - The delivery and connectivity seams ([`Uplink`], [`Connectivity`])
//! - Routing queued records to the endpoint of their [`UploadTarget`]
//! - The disk-backed retry queue and its drain loop ([`RetryQueue`])
//! - HTTP implementations of both seams ([`HttpUplink`], [`HttpConnectivity`])
//! - Periodic position pings ([`PositionReporter`])

pub mod http;
pub mod queue;
pub mod reporter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;

pub use http::{HttpConnectivity, HttpUplink};
pub use queue::{run_drain_loop, DrainReport, QueuedRecord, RetryQueue};
pub use reporter::{PositionReporter, ReportOutcome};

/// Delivers one JSON payload to the remote endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Uplink: Send + Sync {
    /// # Errors
    ///
    /// Returns `Delivery` for any non-200 response or transport failure.
    async fn deliver(&self, payload: &Value) -> Result<()>;
}

/// Reports whether the remote side is reachable right now
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Endpoint a queued payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTarget {
    /// Position pings, `<location_endpoint>/<device_id>`
    #[default]
    Location,
    /// Capture metadata, `<image_info_endpoint>/<device_id>`
    ImageInfo,
}

/// One uplink per upload target
///
/// The location uplink always exists; the others are optional.
#[derive(Clone)]
pub struct Uplinks {
    location: Arc<dyn Uplink>,
    image_info: Option<Arc<dyn Uplink>>,
}

impl Uplinks {
    pub fn new(location: Arc<dyn Uplink>) -> Self {
        Self {
            location,
            image_info: None,
        }
    }

    pub fn with_image_info(mut self, uplink: Arc<dyn Uplink>) -> Self {
        self.image_info = Some(uplink);
        self
    }

    pub fn location(&self) -> Arc<dyn Uplink> {
        self.location.clone()
    }

    /// Uplink responsible for `target`, if one is configured
    pub fn route(&self, target: UploadTarget) -> Option<&dyn Uplink> {
        match target {
            UploadTarget::Location => Some(self.location.as_ref()),
            UploadTarget::ImageInfo => self.image_info.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_defaults_to_location() {
        assert_eq!(UploadTarget::default(), UploadTarget::Location);
        assert_eq!(
            serde_json::to_string(&UploadTarget::ImageInfo).unwrap(),
            "\"image_info\""
        );
    }

    #[test]
    fn test_routes() {
        let uplinks = Uplinks::new(Arc::new(MockUplink::new()));
        assert!(uplinks.route(UploadTarget::Location).is_some());
        assert!(uplinks.route(UploadTarget::ImageInfo).is_none());

        let uplinks = uplinks.with_image_info(Arc::new(MockUplink::new()));
        assert!(uplinks.route(UploadTarget::ImageInfo).is_some());
    }
}

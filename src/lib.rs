//! # Vehicle Telemetry Library
//!
//! GPS acquisition, geofence-triggered capture events and durable position
//! uploads for vehicle-mounted devices.
//!
//! The GPS receiver is polled over a serial line; the latest fix is shared
//! with a decision loop that raises capture events near known locations,
//! and with a reporter whose pings survive connectivity loss through a
//! disk-backed retry queue.

pub mod config;
pub mod error;
pub mod geofence;
pub mod gps;
pub mod serial;
pub mod telemetry;
pub mod uplink;
pub mod vehicle;

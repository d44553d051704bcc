//! # GPS Module
//!
//! Acquisition of position fixes from the GPS peripheral.
//!
//! This module handles:
//! - Parsing fix response records into [`Fix`] values
//! - The handshake/poll state machine ([`GpsProtocolClient`])
//! - The shared current-fix cell ([`FixCell`])

pub mod cell;
pub mod client;
pub mod fix;

pub use cell::FixCell;
pub use client::{ClientSettings, GpsProtocolClient, ProtocolState};
pub use fix::{Fix, FixParser, FixQuality};

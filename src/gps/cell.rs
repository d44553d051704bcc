//! Single-slot cell holding the current fix
//!
//! One writer (the GPS worker) replaces the value wholesale; any number of
//! readers take a copy. Backed by `tokio::sync::watch`, so readers never see
//! a partially written fix and the supervisor can await updates for
//! liveness checks.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use super::fix::Fix;

/// Shared current-fix cell
#[derive(Debug)]
pub struct FixCell {
    sender: watch::Sender<Fix>,
    publications: AtomicU64,
}

impl Default for FixCell {
    fn default() -> Self {
        Self::new()
    }
}

impl FixCell {
    /// Create a cell holding the NoFix sentinel
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Fix::no_fix());
        Self {
            sender,
            publications: AtomicU64::new(0),
        }
    }

    /// Replace the current fix (last writer wins)
    pub fn publish(&self, fix: Fix) {
        self.sender.send_replace(fix);
        self.publications.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of the current fix
    pub fn snapshot(&self) -> Fix {
        self.sender.borrow().clone()
    }

    /// Receiver notified on every publication
    pub fn subscribe(&self) -> watch::Receiver<Fix> {
        self.sender.subscribe()
    }

    /// Number of fixes published so far
    pub fn publications(&self) -> u64 {
        self.publications.load(Ordering::Relaxed)
    }
}

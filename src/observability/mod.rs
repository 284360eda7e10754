//! Logging setup and dispatch counters.

mod logging;

pub use logging::{
    open_log_file, prune_rotated, rotate_if_needed, LogFile, LogFormat, LogLevel, LoggingConfig,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Dispatch counters, shared by every send of one dispatcher.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// SMTP sessions opened.
    pub sessions: AtomicU64,
    /// Messages accepted by the server.
    pub sends_succeeded: AtomicU64,
    /// Sends that failed, including attachment and argument errors.
    pub sends_failed: AtomicU64,
    /// STARTTLS upgrades.
    pub tls_upgrades: AtomicU64,
    /// Authentication attempts.
    pub auth_attempts: AtomicU64,
    /// Failed authentications.
    pub auth_failures: AtomicU64,
    /// Attachments read from disk.
    pub attachments_loaded: AtomicU64,
    /// Recipients refused by the server.
    pub recipients_rejected: AtomicU64,
}

impl DispatchMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a session being opened.
    pub fn record_session(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a send outcome.
    pub fn record_send(&self, success: bool) {
        let counter = if success {
            &self.sends_succeeded
        } else {
            &self.sends_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a TLS upgrade.
    pub fn record_tls_upgrade(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an authentication attempt.
    pub fn record_auth_attempt(&self, success: bool) {
        self.auth_attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records attachments read from disk.
    pub fn record_attachments(&self, count: usize) {
        self.attachments_loaded.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Records refused recipients.
    pub fn record_rejected_recipients(&self, count: usize) {
        self.recipients_rejected.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions: self.sessions.load(Ordering::Relaxed),
            sends_succeeded: self.sends_succeeded.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            tls_upgrades: self.tls_upgrades.load(Ordering::Relaxed),
            auth_attempts: self.auth_attempts.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            attachments_loaded: self.attachments_loaded.load(Ordering::Relaxed),
            recipients_rejected: self.recipients_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DispatchMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// SMTP sessions opened.
    pub sessions: u64,
    /// Messages accepted by the server.
    pub sends_succeeded: u64,
    /// Failed sends.
    pub sends_failed: u64,
    /// STARTTLS upgrades.
    pub tls_upgrades: u64,
    /// Authentication attempts.
    pub auth_attempts: u64,
    /// Failed authentications.
    pub auth_failures: u64,
    /// Attachments read from disk.
    pub attachments_loaded: u64,
    /// Recipients refused by the server.
    pub recipients_rejected: u64,
}

impl MetricsSnapshot {
    /// Returns the send success rate (1.0 when nothing was sent).
    pub fn success_rate(&self) -> f64 {
        let total = self.sends_succeeded + self.sends_failed;
        if total == 0 {
            1.0
        } else {
            self.sends_succeeded as f64 / total as f64
        }
    }
}

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::trace!(timer = self.name, duration_ms = elapsed.as_millis() as u64, "Timer stopped");
        elapsed
    }
}

//! # Spam Guard
//!
//! Per-connection token bucket. Every inbound frame consumes one token;
//! an empty bucket is a violation. Violations accumulate, and once they
//! reach the disconnect threshold the caller closes the socket.
//!
//! The guard runs before size and schema checks so flooders pay only the
//! cheapest work. Each guard is owned by its connection's read task, so no
//! locking is involved.

use std::time::Instant;

use serde::{Deserialize, Serialize};

// ============================================================================
// Configuration
// ============================================================================

/// Token bucket parameters.
///
/// The refill rate is `message_limit / window_seconds` tokens per second.
/// Elapsed refill time is clamped to `max_refill_seconds` so a long-idle
/// connection cannot bank more than one window of burst.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamConfig {
    pub window_seconds: u64,
    pub message_limit: u32,
    pub disconnect_threshold: u32,
    pub max_refill_seconds: u64,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            window_seconds: 10,
            message_limit: 50,
            disconnect_threshold: 5,
            max_refill_seconds: 10,
        }
    }
}

// ============================================================================
// SpamGuard
// ============================================================================

/// Outcome of one frame's spam check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpamVerdict {
    Allowed,
    /// The bucket was empty. `should_disconnect` is set once the violation
    /// count reaches the configured threshold.
    Violation { should_disconnect: bool },
}

/// One token bucket, one socket.
#[derive(Debug)]
pub struct SpamGuard {
    config: SpamConfig,
    tokens: f64,
    last_refill: Instant,
    violations: u32,
}

impl SpamGuard {
    /// A fresh guard starts with a full bucket.
    pub fn new(config: SpamConfig) -> Self {
        Self {
            tokens: config.message_limit as f64,
            last_refill: Instant::now(),
            violations: 0,
            config,
        }
    }

    /// Consume one token for an inbound frame.
    pub fn check(&mut self) -> SpamVerdict {
        self.check_at(Instant::now())
    }

    /// Clock-injected variant used by [`SpamGuard::check`] and by tests.
    pub fn check_at(&mut self, now: Instant) -> SpamVerdict {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return SpamVerdict::Allowed;
        }

        self.violations += 1;
        SpamVerdict::Violation {
            should_disconnect: self.violations >= self.config.disconnect_threshold,
        }
    }

    /// Violations observed so far on this socket.
    pub fn violations(&self) -> u32 {
        self.violations
    }

    pub fn config(&self) -> &SpamConfig {
        &self.config
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now
            .saturating_duration_since(self.last_refill)
            .as_secs_f64()
            .min(self.config.max_refill_seconds as f64);
        let rate = self.config.message_limit as f64 / self.config.window_seconds as f64;

        self.tokens = (self.tokens + elapsed * rate).min(self.config.message_limit as f64);
        self.last_refill = now;
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Error-recovery state machine for the serial ranging link.
//!
//! Errors are counted per category; once a category crosses its threshold the
//! caller is told to reset the ranging device, waiting an exponentially
//! growing backoff delay before each successive reset. A sustained healthy
//! window clears the backoff ladder so an isolated bad patch hours later
//! starts over at the initial delay.
//!
//! The machine only decides; the caller performs the actual reset and sleep.

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Parsing,
    Connection,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Consecutive parsing errors before a reset is requested.
    pub parsing_threshold: u32,
    /// Consecutive connection errors before a reset is requested.
    pub connection_threshold: u32,
    pub backoff_initial_s: f64,
    pub backoff_max_s: f64,
    pub backoff_multiplier: f64,
    /// Error-free seconds after which the backoff ladder resets.
    pub healthy_window_s: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            parsing_threshold: 3,
            connection_threshold: 3,
            backoff_initial_s: 1.0,
            backoff_max_s: 60.0,
            backoff_multiplier: 2.0,
            healthy_window_s: 300.0,
        }
    }
}

#[derive(Debug)]
pub struct ErrorRecovery {
    cfg: RecoveryConfig,
    parsing_errors: u32,
    connection_errors: u32,
    reset_count: u32,
    last_error_at: Option<f64>,
}

impl ErrorRecovery {
    pub fn new(cfg: RecoveryConfig) -> Self {
        Self {
            cfg,
            parsing_errors: 0,
            connection_errors: 0,
            reset_count: 0,
            last_error_at: None,
        }
    }

    /// Count one error at time `now` (unix seconds).
    pub fn record_error(&mut self, category: ErrorCategory, now: f64) {
        // A long quiet stretch means the device recovered; forget old resets
        // before counting the new error.
        if let Some(last) = self.last_error_at {
            if now - last >= self.cfg.healthy_window_s && self.reset_count > 0 {
                info!(
                    "Link healthy for {:.0}s, resetting backoff ladder",
                    now - last
                );
                self.reset_count = 0;
            }
        }
        self.last_error_at = Some(now);
        match category {
            ErrorCategory::Parsing => self.parsing_errors += 1,
            ErrorCategory::Connection => self.connection_errors += 1,
        }
    }

    /// Clear a category's counter after a successful operation of that kind.
    pub fn record_success(&mut self, category: ErrorCategory) {
        match category {
            ErrorCategory::Parsing => self.parsing_errors = 0,
            ErrorCategory::Connection => self.connection_errors = 0,
        }
    }

    pub fn should_reset(&self, category: ErrorCategory) -> bool {
        match category {
            ErrorCategory::Parsing => self.parsing_errors >= self.cfg.parsing_threshold,
            ErrorCategory::Connection => self.connection_errors >= self.cfg.connection_threshold,
        }
    }

    /// Commit to a reset: returns the backoff delay to wait before performing
    /// it, advances the ladder, and clears the triggering category's counter.
    pub fn trigger_reset(&mut self, category: ErrorCategory) -> f64 {
        let delay = (self.cfg.backoff_initial_s
            * self.cfg.backoff_multiplier.powi(self.reset_count as i32))
        .min(self.cfg.backoff_max_s);
        self.reset_count += 1;
        match category {
            ErrorCategory::Parsing => self.parsing_errors = 0,
            ErrorCategory::Connection => self.connection_errors = 0,
        }
        warn!(
            "Device reset #{} triggered by {:?} errors, backing off {delay:.1}s",
            self.reset_count, category
        );
        delay
    }

    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }
}

impl Default for ErrorRecovery {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

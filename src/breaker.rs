//! Session-scoped circuit breaker
//!
//! Counters live inside the persisted conversation state, so the breaker
//! survives process restarts. Once open it stays open until the session is
//! reset.

use crate::config::BreakerConfig;
use crate::models::OutcomeKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    /// The tooling keeps failing
    BlockingErrors,
    /// The user keeps not supplying required data
    MissingInput,
    /// Generic failure ceiling
    RetryCeiling,
}

impl TripReason {
    /// Terminal message shown to the user, with concrete remediation
    pub fn diagnostic(&self) -> &'static str {
        match self {
            TripReason::BlockingErrors => {
                "The specialist tools failed repeatedly, so processing was stopped. \
                 Please try again later, or reset the session if the problem persists."
            }
            TripReason::MissingInput => {
                "The request is still missing required data after several attempts. \
                 Please provide the required data (every value the calculation needs, \
                 e.g. rate, cash flows, periods) in a single message, or reset the session."
            }
            TripReason::RetryCeiling => {
                "The request could not be completed after several failed attempts. \
                 Please rephrase the question with all required values, or reset the session."
            }
        }
    }
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TripReason::BlockingErrors => "blocking_errors",
            TripReason::MissingInput => "missing_input",
            TripReason::RetryCeiling => "retry_ceiling",
        };
        f.write_str(s)
    }
}

/// Persisted breaker counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerCounters {
    pub total: u32,
    pub blocking: u32,
    pub missing_input: u32,
    pub mismatch: u32,
    pub open: Option<TripReason>,
}

impl BreakerCounters {
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.blocking == 0 && self.missing_input == 0 && self.mismatch == 0
    }

    fn clear_counts(&mut self) {
        self.total = 0;
        self.blocking = 0;
        self.missing_input = 0;
        self.mismatch = 0;
    }
}

/// Breaker policy applied to a session's counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Apply one outcome. Returns the trip reason if this outcome opened the
    /// breaker.
    pub fn record(&self, counters: &mut BreakerCounters, outcome: OutcomeKind) -> Option<TripReason> {
        match outcome {
            OutcomeKind::Unknown => return None,
            OutcomeKind::Success => {
                if !counters.is_zero() {
                    info!(total = counters.total, "Worker succeeded, resetting breaker counters");
                    counters.clear_counts();
                }
                return None;
            }
            OutcomeKind::BlockingError => counters.blocking += 1,
            OutcomeKind::MissingInput => counters.missing_input += 1,
            OutcomeKind::CapabilityMismatch => counters.mismatch += 1,
        }
        counters.total += 1;

        if counters.is_open() {
            return None;
        }

        let reason = if counters.blocking >= self.config.blocking_limit {
            Some(TripReason::BlockingErrors)
        } else if counters.missing_input >= self.config.missing_input_limit {
            Some(TripReason::MissingInput)
        } else if counters.total >= self.config.max_retries {
            Some(TripReason::RetryCeiling)
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!(
                %reason,
                total = counters.total,
                blocking = counters.blocking,
                missing_input = counters.missing_input,
                "Circuit breaker opened"
            );
            counters.open = Some(reason);
        }

        reason
    }

    /// New topic: forget counters, leave an open breaker open
    pub fn on_topic_change(&self, counters: &mut BreakerCounters) {
        if !counters.is_zero() {
            info!("Topic change, resetting breaker counters");
            counters.clear_counts();
        }
    }

    /// Full reset, closing the breaker
    pub fn reset(&self, counters: &mut BreakerCounters) {
        *counters = BreakerCounters::default();
    }
}

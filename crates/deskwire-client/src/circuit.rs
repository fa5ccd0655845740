//! Error budget for the connection manager.
//!
//! Closed -> Open after `max_errors` errors. There is no half-open trial and
//! no cooldown: once open, only [`CircuitBreaker::reset`] closes it.

use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::{error, info};

use deskwire_core::ErrorRecord;

/// Error history retained per unit of error budget.
pub const HISTORY_PER_ERROR: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
}

/// Result of recording one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerVerdict {
    /// Still within budget.
    Counting { errors: u32, remaining: u32 },
    /// This error exhausted the budget. Reported exactly once per opening.
    Tripped { errors: u32 },
    /// Already open before this error.
    Open { errors: u32 },
}

impl BreakerVerdict {
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Counting { .. })
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    max_errors: u32,
    error_count: u32,
    next_sequence: u64,
    history: VecDeque<ErrorRecord>,
    capacity: usize,
    state: CircuitState,
}

impl CircuitBreaker {
    pub fn new(max_errors: u32) -> Self {
        let max_errors = max_errors.max(1);
        let capacity = max_errors as usize * HISTORY_PER_ERROR;
        Self {
            max_errors,
            error_count: 0,
            next_sequence: 0,
            history: VecDeque::with_capacity(capacity),
            capacity,
            state: CircuitState::Closed,
        }
    }

    /// Count an error toward the budget and keep it in the history ring.
    pub fn record(&mut self, kind: &str, message: &str) -> (ErrorRecord, BreakerVerdict) {
        let record = ErrorRecord::new(kind, message, self.allocate_sequence());
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        self.error_count = self.error_count.saturating_add(1);

        let verdict = match self.state {
            CircuitState::Open { .. } => BreakerVerdict::Open {
                errors: self.error_count,
            },
            CircuitState::Closed if self.error_count >= self.max_errors => {
                self.open();
                BreakerVerdict::Tripped {
                    errors: self.error_count,
                }
            }
            CircuitState::Closed => BreakerVerdict::Counting {
                errors: self.error_count,
                remaining: self.max_errors - self.error_count,
            },
        };
        (record, verdict)
    }

    /// Open regardless of the count. Returns whether this call opened it.
    pub fn trip(&mut self) -> bool {
        if self.is_open() {
            return false;
        }
        self.open();
        true
    }

    fn open(&mut self) {
        error!(
            errors = self.error_count,
            max_errors = self.max_errors,
            "circuit breaker opened"
        );
        self.state = CircuitState::Open {
            since: Instant::now(),
        };
    }

    /// A successful connection clears the consecutive count.
    pub fn clear_count(&mut self) {
        if !self.is_open() {
            self.error_count = 0;
        }
    }

    /// Close the circuit and restore the full budget. History is kept.
    pub fn reset(&mut self) {
        if self.is_open() {
            info!(errors = self.error_count, "circuit breaker reset");
        }
        self.state = CircuitState::Closed;
        self.error_count = 0;
    }

    /// Sequence number for a record that should not count toward the budget.
    pub fn allocate_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }

    pub fn opened_at(&self) -> Option<Instant> {
        match self.state {
            CircuitState::Open { since } => Some(since),
            CircuitState::Closed => None,
        }
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn max_errors(&self) -> u32 {
        self.max_errors
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.history.back()
    }

    /// Oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.history.iter()
    }
}

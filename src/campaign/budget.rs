// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Wall-clock budgets for cyclic campaigns.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpiError};
use crate::sut::Clock;

/// Cycles a budget-bounded campaign must finish when the deadline cuts it short.
pub const DEFAULT_MIN_CYCLES: u32 = 5;

/// Deadline, check interval and the cycle floor for one campaign.
///
/// A campaign passes when it finishes every requested cycle, or when the
/// deadline stops it after at least `min_cycles` cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleBudget {
    pub deadline: Duration,
    pub check_interval: Duration,
    pub min_cycles: u32,
}

impl CycleBudget {
    pub fn new(deadline: Duration, check_interval: Duration) -> Result<Self> {
        let budget = Self {
            deadline,
            check_interval,
            min_cycles: DEFAULT_MIN_CYCLES,
        };
        budget.validate()?;
        Ok(budget)
    }

    /// A zero interval would never advance the clock between checks.
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(UpiError::Configuration(
                "budget check interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn with_min_cycles(mut self, min_cycles: u32) -> Self {
        self.min_cycles = min_cycles;
        self
    }

    /// Start tracking the deadline from the clock's current reading.
    pub fn start(&self, clock: &dyn Clock) -> DeadlineTracker {
        DeadlineTracker {
            started: clock.now(),
            deadline: self.deadline,
        }
    }

    /// Cycle floor law.
    pub fn verdict(&self, completed: u32, requested: u32) -> bool {
        completed == requested || completed >= self.min_cycles
    }
}

/// Elapsed-time view of a running budget. Owned by one campaign.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineTracker {
    started: Duration,
    deadline: Duration,
}

impl DeadlineTracker {
    pub fn elapsed(&self, clock: &dyn Clock) -> Duration {
        clock.now().saturating_sub(self.started)
    }

    pub fn expired(&self, clock: &dyn Clock) -> bool {
        self.elapsed(clock) >= self.deadline
    }

    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        self.deadline.saturating_sub(self.elapsed(clock))
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Narrow retry helpers.
//!
//! Only [`UpiError::ConnectionLost`] is retried by [`with_reconnect`]; a
//! register value that fails a check is `Ok(false)` and passes straight
//! through, as does every other error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpiError};
use crate::sut::{Clock, SiliconDebug};

/// Run `op`; on a dropped debug connection, reconfigure it and run `op` once more.
pub fn with_reconnect<T, F>(debug: &dyn SiliconDebug, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    match op() {
        Err(err) if err.is_transient() => {
            log::warn!("{}: {}, reconfiguring debug connection and retrying once", what, err);
            debug.reconfigure()?;
            op()
        }
        other => other,
    }
}

/// Bounded attempts with a fixed backoff, for transient infrastructure hiccups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Poll `probe` until it reports `true` or attempts run out.
    ///
    /// Probe errors count as a failed attempt; the last one is returned if
    /// no attempt ever succeeded.
    pub fn poll<F>(&self, clock: &dyn Clock, what: &str, mut probe: F) -> Result<bool>
    where
        F: FnMut() -> Result<bool>,
    {
        let attempts = self.attempts.max(1);
        let mut last_err: Option<UpiError> = None;
        for attempt in 1..=attempts {
            match probe() {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    last_err = None;
                    log::info!("{}: attempt {}/{} negative", what, attempt, attempts);
                }
                Err(err) => {
                    log::info!("{}: attempt {}/{} failed: {}", what, attempt, attempts, err);
                    last_err = Some(err);
                }
            }
            if attempt < attempts {
                clock.sleep(self.backoff);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformFamily;
    use crate::sim::{SimClock, SimDebug, SimState};
    use std::cell::Cell;

    #[test]
    fn test_reconnect_retries_once_on_connection_loss() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let debug = SimDebug::new(state.clone());
        let calls = Cell::new(0);
        let value = with_reconnect(&debug, "read", || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(UpiError::ConnectionLost("IPC".into()))
            } else {
                Ok(7u64)
            }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 2);
        assert_eq!(state.borrow().reconfigure_count(), 1);
    }

    #[test]
    fn test_reconnect_gives_up_after_second_loss() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let debug = SimDebug::new(state);
        let calls = Cell::new(0);
        let result: Result<()> = with_reconnect(&debug, "read", || {
            calls.set(calls.get() + 1);
            Err(UpiError::ConnectionLost("IPC".into()))
        });
        assert!(matches!(result, Err(UpiError::ConnectionLost(_))));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_reconnect_never_absorbs_other_errors_or_false() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let debug = SimDebug::new(state.clone());
        let calls = Cell::new(0);
        let result: Result<bool> = with_reconnect(&debug, "check", || {
            calls.set(calls.get() + 1);
            Ok(false)
        });
        assert!(!result.unwrap());
        let result: Result<bool> = with_reconnect(&debug, "check", || {
            calls.set(calls.get() + 1);
            Err(UpiError::RegisterAccess("bad path".into()))
        });
        assert!(matches!(result, Err(UpiError::RegisterAccess(_))));
        assert_eq!(calls.get(), 2);
        assert_eq!(state.borrow().reconfigure_count(), 0);
    }

    #[test]
    fn test_poll_backs_off_between_attempts() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let clock = SimClock::new(state);
        let policy = RetryPolicy::new(3, Duration::from_secs(20));
        let calls = Cell::new(0);
        let ok = policy
            .poll(&clock, "probe", || {
                calls.set(calls.get() + 1);
                Ok(calls.get() == 3)
            })
            .unwrap();
        assert!(ok);
        assert_eq!(clock.now(), Duration::from_secs(40));
    }

    #[test]
    fn test_poll_exhausted_returns_false() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let clock = SimClock::new(state);
        let policy = RetryPolicy::default();
        assert!(!policy.poll(&clock, "probe", || Ok(false)).unwrap());
        assert_eq!(clock.now(), Duration::from_secs(40));
    }

    #[test]
    fn test_poll_surfaces_last_error() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let clock = SimClock::new(state);
        let policy = RetryPolicy::new(2, Duration::from_secs(1));
        let result = policy.poll(&clock, "probe", || {
            Err(UpiError::CommandFailed("timeout".into()))
        });
        assert!(matches!(result, Err(UpiError::CommandFailed(_))));
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Cyclic stress campaigns
//!
//! Every driver walks the same state machine:
//!
//! ```text
//! NotStarted -> StressStarting -> StressRunning -> Checking
//!            -> (Checking -> StressRunning)* -> Stopping -> Done
//! ```
//!
//! `Failed` is terminal and reachable from `StressStarting`,
//! `StressRunning` and `Checking`. Drivers without a workload go straight
//! from `NotStarted` to `Checking`.
//!
//! A driver returns `Ok(outcome)` for both a pass and an ordinary failure
//! (check mismatch, tool not running, budget floor missed). `Err` is kept
//! for setup errors, exhausted infrastructure retries and explicit aborts.
//! The stress tool and every background session are stopped on all paths.

pub mod budget;
pub mod residency;
pub mod stream;
pub mod workload;

pub use budget::{CycleBudget, DeadlineTracker, DEFAULT_MIN_CYCLES};
pub use workload::{ensure_installed, StressSupervisor, Workload, MLC_STARTUP_ADD_SECS};

use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::bandwidth::{check_bandwidth, BandwidthMatrix, BandwidthModel};
use crate::degrade::{DegradationController, DegradationPlan};
use crate::error::{Result, UpiError};
use crate::platform::registers::RegisterKind;
use crate::retry::{with_reconnect, RetryPolicy};
use crate::sut::{ResetKind, SiliconDebug, Sut};
use crate::telemetry::{SnapshotPhase, TelemetrySidecar};
use crate::topology::ConnectionMap;
use crate::verify::{ExpectedValues, LinkVerifier, UpiCheck, LANES_OPERATIONAL};

use residency::{measure_c6_residency, C6_RESIDENCY_THRESHOLD};
use stream::{
    calibration_iterations, parse_dimm_speeds, parse_triad_mbps, scaled_iterations, stream_target_mbps,
    DIMM_SPEED_CMD, STREAM_BANNER, STREAM_BUFFER_SECS, STREAM_CALIBRATION_TIMEOUT_SECS, STREAM_OUTPUT, STREAM_TOOL,
};

/// Command that reports the 1/5/15 minute load averages.
pub const LOADAVG_CMD: &str = "cat /proc/loadavg";

/// Campaign lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    NotStarted,
    StressStarting,
    StressRunning,
    Checking,
    Stopping,
    Done,
    Failed,
}

impl CampaignState {
    pub fn can_transition_to(self, next: CampaignState) -> bool {
        use CampaignState::*;
        matches!(
            (self, next),
            (NotStarted, StressStarting)
                | (NotStarted, Checking)
                | (StressStarting, StressRunning)
                | (StressStarting, Failed)
                | (StressRunning, Checking)
                | (StressRunning, Stopping)
                | (StressRunning, Failed)
                | (Checking, StressStarting)
                | (Checking, StressRunning)
                | (Checking, Checking)
                | (Checking, Stopping)
                | (Checking, Failed)
                | (Stopping, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CampaignState::Done | CampaignState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::StressStarting => "stress_starting",
            Self::StressRunning => "stress_running",
            Self::Checking => "checking",
            Self::Stopping => "stopping",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a campaign ended in `Failed` without a fatal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    CheckFailed { check: UpiCheck, cycle: u32 },
    StressNotRunning { workload: String, cycle: u32 },
    IdleLoadTooHigh { load: f64, ceiling: f64 },
    StressLoadTooLow { load: f64, floor: f64 },
    BudgetExpired { completed: u32, required: u32 },
    DegradationMismatch,
    SocketCountMismatch { expected: u32 },
    BandwidthBelowExpectation,
    /// `residency` is `None` when PTU captured nothing.
    NotInPackageC6 { residency: Option<f64>, threshold: f64 },
    StreamBelowTarget { triad: f64, target: f64 },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckFailed { check, cycle } => write!(f, "{} check failed in cycle {}", check, cycle),
            Self::StressNotRunning { workload, cycle } => {
                write!(f, "{} is not running (cycle {})", workload, cycle)
            }
            Self::IdleLoadTooHigh { load, ceiling } => {
                write!(f, "idle load average {:.2} is above {:.2}", load, ceiling)
            }
            Self::StressLoadTooLow { load, floor } => {
                write!(f, "load average under stress {:.2} is below {:.2}", load, floor)
            }
            Self::BudgetExpired { completed, required } => write!(
                f,
                "budget expired after {} cycles, at least {} required",
                completed, required
            ),
            Self::DegradationMismatch => write!(f, "ports did not degrade as planned"),
            Self::SocketCountMismatch { expected } => {
                write!(f, "OS does not report {} socket(s) after degradation", expected)
            }
            Self::BandwidthBelowExpectation => write!(f, "measured bandwidth below expectation"),
            Self::NotInPackageC6 {
                residency: Some(residency),
                threshold,
            } => write!(
                f,
                "package C6 residency {:.1}% is not above {:.1}%",
                residency, threshold
            ),
            Self::NotInPackageC6 { residency: None, .. } => {
                write!(f, "package C6 residency was not captured")
            }
            Self::StreamBelowTarget { triad, target } => write!(
                f,
                "stream Triad rate {:.1} MB/s is below the {:.1} MB/s target",
                triad, target
            ),
        }
    }
}

/// Result of one driver run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignOutcome {
    pub state: CampaignState,
    pub cycles_completed: u32,
    pub elapsed_secs: u64,
    pub failure: Option<FailureReason>,
}

impl CampaignOutcome {
    pub fn passed(&self) -> bool {
        self.state == CampaignState::Done && self.failure.is_none()
    }
}

/// Timing, gates and expectations shared by every driver.
#[derive(Debug, Clone)]
pub struct CampaignSettings {
    pub check_interval: Duration,
    /// Wait before re-reading a load average that missed its gate.
    pub recheck_wait: Duration,
    pub liveness: RetryPolicy,
    pub stress_settle: Duration,
    pub command_timeout: Duration,
    pub reboot_timeout: Duration,
    pub min_cycles: u32,
    pub idle_load_ceiling: Option<f64>,
    pub stress_load_floor: Option<f64>,
    pub bandwidth: BandwidthModel,
    /// `None` makes the topology check pass trivially.
    pub expected_topology: Option<ConnectionMap>,
    /// Sockets still verified once a degradation is in place.
    pub sockets_after_degradation: Option<Vec<u32>>,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            recheck_wait: Duration::from_secs(20),
            liveness: RetryPolicy::default(),
            stress_settle: Duration::from_secs(120),
            command_timeout: Duration::from_secs(60),
            reboot_timeout: Duration::from_secs(900),
            min_cycles: DEFAULT_MIN_CYCLES,
            idle_load_ceiling: Some(8.0),
            stress_load_floor: Some(50.0),
            bandwidth: BandwidthModel::default(),
            expected_topology: None,
            sockets_after_degradation: None,
        }
    }
}

impl CampaignSettings {
    /// Budget using these settings' interval and cycle floor.
    pub fn budget(&self, deadline: Duration) -> Result<CycleBudget> {
        Ok(CycleBudget::new(deadline, self.check_interval)?.with_min_cycles(self.min_cycles))
    }

    /// MLC run time that outlives settling, `window` of checks and startup slack.
    pub fn mlc_run_time(&self, window: Duration) -> Duration {
        self.stress_settle + window + Duration::from_secs(MLC_STARTUP_ADD_SECS)
    }
}

/// Run `checks` in order, stopping at the first failure.
///
/// Each check is one exhaustive pass; a dropped debug connection is
/// reconfigured and the pass repeated once. Returns the failing check.
pub fn verify_checks(
    debug: &dyn SiliconDebug,
    sockets: Option<Vec<u32>>,
    expected_topology: Option<&ConnectionMap>,
    checks: &[UpiCheck],
) -> Result<Option<UpiCheck>> {
    let verifier = with_reconnect(debug, "verifier setup", || LinkVerifier::new(debug))?.with_sockets(sockets);
    for &check in checks {
        log::info!("Running {} check", check);
        let passed = with_reconnect(debug, check.as_str(), || verifier.run_check(check, expected_topology))?;
        if !passed {
            log::error!("{} check failed", check);
            return Ok(Some(check));
        }
    }
    Ok(None)
}

/// First field of `/proc/loadavg`.
pub fn parse_load_average(output: &str) -> Result<f64> {
    output
        .split_whitespace()
        .next()
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| UpiError::Parse(format!("load average '{}'", output.trim())))
}

/// One campaign against one SUT.
pub struct Campaign<'s> {
    sut: &'s mut Sut,
    settings: CampaignSettings,
    state: CampaignState,
    cycles: u32,
    started: Duration,
    socket_filter: Option<Vec<u32>>,
}

impl<'s> Campaign<'s> {
    pub fn new(sut: &'s mut Sut, settings: CampaignSettings) -> Self {
        let started = sut.clock.now();
        Self {
            sut,
            settings,
            state: CampaignState::NotStarted,
            cycles: 0,
            started,
            socket_filter: None,
        }
    }

    pub fn state(&self) -> CampaignState {
        self.state
    }

    pub fn cycles_completed(&self) -> u32 {
        self.cycles
    }

    pub fn settings(&self) -> &CampaignSettings {
        &self.settings
    }

    fn transition(&mut self, next: CampaignState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(UpiError::Other(format!(
                "invalid campaign transition {} -> {}",
                self.state, next
            )));
        }
        log::debug!("Campaign {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn outcome(&self, failure: Option<FailureReason>) -> CampaignOutcome {
        CampaignOutcome {
            state: self.state,
            cycles_completed: self.cycles,
            elapsed_secs: self.sut.clock.now().saturating_sub(self.started).as_secs(),
            failure,
        }
    }

    fn supervisor(&self, workload: Workload) -> StressSupervisor {
        StressSupervisor::new(
            workload,
            self.settings.liveness,
            self.settings.stress_settle,
            self.settings.command_timeout,
        )
    }

    fn checks(&self, checks: &[UpiCheck]) -> Result<Option<UpiCheck>> {
        verify_checks(
            self.sut.debug.as_ref(),
            self.socket_filter.clone(),
            self.settings.expected_topology.as_ref(),
            checks,
        )
    }

    pub fn load_average(&mut self) -> Result<f64> {
        let output = self
            .sut
            .os
            .execute(LOADAVG_CMD, self.settings.command_timeout, None)?;
        parse_load_average(&output.stdout)
    }

    fn idle_load_gate(&mut self) -> Result<Option<FailureReason>> {
        let ceiling = match self.settings.idle_load_ceiling {
            Some(ceiling) => ceiling,
            None => return Ok(None),
        };
        let load = self.load_average()?;
        log::info!("Idle load average {:.2} (ceiling {:.2})", load, ceiling);
        if load > ceiling {
            return Ok(Some(FailureReason::IdleLoadTooHigh { load, ceiling }));
        }
        Ok(None)
    }

    fn stress_load_gate(&mut self) -> Result<Option<FailureReason>> {
        let floor = match self.settings.stress_load_floor {
            Some(floor) => floor,
            None => return Ok(None),
        };
        let mut load = self.load_average()?;
        if load < floor {
            log::warn!(
                "Load average {:.2} below {:.2}, re-checking in {} secs",
                load,
                floor,
                self.settings.recheck_wait.as_secs()
            );
            self.sut.clock.sleep(self.settings.recheck_wait);
            load = self.load_average()?;
        }
        log::info!("Load average under stress {:.2} (floor {:.2})", load, floor);
        if load < floor {
            return Ok(Some(FailureReason::StressLoadTooLow { load, floor }));
        }
        Ok(None)
    }

    fn start_stress(&mut self, supervisor: &mut StressSupervisor) -> Result<Option<FailureReason>> {
        self.transition(CampaignState::StressStarting)?;
        if !supervisor.start(self.sut)? {
            return Ok(Some(FailureReason::StressNotRunning {
                workload: supervisor.workload().name.clone(),
                cycle: 0,
            }));
        }
        self.transition(CampaignState::StressRunning)?;
        Ok(None)
    }

    /// `cycles` rounds of wait, liveness probe and checks under load.
    fn stress_loop(
        &mut self,
        supervisor: &StressSupervisor,
        checks: &[UpiCheck],
        cycles: u32,
    ) -> Result<Option<FailureReason>> {
        for cycle in 1..=cycles {
            log::info!(
                "Waiting {} secs before cycle {}/{}",
                self.settings.check_interval.as_secs(),
                cycle,
                cycles
            );
            self.sut.clock.sleep(self.settings.check_interval);
            if !supervisor.probe(self.sut)? {
                return Ok(Some(FailureReason::StressNotRunning {
                    workload: supervisor.workload().name.clone(),
                    cycle,
                }));
            }
            self.transition(CampaignState::Checking)?;
            if let Some(check) = self.checks(checks)? {
                return Ok(Some(FailureReason::CheckFailed { check, cycle }));
            }
            self.cycles = cycle;
            log::info!("Cycle {}/{} passed", cycle, cycles);
            self.transition(CampaignState::StressRunning)?;
        }
        Ok(None)
    }

    fn cleanup(&mut self, supervisor: Option<&StressSupervisor>) {
        let stopped = match supervisor {
            Some(supervisor) => supervisor.stop(self.sut),
            None => self.sut.os.kill_async_session(),
        };
        if let Err(err) = stopped {
            log::warn!("Cleanup after failure did not complete: {}", err);
        }
    }

    fn finish(
        &mut self,
        result: Result<Option<FailureReason>>,
        supervisor: Option<&StressSupervisor>,
    ) -> Result<CampaignOutcome> {
        match result {
            Ok(None) => {
                self.transition(CampaignState::Stopping)?;
                let stopped = supervisor.map_or(Ok(()), |supervisor| supervisor.stop(self.sut));
                self.transition(CampaignState::Done)?;
                stopped?;
                log::info!("Campaign passed after {} cycle(s)", self.cycles);
                Ok(self.outcome(None))
            }
            Ok(Some(reason)) => {
                log::error!("Campaign failed: {}", reason);
                self.cleanup(supervisor);
                self.transition(CampaignState::Failed)?;
                Ok(self.outcome(Some(reason)))
            }
            Err(err) => {
                log::error!("Campaign aborted: {}", err);
                self.cleanup(supervisor);
                self.state = CampaignState::Failed;
                Err(err)
            }
        }
    }

    // -- stress cycles ----------------------------------------------------

    /// Fixed number of check cycles under `workload`.
    ///
    /// Each cycle checks `check` and the error counters. Load-average gates
    /// run before launch and once the tool has settled.
    pub fn run_stress_cycles(&mut self, workload: Workload, check: UpiCheck, cycles: u32) -> Result<CampaignOutcome> {
        let mut supervisor = self.supervisor(workload);
        let result = self.stress_cycles(&mut supervisor, check, cycles);
        self.finish(result, Some(&supervisor))
    }

    fn stress_cycles(
        &mut self,
        supervisor: &mut StressSupervisor,
        check: UpiCheck,
        cycles: u32,
    ) -> Result<Option<FailureReason>> {
        self.transition(CampaignState::Checking)?;
        if let Some(reason) = self.idle_load_gate()? {
            return Ok(Some(reason));
        }
        if let Some(reason) = self.start_stress(supervisor)? {
            return Ok(Some(reason));
        }
        if let Some(reason) = self.stress_load_gate()? {
            return Ok(Some(reason));
        }
        self.stress_loop(supervisor, &[check, UpiCheck::NoErrors], cycles)
    }

    // -- reset cycles -----------------------------------------------------

    /// Check, reset, re-check, bounded by `cycles` and `budget`.
    ///
    /// The campaign passes if every requested cycle completes, or if the
    /// deadline stops it after the budget's cycle floor.
    pub fn run_reset_cycles(
        &mut self,
        check: UpiCheck,
        kind: ResetKind,
        cycles: u32,
        budget: &CycleBudget,
    ) -> Result<CampaignOutcome> {
        budget.validate()?;
        let result = self.reset_cycles(check, kind, cycles, budget);
        self.finish(result, None)
    }

    fn reset_cycles(
        &mut self,
        check: UpiCheck,
        kind: ResetKind,
        cycles: u32,
        budget: &CycleBudget,
    ) -> Result<Option<FailureReason>> {
        let checks = match check {
            UpiCheck::LinkHealth => vec![UpiCheck::Lane, UpiCheck::RxState, UpiCheck::TxState],
            other => vec![other, UpiCheck::NoErrors],
        };
        let tracker = budget.start(self.sut.clock.as_ref());
        self.transition(CampaignState::Checking)?;
        for cycle in 1..=cycles {
            if let Some(check) = self.checks(&checks)? {
                return Ok(Some(FailureReason::CheckFailed { check, cycle }));
            }
            self.cycles = cycle;
            log::info!(
                "Cycle {}/{} passed, {} secs elapsed",
                cycle,
                cycles,
                tracker.elapsed(self.sut.clock.as_ref()).as_secs()
            );
            if cycle == cycles {
                break;
            }
            if tracker.expired(self.sut.clock.as_ref()) {
                log::info!("Run time reached after {} cycle(s)", cycle);
                break;
            }
            self.reset(kind)?;
            self.transition(CampaignState::Checking)?;
        }
        if !budget.verdict(self.cycles, cycles) {
            return Ok(Some(FailureReason::BudgetExpired {
                completed: self.cycles,
                required: budget.min_cycles,
            }));
        }
        Ok(None)
    }

    fn reset(&mut self, kind: ResetKind) -> Result<()> {
        log::info!("Performing {} reset", kind);
        let timeout = self.settings.reboot_timeout;
        let power = &mut self.sut.power;
        match power.reset(kind).and_then(|_| power.wait_for_os(timeout)) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!("{} reset failed: {}", kind, err);
                self.log_diagnostics();
                Err(err)
            }
        }
    }

    /// Best-effort dump of error counters, lanes and link speeds.
    fn log_diagnostics(&self) {
        let verifier = match LinkVerifier::new(self.sut.debug.as_ref()) {
            Ok(verifier) => verifier,
            Err(err) => {
                log::warn!("Diagnostics unavailable: {}", err);
                return;
            }
        };
        match verifier.scan_errors() {
            Ok(errors) => errors.iter().for_each(|m| log::error!("{}", m)),
            Err(err) => log::warn!("Error scan unavailable: {}", err),
        }
        match verifier.scan_all_ports(RegisterKind::LaneStatus, &ExpectedValues::new(LANES_OPERATIONAL)) {
            Ok(lanes) => lanes.iter().for_each(|m| log::error!("{}", m)),
            Err(err) => log::warn!("Lane scan unavailable: {}", err),
        }
        match verifier.topology().links(None) {
            Ok(links) => {
                for (local, peer) in links {
                    match verifier.link_speed_code(local.socket, local.port) {
                        Ok(code) => log::info!("{} <-> {} speed code {:#x}", local, peer, code),
                        Err(err) => log::warn!("{} speed unavailable: {}", local, err),
                    }
                }
            }
            Err(err) => log::warn!("Topology unavailable: {}", err),
        }
    }

    // -- idle -------------------------------------------------------------

    /// Periodic checks without load until the budget runs out.
    pub fn run_idle(&mut self, check: UpiCheck, budget: &CycleBudget) -> Result<CampaignOutcome> {
        budget.validate()?;
        let result = self.idle(check, budget);
        self.finish(result, None)
    }

    fn idle(&mut self, check: UpiCheck, budget: &CycleBudget) -> Result<Option<FailureReason>> {
        let mut checks = vec![check];
        for extra in [UpiCheck::Lane, UpiCheck::RxState, UpiCheck::TxState, UpiCheck::NoErrors] {
            if !checks.contains(&extra) {
                checks.push(extra);
            }
        }
        let tracker = budget.start(self.sut.clock.as_ref());
        self.transition(CampaignState::Checking)?;
        if let Some(reason) = self.idle_load_gate()? {
            return Ok(Some(reason));
        }
        loop {
            let cycle = self.cycles + 1;
            if let Some(check) = self.checks(&checks)? {
                return Ok(Some(FailureReason::CheckFailed { check, cycle }));
            }
            self.cycles = cycle;
            self.sut.clock.sleep(budget.check_interval);
            if tracker.expired(self.sut.clock.as_ref()) {
                return Ok(None);
            }
            self.transition(CampaignState::Checking)?;
        }
    }

    // -- timed stress -----------------------------------------------------

    /// Checks on every interval under `workload` until the budget runs out.
    ///
    /// Restartable workloads are relaunched whenever they finish early. The
    /// error counters are scanned once after the workload is stopped.
    pub fn run_timed_stress(
        &mut self,
        workload: Workload,
        check: UpiCheck,
        budget: &CycleBudget,
    ) -> Result<CampaignOutcome> {
        budget.validate()?;
        let mut supervisor = self.supervisor(workload);
        let result = self.timed_stress(&mut supervisor, check, budget);
        self.finish(result, Some(&supervisor))
    }

    fn timed_stress(
        &mut self,
        supervisor: &mut StressSupervisor,
        check: UpiCheck,
        budget: &CycleBudget,
    ) -> Result<Option<FailureReason>> {
        self.transition(CampaignState::Checking)?;
        if let Some(reason) = self.idle_load_gate()? {
            return Ok(Some(reason));
        }
        if let Some(reason) = self.start_stress(supervisor)? {
            return Ok(Some(reason));
        }
        let tracker = budget.start(self.sut.clock.as_ref());
        loop {
            let cycle = self.cycles + 1;
            self.transition(CampaignState::Checking)?;
            if let Some(check) = self.checks(&[check])? {
                return Ok(Some(FailureReason::CheckFailed { check, cycle }));
            }
            self.cycles = cycle;
            self.transition(CampaignState::StressRunning)?;

            let wait = budget.check_interval.min(tracker.remaining(self.sut.clock.as_ref()));
            self.sut.clock.sleep(wait);
            if tracker.expired(self.sut.clock.as_ref()) {
                break;
            }
            if !supervisor.ensure_running(self.sut)? {
                return Ok(Some(FailureReason::StressNotRunning {
                    workload: supervisor.workload().name.clone(),
                    cycle: cycle + 1,
                }));
            }
        }
        supervisor.stop(self.sut)?;
        self.transition(CampaignState::Checking)?;
        if let Some(check) = self.checks(&[UpiCheck::NoErrors])? {
            return Ok(Some(FailureReason::CheckFailed {
                check,
                cycle: self.cycles,
            }));
        }
        Ok(None)
    }

    // -- bandwidth --------------------------------------------------------

    /// Timed load, then compare the MLC bandwidth matrix against the
    /// expectation derived from the current link speeds.
    ///
    /// UPI errors present before the load starts abort the test.
    pub fn run_bandwidth(&mut self, workload: Workload, check: UpiCheck, budget: &CycleBudget) -> Result<CampaignOutcome> {
        budget.validate()?;
        let mut supervisor = self.supervisor(workload);
        let result = self.bandwidth(&mut supervisor, check, budget);
        self.finish(result, Some(&supervisor))
    }

    fn bandwidth(
        &mut self,
        supervisor: &mut StressSupervisor,
        check: UpiCheck,
        budget: &CycleBudget,
    ) -> Result<Option<FailureReason>> {
        self.transition(CampaignState::Checking)?;
        if self.checks(&[UpiCheck::NoErrors])?.is_some() {
            return Err(UpiError::TestFail(
                "UPI errors present before the bandwidth test started".into(),
            ));
        }
        if let Some(reason) = self.start_stress(supervisor)? {
            return Ok(Some(reason));
        }
        let tracker = budget.start(self.sut.clock.as_ref());
        loop {
            let cycle = self.cycles + 1;
            let wait = budget.check_interval.min(tracker.remaining(self.sut.clock.as_ref()));
            self.sut.clock.sleep(wait);
            if !supervisor.probe(self.sut)? {
                return Ok(Some(FailureReason::StressNotRunning {
                    workload: supervisor.workload().name.clone(),
                    cycle,
                }));
            }
            self.transition(CampaignState::Checking)?;
            if let Some(check) = self.checks(&[check])? {
                return Ok(Some(FailureReason::CheckFailed { check, cycle }));
            }
            self.cycles = cycle;
            if tracker.expired(self.sut.clock.as_ref()) {
                break;
            }
            self.transition(CampaignState::StressRunning)?;
        }
        supervisor.stop(self.sut)?;

        let expected = {
            let verifier = LinkVerifier::new(self.sut.debug.as_ref())?.with_sockets(self.socket_filter.clone());
            self.settings.bandwidth.expected_bandwidth(&verifier)?
        };
        let dir = match supervisor.install_dir() {
            Some(dir) => dir.to_string(),
            None => ensure_installed(self.sut, "mlc")?,
        };
        let cmd = format!("{}/mlc --bandwidth_matrix", dir);
        log::info!("Measuring bandwidth with {}", cmd);
        let output = self.sut.os.execute(&cmd, self.settings.command_timeout, Some(&dir))?;
        if !output.succeeded() {
            return Err(UpiError::CommandFailed(format!(
                "{} returned {}: {}",
                cmd,
                output.return_code,
                output.stderr.trim()
            )));
        }
        let measured = BandwidthMatrix::parse_mlc(&output.stdout)?;
        if !check_bandwidth(&expected, &measured)? {
            return Ok(Some(FailureReason::BandwidthBelowExpectation));
        }
        Ok(None)
    }

    // -- degradation ------------------------------------------------------

    /// Degrade with a thread-local RNG for random plans.
    pub fn run_degradation(
        &mut self,
        plan: &DegradationPlan,
        socket_count: Option<u32>,
        mlc_cycles: u32,
    ) -> Result<CampaignOutcome> {
        self.run_degradation_with_rng(plan, socket_count, mlc_cycles, &mut rand::thread_rng())
    }

    /// Apply `plan`, verify it, then check the degraded links.
    ///
    /// With `socket_count` set the degradation is verified by the socket
    /// count the OS reports instead of per port. `mlc_cycles` of zero runs a
    /// single check pass without load. Checks are limited to the configured
    /// post-degradation socket subset. BIOS defaults are not restored here.
    pub fn run_degradation_with_rng<R: Rng + ?Sized>(
        &mut self,
        plan: &DegradationPlan,
        socket_count: Option<u32>,
        mlc_cycles: u32,
        rng: &mut R,
    ) -> Result<CampaignOutcome> {
        let window = self.settings.check_interval * mlc_cycles.max(1);
        let mut supervisor = self.supervisor(Workload::mlc_stress(self.settings.mlc_run_time(window)));
        let result = self.degradation(&mut supervisor, plan, socket_count, mlc_cycles, rng);
        self.finish(result, Some(&supervisor))
    }

    fn degradation<R: Rng + ?Sized>(
        &mut self,
        supervisor: &mut StressSupervisor,
        plan: &DegradationPlan,
        socket_count: Option<u32>,
        mlc_cycles: u32,
        rng: &mut R,
    ) -> Result<Option<FailureReason>> {
        self.transition(CampaignState::Checking)?;
        let verified = {
            let mut controller = DegradationController::new(&mut *self.sut)
                .with_timeouts(self.settings.command_timeout, self.settings.reboot_timeout);
            let ports_ok = controller.degrade_with_rng(plan, socket_count.is_none(), rng)?;
            match socket_count {
                Some(expected) if ports_ok => controller.verify_number_of_sockets(expected)?,
                _ => ports_ok,
            }
        };
        if !verified {
            return Ok(Some(match socket_count {
                Some(expected) => FailureReason::SocketCountMismatch { expected },
                None => FailureReason::DegradationMismatch,
            }));
        }

        self.socket_filter = self.settings.sockets_after_degradation.clone();
        let checks = [UpiCheck::Lane, UpiCheck::RxState, UpiCheck::NoErrors];
        if mlc_cycles == 0 {
            if let Some(check) = self.checks(&checks)? {
                return Ok(Some(FailureReason::CheckFailed { check, cycle: 1 }));
            }
            self.cycles = 1;
            return Ok(None);
        }
        if let Some(reason) = self.start_stress(supervisor)? {
            return Ok(Some(reason));
        }
        self.stress_loop(supervisor, &checks, mlc_cycles)
    }

    // -- package C6 -------------------------------------------------------

    /// Poll the links of an idle system while the package sits in C6.
    ///
    /// Each poll runs `check` (the C6 lane map stands in for the plain lane
    /// check), the rx/tx C6 states and the error scan, then samples package
    /// C6 residency with PTU.
    pub fn run_package_c6(&mut self, check: UpiCheck, budget: &CycleBudget) -> Result<CampaignOutcome> {
        budget.validate()?;
        let result = self.package_c6(check, budget);
        self.finish(result, None)
    }

    fn package_c6(&mut self, check: UpiCheck, budget: &CycleBudget) -> Result<Option<FailureReason>> {
        let first = match check {
            UpiCheck::Lane => UpiCheck::PackageC6Lane,
            other => other,
        };
        let checks = [first, UpiCheck::RxC6State, UpiCheck::TxC6State, UpiCheck::NoErrors];
        let tracker = budget.start(self.sut.clock.as_ref());
        self.transition(CampaignState::Checking)?;
        loop {
            let cycle = self.cycles + 1;
            if let Some(check) = self.checks(&checks)? {
                return Ok(Some(FailureReason::CheckFailed { check, cycle }));
            }
            let residency = measure_c6_residency(self.sut, self.settings.command_timeout)?;
            if !matches!(residency, Some(r) if r > C6_RESIDENCY_THRESHOLD) {
                log::error!("System not in package C6");
                return Ok(Some(FailureReason::NotInPackageC6 {
                    residency,
                    threshold: C6_RESIDENCY_THRESHOLD,
                }));
            }
            self.cycles = cycle;
            let wait = budget.check_interval.min(tracker.remaining(self.sut.clock.as_ref()));
            self.sut.clock.sleep(wait);
            if tracker.expired(self.sut.clock.as_ref()) {
                return Ok(None);
            }
            self.transition(CampaignState::Checking)?;
        }
    }

    // -- stream -----------------------------------------------------------

    /// UPI error rate under the STREAM benchmark.
    ///
    /// A short calibration run sizes the benchmark to `budget.deadline`.
    /// The error counters and `check` are verified on every interval until
    /// the benchmark exits or the deadline plus a buffer passes. Errors
    /// are scanned once more afterwards, then the best Triad rate is held
    /// against the target derived from the DIMM speed.
    pub fn run_stream(&mut self, check: UpiCheck, stream_type: &str, budget: &CycleBudget) -> Result<CampaignOutcome> {
        budget.validate()?;
        let mut supervisor = None;
        let result = self.stream(&mut supervisor, check, stream_type, budget);
        self.finish(result, supervisor.as_ref())
    }

    /// Triad target from the DIMM speed; mixed speeds abort the test.
    fn stream_target(&mut self) -> Result<f64> {
        let output = self
            .sut
            .os
            .execute(DIMM_SPEED_CMD, self.settings.command_timeout, None)?;
        let speeds = parse_dimm_speeds(&output.stdout);
        let speed = match (speeds.len(), speeds.first()) {
            (1, Some(&speed)) => speed,
            (0, _) => return Err(UpiError::TestFail("DIMM speed is not reported".into())),
            _ => {
                return Err(UpiError::TestFail(format!(
                    "DIMMs are not configured at the same speed: {:?}",
                    speeds
                )))
            }
        };
        let target = stream_target_mbps(self.sut.debug.platform_family()?, speed)?;
        log::info!("Stream target bandwidth {:.1} MB/s for {} MT/s DIMMs", target, speed);
        Ok(target)
    }

    /// Time a short benchmark run and scale its iterations to `duration`.
    fn calibrate_stream(&mut self, stream_type: &str, duration: Duration, dir: &str) -> Result<u64> {
        let calibration = calibration_iterations(self.sut.debug.sockets()?.len());
        let timeout = self.settings.command_timeout;
        self.sut.os.execute("pkill -f run_stream.sh", timeout, None)?;
        let cmd = format!("./run_stream.sh {} {}", stream_type, calibration);
        let started = self.sut.clock.now();
        let output = self.sut.os.execute(
            &cmd,
            Duration::from_secs(STREAM_CALIBRATION_TIMEOUT_SECS),
            Some(dir),
        )?;
        let elapsed = self.sut.clock.now().saturating_sub(started);
        let banner = STREAM_BANNER.to_ascii_lowercase();
        if !output.succeeded() || !output.stdout.to_ascii_lowercase().contains(&banner) {
            return Err(UpiError::CommandFailed(format!(
                "{} did not run the benchmark: {}",
                cmd,
                output.stderr.trim()
            )));
        }
        let iterations = scaled_iterations(duration, calibration, elapsed)?;
        log::info!(
            "{} stream iterations took {} secs, running {} for {} secs",
            calibration,
            elapsed.as_secs(),
            iterations,
            duration.as_secs()
        );
        Ok(iterations)
    }

    fn stream(
        &mut self,
        slot: &mut Option<StressSupervisor>,
        check: UpiCheck,
        stream_type: &str,
        budget: &CycleBudget,
    ) -> Result<Option<FailureReason>> {
        self.transition(CampaignState::Checking)?;
        if let Some(check) = self.checks(&[UpiCheck::NoErrors])? {
            return Ok(Some(FailureReason::CheckFailed { check, cycle: 0 }));
        }
        let target = self.stream_target()?;
        let dir = ensure_installed(self.sut, STREAM_TOOL)?;
        let iterations = self.calibrate_stream(stream_type, budget.deadline, &dir)?;
        let timeout = self.settings.command_timeout;
        self.sut
            .os
            .execute(&format!("rm -rf {}", STREAM_OUTPUT), timeout, Some(&dir))?;

        let supervisor = slot.insert(self.supervisor(Workload::stream(stream_type, iterations, STREAM_OUTPUT)));
        if let Some(reason) = self.start_stress(supervisor)? {
            return Ok(Some(reason));
        }
        let head = self
            .sut
            .os
            .execute(&format!("head {}", STREAM_OUTPUT), timeout, Some(&dir))?;
        if !head.stdout.contains(STREAM_BANNER) {
            log::error!("run_stream.sh did not start the benchmark");
            return Ok(Some(FailureReason::StressNotRunning {
                workload: supervisor.workload().name.clone(),
                cycle: 0,
            }));
        }

        let window = CycleBudget {
            deadline: budget.deadline + Duration::from_secs(STREAM_BUFFER_SECS),
            ..*budget
        };
        let tracker = window.start(self.sut.clock.as_ref());
        loop {
            let cycle = self.cycles + 1;
            self.transition(CampaignState::Checking)?;
            if let Some(check) = self.checks(&[UpiCheck::NoErrors, check])? {
                return Ok(Some(FailureReason::CheckFailed { check, cycle }));
            }
            self.cycles = cycle;
            self.transition(CampaignState::StressRunning)?;
            if !supervisor.probe(self.sut)? {
                log::info!("run_stream.sh finished after {} cycle(s)", cycle);
                break;
            }
            if tracker.expired(self.sut.clock.as_ref()) {
                log::warn!(
                    "run_stream.sh still running after {} secs",
                    tracker.elapsed(self.sut.clock.as_ref()).as_secs()
                );
                break;
            }
            self.sut.clock.sleep(budget.check_interval);
        }

        self.transition(CampaignState::Checking)?;
        if let Some(check) = self.checks(&[UpiCheck::NoErrors])? {
            return Ok(Some(FailureReason::CheckFailed {
                check,
                cycle: self.cycles,
            }));
        }
        let report = self
            .sut
            .os
            .execute(&format!("cat {}", STREAM_OUTPUT), timeout, Some(&dir))?;
        let triad = parse_triad_mbps(&report.stdout)?;
        log::info!("Best Triad rate {:.1} MB/s, target {:.1} MB/s", triad, target);
        if triad < target {
            return Ok(Some(FailureReason::StreamBelowTarget { triad, target }));
        }
        Ok(None)
    }
}

/// Driver shape and its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum Driver {
    Stress {
        workload: Workload,
        check: UpiCheck,
        cycles: u32,
    },
    Resets {
        check: UpiCheck,
        kind: ResetKind,
        cycles: u32,
        budget: CycleBudget,
    },
    Idle {
        check: UpiCheck,
        budget: CycleBudget,
    },
    TimedStress {
        workload: Workload,
        check: UpiCheck,
        budget: CycleBudget,
    },
    Bandwidth {
        workload: Workload,
        check: UpiCheck,
        budget: CycleBudget,
    },
    Degradation {
        plan: DegradationPlan,
        socket_count: Option<u32>,
        mlc_cycles: u32,
    },
    PackageC6 {
        check: UpiCheck,
        budget: CycleBudget,
    },
    Stream {
        check: UpiCheck,
        stream_type: String,
        budget: CycleBudget,
    },
}

/// A named driver run with telemetry and cleanup around it.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub name: String,
    pub driver: Driver,
    pub settings: CampaignSettings,
    pub telemetry: Option<TelemetrySidecar>,
    /// Seed for random degradation plans; thread-local entropy if unset.
    pub seed: Option<u64>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, driver: Driver, settings: CampaignSettings) -> Self {
        Self {
            name: name.into(),
            driver,
            settings,
            telemetry: None,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySidecar) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Telemetry pre-snapshot, the driver, cleanup, telemetry post-snapshot.
    ///
    /// After a degradation the BIOS defaults are restored and the lanes
    /// re-checked; lanes that do not come back fail an otherwise passing run.
    pub fn run(&self, sut: &mut Sut) -> Result<CampaignOutcome> {
        log::info!("Starting test case {}", self.name);
        self.snapshot(sut, SnapshotPhase::Pre);
        let result = {
            let mut campaign = Campaign::new(sut, self.settings.clone());
            match &self.driver {
                Driver::Stress { workload, check, cycles } => {
                    campaign.run_stress_cycles(workload.clone(), *check, *cycles)
                }
                Driver::Resets {
                    check,
                    kind,
                    cycles,
                    budget,
                } => campaign.run_reset_cycles(*check, *kind, *cycles, budget),
                Driver::Idle { check, budget } => campaign.run_idle(*check, budget),
                Driver::TimedStress { workload, check, budget } => {
                    campaign.run_timed_stress(workload.clone(), *check, budget)
                }
                Driver::Bandwidth { workload, check, budget } => {
                    campaign.run_bandwidth(workload.clone(), *check, budget)
                }
                Driver::Degradation {
                    plan,
                    socket_count,
                    mlc_cycles,
                } => match self.seed {
                    Some(seed) => campaign.run_degradation_with_rng(
                        plan,
                        *socket_count,
                        *mlc_cycles,
                        &mut StdRng::seed_from_u64(seed),
                    ),
                    None => campaign.run_degradation(plan, *socket_count, *mlc_cycles),
                },
                Driver::PackageC6 { check, budget } => campaign.run_package_c6(*check, budget),
                Driver::Stream {
                    check,
                    stream_type,
                    budget,
                } => campaign.run_stream(*check, stream_type, budget),
            }
        };
        let result = match self.driver {
            Driver::Degradation { .. } => self.restore(sut, result),
            _ => result,
        };
        self.snapshot(sut, SnapshotPhase::Post);
        match &result {
            Ok(outcome) if outcome.passed() => log::info!("Test case {} PASSED", self.name),
            Ok(outcome) => log::error!(
                "Test case {} FAILED: {}",
                self.name,
                outcome
                    .failure
                    .as_ref()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| outcome.state.to_string())
            ),
            Err(err) => log::error!("Test case {} FAILED: {}", self.name, err),
        }
        result
    }

    fn snapshot(&self, sut: &Sut, phase: SnapshotPhase) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.collect(sut.debug.as_ref(), &self.name, phase);
        }
    }

    fn restore(&self, sut: &mut Sut, result: Result<CampaignOutcome>) -> Result<CampaignOutcome> {
        let restored = DegradationController::new(&mut *sut)
            .with_timeouts(self.settings.command_timeout, self.settings.reboot_timeout)
            .restore_defaults();
        if let Err(err) = restored {
            log::error!("Failed to restore BIOS defaults: {}", err);
            result?;
            return Err(err);
        }
        let outcome = result?;
        let debug = sut.debug.as_ref();
        let recovered = with_reconnect(debug, "lanes after restore", || {
            LinkVerifier::new(debug)?.verify_lanes()
        })?;
        if !recovered {
            log::error!("UPI lanes did not recover after restoring BIOS defaults");
            if outcome.passed() {
                return Err(UpiError::TestFail(
                    "UPI lanes did not recover after restoring BIOS defaults".into(),
                ));
            }
        }
        Ok(outcome)
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Background stress workloads and their liveness supervision.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::sut::Sut;

/// Extra MLC run time so the tool outlives the check window.
pub const MLC_STARTUP_ADD_SECS: u64 = 300;
/// Mesh stress run time in minutes.
pub const MESH_RUN_TIME_MIN: u32 = 999;

/// An external stress tool launched as a background process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// Name used in logs and failure reasons.
    pub name: String,
    /// Collateral to install before launching.
    pub tool: String,
    /// Launch command, run from the install directory.
    pub command: String,
    /// `pgrep -f` pattern that identifies the running process.
    pub probe_pattern: String,
    /// Relaunch when the tool finishes before the budget does.
    pub restartable: bool,
}

impl Workload {
    /// stressapptest with cache coherency checks.
    pub fn stressapp(log_file: &str) -> Self {
        Self {
            name: "stressapptest".into(),
            tool: "stressapptest".into(),
            command: format!("./stressapptest -s 9000 --cc_test -l {}", log_file),
            probe_pattern: "stressapptest".into(),
            restartable: false,
        }
    }

    /// MLC loaded latency sized to outlast `run_time`.
    pub fn mlc_loaded_latency(run_time: Duration) -> Self {
        Self {
            name: "mlc loaded latency".into(),
            tool: "mlc".into(),
            command: format!(
                "./mlc --loaded_latency -d0 -T -K1 -t{}",
                run_time.as_secs() + MLC_STARTUP_ADD_SECS
            ),
            probe_pattern: "mlc".into(),
            restartable: false,
        }
    }

    /// Plain MLC stress for `run_time`.
    pub fn mlc_stress(run_time: Duration) -> Self {
        Self {
            name: "mlc".into(),
            tool: "mlc".into(),
            command: format!("./mlc -t{}", run_time.as_secs()),
            probe_pattern: "mlc".into(),
            restartable: false,
        }
    }

    /// One of the perl-driven mesh stress tests, e.g. `cache_stress_ss_mlc`.
    pub fn mesh_stress(test: &str) -> Self {
        Self {
            name: format!("mesh stress {}", test),
            tool: "mesh_stress".into(),
            command: format!(
                "source setup.sh && ./mesh_stress/{t}/{t}.pl -r {}",
                MESH_RUN_TIME_MIN,
                t = test
            ),
            probe_pattern: "mlc_internal".into(),
            restartable: false,
        }
    }

    /// STREAM memory bandwidth run writing its report to `output`.
    pub fn stream(stream_type: &str, iterations: u64, output: &str) -> Self {
        Self {
            name: "run_stream".into(),
            tool: "stream".into(),
            command: format!("./run_stream.sh {} {} > {}", stream_type, iterations, output),
            probe_pattern: "run_stream.sh".into(),
            restartable: false,
        }
    }

    /// SPEC CPU integer rate; restarted whenever a run finishes early.
    pub fn spec_cpu() -> Self {
        Self {
            name: "spec cpu intrate".into(),
            tool: "speccpu".into(),
            command: "./run_spec.sh intrate".into(),
            probe_pattern: "run_spec.sh".into(),
            restartable: true,
        }
    }
}

/// Install `tool` unless the SUT already has it. Returns its directory.
pub fn ensure_installed(sut: &mut Sut, tool: &str) -> Result<String> {
    let dir = sut.installer.install_path(tool);
    if sut.os.path_exists(&dir)? {
        log::debug!("{} already installed at {}", tool, dir);
        return Ok(dir);
    }
    log::info!("Installing {}", tool);
    sut.installer.install(tool)
}

/// Launches one workload and answers whether it is still alive.
#[derive(Debug, Clone)]
pub struct StressSupervisor {
    workload: Workload,
    liveness: RetryPolicy,
    settle: Duration,
    command_timeout: Duration,
    install_dir: Option<String>,
}

impl StressSupervisor {
    pub fn new(workload: Workload, liveness: RetryPolicy, settle: Duration, command_timeout: Duration) -> Self {
        Self {
            workload,
            liveness,
            settle,
            command_timeout,
            install_dir: None,
        }
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Where the tool was installed, once it has been launched.
    pub fn install_dir(&self) -> Option<&str> {
        self.install_dir.as_deref()
    }

    fn launch(&mut self, sut: &mut Sut) -> Result<()> {
        let dir = match &self.install_dir {
            Some(dir) => dir.clone(),
            None => {
                let dir = ensure_installed(sut, &self.workload.tool)?;
                self.install_dir = Some(dir.clone());
                dir
            }
        };
        log::info!("Starting {} with cmd={}", self.workload.name, self.workload.command);
        sut.os.execute_async(&self.workload.command, Some(&dir))?;
        Ok(())
    }

    /// Install if needed, launch, settle, then confirm the process is up.
    ///
    /// `Ok(false)` means the tool never showed up in the process table.
    pub fn start(&mut self, sut: &mut Sut) -> Result<bool> {
        self.launch(sut)?;
        log::info!(
            "Pausing {} secs to allow {} startup to stabilize",
            self.settle.as_secs(),
            self.workload.name
        );
        sut.clock.sleep(self.settle);
        let running = self.probe(sut)?;
        if !running {
            log::error!("{} did not start properly", self.workload.name);
        }
        Ok(running)
    }

    /// Liveness check with the configured retries and backoff.
    pub fn probe(&self, sut: &mut Sut) -> Result<bool> {
        let Sut { os, clock, .. } = sut;
        let cmd = format!("pgrep -f {}", self.workload.probe_pattern);
        let what = format!("{} liveness", self.workload.name);
        self.liveness.poll(clock.as_ref(), &what, || {
            let output = os.execute(&cmd, self.command_timeout, None)?;
            Ok(output.succeeded() && !output.stdout.trim().is_empty())
        })
    }

    /// For restartable workloads, relaunch if the previous run has ended.
    ///
    /// Non-restartable workloads fall back to a plain liveness probe.
    pub fn ensure_running(&mut self, sut: &mut Sut) -> Result<bool> {
        if !self.workload.restartable {
            return self.probe(sut);
        }
        if self.probe(sut)? {
            return Ok(true);
        }
        log::info!("{} completed, restarting as the budget has time left", self.workload.name);
        self.launch(sut)?;
        Ok(true)
    }

    /// Kill the tool and every background session.
    pub fn stop(&self, sut: &mut Sut) -> Result<()> {
        log::info!("Stopping {}..", self.workload.name);
        let cmd = format!("pkill -f {}", self.workload.probe_pattern);
        let output = sut.os.execute(&cmd, self.command_timeout, None)?;
        if !output.succeeded() {
            log::debug!("{} was not running at stop", self.workload.name);
        }
        sut.os.kill_async_session()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformFamily;
    use crate::sim::{simulated_sut, SimState};

    fn supervisor(workload: Workload) -> StressSupervisor {
        StressSupervisor::new(
            workload,
            RetryPolicy::default(),
            Duration::from_secs(120),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_preset_commands() {
        assert_eq!(
            Workload::stressapp("Stressapp.log").command,
            "./stressapptest -s 9000 --cc_test -l Stressapp.log"
        );
        assert_eq!(
            Workload::mlc_loaded_latency(Duration::from_secs(7200)).command,
            "./mlc --loaded_latency -d0 -T -K1 -t7500"
        );
        assert_eq!(Workload::mlc_stress(Duration::from_secs(7200)).command, "./mlc -t7200");
        assert_eq!(
            Workload::mesh_stress("lock_ss_mlc").command,
            "source setup.sh && ./mesh_stress/lock_ss_mlc/lock_ss_mlc.pl -r 999"
        );
        assert_eq!(
            Workload::stream("avx3", 6000, "stream_output.txt").command,
            "./run_stream.sh avx3 6000 > stream_output.txt"
        );
        assert!(Workload::spec_cpu().restartable);
    }

    #[test]
    fn test_start_installs_launches_and_settles() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        let mut sut = simulated_sut(&state);
        let mut stress = supervisor(Workload::stressapp("s.log"));
        assert!(stress.start(&mut sut).unwrap());
        let s = state.borrow();
        assert_eq!(s.installed_tools(), &["stressapptest".to_string()]);
        assert_eq!(s.install_count(), 1);
        assert_eq!(s.now(), Duration::from_secs(120));
        assert_eq!(s.processes().len(), 1);
    }

    #[test]
    fn test_present_tool_is_not_reinstalled() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        state.borrow_mut().preinstall("mlc");
        let mut sut = simulated_sut(&state);
        let mut stress = supervisor(Workload::mlc_stress(Duration::from_secs(7200)));
        assert!(stress.start(&mut sut).unwrap());
        assert_eq!(state.borrow().install_count(), 0);
        assert_eq!(stress.install_dir(), Some("/root/tools/mlc"));
        assert_eq!(ensure_installed(&mut sut, "mlc").unwrap(), "/root/tools/mlc");
        assert_eq!(state.borrow().install_count(), 0);
    }

    #[test]
    fn test_start_reports_tool_not_running() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        state.borrow_mut().set_launch_fails(true);
        let mut sut = simulated_sut(&state);
        let mut stress = supervisor(Workload::mlc_stress(Duration::from_secs(60)));
        assert!(!stress.start(&mut sut).unwrap());
        // settle plus two backoffs
        assert_eq!(state.borrow().now(), Duration::from_secs(160));
    }

    #[test]
    fn test_restartable_workload_relaunches() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        let mut sut = simulated_sut(&state);
        let mut stress = supervisor(Workload::spec_cpu());
        assert!(stress.start(&mut sut).unwrap());
        crate::sut::OsShell::kill_async_session(sut.os.as_mut()).unwrap();
        assert!(stress.ensure_running(&mut sut).unwrap());
        assert!(stress.probe(&mut sut).unwrap());
        assert_eq!(state.borrow().installed_tools().len(), 1);
    }

    #[test]
    fn test_stop_clears_processes() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        let mut sut = simulated_sut(&state);
        let mut mesh = supervisor(Workload::mesh_stress("cache_stress_ss_mlc"));
        assert!(mesh.start(&mut sut).unwrap());
        assert_eq!(state.borrow().processes().len(), 2);
        mesh.stop(&mut sut).unwrap();
        assert!(state.borrow().processes().is_empty());
        assert!(!mesh.probe(&mut sut).unwrap());
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! System-under-test collaborators.
//!
//! The validation engine never talks to hardware directly. Register access,
//! OS command execution, BIOS knob programming, power control, tool
//! installation and the wall clock are all reached through the traits in
//! this module, bundled into one [`Sut`]. There is a single control thread
//! driving a single SUT, so none of these need to be `Send` or `Sync`.

pub mod local;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::platform::PlatformFamily;
use crate::topology::PortId;

/// Endpoint reported by the low-level KTI device scan of one socket.
///
/// `peer` is `None` for dangling endpoints, which the scan reports but
/// which are not wired to anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KtiEndpoint {
    pub port: u32,
    pub peer: Option<PortId>,
}

/// Live silicon-debug connection.
pub trait SiliconDebug {
    /// CPU family of the connected silicon.
    fn platform_family(&self) -> Result<PlatformFamily>;

    /// Socket numbers present on the platform. Not necessarily contiguous.
    fn sockets(&self) -> Result<Vec<u32>>;

    /// Raw KTI device scan of one socket, dangling endpoints included.
    fn kti_devices(&self, socket: u32) -> Result<Vec<KtiEndpoint>>;

    /// IO-die hosting `port` on families with an IO-die split.
    fn io_die(&self, port: u32) -> Result<u32>;

    /// Read a register on one socket.
    fn get_by_path(&self, socket: u32, path: &str) -> Result<u64>;

    /// Read a register on every socket.
    fn get_by_path_all(&self, path: &str) -> Result<Vec<(u32, u64)>> {
        self.sockets()?
            .into_iter()
            .map(|socket| Ok((socket, self.get_by_path(socket, path)?)))
            .collect()
    }

    /// Force a reconfiguration of the debug connection after a link drop.
    fn reconfigure(&self) -> Result<()>;
}

/// Output of a synchronous SUT command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.return_code == 0
    }
}

/// Handle for a fire-and-forget background command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncHandle {
    pub id: u64,
    pub command: String,
}

/// OS command channel on the SUT.
pub trait OsShell {
    fn execute(&mut self, cmd: &str, timeout: Duration, cwd: Option<&str>) -> Result<CommandOutput>;

    /// Launch `cmd` in the background without waiting for it.
    fn execute_async(&mut self, cmd: &str, cwd: Option<&str>) -> Result<AsyncHandle>;

    /// Terminate all background work started through [`execute_async`](Self::execute_async).
    fn kill_async_session(&mut self) -> Result<()>;

    fn path_exists(&mut self, path: &str) -> Result<bool>;
}

/// A single BIOS setup knob assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BiosKnob {
    pub name: String,
    pub value: String,
}

impl BiosKnob {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for BiosKnob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Render knobs as the comma separated list the BIOS programming tool takes.
pub fn knob_list(knobs: &[BiosKnob]) -> String {
    knobs
        .iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// BIOS knob programming. Knobs only take effect after a cold reset.
pub trait BiosControl {
    fn apply_knobs(&mut self, knobs: &[BiosKnob]) -> Result<()>;
    fn load_defaults(&mut self) -> Result<()>;
}

/// Reset flavour used between campaign cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetKind {
    /// OS-level reboot.
    Warm,
    /// Full AC/G3 power cycle.
    Cold,
}

impl std::fmt::Display for ResetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warm => write!(f, "WARM"),
            Self::Cold => write!(f, "COLD"),
        }
    }
}

impl std::str::FromStr for ResetKind {
    type Err = crate::error::UpiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            other => Err(crate::error::UpiError::Configuration(format!(
                "cycling method can only be 'warm' or 'cold', got '{}'",
                other
            ))),
        }
    }
}

/// Power control of the SUT. Resets block until the OS is back.
pub trait PowerControl {
    /// Graceful AC off/on.
    fn cold_reset(&mut self) -> Result<()>;

    /// OS reboot.
    fn warm_reset(&mut self) -> Result<()>;

    fn wait_for_os(&mut self, timeout: Duration) -> Result<()>;

    fn reset(&mut self, kind: ResetKind) -> Result<()> {
        match kind {
            ResetKind::Warm => self.warm_reset(),
            ResetKind::Cold => self.cold_reset(),
        }
    }
}

/// Installs a named collateral tool on the SUT and reports where it lives.
pub trait ToolInstaller {
    /// Directory `tool` lives in once installed.
    fn install_path(&self, tool: &str) -> String;

    fn install(&mut self, tool: &str) -> Result<String>;
}

/// Monotonic time source with blocking sleep.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

/// Wall clock of the controlling host.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Every collaborator the validation engine needs, owned in one place.
pub struct Sut {
    pub debug: Box<dyn SiliconDebug>,
    pub os: Box<dyn OsShell>,
    pub bios: Box<dyn BiosControl>,
    pub power: Box<dyn PowerControl>,
    pub installer: Box<dyn ToolInstaller>,
    pub clock: Box<dyn Clock>,
}

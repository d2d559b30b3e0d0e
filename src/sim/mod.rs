// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Scripted system-under-test.
//!
//! One [`SimState`] holds the whole platform: UPI mesh, register space, OS
//! process table, pending BIOS knobs and a fake monotonic clock. Every
//! collaborator type in this module is a thin view over a shared handle to
//! that state, so a test can poke the platform while a driver is holding the
//! [`Sut`]. Resets and sleeps advance the fake clock instead of blocking,
//! which lets multi-hour campaigns finish in milliseconds.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Result, UpiError};
use crate::platform::{PlatformFamily, RegisterKind, RegisterMap};
use crate::sut::{
    AsyncHandle, BiosControl, BiosKnob, Clock, CommandOutput, KtiEndpoint, OsShell, PowerControl,
    ResetKind, SiliconDebug, Sut, ToolInstaller,
};
use crate::topology::PortId;

/// Shared handle to a simulated platform.
pub type SharedSim = Rc<RefCell<SimState>>;

const SPEED_SUFFIXES: [&str; 3] = ["kti_rate", "cri_freq_select", "link_rate"];
const TOOLS_DIR: &str = "/root/tools";

/// A register write that lands once the fake clock reaches `at`.
#[derive(Debug, Clone)]
struct ScheduledWrite {
    at: Duration,
    socket: u32,
    path: String,
    value: u64,
}

/// A background process and the time it exits on its own, if ever.
#[derive(Debug, Clone)]
struct SimProcess {
    command: String,
    ends_at: Option<Duration>,
}

/// Run time a stress command asks for: `-t<secs>`, `-t <secs>` or `-s <secs>`.
fn requested_run_time(cmd: &str) -> Option<Duration> {
    let mut tokens = cmd.split_whitespace();
    while let Some(token) = tokens.next() {
        let secs = match token {
            "-t" | "-s" => tokens.next(),
            t if t.starts_with("-t") => t.get(2..),
            _ => continue,
        };
        return secs.and_then(|s| s.parse().ok()).map(Duration::from_secs);
    }
    None
}

/// Iteration count of a `run_stream.sh <type> <iterations>` invocation.
fn stream_iterations(cmd: &str) -> Option<u64> {
    let mut tokens = cmd.split_whitespace().skip_while(|t| !t.ends_with("run_stream.sh"));
    tokens.nth(2).and_then(|n| n.parse().ok())
}

/// Complete simulated platform.
#[derive(Debug)]
pub struct SimState {
    family: PlatformFamily,
    sockets: Vec<u32>,
    links: Vec<(PortId, PortId)>,
    dangling: Vec<PortId>,
    disabled: BTreeSet<PortId>,
    peer_overrides: BTreeMap<PortId, PortId>,

    registers: HashMap<(u32, String), u64>,
    scheduled: Vec<ScheduledWrite>,
    connection_drops: u32,
    reconfigures: u32,

    now: Duration,

    pending_knobs: Vec<BiosKnob>,
    pending_defaults: bool,
    applied_knobs: Vec<Vec<BiosKnob>>,
    bios_drops: u32,
    knobs_ignored: bool,

    reset_duration: Duration,
    resets: Vec<ResetKind>,
    fail_reset_on: Option<usize>,

    processes: Vec<SimProcess>,
    workload_crash_at: Option<Duration>,
    launch_fails: bool,
    session_kill_fails: bool,
    commands: Vec<String>,
    next_handle: u64,

    os_sockets: Option<u32>,
    idle_load: f64,
    stress_load: f64,
    bandwidth_mbps: BTreeMap<(u32, u32), f64>,
    default_bandwidth_mbps: f64,

    c6_residency: f64,
    ptu_logged: bool,
    dimm_speeds: Vec<u32>,
    stream_millis_per_iteration: u64,
    stream_triad_mbps: f64,
    stream_output: bool,

    installed: Vec<String>,
    install_calls: u32,
    missing_tools: BTreeSet<String>,
}

impl SimState {
    /// Platform with `sockets` sockets wired by `links`.
    pub fn new(family: PlatformFamily, sockets: Vec<u32>, links: Vec<(PortId, PortId)>) -> SharedSim {
        Rc::new(RefCell::new(Self {
            family,
            sockets,
            links,
            dangling: Vec::new(),
            disabled: BTreeSet::new(),
            peer_overrides: BTreeMap::new(),
            registers: HashMap::new(),
            scheduled: Vec::new(),
            connection_drops: 0,
            reconfigures: 0,
            now: Duration::ZERO,
            pending_knobs: Vec::new(),
            pending_defaults: false,
            applied_knobs: Vec::new(),
            bios_drops: 0,
            knobs_ignored: false,
            reset_duration: Duration::from_secs(600),
            resets: Vec::new(),
            fail_reset_on: None,
            processes: Vec::new(),
            workload_crash_at: None,
            launch_fails: false,
            session_kill_fails: false,
            commands: Vec::new(),
            next_handle: 0,
            os_sockets: None,
            idle_load: 1.5,
            stress_load: 96.0,
            bandwidth_mbps: BTreeMap::new(),
            default_bandwidth_mbps: 150_000.0,
            c6_residency: 97.5,
            ptu_logged: false,
            dimm_speeds: vec![4800; 16],
            stream_millis_per_iteration: 1200,
            stream_triad_mbps: 250_000.0,
            stream_output: false,
            installed: Vec::new(),
            install_calls: 0,
            missing_tools: BTreeSet::new(),
        }))
    }

    /// Two sockets with every port wired straight across.
    pub fn two_socket(family: PlatformFamily) -> SharedSim {
        let links = (0..family.ports_per_socket())
            .map(|port| (PortId::new(0, port), PortId::new(1, port)))
            .collect();
        Self::new(family, vec![0, 1], links)
    }

    /// Four sockets, fully connected over ports 0..3.
    pub fn four_socket_mesh(family: PlatformFamily) -> SharedSim {
        let p = PortId::new;
        let links = vec![
            (p(0, 0), p(1, 0)),
            (p(0, 1), p(2, 0)),
            (p(0, 2), p(3, 0)),
            (p(1, 1), p(2, 1)),
            (p(1, 2), p(3, 1)),
            (p(2, 2), p(3, 2)),
        ];
        Self::new(family, vec![0, 1, 2, 3], links)
    }

    /// Random but reproducible mesh over `sockets` sockets.
    pub fn random_mesh(family: PlatformFamily, sockets: u32, seed: u64) -> SharedSim {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut pairs: Vec<(u32, u32)> = (0..sockets)
            .flat_map(|a| (a + 1..sockets).map(move |b| (a, b)))
            .collect();
        pairs.shuffle(&mut rng);

        let ports = family.ports_per_socket();
        let mut next_free = vec![0u32; sockets as usize];
        let mut links = Vec::new();
        for (a, b) in pairs {
            let (pa, pb) = (next_free[a as usize], next_free[b as usize]);
            if pa < ports && pb < ports {
                links.push((PortId::new(a, pa), PortId::new(b, pb)));
                next_free[a as usize] += 1;
                next_free[b as usize] += 1;
            }
        }
        Self::new(family, (0..sockets).collect(), links)
    }

    pub fn family(&self) -> PlatformFamily {
        self.family
    }

    /// Every wired link, disabled ones included.
    pub fn links(&self) -> &[(PortId, PortId)] {
        &self.links
    }

    // -- mesh -------------------------------------------------------------

    /// Report an unconnected endpoint in the KTI scan.
    pub fn add_dangling(&mut self, port: PortId) {
        self.dangling.push(port);
    }

    /// Take a link down immediately, as a failed training would.
    pub fn disable_port(&mut self, port: PortId) {
        self.disabled.insert(port);
    }

    pub fn disabled_ports(&self) -> &BTreeSet<PortId> {
        &self.disabled
    }

    /// Make `port` report `peer` instead of its real partner.
    pub fn override_peer(&mut self, port: PortId, peer: PortId) {
        self.peer_overrides.insert(port, peer);
    }

    fn endpoints(&self, socket: u32) -> Vec<KtiEndpoint> {
        let mut endpoints = Vec::new();
        for &(a, b) in &self.links {
            for (local, remote) in [(a, b), (b, a)] {
                if local.socket != socket {
                    continue;
                }
                let down = self.disabled.contains(&local) || self.disabled.contains(&remote);
                let peer = if down {
                    None
                } else {
                    Some(self.peer_overrides.get(&local).copied().unwrap_or(remote))
                };
                endpoints.push(KtiEndpoint {
                    port: local.port,
                    peer,
                });
            }
        }
        endpoints.extend(
            self.dangling
                .iter()
                .filter(|d| d.socket == socket)
                .map(|d| KtiEndpoint {
                    port: d.port,
                    peer: None,
                }),
        );
        endpoints
    }

    // -- registers --------------------------------------------------------

    /// Pin a register to `value`.
    pub fn set_register(&mut self, socket: u32, path: &str, value: u64) {
        self.registers.insert((socket, path.to_string()), value);
    }

    /// Pin a register to `value` once the fake clock reaches `at`.
    pub fn schedule_register(&mut self, at: Duration, socket: u32, path: &str, value: u64) {
        self.scheduled.push(ScheduledWrite {
            at,
            socket,
            path: path.to_string(),
            value,
        });
    }

    fn register_path(&self, kind: RegisterKind, port: u32) -> Option<String> {
        let io_die = self.family.has_io_die().then_some(port / 3);
        RegisterMap::for_family(self.family)
            .and_then(|map| map.resolve(kind, port, io_die))
            .ok()
    }

    /// Pin the link speed code of one port.
    pub fn set_link_speed(&mut self, port: PortId, code: u64) {
        if let Some(path) = self.register_path(RegisterKind::LinkSpeed, port.port) {
            self.set_register(port.socket, &path, code);
        }
    }

    /// Train every link at the slower of its two mixed-speed presets.
    pub fn apply_mixed_speed_presets(&mut self) {
        let family = self.family;
        for (a, b) in self.links.clone() {
            if let (Some(ca), Some(cb)) = (family.preset_speed_code(a), family.preset_speed_code(b)) {
                let code = ca.min(cb);
                self.set_link_speed(a, code);
                self.set_link_speed(b, code);
            }
        }
    }

    /// Fail the next `count` register reads with a connection loss.
    pub fn drop_connection_for(&mut self, count: u32) {
        self.connection_drops = count;
    }

    pub fn reconfigure_count(&self) -> u32 {
        self.reconfigures
    }

    fn default_register(&self, path: &str) -> u64 {
        if path.ends_with("s_clm") {
            0x7
        } else if path.ends_with("s_rx_state") || path.ends_with("s_tx_state") {
            0xf
        } else if SPEED_SUFFIXES.iter().any(|s| path.ends_with(s)) {
            self.family.max_speed_code()
        } else {
            0x0
        }
    }

    fn land_scheduled(&mut self) {
        let now = self.now;
        let (due, pending): (Vec<_>, Vec<_>) = self.scheduled.drain(..).partition(|w| w.at <= now);
        self.scheduled = pending;
        for write in due {
            self.registers.insert((write.socket, write.path), write.value);
        }
    }

    fn read_register(&mut self, socket: u32, path: &str) -> Result<u64> {
        if self.connection_drops > 0 {
            self.connection_drops -= 1;
            return Err(UpiError::ConnectionLost(format!(
                "IPC link dropped reading socket{}.{}",
                socket, path
            )));
        }
        if !self.sockets.contains(&socket) {
            return Err(UpiError::RegisterAccess(format!("socket {} is not present", socket)));
        }
        self.land_scheduled();
        Ok(self
            .registers
            .get(&(socket, path.to_string()))
            .copied()
            .unwrap_or_else(|| self.default_register(path)))
    }

    // -- clock ------------------------------------------------------------

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Move the clock forward. Workloads whose run time is up exit.
    pub fn advance(&mut self, duration: Duration) {
        self.now += duration;
        if matches!(self.workload_crash_at, Some(at) if self.now >= at) {
            self.processes.clear();
        }
        let now = self.now;
        self.processes.retain(|p| p.ends_at.map_or(true, |end| now < end));
    }

    // -- BIOS and power ---------------------------------------------------

    /// Fail the next `count` knob applies with a connection loss.
    pub fn drop_bios_connection_for(&mut self, count: u32) {
        self.bios_drops = count;
    }

    /// Accept knob writes without them ever taking effect.
    pub fn set_knobs_ignored(&mut self, ignored: bool) {
        self.knobs_ignored = ignored;
    }

    /// Knob batches in the order they were applied.
    pub fn applied_knobs(&self) -> &[Vec<BiosKnob>] {
        &self.applied_knobs
    }

    pub fn set_reset_duration(&mut self, duration: Duration) {
        self.reset_duration = duration;
    }

    /// Fail the `nth` reset (1-based).
    pub fn fail_reset_on(&mut self, nth: usize) {
        self.fail_reset_on = Some(nth);
    }

    pub fn resets(&self) -> &[ResetKind] {
        &self.resets
    }

    fn parse_port_knob(name: &str, suffix: &str) -> Option<PortId> {
        let rest = name.strip_prefix("Cpu")?.strip_suffix(suffix)?;
        let (socket, port) = rest.split_once('P')?;
        Some(PortId::new(socket.parse().ok()?, port.parse().ok()?))
    }

    fn commit_knobs(&mut self) {
        if std::mem::take(&mut self.pending_defaults) {
            self.disabled.clear();
            let speed_paths: Vec<_> = self
                .registers
                .keys()
                .filter(|(_, path)| SPEED_SUFFIXES.iter().any(|s| path.ends_with(s)))
                .cloned()
                .collect();
            for key in speed_paths {
                self.registers.remove(&key);
            }
        }
        let mut speeds = BTreeMap::new();
        for knob in std::mem::take(&mut self.pending_knobs) {
            if let Some(port) = Self::parse_port_knob(&knob.name, "KtiPortDisable") {
                if knob.value == "1" {
                    self.disabled.insert(port);
                }
            } else if let Some(port) = Self::parse_port_knob(&knob.name, "KtiLinkSpeed") {
                if let Ok(code) = u64::from_str_radix(knob.value.trim_start_matches("0x"), 16) {
                    speeds.insert(port, code);
                }
            }
        }
        // A link trains at the slower end.
        for (a, b) in self.links.clone() {
            let requested = [speeds.get(&a), speeds.get(&b)];
            if let Some(code) = requested.into_iter().flatten().min().copied() {
                self.set_link_speed(a, code);
                self.set_link_speed(b, code);
            }
        }
    }

    fn reset(&mut self, kind: ResetKind) -> Result<()> {
        self.resets.push(kind);
        self.processes.clear();
        self.advance(self.reset_duration);
        if self.fail_reset_on == Some(self.resets.len()) {
            return Err(UpiError::Power(format!(
                "{} reset {} did not complete",
                kind,
                self.resets.len()
            )));
        }
        if kind == ResetKind::Cold {
            self.commit_knobs();
        }
        Ok(())
    }

    // -- OS ---------------------------------------------------------------

    /// Command lines of the background processes currently running.
    pub fn processes(&self) -> Vec<&str> {
        self.processes.iter().map(|p| p.command.as_str()).collect()
    }

    /// Every synchronous and background command issued, in order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Kill every background process once the clock reaches `at`.
    pub fn crash_workloads_at(&mut self, at: Duration) {
        self.workload_crash_at = Some(at);
    }

    /// Background launches return a handle but the process never appears.
    pub fn set_launch_fails(&mut self, fails: bool) {
        self.launch_fails = fails;
    }

    /// Make killing the background session fail.
    pub fn set_session_kill_fails(&mut self, fails: bool) {
        self.session_kill_fails = fails;
    }

    /// Socket count the OS reports, if different from the silicon.
    pub fn set_os_socket_count(&mut self, count: u32) {
        self.os_sockets = Some(count);
    }

    pub fn set_load(&mut self, idle: f64, stressed: f64) {
        self.idle_load = idle;
        self.stress_load = stressed;
    }

    /// Measured bandwidth between two sockets, in GB/s.
    pub fn set_bandwidth_gbps(&mut self, a: u32, b: u32, gbps: f64) {
        self.bandwidth_mbps.insert((a.min(b), a.max(b)), gbps * 1000.0);
    }

    pub fn installed_tools(&self) -> &[String] {
        &self.installed
    }

    /// Number of times the installer was asked to install anything.
    pub fn install_count(&self) -> u32 {
        self.install_calls
    }

    /// Tool already present on the SUT before the run starts.
    pub fn preinstall(&mut self, tool: &str) {
        if !self.installed.iter().any(|t| t == tool) {
            self.installed.push(tool.to_string());
        }
    }

    /// Package C6 residency PTU reports while the SUT is idle, in percent.
    pub fn set_c6_residency(&mut self, percent: f64) {
        self.c6_residency = percent;
    }

    /// Speed of every populated DIMM, in MT/s.
    pub fn set_dimm_speeds(&mut self, speeds: Vec<u32>) {
        self.dimm_speeds = speeds;
    }

    pub fn set_stream_iteration_time(&mut self, per_iteration: Duration) {
        self.stream_millis_per_iteration = per_iteration.as_millis() as u64;
    }

    /// Best Triad rate the stream benchmark reports, in MB/s.
    pub fn set_stream_triad_mbps(&mut self, mbps: f64) {
        self.stream_triad_mbps = mbps;
    }

    fn stream_run_time(&self, iterations: u64) -> Duration {
        Duration::from_millis(iterations * self.stream_millis_per_iteration)
    }

    fn stream_report(&self) -> String {
        let triad = self.stream_triad_mbps;
        format!(
            "Running Stream benchmark\n\
             -------------------------------------------------------------\n\
             Function    Best Rate MB/s  Avg time     Min time     Max time\n\
             Copy:       {:>12.1}     0.042118     0.041902     0.042471\n\
             Scale:      {:>12.1}     0.042350     0.042133     0.042702\n\
             Add:        {:>12.1}     0.061247     0.060989     0.061613\n\
             Triad:      {:>12.1}     0.061592     0.061301     0.061902\n",
            triad * 0.9,
            triad * 0.9,
            triad,
            triad
        )
    }

    fn ptu_csv(&self) -> String {
        let residency = if self.processes.is_empty() {
            self.c6_residency
        } else {
            0.4
        };
        let mut out = String::from("Device,Time,Freq,Util,C0,C6,Temp\n");
        for sample in 0..3 {
            out.push_str(&format!(
                "CPU0,12:00:{:02},800,0.8,{:.1},{:.1},38\n",
                sample * 5,
                100.0 - residency,
                residency
            ));
        }
        out
    }

    fn dmidecode_speeds(&self) -> String {
        self.dimm_speeds
            .iter()
            .map(|s| format!("\tSpeed: {s} MT/s\n\tConfigured Memory Speed: {s} MT/s\n", s = s))
            .collect()
    }

    pub fn remove_tool(&mut self, tool: &str) {
        self.missing_tools.insert(tool.to_string());
    }

    fn bandwidth_matrix(&self) -> String {
        let mut out = String::from(
            "Measuring Memory Bandwidths between nodes within system\n\
             Bandwidths are in MB/sec (1 MB/sec = 1,000,000 Bytes/sec)\n\
             Using all the threads from each core if Hyper-threading is enabled\n\
             Using Read-only traffic type\n\
             \t\tNuma node\n",
        );
        out.push_str("Numa node");
        for s in &self.sockets {
            out.push_str(&format!("\t{:>10}", s));
        }
        out.push('\n');
        for &a in &self.sockets {
            out.push_str(&format!("{:>9}", a));
            for &b in &self.sockets {
                let mbps = self
                    .bandwidth_mbps
                    .get(&(a.min(b), a.max(b)))
                    .copied()
                    .unwrap_or(self.default_bandwidth_mbps);
                out.push_str(&format!("\t{:>10.1}", mbps));
            }
            out.push('\n');
        }
        out
    }

    fn pattern_after<'c>(cmd: &'c str, prefix: &str) -> Option<&'c str> {
        cmd.strip_prefix(prefix)
            .map(|p| p.trim().trim_matches(|c| c == '\'' || c == '"'))
    }

    fn run_command(&mut self, cmd: &str) -> CommandOutput {
        self.commands.push(cmd.to_string());
        let ok = |stdout: String| CommandOutput {
            stdout,
            stderr: String::new(),
            return_code: 0,
        };
        let missing = CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            return_code: 1,
        };

        if cmd.contains("lscpu") {
            let count = self.os_sockets.unwrap_or(self.sockets.len() as u32);
            return ok(format!("{}\n", count));
        }
        if cmd.contains("/proc/loadavg") {
            let load = if self.processes.is_empty() {
                self.idle_load
            } else {
                self.stress_load
            };
            return ok(format!("{:.2} {:.2} {:.2} 2/812 40213\n", load, load, load));
        }
        if cmd.contains("--bandwidth_matrix") {
            return ok(self.bandwidth_matrix());
        }
        if cmd.contains("dmidecode") {
            return ok(self.dmidecode_speeds());
        }
        if cmd.starts_with("rm -rf /root/log") {
            self.ptu_logged = false;
            return ok(String::new());
        }
        if cmd.starts_with("./ptu") && cmd.contains("-mon") {
            if let Some(run) = requested_run_time(cmd) {
                self.advance(run);
            }
            self.ptu_logged = true;
            return ok(String::new());
        }
        if cmd.contains("ptumon.csv") {
            return if self.ptu_logged {
                ok(self.ptu_csv())
            } else {
                missing
            };
        }
        if cmd.contains("rm -rf stream_output.txt") {
            self.stream_output = false;
            return ok(String::new());
        }
        if cmd.starts_with("head stream_output.txt") || cmd.starts_with("cat stream_output.txt") {
            return if self.stream_output {
                ok(self.stream_report())
            } else {
                missing
            };
        }
        if let Some(iterations) = stream_iterations(cmd) {
            // Foreground calibration run.
            self.advance(self.stream_run_time(iterations));
            return ok(self.stream_report());
        }
        if let Some(pattern) = Self::pattern_after(cmd, "pgrep -f") {
            let pids: Vec<String> = self
                .processes
                .iter()
                .enumerate()
                .filter(|(_, p)| p.command.contains(pattern))
                .map(|(i, _)| (4000 + i).to_string())
                .collect();
            return if pids.is_empty() {
                missing
            } else {
                ok(pids.join("\n") + "\n")
            };
        }
        if let Some(pattern) = Self::pattern_after(cmd, "pkill -f") {
            let before = self.processes.len();
            self.processes.retain(|p| !p.command.contains(pattern));
            return if self.processes.len() == before {
                missing
            } else {
                ok(String::new())
            };
        }
        ok(String::new())
    }
}

/// Silicon-debug view of a [`SimState`].
#[derive(Clone)]
pub struct SimDebug {
    state: SharedSim,
}

impl SimDebug {
    pub fn new(state: SharedSim) -> Self {
        Self { state }
    }
}

impl SiliconDebug for SimDebug {
    fn platform_family(&self) -> Result<PlatformFamily> {
        Ok(self.state.borrow().family)
    }

    fn sockets(&self) -> Result<Vec<u32>> {
        Ok(self.state.borrow().sockets.clone())
    }

    fn kti_devices(&self, socket: u32) -> Result<Vec<KtiEndpoint>> {
        Ok(self.state.borrow().endpoints(socket))
    }

    fn io_die(&self, port: u32) -> Result<u32> {
        Ok(port / 3)
    }

    fn get_by_path(&self, socket: u32, path: &str) -> Result<u64> {
        self.state.borrow_mut().read_register(socket, path)
    }

    fn reconfigure(&self) -> Result<()> {
        self.state.borrow_mut().reconfigures += 1;
        Ok(())
    }
}

/// OS shell view of a [`SimState`].
pub struct SimShell {
    state: SharedSim,
}

impl SimShell {
    pub fn new(state: SharedSim) -> Self {
        Self { state }
    }
}

impl OsShell for SimShell {
    fn execute(&mut self, cmd: &str, timeout: Duration, _cwd: Option<&str>) -> Result<CommandOutput> {
        log::debug!("sim execute ({}s): {}", timeout.as_secs(), cmd);
        Ok(self.state.borrow_mut().run_command(cmd))
    }

    fn execute_async(&mut self, cmd: &str, _cwd: Option<&str>) -> Result<AsyncHandle> {
        let mut state = self.state.borrow_mut();
        state.commands.push(cmd.to_string());
        if !state.launch_fails {
            let run_time = match stream_iterations(cmd) {
                Some(iterations) => {
                    state.stream_output = cmd.contains("stream_output.txt");
                    Some(state.stream_run_time(iterations))
                }
                None => requested_run_time(cmd),
            };
            let ends_at = run_time.map(|run| state.now + run);
            state.processes.push(SimProcess {
                command: cmd.to_string(),
                ends_at,
            });
            // The mesh perl driver forks the MLC engine.
            if cmd.contains("mesh_stress/") {
                state.processes.push(SimProcess {
                    command: "./mlc_internal".to_string(),
                    ends_at,
                });
            }
        }
        state.next_handle += 1;
        Ok(AsyncHandle {
            id: state.next_handle,
            command: cmd.to_string(),
        })
    }

    fn kill_async_session(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.session_kill_fails {
            return Err(UpiError::CommandFailed("background session did not exit".into()));
        }
        state.processes.clear();
        Ok(())
    }

    fn path_exists(&mut self, path: &str) -> Result<bool> {
        let state = self.state.borrow();
        if path.contains("ptumon.csv") {
            return Ok(state.ptu_logged);
        }
        let path = Path::new(path);
        Ok(state
            .installed
            .iter()
            .any(|tool| path.starts_with(Path::new(TOOLS_DIR).join(tool))))
    }
}

/// BIOS view of a [`SimState`]. Knobs land on the next cold reset.
pub struct SimBios {
    state: SharedSim,
}

impl SimBios {
    pub fn new(state: SharedSim) -> Self {
        Self { state }
    }
}

impl BiosControl for SimBios {
    fn apply_knobs(&mut self, knobs: &[BiosKnob]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.bios_drops > 0 {
            state.bios_drops -= 1;
            return Err(UpiError::ConnectionLost("BIOS programming link dropped".into()));
        }
        if !state.knobs_ignored {
            state.pending_knobs.extend_from_slice(knobs);
        }
        state.applied_knobs.push(knobs.to_vec());
        Ok(())
    }

    fn load_defaults(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.pending_knobs.clear();
        state.pending_defaults = true;
        Ok(())
    }
}

/// Power view of a [`SimState`].
pub struct SimPower {
    state: SharedSim,
}

impl SimPower {
    pub fn new(state: SharedSim) -> Self {
        Self { state }
    }
}

impl PowerControl for SimPower {
    fn cold_reset(&mut self) -> Result<()> {
        self.state.borrow_mut().reset(ResetKind::Cold)
    }

    fn warm_reset(&mut self) -> Result<()> {
        self.state.borrow_mut().reset(ResetKind::Warm)
    }

    fn wait_for_os(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Collateral installer view of a [`SimState`].
pub struct SimInstaller {
    state: SharedSim,
}

impl SimInstaller {
    pub fn new(state: SharedSim) -> Self {
        Self { state }
    }
}

impl ToolInstaller for SimInstaller {
    fn install_path(&self, tool: &str) -> String {
        format!("{}/{}", TOOLS_DIR, tool)
    }

    fn install(&mut self, tool: &str) -> Result<String> {
        let mut state = self.state.borrow_mut();
        state.install_calls += 1;
        if state.missing_tools.contains(tool) {
            return Err(UpiError::CommandFailed(format!("collateral '{}' not found", tool)));
        }
        if !state.installed.iter().any(|t| t == tool) {
            state.installed.push(tool.to_string());
        }
        Ok(self.install_path(tool))
    }
}

/// Fake monotonic clock; `sleep` advances time instantly.
#[derive(Clone)]
pub struct SimClock {
    state: SharedSim,
}

impl SimClock {
    pub fn new(state: SharedSim) -> Self {
        Self { state }
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.state.borrow().now
    }

    fn sleep(&self, duration: Duration) {
        self.state.borrow_mut().advance(duration);
    }
}

/// Bundle every simulated collaborator over one shared platform.
pub fn simulated_sut(state: &SharedSim) -> Sut {
    Sut {
        debug: Box::new(SimDebug::new(state.clone())),
        os: Box::new(SimShell::new(state.clone())),
        bios: Box::new(SimBios::new(state.clone())),
        power: Box::new(SimPower::new(state.clone())),
        installer: Box::new(SimInstaller::new(state.clone())),
        clock: Box::new(SimClock::new(state.clone())),
    }
}

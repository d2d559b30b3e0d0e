// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Port degradation through BIOS knobs.
//!
//! A [`DegradationPlan`] names the ports to take down, either explicitly or
//! as a per-socket count chosen at random. Resolving a plan always adds each
//! port's peer, since a link cannot be half down. The disable knobs only
//! land on a cold reset, after which the live port set is compared against
//! the plan.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpiError};
use crate::retry::with_reconnect;
use crate::sut::{knob_list, BiosKnob, OsShell, Sut};
use crate::topology::{ActivePorts, PortId, Topology};

/// Command that prints the OS-visible socket count.
pub const LSCPU_SOCKETS_CMD: &str = "lscpu | grep 'Socket(s):' | awk '{print $2}'";

/// Which ports a degradation test takes down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationPlan {
    /// These ports, plus their peers.
    Explicit(Vec<PortId>),
    /// This many ports on every socket, picked from the active set.
    Random { ports_per_socket: usize },
}

/// Resolved, peer-closed set of ports to disable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisableSet(BTreeSet<PortId>);

impl DisableSet {
    pub fn contains(&self, port: PortId) -> bool {
        self.0.contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ports disabled on `socket`.
    pub fn on_socket(&self, socket: u32) -> BTreeSet<u32> {
        self.0
            .iter()
            .filter(|p| p.socket == socket)
            .map(|p| p.port)
            .collect()
    }

    /// One `Cpu{s}P{p}KtiPortDisable=1` knob per disabled port.
    pub fn knobs(&self) -> Vec<BiosKnob> {
        self.0
            .iter()
            .map(|p| BiosKnob::new(format!("Cpu{}P{}KtiPortDisable", p.socket, p.port), "1"))
            .collect()
    }

    fn insert_link(&mut self, port: PortId, peer: PortId) {
        self.0.insert(port);
        self.0.insert(peer);
    }
}

impl FromIterator<PortId> for DisableSet {
    fn from_iter<I: IntoIterator<Item = PortId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn peer_for_plan(topology: &Topology<'_>, port: PortId) -> Result<PortId> {
    topology.peer_of(port.socket, port.port).map_err(|err| match err {
        UpiError::Topology(msg) => {
            UpiError::Configuration(format!("cannot degrade {}: {}", port, msg))
        }
        other => other,
    })
}

/// Resolve `plan` against the live mesh into a peer-closed disable set.
pub fn resolve_plan<R: Rng + ?Sized>(
    topology: &Topology<'_>,
    plan: &DegradationPlan,
    rng: &mut R,
) -> Result<DisableSet> {
    let mut set = DisableSet::default();
    match plan {
        DegradationPlan::Explicit(ports) => {
            for &port in ports {
                let peer = peer_for_plan(topology, port)?;
                set.insert_link(port, peer);
            }
        }
        DegradationPlan::Random { ports_per_socket } => {
            let wanted = *ports_per_socket;
            for (socket, active) in topology.active_ports_by_socket(None)? {
                let already = set.on_socket(socket);
                let needed = wanted.saturating_sub(already.len());
                let available: Vec<u32> = active.difference(&already).copied().collect();
                if available.len() < needed {
                    return Err(UpiError::Configuration(format!(
                        "socket {} has {} port(s) left to disable, plan needs {}",
                        socket,
                        available.len(),
                        needed
                    )));
                }
                for &port in available.choose_multiple(rng, needed) {
                    let port = PortId::new(socket, port);
                    let peer = peer_for_plan(topology, port)?;
                    set.insert_link(port, peer);
                }
            }
        }
    }
    Ok(set)
}

/// Knobs that train every active port at a random speed code in `0..3`.
pub fn random_link_speed_knobs<R: Rng + ?Sized>(
    topology: &Topology<'_>,
    rng: &mut R,
) -> Result<Vec<BiosKnob>> {
    let mut knobs = Vec::new();
    for (socket, ports) in topology.active_ports_by_socket(None)? {
        log::info!("Socket {} ports {:?}", socket, ports);
        for port in ports {
            knobs.push(BiosKnob::new(
                format!("Cpu{}P{}KtiLinkSpeed", socket, port),
                format!("0x{:x}", rng.gen_range(0..3u32)),
            ));
        }
    }
    knobs.push(BiosKnob::new("QpiLinkSpeed", "0x8F"));
    knobs.push(BiosKnob::new("QpiLinkSpeedMode", "0x1"));
    Ok(knobs)
}

/// Applies degradation plans to one SUT.
pub struct DegradationController<'s> {
    sut: &'s mut Sut,
    command_timeout: Duration,
    reboot_timeout: Duration,
}

impl<'s> DegradationController<'s> {
    pub fn new(sut: &'s mut Sut) -> Self {
        Self {
            sut,
            command_timeout: Duration::from_secs(60),
            reboot_timeout: Duration::from_secs(900),
        }
    }

    pub fn with_timeouts(mut self, command: Duration, reboot: Duration) -> Self {
        self.command_timeout = command;
        self.reboot_timeout = reboot;
        self
    }

    /// Apply knobs through the BIOS channel, reconnecting once on a link drop.
    pub fn apply_knobs(&mut self, knobs: &[BiosKnob]) -> Result<()> {
        log::info!("Setting bios knobs: {}", knob_list(knobs));
        let Sut { debug, bios, .. } = &mut *self.sut;
        with_reconnect(debug.as_ref(), "bios knob apply", || bios.apply_knobs(knobs))
    }

    fn cold_reset(&mut self) -> Result<()> {
        log::info!("Bios set, performing cold reset...");
        self.sut.power.cold_reset()?;
        self.sut.power.wait_for_os(self.reboot_timeout)
    }

    /// Degrade with a thread-local RNG for random plans.
    pub fn degrade(&mut self, plan: &DegradationPlan, verify: bool) -> Result<bool> {
        self.degrade_with_rng(plan, verify, &mut rand::thread_rng())
    }

    /// Resolve `plan`, apply the knobs, cold reset and optionally verify.
    ///
    /// With `verify` set, every port that was active before must now be down
    /// exactly when the plan disabled it. Without it the caller is expected
    /// to check the socket count instead.
    pub fn degrade_with_rng<R: Rng + ?Sized>(
        &mut self,
        plan: &DegradationPlan,
        verify: bool,
        rng: &mut R,
    ) -> Result<bool> {
        let topology = Topology::new(self.sut.debug.as_ref());
        let before = topology.active_ports_by_socket(None)?;
        let disable = resolve_plan(&topology, plan, rng)?;
        log::info!("Ports to disable by socket: {:?}", summarize(&disable));

        self.apply_knobs(&disable.knobs())?;
        self.cold_reset()?;

        if !verify {
            log::info!("Degradation verification skipped");
            return Ok(true);
        }
        log::info!("Verifying if degradation occurred...");
        let after = Topology::new(self.sut.debug.as_ref()).active_ports_by_socket(None)?;
        let ok = degradation_matches(&before, &after, &disable);
        if ok {
            log::info!("Degradation verified.");
        } else {
            log::error!("Verification failed, degradation did not occur properly.");
        }
        Ok(ok)
    }

    /// Compare the socket count the OS reports against `expected`.
    pub fn verify_number_of_sockets(&mut self, expected: u32) -> Result<bool> {
        let count = os_socket_count(self.sut.os.as_mut(), self.command_timeout)?;
        if count == expected {
            log::info!("Number of socket(s) verification succeeded");
            Ok(true)
        } else {
            log::error!("Number of socket(s) did not meet expected number {}", expected);
            Ok(false)
        }
    }

    /// Load BIOS defaults and cold reset, bringing every port back.
    pub fn restore_defaults(&mut self) -> Result<()> {
        log::info!("Restoring BIOS defaults");
        let Sut { debug, bios, .. } = &mut *self.sut;
        with_reconnect(debug.as_ref(), "bios load defaults", || bios.load_defaults())?;
        self.cold_reset()
    }

    /// Program random per-port link speeds. Takes effect on the next cold reset.
    pub fn set_random_link_speed<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Vec<BiosKnob>> {
        let knobs = random_link_speed_knobs(&Topology::new(self.sut.debug.as_ref()), rng)?;
        self.apply_knobs(&knobs)?;
        Ok(knobs)
    }
}

/// Socket count reported by `lscpu` on the SUT.
pub fn os_socket_count(os: &mut dyn OsShell, timeout: Duration) -> Result<u32> {
    let output = os.execute(LSCPU_SOCKETS_CMD, timeout, None)?;
    let reported = output.stdout.trim();
    log::info!("The number of socket(s) displayed by lscpu is {}", reported);
    reported
        .parse()
        .map_err(|_| UpiError::Parse(format!("lscpu socket count '{}'", reported)))
}

fn degradation_matches(before: &ActivePorts, after: &ActivePorts, disable: &DisableSet) -> bool {
    let empty = BTreeSet::new();
    let mut ok = true;
    for (&socket, ports) in before {
        let current = after.get(&socket).unwrap_or(&empty);
        for &port in ports {
            let id = PortId::new(socket, port);
            let active = current.contains(&port);
            let should_be_down = disable.contains(id);
            if active && should_be_down {
                log::error!("{} should be down but is still active!", id);
                ok = false;
            } else if !active && !should_be_down {
                log::error!("{} should be active but is down!", id);
                ok = false;
            }
        }
    }
    ok
}

/// Disabled ports grouped by socket, for logging.
pub fn summarize(disable: &DisableSet) -> BTreeMap<u32, BTreeSet<u32>> {
    let mut by_socket: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    for p in disable.iter() {
        by_socket.entry(p.socket).or_default().insert(p.port);
    }
    by_socket
}

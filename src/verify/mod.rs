// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Single-pass UPI link-state verification.
//!
//! Every check reads one register on every active port of every active
//! socket and compares it against a set of acceptable values. Passes are
//! exhaustive: all ports are read and every mismatch is logged before the
//! check returns, so one run surfaces every failing port.
//!
//! Debug-connection errors propagate out of here untouched. Reconnect policy
//! belongs to the campaign layer.

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpiError};
use crate::platform::{ErrorRegister, PlatformFamily, RegisterKind, RegisterMap};
use crate::sut::SiliconDebug;
use crate::topology::{ConnectionMap, PortId, Topology};

/// Lane map code with every lane operational.
pub const LANES_OPERATIONAL: &[u64] = &[0x7];
/// Lane map codes legal while the package is in C6.
pub const LANES_PACKAGE_C6: &[u64] = &[0x7, 0x1];
/// Rx/Tx state codes equivalent to L0.
pub const L0_STATES: &[u64] = &[0xf, 0xe, 0xc, 0xd];
/// Rx/Tx state codes seen while links cycle through L1 exit during C6.
pub const C6_STATES: &[u64] = &[0xf, 0xa, 0x5, 0x6, 0x8, 0x9, 0xc, 0xd, 0xe];

/// Acceptable register values for one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedValues(Vec<u64>);

impl ExpectedValues {
    pub fn new(values: &[u64]) -> Self {
        let mut unique = Vec::with_capacity(values.len());
        for v in values {
            if !unique.contains(v) {
                unique.push(*v);
            }
        }
        Self(unique)
    }

    pub fn single(value: u64) -> Self {
        Self(vec![value])
    }

    pub fn contains(&self, value: u64) -> bool {
        self.0.contains(&value)
    }

    pub fn values(&self) -> &[u64] {
        &self.0
    }
}

impl std::fmt::Display for ExpectedValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex: Vec<String> = self.0.iter().map(|v| format!("{:#x}", v)).collect();
        write!(f, "[{}]", hex.join(", "))
    }
}

/// One port whose register value fell outside the expected set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub port: PortId,
    pub path: String,
    pub value: u64,
    pub expected: ExpectedValues,
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "socket={} port={} path={} value={:#x} expected={}",
            self.port.socket, self.port.port, self.path, self.value, self.expected
        )
    }
}

/// Topology disagreement found by [`LinkVerifier::verify_topology`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyMismatch {
    /// Port is up but has no entry in the expected map.
    Unexpected { port: PortId, peer: PortId },
    /// Port is up but wired to a different peer than expected.
    WrongPeer {
        port: PortId,
        expected: PortId,
        actual: PortId,
    },
    /// Peer does not report this port back.
    Asymmetric {
        port: PortId,
        peer: PortId,
        peer_reports: Option<PortId>,
    },
}

impl std::fmt::Display for TopologyMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unexpected { port, peer } => write!(
                f,
                "topology mismatch at {}: should be inactive but is connected to {}",
                port, peer
            ),
            Self::WrongPeer {
                port,
                expected,
                actual,
            } => write!(
                f,
                "topology mismatch at {}: peer should be {} but detected {}",
                port, expected, actual
            ),
            Self::Asymmetric {
                port,
                peer,
                peer_reports,
            } => match peer_reports {
                Some(back) => write!(
                    f,
                    "topology mismatch at {}: peer {} reports its partner as {}",
                    port, peer, back
                ),
                None => write!(
                    f,
                    "topology mismatch at {}: peer {} is not active",
                    port, peer
                ),
            },
        }
    }
}

/// Named check a campaign can run each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpiCheck {
    Lane,
    Topology,
    RxState,
    TxState,
    MaxLinkSpeed,
    MinLinkSpeed,
    MixedLinkSpeed,
    /// Lanes plus rx and tx L0, the long-soak suite.
    LinkHealth,
    /// Error, viral and CRC counter scan.
    NoErrors,
    /// Lane check accepting the reduced-width map legal in package C6.
    PackageC6Lane,
    RxC6State,
    TxC6State,
}

impl UpiCheck {
    pub const ALL: [UpiCheck; 12] = [
        Self::Lane,
        Self::Topology,
        Self::RxState,
        Self::TxState,
        Self::MaxLinkSpeed,
        Self::MinLinkSpeed,
        Self::MixedLinkSpeed,
        Self::LinkHealth,
        Self::NoErrors,
        Self::PackageC6Lane,
        Self::RxC6State,
        Self::TxC6State,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lane => "lane",
            Self::Topology => "topology",
            Self::RxState => "rx_state",
            Self::TxState => "tx_state",
            Self::MaxLinkSpeed => "max_link_speed",
            Self::MinLinkSpeed => "min_link_speed",
            Self::MixedLinkSpeed => "mixed_link_speed",
            Self::LinkHealth => "link_health",
            Self::NoErrors => "no_errors",
            Self::PackageC6Lane => "package_c6_lane",
            Self::RxC6State => "rx_c6_state",
            Self::TxC6State => "tx_c6_state",
        }
    }
}

impl std::fmt::Display for UpiCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UpiCheck {
    type Err = UpiError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| UpiError::Configuration(format!("unknown UPI check '{}'", s)))
    }
}

/// Runs verification passes against the live platform.
pub struct LinkVerifier<'a> {
    debug: &'a dyn SiliconDebug,
    map: RegisterMap,
    sockets: Option<Vec<u32>>,
}

impl<'a> LinkVerifier<'a> {
    /// Bind to the debug connection, resolving and validating the register map.
    pub fn new(debug: &'a dyn SiliconDebug) -> Result<Self> {
        let family = debug.platform_family()?;
        Ok(Self {
            debug,
            map: RegisterMap::for_family(family)?,
            sockets: None,
        })
    }

    /// Restrict passes to a socket subset, as after a degradation.
    pub fn with_sockets(mut self, sockets: Option<Vec<u32>>) -> Self {
        self.sockets = sockets;
        self
    }

    pub fn family(&self) -> PlatformFamily {
        self.map.family()
    }

    /// Underlying debug connection.
    pub fn debug(&self) -> &'a dyn SiliconDebug {
        self.debug
    }

    /// Socket subset this verifier is restricted to, if any.
    pub fn socket_filter(&self) -> Option<&[u32]> {
        self.sockets.as_deref()
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn topology(&self) -> Topology<'a> {
        Topology::new(self.debug)
    }

    fn io_die(&self, port: u32) -> Result<Option<u32>> {
        if self.family().has_io_die() {
            Ok(Some(self.debug.io_die(port)?))
        } else {
            Ok(None)
        }
    }

    /// Concrete path of `kind` on `port`.
    pub fn port_path(&self, kind: RegisterKind, port: u32) -> Result<String> {
        self.map.resolve(kind, port, self.io_die(port)?)
    }

    fn scan<F>(&self, expected: &ExpectedValues, path_for: F) -> Result<Vec<Mismatch>>
    where
        F: Fn(u32, Option<u32>) -> Result<String>,
    {
        let mut mismatches = Vec::new();
        let active = self
            .topology()
            .active_ports_by_socket(self.sockets.as_deref())?;
        for (socket, ports) in active {
            for port in ports {
                let path = path_for(port, self.io_die(port)?)?;
                let value = self.debug.get_by_path(socket, &path)?;
                log::debug!("sv.socket{}.{} - {:#x}", socket, path, value);
                if expected.contains(value) {
                    continue;
                }
                let mismatch = Mismatch {
                    port: PortId::new(socket, port),
                    path,
                    value,
                    expected: expected.clone(),
                };
                log::warn!("Mismatch detected: {}", mismatch);
                mismatches.push(mismatch);
            }
        }
        Ok(mismatches)
    }

    /// Read `kind` on every active port and return every mismatch.
    pub fn scan_all_ports(&self, kind: RegisterKind, expected: &ExpectedValues) -> Result<Vec<Mismatch>> {
        if self.sockets.is_none()
            && matches!(
                kind,
                RegisterKind::LaneStatus | RegisterKind::RxState | RegisterKind::TxState
            )
        {
            let wildcard = self.map.wildcard(kind);
            match self.debug.get_by_path_all(&wildcard) {
                Ok(values) => log::debug!("sv.sockets.{} - {:x?}", wildcard, values),
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => log::debug!("sv.sockets.{} unavailable: {}", wildcard, err),
            }
        }
        self.scan(expected, |port, io_die| self.map.resolve(kind, port, io_die))
    }

    /// True when every active port reports a value in `expected`.
    pub fn verify_all_ports(&self, kind: RegisterKind, expected: &ExpectedValues) -> Result<bool> {
        Ok(self.scan_all_ports(kind, expected)?.is_empty())
    }

    fn scan_and_report(&self, kind: RegisterKind, expected: &[u64], what: &str) -> Result<bool> {
        log::info!("Scanning {}...", what);
        let ok = self.verify_all_ports(kind, &ExpectedValues::new(expected))?;
        if ok {
            log::info!("Scan finished, all ports report correct {}.", what);
        } else {
            log::info!("Scan finished, some ports report incorrect {}. Details listed above.", what);
        }
        Ok(ok)
    }

    pub fn verify_lanes(&self) -> Result<bool> {
        self.scan_and_report(RegisterKind::LaneStatus, LANES_OPERATIONAL, "lane map")
    }

    /// Lane check that also accepts the reduced-width code legal in package C6.
    pub fn verify_lanes_package_c6(&self) -> Result<bool> {
        self.scan_and_report(RegisterKind::LaneStatus, LANES_PACKAGE_C6, "package C6 lane map")
    }

    pub fn verify_rx_state(&self) -> Result<bool> {
        self.scan_and_report(RegisterKind::RxState, L0_STATES, "rx L0 state")
    }

    pub fn verify_tx_state(&self) -> Result<bool> {
        self.scan_and_report(RegisterKind::TxState, L0_STATES, "tx L0 state")
    }

    pub fn verify_rx_c6_state(&self) -> Result<bool> {
        self.scan_and_report(RegisterKind::RxState, C6_STATES, "rx C6 state")
    }

    pub fn verify_tx_c6_state(&self) -> Result<bool> {
        self.scan_and_report(RegisterKind::TxState, C6_STATES, "tx C6 state")
    }

    pub fn verify_max_link_speed(&self) -> Result<bool> {
        let max = self.family().max_speed_code();
        self.scan_and_report(RegisterKind::LinkSpeed, &[max], "max link speed")
    }

    pub fn verify_min_link_speed(&self) -> Result<bool> {
        let min = self.family().min_speed_code();
        self.scan_and_report(RegisterKind::LinkSpeed, &[min], "min link speed")
    }

    /// Scan every error, viral and CRC counter on every active port.
    pub fn scan_errors(&self) -> Result<Vec<Mismatch>> {
        let mut mismatches = Vec::new();
        for register in ErrorRegister::ALL {
            let expected = ExpectedValues::new(&register.accepted_values());
            mismatches.extend(self.scan(&expected, |port, io_die| {
                self.map.resolve_error_register(register, port, io_die)
            })?);
        }
        Ok(mismatches)
    }

    pub fn verify_no_errors(&self) -> Result<bool> {
        log::info!("Scanning registers for errors");
        let ok = self.scan_errors()?.is_empty();
        if ok {
            log::info!("Scan finished, no errors detected.");
        } else {
            log::info!("Scan finished, errors detected. Details listed above.");
        }
        Ok(ok)
    }

    /// Raw link speed register code of one port.
    pub fn link_speed_code(&self, socket: u32, port: u32) -> Result<u64> {
        let path = self.port_path(RegisterKind::LinkSpeed, port)?;
        self.debug.get_by_path(socket, &path)
    }

    /// Current link speed of one port in GT/s.
    pub fn link_speed_gts(&self, socket: u32, port: u32) -> Result<f64> {
        let code = self.link_speed_code(socket, port)?;
        self.family().require_link_rate_gts(code)
    }

    /// Each port must train at the slower of its own and its peer's preset.
    pub fn verify_link_speed_mixed(&self) -> Result<bool> {
        log::info!("Scanning mixed speed settings...");
        let family = self.family();
        let preset = |port: PortId| {
            family.preset_speed_code(port).ok_or_else(|| {
                UpiError::Configuration(format!("no mixed speed preset for {} on {}", port, family))
            })
        };
        let mut ok = true;
        for (local, peer) in self.topology().links(self.sockets.as_deref())? {
            let expected = preset(local)?.min(preset(peer)?);
            let actual = self.link_speed_code(local.socket, local.port)?;
            if expected != actual {
                log::warn!(
                    "Link speed mismatch detected at {}: value should be {:#x} but detected {:#x}",
                    local,
                    expected,
                    actual
                );
                ok = false;
            }
        }
        if ok {
            log::info!("Scan finished, all ports speed set correctly.");
        } else {
            log::info!("Scan finished, some port speeds not set correctly. Details listed above.");
        }
        Ok(ok)
    }

    /// Compare the live mesh against `expected`, returning every disagreement.
    pub fn topology_mismatches(&self, expected: &ConnectionMap) -> Result<Vec<TopologyMismatch>> {
        let topology = self.topology();
        let mut mismatches = Vec::new();
        for (local, peer) in topology.links(self.sockets.as_deref())? {
            let peer_reports = match topology.peer_of(peer.socket, peer.port) {
                Ok(back) => Some(back),
                Err(UpiError::Topology(_)) => None,
                Err(err) => return Err(err),
            };
            if peer_reports != Some(local) {
                mismatches.push(TopologyMismatch::Asymmetric {
                    port: local,
                    peer,
                    peer_reports,
                });
            }
            match expected.expected_peer(local) {
                None => mismatches.push(TopologyMismatch::Unexpected { port: local, peer }),
                Some(want) if want != peer => mismatches.push(TopologyMismatch::WrongPeer {
                    port: local,
                    expected: want,
                    actual: peer,
                }),
                Some(_) => {}
            }
        }
        for mismatch in &mismatches {
            log::warn!("{}", mismatch);
        }
        Ok(mismatches)
    }

    /// Topology check; with no expected map configured it passes trivially.
    pub fn verify_topology(&self, expected: Option<&ConnectionMap>) -> Result<bool> {
        let Some(expected) = expected else {
            log::info!("No topology found in system config file, verification skipped.");
            return Ok(true);
        };
        let ok = self.topology_mismatches(expected)?.is_empty();
        if ok {
            log::info!("Scan finished, upi topology verified.");
        } else {
            log::info!("Scan finished, upi topology verification failed. Details listed above.");
        }
        Ok(ok)
    }

    /// True when `port` is active on every socket.
    pub fn verify_port_connected(&self, port: u32) -> Result<bool> {
        let active = self
            .topology()
            .active_ports_by_socket(self.sockets.as_deref())?;
        let mut ok = true;
        for (socket, ports) in active {
            log::info!("Socket {} ports {:?}", socket, ports);
            if !ports.contains(&port) {
                log::warn!("{} is not connected", PortId::new(socket, port));
                ok = false;
            }
        }
        Ok(ok)
    }

    /// Dispatch a named check.
    pub fn run_check(&self, check: UpiCheck, expected_topology: Option<&ConnectionMap>) -> Result<bool> {
        match check {
            UpiCheck::Lane => self.verify_lanes(),
            UpiCheck::Topology => {
                self.topology().log_topology()?;
                self.verify_topology(expected_topology)
            }
            UpiCheck::RxState => self.verify_rx_state(),
            UpiCheck::TxState => self.verify_tx_state(),
            UpiCheck::MaxLinkSpeed => self.verify_max_link_speed(),
            UpiCheck::MinLinkSpeed => self.verify_min_link_speed(),
            UpiCheck::MixedLinkSpeed => self.verify_link_speed_mixed(),
            UpiCheck::LinkHealth => {
                let lanes = self.verify_lanes()?;
                let rx = self.verify_rx_state()?;
                let tx = self.verify_tx_state()?;
                Ok(lanes && rx && tx)
            }
            UpiCheck::NoErrors => self.verify_no_errors(),
            UpiCheck::PackageC6Lane => self.verify_lanes_package_c6(),
            UpiCheck::RxC6State => self.verify_rx_c6_state(),
            UpiCheck::TxC6State => self.verify_tx_c6_state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDebug, SimState};

    fn p(socket: u32, port: u32) -> PortId {
        PortId::new(socket, port)
    }

    fn lane_path(port: u32) -> String {
        format!("uncore.upi.upi{}.ktireut_ph_css.s_clm", port)
    }

    #[test]
    fn test_expected_values_display_and_dedup() {
        let expected = ExpectedValues::new(&[0xf, 0xe, 0xf]);
        assert_eq!(expected.values(), &[0xf, 0xe]);
        assert_eq!(expected.to_string(), "[0xf, 0xe]");
        assert!(expected.contains(0xe));
        assert!(!expected.contains(0x5));
    }

    #[test]
    fn test_healthy_icx_lanes_pass() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();
        assert!(verifier.verify_lanes().unwrap());
        assert!(verifier.verify_rx_state().unwrap());
        assert!(verifier.verify_tx_state().unwrap());
        assert!(verifier.verify_no_errors().unwrap());
        assert!(verifier.verify_max_link_speed().unwrap());
        assert!(!verifier.verify_min_link_speed().unwrap());
    }

    #[test]
    fn test_single_bad_lane_is_reported_with_full_context() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        state.borrow_mut().set_register(1, &lane_path(3), 0x3);
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();

        assert!(!verifier.verify_lanes().unwrap());
        let mismatches = verifier
            .scan_all_ports(RegisterKind::LaneStatus, &ExpectedValues::new(LANES_OPERATIONAL))
            .unwrap();
        assert_eq!(mismatches.len(), 1);
        let line = mismatches[0].to_string();
        assert!(line.contains("socket=1"), "{}", line);
        assert!(line.contains("port=3"), "{}", line);
        assert!(line.contains("value=0x3"), "{}", line);
        assert!(line.contains("expected=[0x7]"), "{}", line);
    }

    #[test]
    fn test_scan_reports_every_mismatch() {
        let state = SimState::four_socket_mesh(PlatformFamily::SPR);
        {
            let mut s = state.borrow_mut();
            s.set_register(0, &lane_path(0), 0x3);
            s.set_register(1, &lane_path(2), 0x1);
            s.set_register(3, &lane_path(1), 0x0);
        }
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();
        let mismatches = verifier
            .scan_all_ports(RegisterKind::LaneStatus, &ExpectedValues::new(LANES_OPERATIONAL))
            .unwrap();
        let ports: Vec<_> = mismatches.iter().map(|m| m.port).collect();
        assert_eq!(ports, vec![p(0, 0), p(1, 2), p(3, 1)]);
    }

    #[test]
    fn test_package_c6_lane_code_accepted_only_in_c6_check() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        state.borrow_mut().set_register(0, &lane_path(1), 0x1);
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();
        assert!(!verifier.verify_lanes().unwrap());
        assert!(verifier.verify_lanes_package_c6().unwrap());
    }

    #[test]
    fn test_rx_l0_equivalents_accepted() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        {
            let mut s = state.borrow_mut();
            s.set_register(0, "uncore.upi.upi0.ktireut_ph_css.s_rx_state", 0xc);
            s.set_register(1, "uncore.upi.upi1.ktireut_ph_css.s_rx_state", 0xd);
        }
        let debug = SimDebug::new(state.clone());
        let verifier = LinkVerifier::new(&debug).unwrap();
        assert!(verifier.verify_rx_state().unwrap());

        state
            .borrow_mut()
            .set_register(1, "uncore.upi.upi1.ktireut_ph_css.s_rx_state", 0xa);
        assert!(!verifier.verify_rx_state().unwrap());
        assert!(verifier.verify_rx_c6_state().unwrap());
    }

    #[test]
    fn test_viral_loopback_enable_is_benign() {
        let state = SimState::two_socket(PlatformFamily::EMR);
        state
            .borrow_mut()
            .set_register(0, "uncore.upi.upi2.ktiviral", 0x10);
        let debug = SimDebug::new(state.clone());
        let verifier = LinkVerifier::new(&debug).unwrap();
        assert!(verifier.verify_no_errors().unwrap());

        state
            .borrow_mut()
            .set_register(1, "uncore.upi.upi0.kticrcerrcnt", 0x10);
        let errors = verifier.scan_errors().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].port, p(1, 0));
        assert!(errors[0].path.ends_with("kticrcerrcnt"));
    }

    #[test]
    fn test_gnr_paths_use_io_die() {
        let state = SimState::two_socket(PlatformFamily::GNR);
        state.borrow_mut().set_register(
            1,
            "io1.uncore.upi.upi4.upi_regs.ktireut_ph_css.s_tx_state",
            0x5,
        );
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();
        assert_eq!(
            verifier.port_path(RegisterKind::LaneStatus, 1).unwrap(),
            "io0.uncore.upi.upi1.upi_regs.ktireut_ph_css.s_clm"
        );
        let mismatches = verifier
            .scan_all_ports(RegisterKind::TxState, &ExpectedValues::new(L0_STATES))
            .unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].port, p(1, 4));
    }

    #[test]
    fn test_socket_filter_skips_other_sockets() {
        let state = SimState::four_socket_mesh(PlatformFamily::SPR);
        state.borrow_mut().set_register(2, &lane_path(0), 0x0);
        let debug = SimDebug::new(state);
        let all = LinkVerifier::new(&debug).unwrap();
        assert!(!all.verify_lanes().unwrap());
        let subset = LinkVerifier::new(&debug).unwrap().with_sockets(Some(vec![0, 1]));
        assert!(subset.verify_lanes().unwrap());
    }

    #[test]
    fn test_connection_loss_propagates() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        state.borrow_mut().drop_connection_for(1);
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();
        assert!(matches!(verifier.verify_lanes(), Err(UpiError::ConnectionLost(_))));
    }

    #[test]
    fn test_mixed_link_speed() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        state.borrow_mut().apply_mixed_speed_presets();
        let debug = SimDebug::new(state.clone());
        let verifier = LinkVerifier::new(&debug).unwrap();
        assert!(verifier.verify_link_speed_mixed().unwrap());

        state.borrow_mut().set_register(
            0,
            "uncore.upi.upi0.pipe_clk_rate_ctrl.cri_freq_select",
            0x1,
        );
        assert!(!verifier.verify_link_speed_mixed().unwrap());
    }

    #[test]
    fn test_link_speed_gts() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();
        assert_eq!(verifier.link_speed_gts(0, 0).unwrap(), 11.2);
    }

    #[test]
    fn test_topology_matches_config() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();
        let expected = ConnectionMap::from_link_strings(&[
            "S0P0-S1P0",
            "S0P1-S1P1",
            "S0P2-S1P2",
            "S0P3-S1P3",
        ])
        .unwrap();
        assert!(verifier.verify_topology(Some(&expected)).unwrap());
        assert!(verifier.verify_topology(None).unwrap());
    }

    #[test]
    fn test_topology_flags_unexpected_and_wrong_peer() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();
        let expected =
            ConnectionMap::from_link_strings(&["S0P0-S1P1", "S0P1-S1P0", "S0P2-S1P2"]).unwrap();
        let mismatches = verifier.topology_mismatches(&expected).unwrap();
        assert!(mismatches.contains(&TopologyMismatch::WrongPeer {
            port: p(0, 0),
            expected: p(1, 1),
            actual: p(1, 0),
        }));
        assert!(mismatches.contains(&TopologyMismatch::Unexpected {
            port: p(0, 3),
            peer: p(1, 3),
        }));
        assert!(!verifier.verify_topology(Some(&expected)).unwrap());
    }

    #[test]
    fn test_topology_flags_asymmetric_peer() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        state.borrow_mut().override_peer(p(1, 2), p(0, 3));
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();
        let expected = ConnectionMap::from_link_strings(&[
            "S0P0-S1P0",
            "S0P1-S1P1",
            "S0P2-S1P2",
            "S0P3-S1P3",
        ])
        .unwrap();
        let mismatches = verifier.topology_mismatches(&expected).unwrap();
        assert!(mismatches.iter().any(|m| matches!(
            m,
            TopologyMismatch::Asymmetric { port, peer_reports: Some(back), .. }
                if *port == p(0, 2) && *back == p(0, 3)
        )));
    }

    #[test]
    fn test_port_connected() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        state.borrow_mut().disable_port(p(0, 2));
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();
        assert!(verifier.verify_port_connected(1).unwrap());
        assert!(!verifier.verify_port_connected(2).unwrap());
    }

    #[test]
    fn test_run_check_dispatch() {
        let state = SimState::two_socket(PlatformFamily::EMR);
        let debug = SimDebug::new(state);
        let verifier = LinkVerifier::new(&debug).unwrap();
        for check in UpiCheck::ALL {
            let expected = !matches!(check, UpiCheck::MinLinkSpeed | UpiCheck::MixedLinkSpeed);
            assert_eq!(verifier.run_check(check, None).unwrap(), expected, "{}", check);
        }
    }

    #[test]
    fn test_check_parse() {
        assert_eq!("rx-state".parse::<UpiCheck>().unwrap(), UpiCheck::RxState);
        assert_eq!("LINK_HEALTH".parse::<UpiCheck>().unwrap(), UpiCheck::LinkHealth);
        assert_eq!("package-c6-lane".parse::<UpiCheck>().unwrap(), UpiCheck::PackageC6Lane);
        assert!("speed".parse::<UpiCheck>().is_err());
    }
}

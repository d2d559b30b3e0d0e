// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! UPI port enumeration and peer resolution.
//!
//! Active ports are whatever the live KTI device scan reports once dangling
//! endpoints are dropped. Nothing here is cached: a degradation cold reset
//! can take ports down mid-run, so every query goes back to the scan.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpiError};
use crate::sut::{KtiEndpoint, SiliconDebug};

/// A UPI port scoped to its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId {
    pub socket: u32,
    pub port: u32,
}

impl PortId {
    pub const fn new(socket: u32, port: u32) -> Self {
        Self { socket, port }
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}P{}", self.socket, self.port)
    }
}

impl std::str::FromStr for PortId {
    type Err = UpiError;

    /// Parse `S<socket>P<port>`, case-insensitive.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || UpiError::Parse(format!("expected S<socket>P<port>, got '{}'", s));
        let upper = s.trim().to_ascii_uppercase();
        let rest = upper.strip_prefix('S').ok_or_else(bad)?;
        let (socket, port) = rest.split_once('P').ok_or_else(bad)?;
        Ok(Self {
            socket: socket.parse().map_err(|_| bad())?,
            port: port.parse().map_err(|_| bad())?,
        })
    }
}

impl From<(u32, u32)> for PortId {
    fn from((socket, port): (u32, u32)) -> Self {
        Self { socket, port }
    }
}

/// Active ports keyed by socket.
pub type ActivePorts = BTreeMap<u32, BTreeSet<u32>>;

/// Live view of the UPI mesh through the debug connection.
#[derive(Clone, Copy)]
pub struct Topology<'a> {
    debug: &'a dyn SiliconDebug,
}

impl<'a> Topology<'a> {
    pub fn new(debug: &'a dyn SiliconDebug) -> Self {
        Self { debug }
    }

    pub fn sockets(&self) -> Result<Vec<u32>> {
        self.debug.sockets()
    }

    /// Scan `socket` and keep only endpoints wired to a present socket.
    fn connected_endpoints(&self, socket: u32, sockets: &[u32]) -> Result<Vec<KtiEndpoint>> {
        let scanned = self.debug.kti_devices(socket)?;
        let total = scanned.len();
        let connected: Vec<_> = scanned
            .into_iter()
            .filter(|ep| matches!(ep.peer, Some(peer) if sockets.contains(&peer.socket)))
            .collect();
        if connected.len() != total {
            log::debug!(
                "socket {}: dropped {} dangling KTI endpoint(s)",
                socket,
                total - connected.len()
            );
        }
        Ok(connected)
    }

    /// Active ports on one socket.
    pub fn active_ports(&self, socket: u32) -> Result<BTreeSet<u32>> {
        let sockets = self.sockets()?;
        Ok(self
            .connected_endpoints(socket, &sockets)?
            .into_iter()
            .map(|ep| ep.port)
            .collect())
    }

    /// Active ports on every socket, optionally restricted to `only`.
    pub fn active_ports_by_socket(&self, only: Option<&[u32]>) -> Result<ActivePorts> {
        let sockets = self.sockets()?;
        let mut result = BTreeMap::new();
        for &socket in &sockets {
            if let Some(filter) = only {
                if !filter.contains(&socket) {
                    continue;
                }
            }
            let ports = self
                .connected_endpoints(socket, &sockets)?
                .into_iter()
                .map(|ep| ep.port)
                .collect();
            result.insert(socket, ports);
        }
        Ok(result)
    }

    /// The (socket, port) that `socket`/`port` is physically wired to.
    pub fn peer_of(&self, socket: u32, port: u32) -> Result<PortId> {
        let sockets = self.sockets()?;
        self.connected_endpoints(socket, &sockets)?
            .into_iter()
            .find(|ep| ep.port == port)
            .and_then(|ep| ep.peer)
            .ok_or_else(|| {
                UpiError::Topology(format!("{} is not an active port", PortId::new(socket, port)))
            })
    }

    /// Every active port paired with its reported peer, in socket-then-port order.
    pub fn links(&self, only: Option<&[u32]>) -> Result<Vec<(PortId, PortId)>> {
        let sockets = self.sockets()?;
        let mut links = Vec::new();
        for &socket in &sockets {
            if let Some(filter) = only {
                if !filter.contains(&socket) {
                    continue;
                }
            }
            let mut endpoints = self.connected_endpoints(socket, &sockets)?;
            endpoints.sort_by_key(|ep| ep.port);
            for ep in endpoints {
                if let Some(peer) = ep.peer {
                    links.push((PortId::new(socket, ep.port), peer));
                }
            }
        }
        Ok(links)
    }

    /// Log the current mesh, one line per port.
    pub fn log_topology(&self) -> Result<()> {
        log::info!("Printing UPI topology...");
        for (local, peer) in self.links(None)? {
            log::info!("  {} <-> {}", local, peer);
        }
        Ok(())
    }
}

/// Expected peer for every port that should be up, typically from config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMap {
    peers: BTreeMap<PortId, PortId>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a link; both directions are inserted.
    pub fn insert(&mut self, a: PortId, b: PortId) {
        self.peers.insert(a, b);
        self.peers.insert(b, a);
    }

    pub fn from_pairs<I: IntoIterator<Item = (PortId, PortId)>>(pairs: I) -> Self {
        let mut map = Self::new();
        for (a, b) in pairs {
            map.insert(a, b);
        }
        map
    }

    /// Parse `"S0P1-S1P0"` style link strings.
    pub fn from_link_strings<S: AsRef<str>>(links: &[S]) -> Result<Self> {
        let mut map = Self::new();
        for link in links {
            let link = link.as_ref();
            let (a, b) = link.split_once('-').ok_or_else(|| {
                UpiError::Configuration(format!("topology link '{}' is not of the form S0P1-S1P0", link))
            })?;
            map.insert(a.parse()?, b.parse()?);
        }
        Ok(map)
    }

    pub fn expected_peer(&self, port: PortId) -> Option<PortId> {
        self.peers.get(&port).copied()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformFamily;
    use crate::sim::{SimDebug, SimState};

    fn p(socket: u32, port: u32) -> PortId {
        PortId::new(socket, port)
    }

    #[test]
    fn test_port_id_parse_and_display() {
        let id: PortId = "s1p3".parse().unwrap();
        assert_eq!(id, p(1, 3));
        assert_eq!(id.to_string(), "S1P3");
        assert!("1P3".parse::<PortId>().is_err());
        assert!("S1X3".parse::<PortId>().is_err());
        assert!("SxP3".parse::<PortId>().is_err());
    }

    #[test]
    fn test_active_ports_filters_dangling() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        state.borrow_mut().add_dangling(p(0, 4));
        let debug = SimDebug::new(state.clone());
        let topo = Topology::new(&debug);
        assert_eq!(topo.active_ports(0).unwrap(), BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(topo.active_ports(1).unwrap(), BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(debug.kti_devices(0).unwrap().len(), 5);
    }

    #[test]
    fn test_peer_of_is_symmetric() {
        let state = SimState::four_socket_mesh(PlatformFamily::SPR);
        let debug = SimDebug::new(state);
        let topo = Topology::new(&debug);
        for (local, _) in topo.links(None).unwrap() {
            let peer = topo.peer_of(local.socket, local.port).unwrap();
            let back = topo.peer_of(peer.socket, peer.port).unwrap();
            assert_eq!(back, local);
        }
    }

    #[test]
    fn test_peer_of_inactive_port_is_topology_error() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let debug = SimDebug::new(state);
        let topo = Topology::new(&debug);
        assert_eq!(topo.peer_of(0, 3).unwrap(), p(1, 3));
        assert!(matches!(topo.peer_of(0, 5), Err(UpiError::Topology(_))));
    }

    #[test]
    fn test_enumeration_is_not_cached() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let debug = SimDebug::new(state.clone());
        let topo = Topology::new(&debug);
        assert_eq!(topo.active_ports(0).unwrap().len(), 4);
        state.borrow_mut().disable_port(p(0, 1));
        assert_eq!(topo.active_ports(0).unwrap(), BTreeSet::from([0, 2, 3]));
        assert_eq!(topo.active_ports(1).unwrap(), BTreeSet::from([0, 2, 3]));
    }

    #[test]
    fn test_active_ports_by_socket_respects_filter() {
        let state = SimState::four_socket_mesh(PlatformFamily::SPR);
        let debug = SimDebug::new(state);
        let topo = Topology::new(&debug);
        let all = topo.active_ports_by_socket(None).unwrap();
        assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        let some = topo.active_ports_by_socket(Some(&[1, 3])).unwrap();
        assert_eq!(some.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_connection_map_is_symmetric() {
        let map = ConnectionMap::from_link_strings(&["S0P1-S1P0", "S0P2-S1P2"]).unwrap();
        assert_eq!(map.len(), 4);
        assert_eq!(map.expected_peer(p(1, 0)), Some(p(0, 1)));
        assert_eq!(map.expected_peer(p(0, 0)), None);
        assert!(ConnectionMap::from_link_strings(&["S0P1"]).is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_peer_symmetry(sockets in 2u32..=8, seed in 0u64..1000) {
            let state = SimState::random_mesh(PlatformFamily::SPR, sockets, seed);
            let debug = SimDebug::new(state);
            let topo = Topology::new(&debug);
            for (local, peer) in topo.links(None).unwrap() {
                proptest::prop_assert_eq!(topo.peer_of(peer.socket, peer.port).unwrap(), local);
            }
        }
    }
}

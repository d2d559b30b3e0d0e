// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Inter-socket bandwidth expectation and MLC matrix comparison.
//!
//! The expected bandwidth between two directly connected sockets is the sum
//! over their links of:
//!
//! ```text
//! lanes * bytes_per_bit * link_speed_GTps * efficiency * threshold
//! ```
//!
//! With the defaults (24 lanes, 1/8 byte per bit, 0.67 protocol efficiency,
//! 0.85 threshold) that is about 1.7 GB/s per GT/s per link. Socket pairs are
//! always keyed `(low, high)` so they index the MLC matrix directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpiError};
use crate::retry::with_reconnect;
use crate::topology::PortId;
use crate::verify::LinkVerifier;

/// Constants of the per-link bandwidth formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthModel {
    pub lanes_per_port: u32,
    pub bytes_per_bit: f64,
    pub efficiency: f64,
    pub threshold: f64,
}

impl Default for BandwidthModel {
    fn default() -> Self {
        Self {
            lanes_per_port: 24,
            bytes_per_bit: 0.125,
            efficiency: 0.67,
            threshold: 0.85,
        }
    }
}

impl BandwidthModel {
    /// GB/s contributed by one link per GT/s.
    pub fn coefficient(&self) -> f64 {
        self.lanes_per_port as f64 * self.bytes_per_bit * self.efficiency * self.threshold
    }

    /// GB/s one link at `speed_gts` is expected to carry.
    pub fn port_contribution(&self, speed_gts: f64) -> f64 {
        self.coefficient() * speed_gts
    }

    /// Sum per-link contributions from `(local, peer, speed_gts)` triples.
    ///
    /// Each link is counted from its lower-socket end only, so passing both
    /// directions of a link does not double it.
    pub fn expected_from_links<I>(&self, links: I) -> BandwidthExpectation
    where
        I: IntoIterator<Item = (PortId, PortId, f64)>,
    {
        let mut expectation = BandwidthExpectation::default();
        for (local, peer, speed_gts) in links {
            if peer.socket > local.socket {
                expectation.add(local.socket, peer.socket, self.port_contribution(speed_gts));
            }
        }
        expectation
    }

    /// Expected bandwidth from the link speeds the platform reports right now.
    pub fn expected_bandwidth(&self, verifier: &LinkVerifier<'_>) -> Result<BandwidthExpectation> {
        let mut links = Vec::new();
        for (local, peer) in verifier.topology().links(verifier.socket_filter())? {
            if peer.socket <= local.socket {
                continue;
            }
            let speed = with_reconnect(verifier.debug(), "link speed read", || {
                verifier.link_speed_gts(local.socket, local.port)
            })?;
            log::debug!("{} <-> {} at {} GT/s", local, peer, speed);
            links.push((local, peer, speed));
        }
        let expectation = self.expected_from_links(links);
        for (a, b, gbps) in expectation.iter() {
            log::info!(
                "The bandwidth between sockets ({}, {}) is expected to be {:.2} GB/s",
                a,
                b,
                gbps
            );
        }
        Ok(expectation)
    }
}

/// Expected GB/s per socket pair, keyed `(low, high)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandwidthExpectation(BTreeMap<(u32, u32), f64>);

impl BandwidthExpectation {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(a: u32, b: u32) -> (u32, u32) {
        (a.min(b), a.max(b))
    }

    /// Set the expectation for a pair, in either order.
    pub fn insert(&mut self, a: u32, b: u32, gbps: f64) {
        self.0.insert(Self::key(a, b), gbps);
    }

    fn add(&mut self, a: u32, b: u32, gbps: f64) {
        *self.0.entry(Self::key(a, b)).or_insert(0.0) += gbps;
    }

    pub fn get(&self, a: u32, b: u32) -> Option<f64> {
        self.0.get(&Self::key(a, b)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, f64)> + '_ {
        self.0.iter().map(|(&(a, b), &gbps)| (a, b, gbps))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Flat form for JSON output.
    pub fn pairs(&self) -> Vec<PairBandwidth> {
        self.iter()
            .map(|(low, high, gbps)| PairBandwidth { low, high, gbps })
            .collect()
    }
}

/// One socket pair's bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairBandwidth {
    pub low: u32,
    pub high: u32,
    pub gbps: f64,
}

/// Measured node-to-node bandwidth in GB/s; `None` marks a missing point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandwidthMatrix {
    rows: Vec<Vec<Option<f64>>>,
}

impl BandwidthMatrix {
    pub fn from_rows(rows: Vec<Vec<Option<f64>>>) -> Self {
        Self { rows }
    }

    /// Parse the `Numa node` table of `mlc --bandwidth_matrix` (MB/s).
    pub fn parse_mlc(output: &str) -> Result<Self> {
        let mut lines = output.lines();
        let mut columns = None;
        for line in lines.by_ref() {
            if let Some(rest) = line.trim().strip_prefix("Numa node") {
                let header: Vec<&str> = rest.split_whitespace().collect();
                if !header.is_empty() && header.iter().all(|h| h.parse::<u32>().is_ok()) {
                    columns = Some(header.len());
                    break;
                }
            }
        }
        let columns = columns.ok_or_else(|| {
            UpiError::Parse("no 'Numa node' header in mlc bandwidth matrix output".into())
        })?;

        let mut rows = Vec::new();
        for line in lines {
            let mut fields = line.split_whitespace();
            let Some(node) = fields.next() else {
                if rows.is_empty() {
                    continue;
                }
                break;
            };
            if node.parse::<u32>().is_err() {
                break;
            }
            let cells = fields
                .map(|cell| match cell {
                    "-" => Ok(None),
                    value => value
                        .parse::<f64>()
                        .map(|mbps| Some(mbps / 1000.0))
                        .map_err(|_| UpiError::Parse(format!("bandwidth cell '{}'", value))),
                })
                .collect::<Result<Vec<_>>>()?;
            if cells.len() != columns {
                log::warn!(
                    "mlc row {} has {} cells, header has {}",
                    node,
                    cells.len(),
                    columns
                );
            }
            rows.push(cells);
        }
        Ok(Self { rows })
    }

    /// Measured GB/s from node `row` to node `col`.
    pub fn get(&self, row: u32, col: u32) -> Option<f64> {
        self.rows
            .get(row as usize)
            .and_then(|r| r.get(col as usize))
            .copied()
            .flatten()
    }

    pub fn nodes(&self) -> usize {
        self.rows.len()
    }
}

/// Every expected pair must measure at or above its expectation.
///
/// A pair the matrix has no data point for is a parse error, not a pass.
pub fn check_bandwidth(expected: &BandwidthExpectation, measured: &BandwidthMatrix) -> Result<bool> {
    let mut ok = true;
    for (a, b, want) in expected.iter() {
        let got = measured.get(a, b).ok_or_else(|| {
            UpiError::Parse(format!(
                "bandwidth matrix has no data point for sockets ({}, {})",
                a, b
            ))
        })?;
        if got < want {
            log::info!(
                "The actual bandwidth between {} and {} is {:.2} GB/s, but expected {:.2} GB/s",
                a,
                b,
                got,
                want
            );
            ok = false;
        }
    }
    if ok {
        log::info!("Verification succeeded, all bandwidths meet expectation.");
    } else {
        log::info!("Bandwidth failed to meet expectation, details listed above.");
    }
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformFamily;
    use crate::sim::{SimDebug, SimState};

    const MLC_OUTPUT: &str = "Intel(R) Memory Latency Checker - v3.9a
Command line parameters: --bandwidth_matrix

Using buffer size of 100.000MiB/thread for reads and an additional 100.000MiB/thread for writes
Measuring Memory Bandwidths between nodes within system
Bandwidths are in MB/sec (1 MB/sec = 1,000,000 Bytes/sec)
Using all the threads from each core if Hyper-threading is enabled
Using Read-only traffic type
\t\tNuma node
Numa node\t     0\t     1
       0\t117343.4\t 51523.1
       1\t 51234.9\t       -
";

    fn p(socket: u32, port: u32) -> PortId {
        PortId::new(socket, port)
    }

    #[test]
    fn test_coefficient() {
        let model = BandwidthModel::default();
        assert!((model.coefficient() - 1.70850).abs() < 1e-9);
        assert!((model.port_contribution(16.0) - 27.336).abs() < 1e-9);
    }

    #[test]
    fn test_expected_from_links_counts_each_link_once() {
        let model = BandwidthModel::default();
        let links = vec![
            (p(0, 0), p(1, 0), 10.0),
            (p(1, 0), p(0, 0), 10.0),
            (p(0, 1), p(1, 1), 10.0),
            (p(1, 1), p(0, 1), 10.0),
        ];
        let expectation = model.expected_from_links(links);
        assert_eq!(expectation.len(), 1);
        let want = 2.0 * model.port_contribution(10.0);
        assert!((expectation.get(0, 1).unwrap() - want).abs() < 1e-9);
        assert_eq!(expectation.get(1, 0), expectation.get(0, 1));
    }

    #[test]
    fn test_expected_bandwidth_reads_current_speed() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        let debug = SimDebug::new(state.clone());
        let verifier = LinkVerifier::new(&debug).unwrap();
        let model = BandwidthModel::default();

        let full = model.expected_bandwidth(&verifier).unwrap();
        assert!((full.get(0, 1).unwrap() - 4.0 * model.port_contribution(16.0)).abs() < 1e-9);

        state.borrow_mut().set_link_speed(p(0, 0), 0x1);
        let slower = model.expected_bandwidth(&verifier).unwrap();
        let want = 3.0 * model.port_contribution(16.0) + model.port_contribution(12.8);
        assert!((slower.get(0, 1).unwrap() - want).abs() < 1e-9);
    }

    #[test]
    fn test_expected_bandwidth_reconnects_on_speed_read() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let debug = SimDebug::new(state.clone());
        let verifier = LinkVerifier::new(&debug).unwrap();
        state.borrow_mut().drop_connection_for(1);
        let expectation = BandwidthModel::default().expected_bandwidth(&verifier).unwrap();
        assert_eq!(expectation.len(), 1);
        assert_eq!(state.borrow().reconfigure_count(), 1);
    }

    #[test]
    fn test_parse_mlc_matrix() {
        let matrix = BandwidthMatrix::parse_mlc(MLC_OUTPUT).unwrap();
        assert_eq!(matrix.nodes(), 2);
        assert!((matrix.get(0, 1).unwrap() - 51.5231).abs() < 1e-9);
        assert!((matrix.get(1, 0).unwrap() - 51.2349).abs() < 1e-9);
        assert_eq!(matrix.get(1, 1), None);
        assert_eq!(matrix.get(2, 0), None);
    }

    #[test]
    fn test_parse_mlc_without_header_fails() {
        assert!(matches!(
            BandwidthMatrix::parse_mlc("mlc: command not found"),
            Err(UpiError::Parse(_))
        ));
    }

    #[test]
    fn test_check_bandwidth_threshold() {
        let mut expected = BandwidthExpectation::new();
        expected.insert(0, 1, 10.0);
        let at = |gbps| BandwidthMatrix::from_rows(vec![vec![None, Some(gbps)], vec![Some(gbps), None]]);
        assert!(!check_bandwidth(&expected, &at(9.9)).unwrap());
        assert!(check_bandwidth(&expected, &at(10.0)).unwrap());
        assert!(check_bandwidth(&expected, &at(10.1)).unwrap());
    }

    #[test]
    fn test_check_bandwidth_missing_point_is_error() {
        let mut expected = BandwidthExpectation::new();
        expected.insert(1, 0, 10.0);
        let matrix = BandwidthMatrix::from_rows(vec![vec![Some(50.0)]]);
        assert!(matches!(check_bandwidth(&expected, &matrix), Err(UpiError::Parse(_))));
    }

    #[test]
    fn test_sim_matrix_round_trip() {
        let state = SimState::two_socket(PlatformFamily::EMR);
        state.borrow_mut().set_bandwidth_gbps(1, 0, 42.5);
        let mut shell = crate::sim::SimShell::new(state);
        let out = crate::sut::OsShell::execute(
            &mut shell,
            "/root/tools/mlc/mlc --bandwidth_matrix",
            std::time::Duration::from_secs(60),
            None,
        )
        .unwrap();
        let matrix = BandwidthMatrix::parse_mlc(&out.stdout).unwrap();
        assert!((matrix.get(0, 1).unwrap() - 42.5).abs() < 1e-9);
        assert!((matrix.get(0, 0).unwrap() - 150.0).abs() < 1e-9);
    }

    proptest::proptest! {
        #[test]
        fn prop_keys_are_normalized(
            raw in proptest::collection::vec((0u32..8, 0u32..6, 0u32..8, 0u32..6, 2.5f64..32.0), 0..24)
        ) {
            let links = raw.into_iter().map(|(s, p, ps, pp, gts)| (PortId::new(s, p), PortId::new(ps, pp), gts));
            let expectation = BandwidthModel::default().expected_from_links(links);
            for (a, b, _) in expectation.iter() {
                proptest::prop_assert!(a < b);
            }
        }

        #[test]
        fn prop_check_is_one_sided(want in 0.1f64..500.0, delta in 0.0f64..500.0) {
            let mut expected = BandwidthExpectation::new();
            expected.insert(0, 1, want);
            let over = BandwidthMatrix::from_rows(vec![vec![None, Some(want + delta)]]);
            proptest::prop_assert!(check_bandwidth(&expected, &over).unwrap());
            if delta > 0.0 {
                let under = BandwidthMatrix::from_rows(vec![vec![None, Some(want - delta)]]);
                proptest::prop_assert!(!check_bandwidth(&expected, &under).unwrap());
            }
        }
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Best-effort register snapshots around a test case
//!
//! Appends lane, rx, tx and link-speed readings for every active port to a
//! CSV file before and after a test. Nothing here can fail a test: every
//! error is logged at warn and dropped.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::platform::registers::RegisterKind;
use crate::sut::SiliconDebug;
use crate::verify::LinkVerifier;

/// CSV column header.
pub const CSV_HEADER: &str = "timestamp,test,phase,socket,port,register,path,value";

const SNAPSHOT_REGISTERS: [RegisterKind; 4] = [
    RegisterKind::LaneStatus,
    RegisterKind::RxState,
    RegisterKind::TxState,
    RegisterKind::LinkSpeed,
];

/// When a snapshot was taken relative to the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPhase {
    Pre,
    Post,
}

impl SnapshotPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }
}

/// One register reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub socket: u32,
    pub port: u32,
    pub register: RegisterKind,
    pub path: String,
    pub value: u64,
}

/// CSV telemetry writer.
#[derive(Debug, Clone)]
pub struct TelemetrySidecar {
    pub csv_path: PathBuf,
    pub enabled: bool,
}

impl TelemetrySidecar {
    pub fn new(csv_path: impl Into<PathBuf>) -> Self {
        Self {
            csv_path: csv_path.into(),
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            csv_path: PathBuf::new(),
            enabled: false,
        }
    }

    /// Snapshot every active port and append it. Never fails.
    pub fn collect(&self, debug: &dyn SiliconDebug, test: &str, phase: SnapshotPhase) {
        if !self.enabled {
            return;
        }
        let result = snapshot(debug).and_then(|rows| self.append(test, phase, &rows).map(|_| rows.len()));
        match result {
            Ok(count) => log::debug!(
                "Telemetry {} snapshot for {}: {} rows -> {}",
                phase.as_str(),
                test,
                count,
                self.csv_path.display()
            ),
            Err(err) => log::warn!("Telemetry {} snapshot for {} skipped: {}", phase.as_str(), test, err),
        }
    }

    fn append(&self, test: &str, phase: SnapshotPhase, rows: &[SnapshotRow]) -> Result<()> {
        if let Some(parent) = self.csv_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let new_file = !self.csv_path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.csv_path)?;
        if new_file {
            writeln!(file, "{}", CSV_HEADER)?;
        }
        let timestamp = chrono::Utc::now().to_rfc3339();
        for row in rows {
            writeln!(
                file,
                "{},{},{},{},{},{},{},{:#x}",
                timestamp,
                test,
                phase.as_str(),
                row.socket,
                row.port,
                row.register.as_str(),
                row.path,
                row.value
            )?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.csv_path
    }
}

/// Read the snapshot registers on every active port.
pub fn snapshot(debug: &dyn SiliconDebug) -> Result<Vec<SnapshotRow>> {
    let verifier = LinkVerifier::new(debug)?;
    let mut rows = Vec::new();
    for (socket, ports) in verifier.topology().active_ports_by_socket(None)? {
        for port in ports {
            for register in SNAPSHOT_REGISTERS {
                let path = verifier.port_path(register, port)?;
                let value = debug.get_by_path(socket, &path)?;
                rows.push(SnapshotRow {
                    socket,
                    port,
                    register,
                    path,
                    value,
                });
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformFamily;
    use crate::sim::{SimDebug, SimState};

    #[test]
    fn test_snapshot_covers_every_active_port() {
        let state = SimState::two_socket(PlatformFamily::ICX);
        let debug = SimDebug::new(state);
        let rows = snapshot(&debug).unwrap();
        // two sockets, four ports, four registers
        assert_eq!(rows.len(), 32);
        let lane = rows
            .iter()
            .find(|r| r.socket == 1 && r.port == 2 && r.register == RegisterKind::LaneStatus)
            .unwrap();
        assert_eq!(lane.value, 0x7);
    }

    #[test]
    fn test_collect_appends_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("upi.csv");
        let state = SimState::two_socket(PlatformFamily::SPR);
        let debug = SimDebug::new(state);
        let sidecar = TelemetrySidecar::new(&path);

        sidecar.collect(&debug, "stress", SnapshotPhase::Pre);
        sidecar.collect(&debug, "stress", SnapshotPhase::Post);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.iter().filter(|l| **l == CSV_HEADER).count(), 1);
        assert_eq!(lines.len(), 1 + 2 * 32);
        assert!(lines[1].contains(",stress,pre,0,0,lane_status,"));
        assert!(lines.last().unwrap().contains(",stress,post,"));
    }

    #[test]
    fn test_failures_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upi.csv");
        let state = SimState::two_socket(PlatformFamily::SPR);
        state.borrow_mut().drop_connection_for(1);
        let debug = SimDebug::new(state);
        let sidecar = TelemetrySidecar::new(&path);

        sidecar.collect(&debug, "idle", SnapshotPhase::Pre);
        assert!(!path.exists());

        // A directory where the file should be makes the append fail.
        let blocked = dir.path().join("blocked");
        fs::create_dir(&blocked).unwrap();
        TelemetrySidecar::new(&blocked).collect(&debug, "idle", SnapshotPhase::Pre);
    }

    #[test]
    fn test_disabled_writes_nothing() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        let debug = SimDebug::new(state);
        let sidecar = TelemetrySidecar {
            enabled: false,
            ..TelemetrySidecar::new("unused.csv")
        };
        sidecar.collect(&debug, "idle", SnapshotPhase::Pre);
        assert!(!Path::new("unused.csv").exists());
        assert!(!TelemetrySidecar::disabled().enabled);
    }
}

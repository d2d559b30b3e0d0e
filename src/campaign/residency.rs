// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Package C6 residency sampled with PTU's monitor mode.

use std::time::Duration;

use crate::error::{Result, UpiError};
use crate::sut::Sut;

use super::workload::ensure_installed;

/// Residency a package must exceed to count as sitting in C6, in percent.
pub const C6_RESIDENCY_THRESHOLD: f64 = 90.0;
/// How long PTU samples before writing its log.
pub const PTU_MONITOR_SECS: u64 = 15;

const PTU_TOOL: &str = "ptu";
const PTU_FILTER: u32 = 0x08;
const PTU_LOG_DIR: &str = "/root/log/";
const PTU_CSV: &str = "/root/log/*ptumon.csv";

/// Highest C6 percentage over the `CPU0` rows of a PTU monitor CSV.
///
/// The sixth column of each `CPU0` row carries the C6 residency.
pub fn parse_ptu_c6(csv: &str) -> Result<f64> {
    csv.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                ["CPU0", rest @ ..] => rest.get(4).and_then(|v| v.parse::<f64>().ok()),
                _ => None,
            }
        })
        .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v))))
        .ok_or_else(|| UpiError::Parse("no CPU0 C6 samples in PTU monitor log".into()))
}

/// Sample package C6 residency. `Ok(None)` when PTU wrote no log.
pub fn measure_c6_residency(sut: &mut Sut, timeout: Duration) -> Result<Option<f64>> {
    let dir = ensure_installed(sut, PTU_TOOL)?;
    sut.os.execute(&format!("rm -rf {}", PTU_LOG_DIR), timeout, None)?;
    let cmd = format!(
        "./ptu -y -mon -filter {:#04x} -log -logdir {} -csv -t {}",
        PTU_FILTER, PTU_LOG_DIR, PTU_MONITOR_SECS
    );
    sut.os
        .execute(&cmd, timeout + Duration::from_secs(PTU_MONITOR_SECS), Some(&dir))?;
    if !sut.os.path_exists(PTU_CSV)? {
        log::error!("PTU did not capture package C6 residency");
        return Ok(None);
    }
    let csv = sut.os.execute(&format!("cat {}", PTU_CSV), timeout, None)?;
    let residency = parse_ptu_c6(&csv.stdout)?;
    log::info!("Package C6 residency {:.1}%", residency);
    Ok(Some(residency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformFamily;
    use crate::sim::{simulated_sut, SimState};

    #[test]
    fn test_parse_ptu_c6_takes_highest_cpu0_sample() {
        let csv = "Device,Time,Freq,Util,C0,C6,Temp\n\
                   CPU0,12:00:00,800,0.8,8.0,91.5,38\n\
                   CPU1,12:00:00,800,0.8,1.0,99.0,38\n\
                   CPU0,12:00:05,800,0.8,4.0,95.25,38\n";
        assert_eq!(parse_ptu_c6(csv).unwrap(), 95.25);
        assert!(parse_ptu_c6("Device,Time\nCPU1,1,2,3,4,5\n").is_err());
        assert!(parse_ptu_c6("CPU0,12:00:00,800\n").is_err());
    }

    #[test]
    fn test_measure_installs_ptu_once() {
        let state = SimState::two_socket(PlatformFamily::SPR);
        state.borrow_mut().set_c6_residency(93.0);
        let mut sut = simulated_sut(&state);
        let t = Duration::from_secs(60);
        assert_eq!(measure_c6_residency(&mut sut, t).unwrap(), Some(93.0));
        assert_eq!(measure_c6_residency(&mut sut, t).unwrap(), Some(93.0));
        let s = state.borrow();
        assert_eq!(s.install_count(), 1);
        assert_eq!(s.now(), Duration::from_secs(2 * PTU_MONITOR_SECS));
        assert!(s
            .commands()
            .iter()
            .any(|c| c == "./ptu -y -mon -filter 0x08 -log -logdir /root/log/ -csv -t 15"));
    }
}

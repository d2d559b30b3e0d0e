// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! STREAM benchmark sizing, targets and report parsing.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{Result, UpiError};
use crate::platform::PlatformFamily;

/// Collateral holding `run_stream.sh`.
pub const STREAM_TOOL: &str = "stream";
/// Report file the background run writes, relative to the install directory.
pub const STREAM_OUTPUT: &str = "stream_output.txt";
/// First line of a benchmark that actually started.
pub const STREAM_BANNER: &str = "Running Stream benchmark";
/// Slack past the requested duration before a still-running benchmark is cut off.
pub const STREAM_BUFFER_SECS: u64 = 1800;
/// Upper bound for the calibration run.
pub const STREAM_CALIBRATION_TIMEOUT_SECS: u64 = 3600;
/// Share of theoretical DRAM bandwidth the best Triad rate must reach.
pub const STREAM_TARGET_FRACTION: f64 = 0.67;
/// Lists the speed of every populated DIMM.
pub const DIMM_SPEED_CMD: &str = "dmidecode --type 17 | grep -i speed";

/// Iterations of the calibration run, fewer on larger systems.
pub fn calibration_iterations(sockets: usize) -> u64 {
    match sockets {
        4 => 100,
        8 => 50,
        _ => 500,
    }
}

/// Iterations that fill `duration`, given `calibration` iterations took `elapsed`.
pub fn scaled_iterations(duration: Duration, calibration: u64, elapsed: Duration) -> Result<u64> {
    if elapsed.is_zero() {
        return Err(UpiError::CommandFailed(
            "stream calibration run finished in no measurable time".into(),
        ));
    }
    Ok((duration.as_secs_f64() * calibration as f64 / elapsed.as_secs_f64()) as u64)
}

/// Triad target in MB/s: eight channels of 8-byte transfers at `dimm_mts`, derated.
pub fn stream_target_mbps(family: PlatformFamily, dimm_mts: u32) -> Result<f64> {
    match family {
        PlatformFamily::SPR => Ok(8.0 * f64::from(dimm_mts) * 8.0 * STREAM_TARGET_FRACTION),
        other => Err(UpiError::UnsupportedPlatform(format!(
            "no stream bandwidth target for {}",
            other
        ))),
    }
}

/// Distinct speeds in `dmidecode --type 17` output, in MT/s.
pub fn parse_dimm_speeds(output: &str) -> BTreeSet<u32> {
    output
        .lines()
        .filter_map(|line| {
            let (_, rest) = line.split_once("Speed:")?;
            rest.split_whitespace().next()?.parse().ok()
        })
        .collect()
}

/// Best Triad rate of a STREAM report, in MB/s.
pub fn parse_triad_mbps(report: &str) -> Result<f64> {
    report
        .lines()
        .find_map(|line| {
            let rest = line.trim_start().strip_prefix("Triad:")?;
            rest.split_whitespace().next()?.parse().ok()
        })
        .ok_or_else(|| UpiError::Parse("no Triad rate in stream output".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_iterations() {
        assert_eq!(calibration_iterations(2), 500);
        assert_eq!(calibration_iterations(4), 100);
        assert_eq!(calibration_iterations(8), 50);
    }

    #[test]
    fn test_scaled_iterations() {
        let two_hours = Duration::from_secs(7200);
        assert_eq!(scaled_iterations(two_hours, 500, Duration::from_secs(600)).unwrap(), 6000);
        assert!(scaled_iterations(two_hours, 500, Duration::ZERO).is_err());
    }

    #[test]
    fn test_stream_target() {
        let target = stream_target_mbps(PlatformFamily::SPR, 4800).unwrap();
        assert!((target - 205_824.0).abs() < 1e-6);
        assert!(stream_target_mbps(PlatformFamily::ICX, 3200).unwrap_err().is_setup());
    }

    #[test]
    fn test_parse_dimm_speeds() {
        let output = "\tSpeed: 4800 MT/s\n\tConfigured Memory Speed: 4800 MT/s\n\
                      \tSpeed: Unknown\n\tSpeed: 4400 MT/s\n";
        let speeds: Vec<u32> = parse_dimm_speeds(output).into_iter().collect();
        assert_eq!(speeds, vec![4400, 4800]);
        assert!(parse_dimm_speeds("").is_empty());
    }

    #[test]
    fn test_parse_triad() {
        let report = "Running Stream benchmark\n\
                      Function    Best Rate MB/s  Avg time\n\
                      Copy:           180000.5     0.0421\n\
                      Triad:          215000.0     0.0615\n";
        assert_eq!(parse_triad_mbps(report).unwrap(), 215_000.0);
        assert!(parse_triad_mbps("Running Stream benchmark\n").is_err());
    }
}

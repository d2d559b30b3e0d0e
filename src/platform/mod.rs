// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Platform families and their UPI constant sets.
//!
//! Each supported Xeon generation exposes the UPI link registers under a
//! different path layout and encodes link speed with a different code table.
//! [`PlatformFamily`] is the closed tag that selects both. It is determined
//! once from the live silicon-debug connection and stays fixed for a run.
//!
//! ## Families
//!
//! - **ICX**: Ice Lake-SP, up to 4 sockets, 11.2 GT/s max
//! - **SPR**: Sapphire Rapids, up to 8 sockets, 16 GT/s max
//! - **EMR**: Emerald Rapids, up to 8 sockets, 20 GT/s max
//! - **GNR**: Granite Rapids, up to 8 sockets, split compute/IO dies

pub mod registers;

pub use registers::{ErrorRegister, RegisterKind, RegisterMap};

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpiError};
use crate::topology::PortId;

/// CPU generation selecting register layout and speed encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlatformFamily {
    /// Ice Lake-SP.
    ICX,
    /// Sapphire Rapids.
    SPR,
    /// Emerald Rapids.
    EMR,
    /// Granite Rapids (IO-die split).
    GNR,
}

impl std::fmt::Display for PlatformFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ICX => write!(f, "ICX"),
            Self::SPR => write!(f, "SPR"),
            Self::EMR => write!(f, "EMR"),
            Self::GNR => write!(f, "GNR"),
        }
    }
}

impl std::str::FromStr for PlatformFamily {
    type Err = UpiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ICX" | "ICELAKEX" | "ICE LAKE" => Ok(Self::ICX),
            "SPR" | "SAPPHIRERAPIDS" | "SAPPHIRE RAPIDS" => Ok(Self::SPR),
            "EMR" | "EMERALDRAPIDS" | "EMERALD RAPIDS" => Ok(Self::EMR),
            "GNR" | "GRANITERAPIDS" | "GRANITE RAPIDS" => Ok(Self::GNR),
            other => Err(UpiError::UnsupportedPlatform(other.to_string())),
        }
    }
}

/// Link speed code -> GT/s, per family.
const ICX_LINK_RATES: &[(u64, f64)] = &[(3, 4.8), (4, 9.6), (5, 10.4), (6, 11.2)];
const SPR_LINK_RATES: &[(u64, f64)] = &[(0, 2.5), (1, 12.8), (2, 14.4), (3, 16.0)];
const EMR_LINK_RATES: &[(u64, f64)] = &[(1, 2.5), (2, 12.8), (3, 14.4), (4, 16.0), (9, 20.0)];
const GNR_LINK_RATES: &[(u64, f64)] = &[
    (0, 2.5),
    (1, 12.8),
    (2, 14.4),
    (3, 16.0),
    (4, 32.0),
    (8, 20.0),
    (9, 24.0),
];

/// Mixed-speed BIOS presets, indexed by port. Identical on every socket.
const ICX_SPEED_PRESET: &[u64] = &[0x6, 0x5, 0x4, 0x6];
const SPR_SPEED_PRESET: &[u64] = &[0x3, 0x2, 0x1, 0x3];
const EMR_SPEED_PRESET: &[u64] = &[0x4, 0x3, 0x2, 0x9];
const GNR_SPEED_PRESET: &[u64] = &[0x9, 0x8, 0x3, 0x9, 0x8, 0x3];

impl PlatformFamily {
    /// Every supported family.
    pub const ALL: [PlatformFamily; 4] = [Self::ICX, Self::SPR, Self::EMR, Self::GNR];

    /// Whether UPI registers are addressed through an IO-die index.
    pub fn has_io_die(&self) -> bool {
        matches!(self, Self::GNR)
    }

    /// Link speed register code for the fastest supported rate.
    pub fn max_speed_code(&self) -> u64 {
        match self {
            Self::ICX => 0x6,
            Self::SPR => 0x3,
            Self::EMR => 0x9,
            Self::GNR => 0x9,
        }
    }

    /// Link speed register code for the slowest operational rate.
    pub fn min_speed_code(&self) -> u64 {
        match self {
            Self::ICX => 0x4,
            Self::SPR => 0x1,
            Self::EMR => 0x2,
            Self::GNR => 0x3,
        }
    }

    /// Maximum socket count the speed presets are defined for.
    pub fn max_sockets(&self) -> u32 {
        match self {
            Self::ICX => 4,
            Self::SPR | Self::EMR | Self::GNR => 8,
        }
    }

    /// UPI ports per socket.
    pub fn ports_per_socket(&self) -> u32 {
        self.speed_preset_table().len() as u32
    }

    fn link_rate_table(&self) -> &'static [(u64, f64)] {
        match self {
            Self::ICX => ICX_LINK_RATES,
            Self::SPR => SPR_LINK_RATES,
            Self::EMR => EMR_LINK_RATES,
            Self::GNR => GNR_LINK_RATES,
        }
    }

    fn speed_preset_table(&self) -> &'static [u64] {
        match self {
            Self::ICX => ICX_SPEED_PRESET,
            Self::SPR => SPR_SPEED_PRESET,
            Self::EMR => EMR_SPEED_PRESET,
            Self::GNR => GNR_SPEED_PRESET,
        }
    }

    /// Translate a link speed register code to GT/s.
    pub fn link_rate_gts(&self, code: u64) -> Option<f64> {
        self.link_rate_table()
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, rate)| *rate)
    }

    /// Same as [`link_rate_gts`](Self::link_rate_gts), failing on unknown codes.
    pub fn require_link_rate_gts(&self, code: u64) -> Result<f64> {
        self.link_rate_gts(code).ok_or_else(|| {
            UpiError::Configuration(format!(
                "link speed code {:#x} has no rate defined on {}",
                code, self
            ))
        })
    }

    /// Speed code the mixed-speed BIOS preset programs on a port.
    pub fn preset_speed_code(&self, port: PortId) -> Option<u64> {
        if port.socket >= self.max_sockets() {
            return None;
        }
        self.speed_preset_table().get(port.port as usize).copied()
    }

    /// Infer the family from a CPU brand string.
    pub fn from_cpu_model(cpu_model: &str) -> Option<Self> {
        let name = cpu_model.to_uppercase();
        if name.contains("GRANITE") || name.contains("XEON 6") {
            Some(Self::GNR)
        } else if name.contains("EMERALD") {
            Some(Self::EMR)
        } else if name.contains("SAPPHIRE") {
            Some(Self::SPR)
        } else if name.contains("ICE LAKE") {
            Some(Self::ICX)
        } else {
            None
        }
    }

    /// Detect the family of the local host from its CPU brand string.
    pub fn detect_local() -> Result<Self> {
        let model = get_cpu_model()?;
        Self::from_cpu_model(&model).ok_or(UpiError::UnsupportedPlatform(model))
    }
}

#[cfg(target_os = "linux")]
pub fn get_cpu_model() -> Result<String> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo")?;
    for line in cpuinfo.lines() {
        if let Some(val) = line.strip_prefix("model name") {
            if let Some(name) = val.trim().strip_prefix(':') {
                return Ok(name.trim().to_string());
            }
        }
    }
    Ok(String::new())
}

#[cfg(target_os = "windows")]
pub fn get_cpu_model() -> Result<String> {
    let output = std::process::Command::new("powershell")
        .args([
            "-NoProfile",
            "-Command",
            "(Get-CimInstance Win32_Processor).Name",
        ])
        .output()?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub fn get_cpu_model() -> Result<String> {
    Ok(String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_str() {
        assert_eq!("icx".parse::<PlatformFamily>().unwrap(), PlatformFamily::ICX);
        assert_eq!("SapphireRapids".parse::<PlatformFamily>().unwrap(), PlatformFamily::SPR);
        assert_eq!(" gnr ".parse::<PlatformFamily>().unwrap(), PlatformFamily::GNR);
        assert!(matches!(
            "skx".parse::<PlatformFamily>(),
            Err(UpiError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_only_gnr_has_io_die() {
        let with_die: Vec<_> = PlatformFamily::ALL.iter().filter(|f| f.has_io_die()).collect();
        assert_eq!(with_die, vec![&PlatformFamily::GNR]);
    }

    #[test]
    fn test_max_and_min_codes_have_rates() {
        for family in PlatformFamily::ALL {
            assert!(family.link_rate_gts(family.max_speed_code()).is_some(), "{}", family);
            assert!(family.link_rate_gts(family.min_speed_code()).is_some(), "{}", family);
            assert!(
                family.link_rate_gts(family.max_speed_code()).unwrap()
                    > family.link_rate_gts(family.min_speed_code()).unwrap()
            );
        }
    }

    #[test]
    fn test_link_rates() {
        assert_eq!(PlatformFamily::ICX.link_rate_gts(6), Some(11.2));
        assert_eq!(PlatformFamily::SPR.link_rate_gts(3), Some(16.0));
        assert_eq!(PlatformFamily::EMR.link_rate_gts(9), Some(20.0));
        assert_eq!(PlatformFamily::GNR.link_rate_gts(9), Some(24.0));
        assert_eq!(PlatformFamily::ICX.link_rate_gts(0), None);
        assert!(PlatformFamily::SPR.require_link_rate_gts(7).is_err());
    }

    #[test]
    fn test_speed_presets() {
        let p = |socket, port| PortId::new(socket, port);
        assert_eq!(PlatformFamily::ICX.preset_speed_code(p(3, 2)), Some(0x4));
        assert_eq!(PlatformFamily::ICX.preset_speed_code(p(4, 0)), None);
        assert_eq!(PlatformFamily::EMR.preset_speed_code(p(7, 3)), Some(0x9));
        assert_eq!(PlatformFamily::GNR.preset_speed_code(p(2, 5)), Some(0x3));
        assert_eq!(PlatformFamily::GNR.ports_per_socket(), 6);
        assert_eq!(PlatformFamily::SPR.ports_per_socket(), 4);
    }

    #[test]
    fn test_family_from_cpu_model() {
        assert_eq!(
            PlatformFamily::from_cpu_model("Intel(R) Xeon(R) Platinum 8380 CPU (Ice Lake)"),
            Some(PlatformFamily::ICX)
        );
        assert_eq!(
            PlatformFamily::from_cpu_model("Intel(R) Xeon(R) Platinum 8480+ Sapphire Rapids"),
            Some(PlatformFamily::SPR)
        );
        assert_eq!(
            PlatformFamily::from_cpu_model("INTEL XEON 6 GRANITE RAPIDS"),
            Some(PlatformFamily::GNR)
        );
        assert_eq!(PlatformFamily::from_cpu_model("AMD EPYC 9654"), None);
    }

    #[test]
    fn test_family_display_roundtrip() {
        for family in PlatformFamily::ALL {
            assert_eq!(family.to_string().parse::<PlatformFamily>().unwrap(), family);
        }
    }
}

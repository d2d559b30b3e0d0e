// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! UPI register path templates.
//!
//! Templates carry a `{port}` placeholder and, on families with an IO-die
//! split, an `{io_die}` placeholder. A [`RegisterMap`] is validated when it
//! is built, so an unsupported or malformed table fails at startup instead
//! of on the first register access.

use serde::{Deserialize, Serialize};

use super::PlatformFamily;
use crate::error::{Result, UpiError};

const PORT_PLACEHOLDER: &str = "{port}";
const IO_DIE_PLACEHOLDER: &str = "{io_die}";

/// Logical UPI register selected through a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// Current lane map (`s_clm`).
    LaneStatus,
    /// Receive link state.
    RxState,
    /// Transmit link state.
    TxState,
    /// Link speed setting.
    LinkSpeed,
    /// Parent block that holds the error counters.
    ErrorParent,
}

impl RegisterKind {
    pub const ALL: [RegisterKind; 5] = [
        Self::LaneStatus,
        Self::RxState,
        Self::TxState,
        Self::LinkSpeed,
        Self::ErrorParent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LaneStatus => "lane_status",
            Self::RxState => "rx_state",
            Self::TxState => "tx_state",
            Self::LinkSpeed => "link_speed",
            Self::ErrorParent => "error_parent",
        }
    }
}

impl std::fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RegisterKind {
    type Err = UpiError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| UpiError::Configuration(format!("unknown register kind '{}'", s)))
    }
}

/// Error, viral and CRC counters scanned under the error parent block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorRegister {
    ErrCount0,
    ErrCount1,
    ErrCount2,
    CrcErrCount,
    Viral,
    BiosErrStatus,
}

impl ErrorRegister {
    pub const ALL: [ErrorRegister; 6] = [
        Self::ErrCount0,
        Self::ErrCount1,
        Self::ErrCount2,
        Self::CrcErrCount,
        Self::Viral,
        Self::BiosErrStatus,
    ];

    /// Value every error register reports when clean.
    pub const NO_ERROR: u64 = 0x0;

    /// Remote viral loopback enable, benign on `ktiviral`.
    pub const REMOTE_VIRAL_LPBK_EN: u64 = 0x10;

    /// Register leaf name appended to the error parent path.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ErrCount0 => "ktierrcnt0_cntr",
            Self::ErrCount1 => "ktierrcnt1_cntr",
            Self::ErrCount2 => "ktierrcnt2_cntr",
            Self::CrcErrCount => "kticrcerrcnt",
            Self::Viral => "ktiviral",
            Self::BiosErrStatus => "bios_kti_err_st",
        }
    }

    /// Values accepted as "no error".
    pub fn accepted_values(&self) -> Vec<u64> {
        match self {
            Self::Viral => vec![Self::NO_ERROR, Self::REMOTE_VIRAL_LPBK_EN],
            _ => vec![Self::NO_ERROR],
        }
    }
}

/// One family's set of templates.
#[derive(Debug)]
struct RegisterTemplates {
    lane_status: &'static str,
    rx_state: &'static str,
    tx_state: &'static str,
    link_speed: &'static str,
    error_parent: &'static str,
}

impl RegisterTemplates {
    fn get(&self, kind: RegisterKind) -> &'static str {
        match kind {
            RegisterKind::LaneStatus => self.lane_status,
            RegisterKind::RxState => self.rx_state,
            RegisterKind::TxState => self.tx_state,
            RegisterKind::LinkSpeed => self.link_speed,
            RegisterKind::ErrorParent => self.error_parent,
        }
    }
}

static ICX_TEMPLATES: RegisterTemplates = RegisterTemplates {
    lane_status: "uncore.upi.upi{port}.ktireut_ph_css.s_clm",
    rx_state: "uncore.upi.upi{port}.ktireut_ph_css.s_rx_state",
    tx_state: "uncore.upi.upi{port}.ktireut_ph_css.s_tx_state",
    link_speed: "uncore.upi.ktimisc{port}.ktimiscstat.kti_rate",
    error_parent: "uncore.upi.upi{port}.",
};

// SPR and EMR share one layout.
static SPR_TEMPLATES: RegisterTemplates = RegisterTemplates {
    lane_status: "uncore.upi.upi{port}.ktireut_ph_css.s_clm",
    rx_state: "uncore.upi.upi{port}.ktireut_ph_css.s_rx_state",
    tx_state: "uncore.upi.upi{port}.ktireut_ph_css.s_tx_state",
    link_speed: "uncore.upi.upi{port}.pipe_clk_rate_ctrl.cri_freq_select",
    error_parent: "uncore.upi.upi{port}.",
};

static GNR_TEMPLATES: RegisterTemplates = RegisterTemplates {
    lane_status: "io{io_die}.uncore.upi.upi{port}.upi_regs.ktireut_ph_css.s_clm",
    rx_state: "io{io_die}.uncore.upi.upi{port}.upi_regs.ktireut_ph_css.s_rx_state",
    tx_state: "io{io_die}.uncore.upi.upi{port}.upi_regs.ktireut_ph_css.s_tx_state",
    link_speed: "io{io_die}.uncore.upi.upi{port}.upi_regs.pipe_clk_rate_ctrl.link_rate",
    error_parent: "io{io_die}.uncore.upi.upi{port}.upi_regs.",
};

fn templates_for(family: PlatformFamily) -> &'static RegisterTemplates {
    match family {
        PlatformFamily::ICX => &ICX_TEMPLATES,
        PlatformFamily::SPR | PlatformFamily::EMR => &SPR_TEMPLATES,
        PlatformFamily::GNR => &GNR_TEMPLATES,
    }
}

/// Validated register map for one platform family.
#[derive(Debug, Clone, Copy)]
pub struct RegisterMap {
    family: PlatformFamily,
    templates: &'static RegisterTemplates,
}

impl RegisterMap {
    /// Build and validate the map for `family`.
    pub fn for_family(family: PlatformFamily) -> Result<Self> {
        let templates = templates_for(family);
        for kind in RegisterKind::ALL {
            let template = templates.get(kind);
            if !template.contains(PORT_PLACEHOLDER) {
                return Err(UpiError::Template(format!(
                    "{} template for {} has no {} placeholder: {}",
                    kind, family, PORT_PLACEHOLDER, template
                )));
            }
            if template.contains(IO_DIE_PLACEHOLDER) != family.has_io_die() {
                return Err(UpiError::Template(format!(
                    "{} template for {} disagrees with the IO-die layout: {}",
                    kind, family, template
                )));
            }
        }
        Ok(Self { family, templates })
    }

    pub fn family(&self) -> PlatformFamily {
        self.family
    }

    /// Raw template string.
    pub fn template(&self, kind: RegisterKind) -> &'static str {
        self.templates.get(kind)
    }

    /// Resolve a template to a concrete path for `port`.
    pub fn resolve(&self, kind: RegisterKind, port: u32, io_die: Option<u32>) -> Result<String> {
        fill(self.family, self.template(kind), port, io_die)
    }

    /// Full path of an error counter on `port`.
    pub fn resolve_error_register(
        &self,
        register: ErrorRegister,
        port: u32,
        io_die: Option<u32>,
    ) -> Result<String> {
        let parent = self.resolve(RegisterKind::ErrorParent, port, io_die)?;
        Ok(format!("{}{}", parent, register.name()))
    }

    /// All-sockets form of a template, every placeholder replaced by `s`.
    pub fn wildcard(&self, kind: RegisterKind) -> String {
        self.template(kind)
            .replace(PORT_PLACEHOLDER, "s")
            .replace(IO_DIE_PLACEHOLDER, "s")
    }
}

fn fill(family: PlatformFamily, template: &str, port: u32, io_die: Option<u32>) -> Result<String> {
    let path = template.replace(PORT_PLACEHOLDER, &port.to_string());
    if !family.has_io_die() {
        if io_die.is_some() {
            log::debug!("{} has no IO-die split, ignoring io_die for port {}", family, port);
        }
        return Ok(path);
    }
    let io_die = io_die.ok_or_else(|| {
        UpiError::Template(format!(
            "{} requires an IO-die index to resolve port {}: {}",
            family, port, template
        ))
    })?;
    Ok(path.replace(IO_DIE_PLACEHOLDER, &io_die.to_string()))
}

/// Resolve `kind` for `port` on `family`.
pub fn resolve(
    kind: RegisterKind,
    family: PlatformFamily,
    port: u32,
    io_die: Option<u32>,
) -> Result<String> {
    RegisterMap::for_family(family)?.resolve(kind, port, io_die)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_family_validates() {
        for family in PlatformFamily::ALL {
            RegisterMap::for_family(family).unwrap();
        }
    }

    #[test]
    fn test_resolve_icx_lane_status() {
        let path = resolve(RegisterKind::LaneStatus, PlatformFamily::ICX, 2, None).unwrap();
        assert_eq!(path, "uncore.upi.upi2.ktireut_ph_css.s_clm");
    }

    #[test]
    fn test_resolve_icx_link_speed_uses_ktimisc() {
        let path = resolve(RegisterKind::LinkSpeed, PlatformFamily::ICX, 1, None).unwrap();
        assert_eq!(path, "uncore.upi.ktimisc1.ktimiscstat.kti_rate");
    }

    #[test]
    fn test_resolve_gnr_requires_io_die() {
        let err = resolve(RegisterKind::RxState, PlatformFamily::GNR, 4, None).unwrap_err();
        assert!(matches!(err, UpiError::Template(_)));

        let path = resolve(RegisterKind::RxState, PlatformFamily::GNR, 4, Some(1)).unwrap();
        assert_eq!(path, "io1.uncore.upi.upi4.upi_regs.ktireut_ph_css.s_rx_state");
    }

    #[test]
    fn test_io_die_ignored_without_split() {
        let with = resolve(RegisterKind::TxState, PlatformFamily::SPR, 0, Some(3)).unwrap();
        let without = resolve(RegisterKind::TxState, PlatformFamily::SPR, 0, None).unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn test_error_register_paths() {
        let map = RegisterMap::for_family(PlatformFamily::EMR).unwrap();
        assert_eq!(
            map.resolve_error_register(ErrorRegister::Viral, 3, None).unwrap(),
            "uncore.upi.upi3.ktiviral"
        );
        let gnr = RegisterMap::for_family(PlatformFamily::GNR).unwrap();
        assert_eq!(
            gnr.resolve_error_register(ErrorRegister::CrcErrCount, 5, Some(1)).unwrap(),
            "io1.uncore.upi.upi5.upi_regs.kticrcerrcnt"
        );
    }

    #[test]
    fn test_viral_accepts_loopback_enable() {
        assert_eq!(ErrorRegister::Viral.accepted_values(), vec![0x0, 0x10]);
        for reg in ErrorRegister::ALL.iter().filter(|r| **r != ErrorRegister::Viral) {
            assert_eq!(reg.accepted_values(), vec![0x0]);
        }
    }

    #[test]
    fn test_wildcard() {
        let gnr = RegisterMap::for_family(PlatformFamily::GNR).unwrap();
        assert_eq!(
            gnr.wildcard(RegisterKind::LaneStatus),
            "ios.uncore.upi.upis.upi_regs.ktireut_ph_css.s_clm"
        );
    }

    #[test]
    fn test_register_kind_from_str() {
        assert_eq!("lane-status".parse::<RegisterKind>().unwrap(), RegisterKind::LaneStatus);
        assert_eq!("RX_STATE".parse::<RegisterKind>().unwrap(), RegisterKind::RxState);
        assert!("bogus".parse::<RegisterKind>().is_err());
    }
}

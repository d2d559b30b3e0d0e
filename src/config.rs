// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Validation configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bandwidth::BandwidthModel;
use crate::campaign::CampaignSettings;
use crate::error::{Result, UpiError};
use crate::platform::PlatformFamily;
use crate::retry::RetryPolicy;
use crate::telemetry::TelemetrySidecar;
use crate::topology::ConnectionMap;

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Telemetry sidecar configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub csv_path: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            csv_path: "upi_telemetry.csv".into(),
        }
    }
}

/// Expected links, e.g. `"S0P1-S1P0"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub links: Vec<String>,
}

/// UPI validation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpiConfig {
    /// Family `upival simulate` builds when `--family` is not given.
    pub platform: Option<PlatformFamily>,
    pub check_interval_secs: u64,
    pub recheck_wait_secs: u64,
    pub stress_settle_secs: u64,
    pub stress_retries: u32,
    pub command_timeout_secs: u64,
    pub reboot_timeout_secs: u64,
    pub min_cycles: u32,
    pub idle_load_ceiling: Option<f64>,
    pub stress_load_floor: Option<f64>,
    pub bandwidth: BandwidthModel,
    pub telemetry: TelemetryConfig,
    /// Absent means the topology check is skipped.
    pub topology: Option<TopologyConfig>,
    pub sockets_after_degradation: Option<Vec<u32>>,
    pub log_level: LogLevel,
}

impl Default for UpiConfig {
    fn default() -> Self {
        Self {
            platform: None,
            check_interval_secs: 300,
            recheck_wait_secs: 20,
            stress_settle_secs: 120,
            stress_retries: 3,
            command_timeout_secs: 60,
            reboot_timeout_secs: 900,
            min_cycles: 5,
            idle_load_ceiling: Some(8.0),
            stress_load_floor: Some(50.0),
            bandwidth: BandwidthModel::default(),
            telemetry: TelemetryConfig::default(),
            topology: None,
            sockets_after_degradation: None,
            log_level: LogLevel::Info,
        }
    }
}

impl UpiConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| UpiError::Configuration(format!("Cannot read {}: {}", path, e)))?;
        Self::from_toml(&content)
    }

    /// Parse from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 {
            return Err(UpiError::Configuration("check_interval_secs must be positive".into()));
        }
        if self.stress_retries == 0 {
            return Err(UpiError::Configuration("stress_retries must be at least 1".into()));
        }
        if let Some(sockets) = &self.sockets_after_degradation {
            if sockets.is_empty() {
                return Err(UpiError::Configuration(
                    "sockets_after_degradation must name at least one socket".into(),
                ));
            }
        }
        Ok(())
    }

    /// Expected connection map, if one is configured.
    pub fn expected_topology(&self) -> Result<Option<ConnectionMap>> {
        self.topology
            .as_ref()
            .map(|t| ConnectionMap::from_link_strings(&t.links))
            .transpose()
    }

    /// Runtime settings for the campaign drivers.
    pub fn campaign_settings(&self) -> Result<CampaignSettings> {
        Ok(CampaignSettings {
            check_interval: Duration::from_secs(self.check_interval_secs),
            recheck_wait: Duration::from_secs(self.recheck_wait_secs),
            liveness: RetryPolicy::new(self.stress_retries, Duration::from_secs(self.recheck_wait_secs)),
            stress_settle: Duration::from_secs(self.stress_settle_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            reboot_timeout: Duration::from_secs(self.reboot_timeout_secs),
            min_cycles: self.min_cycles,
            idle_load_ceiling: self.idle_load_ceiling,
            stress_load_floor: self.stress_load_floor,
            bandwidth: self.bandwidth,
            expected_topology: self.expected_topology()?,
            sockets_after_degradation: self.sockets_after_degradation.clone(),
        })
    }

    /// Telemetry sidecar as configured.
    pub fn telemetry_sidecar(&self) -> TelemetrySidecar {
        TelemetrySidecar {
            csv_path: self.telemetry.csv_path.clone().into(),
            enabled: self.telemetry.enabled,
        }
    }

    /// Generate sample config
    pub fn sample_toml() -> String {
        r#"# UPI validation configuration
# platform = "SPR"          # family simulated when --family is not given
check_interval_secs = 300
recheck_wait_secs = 20
stress_settle_secs = 120
stress_retries = 3
command_timeout_secs = 60
reboot_timeout_secs = 900
min_cycles = 5
idle_load_ceiling = 8.0
stress_load_floor = 50.0
# sockets_after_degradation = [0, 1]
log_level = "Info"

[bandwidth]
lanes_per_port = 24
bytes_per_bit = 0.125
efficiency = 0.67
threshold = 0.85

[telemetry]
enabled = true
csv_path = "upi_telemetry.csv"

# Optional: expected links for the topology check
# [topology]
# links = ["S0P0-S1P0", "S0P1-S1P1", "S0P2-S1P2"]
"#
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::PortId;
    use std::io::Write;

    #[test]
    fn test_sample_toml_parses_to_defaults() {
        let config = UpiConfig::from_toml(&UpiConfig::sample_toml()).unwrap();
        assert_eq!(config, UpiConfig::default());
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = UpiConfig::from_toml("").unwrap();
        assert_eq!(config.check_interval_secs, 300);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.expected_topology().unwrap().is_none());
    }

    #[test]
    fn test_campaign_settings_conversion() {
        let config = UpiConfig::from_toml(
            r#"
platform = "GNR"
check_interval_secs = 60
stress_retries = 5
min_cycles = 3
stress_load_floor = 30.0
sockets_after_degradation = [0, 2]

[topology]
links = ["S0P0-S1P0", "S0P1-S2P0"]
"#,
        )
        .unwrap();
        assert_eq!(config.platform, Some(PlatformFamily::GNR));
        let settings = config.campaign_settings().unwrap();
        assert_eq!(settings.check_interval, Duration::from_secs(60));
        assert_eq!(settings.liveness, RetryPolicy::new(5, Duration::from_secs(20)));
        assert_eq!(settings.min_cycles, 3);
        assert_eq!(settings.stress_load_floor, Some(30.0));
        assert_eq!(settings.sockets_after_degradation, Some(vec![0, 2]));
        let topology = settings.expected_topology.unwrap();
        assert_eq!(topology.len(), 4);
        assert_eq!(
            topology.expected_peer(PortId::new(2, 0)),
            Some(PortId::new(0, 1))
        );
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            UpiConfig::from_toml("check_interval_secs = 0"),
            Err(UpiError::Configuration(_))
        ));
        assert!(matches!(
            UpiConfig::from_toml("stress_retries = 0"),
            Err(UpiError::Configuration(_))
        ));
        assert!(matches!(
            UpiConfig::from_toml("sockets_after_degradation = []"),
            Err(UpiError::Configuration(_))
        ));
        assert!(matches!(
            UpiConfig::from_toml("check_interval_secs = \"soon\""),
            Err(UpiError::Toml(_))
        ));
        let bad_link = UpiConfig::from_toml("[topology]\nlinks = [\"S0P0\"]").unwrap();
        assert!(bad_link.campaign_settings().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_level = \"Debug\"\n[telemetry]\nenabled = false").unwrap();
        let config = UpiConfig::from_toml_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.log_level.to_level_filter(), log::LevelFilter::Debug);
        assert!(!config.telemetry_sidecar().enabled);
        assert!(UpiConfig::from_toml_file("/nonexistent/upi.toml").is_err());
    }
}

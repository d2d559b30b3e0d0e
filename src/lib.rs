// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! # hsio-upi
//!
//! UPI link-state verification for multi-socket server platforms.
//!
//! - [`verify`]: single-pass register checks over every active port
//!   (lanes, rx/tx L0 state, link speed, error counters, topology)
//! - [`degrade`]: take ports down through BIOS knobs and confirm they went
//! - [`campaign`]: cyclic stress, reset, idle and bandwidth drivers
//! - [`bandwidth`]: expected inter-socket bandwidth from live link speeds
//! - [`telemetry`]: CSV register snapshots around a test case
//!
//! Hardware access goes through the traits in [`sut`]. [`sim`] implements
//! them over a scripted platform with a fake clock, so every driver can be
//! exercised without silicon.
//!
//! ## Example
//!
//! ```no_run
//! use upilib::platform::PlatformFamily;
//! use upilib::sim::{SimDebug, SimState};
//! use upilib::verify::LinkVerifier;
//!
//! let state = SimState::two_socket(PlatformFamily::SPR);
//! let debug = SimDebug::new(state);
//! let verifier = LinkVerifier::new(&debug)?;
//! assert!(verifier.verify_lanes()?);
//! # Ok::<(), upilib::UpiError>(())
//! ```

pub mod bandwidth;
pub mod campaign;
pub mod config;
pub mod degrade;
pub mod error;
pub mod platform;
pub mod retry;
pub mod sim;
pub mod sut;
pub mod telemetry;
pub mod topology;
pub mod verify;

pub use bandwidth::{check_bandwidth, BandwidthExpectation, BandwidthMatrix, BandwidthModel};
pub use campaign::{
    Campaign, CampaignOutcome, CampaignSettings, CampaignState, CycleBudget, Driver, FailureReason, TestCase,
    Workload,
};
pub use config::UpiConfig;
pub use degrade::{DegradationController, DegradationPlan, DisableSet};
pub use error::{Result, UpiError};
pub use platform::PlatformFamily;
pub use retry::{with_reconnect, RetryPolicy};
pub use sut::Sut;
pub use telemetry::{SnapshotPhase, TelemetrySidecar};
pub use topology::{ConnectionMap, PortId, Topology};
pub use verify::{ExpectedValues, LinkVerifier, UpiCheck};

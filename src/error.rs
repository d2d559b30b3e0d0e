// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Error types for UPI validation
//!
//! Ordinary verification mismatches are not errors: checks return
//! `Ok(false)`. `UpiError` carries setup problems, infrastructure failures
//! and explicit campaign aborts.

use std::io;
use thiserror::Error;

/// Result type alias for UPI validation operations
pub type Result<T> = std::result::Result<T, UpiError>;

/// Main error type for UPI validation
#[derive(Error, Debug)]
pub enum UpiError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Platform family has no definition for the requested operation
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Register template missing or malformed
    #[error("Register template error: {0}")]
    Template(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Port or peer that the live topology cannot resolve
    #[error("Topology error: {0}")]
    Topology(String),

    /// Transient loss of the silicon-debug connection
    #[error("Debug connection lost: {0}")]
    ConnectionLost(String),

    /// Register read failed for a reason other than connection loss
    #[error("Register access error: {0}")]
    RegisterAccess(String),

    /// Command execution failed
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Power cycle or OS wait failed
    #[error("Power control error: {0}")]
    Power(String),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Campaign-level decision to abort the test
    #[error("Test failed: {0}")]
    TestFail(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl UpiError {
    /// Whether a single reconnect-and-retry may clear this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpiError::ConnectionLost(_))
    }

    /// Setup problems abort the test case immediately and are never retried.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            UpiError::UnsupportedPlatform(_)
                | UpiError::Template(_)
                | UpiError::Configuration(_)
                | UpiError::Toml(_)
        )
    }

    /// Process exit status: 2 for setup problems, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        if self.is_setup() {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_unsupported_platform() {
        let err = UpiError::UnsupportedPlatform("SKX".to_string());
        assert_eq!(err.to_string(), "Unsupported platform: SKX");
    }

    #[test]
    fn test_error_display_connection_lost() {
        let err = UpiError::ConnectionLost("IPC timeout".to_string());
        assert_eq!(err.to_string(), "Debug connection lost: IPC timeout");
    }

    #[test]
    fn test_only_connection_lost_is_transient() {
        assert!(UpiError::ConnectionLost("x".into()).is_transient());
        assert!(!UpiError::RegisterAccess("x".into()).is_transient());
        assert!(!UpiError::TestFail("x".into()).is_transient());
        assert!(!UpiError::Template("x".into()).is_transient());
    }

    #[test]
    fn test_setup_classification() {
        assert!(UpiError::Template("no {port}".into()).is_setup());
        assert!(UpiError::Configuration("bad".into()).is_setup());
        assert!(!UpiError::ConnectionLost("x".into()).is_setup());
    }

    #[test]
    fn test_exit_code_separates_setup_errors() {
        assert_eq!(UpiError::UnsupportedPlatform("SKX".into()).exit_code(), 2);
        assert_eq!(UpiError::Configuration("bad".into()).exit_code(), 2);
        assert_eq!(UpiError::TestFail("x".into()).exit_code(), 1);
        assert_eq!(UpiError::ConnectionLost("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: UpiError = io_err.into();
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ invalid }}}").unwrap_err();
        let err: UpiError = json_err.into();
        assert!(err.to_string().contains("JSON error"));
    }
}

//! Error types surfaced by the reasoning engine.
//!
//! Only [`EngineError`] is ever returned from a public call. Subsystem
//! failures are recovered inside a cycle and recorded in the trace.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failures returned synchronously to the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed input, rejected before any subsystem runs.
    #[error("validation error: {0}")]
    Validation(String),
    /// Rejected configuration update; the engine keeps its previous settings.
    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failure of a single subsystem call within a cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubsystemFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled before completion")]
    Cancelled,
    #[error("required input from '{0}' unavailable")]
    DependencyUnavailable(String),
    #[error("panicked during invocation")]
    Panicked,
    #[error("{code}: {message}")]
    Failed { code: String, message: String },
}

impl SubsystemFailure {
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable reason code.
    pub fn reason_code(&self) -> &str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::DependencyUnavailable(_) => "dependency_unavailable",
            Self::Panicked => "panicked",
            Self::Failed { code, .. } => code,
        }
    }
}

/// Why a response carries `success = false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Every eligible subsystem failed.
    TotalFailure,
    /// The cycle was cancelled or hit its deadline before anything completed.
    Cancelled,
    /// The query was rejected (batch items only).
    Validation,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TotalFailure => "total_failure",
            Self::Cancelled => "cancelled",
            Self::Validation => "validation",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(SubsystemFailure::Timeout(Duration::from_secs(1)).reason_code(), "timeout");
        assert_eq!(SubsystemFailure::Panicked.reason_code(), "panicked");
        assert_eq!(
            SubsystemFailure::failed("empty_input", "nothing to do").reason_code(),
            "empty_input"
        );
        assert_eq!(
            SubsystemFailure::DependencyUnavailable("tool_reasoning".into()).to_string(),
            "required input from 'tool_reasoning' unavailable"
        );
    }
}

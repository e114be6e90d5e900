use crate::{Diagnostic, FailureKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("DOT parse error: {0}")]
    DotParse(String),
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unknown run '{0}'")]
    UnknownRun(String),
    #[error("unknown pending input '{0}'")]
    UnknownPendingInput(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("artifact store error: {0}")]
    Artifact(String),
    #[error("run storage error: {0}")]
    Storage(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl FactoryError {
    /// Errors that reject a submission outright; the run never starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Validation(_) | Self::DotParse(_) | Self::InvalidGraph(_)
        )
    }
}

#[derive(Debug, Error, Clone)]
#[error("validation failed with {errors_count} error(s)")]
pub struct ValidationError {
    pub diagnostics: Vec<Diagnostic>,
    pub errors_count: usize,
}

impl ValidationError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        let errors_count = diagnostics.iter().filter(|d| d.is_error()).count();
        Self {
            diagnostics,
            errors_count,
        }
    }
}

/// Typed failures of a single tool invocation. The gateway never retries;
/// the engine classifies these through [`GatewayError::failure_kind`].
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum GatewayError {
    #[error("tool '{tool}' is not registered")]
    ToolNotFound { tool: String },
    #[error("role '{role}' is not permitted to invoke tool '{tool}'")]
    PermissionDenied { role: String, tool: String },
    #[error("tool '{tool}' exceeded its {timeout_ms}ms limit")]
    Timeout { tool: String, timeout_ms: u64 },
    #[error("tool '{tool}' failed with exit code {code}")]
    ExecutionFailure {
        tool: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("sandbox setup failed: {0}")]
    SandboxSetup(String),
    #[error("tool invocation cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ToolNotFound { .. } => FailureKind::Configuration,
            Self::PermissionDenied { .. } => FailureKind::PolicyRejection,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::ExecutionFailure { .. } => FailureKind::RoleFailure,
            Self::SandboxSetup(_) => FailureKind::Infrastructure,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExecutionFailure { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_error_failure_kind_expected_taxonomy_mapping() {
        let denied = GatewayError::PermissionDenied {
            role: "developer".to_string(),
            tool: "deploy".to_string(),
        };
        assert_eq!(denied.failure_kind(), FailureKind::PolicyRejection);
        assert_eq!(
            GatewayError::SandboxSetup("no tmp".to_string()).failure_kind(),
            FailureKind::Infrastructure
        );
        let failed = GatewayError::ExecutionFailure {
            tool: "run-tests".to_string(),
            code: 2,
            stdout: String::new(),
            stderr: "1 failed".to_string(),
        };
        assert_eq!(failed.exit_code(), Some(2));
        assert_eq!(failed.to_string(), "tool 'run-tests' failed with exit code 2");
    }

    #[test]
    fn factory_error_is_configuration_expected_submission_errors_only() {
        assert!(FactoryError::Configuration("x".to_string()).is_configuration());
        assert!(!FactoryError::UnknownRun("r".to_string()).is_configuration());
    }
}

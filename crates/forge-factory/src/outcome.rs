use crate::ToolCallRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Pass,
    Fail,
    NeedsInput,
}

impl OutcomeClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::NeedsInput => "needs_input",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pass" | "success" => Some(Self::Pass),
            "fail" | "failure" => Some(Self::Fail),
            "needs_input" => Some(Self::NeedsInput),
            _ => None,
        }
    }
}

/// Error taxonomy reported in a run's terminal status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Infrastructure,
    RoleFailure,
    PolicyRejection,
    Timeout,
    Configuration,
    ExhaustedRetries,
    InputRejected,
    ClarificationLimit,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Infrastructure => "infrastructure",
            Self::RoleFailure => "role_failure",
            Self::PolicyRejection => "policy_rejection",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::ExhaustedRetries => "exhausted_retries",
            Self::InputRejected => "input_rejected",
            Self::ClarificationLimit => "clarification_limit",
            Self::Cancelled => "cancelled",
        }
    }

    /// Kinds the refinement controller may spend budget on.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Infrastructure | Self::RoleFailure | Self::Timeout
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub stage: Option<String>,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage: None,
            message: message.into(),
        }
    }

    pub fn at_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(stage) = self.stage.as_deref() {
            write!(f, " at stage '{stage}'")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// What a role executor reports for one attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub class: OutcomeClass,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<Value>,
}

impl Outcome {
    pub fn pass(payload: Value) -> Self {
        Self {
            class: OutcomeClass::Pass,
            payload,
            tool_calls: Vec::new(),
            failure: None,
            question: None,
        }
    }

    pub fn fail(kind: FailureKind, message: impl Into<String>, payload: Value) -> Self {
        Self {
            class: OutcomeClass::Fail,
            payload,
            tool_calls: Vec::new(),
            failure: Some(FailureReason::new(kind, message)),
            question: None,
        }
    }

    pub fn role_failure(message: impl Into<String>, payload: Value) -> Self {
        Self::fail(FailureKind::RoleFailure, message, payload)
    }

    pub fn policy_rejection(message: impl Into<String>, payload: Value) -> Self {
        Self::fail(FailureKind::PolicyRejection, message, payload)
    }

    pub fn needs_input(question: Value, payload: Value) -> Self {
        Self {
            class: OutcomeClass::NeedsInput,
            payload,
            tool_calls: Vec::new(),
            failure: None,
            question: Some(question),
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallRecord>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Failure kind, treating an unlabelled fail as a role failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.class {
            OutcomeClass::Fail => Some(
                self.failure
                    .as_ref()
                    .map(|failure| failure.kind)
                    .unwrap_or(FailureKind::RoleFailure),
            ),
            _ => None,
        }
    }

    pub fn failure_message(&self) -> String {
        self.failure
            .as_ref()
            .map(|failure| failure.message.clone())
            .unwrap_or_else(|| "stage reported failure".to_string())
    }
}

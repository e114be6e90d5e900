use crate::{
    ArtifactRef, ConfigOverrides, Decision, FailureReason, OutcomeClass, RefinementCounter,
    Resolution, ToolCallRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Dispatched,
    Evaluating,
    AwaitingInput,
    Succeeded,
    Failed,
    Aborted,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Evaluating => "evaluating",
            Self::AwaitingInput => "awaiting_input",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    pub fn status(self) -> RunStatus {
        match self {
            Self::Pending | Self::Dispatched | Self::Evaluating => RunStatus::Running,
            Self::AwaitingInput => RunStatus::AwaitingInput,
            Self::Succeeded => RunStatus::Succeeded,
            Self::Failed => RunStatus::Failed,
            Self::Aborted => RunStatus::Aborted,
        }
    }
}

/// Externally visible run status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
    AwaitingInput,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::AwaitingInput => "awaiting_input",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    NotStarted,
    Active,
    Passed,
    Failed,
    Awaiting,
}

/// One execution of a stage within a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub input_ref: Option<ArtifactRef>,
    pub class: OutcomeClass,
    pub payload: Value,
    pub payload_ref: Option<ArtifactRef>,
    pub failure: Option<FailureReason>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub started_at: String,
    pub duration_ms: u64,
    /// Set once the human gate answers a needs-input attempt.
    pub resolution: Option<Resolution>,
}

impl Attempt {
    /// A needs-input attempt the human approved or clarified counts as a pass.
    pub fn effective_class(&self) -> OutcomeClass {
        match (self.class, self.resolution.as_ref().map(|r| r.decision)) {
            (OutcomeClass::NeedsInput, Some(Decision::Approve | Decision::Modify)) => {
                OutcomeClass::Pass
            }
            (class, _) => class,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageRecord {
    pub state: StageState,
    pub attempts: Vec<Attempt>,
    pub counter: RefinementCounter,
    pub clarification_rounds: u32,
}

impl StageRecord {
    pub fn new(ceiling: u32) -> Self {
        Self {
            state: StageState::NotStarted,
            attempts: Vec::new(),
            counter: RefinementCounter::new(ceiling),
            clarification_rounds: 0,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingInputRecord {
    pub id: String,
    pub stage: String,
    pub attempt: u32,
    pub question: Value,
    pub requested_at: String,
    pub deadline_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub template: String,
    pub graph_id: String,
    pub state: RunState,
    pub overrides: ConfigOverrides,
    pub requirement_ref: Option<ArtifactRef>,
    pub stages: BTreeMap<String, StageRecord>,
    /// Stages queued for dispatch, with inbound payloads keyed by source stage.
    pub frontier: BTreeMap<String, BTreeMap<String, Value>>,
    pub pending_inputs: BTreeMap<String, PendingInputRecord>,
    pub context: BTreeMap<String, Value>,
    pub last_wave: Vec<String>,
    pub last_payload: Option<Value>,
    pub failure: Option<FailureReason>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl Run {
    pub fn stage_state(&self, stage: &str) -> StageState {
        self.stages
            .get(stage)
            .map(|record| record.state)
            .unwrap_or_default()
    }

    pub fn attempt_counts(&self) -> BTreeMap<String, u32> {
        self.stages
            .iter()
            .filter(|(_, record)| !record.attempts.is_empty())
            .map(|(name, record)| (name.clone(), record.attempt_count()))
            .collect()
    }

    pub fn attempts(&self, stage: &str) -> &[Attempt] {
        self.stages
            .get(stage)
            .map(|record| record.attempts.as_slice())
            .unwrap_or_default()
    }

    pub fn enqueue(&mut self, stage: &str, source: &str, payload: Value) {
        self.frontier
            .entry(stage.to_string())
            .or_default()
            .insert(source.to_string(), payload);
    }

    pub fn current_stages(&self) -> Vec<String> {
        if self.state.is_terminal() {
            return self.last_wave.clone();
        }
        let mut current: BTreeSet<String> = self.frontier.keys().cloned().collect();
        current.extend(
            self.pending_inputs
                .values()
                .map(|pending| pending.stage.clone()),
        );
        current.extend(
            self.stages
                .iter()
                .filter(|(_, record)| record.state == StageState::Active)
                .map(|(name, _)| name.clone()),
        );
        current.into_iter().collect()
    }

    pub fn status_report(&self) -> RunStatusReport {
        RunStatusReport {
            run_id: self.id.clone(),
            template: self.template.clone(),
            state: self.state,
            status: self.state.status(),
            current_stages: self.current_stages(),
            attempt_counts: self.attempt_counts(),
            pending_inputs: self.pending_inputs.values().cloned().collect(),
            reason: self.failure.as_ref().map(ToString::to_string),
            failure: self.failure.clone(),
            last_payload: self.last_payload.clone(),
            started_at: self.started_at.clone(),
            finished_at: self.finished_at.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run_id: String,
    pub template: String,
    pub state: RunState,
    pub status: RunStatus,
    pub current_stages: Vec<String>,
    pub attempt_counts: BTreeMap<String, u32>,
    pub pending_inputs: Vec<PendingInputRecord>,
    pub failure: Option<FailureReason>,
    /// Typed reason string, e.g. `exhausted_retries at stage 'tester': ...`.
    pub reason: Option<String>,
    pub last_payload: Option<Value>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl RunStatusReport {
    pub fn attempts_for(&self, stage: &str) -> u32 {
        self.attempt_counts.get(stage).copied().unwrap_or(0)
    }
}

/// Persisted form of a run, written after every advance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub saved_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attempt(class: OutcomeClass, resolution: Option<Resolution>) -> Attempt {
        Attempt {
            number: 1,
            input_ref: None,
            class,
            payload: json!({}),
            payload_ref: None,
            failure: None,
            tool_calls: Vec::new(),
            started_at: "0.000Z".to_string(),
            duration_ms: 0,
            resolution,
        }
    }

    #[test]
    fn effective_class_resolved_needs_input_expected_pass_only_when_accepted() {
        assert_eq!(
            attempt(OutcomeClass::NeedsInput, Some(Resolution::modify(json!("x")))).effective_class(),
            OutcomeClass::Pass
        );
        assert_eq!(
            attempt(OutcomeClass::NeedsInput, Some(Resolution::reject())).effective_class(),
            OutcomeClass::NeedsInput
        );
        assert_eq!(
            attempt(OutcomeClass::Fail, None).effective_class(),
            OutcomeClass::Fail
        );
    }

    #[test]
    fn run_state_status_expected_internal_states_collapse_to_running() {
        assert_eq!(RunState::Dispatched.status(), RunStatus::Running);
        assert_eq!(RunState::Evaluating.status(), RunStatus::Running);
        assert_eq!(RunState::AwaitingInput.status(), RunStatus::AwaitingInput);
        assert!(RunState::Aborted.is_terminal());
        assert!(!RunState::AwaitingInput.is_terminal());
    }
}

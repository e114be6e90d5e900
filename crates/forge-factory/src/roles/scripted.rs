use crate::{FactoryError, Outcome, StageContext, roles::RoleExecutor};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug)]
pub enum ScriptStep {
    Outcome(Outcome),
    /// Executor error; the engine classifies it as an infrastructure failure.
    Error(String),
    Delay(Duration, Outcome),
    /// Never returns, ignoring cancellation.
    Hang,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScriptedCall {
    pub stage: String,
    pub attempt: u32,
    pub previous_payload: Option<Value>,
    pub context: BTreeMap<String, Value>,
}

/// Replays queued steps per stage, then passes. For tests and dry runs.
#[derive(Debug, Default)]
pub struct ScriptedRole {
    scripts: Mutex<BTreeMap<String, VecDeque<ScriptStep>>>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedRole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, stage: impl Into<String>, step: ScriptStep) -> Self {
        self.push(stage, step);
        self
    }

    pub fn outcomes(self, stage: impl Into<String>, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        let stage = stage.into();
        for outcome in outcomes {
            self.push(stage.clone(), ScriptStep::Outcome(outcome));
        }
        self
    }

    pub fn push(&self, stage: impl Into<String>, step: ScriptStep) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(stage.into()).or_default().push_back(step);
        }
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, stage: &str) -> Vec<ScriptedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.stage == stage)
            .collect()
    }

    fn next_step(&self, stage: &str) -> Option<ScriptStep> {
        self.scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.get_mut(stage).and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl RoleExecutor for ScriptedRole {
    async fn execute(&self, context: &StageContext) -> Result<Outcome, FactoryError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ScriptedCall {
                stage: context.stage.name.clone(),
                attempt: context.attempt,
                previous_payload: context.previous_payload.clone(),
                context: context.context.clone(),
            });
        }

        match self.next_step(&context.stage.name) {
            Some(ScriptStep::Outcome(outcome)) => Ok(outcome),
            Some(ScriptStep::Error(message)) => Err(FactoryError::Runtime(message)),
            Some(ScriptStep::Delay(delay, outcome)) => {
                tokio::time::sleep(delay).await;
                Ok(outcome)
            }
            Some(ScriptStep::Hang) => std::future::pending().await,
            None => Ok(Outcome::pass(json!({
                "stage": context.stage.name,
                "attempt": context.attempt,
            }))),
        }
    }
}

use crate::{FactoryError, FailureKind, Outcome, RoleType, StageContext, roles::RoleExecutor};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

pub enum BackendReply {
    /// Free-form answer; the stage passes with it as its payload.
    Text(String),
    Json(Value),
    /// The backend needs a human answer before it can continue.
    Questions(Value),
    Outcome(Outcome),
}

/// Black-box generator behind a role, e.g. a language model session.
#[async_trait]
pub trait RoleBackend: Send + Sync {
    async fn run(&self, context: &StageContext, prompt: &str) -> Result<BackendReply, FactoryError>;
}

/// Answers every stage with a canned response.
#[derive(Debug, Default)]
pub struct SimulatedBackend;

#[async_trait]
impl RoleBackend for SimulatedBackend {
    async fn run(&self, context: &StageContext, _prompt: &str) -> Result<BackendReply, FactoryError> {
        let stage = &context.stage.name;
        Ok(match context.role() {
            RoleType::Critic => BackendReply::Json(json!({
                "review": format!("[Simulated] critique for {stage}"),
                "feedback_items": context.feedback().len(),
            })),
            role => BackendReply::Text(format!("[Simulated] {role} output for stage: {stage}")),
        })
    }
}

pub struct BackendRole {
    backend: Arc<dyn RoleBackend>,
}

impl BackendRole {
    pub fn new(backend: Arc<dyn RoleBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl RoleExecutor for BackendRole {
    async fn execute(&self, context: &StageContext) -> Result<Outcome, FactoryError> {
        let prompt = expand_prompt(context);
        let outcome = match self.backend.run(context, &prompt).await {
            Ok(BackendReply::Outcome(outcome)) => outcome,
            Ok(BackendReply::Json(payload)) => Outcome::pass(payload),
            Ok(BackendReply::Text(response)) => Outcome::pass(json!({
                "stage": context.stage.name,
                "role": context.role().as_str(),
                "response": response,
            })),
            Ok(BackendReply::Questions(questions)) => Outcome::needs_input(
                questions,
                json!({
                    "stage": context.stage.name,
                    "prompt": prompt,
                }),
            ),
            Err(error) => Outcome::fail(
                FailureKind::Infrastructure,
                error.to_string(),
                json!({"stage": context.stage.name}),
            ),
        };
        Ok(outcome.with_tool_calls(context.tools.records()))
    }
}

/// Stage prompt with `$requirement`, `$stage` and `$previous` expanded.
pub fn expand_prompt(context: &StageContext) -> String {
    let mut prompt = context.stage.prompt().unwrap_or_default().to_string();
    if prompt.trim().is_empty() {
        prompt = format!("Act as the {} for stage {}.", context.role(), context.stage.name);
    }
    prompt
        .replace("$requirement", &render(&context.requirement))
        .replace("$stage", &context.stage.name)
        .replace(
            "$previous",
            &context.previous_payload.as_ref().map(render).unwrap_or_default(),
        )
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

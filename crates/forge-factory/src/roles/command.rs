use crate::{FactoryError, GatewayError, Outcome, StageContext, ToolRequest, roles::RoleExecutor};
use async_trait::async_trait;
use serde_json::{Map, Value, json};

/// Runs the stage's `tools` in order through the gateway and classifies the
/// result: all succeed is a pass, the first failure ends the attempt.
#[derive(Clone, Debug, Default)]
pub struct CommandRole {
    policy_exit_code: Option<i32>,
}

impl CommandRole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit code a tool uses to veto the work outright (non-retryable).
    pub fn with_policy_exit_code(mut self, code: i32) -> Self {
        self.policy_exit_code = Some(code);
        self
    }

    fn request_for(&self, context: &StageContext) -> ToolRequest {
        let mut request = ToolRequest {
            input: json!({
                "requirement": context.requirement,
                "previous": context.previous_payload,
            }),
            ..ToolRequest::default()
        };
        if let Some(previous) = context.previous_payload.as_ref() {
            request.stdin = Some(previous.to_string());
            if let Some(files) = previous.get("files").and_then(Value::as_object) {
                request.files = files
                    .iter()
                    .filter_map(|(path, body)| body.as_str().map(|body| (path.clone(), body.to_string())))
                    .collect();
            }
        }
        request
    }

    fn classify(&self, tool: &str, error: &GatewayError) -> Outcome {
        let payload = json!({"tool": tool, "error": error});
        match error {
            GatewayError::ExecutionFailure { code, stderr, .. }
                if Some(*code) == self.policy_exit_code =>
            {
                Outcome::policy_rejection(format!("{tool} vetoed the change: {}", stderr.trim()), payload)
            }
            GatewayError::ExecutionFailure { code, stderr, .. } => Outcome::role_failure(
                format!("{tool} exited with code {code}: {}", stderr.trim()),
                payload,
            ),
            other => Outcome::fail(other.failure_kind(), other.to_string(), payload),
        }
    }
}

#[async_trait]
impl RoleExecutor for CommandRole {
    async fn execute(&self, context: &StageContext) -> Result<Outcome, FactoryError> {
        if context.stage.tools.is_empty() {
            return Ok(Outcome::pass(
                context.previous_payload.clone().unwrap_or(Value::Null),
            ));
        }

        let request = self.request_for(context);
        let mut results = Map::new();
        for tool in &context.stage.tools {
            match context.tools.invoke(tool, request.clone()).await {
                Ok(output) => {
                    results.insert(
                        tool.clone(),
                        json!({
                            "stdout": output.stdout,
                            "structured": output.structured,
                        }),
                    );
                }
                Err(error) => {
                    let outcome = self.classify(tool, &error);
                    return Ok(outcome.with_tool_calls(context.tools.records()));
                }
            }
        }

        Ok(Outcome::pass(json!({
            "stage": context.stage.name,
            "tools": Value::Object(results),
        }))
        .with_tool_calls(context.tools.records()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::test_support::stage_context;
    use crate::{FailureKind, FnTool, OutcomeClass, RoleType, ToolAllowlist, ToolGateway, ToolOutput};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    fn gateway(run_tests_exit: i32) -> ToolGateway {
        let allowlist = ToolAllowlist::new(BTreeMap::from([(
            RoleType::Validator,
            BTreeSet::from(["compile".to_string(), "run-tests".to_string()]),
        )]));
        ToolGateway::new(allowlist)
            .with_tool(Arc::new(FnTool::new("compile", |request: ToolRequest| async move {
                Ok(ToolOutput::success(request.files.len().to_string()))
            })))
            .with_tool(Arc::new(FnTool::new("run-tests", move |_| async move {
                Ok(ToolOutput::exited(run_tests_exit, "", "policy: secret in source"))
            })))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn command_role_all_tools_pass_expected_pass_with_records() {
        let mut context = stage_context("validator", None, gateway(0));
        context.previous_payload = Some(json!({"files": {"src/main.rs": "fn main() {}"}}));
        let outcome = CommandRole::new().execute(&context).await.expect("execute");
        assert_eq!(outcome.class, OutcomeClass::Pass);
        assert_eq!(outcome.payload["tools"]["compile"]["stdout"], "1");
        assert_eq!(outcome.tool_calls.len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn command_role_policy_exit_code_expected_policy_rejection() {
        let context = stage_context("validator", None, gateway(3));
        let outcome = CommandRole::new()
            .with_policy_exit_code(3)
            .execute(&context)
            .await
            .expect("execute");
        assert_eq!(outcome.failure_kind(), Some(FailureKind::PolicyRejection));
        assert!(!outcome.failure_kind().is_some_and(FailureKind::is_retryable));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn command_role_ordinary_failure_expected_role_failure() {
        let context = stage_context("validator", None, gateway(1));
        let outcome = CommandRole::new()
            .with_policy_exit_code(3)
            .execute(&context)
            .await
            .expect("execute");
        assert_eq!(outcome.failure_kind(), Some(FailureKind::RoleFailure));
        assert_eq!(outcome.tool_calls.len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn command_role_denied_tool_expected_policy_rejection_from_gateway() {
        let context = stage_context("tester", None, gateway(0));
        let outcome = CommandRole::new().execute(&context).await.expect("execute");
        assert_eq!(outcome.failure_kind(), Some(FailureKind::PolicyRejection));
    }
}

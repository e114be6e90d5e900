use crate::{FactoryError, RoleType, StageNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

/// What a pending input resolves to when its deadline passes unanswered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlExpiryPolicy {
    #[default]
    Reject,
    ApproveLastPayload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FactoryConfig {
    #[serde(alias = "max_refinements_per_stage")]
    pub max_refinements_per_stage: u32,
    #[serde(alias = "stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    #[serde(alias = "hitl_deadline_ms")]
    pub hitl_deadline_ms: u64,
    #[serde(alias = "tool_allowlist_per_role")]
    pub tool_allowlist_per_role: BTreeMap<RoleType, BTreeSet<String>>,
    #[serde(alias = "tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(alias = "max_clarification_rounds")]
    pub max_clarification_rounds: u32,
    #[serde(alias = "hitl_expiry")]
    pub hitl_expiry: HitlExpiryPolicy,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_refinements_per_stage: 3,
            stage_timeout_ms: 300_000,
            hitl_deadline_ms: 3_600_000,
            tool_allowlist_per_role: default_tool_allowlist(),
            tool_timeout_ms: 60_000,
            max_clarification_rounds: 2,
            hitl_expiry: HitlExpiryPolicy::Reject,
        }
    }
}

/// Role capabilities when no allowlist is configured. Nobody may deploy;
/// only developers may commit.
pub fn default_tool_allowlist() -> BTreeMap<RoleType, BTreeSet<String>> {
    let entry = |role: RoleType, tools: &[&str]| {
        (
            role,
            tools.iter().map(|tool| tool.to_string()).collect::<BTreeSet<_>>(),
        )
    };
    BTreeMap::from([
        entry(RoleType::Architect, &[]),
        entry(RoleType::Planner, &[]),
        entry(RoleType::Developer, &["compile", "lint", "commit"]),
        entry(RoleType::Tester, &["compile", "run-tests", "lint"]),
        entry(RoleType::Validator, &["scan", "lint"]),
        entry(RoleType::Critic, &["lint"]),
    ])
}

impl FactoryConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, FactoryError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| FactoryError::Configuration(format!("invalid config JSON: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FactoryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| {
            FactoryError::Configuration(format!(
                "failed to read config '{}': {error}",
                path.display()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), FactoryError> {
        if self.stage_timeout_ms == 0 {
            return Err(FactoryError::Configuration(
                "stageTimeoutMs must be positive".to_string(),
            ));
        }
        if self.tool_timeout_ms == 0 {
            return Err(FactoryError::Configuration(
                "toolTimeoutMs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Ceiling precedence: per-stage override, task override, node attribute, config default.
    pub fn ceiling_for(&self, stage: &StageNode, overrides: &ConfigOverrides) -> u32 {
        overrides
            .stage_max_refinements
            .get(&stage.name)
            .copied()
            .or(overrides.max_refinements_per_stage)
            .or(stage.max_refinements)
            .unwrap_or(self.max_refinements_per_stage)
    }

    pub fn stage_timeout_for(&self, stage: &StageNode, overrides: &ConfigOverrides) -> Duration {
        overrides
            .stage_timeout_ms
            .map(Duration::from_millis)
            .or(stage.timeout)
            .unwrap_or(Duration::from_millis(self.stage_timeout_ms))
    }

    pub fn hitl_deadline(&self, overrides: &ConfigOverrides) -> Duration {
        Duration::from_millis(overrides.hitl_deadline_ms.unwrap_or(self.hitl_deadline_ms))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigOverrides {
    #[serde(alias = "max_refinements_per_stage")]
    pub max_refinements_per_stage: Option<u32>,
    #[serde(alias = "stage_timeout_ms")]
    pub stage_timeout_ms: Option<u64>,
    #[serde(alias = "hitl_deadline_ms")]
    pub hitl_deadline_ms: Option<u64>,
    #[serde(alias = "stage_max_refinements")]
    pub stage_max_refinements: BTreeMap<String, u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub requirement: Value,
    pub template: String,
    #[serde(default)]
    pub overrides: ConfigOverrides,
}

impl TaskDescriptor {
    pub fn new(template: impl Into<String>, requirement: Value) -> Self {
        Self {
            requirement,
            template: template.into(),
            overrides: ConfigOverrides::default(),
        }
    }

    pub fn with_max_refinements(mut self, max: u32) -> Self {
        self.overrides.max_refinements_per_stage = Some(max);
        self
    }

    pub fn with_stage_max_refinements(mut self, stage: impl Into<String>, max: u32) -> Self {
        self.overrides.stage_max_refinements.insert(stage.into(), max);
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.overrides.stage_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_hitl_deadline(mut self, deadline: Duration) -> Self {
        self.overrides.hitl_deadline_ms = Some(deadline.as_millis() as u64);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StageGraph, parse_dot};

    fn stage(attrs: &str) -> StageNode {
        let source = format!(r#"digraph G {{ dev [role="developer"{attrs}] }}"#);
        let graph = parse_dot(&source).expect("graph should parse");
        StageGraph::compile(&graph, &[])
            .expect("graph should compile")
            .nodes["dev"]
            .clone()
    }

    #[test]
    fn from_json_str_camel_and_snake_keys_expected_both_accepted() {
        let camel = FactoryConfig::from_json_str(
            r#"{"maxRefinementsPerStage": 5, "hitlExpiry": "approve_last_payload"}"#,
        )
        .expect("camel config should load");
        assert_eq!(camel.max_refinements_per_stage, 5);
        assert_eq!(camel.hitl_expiry, HitlExpiryPolicy::ApproveLastPayload);
        assert_eq!(camel.stage_timeout_ms, 300_000);

        let snake = FactoryConfig::from_json_str(
            r#"{"stage_timeout_ms": 1000, "tool_allowlist_per_role": {"tester": ["run-tests"]}}"#,
        )
        .expect("snake config should load");
        assert_eq!(snake.stage_timeout_ms, 1000);
        assert!(snake.tool_allowlist_per_role[&RoleType::Tester].contains("run-tests"));
        assert!(!snake.tool_allowlist_per_role.contains_key(&RoleType::Developer));
    }

    #[test]
    fn from_json_str_zero_timeout_expected_configuration_error() {
        let error = FactoryConfig::from_json_str(r#"{"stageTimeoutMs": 0}"#)
            .expect_err("zero timeout should fail");
        assert!(error.is_configuration());
    }

    #[test]
    fn from_path_missing_file_expected_configuration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = FactoryConfig::from_path(dir.path().join("absent.json"))
            .expect_err("missing file should fail");
        assert!(matches!(error, FactoryError::Configuration(_)));
    }

    #[test]
    fn ceiling_for_precedence_expected_stage_override_then_task_then_node() {
        let config = FactoryConfig::default();
        let node = stage(", max_refinements=7");

        assert_eq!(config.ceiling_for(&stage(""), &ConfigOverrides::default()), 3);
        assert_eq!(config.ceiling_for(&node, &ConfigOverrides::default()), 7);

        let task = TaskDescriptor::new("t", Value::Null).with_max_refinements(2);
        assert_eq!(config.ceiling_for(&node, &task.overrides), 2);

        let task = task.with_stage_max_refinements("dev", 0);
        assert_eq!(config.ceiling_for(&node, &task.overrides), 0);
    }

    #[test]
    fn stage_timeout_for_precedence_expected_task_then_node_then_default() {
        let config = FactoryConfig::default();
        let node = stage(r#", timeout="5s""#);
        assert_eq!(
            config.stage_timeout_for(&node, &ConfigOverrides::default()),
            Duration::from_secs(5)
        );
        let task = TaskDescriptor::new("t", Value::Null).with_stage_timeout(Duration::from_secs(1));
        assert_eq!(config.stage_timeout_for(&node, &task.overrides), Duration::from_secs(1));
        assert_eq!(
            config.stage_timeout_for(&stage(""), &ConfigOverrides::default()),
            Duration::from_secs(300)
        );
    }
}

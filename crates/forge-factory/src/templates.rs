use crate::{FactoryError, LintRule, StageGraph, parse_dot};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub const SOFTWARE_FACTORY_TEMPLATE: &str = "software-factory";

/// Requirements-to-artifacts pipeline: design, plan, build, test, then
/// security and compliance checks in parallel. Test and validation
/// failures go to the critic, whose review feeds the next developer pass.
pub const SOFTWARE_FACTORY_DOT: &str = r#"
digraph software_factory {
    graph [goal="Turn a requirements document into validated software artifacts"]

    architect  [role="architect", prompt="Design the system architecture for: $requirement"]
    planner    [role="planner", prompt="Break the architecture into an implementation plan: $previous", question="Which parts of the requirement are in scope?"]
    developer  [role="developer", prompt="Implement the plan, addressing any review feedback: $previous"]
    tester     [role="tester", prompt="Design and run test cases for: $previous"]
    security   [role="validator", prompt="Check the change for security issues: $previous"]
    compliance [role="validator", prompt="Check the change against compliance policy: $previous"]
    critic     [role="critic", prompt="Turn these failures into actionable feedback: $previous"]

    architect -> planner -> developer -> tester
    tester -> security
    tester -> compliance

    tester -> critic [outcome="fail"]
    security -> critic [outcome="fail"]
    compliance -> critic [outcome="fail"]
    critic -> developer
}
"#;

#[derive(Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Arc<StageGraph>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Result<Self, FactoryError> {
        let mut registry = Self::new();
        registry.register_dot(SOFTWARE_FACTORY_TEMPLATE, SOFTWARE_FACTORY_DOT, &[])?;
        Ok(registry)
    }

    pub fn register(&mut self, id: impl Into<String>, graph: StageGraph) {
        self.templates.insert(id.into(), Arc::new(graph));
    }

    pub fn register_dot(
        &mut self,
        id: impl Into<String>,
        source: &str,
        extra_rules: &[&dyn LintRule],
    ) -> Result<(), FactoryError> {
        let graph = parse_dot(source)?;
        let compiled = StageGraph::compile(&graph, extra_rules)?;
        self.register(id, compiled);
        Ok(())
    }

    /// Registers a DOT file under its file stem and returns that id.
    pub fn register_path(
        &mut self,
        path: impl AsRef<Path>,
        extra_rules: &[&dyn LintRule],
    ) -> Result<String, FactoryError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|error| {
            FactoryError::Configuration(format!(
                "failed to read template '{}': {error}",
                path.display()
            ))
        })?;
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| {
                FactoryError::Configuration(format!("template path '{}' has no name", path.display()))
            })?
            .to_string();
        self.register_dot(id.clone(), &source, extra_rules)?;
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<StageGraph>> {
        self.templates.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }
}

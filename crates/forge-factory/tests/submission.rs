use forge_factory::{
    FactoryConfig, FactoryError, FnTool, RoleRegistry, RoleType, SOFTWARE_FACTORY_TEMPLATE,
    ScriptedRole, TaskDescriptor, TemplateRegistry, ToolOutput, WorkflowEngine,
};
use serde_json::json;
use std::sync::Arc;

const TOOLING: &str = r#"digraph G {
    developer [role="developer", tools="compile"]
    tester [role="tester", tools="run-tests"]
    developer -> tester
}"#;

fn engine_with(templates: TemplateRegistry, roles: RoleRegistry) -> WorkflowEngine {
    WorkflowEngine::builder(FactoryConfig::default())
        .templates(templates)
        .roles(roles)
        .tool(Arc::new(FnTool::new("compile", |_| async {
            Ok(ToolOutput::success("ok"))
        })))
        .tool(Arc::new(FnTool::new("deploy", |_| async {
            Ok(ToolOutput::success("shipped"))
        })))
        .build()
        .expect("engine should build")
}

fn templates(id: &str, source: &str) -> TemplateRegistry {
    let mut templates = TemplateRegistry::new();
    templates.register_dot(id, source, &[]).expect("template should compile");
    templates
}

fn scripted_roles() -> RoleRegistry {
    let script = Arc::new(ScriptedRole::new());
    let mut roles = RoleRegistry::new();
    for role in RoleType::core_roles() {
        roles.register(role, script.clone());
    }
    roles
}

async fn submit_error(engine: &WorkflowEngine, task: TaskDescriptor) -> FactoryError {
    let error = engine.submit(task).await.expect_err("submission should be rejected");
    assert!(error.is_configuration(), "{error}");
    assert!(engine.run_ids().is_empty(), "rejected submission must not create a run");
    error
}

#[tokio::test(flavor = "current_thread")]
async fn submit_unknown_template_expected_configuration_error() {
    let engine = engine_with(TemplateRegistry::new(), scripted_roles());
    let error = submit_error(&engine, TaskDescriptor::new("nope", json!({}))).await;
    assert!(error.to_string().contains("unknown graph template 'nope'"));
}

#[tokio::test(flavor = "current_thread")]
async fn submit_unregistered_tool_expected_configuration_error() {
    let engine = engine_with(templates("tooling", TOOLING), scripted_roles());
    let error = submit_error(&engine, TaskDescriptor::new("tooling", json!({}))).await;
    assert!(error.to_string().contains("unknown tool 'run-tests'"), "{error}");
}

#[tokio::test(flavor = "current_thread")]
async fn submit_tool_outside_role_allowlist_expected_configuration_error() {
    let source = r#"digraph G { developer [role="developer", tools="compile, deploy"] }"#;
    let engine = engine_with(templates("shipit", source), scripted_roles());
    let error = submit_error(&engine, TaskDescriptor::new("shipit", json!({}))).await;
    assert!(error.to_string().contains("may not invoke tool 'deploy'"), "{error}");
}

#[tokio::test(flavor = "current_thread")]
async fn submit_role_without_executor_expected_configuration_error() {
    let source = r#"digraph G { docs [role="doc_writer"] }"#;
    let engine = engine_with(templates("docs", source), scripted_roles());
    let error = submit_error(&engine, TaskDescriptor::new("docs", json!({}))).await;
    assert!(error.to_string().contains("role 'doc_writer'"), "{error}");
}

#[tokio::test(flavor = "current_thread")]
async fn submit_override_for_unknown_stage_expected_configuration_error() {
    let engine = WorkflowEngine::builder(FactoryConfig::default())
        .templates(TemplateRegistry::with_builtin().expect("builtin"))
        .build()
        .expect("engine");
    let task = TaskDescriptor::new(SOFTWARE_FACTORY_TEMPLATE, json!({}))
        .with_stage_max_refinements("reviewer", 4);
    submit_error(&engine, task).await;
}

#[tokio::test(flavor = "current_thread")]
async fn custom_role_registered_expected_run_succeeds() {
    let source = r#"digraph G {
        developer [role="developer"]
        docs [role="doc_writer"]
        developer -> docs
    }"#;
    let roles = scripted_roles().with("doc_writer", Arc::new(ScriptedRole::new()));
    let engine = engine_with(templates("docs", source), roles);

    let run_id = engine
        .submit(TaskDescriptor::new("docs", json!({})))
        .await
        .expect("submit");
    let report = engine.run_until_settled(&run_id).await.expect("run");
    assert!(report.status.is_terminal());
    assert_eq!(report.attempts_for("docs"), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn status_unknown_run_expected_unknown_run_error() {
    let engine = engine_with(TemplateRegistry::new(), scripted_roles());
    assert!(matches!(
        engine.status("missing").await,
        Err(FactoryError::UnknownRun(_))
    ));
    assert!(matches!(
        engine.cancel("missing").await,
        Err(FactoryError::UnknownRun(_))
    ));
}

#[test]
fn build_with_zero_stage_timeout_expected_configuration_error() {
    let config = FactoryConfig {
        stage_timeout_ms: 0,
        ..FactoryConfig::default()
    };
    let error = WorkflowEngine::builder(config)
        .build()
        .err()
        .expect("invalid config");
    assert!(error.is_configuration());
}

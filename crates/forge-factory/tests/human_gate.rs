use forge_factory::{
    FactoryConfig, FactoryError, FailureKind, HitlExpiryPolicy, Outcome, Resolution,
    ResolveOutcome, RoleRegistry, RoleType, RunState, RunStatus, RunStatusReport,
    SOFTWARE_FACTORY_TEMPLATE, ScriptedRole, TaskDescriptor, TemplateRegistry, WorkflowEngine,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn factory(script: &Arc<ScriptedRole>, config: FactoryConfig) -> WorkflowEngine {
    let mut roles = RoleRegistry::new();
    for role in RoleType::core_roles() {
        roles.register(role, script.clone());
    }
    WorkflowEngine::builder(config)
        .templates(TemplateRegistry::with_builtin().expect("builtin template"))
        .roles(roles)
        .build()
        .expect("engine should build")
}

fn asking_planner() -> Arc<ScriptedRole> {
    Arc::new(ScriptedRole::new().outcomes(
        "planner",
        [Outcome::needs_input(
            json!({"question": "Is the admin UI in scope?"}),
            json!({"plan": "draft"}),
        )],
    ))
}

async fn suspended(engine: &WorkflowEngine, deadline: Duration) -> (String, RunStatusReport) {
    let task = TaskDescriptor::new(SOFTWARE_FACTORY_TEMPLATE, json!({"title": "todo api"}))
        .with_hitl_deadline(deadline);
    let run_id = engine.submit(task).await.expect("submit");
    let report = engine.run_until_settled(&run_id).await.expect("run");
    assert_eq!(report.status, RunStatus::AwaitingInput);
    assert_eq!(report.pending_inputs.len(), 1);
    assert_eq!(report.current_stages, vec!["planner"]);
    (run_id, report)
}

#[tokio::test(flavor = "current_thread")]
async fn planner_needs_input_modify_expected_successor_receives_clarification() {
    let script = asking_planner();
    let engine = factory(&script, FactoryConfig::default());
    let (run_id, report) = suspended(&engine, Duration::from_secs(60)).await;

    let pending = &report.pending_inputs[0];
    assert_eq!(pending.stage, "planner");
    assert_eq!(pending.question, json!({"question": "Is the admin UI in scope?"}));

    let clarification = json!({"scope": "api only", "admin_ui": false});
    let outcome = engine
        .resolve_input(&pending.id, Resolution::modify(clarification.clone()))
        .await
        .expect("resolve");
    assert_eq!(outcome, ResolveOutcome::Accepted);

    let report = engine.run_until_settled(&run_id).await.expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.attempts_for("planner"), 1);

    let developer = &script.calls_for("developer")[0];
    assert_eq!(developer.previous_payload, Some(clarification.clone()));
    assert_eq!(developer.context["clarification.planner"], clarification);
}

#[tokio::test(flavor = "current_thread")]
async fn planner_needs_input_approve_expected_successor_receives_planner_payload() {
    let script = asking_planner();
    let engine = factory(&script, FactoryConfig::default());
    let (run_id, report) = suspended(&engine, Duration::from_secs(60)).await;

    engine
        .resolve_input(&report.pending_inputs[0].id, Resolution::approve())
        .await
        .expect("resolve");
    let report = engine.run_until_settled(&run_id).await.expect("run");

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(
        script.calls_for("developer")[0].previous_payload,
        Some(json!({"plan": "draft"}))
    );
}

#[tokio::test(flavor = "current_thread")]
async fn resolved_input_and_settled_run_expected_released_from_memory() {
    let script = asking_planner();
    let engine = factory(&script, FactoryConfig::default());
    let (run_id, report) = suspended(&engine, Duration::from_secs(60)).await;
    let pending_id = report.pending_inputs[0].id.clone();
    assert!(engine.pending_input(&pending_id).expect("lookup").is_some());
    assert_eq!(engine.run_ids(), vec![run_id.clone()]);

    engine
        .resolve_input(&pending_id, Resolution::approve())
        .await
        .expect("resolve");
    assert!(engine.pending_input(&pending_id).expect("lookup").is_none());

    let report = engine.run_until_settled(&run_id).await.expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(engine.run_ids().is_empty());

    let late = engine
        .resolve_input(&pending_id, Resolution::reject())
        .await
        .expect("late resolve");
    assert_eq!(late, ResolveOutcome::Ignored);
    assert_eq!(
        engine.status(&run_id).await.expect("status").status,
        RunStatus::Succeeded
    );
    assert_eq!(engine.attempts(&run_id, "planner").await.expect("attempts").len(), 1);
    assert!(matches!(
        engine.cancel(&run_id).await,
        Err(FactoryError::InvalidTransition(_))
    ));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn pending_input_expired_expected_same_result_as_reject() {
    let expired_script = asking_planner();
    let expired_engine = factory(&expired_script, FactoryConfig::default());
    let (expired_run, _) = suspended(&expired_engine, Duration::from_secs(30)).await;

    let rejected_script = asking_planner();
    let rejected_engine = factory(&rejected_script, FactoryConfig::default());
    let (rejected_run, report) = suspended(&rejected_engine, Duration::from_secs(30)).await;
    rejected_engine
        .resolve_input(&report.pending_inputs[0].id, Resolution::reject())
        .await
        .expect("reject");

    tokio::time::advance(Duration::from_secs(31)).await;
    let expired = expired_engine.advance(&expired_run).await.expect("advance");
    let rejected = rejected_engine.status(&rejected_run).await.expect("status");

    assert_eq!(expired.status, RunStatus::Failed);
    assert_eq!(expired.status, rejected.status);
    assert_eq!(expired.attempt_counts, rejected.attempt_counts);
    let expired_failure = expired.failure.expect("failure");
    let rejected_failure = rejected.failure.expect("failure");
    assert_eq!(expired_failure.kind, FailureKind::InputRejected);
    assert_eq!(expired_failure.kind, rejected_failure.kind);
    assert_eq!(expired_failure.stage, rejected_failure.stage);
    assert!(expired_script.calls_for("developer").is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn pending_input_expired_with_approve_policy_expected_run_continues() {
    let script = asking_planner();
    let config = FactoryConfig {
        hitl_expiry: HitlExpiryPolicy::ApproveLastPayload,
        ..FactoryConfig::default()
    };
    let engine = factory(&script, config);
    let (run_id, report) = suspended(&engine, Duration::from_secs(30)).await;

    tokio::time::advance(Duration::from_secs(31)).await;
    let late = engine
        .resolve_input(&report.pending_inputs[0].id, Resolution::reject())
        .await
        .expect("late resolve");
    assert_eq!(late, ResolveOutcome::Ignored);

    let report = engine.run_until_settled(&run_id).await.expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(
        script.calls_for("developer")[0].previous_payload,
        Some(json!({"plan": "draft"}))
    );
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_awaiting_input_expected_aborted_and_later_resolve_no_op() {
    let script = asking_planner();
    let engine = factory(&script, FactoryConfig::default());
    let (run_id, report) = suspended(&engine, Duration::from_secs(60)).await;

    let cancelled = engine.cancel(&run_id).await.expect("cancel");
    assert_eq!(cancelled.status, RunStatus::Aborted);
    assert!(cancelled.pending_inputs.is_empty());

    let outcome = engine
        .resolve_input(&report.pending_inputs[0].id, Resolution::approve())
        .await
        .expect("resolve");
    assert_eq!(outcome, ResolveOutcome::Ignored);
    assert_eq!(
        engine.status(&run_id).await.expect("status").status,
        RunStatus::Aborted
    );
    assert_eq!(
        engine.advance(&run_id).await.expect("advance").status,
        RunStatus::Aborted
    );
    assert!(script.calls_for("developer").is_empty());

    let again = engine.cancel(&run_id).await.expect("second cancel is a no-op");
    assert_eq!(again.state, RunState::Aborted);
}

#[tokio::test(flavor = "current_thread")]
async fn repeated_questions_expected_clarification_limit() {
    let script = Arc::new(ScriptedRole::new().outcomes(
        "architect",
        (0..3).map(|round| Outcome::needs_input(json!({"round": round}), json!({}))),
    ));
    let template = r#"digraph G {
        planner [role="planner"]
        architect [role="architect"]
        developer [role="developer"]
        planner -> architect -> developer
        architect -> architect [outcome="needs_input"]
    }"#;
    let mut templates = TemplateRegistry::new();
    templates.register_dot("ask", template, &[]).expect("template");
    let mut roles = RoleRegistry::new();
    for role in RoleType::core_roles() {
        roles.register(role, script.clone());
    }
    let engine = WorkflowEngine::builder(FactoryConfig::default())
        .templates(templates)
        .roles(roles)
        .build()
        .expect("engine");

    let run_id = engine
        .submit(TaskDescriptor::new("ask", json!("req")))
        .await
        .expect("submit");
    for _ in 0..2 {
        let report = engine.run_until_settled(&run_id).await.expect("run");
        assert_eq!(report.status, RunStatus::AwaitingInput);
        engine
            .resolve_input(
                &report.pending_inputs[0].id,
                Resolution::modify(json!("more detail")),
            )
            .await
            .expect("resolve");
    }
    let report = engine.run_until_settled(&run_id).await.expect("run");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(
        report.failure.as_ref().map(|failure| failure.kind),
        Some(FailureKind::ClarificationLimit)
    );
    assert_eq!(report.attempts_for("architect"), 3);
}

#[tokio::test(flavor = "current_thread")]
async fn resolve_unknown_pending_input_expected_error() {
    let engine = factory(&Arc::new(ScriptedRole::new()), FactoryConfig::default());
    let error = engine
        .resolve_input("missing", Resolution::approve())
        .await
        .expect_err("unknown id");
    assert!(matches!(error, FactoryError::UnknownPendingInput(_)));
}

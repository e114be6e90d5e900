//! The workflow engine: owns every run, dispatches ready stages to role
//! executors, and routes outcomes through the refinement controller and the
//! human gate until the run reaches a terminal state.
//!
//! A run is driven by repeated [`WorkflowEngine::advance`] calls. Each call
//! dispatches one wave of ready stages (parallel branches run concurrently and
//! always finish together), evaluates the outcomes in stage-name order, and
//! persists a snapshot. Advancing a terminal run is a no-op.

use crate::events::timestamp_now;
use crate::{
    ArtifactKey, ArtifactRef, ArtifactStore, Attempt, CapabilityToken, Decision, FactoryConfig,
    FactoryError, FailureKind, FailureReason, HitlExpiryPolicy, HumanGate, InputEvent,
    MemoryArtifactStore, MemoryRunStore, Outcome, OutcomeClass, PendingInputInfo,
    PendingInputRecord, PollState, RefinementController, Resolution, ResolveOutcome, RetryDecision,
    RoleRegistry, RoleType, Run, RunEvent, RunSnapshot, RunState, RunStatusReport,
    RunStore, RuntimeEventKind, RuntimeEventSink, Sandbox, SharedRoleExecutor, StageContext,
    StageEvent, StageGraph, StageNode, StageRecord, StageState, TaskDescriptor, TemplateRegistry,
    Tool, ToolAllowlist, ToolEvent, ToolGateway, ToolSession, put_json, simulated_registry,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const TASK_SOURCE: &str = "task";

pub struct EngineBuilder {
    config: FactoryConfig,
    templates: TemplateRegistry,
    roles: RoleRegistry,
    gateway: ToolGateway,
    artifacts: Arc<dyn ArtifactStore>,
    store: Arc<dyn RunStore>,
    events: RuntimeEventSink,
}

impl EngineBuilder {
    /// Defaults: simulated roles, in-memory stores, and a gateway enforcing the
    /// configured allowlist and tool timeout.
    pub fn new(config: FactoryConfig) -> Self {
        let gateway = ToolGateway::new(ToolAllowlist::new(config.tool_allowlist_per_role.clone()))
            .with_timeout(config.tool_timeout());
        Self {
            config,
            templates: TemplateRegistry::new(),
            roles: simulated_registry(),
            gateway,
            artifacts: Arc::new(MemoryArtifactStore::new()),
            store: Arc::new(MemoryRunStore::new()),
            events: RuntimeEventSink::default(),
        }
    }

    pub fn templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = templates;
        self
    }

    pub fn roles(mut self, roles: RoleRegistry) -> Self {
        self.roles = roles;
        self
    }

    pub fn role(mut self, role: impl Into<RoleType>, executor: SharedRoleExecutor) -> Self {
        self.roles.register(role, executor);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.gateway.register(tool);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.gateway = self.gateway.with_sandbox(sandbox);
        self
    }

    /// Replaces the gateway entirely, including its allowlist.
    pub fn gateway(mut self, gateway: ToolGateway) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn run_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn events(mut self, events: RuntimeEventSink) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<WorkflowEngine, FactoryError> {
        self.config.validate()?;
        Ok(WorkflowEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                templates: self.templates,
                roles: self.roles,
                gateway: self.gateway,
                gate: HumanGate::new(),
                artifacts: self.artifacts,
                store: self.store,
                events: self.events,
                controller: RefinementController,
                runs: Mutex::new(HashMap::new()),
            }),
        })
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: FactoryConfig,
    templates: TemplateRegistry,
    roles: RoleRegistry,
    gateway: ToolGateway,
    gate: HumanGate,
    artifacts: Arc<dyn ArtifactStore>,
    store: Arc<dyn RunStore>,
    events: RuntimeEventSink,
    controller: RefinementController,
    runs: Mutex<HashMap<String, Arc<RunHandle>>>,
}

struct RunHandle {
    graph: Arc<StageGraph>,
    requirement: Value,
    cancel: CancellationToken,
    /// Serializes advances of one run; cancellation never takes it.
    driver: tokio::sync::Mutex<()>,
    /// Serializes snapshot writes so the newest state always lands last.
    persist: tokio::sync::Mutex<()>,
    run: Mutex<Run>,
}

impl RunHandle {
    fn with_run<R>(&self, f: impl FnOnce(&mut Run) -> R) -> Result<R, FactoryError> {
        let mut run = self
            .run
            .lock()
            .map_err(|_| FactoryError::Runtime("run state lock poisoned".to_string()))?;
        Ok(f(&mut run))
    }
}

enum Plan {
    Unchanged,
    Settled,
    Dispatch(Vec<StageJob>),
}

struct StageJob {
    stage: StageNode,
    attempt: u32,
    previous_payload: Option<Value>,
    context: BTreeMap<String, Value>,
    artifact_refs: Vec<ArtifactRef>,
    executor: SharedRoleExecutor,
    timeout: Duration,
}

struct StageResult {
    stage: String,
    attempt: u32,
    outcome: Outcome,
    input_ref: Option<ArtifactRef>,
    payload_ref: Option<ArtifactRef>,
    started_at: String,
    duration_ms: u64,
}

impl WorkflowEngine {
    pub fn builder(config: FactoryConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.inner.config
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.inner.templates
    }

    pub fn gateway(&self) -> &ToolGateway {
        &self.inner.gateway
    }

    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .runs
            .lock()
            .map(|runs| runs.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Validates the task against its template and registers a new run.
    /// Configuration problems are reported here and the run never starts.
    pub async fn submit(&self, task: TaskDescriptor) -> Result<String, FactoryError> {
        let inner = &self.inner;
        let graph = inner.templates.get(&task.template).ok_or_else(|| {
            FactoryError::Configuration(format!("unknown graph template '{}'", task.template))
        })?;
        self.check_task(&graph, &task)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let requirement_ref = put_json(
            inner.artifacts.as_ref(),
            &ArtifactKey::task(&run_id, "requirement.json"),
            &task.requirement,
        )
        .await?;

        let stages = graph
            .nodes
            .values()
            .map(|node| {
                (
                    node.name.clone(),
                    StageRecord::new(inner.config.ceiling_for(node, &task.overrides)),
                )
            })
            .collect();
        let mut run = Run {
            id: run_id.clone(),
            template: task.template.clone(),
            graph_id: graph.id.clone(),
            state: RunState::Pending,
            overrides: task.overrides.clone(),
            requirement_ref: Some(requirement_ref.clone()),
            stages,
            frontier: BTreeMap::new(),
            pending_inputs: BTreeMap::new(),
            context: BTreeMap::from([
                ("artifacts".to_string(), json!([requirement_ref.uri()])),
                ("feedback".to_string(), json!([])),
            ]),
            last_wave: Vec::new(),
            last_payload: None,
            failure: None,
            started_at: timestamp_now(),
            finished_at: None,
        };
        run.enqueue(&graph.start, TASK_SOURCE, task.requirement.clone());

        let handle = Arc::new(RunHandle {
            graph,
            requirement: task.requirement,
            cancel: CancellationToken::new(),
            driver: tokio::sync::Mutex::new(()),
            persist: tokio::sync::Mutex::new(()),
            run: Mutex::new(run),
        });
        inner
            .runs
            .lock()
            .map_err(|_| FactoryError::Runtime("run table lock poisoned".to_string()))?
            .insert(run_id.clone(), Arc::clone(&handle));

        tracing::info!(run_id = %run_id, template = %task.template, "run submitted");
        inner
            .events
            .publish(RuntimeEventKind::Run(RunEvent::Submitted {
                run_id: run_id.clone(),
                template: task.template,
            }));
        self.persist(&handle).await?;
        Ok(run_id)
    }

    /// Moves the run forward by one step: resolves answered inputs, then
    /// dispatches and evaluates the next wave of ready stages.
    pub async fn advance(&self, run_id: &str) -> Result<RunStatusReport, FactoryError> {
        let Some(handle) = self.handle(run_id)? else {
            return self.archived_status(run_id).await;
        };
        let _driver = handle.driver.lock().await;

        let plan = handle.with_run(|run| self.plan_wave(&handle.graph, run))??;
        let jobs = match plan {
            Plan::Unchanged => return self.status_of(&handle),
            Plan::Settled => return self.persist(&handle).await,
            Plan::Dispatch(jobs) => jobs,
        };

        let mut results = futures::future::join_all(
            jobs.into_iter()
                .map(|job| self.execute_stage(run_id, &handle, job)),
        )
        .await;
        results.sort_by(|left, right| left.stage.cmp(&right.stage));

        let applied = handle.with_run(|run| -> Result<bool, FactoryError> {
            if run.state == RunState::Aborted {
                tracing::info!(run_id = %run.id, "discarding stage results of aborted run");
                return Ok(false);
            }
            self.transition(run, RunState::Evaluating);
            for result in results {
                self.evaluate(run, &handle.graph, result)?;
            }
            self.settle(run);
            Ok(true)
        })??;

        if applied {
            self.persist(&handle).await
        } else {
            self.status_of(&handle)
        }
    }

    /// Advances until the run is terminal or waiting on a human.
    pub async fn run_until_settled(&self, run_id: &str) -> Result<RunStatusReport, FactoryError> {
        loop {
            let report = self.advance(run_id).await?;
            if report.status.is_terminal() || report.state == RunState::AwaitingInput {
                return Ok(report);
            }
        }
    }

    pub fn spawn_driver(&self, run_id: &str) -> JoinHandle<Result<RunStatusReport, FactoryError>> {
        let engine = self.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move { engine.run_until_settled(&run_id).await })
    }

    /// Aborts a non-terminal run. In-flight work is signalled to stop and its
    /// results are discarded. Cancelling an aborted run again is a no-op.
    pub async fn cancel(&self, run_id: &str) -> Result<RunStatusReport, FactoryError> {
        let Some(handle) = self.handle(run_id)? else {
            let run = self.archived_run(run_id).await?;
            return match run.state {
                RunState::Aborted => Ok(run.status_report()),
                state => Err(FactoryError::InvalidTransition(format!(
                    "run '{run_id}' already {}",
                    state.as_str()
                ))),
            };
        };

        let changed = handle.with_run(|run| match run.state {
            RunState::Aborted => Ok(false),
            RunState::Succeeded | RunState::Failed => Err(FactoryError::InvalidTransition(format!(
                "run '{}' already {}",
                run.id,
                run.state.as_str()
            ))),
            _ => {
                record_failure(
                    run,
                    FailureReason::new(FailureKind::Cancelled, "run cancelled by request"),
                );
                self.finish(run, RunState::Aborted);
                Ok(true)
            }
        })??;
        handle.cancel.cancel();

        if changed {
            self.persist(&handle).await
        } else {
            self.status_of(&handle)
        }
    }

    pub async fn status(&self, run_id: &str) -> Result<RunStatusReport, FactoryError> {
        match self.handle(run_id)? {
            Some(handle) => self.status_of(&handle),
            None => self.archived_status(run_id).await,
        }
    }

    pub async fn run(&self, run_id: &str) -> Result<Run, FactoryError> {
        match self.handle(run_id)? {
            Some(handle) => handle.with_run(|run| run.clone()),
            None => self.archived_run(run_id).await,
        }
    }

    pub async fn attempts(&self, run_id: &str, stage: &str) -> Result<Vec<Attempt>, FactoryError> {
        Ok(self.run(run_id).await?.attempts(stage).to_vec())
    }

    pub fn pending_input(&self, pending_id: &str) -> Result<Option<PendingInputInfo>, FactoryError> {
        self.inner.gate.info(pending_id)
    }

    /// Resolves a pending input and, when the answer is accepted, advances its
    /// run. Late answers (expired, withdrawn, already resolved) are ignored.
    pub async fn resolve_input(
        &self,
        pending_id: &str,
        resolution: Resolution,
    ) -> Result<ResolveOutcome, FactoryError> {
        let outcome = self.inner.gate.resolve(pending_id, resolution)?;
        if outcome == ResolveOutcome::Accepted {
            if let Some(run_id) = self.inner.gate.run_of(pending_id)? {
                self.advance(&run_id).await?;
            }
        }
        Ok(outcome)
    }

    fn handle(&self, run_id: &str) -> Result<Option<Arc<RunHandle>>, FactoryError> {
        Ok(self
            .inner
            .runs
            .lock()
            .map_err(|_| FactoryError::Runtime("run table lock poisoned".to_string()))?
            .get(run_id)
            .cloned())
    }

    fn status_of(&self, handle: &RunHandle) -> Result<RunStatusReport, FactoryError> {
        handle.with_run(|run| run.status_report())
    }

    async fn archived_status(&self, run_id: &str) -> Result<RunStatusReport, FactoryError> {
        Ok(self.archived_run(run_id).await?.status_report())
    }

    /// Runs leave the in-memory table once archived; the store answers for them.
    async fn archived_run(&self, run_id: &str) -> Result<Run, FactoryError> {
        match self.inner.store.load(run_id).await? {
            Some(snapshot) => Ok(snapshot.run),
            None => Err(FactoryError::UnknownRun(run_id.to_string())),
        }
    }

    async fn persist(&self, handle: &Arc<RunHandle>) -> Result<RunStatusReport, FactoryError> {
        let _guard = handle.persist.lock().await;
        let (snapshot, report) = handle.with_run(|run| {
            (
                RunSnapshot {
                    run: run.clone(),
                    saved_at: timestamp_now(),
                },
                run.status_report(),
            )
        })?;
        self.inner.store.save(&snapshot).await?;
        if snapshot.run.state.is_terminal() {
            self.inner.store.archive(&snapshot).await?;
            self.evict(&snapshot.run.id, handle)?;
        }
        Ok(report)
    }

    fn evict(&self, run_id: &str, handle: &Arc<RunHandle>) -> Result<(), FactoryError> {
        let mut runs = self
            .inner
            .runs
            .lock()
            .map_err(|_| FactoryError::Runtime("run table lock poisoned".to_string()))?;
        if runs
            .get(run_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            runs.remove(run_id);
            tracing::debug!(run_id, "archived run released");
        }
        Ok(())
    }

    fn check_task(&self, graph: &StageGraph, task: &TaskDescriptor) -> Result<(), FactoryError> {
        let inner = &self.inner;
        if task.overrides.stage_timeout_ms == Some(0) {
            return Err(FactoryError::Configuration(
                "stage timeout override must be positive".to_string(),
            ));
        }
        for stage in task.overrides.stage_max_refinements.keys() {
            if graph.node(stage).is_none() {
                return Err(FactoryError::Configuration(format!(
                    "refinement override names unknown stage '{stage}'"
                )));
            }
        }
        for node in graph.nodes.values() {
            if !inner.roles.contains(&node.role) {
                return Err(FactoryError::Configuration(format!(
                    "stage '{}' uses role '{}' with no registered executor",
                    node.name, node.role
                )));
            }
            for tool in &node.tools {
                if !inner.gateway.has_tool(tool) {
                    return Err(FactoryError::Configuration(format!(
                        "stage '{}' uses unknown tool '{tool}'",
                        node.name
                    )));
                }
                if !inner.gateway.permits(&node.role, tool) {
                    return Err(FactoryError::Configuration(format!(
                        "role '{}' of stage '{}' may not invoke tool '{tool}'",
                        node.role, node.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn plan_wave(&self, graph: &StageGraph, run: &mut Run) -> Result<Plan, FactoryError> {
        if run.state.is_terminal() {
            return Ok(Plan::Unchanged);
        }

        if !run.pending_inputs.is_empty() {
            self.poll_pending(run, graph)?;
            if run.failure.is_some() || !run.pending_inputs.is_empty() {
                self.settle(run);
                return Ok(Plan::Settled);
            }
            self.transition(run, RunState::Pending);
        }

        if run.frontier.is_empty() {
            self.settle(run);
            return Ok(Plan::Settled);
        }

        let ready = ready_stages(run, graph);
        if ready.is_empty() {
            let queued: Vec<&str> = run.frontier.keys().map(String::as_str).collect();
            let reason = FailureReason::new(
                FailureKind::Configuration,
                format!("no dispatchable stage among queued [{}]", queued.join(", ")),
            );
            record_failure(run, reason);
            self.settle(run);
            return Ok(Plan::Settled);
        }

        let mut executors = Vec::with_capacity(ready.len());
        for name in &ready {
            let node = graph
                .node(name)
                .ok_or_else(|| FactoryError::Runtime(format!("queued stage '{name}' is not in the graph")))?;
            let record = run
                .stages
                .get(name)
                .ok_or_else(|| FactoryError::Runtime(format!("no record for stage '{name}'")))?;
            if let Err(reason) =
                self.inner
                    .controller
                    .admit_reentry(name, &record.counter, record.attempt_count())
            {
                tracing::warn!(run_id = %run.id, stage = %name, "stage re-entry refused: refinement budget exhausted");
                record_failure(run, reason);
                self.settle(run);
                return Ok(Plan::Settled);
            }
            let executor = self.inner.roles.resolve(&node.role).ok_or_else(|| {
                FactoryError::Configuration(format!("no executor registered for role '{}'", node.role))
            })?;
            executors.push((node.clone(), executor));
        }

        let context = run.context.clone();
        let artifact_refs = artifact_refs(run);
        let mut jobs = Vec::with_capacity(executors.len());
        for (node, executor) in executors {
            let inbound = run.frontier.remove(&node.name).unwrap_or_default();
            let timeout = self.inner.config.stage_timeout_for(&node, &run.overrides);
            let Some(record) = run.stages.get_mut(&node.name) else {
                continue;
            };
            record.state = StageState::Active;
            let attempt = record.attempt_count() + 1;

            tracing::info!(run_id = %run.id, stage = %node.name, role = %node.role, attempt, "stage dispatched");
            self.inner
                .events
                .publish(RuntimeEventKind::Stage(StageEvent::Dispatched {
                    run_id: run.id.clone(),
                    stage: node.name.clone(),
                    role: node.role.to_string(),
                    attempt,
                }));
            jobs.push(StageJob {
                stage: node,
                attempt,
                previous_payload: merge_inbound(inbound),
                context: context.clone(),
                artifact_refs: artifact_refs.clone(),
                executor,
                timeout,
            });
        }
        run.last_wave = ready;
        self.transition(run, RunState::Dispatched);
        Ok(Plan::Dispatch(jobs))
    }

    async fn execute_stage(&self, run_id: &str, handle: &RunHandle, job: StageJob) -> StageResult {
        let inner = &self.inner;
        let StageJob {
            stage,
            attempt,
            previous_payload,
            context,
            artifact_refs,
            executor,
            timeout,
        } = job;
        let started_at = timestamp_now();
        let started = Instant::now();
        let name = stage.name.clone();

        let input_ref = match previous_payload.as_ref() {
            Some(payload) => {
                let key = ArtifactKey::attempt(run_id, &name, attempt, "input.json");
                match put_json(inner.artifacts.as_ref(), &key, payload).await {
                    Ok(reference) => Some(reference),
                    Err(error) => {
                        return StageResult {
                            stage: name.clone(),
                            attempt,
                            outcome: Outcome::fail(
                                FailureKind::Infrastructure,
                                error.to_string(),
                                json!({"stage": name}),
                            ),
                            input_ref: None,
                            payload_ref: None,
                            started_at,
                            duration_ms: started.elapsed().as_millis() as u64,
                        };
                    }
                }
            }
            None => None,
        };

        let cancel = handle.cancel.child_token();
        let token = CapabilityToken {
            run_id: run_id.to_string(),
            stage: name.clone(),
            role: stage.role.clone(),
            attempt,
        };
        let stage_context = StageContext {
            run_id: run_id.to_string(),
            stage,
            attempt,
            requirement: handle.requirement.clone(),
            context,
            previous_payload,
            artifact_refs,
            artifacts: Arc::clone(&inner.artifacts),
            tools: ToolSession::new(inner.gateway.clone(), token, cancel.clone()),
            cancel: cancel.clone(),
        };

        let mut outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::fail(
                FailureKind::Cancelled,
                "run cancelled while stage was in flight",
                json!({"stage": name}),
            ),
            result = tokio::time::timeout(timeout, executor.execute(&stage_context)) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(error)) => Outcome::fail(
                    FailureKind::Infrastructure,
                    error.to_string(),
                    json!({"stage": name}),
                ),
                Err(_) => Outcome::fail(
                    FailureKind::Timeout,
                    format!("stage exceeded its {}ms timeout", timeout.as_millis()),
                    json!({"stage": name}),
                ),
            },
        };
        let records = stage_context.tools.records();
        if records.len() > outcome.tool_calls.len() {
            outcome.tool_calls = records;
        }

        let key = ArtifactKey::attempt(run_id, &name, attempt, "payload.json");
        let stored = if cancel.is_cancelled() {
            Ok(None)
        } else {
            put_json(inner.artifacts.as_ref(), &key, &outcome.payload)
                .await
                .map(Some)
        };
        let payload_ref = match stored {
            Ok(reference) => reference,
            Err(error) => {
                tracing::warn!(run_id, stage = %name, attempt, error = %error, "failed to store stage payload");
                let calls = std::mem::take(&mut outcome.tool_calls);
                outcome = Outcome::fail(
                    FailureKind::Infrastructure,
                    error.to_string(),
                    outcome.payload,
                )
                .with_tool_calls(calls);
                None
            }
        };

        StageResult {
            stage: name,
            attempt,
            outcome,
            input_ref,
            payload_ref,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn evaluate(&self, run: &mut Run, graph: &StageGraph, result: StageResult) -> Result<(), FactoryError> {
        let StageResult {
            stage,
            attempt,
            outcome,
            input_ref,
            payload_ref,
            started_at,
            duration_ms,
        } = result;
        let node = graph
            .node(&stage)
            .ok_or_else(|| FactoryError::Runtime(format!("unknown stage '{stage}'")))?;
        let class = outcome.class;
        let events = &self.inner.events;

        tracing::info!(run_id = %run.id, stage = %stage, attempt, outcome = class.as_str(), duration_ms, "stage attempt completed");
        events.publish(RuntimeEventKind::Stage(StageEvent::Completed {
            run_id: run.id.clone(),
            stage: stage.clone(),
            attempt,
            outcome: class.as_str().to_string(),
            duration_ms,
        }));
        for call in &outcome.tool_calls {
            events.publish(RuntimeEventKind::Tool(ToolEvent::Invoked {
                run_id: run.id.clone(),
                stage: stage.clone(),
                attempt,
                tool: call.tool_name.clone(),
                sandbox_id: call.sandbox_id.clone(),
                succeeded: call.succeeded(),
                duration_ms: call.duration_ms,
            }));
        }

        if let Some(reference) = payload_ref.as_ref() {
            push_context(run, "artifacts", json!(reference.uri()));
        }
        run.last_payload = Some(outcome.payload.clone());
        let failure = outcome
            .failure_kind()
            .map(|kind| FailureReason::new(kind, outcome.failure_message()).at_stage(&stage));

        let record = run
            .stages
            .get_mut(&stage)
            .ok_or_else(|| FactoryError::Runtime(format!("no record for stage '{stage}'")))?;
        record.attempts.push(Attempt {
            number: attempt,
            input_ref,
            class,
            payload: outcome.payload.clone(),
            payload_ref,
            failure: failure.clone(),
            tool_calls: outcome.tool_calls.clone(),
            started_at,
            duration_ms,
            resolution: None,
        });

        match class {
            OutcomeClass::Pass => {
                record.state = StageState::Passed;
                for next in &node.successors.pass {
                    run.enqueue(next, &stage, outcome.payload.clone());
                }
            }
            OutcomeClass::NeedsInput => {
                let max_rounds = self.inner.config.max_clarification_rounds;
                if record.clarification_rounds >= max_rounds {
                    record.state = StageState::Failed;
                    record_failure(
                        run,
                        FailureReason::new(
                            FailureKind::ClarificationLimit,
                            format!("stage asked for human input more than {max_rounds} time(s)"),
                        )
                        .at_stage(&stage),
                    );
                    return Ok(());
                }
                record.clarification_rounds += 1;
                record.state = StageState::Awaiting;

                let question = outcome
                    .question
                    .clone()
                    .or_else(|| node.question().map(|question| json!(question)))
                    .unwrap_or_else(|| json!({"stage": stage, "payload": outcome.payload}));
                let deadline = self.inner.config.hitl_deadline(&run.overrides);
                let pending_id =
                    self.inner
                        .gate
                        .request_input(&run.id, &stage, question.clone(), deadline)?;
                events.publish(RuntimeEventKind::Input(InputEvent::Requested {
                    run_id: run.id.clone(),
                    stage: stage.clone(),
                    pending_id: pending_id.clone(),
                    question: question.clone(),
                    deadline_ms: deadline.as_millis() as u64,
                }));
                run.pending_inputs.insert(
                    pending_id.clone(),
                    PendingInputRecord {
                        id: pending_id,
                        stage,
                        attempt,
                        question,
                        requested_at: timestamp_now(),
                        deadline_ms: deadline.as_millis() as u64,
                    },
                );
            }
            OutcomeClass::Fail => {
                record.state = StageState::Failed;
                let decision = self
                    .inner
                    .controller
                    .should_retry(&stage, &record.counter, &outcome);
                let remaining = record.counter.remaining();

                let kind = outcome.failure_kind().unwrap_or(FailureKind::RoleFailure);
                push_context(
                    run,
                    "feedback",
                    json!({
                        "stage": stage,
                        "attempt": attempt,
                        "kind": kind.as_str(),
                        "message": outcome.failure_message(),
                    }),
                );

                match decision {
                    RetryDecision::Retry => {
                        let target = node.remediation_target().to_string();
                        tracing::info!(run_id = %run.id, stage = %stage, attempt, next_stage = %target, remaining, kind = kind.as_str(), "stage failed; retrying");
                        events.publish(RuntimeEventKind::Stage(StageEvent::Retrying {
                            run_id: run.id.clone(),
                            stage: stage.clone(),
                            attempt,
                            next_stage: target.clone(),
                            remaining,
                        }));
                        run.enqueue(&target, &stage, outcome.payload.clone());
                    }
                    RetryDecision::Advance => {}
                    RetryDecision::Terminate(reason) => {
                        tracing::warn!(run_id = %run.id, stage = %stage, attempt, reason = %reason, "stage failure is terminal");
                        record_failure(run, reason);
                    }
                }
            }
        }
        Ok(())
    }

    fn poll_pending(&self, run: &mut Run, graph: &StageGraph) -> Result<(), FactoryError> {
        let pending: Vec<PendingInputRecord> = run.pending_inputs.values().cloned().collect();
        for record in pending {
            // An earlier answer in this pass may have finished the run.
            if !run.pending_inputs.contains_key(&record.id) {
                continue;
            }
            match self.inner.gate.take(&record.id)? {
                PollState::Pending => {}
                PollState::Resolved(resolution) => {
                    self.apply_resolution(run, graph, record, resolution, false)?;
                }
                PollState::Expired => {
                    let resolution = match self.inner.config.hitl_expiry {
                        HitlExpiryPolicy::Reject => Resolution::reject(),
                        HitlExpiryPolicy::ApproveLastPayload => Resolution::approve(),
                    };
                    self.apply_resolution(run, graph, record, resolution, true)?;
                }
            }
        }
        Ok(())
    }

    fn apply_resolution(
        &self,
        run: &mut Run,
        graph: &StageGraph,
        pending: PendingInputRecord,
        resolution: Resolution,
        expired: bool,
    ) -> Result<(), FactoryError> {
        let stage = pending.stage;
        let node = graph
            .node(&stage)
            .ok_or_else(|| FactoryError::Runtime(format!("unknown stage '{stage}'")))?;
        run.pending_inputs.remove(&pending.id);

        tracing::info!(run_id = %run.id, stage = %stage, pending_id = %pending.id, decision = resolution.decision.as_str(), expired, "pending input settled");
        let event = if expired {
            InputEvent::Expired {
                run_id: run.id.clone(),
                pending_id: pending.id.clone(),
            }
        } else {
            InputEvent::Resolved {
                run_id: run.id.clone(),
                pending_id: pending.id.clone(),
                decision: resolution.decision.as_str().to_string(),
            }
        };
        self.inner.events.publish(RuntimeEventKind::Input(event));

        let record = run
            .stages
            .get_mut(&stage)
            .ok_or_else(|| FactoryError::Runtime(format!("no record for stage '{stage}'")))?;
        let payload = record
            .attempts
            .iter_mut()
            .find(|attempt| attempt.number == pending.attempt)
            .map(|attempt| {
                attempt.resolution = Some(resolution.clone());
                attempt.payload.clone()
            })
            .unwrap_or(Value::Null);

        match resolution.decision {
            Decision::Reject => {
                record.state = StageState::Failed;
                record_failure(
                    run,
                    FailureReason::new(
                        FailureKind::InputRejected,
                        format!("pending input '{}' was rejected", pending.id),
                    )
                    .at_stage(&stage),
                );
            }
            Decision::Approve | Decision::Modify => {
                record.state = StageState::Passed;
                let inbound = match (resolution.decision, resolution.clarification) {
                    (Decision::Modify, Some(clarification)) => {
                        run.context
                            .insert(format!("clarification.{stage}"), clarification.clone());
                        clarification
                    }
                    _ => payload,
                };
                let targets = match node.successors.needs_input.as_ref() {
                    Some(target) => vec![target.clone()],
                    None => node.successors.pass.clone(),
                };
                for target in targets {
                    run.enqueue(&target, &stage, inbound.clone());
                }
            }
        }
        Ok(())
    }

    /// Picks the state a run rests in after a wave or a resolution.
    fn settle(&self, run: &mut Run) {
        if run.failure.is_some() {
            self.finish(run, RunState::Failed);
        } else if !run.pending_inputs.is_empty() {
            self.transition(run, RunState::AwaitingInput);
        } else if !run.frontier.is_empty() {
            self.transition(run, RunState::Pending);
        } else if let Some(stage) = unpassed_stage(run) {
            record_failure(
                run,
                FailureReason::new(
                    FailureKind::RoleFailure,
                    "run ended without a passing attempt for this stage",
                )
                .at_stage(stage),
            );
            self.finish(run, RunState::Failed);
        } else {
            self.finish(run, RunState::Succeeded);
        }
    }

    fn finish(&self, run: &mut Run, state: RunState) {
        for pending_id in run.pending_inputs.keys() {
            if let Err(error) = self.inner.gate.withdraw(pending_id) {
                tracing::warn!(run_id = %run.id, pending_id = %pending_id, error = %error, "failed to withdraw pending input");
            }
        }
        run.pending_inputs.clear();
        run.frontier.clear();
        self.transition(run, state);
    }

    fn transition(&self, run: &mut Run, to: RunState) {
        let from = run.state;
        if from == to {
            return;
        }
        run.state = to;
        tracing::debug!(run_id = %run.id, from = from.as_str(), to = to.as_str(), "run state changed");
        let events = &self.inner.events;
        events.publish(RuntimeEventKind::Run(RunEvent::StateChanged {
            run_id: run.id.clone(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        }));
        if !to.is_terminal() {
            return;
        }

        run.finished_at = Some(timestamp_now());
        let run_id = run.id.clone();
        match to {
            RunState::Succeeded => {
                tracing::info!(run_id = %run_id, "run succeeded");
                events.publish(RuntimeEventKind::Run(RunEvent::Succeeded { run_id }));
            }
            RunState::Aborted => {
                tracing::info!(run_id = %run_id, "run aborted");
                events.publish(RuntimeEventKind::Run(RunEvent::Aborted { run_id }));
            }
            _ => {
                let reason = run
                    .failure
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                tracing::warn!(run_id = %run_id, reason = %reason, "run failed");
                events.publish(RuntimeEventKind::Run(RunEvent::Failed { run_id, reason }));
            }
        }
    }
}

/// Frontier stages that may dispatch now. A stage waits while any pass
/// predecessor is failed or still in flight, or while other queued or busy
/// work can still reach one of its predecessors.
fn ready_stages(run: &Run, graph: &StageGraph) -> Vec<String> {
    let busy: Vec<&str> = run
        .frontier
        .keys()
        .map(String::as_str)
        .chain(run.pending_inputs.values().map(|pending| pending.stage.as_str()))
        .chain(
            run.stages
                .iter()
                .filter(|(_, record)| record.state == StageState::Active)
                .map(|(name, _)| name.as_str()),
        )
        .collect();

    run.frontier
        .keys()
        .filter(|name| {
            let Some(node) = graph.node(name) else {
                return false;
            };
            node.predecessors.iter().all(|predecessor| {
                let settled = !matches!(
                    run.stage_state(predecessor),
                    StageState::Failed | StageState::Active | StageState::Awaiting
                );
                settled
                    && !busy
                        .iter()
                        .any(|other| *other != name.as_str() && graph.reaches(other, predecessor))
            })
        })
        .cloned()
        .collect()
}

/// One inbound payload is passed as is; several are keyed by source stage.
fn merge_inbound(mut inbound: BTreeMap<String, Value>) -> Option<Value> {
    match inbound.len() {
        0 => None,
        1 => inbound.pop_first().map(|(_, payload)| payload),
        _ => Some(Value::Object(inbound.into_iter().collect())),
    }
}

fn artifact_refs(run: &Run) -> Vec<ArtifactRef> {
    run.requirement_ref
        .iter()
        .cloned()
        .chain(run.stages.values().flat_map(|record| {
            record
                .attempts
                .iter()
                .flat_map(|attempt| attempt.input_ref.iter().chain(attempt.payload_ref.iter()))
                .cloned()
        }))
        .collect()
}

fn unpassed_stage(run: &Run) -> Option<String> {
    run.stages
        .iter()
        .find(|(_, record)| {
            record
                .last_attempt()
                .is_some_and(|attempt| attempt.effective_class() != OutcomeClass::Pass)
        })
        .map(|(name, _)| name.clone())
}

/// First failure wins; later ones are only logged.
fn record_failure(run: &mut Run, reason: FailureReason) {
    if run.failure.is_none() {
        run.failure = Some(reason);
    } else {
        tracing::debug!(run_id = %run.id, reason = %reason, "additional failure after run already failed");
    }
}

fn push_context(run: &mut Run, key: &str, value: Value) {
    let entry = run
        .context
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    match entry {
        Value::Array(items) => items.push(value),
        other => *other = Value::Array(vec![value]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigOverrides, parse_dot};

    fn graph(source: &str) -> StageGraph {
        StageGraph::compile(&parse_dot(source).expect("parse"), &[]).expect("compile")
    }

    fn run_for(graph: &StageGraph) -> Run {
        Run {
            id: "run-1".to_string(),
            template: "t".to_string(),
            graph_id: graph.id.clone(),
            state: RunState::Pending,
            overrides: ConfigOverrides::default(),
            requirement_ref: None,
            stages: graph
                .nodes
                .keys()
                .map(|name| (name.clone(), StageRecord::new(2)))
                .collect(),
            frontier: BTreeMap::new(),
            pending_inputs: BTreeMap::new(),
            context: BTreeMap::new(),
            last_wave: Vec::new(),
            last_payload: None,
            failure: None,
            started_at: "0.000Z".to_string(),
            finished_at: None,
        }
    }

    const DIAMOND: &str = r#"digraph G {
        p [role="planner"] t [role="tester"] s [role="validator"]
        c [role="validator"] j [role="critic"] r [role="developer"]
        p -> t
        t -> s
        t -> c
        s -> j
        c -> j
        s -> r [outcome="fail"]
        r -> t
    }"#;

    #[test]
    fn ready_stages_join_with_branch_still_queued_expected_join_waits() {
        let graph = graph(DIAMOND);
        let mut run = run_for(&graph);
        run.enqueue("s", "t", json!(1));
        run.enqueue("j", "c", json!(2));
        assert_eq!(ready_stages(&run, &graph), vec!["s"]);

        run.frontier.remove("s");
        run.stages.get_mut("s").expect("s").state = StageState::Passed;
        run.enqueue("j", "s", json!(3));
        assert_eq!(ready_stages(&run, &graph), vec!["j"]);
    }

    #[test]
    fn ready_stages_failed_branch_under_remediation_expected_join_waits() {
        let graph = graph(DIAMOND);
        let mut run = run_for(&graph);
        run.stages.get_mut("s").expect("s").state = StageState::Failed;
        run.stages.get_mut("c").expect("c").state = StageState::Passed;
        run.enqueue("j", "c", json!(2));
        run.enqueue("r", "s", json!("fix"));
        assert_eq!(ready_stages(&run, &graph), vec!["r"]);
    }

    #[test]
    fn merge_inbound_several_sources_expected_object_keyed_by_source() {
        assert_eq!(merge_inbound(BTreeMap::new()), None);
        assert_eq!(
            merge_inbound(BTreeMap::from([("a".to_string(), json!(1))])),
            Some(json!(1))
        );
        assert_eq!(
            merge_inbound(BTreeMap::from([
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
            ])),
            Some(json!({"a": 1, "b": 2}))
        );
    }

    #[test]
    fn push_context_non_list_value_expected_replaced_with_list() {
        let graph = graph(DIAMOND);
        let mut run = run_for(&graph);
        run.context.insert("feedback".to_string(), json!("stale"));
        push_context(&mut run, "feedback", json!({"stage": "s"}));
        push_context(&mut run, "feedback", json!({"stage": "c"}));
        assert_eq!(run.context["feedback"], json!([{"stage": "s"}, {"stage": "c"}]));
    }
}

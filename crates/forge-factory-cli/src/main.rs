use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use forge_factory::{
    CommandTool, Diagnostic, FactoryConfig, FsArtifactStore, Graph, InputEvent, JsonFileRunStore,
    LintRule, PendingInputRecord, Resolution, RunEvent, RunStatus, RunStatusReport, RunStore,
    RuntimeEvent, RuntimeEventKind, RuntimeEventSink, SOFTWARE_FACTORY_TEMPLATE, StageEvent,
    TaskDescriptor, TemplateRegistry, ToolEvent, WorkflowEngine, parse_dot, runtime_event_channel,
    simulated_registry, validate,
};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "forge-factory")]
#[command(about = "In-process CLI host for the Forge software factory")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a requirement and drive the run until it settles.
    Run(RunArgs),
    /// Lint a DOT graph template without running it.
    Validate(ValidateArgs),
    /// List the built-in graph templates.
    Templates,
    /// Print the persisted status of a run.
    InspectRun(InspectRunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long, default_value = SOFTWARE_FACTORY_TEMPLATE, conflicts_with = "dot_file")]
    template: String,
    #[arg(long)]
    dot_file: Option<PathBuf>,
    #[arg(long, conflicts_with = "requirement_file")]
    requirement: Option<String>,
    #[arg(long)]
    requirement_file: Option<PathBuf>,
    #[arg(long, env = "FORGE_FACTORY_CONFIG")]
    config: Option<PathBuf>,
    /// Directory for artifacts and run snapshots; in-memory when absent.
    #[arg(long)]
    state_root: Option<PathBuf>,
    #[arg(long)]
    max_refinements: Option<u32>,
    #[arg(long)]
    hitl_deadline_ms: Option<u64>,
    /// External tool as `name=program [args...]`.
    #[arg(long = "tool")]
    tools: Vec<String>,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(long, value_enum, default_value_t = InputMode::Auto)]
    input: InputMode,
    /// Queued answer: `approve`, `reject` or `modify:<clarification>`.
    #[arg(long = "human-answer")]
    human_answers: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    #[arg(long)]
    dot_file: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct InspectRunArgs {
    #[arg(long)]
    state_root: PathBuf,
    #[arg(long)]
    run_id: String,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputMode {
    Auto,
    Console,
    Queue,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Validate(args) => validate_command(args),
        Commands::Templates => templates_command(),
        Commands::InspectRun(args) => inspect_run_command(args).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let config = match args.config.as_deref() {
        Some(path) => FactoryConfig::from_path(path).map_err(|error| error.to_string())?,
        None => FactoryConfig::default(),
    };
    let requirement = load_requirement(args.requirement.as_deref(), args.requirement_file.as_deref())?;
    let mut answers = args
        .human_answers
        .iter()
        .map(|answer| parse_answer(answer))
        .collect::<Result<VecDeque<_>, _>>()?;

    let roles = simulated_registry();
    let role_rule = RoleRegistered::new(roles.roles().iter().map(|role| role.as_str()));
    let mut templates = TemplateRegistry::with_builtin().map_err(|error| error.to_string())?;
    let template = match args.dot_file.as_deref() {
        Some(path) => templates
            .register_path(path, &[&role_rule])
            .map_err(|error| error.to_string())?,
        None => args.template,
    };

    let (event_sink, event_task) = event_stream(!args.no_stream_events, args.event_json);
    let mut builder = WorkflowEngine::builder(config)
        .templates(templates)
        .roles(roles)
        .events(event_sink);
    for definition in &args.tools {
        builder = builder.tool(Arc::new(parse_tool(definition)?));
    }
    if let Some(root) = args.state_root.as_deref() {
        builder = builder
            .artifact_store(Arc::new(FsArtifactStore::new(root.join("artifacts"))))
            .run_store(Arc::new(JsonFileRunStore::new(root.join("runs"))));
    }
    let engine = builder.build().map_err(|error| error.to_string())?;

    let mut task = TaskDescriptor::new(template, requirement);
    if let Some(max) = args.max_refinements {
        task = task.with_max_refinements(max);
    }
    if let Some(deadline) = args.hitl_deadline_ms {
        task = task.with_hitl_deadline(Duration::from_millis(deadline));
    }

    let run_id = engine.submit(task).await.map_err(|error| error.to_string())?;
    let interactive = match args.input {
        InputMode::Auto => is_interactive_terminal(),
        InputMode::Console => true,
        InputMode::Queue => false,
    };
    let report = loop {
        let report = engine
            .run_until_settled(&run_id)
            .await
            .map_err(|error| error.to_string())?;
        if report.status != RunStatus::AwaitingInput {
            break report;
        }
        for pending in &report.pending_inputs {
            let resolution = match answers.pop_front() {
                Some(resolution) => resolution,
                None if interactive => ask_console(pending).await?,
                None => {
                    tracing::warn!(pending_id = %pending.id, "no queued human answer; rejecting");
                    Resolution::reject()
                }
            };
            engine
                .resolve_input(&pending.id, resolution)
                .await
                .map_err(|error| error.to_string())?;
        }
    };

    // The event channel closes once the engine's sink is gone.
    drop(engine);
    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }

    print_run_summary(&report);
    Ok(exit_code_for_status(report.status))
}

fn validate_command(args: ValidateArgs) -> Result<ExitCode, String> {
    let source = std::fs::read_to_string(&args.dot_file)
        .map_err(|e| format!("failed reading DOT file '{}': {e}", args.dot_file.display()))?;
    let graph = parse_dot(&source).map_err(|error| error.to_string())?;
    let role_rule = RoleRegistered::new(simulated_registry().roles().iter().map(|role| role.as_str()));
    let diagnostics = validate(&graph, &[&role_rule]);

    if args.json {
        let json = serde_json::to_string_pretty(&diagnostics).map_err(|e| e.to_string())?;
        println!("{json}");
    } else if diagnostics.is_empty() {
        println!("{}: ok", args.dot_file.display());
    } else {
        for diagnostic in &diagnostics {
            println!("{diagnostic}");
        }
    }

    if diagnostics.iter().any(Diagnostic::is_error) {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

fn templates_command() -> Result<ExitCode, String> {
    let templates = TemplateRegistry::with_builtin().map_err(|error| error.to_string())?;
    for id in templates.ids() {
        let Some(graph) = templates.get(&id) else {
            continue;
        };
        let stages: Vec<&str> = graph.nodes.keys().map(String::as_str).collect();
        println!("{id}: {}", stages.join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

async fn inspect_run_command(args: InspectRunArgs) -> Result<ExitCode, String> {
    let store = JsonFileRunStore::new(args.state_root.join("runs"));
    let snapshot = store
        .load(&args.run_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no snapshot for run '{}'", args.run_id))?;
    let report = snapshot.run.status_report();
    if args.json {
        let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        println!("saved_at: {}", snapshot.saved_at);
        print_run_summary(&report);
    }
    Ok(ExitCode::SUCCESS)
}

/// Rejects templates naming a role this host has no executor for.
struct RoleRegistered {
    roles: BTreeSet<String>,
}

impl RoleRegistered {
    fn new<'a>(roles: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            roles: roles.into_iter().map(str::to_string).collect(),
        }
    }
}

impl LintRule for RoleRegistered {
    fn name(&self) -> &str {
        "role_registered"
    }

    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .nodes
            .values()
            .filter_map(|node| {
                let role = node.attrs.get_str("role")?.trim();
                if self.roles.contains(role) {
                    return None;
                }
                Some(
                    Diagnostic::error(
                        self.name(),
                        format!("role '{role}' has no executor in this host"),
                    )
                    .with_stage(node.id.clone())
                    .with_hint(format!(
                        "registered roles: {}",
                        self.roles.iter().cloned().collect::<Vec<_>>().join(", ")
                    )),
                )
            })
            .collect()
    }
}

fn load_requirement(text: Option<&str>, file: Option<&Path>) -> Result<Value, String> {
    let raw = match (text, file) {
        (Some(text), None) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed reading requirement file '{}': {e}", path.display()))?,
        (None, None) => {
            return Err("one of --requirement or --requirement-file is required".to_string());
        }
        (Some(_), Some(_)) => {
            return Err("provide only one of --requirement or --requirement-file".to_string());
        }
    };
    Ok(parse_json_or_text(&raw))
}

fn parse_json_or_text(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.trim().to_string()))
}

fn parse_answer(answer: &str) -> Result<Resolution, String> {
    let trimmed = answer.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "approve" | "a" | "yes" | "y" => return Ok(Resolution::approve()),
        "reject" | "r" | "no" | "n" => return Ok(Resolution::reject()),
        _ => {}
    }
    match trimmed.split_once(':') {
        Some((verb, clarification)) if verb.eq_ignore_ascii_case("modify") => {
            Ok(Resolution::modify(parse_json_or_text(clarification)))
        }
        _ => Err(format!(
            "invalid human answer '{answer}'; expected approve, reject or modify:<text>"
        )),
    }
}

fn parse_tool(definition: &str) -> Result<CommandTool, String> {
    let (name, command) = definition
        .split_once('=')
        .ok_or_else(|| format!("invalid tool '{definition}'; expected name=program [args...]"))?;
    let mut words = command.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| format!("tool '{name}' has an empty command"))?;
    Ok(CommandTool::new(name.trim(), program).with_args(words))
}

async fn ask_console(pending: &PendingInputRecord) -> Result<Resolution, String> {
    eprintln!("[input] stage '{}' asks: {}", pending.stage, pending.question);
    eprintln!("[input] answer with approve, reject or modify:<clarification>");
    loop {
        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|read| (read, line))
        })
        .await
        .map_err(|error| error.to_string())?
        .map_err(|error| error.to_string())?;
        match line {
            // EOF
            (0, _) => return Ok(Resolution::reject()),
            (_, line) => match parse_answer(&line) {
                Ok(resolution) => return Ok(resolution),
                Err(error) => eprintln!("[input] {error}"),
            },
        }
    }
}

fn event_stream(
    stream_events: bool,
    event_json: bool,
) -> (RuntimeEventSink, Option<tokio::task::JoinHandle<()>>) {
    if !stream_events {
        return (RuntimeEventSink::default(), None);
    }

    let (tx, mut rx) = runtime_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (RuntimeEventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &RuntimeEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        describe_event(&event.kind)
    );
}

fn describe_event(kind: &RuntimeEventKind) -> String {
    match kind {
        RuntimeEventKind::Run(event) => match event {
            RunEvent::Submitted { template, .. } => format!("run submitted template={template}"),
            RunEvent::StateChanged { from, to, .. } => format!("run {from} -> {to}"),
            RunEvent::Succeeded { .. } => "run succeeded".to_string(),
            RunEvent::Failed { reason, .. } => format!("run failed: {reason}"),
            RunEvent::Aborted { .. } => "run aborted".to_string(),
        },
        RuntimeEventKind::Stage(event) => match event {
            StageEvent::Dispatched {
                stage,
                role,
                attempt,
                ..
            } => format!("stage {stage} dispatched role={role} attempt={attempt}"),
            StageEvent::Completed {
                stage,
                attempt,
                outcome,
                duration_ms,
                ..
            } => format!("stage {stage} attempt={attempt} {outcome} in {duration_ms}ms"),
            StageEvent::Retrying {
                stage,
                next_stage,
                remaining,
                ..
            } => format!("stage {stage} retrying via {next_stage} remaining={remaining}"),
        },
        RuntimeEventKind::Input(event) => match event {
            InputEvent::Requested {
                stage, pending_id, ..
            } => format!("input requested stage={stage} id={pending_id}"),
            InputEvent::Resolved {
                pending_id,
                decision,
                ..
            } => format!("input {pending_id} {decision}"),
            InputEvent::Expired { pending_id, .. } => format!("input {pending_id} expired"),
        },
        RuntimeEventKind::Tool(ToolEvent::Invoked {
            stage,
            tool,
            succeeded,
            duration_ms,
            ..
        }) => format!("tool {tool} stage={stage} succeeded={succeeded} in {duration_ms}ms"),
    }
}

fn print_run_summary(report: &RunStatusReport) {
    println!("run_id: {}", report.run_id);
    println!("template: {}", report.template);
    println!("status: {}", report.status.as_str());
    let attempts: Vec<String> = report
        .attempt_counts
        .iter()
        .map(|(stage, count)| format!("{stage}={count}"))
        .collect();
    println!("attempts: {}", attempts.join(", "));
    if let Some(reason) = report.reason.as_deref() {
        println!("failure_reason: {reason}");
    }
}

fn exit_code_for_status(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Failed | RunStatus::Aborted => ExitCode::from(2),
        RunStatus::Running | RunStatus::AwaitingInput => ExitCode::from(1),
    }
}

fn is_interactive_terminal() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_answer_modify_json_expected_structured_clarification() {
        let resolution = parse_answer(r#"modify:{"scope":"api"}"#).expect("answer");
        assert_eq!(resolution, Resolution::modify(json!({"scope": "api"})));
    }

    #[test]
    fn parse_answer_unknown_verb_expected_error() {
        assert!(parse_answer("maybe").is_err());
        assert_eq!(parse_answer(" Approve ").expect("answer"), Resolution::approve());
    }

    #[test]
    fn parse_tool_command_expected_program_and_args() {
        assert!(parse_tool("compile=cargo build --release").is_ok());
        assert!(parse_tool("compile=").is_err());
        assert!(parse_tool("compile").is_err());
    }

    #[test]
    fn role_registered_unknown_role_expected_error_diagnostic() {
        let graph = parse_dot(r#"digraph G { a [role="developer"] b [role="poet"] a -> b }"#)
            .expect("graph");
        let rule = RoleRegistered::new(["developer"]);
        let diagnostics = rule.apply(&graph);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].stage.as_deref(), Some("b"));
    }
}

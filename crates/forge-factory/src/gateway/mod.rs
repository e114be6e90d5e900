//! Tool invocation gateway: capability checks, sandboxed execution, hard
//! wall-clock limits, and an append-only record of every call.
//!
//! The gateway never retries. Every failure comes back as a typed
//! [`GatewayError`] so the engine can classify it.

mod sandbox;
mod tools;

pub use sandbox::*;
pub use tools::*;

use crate::{FailureKind, GatewayError, RoleType, events::timestamp_now};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Files staged into the sandbox working directory, keyed by relative path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
}

impl ToolRequest {
    pub fn with_args(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

impl ToolOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn exited(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            structured: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolCallResult {
    Success { output: ToolOutput },
    Failure { kind: FailureKind, error: GatewayError },
}

/// One invocation through the gateway. Never mutated after completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub request: ToolRequest,
    pub sandbox_id: String,
    pub result: ToolCallResult,
    pub started_at: String,
    pub duration_ms: u64,
}

impl ToolCallRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.result, ToolCallResult::Success { .. })
    }
}

/// Caller identity presented to the gateway; scoped to one attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub run_id: String,
    pub stage: String,
    pub role: RoleType,
    pub attempt: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolAllowlist {
    by_role: BTreeMap<RoleType, BTreeSet<String>>,
}

impl ToolAllowlist {
    pub fn new(by_role: BTreeMap<RoleType, BTreeSet<String>>) -> Self {
        Self { by_role }
    }

    pub fn permits(&self, role: &RoleType, tool: &str) -> bool {
        self.by_role
            .get(role)
            .is_some_and(|tools| tools.contains(tool))
    }

    pub fn tools_for(&self, role: &RoleType) -> BTreeSet<String> {
        self.by_role.get(role).cloned().unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct ToolGateway {
    registry: ToolRegistry,
    allowlist: Arc<ToolAllowlist>,
    sandbox: Arc<dyn Sandbox>,
    default_timeout: Duration,
}

impl ToolGateway {
    pub fn new(allowlist: ToolAllowlist) -> Self {
        Self {
            registry: ToolRegistry::default(),
            allowlist: Arc::new(allowlist),
            sandbox: Arc::new(ProcessSandbox::default()),
            default_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.registry.register(tool);
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.registry.register(tool);
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn permits(&self, role: &RoleType, tool: &str) -> bool {
        self.allowlist.permits(role, tool)
    }

    pub fn allowlist(&self) -> &ToolAllowlist {
        &self.allowlist
    }

    pub async fn invoke(
        &self,
        tool_name: &str,
        request: ToolRequest,
        caller: &CapabilityToken,
    ) -> Result<ToolOutput, GatewayError> {
        self.invoke_recorded(tool_name, request, caller, &CancellationToken::new())
            .await
            .1
    }

    /// Invokes a tool and returns the record alongside the result. Non-zero
    /// exit status is normalized to [`GatewayError::ExecutionFailure`].
    pub async fn invoke_recorded(
        &self,
        tool_name: &str,
        request: ToolRequest,
        caller: &CapabilityToken,
        cancel: &CancellationToken,
    ) -> (ToolCallRecord, Result<ToolOutput, GatewayError>) {
        let sandbox_id = uuid::Uuid::new_v4().to_string();
        let started_at = timestamp_now();
        let started = Instant::now();

        let result = self
            .execute(tool_name, &request, caller, &sandbox_id, cancel)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::info!(
                run_id = %caller.run_id,
                stage = %caller.stage,
                attempt = caller.attempt,
                tool = tool_name,
                sandbox_id = %sandbox_id,
                duration_ms,
                "tool call succeeded"
            ),
            Err(error) if error.failure_kind() == FailureKind::Infrastructure => tracing::warn!(
                run_id = %caller.run_id,
                stage = %caller.stage,
                attempt = caller.attempt,
                tool = tool_name,
                sandbox_id = %sandbox_id,
                request = ?request,
                duration_ms,
                error = %error,
                "tool call hit infrastructure failure"
            ),
            Err(error) => tracing::info!(
                run_id = %caller.run_id,
                stage = %caller.stage,
                attempt = caller.attempt,
                tool = tool_name,
                sandbox_id = %sandbox_id,
                duration_ms,
                error = %error,
                "tool call failed"
            ),
        }

        let record = ToolCallRecord {
            tool_name: tool_name.to_string(),
            request,
            sandbox_id,
            result: match &result {
                Ok(output) => ToolCallResult::Success {
                    output: output.clone(),
                },
                Err(error) => ToolCallResult::Failure {
                    kind: error.failure_kind(),
                    error: error.clone(),
                },
            },
            started_at,
            duration_ms,
        };
        (record, result)
    }

    async fn execute(
        &self,
        tool_name: &str,
        request: &ToolRequest,
        caller: &CapabilityToken,
        sandbox_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, GatewayError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| GatewayError::ToolNotFound {
                tool: tool_name.to_string(),
            })?;
        if !self.allowlist.permits(&caller.role, tool_name) {
            return Err(GatewayError::PermissionDenied {
                role: caller.role.to_string(),
                tool: tool_name.to_string(),
            });
        }
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let env = ToolEnv {
            sandbox: Arc::clone(&self.sandbox),
            sandbox_id: sandbox_id.to_string(),
        };
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            result = tokio::time::timeout(self.default_timeout, tool.invoke(request, &env)) => {
                result.map_err(|_| GatewayError::Timeout {
                    tool: tool_name.to_string(),
                    timeout_ms: self.default_timeout.as_millis() as u64,
                })??
            }
        };

        if output.exit_code != 0 {
            return Err(GatewayError::ExecutionFailure {
                tool: tool_name.to_string(),
                code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

/// Per-attempt view of the gateway handed to a role executor. Calls are
/// scoped to the attempt's capability token and recorded in invocation order.
#[derive(Clone)]
pub struct ToolSession {
    gateway: ToolGateway,
    token: CapabilityToken,
    cancel: CancellationToken,
    sequence: Arc<AtomicU64>,
    records: Arc<Mutex<Vec<(u64, ToolCallRecord)>>>,
}

impl ToolSession {
    pub fn new(gateway: ToolGateway, token: CapabilityToken, cancel: CancellationToken) -> Self {
        Self {
            gateway,
            token,
            cancel,
            sequence: Arc::new(AtomicU64::new(0)),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn token(&self) -> &CapabilityToken {
        &self.token
    }

    pub fn permits(&self, tool: &str) -> bool {
        self.gateway.permits(&self.token.role, tool)
    }

    pub async fn invoke(
        &self,
        tool_name: &str,
        request: ToolRequest,
    ) -> Result<ToolOutput, GatewayError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let (record, result) = self
            .gateway
            .invoke_recorded(tool_name, request, &self.token, &self.cancel)
            .await;
        if let Ok(mut records) = self.records.lock() {
            records.push((sequence, record));
        }
        result
    }

    /// Records ordered by invocation start.
    pub fn records(&self) -> Vec<ToolCallRecord> {
        let Ok(records) = self.records.lock() else {
            return Vec::new();
        };
        let mut ordered = records.clone();
        ordered.sort_by_key(|(sequence, _)| *sequence);
        ordered.into_iter().map(|(_, record)| record).collect()
    }
}

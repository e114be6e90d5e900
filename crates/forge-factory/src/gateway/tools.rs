use crate::{CommandSpec, GatewayError, Sandbox, ToolOutput, ToolRequest};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Everything a tool needs for one invocation besides its request.
#[derive(Clone)]
pub struct ToolEnv {
    pub sandbox: Arc<dyn Sandbox>,
    pub sandbox_id: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &ToolRequest, env: &ToolEnv) -> Result<ToolOutput, GatewayError>;
}

/// An external program run inside the gateway's sandbox.
#[derive(Clone, Debug)]
pub struct CommandTool {
    spec: CommandSpec,
    structured_stdout: bool,
}

impl CommandTool {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            spec: CommandSpec {
                tool: name.into(),
                program: program.into(),
                args: Vec::new(),
            },
            structured_stdout: false,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.spec.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Parse stdout as JSON into [`ToolOutput::structured`] when it is valid JSON.
    pub fn with_structured_stdout(mut self) -> Self {
        self.structured_stdout = true;
        self
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.spec.tool
    }

    async fn invoke(&self, request: &ToolRequest, env: &ToolEnv) -> Result<ToolOutput, GatewayError> {
        let mut output = env.sandbox.run(&self.spec, request, &env.sandbox_id).await?;
        if self.structured_stdout {
            output.structured = serde_json::from_str(output.stdout.trim()).ok();
        }
        Ok(output)
    }
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolOutput, GatewayError>> + Send>>;
pub type ToolFn = Arc<dyn Fn(ToolRequest) -> ToolFuture + Send + Sync>;

/// In-process tool backed by a closure; it does not enter the sandbox.
#[derive(Clone)]
pub struct FnTool {
    name: String,
    executor: ToolFn,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, executor: F) -> Self
    where
        F: Fn(ToolRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, GatewayError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            executor: Arc::new(move |request| Box::pin(executor(request))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &ToolRequest, _env: &ToolEnv) -> Result<ToolOutput, GatewayError> {
        (self.executor)(request.clone()).await
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

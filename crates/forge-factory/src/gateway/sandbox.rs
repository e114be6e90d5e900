//! Isolated execution boundary for external tool programs.

use crate::{GatewayError, ToolOutput, ToolRequest};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// An external program plus the fixed arguments a tool prepends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub tool: String,
    pub program: String,
    pub args: Vec<String>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Runs one invocation. Wall-clock limits and cancellation are applied by
    /// the gateway, which drops this future when either fires; implementations
    /// must release the process tree on drop.
    async fn run(
        &self,
        command: &CommandSpec,
        request: &ToolRequest,
        sandbox_id: &str,
    ) -> Result<ToolOutput, GatewayError>;
}

/// Runs each invocation as a child process in a fresh temporary directory
/// with a cleared environment and its own process group.
#[derive(Clone, Debug)]
pub struct ProcessSandbox {
    temp_root: Option<PathBuf>,
    env_passthrough: Vec<String>,
    max_output_bytes: usize,
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self {
            temp_root: None,
            env_passthrough: vec!["PATH".to_string()],
            max_output_bytes: 1_048_576,
        }
    }
}

impl ProcessSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    pub fn with_env_passthrough(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env_passthrough = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }

    fn workdir(&self, sandbox_id: &str) -> Result<tempfile::TempDir, GatewayError> {
        let prefix = format!("forge-factory-{sandbox_id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match self.temp_root.as_ref() {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|error| GatewayError::SandboxSetup(format!("temp dir: {error}")))
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn run(
        &self,
        command: &CommandSpec,
        request: &ToolRequest,
        sandbox_id: &str,
    ) -> Result<ToolOutput, GatewayError> {
        let workdir = self.workdir(sandbox_id)?;
        stage_files(workdir.path(), request).await?;

        let mut process = tokio::process::Command::new(&command.program);
        process
            .args(&command.args)
            .args(&request.args)
            .current_dir(workdir.path())
            .env_clear()
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &self.env_passthrough {
            if let Ok(value) = std::env::var(key) {
                process.env(key, value);
            }
        }
        process.envs(&request.env);
        #[cfg(unix)]
        process.process_group(0);

        let mut child = process.spawn().map_err(|error| {
            GatewayError::SandboxSetup(format!("failed to spawn '{}': {error}", command.program))
        })?;
        let _group = ProcessGroupGuard::new(child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::SandboxSetup("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::SandboxSetup("stderr was not captured".to_string()))?;
        let stdin = child.stdin.take();

        // Input is fed while both output pipes drain; a tool echoing its
        // input would otherwise stall on a full pipe.
        let feed = async {
            let (Some(input), Some(mut stdin)) = (request.stdin.as_deref(), stdin) else {
                return Ok(());
            };
            match stdin.write_all(input.as_bytes()).await {
                // The tool exited without reading its input.
                Err(error) if error.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                Err(error) => Err(GatewayError::SandboxSetup(format!("stdin: {error}"))),
                Ok(()) => Ok(()),
            }
        };
        let limit = self.max_output_bytes;
        let (fed, stdout, stderr, status) = tokio::join!(
            feed,
            read_capped(stdout, limit),
            read_capped(stderr, limit),
            child.wait(),
        );
        fed?;
        let stdout = stdout.map_err(|error| GatewayError::SandboxSetup(format!("stdout: {error}")))?;
        let stderr = stderr.map_err(|error| GatewayError::SandboxSetup(format!("stderr: {error}")))?;
        let status = status.map_err(|error| GatewayError::SandboxSetup(format!("wait: {error}")))?;

        Ok(ToolOutput {
            stdout: stdout.render(),
            stderr: stderr.render(),
            // -1 when terminated by a signal.
            exit_code: status.code().unwrap_or(-1),
            structured: None,
        })
    }
}

/// Kills the whole process group when the invocation future is dropped,
/// covering grandchildren that `kill_on_drop` alone would leave behind.
struct ProcessGroupGuard {
    #[cfg_attr(not(unix), allow(dead_code))]
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;
            // ESRCH once the group has exited on its own.
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
}

async fn stage_files(root: &Path, request: &ToolRequest) -> Result<(), GatewayError> {
    for (relative, contents) in &request.files {
        let relative = Path::new(relative);
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(GatewayError::SandboxSetup(format!(
                "file path '{}' escapes the sandbox",
                relative.display()
            )));
        }
        let target = root.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| GatewayError::SandboxSetup(format!("mkdir: {error}")))?;
        }
        tokio::fs::write(&target, contents.as_bytes())
            .await
            .map_err(|error| GatewayError::SandboxSetup(format!("write: {error}")))?;
    }
    Ok(())
}

/// Output kept up to the byte limit plus a count of what was discarded.
struct CappedOutput {
    kept: Vec<u8>,
    dropped: usize,
}

impl CappedOutput {
    fn render(mut self) -> String {
        // Never split a multi-byte character at the cut.
        if self.dropped > 0 {
            if let Err(error) = std::str::from_utf8(&self.kept) {
                if error.error_len().is_none() {
                    let valid = error.valid_up_to();
                    self.dropped += self.kept.len() - valid;
                    self.kept.truncate(valid);
                }
            }
        }
        let text = String::from_utf8_lossy(&self.kept);
        if self.dropped == 0 {
            return text.into_owned();
        }
        format!("{text}\n[truncated {} bytes]", self.dropped)
    }
}

/// Reads the stream to EOF, keeping at most `limit` bytes. The remainder is
/// drained and counted so the child never blocks on a full pipe.
async fn read_capped<R>(mut reader: R, limit: usize) -> std::io::Result<CappedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut dropped = 0;
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        let keep = limit.saturating_sub(kept.len()).min(read);
        kept.extend_from_slice(&chunk[..keep]);
        dropped += read - keep;
    }
    Ok(CappedOutput { kept, dropped })
}

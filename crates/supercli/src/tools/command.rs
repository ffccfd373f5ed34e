use std::process::Stdio;
use std::time::Duration;

use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;
use supercli_core::tool::{Error as ToolError, ErrorKind, Tool, ToolResult};
use tokio::process::Command;
use tokio::time::timeout;

use super::Workspace;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize, JsonSchema)]
pub struct RunCommandParameters {
    #[schemars(
        description = "The command line to run in the working directory."
    )]
    command: String,
}

/// Runs a command line through the platform shell.
pub struct RunCommandTool {
    workspace: Workspace,
    timeout: Duration,
    parameter_schema: Value,
}

impl RunCommandTool {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            parameter_schema: schema_for!(RunCommandParameters).to_value(),
        }
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Tool for RunCommandTool {
    type Input = RunCommandParameters;

    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        r#"
Runs a command line in the working directory, like using a terminal.
Output from stdout and stderr is returned along with the exit code. Commands that wait for input are not supported."#
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: RunCommandParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let root = self.workspace.root().to_owned();
        let limit = self.timeout;
        async move {
            if input.command.trim().is_empty() {
                return Err(ToolError::invalid_input()
                    .with_reason("`command` must not be empty"));
            }
            debug!("running `{}` in {}", input.command, root.display());

            let child = shell_command(&input.command)
                .current_dir(&root)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            let output = match timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    return Err(ToolError::timeout().with_reason(format!(
                        "`{}` did not finish within {}s",
                        input.command,
                        limit.as_secs_f32()
                    )));
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code();
            let text = format_output(&stdout, &stderr, code);
            if output.status.success() {
                Ok(text)
            } else {
                Err(ToolError::new(ErrorKind::NonZeroExit).with_reason(text))
            }
        }
    }
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn format_output(stdout: &str, stderr: &str, code: Option<i32>) -> String {
    let mut parts = vec![];
    if !stdout.trim().is_empty() {
        parts.push(stdout.trim_end().to_owned());
    }
    if !stderr.trim().is_empty() {
        parts.push(format!("[stderr]: {}", stderr.trim_end()));
    }
    match code {
        Some(0) => {}
        Some(code) => parts.push(format!("[exit code: {code}]")),
        // Killed by a signal.
        None => parts.push("[exit code: unknown]".to_owned()),
    }
    if parts.is_empty() {
        return "(command produced no output)".to_owned();
    }
    parts.join("\n")
}

#[derive(Deserialize, JsonSchema)]
pub struct NoParameters {}

/// Reports the working directory the tools operate in.
pub struct GetCurrentDirectoryTool {
    workspace: Workspace,
    parameter_schema: Value,
}

impl GetCurrentDirectoryTool {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            parameter_schema: schema_for!(NoParameters).to_value(),
        }
    }
}

impl Tool for GetCurrentDirectoryTool {
    // Models send `{}`, `null` or nothing at all for tools without
    // parameters, so anything is accepted.
    type Input = Value;

    fn name(&self) -> &str {
        "get_current_directory"
    }

    fn description(&self) -> &str {
        "Returns the absolute path of the working directory."
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        _input: Value,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let root = self.workspace.root().display().to_string();
        async move { Ok(root) }
    }
}

//! Built-in tools the model can call, all confined to one working directory.

mod command;
mod fs;
mod workspace;

use std::time::Duration;

use supercli_core::EngineBuilder;

pub use command::{
    DEFAULT_COMMAND_TIMEOUT, GetCurrentDirectoryTool, RunCommandTool,
};
pub use fs::{
    CreateDirectoryTool, ListDirectoryTool, ReadFileTool, WriteFileTool,
};
pub use workspace::Workspace;

/// Registers every built-in tool on `builder`.
pub fn register(
    builder: EngineBuilder,
    workspace: &Workspace,
    command_timeout: Duration,
) -> EngineBuilder {
    builder
        .with_tool(ListDirectoryTool::new(workspace.clone()))
        .with_tool(ReadFileTool::new(workspace.clone()))
        .with_tool(WriteFileTool::new(workspace.clone()))
        .with_tool(CreateDirectoryTool::new(workspace.clone()))
        .with_tool(
            RunCommandTool::new(workspace.clone())
                .with_timeout(command_timeout),
        )
        .with_tool(GetCurrentDirectoryTool::new(workspace.clone()))
}

use std::io;

use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;
use supercli_core::tool::{Error as ToolError, Tool, ToolResult};
use tokio::fs;

use super::Workspace;

/// Files longer than this are cut off, counted in characters.
const MAX_READ_CHARS: usize = 50_000;

fn default_path() -> String {
    ".".to_owned()
}

#[derive(Deserialize, JsonSchema)]
pub struct ListDirectoryParameters {
    #[schemars(
        description = "Directory to list, relative to the working directory. \
                       Defaults to the working directory itself."
    )]
    #[serde(default = "default_path")]
    path: String,
}

/// Lists the entries of a directory.
pub struct ListDirectoryTool {
    workspace: Workspace,
    parameter_schema: Value,
}

impl ListDirectoryTool {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            parameter_schema: schema_for!(ListDirectoryParameters).to_value(),
        }
    }
}

impl Tool for ListDirectoryTool {
    type Input = ListDirectoryParameters;

    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "Lists the files and subdirectories of a directory, with file sizes."
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: ListDirectoryParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let resolved = self.workspace.resolve(&input.path);
        async move {
            let dir = resolved?;
            if !fs::metadata(&dir).await?.is_dir() {
                let reason = format!("`{}` is not a directory", input.path);
                return Err(ToolError::invalid_input().with_reason(reason));
            }

            let mut entries = vec![];
            let mut read_dir = fs::read_dir(&dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let metadata = entry.metadata().await?;
                entries.push((name, metadata.is_dir(), metadata.len()));
            }
            if entries.is_empty() {
                return Ok(format!("Directory '{}' is empty", input.path));
            }
            entries.sort();

            let mut output = format!("Contents of {}:", dir.display());
            for (name, is_dir, size) in entries {
                if is_dir {
                    output.push_str(&format!("\n[DIR]  {name}/"));
                } else {
                    let size = format_size(size);
                    output.push_str(&format!("\n[FILE] {name} ({size})"));
                }
            }
            Ok(output)
        }
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct ReadFileParameters {
    #[schemars(
        description = "File to read, relative to the working directory."
    )]
    path: String,
}

/// Reads a text file.
pub struct ReadFileTool {
    workspace: Workspace,
    parameter_schema: Value,
}

impl ReadFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            parameter_schema: schema_for!(ReadFileParameters).to_value(),
        }
    }
}

impl Tool for ReadFileTool {
    type Input = ReadFileParameters;

    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads the content of a text file. Very long files are truncated."
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: ReadFileParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let resolved = self.workspace.resolve(&input.path);
        async move {
            let path = resolved?;
            if fs::metadata(&path).await?.is_dir() {
                return Err(ToolError::invalid_input()
                    .with_reason(format!("`{}` is a directory", input.path)));
            }
            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    return Err(ToolError::execution_error().with_reason(format!(
                        "`{}` is not a UTF-8 text file",
                        input.path
                    )));
                }
                Err(err) => return Err(err.into()),
            };
            Ok(truncate(content))
        }
    }
}

fn truncate(content: String) -> String {
    let Some((cut, _)) = content.char_indices().nth(MAX_READ_CHARS) else {
        return content;
    };
    let total = content.chars().count();
    format!(
        "{}\n\n... [truncated, file has {total} characters total]",
        &content[..cut]
    )
}

#[derive(Deserialize, JsonSchema)]
pub struct WriteFileParameters {
    #[schemars(
        description = "File to write, relative to the working directory. \
                       Missing parent directories are created."
    )]
    path: String,
    #[schemars(description = "The complete new content of the file.")]
    content: String,
}

/// Creates or overwrites a file.
pub struct WriteFileTool {
    workspace: Workspace,
    parameter_schema: Value,
}

impl WriteFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            parameter_schema: schema_for!(WriteFileParameters).to_value(),
        }
    }
}

impl Tool for WriteFileTool {
    type Input = WriteFileParameters;

    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Writes content to a file, replacing it if it exists."
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: WriteFileParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let resolved = self.workspace.resolve(&input.path);
        async move {
            let path = resolved?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, input.content.as_bytes()).await?;
            Ok(format!(
                "Wrote {} characters to '{}'",
                input.content.chars().count(),
                input.path
            ))
        }
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct CreateDirectoryParameters {
    #[schemars(
        description = "Directory to create, relative to the working \
                       directory. Parents are created as needed."
    )]
    path: String,
}

/// Creates a directory and its parents.
pub struct CreateDirectoryTool {
    workspace: Workspace,
    parameter_schema: Value,
}

impl CreateDirectoryTool {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            parameter_schema: schema_for!(CreateDirectoryParameters).to_value(),
        }
    }
}

impl Tool for CreateDirectoryTool {
    type Input = CreateDirectoryParameters;

    fn name(&self) -> &str {
        "create_directory"
    }

    fn description(&self) -> &str {
        "Creates a directory, including missing parent directories."
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    fn execute(
        &self,
        input: CreateDirectoryParameters,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let resolved = self.workspace.resolve(&input.path);
        async move {
            fs::create_dir_all(resolved?).await?;
            Ok(format!("Created directory '{}'", input.path))
        }
    }
}

fn format_size(size: u64) -> String {
    if size < 1024 {
        return format!("{size}B");
    }
    let mut size = size as f64 / 1024.0;
    for unit in ["KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1}{unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1}TB")
}

#[cfg(test)]
mod tests {
    use supercli_core::tool::ErrorKind;

    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();
        (dir, workspace)
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(1023), "1023B");
        assert_eq!(format_size(1536), "1.5KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0MB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short".to_owned()), "short");
        let long = "é".repeat(MAX_READ_CHARS + 5);
        let truncated = truncate(long);
        assert!(truncated.starts_with(&"é".repeat(MAX_READ_CHARS)));
        assert!(truncated.ends_with(&format!(
            "[truncated, file has {} characters total]",
            MAX_READ_CHARS + 5
        )));
    }

    #[tokio::test]
    async fn test_write_read_and_list() {
        let (_dir, workspace) = workspace();
        let write = WriteFileTool::new(workspace.clone());
        let output = write
            .execute(WriteFileParameters {
                path: "notes/todo.txt".to_owned(),
                content: "buy milk".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(output, "Wrote 8 characters to 'notes/todo.txt'");

        let read = ReadFileTool::new(workspace.clone());
        let content = read
            .execute(ReadFileParameters {
                path: "notes/todo.txt".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(content, "buy milk");

        CreateDirectoryTool::new(workspace.clone())
            .execute(CreateDirectoryParameters {
                path: "a/b".to_owned(),
            })
            .await
            .unwrap();

        let list = ListDirectoryTool::new(workspace.clone());
        let listing = list
            .execute(ListDirectoryParameters {
                path: default_path(),
            })
            .await
            .unwrap();
        let lines: Vec<_> = listing.lines().skip(1).collect();
        assert_eq!(lines, ["[DIR]  a/", "[DIR]  notes/"]);

        let listing = list
            .execute(ListDirectoryParameters {
                path: "notes".to_owned(),
            })
            .await
            .unwrap();
        assert!(listing.ends_with("[FILE] todo.txt (8B)"));

        let empty = list
            .execute(ListDirectoryParameters {
                path: "a/b".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(empty, "Directory 'a/b' is empty");
    }

    #[tokio::test]
    async fn test_errors() {
        let (_dir, workspace) = workspace();
        let read = ReadFileTool::new(workspace.clone());

        let err = read
            .execute(ReadFileParameters {
                path: "missing.txt".to_owned(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = read
            .execute(ReadFileParameters {
                path: "../outside.txt".to_owned(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err = read
            .execute(ReadFileParameters { path: ".".to_owned() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let blob = workspace.root().join("blob.bin");
        std::fs::write(blob, [0xff, 0xfe, 0x00]).unwrap();
        let err = read
            .execute(ReadFileParameters {
                path: "blob.bin".to_owned(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionError);

        let err = WriteFileTool::new(workspace)
            .execute(WriteFileParameters {
                path: "/tmp/../etc/evil".to_owned(),
                content: String::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }
}

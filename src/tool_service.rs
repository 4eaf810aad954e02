use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use ignore::WalkBuilder;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::file_store::{FileStore, LocalFileStore};
use crate::protocol::ToolOutput;

pub const READ_FILE: &str = "read_file";
pub const LIST_DIRECTORY: &str = "list_directory";
pub const RUN_COMMAND: &str = "run_command";

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_OUTPUT_CHARS: usize = 20_000;

/// Executes tools on behalf of the model.
///
/// `Err` means the tool could not run at all; a tool that ran and failed
/// returns `Ok(ToolOutput { success: false, .. })`.
#[async_trait]
pub trait ToolService: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput>;

    /// OpenAI-style function definitions advertised with each request.
    fn definitions(&self) -> Vec<Value> {
        Vec::new()
    }
}

fn get_str_arg(args: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| args.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// `read_file`, `list_directory` and `run_command` scoped to one workspace.
pub struct WorkspaceToolService {
    root: PathBuf,
    files: LocalFileStore,
    command_timeout: Duration,
}

impl WorkspaceToolService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            files: LocalFileStore::new(root.clone()),
            root,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn read_file(&self, args: &Map<String, Value>) -> Result<ToolOutput> {
        let Some(path) = get_str_arg(args, &["path", "file_path", "filepath", "filename"]) else {
            return Ok(ToolOutput::err("missing required arg: path (or file_path)"));
        };
        match self.files.read_file(&path).await {
            Ok(Some(content)) if content.is_empty() => Ok(ToolOutput::ok(format!(
                "=== File: {path} (empty) ===\n// This file exists but contains no content."
            ))),
            Ok(Some(content)) => Ok(ToolOutput::ok(format!("=== File: {path} ===\n{content}"))),
            Ok(None) => Ok(ToolOutput::err(format!("file not found: {path}"))),
            Err(e) => Ok(ToolOutput::err(e.to_string())),
        }
    }

    async fn list_directory(&self, args: &Map<String, Value>) -> Result<ToolOutput> {
        let path = get_str_arg(args, &["path", "dir", "directory"]).unwrap_or_else(|| ".".to_string());
        let max_depth = args.get("max_depth").and_then(Value::as_u64).unwrap_or(1) as usize;

        if !self.files.exists(&path).await.unwrap_or(false) {
            return Ok(ToolOutput::err(format!("directory not found: {path}")));
        }
        let start = self.root.join(crate::file_store::normalize_path(&path));
        let root = self.root.clone();

        let listing = tokio::task::spawn_blocking(move || list_tree(&root, &start, max_depth))
            .await
            .map_err(|e| EngineError::ToolExecution {
                name: LIST_DIRECTORY.to_string(),
                message: e.to_string(),
            })?;
        Ok(ToolOutput::ok(format!("Directory: {path}\n{listing}")))
    }

    async fn run_command(&self, args: &Map<String, Value>) -> Result<ToolOutput> {
        let Some(command) = get_str_arg(args, &["command", "cmd"]) else {
            return Ok(ToolOutput::err("missing required arg: command"));
        };
        info!(command = %command, "running command");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::ToolExecution {
                name: RUN_COMMAND.to_string(),
                message: e.to_string(),
            })?;

        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| EngineError::ToolExecution {
                name: RUN_COMMAND.to_string(),
                message: e.to_string(),
            })?,
            Err(_) => return Err(EngineError::Timeout(self.command_timeout)),
        };

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str("\n[stderr]\n");
            text.push_str(&stderr);
        }
        let text = truncate_output(text);
        let code = output.status.code().unwrap_or(-1);
        debug!(command = %command, code, "command finished");

        if output.status.success() {
            Ok(ToolOutput::ok(text))
        } else {
            Ok(ToolOutput::err(format!("exit code {code}\n{text}")))
        }
    }
}

fn list_tree(root: &Path, start: &Path, max_depth: usize) -> String {
    let mut entries: Vec<(String, bool)> = WalkBuilder::new(start)
        .max_depth(Some(max_depth.max(1)))
        .hidden(true)
        .build()
        .flatten()
        .filter(|entry| entry.depth() > 0)
        .map(|entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            (rel, is_dir)
        })
        .collect();
    entries.sort();

    let mut out = String::new();
    for (path, is_dir) in entries {
        out.push_str(&path);
        if is_dir {
            out.push('/');
        }
        out.push('\n');
    }
    out
}

fn truncate_output(text: String) -> String {
    if text.chars().count() <= MAX_OUTPUT_CHARS {
        return text;
    }
    let kept: String = text.chars().take(MAX_OUTPUT_CHARS).collect();
    format!("{kept}\n... [output truncated]")
}

#[async_trait]
impl ToolService for WorkspaceToolService {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Ok(ToolOutput::err(format!(
                    "arguments must be an object, got {other}"
                )))
            }
        };

        match name {
            READ_FILE => self.read_file(&args).await,
            LIST_DIRECTORY => self.list_directory(&args).await,
            RUN_COMMAND => self.run_command(&args).await,
            other => Err(EngineError::ToolExecution {
                name: other.to_string(),
                message: "unknown tool".to_string(),
            }),
        }
    }

    fn definitions(&self) -> Vec<Value> {
        vec![
            function_definition(
                READ_FILE,
                "Read a file from the workspace",
                json!({"path": {"type": "string", "description": "Workspace-relative path"}}),
                &["path"],
            ),
            function_definition(
                LIST_DIRECTORY,
                "List files and directories",
                json!({
                    "path": {"type": "string"},
                    "max_depth": {"type": "integer"}
                }),
                &[],
            ),
            function_definition(
                RUN_COMMAND,
                "Run a shell command in the workspace root",
                json!({"command": {"type": "string"}}),
                &["command"],
            ),
        ]
    }
}

fn function_definition(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        }
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_file_and_missing_arg() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "alpha").unwrap();
        let service = WorkspaceToolService::new(temp.path());

        let out = service.call_tool(READ_FILE, json!({"path": "a.txt"})).await.unwrap();
        assert!(out.success);
        assert!(out.content.ends_with("alpha"));

        let out = service.call_tool(READ_FILE, json!({})).await.unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn test_list_directory() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(temp.path().join("Cargo.toml"), "").unwrap();
        let service = WorkspaceToolService::new(temp.path());

        let out = service.call_tool(LIST_DIRECTORY, Value::Null).await.unwrap();
        assert!(out.success);
        assert!(out.content.contains("Cargo.toml\n"));
        assert!(out.content.contains("src/\n"));
        assert!(!out.content.contains("src/lib.rs"));
    }

    #[tokio::test]
    async fn test_run_command_reports_exit_status() {
        let temp = TempDir::new().unwrap();
        let service = WorkspaceToolService::new(temp.path());

        let out = service
            .call_tool(RUN_COMMAND, json!({"command": "echo hi"}))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.content.trim(), "hi");

        let out = service
            .call_tool(RUN_COMMAND, json!({"command": "exit 3"}))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.content.starts_with("exit code 3"));
    }

    #[tokio::test]
    async fn test_unknown_tool_fails() {
        let temp = TempDir::new().unwrap();
        let service = WorkspaceToolService::new(temp.path());
        let err = service.call_tool("web_search", Value::Null).await.unwrap_err();
        assert!(matches!(err, EngineError::ToolExecution { .. }));
        assert_eq!(service.definitions().len(), 3);
    }
}

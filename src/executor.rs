use crate::conversation::{ToolInvocationRequest, ToolInvocationResult};
use crate::tools::{ToolDescriptor, ToolError, ToolRegistry};
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub struct ToolExecutor {
    registry: ToolRegistry,
    project_root: PathBuf,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, project_root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            project_root: project_root.into(),
        }
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        self.registry.descriptors()
    }

    /// Runs one tool call to completion. Every failure, including an unknown
    /// tool name, comes back as an error result instead of aborting the caller.
    pub fn execute(&self, request: &ToolInvocationRequest) -> ToolInvocationResult {
        let Some(tool) = self.registry.get(&request.name) else {
            warn!("Model requested unknown tool: {}", request.name);
            return ToolInvocationResult {
                id: request.id.clone(),
                output: "tool not found".to_string(),
                is_error: true,
            };
        };

        info!("tool: {}({})", tool.name, request.raw_input);

        match (tool.handler)(&self.project_root, &request.raw_input) {
            Ok(output) => ToolInvocationResult {
                id: request.id.clone(),
                output,
                is_error: false,
            },
            Err(e) => {
                warn!("Tool {} failed: {}", tool.name, e);
                ToolInvocationResult {
                    id: request.id.clone(),
                    output: e.to_string(),
                    is_error: true,
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct ReadFileInput {
    path: String,
}

#[derive(Deserialize)]
struct ListFilesInput {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct EditFileInput {
    path: String,
    #[serde(default)]
    old_str: String,
    #[serde(default)]
    new_str: String,
}

pub fn read_file(root: &Path, input: &Value) -> Result<String, ToolError> {
    let input = ReadFileInput::deserialize(input)?;
    Ok(fs::read_to_string(root.join(input.path))?)
}

/// Lists everything below `path`, sorted by name within each directory.
pub fn list_files(root: &Path, input: &Value) -> Result<String, ToolError> {
    let input = ListFilesInput::deserialize(input)?;
    let dir = root.join(input.path.as_deref().unwrap_or("."));
    fs::metadata(&dir)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(&dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(&dir) else {
            continue;
        };

        let mut name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if entry.file_type().is_dir() {
            name.push('/');
        }
        files.push(name);
    }

    Ok(serde_json::to_string(&files)?)
}

pub fn edit_file(root: &Path, input: &Value) -> Result<String, ToolError> {
    let input = EditFileInput::deserialize(input)?;
    if input.path.is_empty() || input.old_str == input.new_str {
        return Err(ToolError::InvalidParameters);
    }

    let path = root.join(&input.path);
    let existing = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound && input.old_str.is_empty() => {
            create_file(&path, &input.new_str)?;
            return Ok(format!("Successfully created file {}", input.path));
        }
        Err(e) => return Err(e.into()),
    };

    let updated = existing.replacen(&input.old_str, &input.new_str, 1);
    if updated == existing && !input.old_str.is_empty() {
        return Err(ToolError::OldStrNotFound);
    }

    fs::write(&path, updated)?;
    Ok("OK".to_string())
}

fn create_file(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

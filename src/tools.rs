use crate::executor;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use thiserror::Error;

pub const SYSTEM_PROMPT: &str = r#"You are an expert coding assistant with direct file system access.

You work inside a single project directory. Every path you pass to a tool is relative to it.

AVAILABLE TOOLS:
- read_file: read the full contents of a file
- list_files: list files and directories below a path
- edit_file: replace text in a file, or create a new file

RULES:
1. Read a file before editing it
2. edit_file replaces only the FIRST occurrence of old_str, so make old_str unique
3. old_str must match the file exactly, including whitespace
4. To create a file, pass an empty old_str and the whole content as new_str
5. When the task is done, answer in plain text without calling any tool"#;

/// Failures a tool handler reports back to the model. The `Display` text is
/// exactly what ends up in the tool result.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid input parameters")]
    InvalidParameters,

    #[error("malformed input: {0}")]
    MalformedInput(#[from] serde_json::Error),

    #[error("old_str not found in file")]
    OldStrNotFound,

    #[error("{0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),
}

pub type ToolHandler = fn(&Path, &Value) -> Result<String, ToolError>;

#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_shape: Value,
    pub handler: ToolHandler,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_shape", &self.input_shape)
            .finish()
    }
}

/// Fixed set of tools, built once at startup and never modified afterwards.
pub struct ToolRegistry {
    descriptors: Vec<ToolDescriptor>,
    by_name: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn new(descriptors: Vec<ToolDescriptor>) -> Result<Self, RegistryError> {
        let mut by_name = HashMap::with_capacity(descriptors.len());
        for (index, descriptor) in descriptors.iter().enumerate() {
            if by_name.insert(descriptor.name, index).is_some() {
                return Err(RegistryError::DuplicateTool(descriptor.name.to_string()));
            }
        }

        Ok(Self {
            descriptors,
            by_name,
        })
    }

    pub fn builtin() -> Result<Self, RegistryError> {
        Self::new(builtin_tools())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.by_name.get(name).map(|&index| &self.descriptors[index])
    }

    /// Descriptors in registration order, as advertised to the model.
    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }
}

pub fn builtin_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "read_file",
            description: "Read the contents of a given relative file path. Use this when you want to see what's inside a file. Do not use this with directory names.",
            input_shape: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "The relative path of a file in the working directory."
                    }
                },
                "required": ["path"]
            }),
            handler: executor::read_file,
        },
        ToolDescriptor {
            name: "list_files",
            description: "List files and directories at a given path. If no path is provided, lists files in the current directory. Directories end with a slash.",
            input_shape: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Optional relative path to list files from. Defaults to current directory if not provided."
                    }
                }
            }),
            handler: executor::list_files,
        },
        ToolDescriptor {
            name: "edit_file",
            description: "Make edits to a text file. Replaces the first occurrence of 'old_str' with 'new_str' in the given file. 'old_str' and 'new_str' MUST be different from each other. If the file specified with path doesn't exist, it will be created when 'old_str' is empty.",
            input_shape: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "The path to the file"
                    },
                    "old_str": {
                        "type": "string",
                        "description": "Text to search for - must match exactly"
                    },
                    "new_str": {
                        "type": "string",
                        "description": "Text to replace old_str with"
                    }
                },
                "required": ["path", "old_str", "new_str"]
            }),
            handler: executor::edit_file,
        },
    ]
}

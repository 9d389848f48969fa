use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocationRequest {
    pub id: String,
    pub name: String,
    pub raw_input: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocationResult {
    pub id: String,
    pub output: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolInvocationRequest(ToolInvocationRequest),
    ToolInvocationResult(ToolInvocationResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text(text.into())],
        }
    }

    /// Bundles every result produced for one model turn into a single user turn.
    pub fn tool_results(results: Vec<ToolInvocationResult>) -> Self {
        Self {
            role: Role::User,
            content: results
                .into_iter()
                .map(ContentBlock::ToolInvocationResult)
                .collect(),
        }
    }

    pub fn tool_requests(&self) -> impl Iterator<Item = &ToolInvocationRequest> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolInvocationRequest(request) => Some(request),
            _ => None,
        })
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::Text(text) => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn has_tool_requests(&self) -> bool {
        self.tool_requests().next().is_some()
    }
}

/// Append-only history of turns. There is no way to remove or reorder messages.
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

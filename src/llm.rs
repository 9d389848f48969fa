use crate::conversation::{
    ContentBlock, Message, Role, ToolInvocationRequest, ToolInvocationResult,
};
use crate::limiter::RateLimiter;
use crate::tools::ToolDescriptor;
use async_trait::async_trait;
use color_eyre::eyre::{eyre, Result, WrapErr};
use log::{error, info};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;

/// The model boundary: one full conversation in, one model turn out.
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    async fn send(&self, conversation: &[Message], tools: &[ToolDescriptor]) -> Result<Message>;
}

#[derive(Debug, Clone)]
pub struct AzureOpenAIConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    pub deployment: String,
    pub tpm_limit: u32,
    pub max_tokens: u32,
}

impl AzureOpenAIConfig {
    pub fn from_env() -> Result<Self> {
        let endpoint = env::var("LLM_URL").wrap_err("LLM_URL not set")?;
        let api_key = env::var("LLM_KEY").wrap_err("LLM_KEY not set")?;
        let api_version =
            env::var("LLM_VERSION").unwrap_or_else(|_| "2024-05-01-preview".to_string());
        let deployment =
            env::var("LLM_MODEL").unwrap_or_else(|_| "DeepSeek-V3-0324".to_string());

        let tpm_limit: u32 = env::var("LLM_TPM")
            .unwrap_or_else(|_| "20000".to_string())
            .parse()
            .unwrap_or(20000);

        let max_tokens: u32 = env::var("LLM_MAX_TOKENS")
            .unwrap_or_else(|_| "4096".to_string())
            .parse()
            .unwrap_or(4096);

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            api_version,
            deployment,
            tpm_limit,
            max_tokens,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Value>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: ChatFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

pub struct AzureOpenAIClient {
    config: AzureOpenAIConfig,
    client: Client,
    rate_limiter: RateLimiter,
    system_prompt: String,
}

impl AzureOpenAIClient {
    pub fn new(config: AzureOpenAIConfig, system_prompt: impl Into<String>) -> Self {
        let rate_limiter = RateLimiter::new(config.tpm_limit);
        Self {
            config,
            client: Client::new(),
            rate_limiter,
            system_prompt: system_prompt.into(),
        }
    }

    pub async fn chat_completions(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDescriptor],
    ) -> Result<ChatCompletionResponse> {
        let url = format!(
            "{}/chat/completions?api-version={}",
            self.config.endpoint, self.config.api_version
        );

        let request_body = ChatCompletionRequest {
            messages,
            tools: tools.iter().map(tool_spec).collect(),
            temperature: 0.2,
            max_tokens: Some(self.config.max_tokens),
            model: self.config.deployment.clone(),
        };

        let estimated_tokens = estimate_tokens(&request_body.messages);
        self.rate_limiter.wait_if_needed(estimated_tokens).await;

        info!("Sending request to LLM: {}", url);
        info!(
            "Estimated tokens: {}, Current TPM: {}/{}",
            estimated_tokens,
            self.rate_limiter.current_tpm().await,
            self.rate_limiter.max_tpm()
        );

        let response = self
            .client
            .post(&url)
            .header("api-key", &self.config.api_key)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .wrap_err("LLM request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("LLM API error ({}): {}", status, error_text);
            return Err(eyre!("LLM API error ({}): {}", status, error_text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .wrap_err("Invalid LLM response body")?;

        if let Some(usage) = &completion.usage {
            info!(
                "Actual token usage: {} (prompt {}, completion {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
            self.rate_limiter.record_actual(usage.total_tokens).await;
            info!("Session tokens so far: {}", self.rate_limiter.total_tokens().await);
        }

        Ok(completion)
    }
}

#[async_trait]
impl InferenceGateway for AzureOpenAIClient {
    async fn send(&self, conversation: &[Message], tools: &[ToolDescriptor]) -> Result<Message> {
        let messages = to_wire_messages(&self.system_prompt, conversation);
        let response = self.chat_completions(messages, tools).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| eyre!("No response from AI"))?;
        info!(
            "Response {} finished: {}",
            response.id,
            choice.finish_reason.as_deref().unwrap_or("unknown")
        );

        Ok(to_message(choice.message))
    }
}

fn tool_spec(tool: &ToolDescriptor) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_shape,
        }
    })
}

fn estimate_tokens(messages: &[ChatMessage]) -> u32 {
    let chars: usize = messages
        .iter()
        .map(|msg| {
            msg.content.as_deref().map_or(0, str::len)
                + msg
                    .tool_calls
                    .iter()
                    .flatten()
                    .map(|call| call.function.arguments.len())
                    .sum::<usize>()
        })
        .sum();
    (chars / 4) as u32 + 100
}

/// Flattens the conversation into chat-completions messages. Each tool result
/// becomes its own `tool` message, in the order the model asked for them.
pub fn to_wire_messages(system_prompt: &str, conversation: &[Message]) -> Vec<ChatMessage> {
    let mut wire = vec![ChatMessage {
        role: "system".to_string(),
        content: Some(system_prompt.to_string()),
        ..Default::default()
    }];

    for message in conversation {
        match message.role {
            Role::Model => {
                let text = message.texts().collect::<Vec<_>>().join("\n");
                let tool_calls: Vec<ChatToolCall> =
                    message.tool_requests().map(to_tool_call).collect();
                // an assistant message needs either content or tool_calls
                let content = if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(text)
                };
                wire.push(ChatMessage {
                    role: "assistant".to_string(),
                    content,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    tool_call_id: None,
                });
            }
            Role::User => {
                for block in &message.content {
                    match block {
                        ContentBlock::Text(text) => wire.push(ChatMessage {
                            role: "user".to_string(),
                            content: Some(text.clone()),
                            ..Default::default()
                        }),
                        ContentBlock::ToolInvocationResult(result) => {
                            wire.push(to_tool_message(result))
                        }
                        ContentBlock::ToolInvocationRequest(_) => {}
                    }
                }
            }
        }
    }

    wire
}

fn to_tool_call(request: &ToolInvocationRequest) -> ChatToolCall {
    let arguments = match &request.raw_input {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    };
    ChatToolCall {
        id: request.id.clone(),
        kind: function_kind(),
        function: ChatFunctionCall {
            name: request.name.clone(),
            arguments,
        },
    }
}

fn to_tool_message(result: &ToolInvocationResult) -> ChatMessage {
    let content = if result.is_error {
        format!("Error: {}", result.output)
    } else {
        result.output.clone()
    };
    ChatMessage {
        role: "tool".to_string(),
        content: Some(content),
        tool_call_id: Some(result.id.clone()),
        ..Default::default()
    }
}

/// Arguments that are not valid JSON are kept as a raw string so the tool
/// handler rejects them as malformed input.
pub fn to_message(wire: ChatMessage) -> Message {
    let mut content = Vec::new();

    if let Some(text) = wire.content {
        content.push(ContentBlock::Text(text));
    }

    for call in wire.tool_calls.unwrap_or_default() {
        let raw_input = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::String(call.function.arguments))
        };
        content.push(ContentBlock::ToolInvocationRequest(ToolInvocationRequest {
            id: call.id,
            name: call.function.name,
            raw_input,
        }));
    }

    Message {
        role: Role::Model,
        content,
    }
}

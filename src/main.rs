mod chat;
mod conversation;
mod executor;
mod limiter;
mod llm;
mod tools;

use chat::{print_info, ChatSession, ReaderInput};
use color_eyre::eyre::{Result, WrapErr};
use executor::ToolExecutor;
use llm::{AzureOpenAIClient, AzureOpenAIConfig};
use log::info;
use std::env;
use tools::{ToolRegistry, SYSTEM_PROMPT};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    color_eyre::install()?;

    let project_root = env::var("PROJECT_PATH").unwrap_or_else(|_| ".".to_string());
    let config = AzureOpenAIConfig::from_env().wrap_err("Failed to configure LLM client")?;
    info!(
        "Project: {}, model: {}, max TPM: {}",
        project_root, config.deployment, config.tpm_limit
    );

    let registry = ToolRegistry::builtin()?;
    let executor = ToolExecutor::new(registry, &project_root);
    let client = AzureOpenAIClient::new(config, SYSTEM_PROMPT);

    print_info(&format!(
        "Project: {} | Commands: /help /history /exit | Ctrl-D to quit",
        project_root
    ));

    let mut session = ChatSession::new(client, executor, ReaderInput::stdin());
    session.run().await
}

//! Seraph server entrypoint.
//!
//! Concrete reasoning-service clients and tool implementations are external
//! collaborators (`spec.md` §1): this binary wires a minimal OpenAI-compatible
//! chat completions client, auto-detected from environment variables the same
//! way the teacher's `LlmClient::from_env` does, and starts with an empty
//! tool set. Embedding applications are expected to supply their own
//! `Tool` implementations.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use seraph_core::config::RuntimeConfig;
use seraph_core::reasoning::{GenerateResponse, ReasoningError, ReasoningProvider, ToolCallRequest, ToolDescriptor};
use seraph_core::Seraph;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "seraph")]
#[command(about = "Priority-aware log-triage and investigation server")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file. Overrides SERAPH_CONFIG if both are set.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        std::env::set_var("SERAPH_CONFIG", path);
    }

    let config = RuntimeConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if cli.check_config {
        info!("configuration valid");
        return Ok(());
    }

    info!(port = config.port, bind_address = %config.bind_address, "starting seraph");

    let reasoning: Arc<dyn ReasoningProvider> = match ChatCompletionsProvider::from_env() {
        Some(provider) => {
            info!(model = %provider.model, "reasoning provider: {}", provider.label);
            Arc::new(provider)
        }
        None => {
            warn!("no LLM credentials found in environment; investigations will synthesize skeleton reports");
            Arc::new(NullReasoningProvider)
        }
    };

    let seraph = Seraph::new(config, reasoning, vec![], None)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(err) = seraph.run(shutdown_rx).await {
        error!(%err, "seraph exited with an error");
        return Err(anyhow::anyhow!(err.to_string()));
    }

    Ok(())
}

/// Always finishes immediately with no findings. Lets the server run (and
/// be exercised end to end) without a configured LLM backend.
struct NullReasoningProvider;

#[async_trait]
impl ReasoningProvider for NullReasoningProvider {
    async fn generate(
        &self,
        _prompt: &str,
        _tools: &[ToolDescriptor],
    ) -> Result<GenerateResponse, ReasoningError> {
        Ok(GenerateResponse {
            text: r#"{"rootCauseAnalysis":"no reasoning provider configured","impactAssessment":"unknown","suggestedRemediation":["configure an LLM backend"]}"#.into(),
            tool_calls: vec![ToolCallRequest {
                id: "no-provider".into(),
                name: "FINISH".into(),
                arguments: "{}".into(),
            }],
        })
    }
}

/// Minimal OpenAI-compatible chat completions client with function calling,
/// auto-detected from environment variables in priority order: OpenRouter,
/// OpenAI, then Anthropic's OpenAI-compatible endpoint.
struct ChatCompletionsProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    label: &'static str,
}

impl ChatCompletionsProvider {
    fn from_env() -> Option<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .ok()?;

        if let Ok(api_key) = std::env::var("OPENROUTER_API_KEY") {
            let model = std::env::var("OPENROUTER_MODEL").unwrap_or_else(|_| "anthropic/claude-sonnet-4".into());
            let base_url =
                std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| "https://openrouter.ai/api/v1".into());
            return Some(Self { client, api_key, base_url, model, label: "OpenRouter" });
        }

        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            let model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".into());
            let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
            return Some(Self { client, api_key, base_url, model, label: "OpenAI" });
        }

        if let Ok(api_key) = std::env::var("ANTHROPIC_API_KEY") {
            let model = std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| "claude-sonnet-4-5".into());
            let base_url =
                std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| "https://api.anthropic.com/v1".into());
            return Some(Self { client, api_key, base_url, model, label: "Anthropic" });
        }

        None
    }

    fn tool_schema(tools: &[ToolDescriptor]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect()
    }
}

#[async_trait]
impl ReasoningProvider for ChatCompletionsProvider {
    async fn generate(
        &self,
        prompt: &str,
        tools: &[ToolDescriptor],
    ) -> Result<GenerateResponse, ReasoningError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(Self::tool_schema(tools));
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReasoningError::Provider(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ReasoningError::RateLimited);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ReasoningError::Auth(status.to_string()));
        }
        if !status.is_success() {
            return Err(ReasoningError::Provider(format!("status {status}")));
        }

        let payload: serde_json::Value =
            response.json().await.map_err(|e| ReasoningError::Provider(e.to_string()))?;
        let message = &payload["choices"][0]["message"];
        let text = message["content"].as_str().unwrap_or_default().to_string();
        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|c| {
                        Some(ToolCallRequest {
                            id: c["id"].as_str()?.to_string(),
                            name: c["function"]["name"].as_str()?.to_string(),
                            arguments: c["function"]["arguments"].as_str().unwrap_or("{}").to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(GenerateResponse { text, tool_calls })
    }
}

//! Abstract contract for the external reasoning service.
//!
//! `spec.md` §1 places concrete reasoning-service clients (Gemini,
//! Anthropic, OpenAI) out of scope — only the abstract
//! `Generate(prompt, tools) -> (text, toolCalls)` contract is specified.
//! This module defines that contract; wiring a concrete provider is left
//! to the embedding application.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReasoningError {
    #[error("reasoning service error: {0}")]
    Provider(String),
    #[error("reasoning service rate limited")]
    RateLimited,
    #[error("reasoning service timed out")]
    Timeout,
    #[error("reasoning service auth failed: {0}")]
    Auth(String),
}

impl ReasoningError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ReasoningError::RateLimited => Some(429),
            ReasoningError::Timeout => Some(408),
            ReasoningError::Auth(_) => Some(401),
            ReasoningError::Provider(_) => None,
        }
    }
}

/// The abstract reasoning-service contract a worker calls into. Concrete
/// implementations (wrapping a specific LLM API) are an external
/// collaborator, out of scope for this crate.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        tools: &[ToolDescriptor],
    ) -> Result<GenerateResponse, ReasoningError>;
}

//! VLM judge client.
//!
//! The judging collaborator takes system and user text plus zero or more
//! images and returns free text containing a verdict token. This module
//! provides the trait the evaluators program against and an
//! OpenAI-compatible chat-completions implementation of it.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::trace::EncodedImage;
use crate::artifact::{COMPLETION_TOKEN_COST, PROMPT_TOKEN_COST};
use crate::config::JudgeConfig;
use crate::error::JudgeError;

/// One judge call: prompts plus the screenshot evidence.
#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub system_prompt: String,
    pub user_text: String,
    pub images: Vec<EncodedImage>,
}

/// Token accounting for one judge call.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct JudgeUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl JudgeUsage {
    /// Dollar cost of this call at the fixed judge pricing.
    pub fn api_cost(&self) -> f64 {
        PROMPT_TOKEN_COST * self.prompt_tokens as f64
            + COMPLETION_TOKEN_COST * self.completion_tokens as f64
    }
}

/// The judge's free-text reply.
#[derive(Debug, Clone)]
pub struct JudgeReply {
    pub content: String,
    pub usage: JudgeUsage,
}

/// Judging collaborator contract.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn ask(&self, request: &JudgeRequest) -> Result<JudgeReply, JudgeError>;
}

/// OpenAI-compatible chat-completions judge.
pub struct VlmJudgeClient {
    api_base: String,
    api_key: String,
    model: String,
    http_client: Client,
}

impl VlmJudgeClient {
    /// Builds a client from the judge section of the session config.
    pub fn new(config: &JudgeConfig) -> Result<Self, JudgeError> {
        let api_key = config.api_key.clone().ok_or(JudgeError::MissingApiKey)?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            http_client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .map_err(|e| JudgeError::RequestFailed(e.to_string()))?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: JudgeUsage,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl Judge for VlmJudgeClient {
    async fn ask(&self, request: &JudgeRequest) -> Result<JudgeReply, JudgeError> {
        let mut user_content = vec![json!({"type": "text", "text": request.user_text})];
        user_content.extend(request.images.iter().map(EncodedImage::to_content_part));

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": user_content},
            ],
            "temperature": 0,
        });

        let url = format!("{}/chat/completions", self.api_base);
        let http_response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| JudgeError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            if let Ok(error_response) = serde_json::from_str::<ApiErrorResponse>(&error_text) {
                return Err(JudgeError::Api {
                    code: status.as_u16(),
                    message: error_response.error.message,
                });
            }
            return Err(JudgeError::Api {
                code: status.as_u16(),
                message: error_text,
            });
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| JudgeError::ParseError(e.to_string()))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or(JudgeError::EmptyResponse)?;

        Ok(JudgeReply {
            content: choice.message.content,
            usage: api_response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_api_cost() {
        let usage = JudgeUsage {
            prompt_tokens: 1000,
            completion_tokens: 100,
            total_tokens: 1100,
        };
        assert!((usage.api_cost() - (5e-6 * 1000.0 + 1.5e-5 * 100.0)).abs() < 1e-12);
    }

    #[test]
    fn test_client_requires_api_key() {
        let config = JudgeConfig::default();
        assert!(matches!(
            VlmJudgeClient::new(&config),
            Err(JudgeError::MissingApiKey)
        ));
    }

    #[test]
    fn test_api_response_parsing() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": "Result: 1"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
        }"#;
        let response: ApiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.choices[0].message.content, "Result: 1");
        assert_eq!(response.usage.total_tokens, 12);
    }
}

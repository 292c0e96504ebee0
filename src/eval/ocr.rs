//! OCR extraction collaborator.
//!
//! The coarse evaluation gate needs screen text, not layout: extraction is
//! delegated to an external OCR service (image + language in, text out)
//! and the result is whitespace-stripped before substring matching.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use crate::config::OcrConfig;
use crate::dataset::Language;
use crate::error::EvalError;

/// OCR collaborator contract.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Extracts the visible text of one screenshot.
    async fn extract_text(&self, image: &Path, language: Language) -> Result<String, EvalError>;
}

/// Strips every whitespace character; key-component matching works on the
/// compacted text.
pub fn normalize_ocr_text(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// HTTP client for an OCR extraction service.
pub struct HttpOcrClient {
    endpoint: String,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: String,
}

impl HttpOcrClient {
    pub fn new(config: &OcrConfig) -> Result<Self, EvalError> {
        Ok(Self {
            endpoint: config.endpoint.clone(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .map_err(|e| EvalError::Ocr(e.to_string()))?,
        })
    }
}

#[async_trait]
impl OcrProvider for HttpOcrClient {
    async fn extract_text(&self, image: &Path, language: Language) -> Result<String, EvalError> {
        let bytes = std::fs::read(image)?;
        let lang = match language {
            Language::English => "en",
            Language::Chinese => "ch",
        };
        let payload = json!({
            "image": BASE64.encode(&bytes),
            "language": lang,
        });

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| EvalError::Ocr(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EvalError::Ocr(format!(
                "OCR service returned {}",
                response.status()
            )));
        }
        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| EvalError::Ocr(e.to_string()))?;
        Ok(normalize_ocr_text(&parsed.text))
    }
}

//! Gemini 客户端实现

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{LlmError, Result};

/// 文本生成能力
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 发送提示词，返回模型回复原文
    async fn ask(&self, prompt: &str) -> Result<String>;
}

/// Gemini 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// API 基础 URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// 模型名称
    #[serde(default = "default_model")]
    pub model: String,

    /// API Key
    #[serde(default)]
    pub api_key: String,

    /// 采样温度
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// 请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_request_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: String::new(),
            temperature: default_temperature(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Gemini generateContent 客户端
pub struct GeminiClient {
    http_client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    /// 创建客户端
    pub fn new(config: GeminiConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(LlmError::ConfigError("未配置 API Key".to_string()));
        }

        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .build()
            .map_err(|e| LlmError::HttpError(e.to_string()))?;

        info!("初始化 Gemini 客户端, 模型: {}", config.model);

        Ok(Self {
            http_client,
            config,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": self.config.temperature }
        })
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn ask(&self, prompt: &str) -> Result<String> {
        debug!("请求模型, 提示词长度: {}", prompt.len());

        let response = self
            .http_client
            .post(self.endpoint())
            .query(&[("key", self.config.api_key.as_str())])
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| LlmError::HttpError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError(status.as_u16(), body));
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let text = body.text().ok_or(LlmError::EmptyResponse)?;
        debug!("模型回复长度: {}", text.len());
        Ok(text)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateContentResponse {
    /// 第一个候选的全部文本片段
    fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GeminiClient {
        GeminiClient::new(GeminiConfig {
            api_key: "test-key".to_string(),
            base_url: "http://localhost:9999/".to_string(),
            ..GeminiConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_missing_api_key() {
        let result = GeminiClient::new(GeminiConfig::default());
        assert!(matches!(result, Err(LlmError::ConfigError(_))));
    }

    #[test]
    fn test_endpoint_and_body() {
        let client = client();
        assert_eq!(
            client.endpoint(),
            "http://localhost:9999/v1beta/models/gemini-2.5-flash:generateContent"
        );

        let body = client.request_body("hello");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
        let temperature = body["generationConfig"]["temperature"].as_f64().unwrap();
        assert!((temperature - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_response_text() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"{\"goal\":"},{"text":"\"x\"}"}]}}]}"#;
        let body: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(body.text().as_deref(), Some(r#"{"goal":"x"}"#));

        let empty: GenerateContentResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(empty.text().is_none());
    }
}

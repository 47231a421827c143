//! 浏览器自动化桥接客户端
//!
//! 页面分析、页面操作和恢复代理由外部浏览器自动化服务提供，
//! 这里通过 HTTP JSON 接口调用：
//!
//! | 接口 | 请求 | 响应 |
//! |---|---|---|
//! | `POST /goto` | `{"url"}` | `{}` |
//! | `POST /observe` | `{"instruction"}` | `{"candidates": [...]}` |
//! | `POST /status` | `{"instruction"}` | `{"status": "..."}` |
//! | `POST /act` | `Candidate` | `{}` |
//! | `POST /replay` | `InteractionRecipe` | `{}` |
//! | `POST /press` | `{"key"}` | `{}` |
//! | `POST /agent` | `{"instruction", "max_steps"}` | `AgentRun` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::interaction::{
    AgentRun, Candidate, RecoveryAgent, UiAnalyzer, UiDriver, UiError, UiResult,
};
use crate::snapshot::InteractionRecipe;

/// 桥接客户端
pub struct UiBridgeClient {
    base_url: String,
    http_client: Client,
}

#[derive(Debug, Deserialize)]
struct ObserveResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: Option<String>,
}

impl UiBridgeClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> UiResult<Self> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| UiError::Transport(e.to_string()))?;

        info!("界面桥接服务: {}", base_url);
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> UiResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        debug!("POST {}", url);

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| UiError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| UiError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(UiError::ActionFailed(format!("[{}] {}", status.as_u16(), text)));
        }
        decode_body(&text)
    }
}

/// 空响应体按 `{}` 处理
fn decode_body<T: DeserializeOwned>(text: &str) -> UiResult<T> {
    let text = if text.trim().is_empty() { "{}" } else { text };
    serde_json::from_str(text).map_err(|e| UiError::Malformed(e.to_string()))
}

#[async_trait]
impl UiAnalyzer for UiBridgeClient {
    async fn observe(&self, instruction: &str) -> UiResult<Vec<Candidate>> {
        let response: ObserveResponse = self
            .post("observe", &json!({ "instruction": instruction }))
            .await?;
        Ok(response.candidates)
    }

    async fn read_status(&self, instruction: &str) -> UiResult<Option<String>> {
        let response: StatusResponse = self
            .post("status", &json!({ "instruction": instruction }))
            .await?;
        Ok(response.status)
    }
}

#[async_trait]
impl UiDriver for UiBridgeClient {
    async fn goto(&self, url: &str) -> UiResult<()> {
        let _: Value = self.post("goto", &json!({ "url": url })).await?;
        Ok(())
    }

    async fn act(&self, candidate: &Candidate) -> UiResult<()> {
        let _: Value = self.post("act", candidate).await?;
        Ok(())
    }

    async fn replay(&self, recipe: &InteractionRecipe) -> UiResult<()> {
        let _: Value = self.post("replay", recipe).await?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> UiResult<()> {
        let _: Value = self.post("press", &json!({ "key": key })).await?;
        Ok(())
    }
}

#[async_trait]
impl RecoveryAgent for UiBridgeClient {
    async fn execute(&self, instruction: &str, max_steps: u32) -> UiResult<AgentRun> {
        self.post(
            "agent",
            &json!({ "instruction": instruction, "max_steps": max_steps }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let client = UiBridgeClient::new("http://127.0.0.1:3000/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.url("/observe"), "http://127.0.0.1:3000/observe");
        assert_eq!(client.url("agent"), "http://127.0.0.1:3000/agent");
    }

    #[test]
    fn test_decode_observe() {
        let response: ObserveResponse = decode_body(
            r##"{"candidates": [{"selector": "#restore", "method": "click", "description": "Restore button"}]}"##,
        )
        .unwrap();
        assert_eq!(response.candidates.len(), 1);
        assert_eq!(response.candidates[0].method.as_deref(), Some("click"));

        let empty: ObserveResponse = decode_body("").unwrap();
        assert!(empty.candidates.is_empty());
    }

    #[test]
    fn test_decode_agent_run() {
        let run: AgentRun = decode_body(
            r#"{"actions": [{"type": "click", "x": 412, "y": 88}], "message": "clicked Restore"}"#,
        )
        .unwrap();
        assert!(run.succeeded());
        assert_eq!(run.first_click(), Some((412, 88)));

        assert!(matches!(
            decode_body::<AgentRun>("<html>"),
            Err(UiError::Malformed(_))
        ));
    }
}

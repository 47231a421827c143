//! ATP 大模型客户端
//!
//! 为决策服务提供文本生成能力：输入提示词，返回模型回复原文。

mod client;
mod error;

pub use client::{GeminiClient, GeminiConfig, LlmClient};
pub use error::{LlmError, Result};

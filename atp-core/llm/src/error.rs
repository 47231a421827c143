//! 大模型客户端错误定义

use thiserror::Error;

/// 大模型客户端错误类型
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP 错误: {0}")]
    HttpError(String),

    #[error("API 错误 [{0}]: {1}")]
    ApiError(u16, String),

    #[error("解析错误: {0}")]
    ParseError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("模型未返回内容")]
    EmptyResponse,
}

/// 大模型客户端结果类型
pub type Result<T> = std::result::Result<T, LlmError>;

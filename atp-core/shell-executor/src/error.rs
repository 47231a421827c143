//! 命令执行错误定义

use thiserror::Error;

/// 命令执行结果类型
pub type Result<T> = std::result::Result<T, ShellError>;

/// 命令执行错误类型
#[derive(Error, Debug)]
pub enum ShellError {
    /// 连接错误
    #[error("连接失败: {0}")]
    ConnectionError(String),

    /// 认证错误
    #[error("认证失败: {0}")]
    AuthenticationError(String),

    /// 进程启动错误
    #[error("进程启动失败: {0}")]
    SpawnError(String),

    /// 命令执行错误
    #[error("命令执行失败: {0}")]
    ExecutionError(String),

    /// 超时错误
    #[error("操作超时: {0}")]
    TimeoutError(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),
}

impl ShellError {
    /// 是否为超时
    pub fn is_timeout(&self) -> bool {
        matches!(self, ShellError::TimeoutError(_))
    }
}

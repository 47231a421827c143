//! 动作执行结果

use atp_shell_executor::{CommandOutput, ShellError};
use serde::{Deserialize, Serialize};

use crate::action::Action;

/// 单次分发的执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// 是否成功
    pub success: bool,

    /// 标准输出
    #[serde(default)]
    pub stdout: String,

    /// 标准错误
    #[serde(default)]
    pub stderr: String,

    /// 退出码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// 错误信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// 致命失败：不再征询是否继续
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fatal: bool,

    /// 命令因超时被终止
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// 标记为致命失败
    pub fn into_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    /// 设置标准输出
    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// 提示词中的退出码，超时单独标出
    pub fn exit_code_text(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        self.exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    }

    /// 失败原因的简要描述
    pub fn error_text(&self) -> &str {
        if let Some(error) = &self.error {
            return error;
        }
        if !self.stderr.is_empty() {
            return &self.stderr;
        }
        if !self.stdout.is_empty() {
            return &self.stdout;
        }
        "未知错误"
    }
}

impl From<CommandOutput> for ExecutionResult {
    fn from(output: CommandOutput) -> Self {
        Self {
            success: output.is_success(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            error: None,
            fatal: false,
            timed_out: false,
        }
    }
}

impl From<ShellError> for ExecutionResult {
    fn from(err: ShellError) -> Self {
        Self {
            timed_out: err.is_timeout(),
            ..Self::failure(err.to_string())
        }
    }
}

/// 历史记录：已分发的动作及其结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: Action,
    pub result: ExecutionResult,
}

impl HistoryEntry {
    pub fn new(action: Action, result: ExecutionResult) -> Self {
        Self { action, result }
    }
}

/// 把最近的历史压缩成每行一条的摘要
pub fn summarize_history(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return "No previous actions".to_string();
    }

    history
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let mark = if entry.result.success { "✓" } else { "✗" };
            format!("{}. {} {}", i + 1, mark, entry.action.describe())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Transport;

    #[test]
    fn test_from_command_output() {
        let result = ExecutionResult::from(CommandOutput {
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        });
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));

        let result = ExecutionResult::from(CommandOutput {
            stdout: String::new(),
            stderr: "No such file".to_string(),
            exit_code: Some(1),
        });
        assert!(!result.success);
        assert_eq!(result.error_text(), "No such file");
    }

    #[test]
    fn test_from_shell_error() {
        let result = ExecutionResult::from(ShellError::TimeoutError("sleep 100".to_string()));
        assert!(!result.success);
        assert!(result.error_text().contains("sleep 100"));
        assert!(result.timed_out);
        assert!(!result.fatal);
        assert_eq!(result.exit_code_text(), "timed out");

        let result = ExecutionResult::from(ShellError::SpawnError("sshpass".to_string()));
        assert!(!result.success);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code_text(), "n/a");
    }

    #[test]
    fn test_timed_out_only_serialized_when_set() {
        let value = serde_json::to_value(ExecutionResult::failure("exit 1")).unwrap();
        assert!(value.get("timed_out").is_none());

        let result = ExecutionResult::from(ShellError::TimeoutError("sleep 100".to_string()));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["timed_out"], true);
    }

    #[test]
    fn test_summarize_history() {
        assert_eq!(summarize_history(&[]), "No previous actions");

        let history = vec![
            HistoryEntry::new(
                Action::RunCommand {
                    transport: Transport::Ssh,
                    command: "uptime".to_string(),
                },
                ExecutionResult::success("up 3 days"),
            ),
            HistoryEntry::new(
                Action::VerifyOutput {
                    expected: "up".to_string(),
                },
                ExecutionResult::failure("mismatch"),
            ),
        ];
        let summary = summarize_history(&history);
        assert_eq!(summary.lines().count(), 2);
        assert!(summary.starts_with("1. ✓ command on ssh: uptime"));
        assert!(summary.contains("2. ✗ verify_output"));
    }
}

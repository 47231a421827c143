//! 本地 shell 执行

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Result, ShellError};
use crate::output::CommandOutput;

/// 本地 shell（`sh -c`）
#[derive(Debug, Clone)]
pub struct LocalShell {
    shell: String,
    timeout: Duration,
}

impl Default for LocalShell {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl LocalShell {
    /// 设置 shell 程序
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// 设置命令超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 执行命令
    pub async fn execute(&self, command: &str) -> Result<CommandOutput> {
        debug!("执行本地命令: {}", command);

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        run_with_timeout(cmd, self.timeout, command).await
    }
}

/// 启动进程并在超时内收集输出
pub(crate) async fn run_with_timeout(
    mut cmd: Command,
    limit: Duration,
    label: &str,
) -> Result<CommandOutput> {
    let child = cmd
        .spawn()
        .map_err(|e| ShellError::SpawnError(format!("{}: {}", label, e)))?;

    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| ShellError::TimeoutError(format!("{} ({}s)", label, limit.as_secs())))?
        .map_err(|e| ShellError::ExecutionError(format!("等待进程失败: {}", e)))?;

    let result = CommandOutput::from(output);
    debug!("命令执行完成, 退出码: {:?}", result.exit_code);
    Ok(result)
}

//! PowerShell 执行
//!
//! 本地命令通过 `powershell -NoProfile -NonInteractive -Command` 执行；
//! 远程命令通过 `Invoke-Command` 加 PSCredential 在目标主机执行。

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::PowerShellConfig;
use crate::error::{Result, ShellError};
use crate::local::run_with_timeout;
use crate::output::CommandOutput;

/// PowerShell 客户端
#[derive(Debug, Clone)]
pub struct PowerShellClient {
    config: PowerShellConfig,
}

impl PowerShellClient {
    /// 仅本地执行的客户端
    pub fn local(config: PowerShellConfig) -> Self {
        Self { config }
    }

    /// 建立远程会话（通过 `Test-WSMan` 探测 WinRM 可达性）
    pub async fn connect(config: PowerShellConfig) -> Result<Self> {
        let host = config
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ShellError::ConfigError("PowerShell 远程主机未配置".to_string()))?;

        info!("正在连接 PowerShell 远程主机: {}", host);

        let client = Self { config };
        let probe = format!("Test-WSMan -ComputerName {} -ErrorAction Stop", host);
        let output = client
            .run_local(&probe, client.config.local_timeout)
            .await?;

        if !output.is_success() {
            return Err(ShellError::ConnectionError(format!(
                "WinRM 不可达 {}: {}",
                host,
                output.failure_text()
            )));
        }

        info!("PowerShell 远程主机连接成功: {}", host);
        Ok(client)
    }

    /// 在本机执行 PowerShell 命令
    pub async fn execute_local(&self, command: &str) -> Result<CommandOutput> {
        self.run_local(command, self.config.local_timeout).await
    }

    /// 在远程主机执行 PowerShell 命令
    pub async fn execute_remote(&self, command: &str) -> Result<CommandOutput> {
        let script = self.remote_script(command)?;
        debug!("执行远程 PowerShell 命令: {}", command);
        self.run_local(&script, self.config.remote_timeout).await
    }

    /// 已配置远程主机时远程执行，否则本地执行
    pub async fn execute(&self, command: &str) -> Result<CommandOutput> {
        if self.config.is_remote() {
            self.execute_remote(command).await
        } else {
            self.execute_local(command).await
        }
    }

    fn remote_script(&self, command: &str) -> Result<String> {
        let host = self
            .config
            .host
            .as_deref()
            .ok_or_else(|| ShellError::ConfigError("PowerShell 远程主机未配置".to_string()))?;
        let username = self.config.username.as_deref().unwrap_or_default();
        let password = self.config.password.as_deref().unwrap_or_default();

        Ok(format!(
            "$password = ConvertTo-SecureString '{}' -AsPlainText -Force; \
             $cred = New-Object System.Management.Automation.PSCredential('{}', $password); \
             Invoke-Command -ComputerName {} -Credential $cred -ScriptBlock {{ {} }} -ErrorAction Stop",
            escape_single_quoted(password),
            escape_single_quoted(username),
            host,
            command
        ))
    }

    async fn run_local(&self, command: &str, limit: Duration) -> Result<CommandOutput> {
        debug!("执行本地 PowerShell 命令: {}", command);

        let mut cmd = Command::new(&self.config.program);
        cmd.arg("-NoProfile")
            .arg("-NonInteractive")
            .arg("-Command")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        run_with_timeout(cmd, limit, &self.config.program).await
    }

    /// 断开远程会话
    pub async fn disconnect(self) -> Result<()> {
        if let Some(host) = &self.config.host {
            info!("断开 PowerShell 远程主机: {}", host);
        }
        Ok(())
    }

    /// 获取配置
    pub fn config(&self) -> &PowerShellConfig {
        &self.config
    }
}

fn escape_single_quoted(value: &str) -> String {
    value.replace('\'', "''")
}

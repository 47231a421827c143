//! SSH 客户端实现
//!
//! 使用系统 ssh/sshpass 命令执行远程命令

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::{AuthMethod, SshConfig};
use crate::error::{Result, ShellError};
use crate::output::CommandOutput;

/// SSH 客户端（使用系统 ssh 命令）
#[derive(Debug)]
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    /// 连接到 SSH 服务器（执行探测命令验证连接）
    pub async fn connect(config: SshConfig) -> Result<Self> {
        info!("正在连接 SSH: {}@{}", config.username, config.address());

        let client = Self { config };

        debug!("验证 SSH 连接...");
        let output = client.execute("echo connected").await?;

        if output.stdout.trim() != "connected" {
            return Err(ShellError::ConnectionError(format!(
                "SSH 连接验证失败: {}",
                output.failure_text()
            )));
        }

        info!(
            "SSH 连接成功: {}@{}",
            client.config.username,
            client.config.address()
        );
        Ok(client)
    }

    /// 执行命令
    pub async fn execute(&self, command: &str) -> Result<CommandOutput> {
        debug!("执行 SSH 命令: {}", command);

        timeout(self.config.command_timeout, self.execute_internal(command))
            .await
            .map_err(|_| ShellError::TimeoutError(format!("SSH 命令执行超时: {}", command)))?
    }

    async fn execute_internal(&self, command: &str) -> Result<CommandOutput> {
        let mut cmd = self.build_command(command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| ShellError::SpawnError(format!("启动 SSH 进程失败: {}", e)))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ShellError::ExecutionError(format!("等待 SSH 进程失败: {}", e)))?;

        let result = CommandOutput::from(output);

        // sshpass 认证失败返回 5，ssh 自身失败返回 255
        if matches!(result.exit_code, Some(5) | Some(255))
            && (result.stderr.contains("Permission denied")
                || result.stderr.contains("Authentication failed"))
        {
            return Err(ShellError::AuthenticationError(result.stderr));
        }

        debug!(
            "SSH 命令执行完成, 退出码: {:?}, stdout 长度: {}, stderr 长度: {}",
            result.exit_code,
            result.stdout.len(),
            result.stderr.len()
        );

        Ok(result)
    }

    fn build_command(&self, command: &str) -> Command {
        let mut cmd = match &self.config.auth {
            AuthMethod::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-p").arg(password).arg("ssh");
                cmd
            }
            AuthMethod::Key { key_path } => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-i").arg(expand_path(key_path));
                cmd
            }
            AuthMethod::DefaultKey => Command::new("ssh"),
        };

        cmd.arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs()
            ))
            .arg("-o")
            .arg("NumberOfPasswordPrompts=1")
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg(format!("{}@{}", self.config.username, self.config.host))
            .arg(command);
        cmd
    }

    /// 关闭连接（系统 ssh 命令无常驻连接）
    pub async fn disconnect(self) -> Result<()> {
        info!("断开 SSH: {}", self.config.address());
        Ok(())
    }

    /// 获取配置
    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

/// 展开路径（处理 ~）
fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return PathBuf::from(format!("{}{}", home.to_string_lossy(), rest));
        }
    }
    path.to_path_buf()
}

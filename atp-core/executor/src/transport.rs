//! 执行通道适配
//!
//! 把 `atp-shell-executor` 的系统进程执行器接入会话路由。

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use atp_shell_executor::{
    CommandOutput, LocalShell, PowerShellClient, PowerShellConfig, Result as ShellResult,
    ShellError, SshClient, SshConfig,
};
use serde::{Deserialize, Serialize};

use crate::action::Credentials;
use crate::router::{CommandRunner, RemoteSession, SessionConnector, SessionRouter};

/// SSH 连接默认参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshDefaults {
    /// 端口
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// 连接超时 (秒)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// 命令超时 (秒)
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    /// 未提供密码时使用的私钥
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_command_timeout() -> u64 {
    60
}

impl Default for SshDefaults {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            key_path: None,
        }
    }
}

impl SshDefaults {
    /// 由连接目标生成 SSH 配置
    pub fn config_for(&self, target: &Credentials) -> SshConfig {
        let config = if !target.password.is_empty() {
            SshConfig::with_password(&target.host, &target.username, &target.password)
        } else if let Some(key) = &self.key_path {
            SshConfig::with_key(&target.host, &target.username, key)
        } else {
            SshConfig::with_default_key(&target.host, &target.username)
        };

        config
            .port(self.port)
            .connect_timeout(Duration::from_secs(self.connect_timeout))
            .command_timeout(Duration::from_secs(self.command_timeout))
    }
}

/// 本地 shell
pub struct SystemShell(pub LocalShell);

#[async_trait]
impl CommandRunner for SystemShell {
    async fn run(&self, command: &str) -> ShellResult<CommandOutput> {
        self.0.execute(command).await
    }
}

/// SSH 会话
pub struct SshSession(SshClient);

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&self, command: &str) -> ShellResult<CommandOutput> {
        self.0.execute(command).await
    }

    async fn close(self: Box<Self>) -> ShellResult<()> {
        self.0.disconnect().await
    }
}

/// SSH 连接器
pub struct SshConnector {
    defaults: SshDefaults,
}

impl SshConnector {
    pub fn new(defaults: SshDefaults) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn open(&self, target: &Credentials) -> ShellResult<Box<dyn RemoteSession>> {
        let client = SshClient::connect(self.defaults.config_for(target)).await?;
        Ok(Box::new(SshSession(client)))
    }
}

/// PowerShell 远程会话
pub struct PowerShellSession(PowerShellClient);

#[async_trait]
impl RemoteSession for PowerShellSession {
    async fn run(&self, command: &str) -> ShellResult<CommandOutput> {
        self.0.execute_remote(command).await
    }

    async fn close(self: Box<Self>) -> ShellResult<()> {
        self.0.disconnect().await
    }
}

/// PowerShell 连接器（WinRM）
pub struct PowerShellConnector {
    base: PowerShellConfig,
}

impl PowerShellConnector {
    pub fn new(base: PowerShellConfig) -> Self {
        Self { base }
    }
}

#[async_trait]
impl SessionConnector for PowerShellConnector {
    async fn open(&self, target: &Credentials) -> ShellResult<Box<dyn RemoteSession>> {
        if target.password.is_empty() {
            return Err(ShellError::ConfigError(
                "PowerShell 远程连接需要密码".to_string(),
            ));
        }
        let config = PowerShellConfig {
            host: Some(target.host.clone()),
            username: Some(target.username.clone()),
            password: Some(target.password.clone()),
            ..self.base.clone()
        };
        let client = PowerShellClient::connect(config).await?;
        Ok(Box::new(PowerShellSession(client)))
    }
}

/// 本地 PowerShell
pub struct LocalPowerShell(pub PowerShellClient);

#[async_trait]
impl CommandRunner for LocalPowerShell {
    async fn run(&self, command: &str) -> ShellResult<CommandOutput> {
        self.0.execute_local(command).await
    }
}

/// 使用系统进程的路由器：本地 shell + SSH + PowerShell
pub fn system_router(ssh: &SshDefaults, powershell: &PowerShellConfig) -> SessionRouter {
    SessionRouter::new(Box::new(SystemShell(LocalShell::default())))
        .with_ssh(Box::new(SshConnector::new(ssh.clone())))
        .with_powershell(
            Box::new(PowerShellConnector::new(powershell.clone())),
            Box::new(LocalPowerShell(PowerShellClient::local(powershell.clone()))),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, Transport};
    use atp_shell_executor::AuthMethod;

    #[test]
    fn test_ssh_config_for_password() {
        let defaults = SshDefaults {
            port: 2222,
            ..SshDefaults::default()
        };
        let config = defaults.config_for(&Credentials::new("10.0.0.1", "root", "pw"));
        assert_eq!(config.port, 2222);
        assert_eq!(config.connect_timeout.as_secs(), 10);
        assert!(matches!(config.auth, AuthMethod::Password(_)));
    }

    #[test]
    fn test_ssh_config_without_password() {
        let defaults = SshDefaults {
            key_path: Some(PathBuf::from("/root/.ssh/id_ed25519")),
            ..SshDefaults::default()
        };
        let config = defaults.config_for(&Credentials::new("10.0.0.1", "root", ""));
        assert!(matches!(config.auth, AuthMethod::Key { .. }));

        let config = SshDefaults::default().config_for(&Credentials::new("h", "u", ""));
        assert!(matches!(config.auth, AuthMethod::DefaultKey));
    }

    #[tokio::test]
    async fn test_powershell_connect_requires_password() {
        let connector = PowerShellConnector::new(PowerShellConfig::default());
        let err = connector
            .open(&Credentials::new("win01", "Administrator", ""))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ShellError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_system_router_local_command() {
        let mut router = system_router(&SshDefaults::default(), &PowerShellConfig::default());
        let result = router
            .dispatch(&Action::RunCommand {
                transport: Transport::Local,
                command: "echo EXISTS".to_string(),
            })
            .await;
        assert!(result.success);
        assert_eq!(result.stdout, "EXISTS");
        assert!(
            router
                .dispatch(&Action::VerifyOutput {
                    expected: "EXISTS".to_string()
                })
                .await
                .success
        );
    }
}

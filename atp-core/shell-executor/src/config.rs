//! 执行通道配置

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// SSH 认证方式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthMethod {
    /// 密码认证（通过 sshpass）
    Password(String),
    /// 密钥认证
    Key {
        /// 私钥路径
        key_path: PathBuf,
    },
    /// 使用默认密钥（~/.ssh/id_rsa 等）
    DefaultKey,
}

/// SSH 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// 主机地址
    pub host: String,
    /// 端口（默认 22）
    pub port: u16,
    /// 用户名
    pub username: String,
    /// 认证方式
    pub auth: AuthMethod,
    /// 连接超时
    #[serde(with = "duration_secs", default = "default_ssh_connect_timeout")]
    pub connect_timeout: Duration,
    /// 命令执行超时
    #[serde(with = "duration_secs", default = "default_ssh_command_timeout")]
    pub command_timeout: Duration,
}

fn default_ssh_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_ssh_command_timeout() -> Duration {
    Duration::from_secs(60)
}

impl SshConfig {
    /// 使用密码认证创建配置
    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, username, AuthMethod::Password(password.into()))
    }

    /// 使用密钥认证创建配置
    pub fn with_key(
        host: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            host,
            username,
            AuthMethod::Key {
                key_path: key_path.into(),
            },
        )
    }

    /// 使用默认密钥认证创建配置
    pub fn with_default_key(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self::new(host, username, AuthMethod::DefaultKey)
    }

    fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth,
            connect_timeout: default_ssh_connect_timeout(),
            command_timeout: default_ssh_command_timeout(),
        }
    }

    /// 设置端口
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// 设置连接超时
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 设置命令执行超时
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// 获取 SSH 地址字符串（host:port 格式）
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// PowerShell 配置
///
/// `host` 为空表示仅本地执行。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerShellConfig {
    /// 远程主机（WinRM）
    #[serde(default)]
    pub host: Option<String>,
    /// 用户名
    #[serde(default)]
    pub username: Option<String>,
    /// 密码
    #[serde(default)]
    pub password: Option<String>,
    /// 可执行文件
    #[serde(default = "default_powershell_program")]
    pub program: String,
    /// 本地命令超时
    #[serde(with = "duration_secs", default = "default_local_timeout")]
    pub local_timeout: Duration,
    /// 远程命令超时
    #[serde(with = "duration_secs", default = "default_remote_timeout")]
    pub remote_timeout: Duration,
}

fn default_powershell_program() -> String {
    "powershell.exe".to_string()
}

fn default_local_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for PowerShellConfig {
    fn default() -> Self {
        Self {
            host: None,
            username: None,
            password: None,
            program: default_powershell_program(),
            local_timeout: default_local_timeout(),
            remote_timeout: default_remote_timeout(),
        }
    }
}

impl PowerShellConfig {
    /// 远程会话配置
    pub fn remote(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: Some(host.into()),
            username: Some(username.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }

    /// 设置可执行文件（如 `pwsh`）
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// 是否配置了远程主机
    pub fn is_remote(&self) -> bool {
        self.host.as_deref().map_or(false, |h| !h.is_empty())
    }
}

/// Duration 以秒数序列化
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_config() {
        let config = SshConfig::with_password("192.168.1.100", "root", "password123");
        assert_eq!(config.host, "192.168.1.100");
        assert_eq!(config.port, 22);
        assert_eq!(config.username, "root");
        assert_eq!(config.connect_timeout.as_secs(), 10);
        assert!(matches!(config.auth, AuthMethod::Password(_)));
    }

    #[test]
    fn test_config_builder() {
        let config = SshConfig::with_key("host", "user", "~/.ssh/id_ed25519")
            .port(2222)
            .command_timeout(Duration::from_secs(5));
        assert_eq!(config.port, 2222);
        assert_eq!(config.address(), "host:2222");
        assert_eq!(config.command_timeout.as_secs(), 5);
        assert!(matches!(config.auth, AuthMethod::Key { .. }));
    }

    #[test]
    fn test_powershell_defaults() {
        let local = PowerShellConfig::default();
        assert!(!local.is_remote());
        assert_eq!(local.program, "powershell.exe");
        assert_eq!(local.local_timeout.as_secs(), 30);
        assert_eq!(local.remote_timeout.as_secs(), 60);

        let remote = PowerShellConfig::remote("win01", "Administrator", "secret").program("pwsh");
        assert!(remote.is_remote());
        assert_eq!(remote.program, "pwsh");
    }
}

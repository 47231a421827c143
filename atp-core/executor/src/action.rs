//! 动作定义
//!
//! 动作来源有两种：
//! - 决策服务给出的动作命令列表（`ssh_run("uptime")` 这类调用式文本）
//! - 决策服务直接返回的 JSON 动作（`{"type": ..., "machine": ..., "command": ...}`）
//!
//! 两者都在这里被转换为封闭的 [`Action`] 枚举，路由时按枚举穷举匹配。

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ExecutorError, Result};

/// 动作列表的结束标记
pub const DONE_SENTINEL: &str = "done";

/// 执行通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Local,
    Ssh,
    #[serde(rename = "powershell")]
    PowerShell,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Local => write!(f, "local"),
            Transport::Ssh => write!(f, "ssh"),
            Transport::PowerShell => write!(f, "powershell"),
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Transport::Local),
            "ssh" => Ok(Transport::Ssh),
            "powershell" | "windows" => Ok(Transport::PowerShell),
            other => Err(format!("未知执行通道: {}", other)),
        }
    }
}

/// 连接目标
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub host: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    fn from_args(args: &[String]) -> Self {
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        Self::new(arg(0), arg(1), arg(2))
    }

    fn from_params(params: &Map<String, Value>) -> Self {
        let param = |key: &str| {
            params
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self::new(param("host"), param("username"), param("password"))
    }
}

/// 动作类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Connect,
    Disconnect,
    Command,
    Capability,
    Verify,
    Generic,
}

/// 可分发的动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// 建立 SSH 会话
    SshConnect {
        credentials: Credentials,
    },
    /// 断开 SSH 会话
    SshDisconnect,
    /// 建立 PowerShell 远程会话
    #[serde(rename = "powershell_connect")]
    PowerShellConnect {
        credentials: Credentials,
    },
    /// 断开 PowerShell 远程会话
    #[serde(rename = "powershell_disconnect")]
    PowerShellDisconnect,
    /// 在指定通道执行命令
    #[serde(rename = "command")]
    RunCommand { transport: Transport, command: String },
    /// PowerShell 命令：已建立远程会话时远程执行，否则本地执行
    #[serde(rename = "powershell_command")]
    PowerShellCommand { command: String },
    /// 本地 PowerShell 能力探测，输出为空即致命失败
    #[serde(rename = "powershell_capability")]
    PowerShellCapability { command: String },
    /// 校验上一条命令输出
    VerifyOutput { expected: String },
    /// 未识别的调用
    Generic { name: String, args: Vec<String> },
}

impl Action {
    /// 动作名称（与动作命令中的调用名一致）
    pub fn name(&self) -> &str {
        match self {
            Action::SshConnect { .. } => "ssh_connect",
            Action::SshDisconnect => "ssh_disconnect",
            Action::PowerShellConnect { .. } => "powershell_connect",
            Action::PowerShellDisconnect => "powershell_disconnect",
            Action::RunCommand { .. } => "command",
            Action::PowerShellCommand { .. } => "powershell_command",
            Action::PowerShellCapability { .. } => "powershell_capability",
            Action::VerifyOutput { .. } => "verify_output",
            Action::Generic { name, .. } => name.as_str(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::SshConnect { .. } | Action::PowerShellConnect { .. } => ActionKind::Connect,
            Action::SshDisconnect | Action::PowerShellDisconnect => ActionKind::Disconnect,
            Action::RunCommand { .. } | Action::PowerShellCommand { .. } => ActionKind::Command,
            Action::PowerShellCapability { .. } => ActionKind::Capability,
            Action::VerifyOutput { .. } => ActionKind::Verify,
            Action::Generic { .. } => ActionKind::Generic,
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            Action::SshConnect { .. } | Action::SshDisconnect => Transport::Ssh,
            Action::PowerShellConnect { .. }
            | Action::PowerShellDisconnect
            | Action::PowerShellCommand { .. }
            | Action::PowerShellCapability { .. } => Transport::PowerShell,
            Action::RunCommand { transport, .. } => *transport,
            Action::VerifyOutput { .. } | Action::Generic { .. } => Transport::Local,
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Action::RunCommand { command, .. }
            | Action::PowerShellCommand { command }
            | Action::PowerShellCapability { command } => Some(command),
            _ => None,
        }
    }

    /// 校验类动作失败是测试结论，不进入自愈
    pub fn is_verification(&self) -> bool {
        self.kind() == ActionKind::Verify
    }

    /// 建立连接的动作
    pub fn is_connection(&self) -> bool {
        self.kind() == ActionKind::Connect
    }

    /// 是否产生可供校验的命令输出
    pub fn produces_output(&self) -> bool {
        matches!(self.kind(), ActionKind::Command | ActionKind::Capability)
    }

    /// 单行描述，用于日志和历史摘要
    pub fn describe(&self) -> String {
        let mut desc = format!("{} on {}", self.name(), self.transport());
        match self {
            Action::VerifyOutput { expected } => {
                desc.push_str(&format!(": {}", expected));
            }
            Action::SshConnect { credentials } | Action::PowerShellConnect { credentials } => {
                desc.push_str(&format!(": {}@{}", credentials.username, credentials.host));
            }
            _ => {
                if let Some(command) = self.command() {
                    let short: String = command.chars().take(50).collect();
                    desc.push_str(&format!(": {}", short));
                }
            }
        }
        desc
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// 动作列表中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedStep {
    Done,
    Action(Action),
}

/// 解析调用式动作命令
///
/// 调用名决定动作类型，双引号内的字符串按位置作为参数。
pub fn parse_action_command(text: &str) -> Result<PlannedStep> {
    let text = text.trim();
    if text.eq_ignore_ascii_case(DONE_SENTINEL) {
        return Ok(PlannedStep::Done);
    }

    let call_re = Regex::new(r"(?s)^(\w+)\((.*)\)\s*$")
        .map_err(|e| ExecutorError::InvalidActionCommand(e.to_string()))?;
    let caps = call_re
        .captures(text)
        .ok_or_else(|| ExecutorError::InvalidActionCommand(text.to_string()))?;

    let name = &caps[1];
    let arg_re = Regex::new(r#""([^"]*)""#)
        .map_err(|e| ExecutorError::InvalidActionCommand(e.to_string()))?;
    let args: Vec<String> = arg_re
        .captures_iter(&caps[2])
        .map(|c| c[1].to_string())
        .collect();
    let first = || args.first().cloned().unwrap_or_default();

    let action = match name {
        "ssh_connect" => Action::SshConnect {
            credentials: Credentials::from_args(&args),
        },
        "ssh_disconnect" => Action::SshDisconnect,
        "ssh_run" => Action::RunCommand {
            transport: Transport::Ssh,
            command: first(),
        },
        "powershell_connect" => Action::PowerShellConnect {
            credentials: Credentials::from_args(&args),
        },
        "powershell_disconnect" => Action::PowerShellDisconnect,
        "powershell_run" => Action::RunCommand {
            transport: Transport::PowerShell,
            command: first(),
        },
        "powershell_command" => Action::PowerShellCommand { command: first() },
        "powershell_capability" => Action::PowerShellCapability { command: first() },
        "local_run" => Action::RunCommand {
            transport: Transport::Local,
            command: first(),
        },
        "verify_output" => Action::VerifyOutput { expected: first() },
        other => Action::Generic {
            name: other.to_string(),
            args,
        },
    };

    Ok(PlannedStep::Action(action))
}

/// 决策服务返回的 JSON 动作
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireAction {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl TryFrom<WireAction> for Action {
    type Error = String;

    fn try_from(wire: WireAction) -> std::result::Result<Self, Self::Error> {
        let command = wire.command.clone().unwrap_or_default();
        let require_command = |kind: &str| {
            if command.trim().is_empty() {
                Err(format!("动作 {} 缺少 command 字段", kind))
            } else {
                Ok(command.clone())
            }
        };
        let machine = || -> std::result::Result<Transport, String> {
            wire.machine
                .as_deref()
                .map(Transport::from_str)
                .unwrap_or(Ok(Transport::Local))
        };

        let action = match wire.kind.as_str() {
            "ssh_connect" => Action::SshConnect {
                credentials: Credentials::from_params(&wire.params),
            },
            "ssh_disconnect" => Action::SshDisconnect,
            "powershell_connect" => Action::PowerShellConnect {
                credentials: Credentials::from_params(&wire.params),
            },
            "powershell_disconnect" => Action::PowerShellDisconnect,
            "verify_output" | "verify" => Action::VerifyOutput {
                expected: wire
                    .params
                    .get("expected")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "powershell_command" => Action::PowerShellCommand {
                command: require_command("powershell_command")?,
            },
            "powershell_capability" => Action::PowerShellCapability {
                command: require_command("powershell_capability")?,
            },
            "ssh_run" => Action::RunCommand {
                transport: Transport::Ssh,
                command: require_command("ssh_run")?,
            },
            "local_run" => Action::RunCommand {
                transport: Transport::Local,
                command: require_command("local_run")?,
            },
            "powershell_run" => Action::RunCommand {
                transport: Transport::PowerShell,
                command: require_command("powershell_run")?,
            },
            "command" | "" => Action::RunCommand {
                transport: machine()?,
                command: require_command("command")?,
            },
            _ if !command.trim().is_empty() => Action::RunCommand {
                transport: machine()?,
                command: command.clone(),
            },
            other => Action::Generic {
                name: other.to_string(),
                args: wire
                    .params
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                            .collect()
                    })
                    .unwrap_or_default(),
            },
        };

        Ok(action)
    }
}

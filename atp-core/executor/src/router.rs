//! 会话路由
//!
//! 每个远程执行通道（SSH、PowerShell）维护一份会话状态，
//! 动作按类型和通道分发到对应的执行器。所有失败都以
//! [`ExecutionResult`] 返回，路由本身不会返回错误。

use async_trait::async_trait;
use atp_shell_executor::{CommandOutput, Result as ShellResult};
use tracing::{debug, info, warn};

use crate::action::{Action, Credentials, Transport};
use crate::result::ExecutionResult;

/// 已建立的远程会话
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn run(&self, command: &str) -> ShellResult<CommandOutput>;

    async fn close(self: Box<Self>) -> ShellResult<()>;
}

/// 远程会话的建立方式
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(&self, target: &Credentials) -> ShellResult<Box<dyn RemoteSession>>;
}

/// 无需会话的命令执行器（本地 shell、本地 PowerShell）
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> ShellResult<CommandOutput>;
}

/// 单个通道的会话状态
#[derive(Default)]
pub struct SessionState {
    connected: bool,
    target: Option<Credentials>,
    handle: Option<Box<dyn RemoteSession>>,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn target(&self) -> Option<&Credentials> {
        self.target.as_ref()
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("connected", &self.connected)
            .field("host", &self.target.as_ref().map(|t| t.host.as_str()))
            .finish()
    }
}

#[derive(Default)]
struct SessionSlot {
    connector: Option<Box<dyn SessionConnector>>,
    state: SessionState,
}

/// 会话路由器
pub struct SessionRouter {
    local: Box<dyn CommandRunner>,
    local_powershell: Option<Box<dyn CommandRunner>>,
    ssh: SessionSlot,
    powershell: SessionSlot,
    last_output: Option<ExecutionResult>,
    last_result: Option<ExecutionResult>,
}

impl SessionRouter {
    /// 创建路由器，所有会话初始为断开状态
    pub fn new(local: Box<dyn CommandRunner>) -> Self {
        Self {
            local,
            local_powershell: None,
            ssh: SessionSlot::default(),
            powershell: SessionSlot::default(),
            last_output: None,
            last_result: None,
        }
    }

    /// 配置 SSH 通道
    pub fn with_ssh(mut self, connector: Box<dyn SessionConnector>) -> Self {
        self.ssh.connector = Some(connector);
        self
    }

    /// 配置 PowerShell 通道（远程会话 + 本地执行）
    pub fn with_powershell(
        mut self,
        connector: Box<dyn SessionConnector>,
        local: Box<dyn CommandRunner>,
    ) -> Self {
        self.powershell.connector = Some(connector);
        self.local_powershell = Some(local);
        self
    }

    /// 分发一个动作
    pub async fn dispatch(&mut self, action: &Action) -> ExecutionResult {
        debug!("分发动作: {}", action);

        let result = match action {
            Action::SshConnect { credentials } => self.connect(Transport::Ssh, credentials).await,
            Action::SshDisconnect => self.disconnect(Transport::Ssh).await,
            Action::PowerShellConnect { credentials } => {
                self.connect(Transport::PowerShell, credentials).await
            }
            Action::PowerShellDisconnect => self.disconnect(Transport::PowerShell).await,
            Action::RunCommand {
                transport: Transport::Local,
                command,
            } => ExecutionResult::from_shell(self.local.run(command).await),
            Action::RunCommand { transport, command } => self.run_remote(*transport, command).await,
            Action::PowerShellCommand { command } => {
                if self.powershell.state.connected {
                    self.run_remote(Transport::PowerShell, command).await
                } else {
                    self.run_local_powershell(command).await
                }
            }
            Action::PowerShellCapability { command } => {
                let result = self.run_local_powershell(command).await;
                if result.stdout.trim().is_empty() {
                    ExecutionResult::failure(format!("缺少必需的 PowerShell 能力: {}", command))
                        .into_fatal()
                } else {
                    result
                }
            }
            Action::VerifyOutput { expected } => self.verify(expected),
            Action::Generic { name, .. } => ExecutionResult::failure(format!(
                "未知动作类型或执行通道: {}/{}",
                name,
                action.transport()
            )),
        };

        if result.success && action.produces_output() {
            self.last_output = Some(result.clone());
        }
        self.last_result = Some(result.clone());
        result
    }

    async fn connect(&mut self, transport: Transport, target: &Credentials) -> ExecutionResult {
        let slot = self.slot_mut(transport);
        let Some(connector) = slot.connector.as_ref() else {
            return ExecutionResult::failure(format!("{} 执行通道未配置", transport));
        };

        if target.host.is_empty() || target.username.is_empty() {
            return ExecutionResult::failure(format!("缺少 {} 连接凭据", transport));
        }

        match connector.open(target).await {
            Ok(handle) => {
                if let Some(previous) = slot.state.handle.replace(handle) {
                    if let Err(e) = previous.close().await {
                        warn!("关闭旧的 {} 会话失败: {}", transport, e);
                    }
                }
                slot.state.connected = true;
                slot.state.target = Some(target.clone());
                info!("{} 会话已建立: {}@{}", transport, target.username, target.host);
                ExecutionResult::success(format!("Connected to {}", target.host))
            }
            Err(e) => {
                warn!("{} 会话建立失败: {}", transport, e);
                ExecutionResult::failure(format!("{} 连接失败: {}", transport, e))
            }
        }
    }

    async fn disconnect(&mut self, transport: Transport) -> ExecutionResult {
        let slot = self.slot_mut(transport);
        let was_connected = slot.state.connected;
        slot.state.connected = false;
        slot.state.target = None;

        if let Some(handle) = slot.state.handle.take() {
            if let Err(e) = handle.close().await {
                warn!("关闭 {} 会话失败: {}", transport, e);
            }
        }

        if was_connected {
            info!("{} 会话已断开", transport);
            ExecutionResult::success(format!("Disconnected from {}", transport))
        } else {
            ExecutionResult::success(format!("No {} connection to disconnect", transport))
        }
    }

    async fn run_remote(&mut self, transport: Transport, command: &str) -> ExecutionResult {
        let slot = self.slot_mut(transport);
        if slot.connector.is_none() {
            return ExecutionResult::failure(format!("{} 执行通道未配置", transport));
        }
        match slot.state.handle.as_ref() {
            Some(handle) if slot.state.connected => {
                ExecutionResult::from_shell(handle.run(command).await)
            }
            _ => ExecutionResult::failure(format!("{} 会话未建立", transport)),
        }
    }

    async fn run_local_powershell(&self, command: &str) -> ExecutionResult {
        match self.local_powershell.as_ref() {
            Some(runner) => ExecutionResult::from_shell(runner.run(command).await),
            None => ExecutionResult::failure("PowerShell 执行通道未配置"),
        }
    }

    fn verify(&self, expected: &str) -> ExecutionResult {
        let Some(last) = self.last_output.as_ref() else {
            return ExecutionResult::failure("没有可供校验的上一次命令输出");
        };

        let actual = last.stdout.trim();
        if actual.contains(expected) {
            ExecutionResult::success(format!("Verified: {}", expected))
        } else {
            ExecutionResult::failure(format!(
                "输出校验失败: 期望包含 '{}', 实际为 '{}'",
                expected, actual
            ))
            .with_stdout(actual)
        }
    }

    fn slot_mut(&mut self, transport: Transport) -> &mut SessionSlot {
        match transport {
            Transport::Ssh => &mut self.ssh,
            // 本地通道不经过会话槽位
            Transport::PowerShell | Transport::Local => &mut self.powershell,
        }
    }

    /// 断开全部会话
    pub async fn shutdown(&mut self) {
        for transport in [Transport::Ssh, Transport::PowerShell] {
            if self.slot_mut(transport).state.connected {
                self.disconnect(transport).await;
            }
        }
        self.last_output = None;
    }

    pub fn is_connected(&self, transport: Transport) -> bool {
        self.session(transport).map_or(false, SessionState::is_connected)
    }

    pub fn session(&self, transport: Transport) -> Option<&SessionState> {
        match transport {
            Transport::Ssh => Some(&self.ssh.state),
            Transport::PowerShell => Some(&self.powershell.state),
            Transport::Local => None,
        }
    }

    /// 最近一次成功命令的输出
    pub fn last_output(&self) -> Option<&ExecutionResult> {
        self.last_output.as_ref()
    }

    /// 最近一次分发的结果
    pub fn last_result(&self) -> Option<&ExecutionResult> {
        self.last_result.as_ref()
    }
}

impl ExecutionResult {
    pub(crate) fn from_shell(result: ShellResult<CommandOutput>) -> Self {
        match result {
            Ok(output) => output.into(),
            Err(e) => e.into(),
        }
    }
}

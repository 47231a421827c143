//! ATP 命令执行器
//!
//! 通过系统进程执行命令，覆盖三种执行通道：
//! - 本地 shell（`sh -c`）
//! - SSH（系统 ssh / sshpass）
//! - PowerShell（本地 `-Command`，远程 `Invoke-Command`）
//!
//! # 示例
//!
//! ```ignore
//! use atp_shell_executor::{SshClient, SshConfig, LocalShell};
//!
//! let config = SshConfig::with_password("192.168.1.100", "root", "password");
//! let client = SshClient::connect(config).await?;
//! let output = client.execute("ls -la").await?;
//! println!("{}", output.stdout);
//!
//! let output = LocalShell::default().execute("hostname").await?;
//! ```

mod config;
mod error;
mod local;
mod output;
mod powershell;
mod ssh;

pub use config::{AuthMethod, PowerShellConfig, SshConfig};
pub use error::{Result, ShellError};
pub use local::LocalShell;
pub use output::CommandOutput;
pub use powershell::PowerShellClient;
pub use ssh::SshClient;

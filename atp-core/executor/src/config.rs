//! 运行配置
//!
//! 支持从多个源加载配置:
//! - 命令行参数 (优先级最高，由 CLI 覆盖)
//! - 环境变量
//! - 配置文件 (TOML/YAML/JSON)
//! - 默认值 (优先级最低)
//!
//! 配置文件搜索路径 (按优先级):
//! 1. `ATP_CONFIG` 环境变量指定的路径
//! 2. `./atp.toml` (当前目录)
//! 3. `~/.config/atp/atp.toml` (用户配置目录)

use anyhow::{Context, Result};
use atp_llm::GeminiConfig;
use atp_shell_executor::PowerShellConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::interaction::InteractionOptions;
use crate::transport::SshDefaults;

/// 运行配置 (顶层)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// 测试用例目录
    #[serde(default = "default_testcase_dir")]
    pub testcase_dir: PathBuf,

    /// 快照缓存文件
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// 报告输出目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,

    /// 决策服务（大模型）
    #[serde(default)]
    pub oracle: GeminiConfig,

    #[serde(default)]
    pub healing: HealingConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub ssh: SshDefaults,

    #[serde(default)]
    pub powershell: PowerShellConfig,

    #[serde(default)]
    pub ui: UiConfig,
}

/// 自愈配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    /// 每个失败动作最多分发的修正动作数
    #[serde(default = "default_max_heal_attempts")]
    pub max_heal_attempts: u32,

    /// 提供给决策服务的历史条数
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

/// 执行行为配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// 依赖或用例失败时立即中止运行
    #[serde(default = "default_true")]
    pub fail_fast: bool,

    /// 失败后由操作员决定是否继续
    #[serde(default)]
    pub interactive: bool,

    /// 单个阶段最多执行的动作数
    #[serde(default = "default_max_actions")]
    pub max_actions: usize,

    /// 继续判定时提供的后续动作数和历史条数
    #[serde(default = "default_continuation_window")]
    pub continuation_window: usize,
}

/// 界面交互配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    /// 浏览器自动化桥接服务地址，未配置时交互阶段不可用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_url: Option<String>,

    /// 交互阶段开始时打开的页面
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_url: Option<String>,

    /// 步骤间隔 (毫秒)
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    #[serde(default = "default_agent_max_steps")]
    pub agent_max_steps: u32,

    /// 优先回放缓存
    #[serde(default = "default_true")]
    pub replay_cached: bool,

    /// 请求超时 (秒)
    #[serde(default = "default_ui_request_timeout")]
    pub request_timeout: u64,
}

// ============================================
// 默认值
// ============================================

fn default_testcase_dir() -> PathBuf {
    PathBuf::from("./testcase")
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("./storage/snapshots.json")
}
fn default_max_heal_attempts() -> u32 {
    3
}
fn default_history_window() -> usize {
    5
}
fn default_true() -> bool {
    true
}
fn default_max_actions() -> usize {
    50
}
fn default_continuation_window() -> usize {
    3
}
fn default_step_delay_ms() -> u64 {
    2000
}
fn default_agent_max_steps() -> u32 {
    10
}
fn default_ui_request_timeout() -> u64 {
    120
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            testcase_dir: default_testcase_dir(),
            snapshot_path: default_snapshot_path(),
            report_dir: None,
            oracle: GeminiConfig::default(),
            healing: HealingConfig::default(),
            execution: ExecutionConfig::default(),
            ssh: SshDefaults::default(),
            powershell: PowerShellConfig::default(),
            ui: UiConfig::default(),
        }
    }
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_heal_attempts: default_max_heal_attempts(),
            history_window: default_history_window(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fail_fast: true,
            interactive: false,
            max_actions: default_max_actions(),
            continuation_window: default_continuation_window(),
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            bridge_url: None,
            start_url: None,
            step_delay_ms: default_step_delay_ms(),
            agent_max_steps: default_agent_max_steps(),
            replay_cached: true,
            request_timeout: default_ui_request_timeout(),
        }
    }
}

impl UiConfig {
    pub fn interaction_options(&self) -> InteractionOptions {
        InteractionOptions {
            replay_cached: self.replay_cached,
            agent_max_steps: self.agent_max_steps,
            step_delay: Duration::from_millis(self.step_delay_ms),
            start_url: self.start_url.clone(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl RunConfig {
    /// 从多个源加载配置 (优先级: 环境变量 > 配置文件 > 默认值)
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                tracing::debug!("加载配置文件: {:?}", path);
                Self::load_from_file(&path)?
            }
            None => {
                tracing::debug!("未找到配置文件, 使用默认配置");
                Self::default()
            }
        };

        config.apply_env_vars()?;
        Ok(config)
    }

    /// 从指定文件加载，并应用环境变量
    pub fn load_with(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let mut config = Self::load_from_file(path)?;
                config.apply_env_vars()?;
                Ok(config)
            }
            None => Self::load(),
        }
    }

    /// 从指定文件加载配置
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {:?}", path))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {:?}", path))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {:?}", path))?,
            _ => anyhow::bail!("Unsupported config file format: {:?}", path),
        };

        Ok(config)
    }

    /// 查找配置文件 (按优先级搜索)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = env::var("ATP_CONFIG") {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }

        let local = PathBuf::from("./atp.toml");
        if local.exists() {
            return Some(local);
        }

        dirs::home_dir()
            .map(|home| home.join(".config/atp/atp.toml"))
            .filter(|p| p.exists())
    }

    /// 从环境变量覆盖
    pub fn apply_env_vars(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// 按变量名查询覆盖值
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("GEMINI_API_KEY") {
            self.oracle.api_key = key;
        }
        if let Some(model) = lookup("ATP_ORACLE_MODEL") {
            self.oracle.model = model;
        }
        if let Some(dir) = lookup("ATP_TESTCASE_DIR") {
            self.testcase_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("ATP_SNAPSHOT_PATH") {
            self.snapshot_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("ATP_UI_BRIDGE_URL") {
            self.ui.bridge_url = Some(url);
        }
        if let Some(attempts) = lookup("ATP_MAX_HEAL_ATTEMPTS") {
            self.healing.max_heal_attempts = attempts
                .trim()
                .parse()
                .context("Invalid ATP_MAX_HEAL_ATTEMPTS value")?;
        }
        if let Some(value) = lookup("ATP_INTERACTIVE") {
            self.execution.interactive =
                parse_bool(&value).context("Invalid ATP_INTERACTIVE value")?;
        }
        if let Some(value) = lookup("ATP_FAIL_FAST") {
            self.execution.fail_fast = parse_bool(&value).context("Invalid ATP_FAIL_FAST value")?;
        }

        Ok(())
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_actions == 0 {
            anyhow::bail!("execution.max_actions must be greater than 0");
        }
        if self.oracle.model.is_empty() {
            anyhow::bail!("oracle.model cannot be empty");
        }
        if let Some(url) = &self.ui.bridge_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("ui.bridge_url must be an http(s) URL: {}", url);
            }
        }
        Ok(())
    }

    /// 是否配置了决策服务
    pub fn oracle_enabled(&self) -> bool {
        !self.oracle.api_key.is_empty()
    }

    /// 保存配置到文件
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {:?}", parent))?;
            }
        }

        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::to_string_pretty(self).context("Failed to serialize to TOML")?,
            Some("yaml") | Some("yml") => {
                serde_yaml::to_string(self).context("Failed to serialize to YAML")?
            }
            Some("json") => {
                serde_json::to_string_pretty(self).context("Failed to serialize to JSON")?
            }
            _ => anyhow::bail!("Unsupported config file format: {:?}", path),
        };

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.testcase_dir, PathBuf::from("./testcase"));
        assert_eq!(config.healing.max_heal_attempts, 3);
        assert!(config.execution.fail_fast);
        assert!(!config.execution.interactive);
        assert_eq!(config.oracle.model, "gemini-2.5-flash");
        assert!(!config.oracle_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("atp.toml");
        fs::write(
            &path,
            r#"
testcase_dir = "/srv/atp/testcase"

[healing]
max_heal_attempts = 5

[ui]
bridge_url = "http://127.0.0.1:3000"
step_delay_ms = 500
"#,
        )
        .unwrap();

        let config = RunConfig::load_from_file(&path).unwrap();
        assert_eq!(config.testcase_dir, PathBuf::from("/srv/atp/testcase"));
        assert_eq!(config.healing.max_heal_attempts, 5);
        assert_eq!(config.healing.history_window, 5);
        assert_eq!(config.ui.bridge_url.as_deref(), Some("http://127.0.0.1:3000"));
        assert_eq!(
            config.ui.interaction_options().step_delay,
            Duration::from_millis(500)
        );
        assert_eq!(config.ssh.port, 22);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut config = RunConfig::default();
        config.execution.max_actions = 20;

        for name in ["atp.toml", "atp.yaml", "atp.json"] {
            let path = dir.path().join(name);
            config.save_to_file(&path).unwrap();
            let loaded = RunConfig::load_from_file(&path).unwrap();
            assert_eq!(loaded.execution.max_actions, 20);
        }

        assert!(config.save_to_file(&dir.path().join("atp.ini")).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("GEMINI_API_KEY", "key-123"),
            ("ATP_MAX_HEAL_ATTEMPTS", "1"),
            ("ATP_INTERACTIVE", "true"),
            ("ATP_FAIL_FAST", "0"),
            ("ATP_SNAPSHOT_PATH", "/tmp/snap.json"),
        ]
        .into_iter()
        .collect();

        let mut config = RunConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert!(config.oracle_enabled());
        assert_eq!(config.healing.max_heal_attempts, 1);
        assert!(config.execution.interactive);
        assert!(!config.execution.fail_fast);
        assert_eq!(config.snapshot_path, PathBuf::from("/tmp/snap.json"));

        let mut config = RunConfig::default();
        let bad = config.apply_overrides(|k| {
            (k == "ATP_MAX_HEAL_ATTEMPTS").then(|| "many".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = RunConfig::default();
        config.ui.bridge_url = Some("localhost:3000".to_string());
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.execution.max_actions = 0;
        assert!(config.validate().is_err());
    }
}

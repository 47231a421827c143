//! 测试用例描述
//!
//! 文本格式按行解析：
//!
//! ```text
//! @testcase restore_vm
//! @depends_on backup_vm
//! @max_wait 30
//! @poll_interval 1
//! @pre
//! Connect to 10.10.26.255 as root with password P@ssword123
//! @run
//! Click "Restore"
//! Wait until status is not "Running"
//! @finally
//! Disconnect
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{ExecutorError, Result};

/// 单个步骤
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub text: String,

    /// 需要人工在物理设备上完成的步骤（以 `[physical]` 开头）
    #[serde(default)]
    pub physical: bool,
}

impl Step {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let physical = text.starts_with("[physical]");
        Self { text, physical }
    }
}

/// 等待参数 (分钟)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub max_wait_minutes: u64,
    pub poll_interval_minutes: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            max_wait_minutes: 60,
            poll_interval_minutes: 3,
        }
    }
}

impl Timing {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.max_wait_minutes * 60 * 1000)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_minutes * 60 * 1000)
    }
}

/// 测试用例
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub depends_on: Vec<String>,
    /// `@pre`
    pub setup: Vec<Step>,
    /// `@run`
    pub interaction: Vec<Step>,
    /// `@finally`
    pub cleanup: Vec<Step>,
    pub timing: Timing,
}

#[derive(Clone, Copy)]
enum Section {
    Setup,
    Interaction,
    Cleanup,
}

impl TestCase {
    /// 解析测试用例文本
    ///
    /// 第一个分段标记之前的普通行会被忽略；无法解析的等待参数保留默认值。
    pub fn parse(text: &str) -> Self {
        let mut testcase = TestCase {
            name: String::new(),
            depends_on: Vec::new(),
            setup: Vec::new(),
            interaction: Vec::new(),
            cleanup: Vec::new(),
            timing: Timing::default(),
        };
        let mut section = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut words = line.split_whitespace();
            match words.next().unwrap_or_default() {
                "@testcase" => {
                    if let Some(name) = words.next() {
                        testcase.name = name.to_string();
                    }
                }
                "@depends_on" => {
                    testcase.depends_on = words.map(String::from).collect();
                }
                "@max_wait" => {
                    if let Some(value) = words.next().and_then(|v| v.parse().ok()) {
                        testcase.timing.max_wait_minutes = value;
                    }
                }
                "@poll_interval" => {
                    if let Some(value) = words.next().and_then(|v| v.parse().ok()) {
                        testcase.timing.poll_interval_minutes = value;
                    }
                }
                "@pre" => section = Some(Section::Setup),
                "@run" => section = Some(Section::Interaction),
                "@finally" => section = Some(Section::Cleanup),
                _ => match section {
                    Some(Section::Setup) => testcase.setup.push(Step::new(line)),
                    Some(Section::Interaction) => testcase.interaction.push(Step::new(line)),
                    Some(Section::Cleanup) => testcase.cleanup.push(Step::new(line)),
                    None => debug!("忽略分段之前的内容: {}", line),
                },
            }
        }

        testcase
    }

    /// 准备阶段的步骤文本（每行一个步骤）
    pub fn setup_text(&self) -> String {
        steps_text(&self.setup)
    }

    /// 清理阶段的步骤文本
    pub fn cleanup_text(&self) -> String {
        steps_text(&self.cleanup)
    }
}

fn steps_text(steps: &[Step]) -> String {
    steps
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// 测试用例来源
pub trait TestCaseSource: Send + Sync {
    fn load(&self, name: &str) -> Result<TestCase>;
}

/// 从目录加载 `<name>.txt`
#[derive(Debug, Clone)]
pub struct TestCaseLoader {
    dir: PathBuf,
}

impl TestCaseLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let file = if name.ends_with(".txt") {
            name.to_string()
        } else {
            format!("{}.txt", name)
        };
        self.dir.join(file)
    }

    /// 列出目录中的全部测试用例名称
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("txt") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl TestCaseSource for TestCaseLoader {
    fn load(&self, name: &str) -> Result<TestCase> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(ExecutorError::TestCaseNotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| ExecutorError::TestCaseLoadFailed(format!("{}: {}", path.display(), e)))?;

        let mut testcase = TestCase::parse(&content);
        // 名称以文件名为准
        testcase.name = name.trim_end_matches(".txt").to_string();

        info!(
            "已加载测试用例: {} (依赖 {:?})",
            testcase.name, testcase.depends_on
        );
        Ok(testcase)
    }
}

//! 两阶段界面交互
//!
//! 每个界面步骤按顺序尝试：
//! 1. 回放快照缓存中的操作配方（不调用分析服务）
//! 2. 重新分析页面，取第一个候选元素执行并写回缓存
//! 3. 分析无结果时交给恢复代理，只完成这一个动作
//!
//! 按键、期望、等待三类步骤各有独立的处理路径。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::report::{Phase, PhaseReport, StepReport};
use crate::snapshot::{InteractionRecipe, SnapshotStore};
use crate::testcase::{Step, Timing};
use crate::{ExecutorError, Result};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UiError {
    #[error("界面服务调用失败: {0}")]
    Transport(String),

    #[error("界面服务返回格式错误: {0}")]
    Malformed(String),

    #[error("界面操作失败: {0}")]
    ActionFailed(String),

    #[error("不支持的操作: {0}")]
    Unsupported(String),
}

pub type UiResult<T> = std::result::Result<T, UiError>;

/// 页面分析得到的候选元素
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub selector: Option<String>,

    /// 推断出的操作方法
    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub arguments: Vec<String>,

    #[serde(default)]
    pub description: String,
}

impl Candidate {
    /// 转换为可回放的配方，未推断出操作方法时返回错误
    pub fn to_recipe(&self, step: &str) -> std::result::Result<InteractionRecipe, String> {
        let method = self
            .method
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| format!("分析结果未给出操作方法: {}", step))?;
        let selector = self.selector.clone().unwrap_or_default();

        Ok(InteractionRecipe::selector(step, method, selector)
            .with_arguments(self.arguments.clone())
            .with_description(self.description.clone()))
    }
}

/// 恢复代理的执行记录
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRun {
    /// 代理执行过的动作
    #[serde(default)]
    pub actions: Vec<Value>,

    /// 代理的总结或诊断信息
    #[serde(default)]
    pub message: Option<String>,
}

impl AgentRun {
    /// 代理是否完成了动作
    ///
    /// 没有执行任何动作即失败；最后一个动作带有 `success` 或 `status`
    /// 字段时以其为准，否则执行过动作即视为成功。
    pub fn succeeded(&self) -> bool {
        if self
            .message
            .as_deref()
            .map_or(false, |m| m.contains("success=False"))
        {
            return false;
        }

        let Some(last) = self.actions.last() else {
            return false;
        };

        if let Some(success) = last.get("success").and_then(Value::as_bool) {
            return success;
        }
        if let Some(status) = last.get("status").and_then(Value::as_str) {
            return status == "success";
        }
        true
    }

    /// 第一个带坐标的点击动作
    pub fn first_click(&self) -> Option<(i64, i64)> {
        self.actions.iter().find_map(|action| {
            if action.get("type").and_then(Value::as_str) != Some("click") {
                return None;
            }
            let coord = |key: &str| {
                action.get(key).and_then(|v| {
                    v.as_i64()
                        .or_else(|| v.as_f64().map(|f| f.round() as i64))
                })
            };
            Some((coord("x")?, coord("y")?))
        })
    }

    fn diagnostics(&self) -> String {
        match (&self.message, self.actions.is_empty()) {
            (Some(message), _) if !message.is_empty() => message.clone(),
            (_, true) => "恢复代理未执行任何动作".to_string(),
            _ => "恢复代理报告失败".to_string(),
        }
    }
}

/// 页面分析
#[async_trait]
pub trait UiAnalyzer: Send + Sync {
    /// 按自然语言描述查找候选元素
    async fn observe(&self, instruction: &str) -> UiResult<Vec<Candidate>>;

    /// 读取描述所指元素的状态文本
    async fn read_status(&self, instruction: &str) -> UiResult<Option<String>>;
}

/// 页面操作
#[async_trait]
pub trait UiDriver: Send + Sync {
    async fn goto(&self, url: &str) -> UiResult<()>;

    async fn act(&self, candidate: &Candidate) -> UiResult<()>;

    async fn replay(&self, recipe: &InteractionRecipe) -> UiResult<()>;

    async fn press_key(&self, key: &str) -> UiResult<()>;
}

/// 自主恢复代理
#[async_trait]
pub trait RecoveryAgent: Send + Sync {
    async fn execute(&self, instruction: &str, max_steps: u32) -> UiResult<AgentRun>;
}

/// 步骤类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Act,
    Expect,
    Press,
    Wait,
}

impl StepKind {
    /// 按步骤文本分类
    pub fn classify(text: &str) -> Self {
        let lower = text.trim().to_lowercase();
        if lower.contains("click") {
            StepKind::Act
        } else if lower.starts_with("expect") {
            StepKind::Expect
        } else if lower.contains("press") {
            StepKind::Press
        } else if lower.starts_with("wait") {
            StepKind::Wait
        } else {
            StepKind::Act
        }
    }
}

/// 步骤最终走的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionPath {
    Replay,
    Analysis,
    Recovery,
    Keyboard,
    Observation,
    Wait,
}

/// 单个步骤的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub path: InteractionPath,
    pub error: Option<String>,
}

impl StepOutcome {
    fn pass(path: InteractionPath) -> Self {
        Self { path, error: None }
    }

    fn fail(path: InteractionPath, error: impl Into<String>) -> Self {
        Self {
            path,
            error: Some(error.into()),
        }
    }

    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

enum StageOutcome {
    Hit(InteractionPath),
    Miss,
    Error(String),
}

/// 交互参数
#[derive(Debug, Clone)]
pub struct InteractionOptions {
    /// 是否优先回放缓存
    pub replay_cached: bool,

    /// 恢复代理最多执行的步数
    pub agent_max_steps: u32,

    /// 步骤间隔
    pub step_delay: Duration,

    /// 阶段开始时打开的页面
    pub start_url: Option<String>,
}

impl Default for InteractionOptions {
    fn default() -> Self {
        Self {
            replay_cached: true,
            agent_max_steps: 10,
            step_delay: Duration::from_secs(2),
            start_url: None,
        }
    }
}

/// 两阶段交互引擎
pub struct InteractionEngine {
    analyzer: Arc<dyn UiAnalyzer>,
    driver: Arc<dyn UiDriver>,
    agent: Option<Arc<dyn RecoveryAgent>>,
    store: SnapshotStore,
    options: InteractionOptions,
}

impl InteractionEngine {
    pub fn new(
        analyzer: Arc<dyn UiAnalyzer>,
        driver: Arc<dyn UiDriver>,
        agent: Option<Arc<dyn RecoveryAgent>>,
        store: SnapshotStore,
    ) -> Self {
        Self {
            analyzer,
            driver,
            agent,
            store,
            options: InteractionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: InteractionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn remember(&mut self, step: &str, recipe: InteractionRecipe) {
        if let Err(e) = self.store.put(step, recipe) {
            warn!("写入快照失败: {} ({})", step, e);
        }
    }

    /// 执行操作类步骤
    pub async fn act(&mut self, step: &str) -> Result<StepOutcome> {
        match self.replay_stage(step).await {
            StageOutcome::Hit(path) => return Ok(StepOutcome::pass(path)),
            StageOutcome::Miss => {}
            StageOutcome::Error(e) => warn!("缓存回放失败, 重新分析: {} ({})", step, e),
        }

        match self.analysis_stage(step).await {
            StageOutcome::Hit(path) => Ok(StepOutcome::pass(path)),
            StageOutcome::Error(e) => Ok(StepOutcome::fail(InteractionPath::Analysis, e)),
            StageOutcome::Miss => self.recovery_stage(step).await,
        }
    }

    async fn replay_stage(&self, step: &str) -> StageOutcome {
        if !self.options.replay_cached {
            return StageOutcome::Miss;
        }
        let Some(recipe) = self.store.get(step) else {
            return StageOutcome::Miss;
        };

        debug!("回放缓存: {} -> {}", step, recipe.method);
        match self.driver.replay(recipe).await {
            Ok(()) => StageOutcome::Hit(InteractionPath::Replay),
            Err(e) => StageOutcome::Error(e.to_string()),
        }
    }

    async fn analysis_stage(&mut self, step: &str) -> StageOutcome {
        let candidates = match self.analyzer.observe(step).await {
            Ok(candidates) => candidates,
            Err(e) => return StageOutcome::Error(e.to_string()),
        };
        let Some(first) = candidates.into_iter().next() else {
            info!("页面分析无结果, 交给恢复代理: {}", step);
            return StageOutcome::Miss;
        };

        let recipe = match first.to_recipe(step) {
            Ok(recipe) => recipe,
            Err(e) => return StageOutcome::Error(e),
        };
        self.remember(step, recipe);

        match self.driver.act(&first).await {
            Ok(()) => StageOutcome::Hit(InteractionPath::Analysis),
            Err(e) => StageOutcome::Error(e.to_string()),
        }
    }

    async fn recovery_stage(&mut self, step: &str) -> Result<StepOutcome> {
        let Some(agent) = self.agent.as_ref() else {
            return Ok(StepOutcome::fail(
                InteractionPath::Recovery,
                "页面分析无结果且未配置恢复代理",
            ));
        };

        let run = match agent
            .execute(&recovery_instruction(step), self.options.agent_max_steps)
            .await
        {
            Ok(run) => run,
            Err(e) => {
                return Ok(StepOutcome::fail(
                    InteractionPath::Recovery,
                    format!("恢复代理调用失败: {}", e),
                ))
            }
        };

        info!("恢复代理执行了 {} 个动作", run.actions.len());
        if !run.succeeded() {
            error!("恢复代理未能完成步骤: {}", step);
            return Ok(StepOutcome::fail(
                InteractionPath::Recovery,
                format!("Agent recovery failed: {}", run.diagnostics()),
            ));
        }

        let (x, y) = run
            .first_click()
            .ok_or_else(|| ExecutorError::AgentLogInconsistent(step.to_string()))?;
        self.remember(step, InteractionRecipe::click_at(step, x, y));

        info!("恢复代理完成步骤: {} (点击 {}, {})", step, x, y);
        Ok(StepOutcome::pass(InteractionPath::Recovery))
    }

    /// 按键步骤，如 `Press Enter.`
    pub async fn press(&mut self, step: &str) -> StepOutcome {
        let key = parse_key(step);
        self.remember(step, InteractionRecipe::press(step, key.clone()));

        match self.driver.press_key(&key).await {
            Ok(()) => StepOutcome::pass(InteractionPath::Keyboard),
            Err(e) => StepOutcome::fail(InteractionPath::Keyboard, e.to_string()),
        }
    }

    /// 期望步骤：页面上应能找到描述的元素
    pub async fn expect(&mut self, step: &str) -> StepOutcome {
        let candidates = match self.analyzer.observe(step).await {
            Ok(candidates) => candidates,
            Err(e) => return StepOutcome::fail(InteractionPath::Observation, e.to_string()),
        };
        let Some(first) = candidates.first() else {
            return StepOutcome::fail(
                InteractionPath::Observation,
                format!("Observe returned empty list: {}", step),
            );
        };

        match first.to_recipe(step) {
            Ok(recipe) => {
                self.remember(step, recipe);
                StepOutcome::pass(InteractionPath::Observation)
            }
            Err(e) => StepOutcome::fail(InteractionPath::Observation, e),
        }
    }

    /// 等待步骤：轮询状态直到不再包含禁止值
    pub async fn wait(&self, step: &str, timing: &Timing) -> StepOutcome {
        let forbidden = parse_forbidden_value(step);
        let timeout = timing.timeout();
        let interval = timing.interval();
        let start = Instant::now();
        let mut last_status: Option<String> = None;

        info!(
            "等待状态不再包含 '{}' (超时 {} 分钟, 间隔 {} 分钟)",
            forbidden, timing.max_wait_minutes, timing.poll_interval_minutes
        );

        while start.elapsed() < timeout {
            match self.analyzer.read_status(step).await {
                Ok(Some(status)) if !status.trim().is_empty() => {
                    let status = status.trim().to_string();
                    if !status.contains(&forbidden) {
                        info!("等待条件满足, 当前状态: {}", status);
                        return StepOutcome::pass(InteractionPath::Wait);
                    }
                    info!("仍在等待, 当前状态: {}", status);
                    last_status = Some(status);
                }
                Ok(_) => debug!("未读取到状态文本, 稍后重试"),
                Err(e) => debug!("读取状态失败, 稍后重试: {}", e),
            }
            sleep(interval).await;
        }

        StepOutcome::fail(
            InteractionPath::Wait,
            format!(
                "等待超时, Last status: {}",
                last_status.as_deref().unwrap_or("none")
            ),
        )
    }

    /// 执行单个步骤
    pub async fn run_step(&mut self, step: &Step, timing: &Timing) -> Result<StepOutcome> {
        if step.physical {
            info!("物理操作步骤: {}", step.text);
        }
        let text = step.text.as_str();
        match StepKind::classify(text) {
            StepKind::Act => self.act(text).await,
            StepKind::Expect => Ok(self.expect(text).await),
            StepKind::Press => Ok(self.press(text).await),
            StepKind::Wait => Ok(self.wait(text, timing).await),
        }
    }

    /// 按顺序执行交互阶段的全部步骤，遇到第一个失败即停止
    pub async fn run_steps(&mut self, steps: &[Step], timing: &Timing) -> Result<PhaseReport> {
        let phase_start = Instant::now();
        let mut report = PhaseReport::new(Phase::Interaction);

        if let Some(url) = self.options.start_url.clone() {
            info!("打开页面: {}", url);
            if let Err(e) = self.driver.goto(&url).await {
                report.fail(format!("打开页面失败: {}", e));
                skip_remaining(&mut report, steps, 0);
                return Ok(report);
            }
        }

        for (index, step) in steps.iter().enumerate() {
            info!("[{}] {}", index + 1, step.text);
            let started = Instant::now();
            let outcome = self.run_step(step, timing).await?;
            let elapsed = started.elapsed().as_millis() as u64;

            match outcome.error {
                None => {
                    debug!("步骤通过 ({:?}): {}", outcome.path, step.text);
                    report.add_step(StepReport::success(index, &step.text).with_duration(elapsed));
                }
                Some(e) => {
                    error!("步骤失败, 停止执行: {} ({})", step.text, e);
                    report.add_step(StepReport::failed(index, &step.text, &e).with_duration(elapsed));
                    report.fail(format!("步骤 {} 失败: {}", index + 1, e));
                    skip_remaining(&mut report, steps, index + 1);
                    break;
                }
            }

            if index + 1 < steps.len() {
                sleep(self.options.step_delay).await;
            }
        }

        report.duration_ms = phase_start.elapsed().as_millis() as u64;
        Ok(report)
    }
}

/// 失败之后的步骤记为跳过，报告中保留完整步骤列表
fn skip_remaining(report: &mut PhaseReport, steps: &[Step], from: usize) {
    for (index, step) in steps.iter().enumerate().skip(from) {
        report.add_step(StepReport::skipped(index, &step.text));
    }
}

/// `Press Enter.` -> `Enter`
fn parse_key(step: &str) -> String {
    let trimmed = step.trim();
    let rest = RegexBuilder::new(r"\bpress\s+(.+)$")
        .case_insensitive(true)
        .build()
        .ok()
        .and_then(|re| re.captures(trimmed).map(|c| c[1].to_string()))
        .unwrap_or_else(|| trimmed.to_string());

    rest.trim()
        .trim_matches(|c: char| c.is_ascii_punctuation())
        .to_string()
}

/// 从 `not "Running"` 中取出禁止值，默认 `Running`
fn parse_forbidden_value(step: &str) -> String {
    RegexBuilder::new(r#"not\s+"([^"]+)""#)
        .case_insensitive(true)
        .build()
        .ok()
        .and_then(|re| re.captures(step).map(|c| c[1].to_string()))
        .unwrap_or_else(|| "Running".to_string())
}

fn recovery_instruction(step: &str) -> String {
    format!(
        r#"You are recovering a single failed UI action in an automated acceptance test.

Failed action: {step}

Complete ONLY this action, then stop.
- The action is done as soon as its immediate intent is satisfied.
- Do not chain into follow-up steps or anything that looks like the next step.
- If the action opens a menu, dialog or wizard, stop once it is visible.
- If the text is ambiguous, pick the smallest interaction that matches it.

Things to try: equivalent elements (text, icon, role, aria-label, tooltip), other placements
of the same control, hidden/disabled/loading states, scrolling, keyboard focus + Enter,
clicking by coordinates.

If the action cannot be completed, do not act further. Report what is visible, the page state,
and why the action is blocked."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_classify() {
        assert_eq!(StepKind::classify("Click \"Backup\""), StepKind::Act);
        assert_eq!(StepKind::classify("Double-click the VM row"), StepKind::Act);
        assert_eq!(StepKind::classify("Expect the job list"), StepKind::Expect);
        assert_eq!(StepKind::classify("Press Enter"), StepKind::Press);
        assert_eq!(StepKind::classify("Then press Tab"), StepKind::Press);
        assert_eq!(
            StepKind::classify("Wait until status is not \"Running\""),
            StepKind::Wait
        );
        assert_eq!(StepKind::classify("Type admin in username"), StepKind::Act);
    }

    #[test]
    fn test_parse_key_and_forbidden() {
        assert_eq!(parse_key("Press Enter."), "Enter");
        assert_eq!(parse_key("press \"Tab\""), "Tab");
        assert_eq!(parse_key("Then press Escape!"), "Escape");
        assert_eq!(parse_forbidden_value(r#"Wait until status NOT "Queued""#), "Queued");
        assert_eq!(parse_forbidden_value("Wait for job"), "Running");
    }

    #[test]
    fn test_agent_run_success_rules() {
        let empty = AgentRun::default();
        assert!(!empty.succeeded());

        let implicit = AgentRun {
            actions: vec![json!({"type": "click", "x": 10, "y": 20})],
            message: None,
        };
        assert!(implicit.succeeded());
        assert_eq!(implicit.first_click(), Some((10, 20)));

        let explicit = AgentRun {
            actions: vec![
                json!({"type": "scroll"}),
                json!({"type": "click", "x": 1.6, "y": 2.2, "success": false}),
            ],
            message: None,
        };
        assert!(!explicit.succeeded());
        assert_eq!(explicit.first_click(), Some((2, 2)));

        let status = AgentRun {
            actions: vec![json!({"type": "type", "status": "success"})],
            message: None,
        };
        assert!(status.succeeded());
        assert_eq!(status.first_click(), None);

        let marker = AgentRun {
            actions: vec![json!({"type": "click", "x": 1, "y": 1})],
            message: Some("ActResult(success=False)".to_string()),
        };
        assert!(!marker.succeeded());
    }

    #[test]
    fn test_candidate_requires_method() {
        let candidate = Candidate {
            selector: Some("#ok".to_string()),
            ..Candidate::default()
        };
        assert!(candidate.to_recipe("Click OK").is_err());

        let candidate = Candidate {
            method: Some("click".to_string()),
            ..candidate
        };
        assert_eq!(candidate.to_recipe("Click OK").unwrap().method, "click");
    }

    #[test]
    fn test_recovery_instruction_scoped() {
        let text = recovery_instruction("Click \"Restore\"");
        assert!(text.contains("Click \"Restore\""));
        assert!(text.contains("Do not chain"));
    }

    struct NullDriver {
        pressed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UiDriver for NullDriver {
        async fn goto(&self, _url: &str) -> UiResult<()> {
            Ok(())
        }
        async fn act(&self, _candidate: &Candidate) -> UiResult<()> {
            Ok(())
        }
        async fn replay(&self, _recipe: &InteractionRecipe) -> UiResult<()> {
            Ok(())
        }
        async fn press_key(&self, key: &str) -> UiResult<()> {
            self.pressed.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    struct NoAnalysis;

    #[async_trait]
    impl UiAnalyzer for NoAnalysis {
        async fn observe(&self, _instruction: &str) -> UiResult<Vec<Candidate>> {
            Err(UiError::Unsupported("observe".to_string()))
        }
        async fn read_status(&self, _instruction: &str) -> UiResult<Option<String>> {
            Err(UiError::Unsupported("status".to_string()))
        }
    }

    #[tokio::test]
    async fn test_press_stores_keyboard_recipe() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path().join("snapshots.json")).unwrap();
        let driver = Arc::new(NullDriver {
            pressed: Mutex::new(Vec::new()),
        });
        let mut engine = InteractionEngine::new(Arc::new(NoAnalysis), driver.clone(), None, store);

        let outcome = engine.press("Press Enter.").await;
        assert!(outcome.passed());
        assert_eq!(outcome.path, InteractionPath::Keyboard);
        assert_eq!(*driver.pressed.lock().unwrap(), vec!["Enter"]);

        let recipe = engine.store().get("Press Enter.").unwrap();
        assert_eq!(recipe.method, "press");
        assert_eq!(recipe.arguments, vec!["Enter"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_with_analysis_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path().join("snapshots.json")).unwrap();
        let engine = InteractionEngine::new(
            Arc::new(NoAnalysis),
            Arc::new(NullDriver {
                pressed: Mutex::new(Vec::new()),
            }),
            None,
            store,
        );

        let timing = Timing {
            max_wait_minutes: 5,
            poll_interval_minutes: 1,
        };
        let outcome = engine.wait("Wait for the job", &timing).await;
        assert!(!outcome.passed());
        assert!(outcome.error.unwrap().contains("Last status: none"));
    }
}

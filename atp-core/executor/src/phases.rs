//! 测试用例阶段执行
//!
//! 每个测试用例依次执行三个阶段：
//! - 准备 (`@pre`)：规划动作并通过自愈执行器执行
//! - 交互 (`@run`)：由两阶段交互引擎执行界面步骤，准备失败时跳过
//! - 清理 (`@finally`)：与准备阶段相同的动作流程，总是执行
//!
//! 结束后断开全部会话。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atp_llm::GeminiClient;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::action::{parse_action_command, PlannedStep};
use crate::config::RunConfig;
use crate::healing::{ContinuationPolicy, SelfHealingExecutor, StdinPrompt};
use crate::interaction::{InteractionEngine, RecoveryAgent};
use crate::oracle::{DecisionOracle, LlmOracle, NextAction, OracleError};
use crate::report::{Phase, PhaseReport, StepReport, TestCaseReport, TestStatus};
use crate::result::HistoryEntry;
use crate::router::SessionRouter;
use crate::snapshot::SnapshotStore;
use crate::testcase::{Step, TestCase};
use crate::transport::system_router;
use crate::ui_bridge::UiBridgeClient;
use crate::{ExecutorError, Result};

/// 测试用例阶段执行器
#[async_trait]
pub trait PhaseRunner: Send {
    /// 执行全部阶段；只有结构性错误返回 `Err`
    async fn execute(&mut self, testcase: &TestCase) -> Result<TestCaseReport>;
}

/// 默认阶段执行器
pub struct TestCaseExecutor {
    router: SessionRouter,
    oracle: Option<Arc<dyn DecisionOracle>>,
    healer: SelfHealingExecutor,
    continuation: ContinuationPolicy,
    interaction: Option<InteractionEngine>,
    max_actions: usize,
}

impl TestCaseExecutor {
    pub fn new(router: SessionRouter, oracle: Option<Arc<dyn DecisionOracle>>) -> Self {
        Self {
            router,
            healer: SelfHealingExecutor::new(oracle.clone()),
            continuation: ContinuationPolicy::automated(oracle.clone()),
            oracle,
            interaction: None,
            max_actions: 50,
        }
    }

    /// 按运行配置组装：系统进程执行通道、Gemini 决策服务、界面桥接服务
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let oracle: Option<Arc<dyn DecisionOracle>> = if config.oracle_enabled() {
            let client = GeminiClient::new(config.oracle.clone())
                .map_err(|e| ExecutorError::ConfigError(e.to_string()))?;
            Some(Arc::new(LlmOracle::new(Arc::new(client))))
        } else {
            warn!("未配置决策服务 API Key, 动作规划和自愈不可用");
            None
        };

        let healer = SelfHealingExecutor::new(oracle.clone())
            .with_max_attempts(config.healing.max_heal_attempts)
            .with_history_window(config.healing.history_window);

        let window = config.execution.continuation_window;
        let continuation = if config.execution.interactive {
            ContinuationPolicy::interactive(Arc::new(StdinPrompt))
        } else {
            ContinuationPolicy::automated(oracle.clone())
        }
        .with_windows(window, window);

        let interaction = match &config.ui.bridge_url {
            Some(url) => {
                let bridge = Arc::new(
                    UiBridgeClient::new(url, Duration::from_secs(config.ui.request_timeout))
                        .map_err(|e| ExecutorError::ConfigError(e.to_string()))?,
                );
                let store = SnapshotStore::open(&config.snapshot_path)?;
                let agent: Arc<dyn RecoveryAgent> = bridge.clone();
                Some(
                    InteractionEngine::new(bridge.clone(), bridge, Some(agent), store)
                        .with_options(config.ui.interaction_options()),
                )
            }
            None => None,
        };

        let router = system_router(&config.ssh, &config.powershell);

        Ok(Self::new(router, oracle)
            .with_healer(healer)
            .with_continuation(continuation)
            .with_interaction(interaction)
            .with_max_actions(config.execution.max_actions))
    }

    pub fn with_healer(mut self, healer: SelfHealingExecutor) -> Self {
        self.healer = healer;
        self
    }

    pub fn with_continuation(mut self, continuation: ContinuationPolicy) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn with_interaction(mut self, interaction: Option<InteractionEngine>) -> Self {
        self.interaction = interaction;
        self
    }

    pub fn with_max_actions(mut self, max_actions: usize) -> Self {
        self.max_actions = max_actions;
        self
    }

    pub fn router(&self) -> &SessionRouter {
        &self.router
    }

    async fn execute_phases(
        &mut self,
        testcase: &TestCase,
        report: &mut TestCaseReport,
    ) -> Result<()> {
        info!("[{}] 准备阶段: {} 个步骤", testcase.name, testcase.setup.len());
        let setup = self.run_actions(Phase::Setup, &testcase.setup).await?;
        let setup_passed = setup.passed;
        report.phases.push(setup);

        if setup_passed {
            info!(
                "[{}] 交互阶段: {} 个步骤",
                testcase.name,
                testcase.interaction.len()
            );
            let interaction = self.run_interaction(testcase).await?;
            report.phases.push(interaction);
        } else {
            warn!("[{}] 准备阶段失败, 跳过交互阶段", testcase.name);
        }

        info!("[{}] 清理阶段: {} 个步骤", testcase.name, testcase.cleanup.len());
        let cleanup = self.run_actions(Phase::Cleanup, &testcase.cleanup).await?;
        report.phases.push(cleanup);

        Ok(())
    }

    async fn run_interaction(&mut self, testcase: &TestCase) -> Result<PhaseReport> {
        if testcase.interaction.is_empty() {
            return Ok(PhaseReport::new(Phase::Interaction));
        }

        match self.interaction.as_mut() {
            Some(engine) => engine.run_steps(&testcase.interaction, &testcase.timing).await,
            None => {
                let mut report = PhaseReport::new(Phase::Interaction);
                report.fail("未配置界面桥接服务, 无法执行交互步骤");
                Ok(report)
            }
        }
    }

    /// 执行动作类阶段：规划 -> 动作列表 -> 逐个执行
    async fn run_actions(&mut self, phase: Phase, steps: &[Step]) -> Result<PhaseReport> {
        let started = Instant::now();
        let mut report = PhaseReport::new(phase);
        if steps.is_empty() {
            return Ok(report);
        }

        let Some(oracle) = self.oracle.clone() else {
            report.fail("未配置决策服务, 无法规划动作");
            return Ok(report);
        };

        let text = steps
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let plan = match oracle.plan(&text).await {
            Ok(plan) => plan,
            Err(OracleError::Malformed(e)) => return Err(ExecutorError::OracleDecision(e)),
            Err(e) => {
                error!("[{}] 生成测试计划失败: {}", phase, e);
                report.fail(format!("生成测试计划失败: {}", e));
                return Ok(report);
            }
        };

        let commands = match oracle.action_list(&plan.goal, &plan.steps).await {
            Ok(commands) => commands,
            Err(OracleError::Malformed(e)) => return Err(ExecutorError::OracleDecision(e)),
            Err(e) => {
                error!("[{}] 生成动作列表失败: {}", phase, e);
                report.fail(format!("生成动作列表失败: {}", e));
                return Ok(report);
            }
        };
        info!("[{}] 动作列表: {} 条", phase, commands.len());

        let mut queue: VecDeque<String> = commands.into();
        let mut history: Vec<HistoryEntry> = Vec::new();

        loop {
            let action = match queue.pop_front() {
                Some(command) => match parse_action_command(&command)? {
                    PlannedStep::Done => {
                        info!("[{}] 目标已完成", phase);
                        break;
                    }
                    PlannedStep::Action(action) => action,
                },
                None => {
                    let next = oracle
                        .next_action(&plan.goal, &history, self.router.last_result())
                        .await;
                    match next {
                        Ok(NextAction::GoalAchieved) => {
                            info!("[{}] 目标已完成", phase);
                            break;
                        }
                        Ok(NextAction::Continue(action)) => action,
                        Err(OracleError::Malformed(e)) => {
                            return Err(ExecutorError::OracleDecision(e))
                        }
                        Err(e) => {
                            error!("[{}] 推理下一步失败: {}", phase, e);
                            report.fail(format!("推理下一步失败: {}", e));
                            break;
                        }
                    }
                }
            };

            if history.len() >= self.max_actions {
                error!("[{}] 超过最大动作数 {}", phase, self.max_actions);
                report.fail(format!("超过最大动作数 {}", self.max_actions));
                break;
            }

            let index = history.len();
            let step_started = Instant::now();
            info!("[{}] ({}) {}", phase, index + 1, action);

            let outcome = self
                .healer
                .execute_with_healing(&mut self.router, &action, &plan.goal, &history)
                .await;
            let result = outcome.result;
            let elapsed = step_started.elapsed().as_millis() as u64;
            let description = action.describe();

            let step = if result.success {
                StepReport::success(index, &description)
            } else {
                StepReport::failed(index, &description, result.error_text())
            };
            report.add_step(
                step.with_output(result.stdout.clone())
                    .with_healing_attempts(outcome.attempts)
                    .with_duration(elapsed),
            );
            history.push(HistoryEntry::new(
                outcome.corrected.unwrap_or_else(|| action.clone()),
                result.clone(),
            ));

            if result.success {
                continue;
            }

            if action.is_verification() {
                error!("[{}] 校验失败: {}", phase, result.error_text());
                report.fail(format!("校验失败: {}", result.error_text()));
                break;
            }
            if result.fatal {
                error!("[{}] 致命失败: {}", phase, result.error_text());
                report.fail(format!("致命失败: {}", result.error_text()));
                break;
            }

            let remaining: Vec<String> = queue.iter().cloned().collect();
            let decision = self
                .continuation
                .decide(&action, &result, &remaining, &history)
                .await;
            if decision.should_continue {
                warn!(
                    "[{}] 动作失败, 继续执行 ({:?}): {}",
                    phase, decision.source, decision.reason
                );
            } else {
                error!(
                    "[{}] 动作失败, 停止执行 ({:?}): {}",
                    phase, decision.source, decision.reason
                );
                report.fail(format!("{} 失败后停止: {}", action.name(), decision.reason));
                break;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }
}

#[async_trait]
impl PhaseRunner for TestCaseExecutor {
    async fn execute(&mut self, testcase: &TestCase) -> Result<TestCaseReport> {
        info!("执行测试用例: {}", testcase.name);
        let mut report = TestCaseReport::new(&testcase.name);

        let outcome = self.execute_phases(testcase, &mut report).await;
        self.router.shutdown().await;
        outcome?;

        report.finalize();
        match report.status {
            TestStatus::Passed => info!("✅ PASSED: {}", testcase.name),
            _ => {
                let reasons: Vec<String> = report
                    .phases
                    .iter()
                    .filter_map(|p| p.reason.as_ref().map(|r| format!("{}: {}", p.phase, r)))
                    .collect();
                error!("❌ FAILED: {} ({})", testcase.name, reasons.join("; "));
            }
        }
        Ok(report)
    }
}

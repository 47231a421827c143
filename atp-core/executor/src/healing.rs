//! 自愈执行与失败后继续判定

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::action::Action;
use crate::oracle::{ContinuationContext, DecisionOracle, HealingContext};
use crate::result::{ExecutionResult, HistoryEntry};
use crate::router::SessionRouter;

/// 带修复的执行结果
#[derive(Debug, Clone)]
pub struct HealingOutcome {
    /// 最终结果（成功的修正结果，或最后一次失败）
    pub result: ExecutionResult,

    /// 已分发的修正动作数
    pub attempts: u32,

    /// 最终成功的修正动作
    pub corrected: Option<Action>,
}

impl HealingOutcome {
    fn unhealed(result: ExecutionResult, attempts: u32) -> Self {
        Self {
            result,
            attempts,
            corrected: None,
        }
    }
}

/// 自愈执行器
pub struct SelfHealingExecutor {
    oracle: Option<Arc<dyn DecisionOracle>>,
    max_heal_attempts: u32,
    history_window: usize,
}

impl SelfHealingExecutor {
    pub fn new(oracle: Option<Arc<dyn DecisionOracle>>) -> Self {
        Self {
            oracle,
            max_heal_attempts: 3,
            history_window: 5,
        }
    }

    pub fn with_max_attempts(mut self, max_heal_attempts: u32) -> Self {
        self.max_heal_attempts = max_heal_attempts;
        self
    }

    pub fn with_history_window(mut self, history_window: usize) -> Self {
        self.history_window = history_window;
        self
    }

    pub fn max_heal_attempts(&self) -> u32 {
        self.max_heal_attempts
    }

    /// 执行动作，失败时尝试修复
    pub async fn execute_with_healing(
        &self,
        router: &mut SessionRouter,
        action: &Action,
        goal: &str,
        history: &[HistoryEntry],
    ) -> HealingOutcome {
        let result = router.dispatch(action).await;
        if result.success {
            return HealingOutcome::unhealed(result, 0);
        }

        let Some(oracle) = self.oracle.as_ref() else {
            return HealingOutcome::unhealed(result, 0);
        };

        if action.is_verification() {
            info!("校验失败不进入修复: {}", result.error_text());
            return HealingOutcome::unhealed(result, 0);
        }

        let original = result;
        let window = &history[history.len().saturating_sub(self.history_window)..];
        let mut failed_action = action.clone();
        let mut last_failure = original.clone();
        let mut attempts = 0;

        for attempt in 1..=self.max_heal_attempts {
            warn!(
                "动作失败, 尝试修复 ({}/{}): {} - {}",
                attempt,
                self.max_heal_attempts,
                failed_action,
                last_failure.error_text()
            );

            let ctx = HealingContext {
                failed_action: &failed_action,
                result: &last_failure,
                goal,
                history: window,
                attempt,
                max_attempts: self.max_heal_attempts,
            };

            let decision = match oracle.heal(&ctx).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!("获取修复决策失败, 放弃修复: {}", e);
                    return HealingOutcome::unhealed(original, attempts);
                }
            };

            info!("根因分析: {}", decision.root_cause);

            let corrected = match decision.corrected_action {
                Some(corrected) if decision.should_retry && !decision.give_up => corrected,
                _ => {
                    info!("放弃修复: {}", decision.reason);
                    return HealingOutcome::unhealed(original, attempts);
                }
            };

            info!("执行修正动作: {} ({})", corrected, decision.reason);
            attempts += 1;
            let result = router.dispatch(&corrected).await;
            if result.success {
                info!("修复成功, 共尝试 {} 次", attempts);
                return HealingOutcome {
                    result,
                    attempts,
                    corrected: Some(corrected),
                };
            }

            failed_action = corrected;
            last_failure = result;
        }

        warn!("修复次数已用尽 ({}), 动作仍然失败", self.max_heal_attempts);
        HealingOutcome::unhealed(last_failure, attempts)
    }
}

/// 继续判定的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Operator,
    Oracle,
    Fallback,
}

/// 继续判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationDecision {
    pub should_continue: bool,
    pub reason: String,
    pub source: DecisionSource,
}

/// 人工确认
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// 返回操作员的输入，输入流结束或中断时返回错误
    async fn ask(&self, question: &str) -> std::io::Result<String>;
}

/// 从标准输入读取操作员选择
pub struct StdinPrompt;

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn ask(&self, question: &str) -> std::io::Result<String> {
        let question = question.to_string();
        tokio::task::spawn_blocking(move || {
            use std::io::Write;

            print!("{}", question);
            std::io::stdout().flush()?;

            let mut line = String::new();
            let read = std::io::stdin().read_line(&mut line)?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "输入已结束",
                ));
            }
            Ok(line)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e))?
    }
}

/// 失败后继续策略
pub struct ContinuationPolicy {
    oracle: Option<Arc<dyn DecisionOracle>>,
    operator: Option<Arc<dyn OperatorPrompt>>,
    upcoming_window: usize,
    history_window: usize,
}

impl ContinuationPolicy {
    /// 自动模式：由决策服务判定
    pub fn automated(oracle: Option<Arc<dyn DecisionOracle>>) -> Self {
        Self {
            oracle,
            operator: None,
            upcoming_window: 3,
            history_window: 3,
        }
    }

    /// 交互模式：由操作员判定
    pub fn interactive(operator: Arc<dyn OperatorPrompt>) -> Self {
        Self {
            oracle: None,
            operator: Some(operator),
            upcoming_window: 3,
            history_window: 3,
        }
    }

    pub fn with_windows(mut self, upcoming: usize, history: usize) -> Self {
        self.upcoming_window = upcoming;
        self.history_window = history;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.operator.is_some()
    }

    /// 判定失败后是否继续执行剩余动作
    pub async fn decide(
        &self,
        failed_action: &Action,
        result: &ExecutionResult,
        remaining: &[String],
        history: &[HistoryEntry],
    ) -> ContinuationDecision {
        if let Some(operator) = self.operator.as_ref() {
            return self.ask_operator(operator.as_ref(), failed_action, result).await;
        }

        if let Some(oracle) = self.oracle.as_ref() {
            let upcoming = &remaining[..remaining.len().min(self.upcoming_window)];
            let ctx = ContinuationContext {
                failed_action,
                result,
                upcoming,
                remaining: remaining.len(),
                history: &history[history.len().saturating_sub(self.history_window)..],
            };

            match oracle.should_continue(&ctx).await {
                Ok(verdict) => {
                    if !verdict.suggestion.is_empty() {
                        info!("建议: {}", verdict.suggestion);
                    }
                    return ContinuationDecision {
                        should_continue: verdict.should_continue,
                        reason: verdict.reason,
                        source: DecisionSource::Oracle,
                    };
                }
                Err(e) => warn!("获取继续判定失败, 使用默认规则: {}", e),
            }
        }

        Self::fallback(failed_action)
    }

    async fn ask_operator(
        &self,
        operator: &dyn OperatorPrompt,
        failed_action: &Action,
        result: &ExecutionResult,
    ) -> ContinuationDecision {
        let question = format!(
            "\n动作失败: {}\n错误: {}\n  1) 继续执行\n  2) 停止\n请选择 [1/2]: ",
            failed_action,
            result.error_text()
        );

        match operator.ask(&question).await {
            Ok(answer) => {
                let answer = answer.trim().to_lowercase();
                let should_continue = matches!(answer.as_str(), "1" | "c" | "continue");
                ContinuationDecision {
                    should_continue,
                    reason: format!("操作员选择: {}", answer),
                    source: DecisionSource::Operator,
                }
            }
            Err(e) => ContinuationDecision {
                should_continue: false,
                reason: format!("未获得操作员输入: {}", e),
                source: DecisionSource::Operator,
            },
        }
    }

    /// 默认规则：连接失败即停止，其余继续
    fn fallback(failed_action: &Action) -> ContinuationDecision {
        if failed_action.is_connection() {
            ContinuationDecision {
                should_continue: false,
                reason: format!("关键动作失败: {}", failed_action.name()),
                source: DecisionSource::Fallback,
            }
        } else {
            ContinuationDecision {
                should_continue: true,
                reason: "非关键动作失败, 继续执行".to_string(),
                source: DecisionSource::Fallback,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Credentials, Transport};
    use crate::oracle::tests::CannedLlm;
    use crate::oracle::LlmOracle;
    use crate::router::tests::{ssh_router, ScriptedRunner};
    use atp_llm::LlmError;

    fn ssh_run(command: &str) -> Action {
        Action::RunCommand {
            transport: Transport::Ssh,
            command: command.to_string(),
        }
    }

    fn llm_oracle(replies: Vec<&str>) -> (Arc<dyn DecisionOracle>, Arc<CannedLlm>) {
        let llm = Arc::new(CannedLlm::new(
            replies.into_iter().map(|r| Ok(r.to_string())).collect(),
        ));
        (Arc::new(LlmOracle::new(llm.clone())), llm)
    }

    async fn connected_router(session: ScriptedRunner) -> SessionRouter {
        let mut router = ssh_router(session);
        router
            .dispatch(&Action::SshConnect {
                credentials: Credentials::new("10.0.0.1", "root", "pw"),
            })
            .await;
        router
    }

    const GIVE_UP: &str =
        r#"{"should_retry": false, "give_up": true, "root_cause": "command returns 1", "reason": "nothing to fix"}"#;

    fn retry(command: &str) -> String {
        format!(
            r#"{{"should_retry": true, "give_up": false, "root_cause": "wrong path",
                "corrected_action": {{"type": "command", "machine": "ssh", "command": "{}"}},
                "reason": "retry"}}"#,
            command
        )
    }

    #[tokio::test]
    async fn test_success_skips_oracle() {
        let (oracle, llm) = llm_oracle(vec![]);
        let mut router = connected_router(ScriptedRunner::default().with("uptime", "up", 0)).await;
        let healer = SelfHealingExecutor::new(Some(oracle));

        let outcome = healer
            .execute_with_healing(&mut router, &ssh_run("uptime"), "goal", &[])
            .await;
        assert!(outcome.result.success);
        assert_eq!(outcome.attempts, 0);
        assert!(llm.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_give_up_consults_once() {
        let (oracle, llm) = llm_oracle(vec![GIVE_UP]);
        let mut router = connected_router(ScriptedRunner::default().with("false", "", 1)).await;
        let healer = SelfHealingExecutor::new(Some(oracle));

        let outcome = healer
            .execute_with_healing(&mut router, &ssh_run("false"), "goal", &[])
            .await;
        assert!(!outcome.result.success);
        assert_eq!(outcome.result.exit_code, Some(1));
        assert_eq!(outcome.attempts, 0);
        assert_eq!(llm.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrected_action_succeeds() {
        let reply = retry("ls /opt/data");
        let (oracle, _) = llm_oracle(vec![reply.as_str()]);
        let session = ScriptedRunner::default()
            .with("ls /opt/dta", "", 2)
            .with("ls /opt/data", "report.txt", 0);
        let mut router = connected_router(session).await;
        let healer = SelfHealingExecutor::new(Some(oracle));

        let outcome = healer
            .execute_with_healing(&mut router, &ssh_run("ls /opt/dta"), "goal", &[])
            .await;
        assert!(outcome.result.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.corrected, Some(ssh_run("ls /opt/data")));
        assert_eq!(router.last_output().unwrap().stdout, "report.txt");
    }

    #[tokio::test]
    async fn test_healing_is_bounded() {
        let r1 = retry("fix-1");
        let r2 = retry("fix-2");
        let r3 = retry("fix-3");
        let r4 = retry("fix-4");
        let (oracle, llm) = llm_oracle(vec![r1.as_str(), r2.as_str(), r3.as_str(), r4.as_str()]);
        let session = ScriptedRunner::default()
            .with("broken", "", 1)
            .with("fix-1", "", 1)
            .with("fix-2", "", 1)
            .with("fix-3", "", 1)
            .with("fix-4", "ok", 0);
        let calls = session.calls.clone();
        let mut router = connected_router(session).await;
        let healer = SelfHealingExecutor::new(Some(oracle)).with_max_attempts(3);

        let outcome = healer
            .execute_with_healing(&mut router, &ssh_run("broken"), "goal", &[])
            .await;
        assert!(!outcome.result.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(llm.prompts.lock().unwrap().len(), 3);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["broken", "fix-1", "fix-2", "fix-3"]
        );

        // 后续尝试以上一次修正动作为上下文
        assert!(llm.prompts.lock().unwrap()[2].contains("fix-2"));
    }

    #[tokio::test]
    async fn test_verification_never_healed() {
        let (oracle, llm) = llm_oracle(vec![]);
        let mut router =
            connected_router(ScriptedRunner::default().with("cat state", "NOT_FOUND", 0)).await;
        router.dispatch(&ssh_run("cat state")).await;

        let verify = Action::VerifyOutput {
            expected: "EXISTS".to_string(),
        };
        let direct = router.dispatch(&verify).await;

        let healer = SelfHealingExecutor::new(Some(oracle));
        let outcome = healer
            .execute_with_healing(&mut router, &verify, "goal", &[])
            .await;
        assert_eq!(outcome.result, direct);
        assert!(llm.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oracle_error_is_give_up() {
        let llm = Arc::new(CannedLlm::new(vec![Err(LlmError::HttpError(
            "timeout".to_string(),
        ))]));
        let healer = SelfHealingExecutor::new(Some(Arc::new(LlmOracle::new(llm))));
        let mut router = connected_router(ScriptedRunner::default().with("false", "", 1)).await;

        let outcome = healer
            .execute_with_healing(&mut router, &ssh_run("false"), "goal", &[])
            .await;
        assert!(!outcome.result.success);
        assert_eq!(outcome.attempts, 0);
    }

    struct FixedAnswer(std::io::Result<String>);

    #[async_trait]
    impl OperatorPrompt for FixedAnswer {
        async fn ask(&self, _question: &str) -> std::io::Result<String> {
            match &self.0 {
                Ok(answer) => Ok(answer.clone()),
                Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_operator_decision() {
        let failed = ssh_run("false");
        let result = ExecutionResult::failure("exit 1");

        let policy = ContinuationPolicy::interactive(Arc::new(FixedAnswer(Ok("1\n".to_string()))));
        assert!(policy.decide(&failed, &result, &[], &[]).await.should_continue);

        let policy = ContinuationPolicy::interactive(Arc::new(FixedAnswer(Ok("2".to_string()))));
        assert!(!policy.decide(&failed, &result, &[], &[]).await.should_continue);

        let policy = ContinuationPolicy::interactive(Arc::new(FixedAnswer(Err(
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"),
        ))));
        let decision = policy.decide(&failed, &result, &[], &[]).await;
        assert!(!decision.should_continue);
        assert_eq!(decision.source, DecisionSource::Operator);
    }

    #[tokio::test]
    async fn test_oracle_verdict_and_fallback() {
        let failed = ssh_run("systemctl status foo");
        let result = ExecutionResult::failure("inactive");
        let remaining: Vec<String> = (1..=5).map(|i| format!("ssh_run(\"step{}\")", i)).collect();

        let (oracle, llm) = llm_oracle(vec![
            r#"{"should_continue": false, "reason": "service required", "suggestion": "start foo"}"#,
        ]);
        let policy = ContinuationPolicy::automated(Some(oracle));
        let decision = policy.decide(&failed, &result, &remaining, &[]).await;
        assert!(!decision.should_continue);
        assert_eq!(decision.source, DecisionSource::Oracle);
        let prompt = llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("step3"));
        assert!(!prompt.contains("step4"));

        // 回复无法解码时使用默认规则
        let (oracle, _) = llm_oracle(vec!["not json"]);
        let policy = ContinuationPolicy::automated(Some(oracle));
        let decision = policy.decide(&failed, &result, &remaining, &[]).await;
        assert!(decision.should_continue);
        assert_eq!(decision.source, DecisionSource::Fallback);

        let connect = Action::SshConnect {
            credentials: Credentials::new("10.0.0.9", "root", "pw"),
        };
        let decision = ContinuationPolicy::automated(None)
            .decide(&connect, &result, &remaining, &[])
            .await;
        assert!(!decision.should_continue);
    }

    #[tokio::test]
    async fn test_heal_prompt_uses_recent_history() {
        let (oracle, llm) = llm_oracle(vec![GIVE_UP]);
        let mut router = connected_router(ScriptedRunner::default().with("false", "", 1)).await;
        let history: Vec<HistoryEntry> = (0..8)
            .map(|i| {
                HistoryEntry::new(
                    ssh_run(&format!("history-{}", i)),
                    ExecutionResult::success(""),
                )
            })
            .collect();

        SelfHealingExecutor::new(Some(oracle))
            .execute_with_healing(&mut router, &ssh_run("false"), "goal", &history)
            .await;

        let prompt = llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("history-3"));
        assert!(prompt.contains("history-7"));
        assert!(!prompt.contains("history-2"));
    }
}

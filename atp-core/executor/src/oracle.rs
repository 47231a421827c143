//! 决策服务
//!
//! 规划、动作列表生成、下一步推理、失败修复和继续判定都通过
//! [`DecisionOracle`] 完成。默认实现 [`LlmOracle`] 把上下文组织成提示词交给
//! 大模型，回复统一经过 [`decode_reply`] 解码为强类型结果。

use std::sync::Arc;

use async_trait::async_trait;
use atp_llm::LlmClient;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::action::{Action, WireAction};
use crate::result::{summarize_history, ExecutionResult, HistoryEntry};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("决策服务调用失败: {0}")]
    Transport(String),

    #[error("决策服务返回格式错误: {0}")]
    Malformed(String),
}

pub type OracleResult<T> = std::result::Result<T, OracleError>;

/// 测试计划
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

/// 下一步推理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    GoalAchieved,
    Continue(Action),
}

#[derive(Debug, Deserialize)]
struct NextActionReply {
    #[serde(default)]
    status: String,
    #[serde(default)]
    action: Option<WireAction>,
}

impl TryFrom<NextActionReply> for NextAction {
    type Error = OracleError;

    fn try_from(reply: NextActionReply) -> OracleResult<Self> {
        if reply.status.eq_ignore_ascii_case("goal_achieved") {
            return Ok(NextAction::GoalAchieved);
        }
        let wire = reply
            .action
            .ok_or_else(|| OracleError::Malformed("缺少 action 字段".to_string()))?;
        Action::try_from(wire)
            .map(NextAction::Continue)
            .map_err(OracleError::Malformed)
    }
}

/// 修复决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealingDecision {
    pub should_retry: bool,
    pub give_up: bool,
    pub root_cause: String,
    pub corrected_action: Option<Action>,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct HealingReply {
    #[serde(default)]
    should_retry: bool,
    #[serde(default)]
    give_up: bool,
    #[serde(default)]
    root_cause: String,
    #[serde(default)]
    corrected_action: Option<WireAction>,
    #[serde(default)]
    reason: String,
}

impl TryFrom<HealingReply> for HealingDecision {
    type Error = OracleError;

    fn try_from(reply: HealingReply) -> OracleResult<Self> {
        let corrected_action = reply
            .corrected_action
            .map(Action::try_from)
            .transpose()
            .map_err(OracleError::Malformed)?;

        Ok(HealingDecision {
            should_retry: reply.should_retry,
            give_up: reply.give_up,
            root_cause: reply.root_cause,
            corrected_action,
            reason: reply.reason,
        })
    }
}

/// 失败后是否继续的判定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationVerdict {
    pub should_continue: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub suggestion: String,
}

/// 修复时提供给决策服务的上下文
#[derive(Debug, Clone, Copy)]
pub struct HealingContext<'a> {
    pub failed_action: &'a Action,
    pub result: &'a ExecutionResult,
    pub goal: &'a str,
    /// 最近的历史（已截取窗口）
    pub history: &'a [HistoryEntry],
    pub attempt: u32,
    pub max_attempts: u32,
}

/// 继续判定的上下文
#[derive(Debug, Clone, Copy)]
pub struct ContinuationContext<'a> {
    pub failed_action: &'a Action,
    pub result: &'a ExecutionResult,
    /// 接下来待执行的动作命令
    pub upcoming: &'a [String],
    /// 剩余动作总数
    pub remaining: usize,
    pub history: &'a [HistoryEntry],
}

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// 把测试用例文本转换为目标和步骤
    async fn plan(&self, testcase_text: &str) -> OracleResult<Plan>;

    /// 把步骤转换为动作命令列表
    async fn action_list(&self, goal: &str, steps: &[String]) -> OracleResult<Vec<String>>;

    /// 动作列表耗尽后推理下一步
    async fn next_action(
        &self,
        goal: &str,
        history: &[HistoryEntry],
        last: Option<&ExecutionResult>,
    ) -> OracleResult<NextAction>;

    /// 分析失败并给出修正动作
    async fn heal(&self, ctx: &HealingContext<'_>) -> OracleResult<HealingDecision>;

    /// 失败后是否继续执行剩余动作
    async fn should_continue(&self, ctx: &ContinuationContext<'_>)
        -> OracleResult<ContinuationVerdict>;
}

/// 解码决策服务回复：去掉 markdown 代码块后按 JSON 解析
pub fn decode_reply<T: DeserializeOwned>(raw: &str) -> OracleResult<T> {
    let fence = Regex::new(r"(?s)```(?:json)?\s*([\[{].*?[\]}])\s*```")
        .map_err(|e| OracleError::Malformed(e.to_string()))?;

    let body = fence
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
        .trim();

    serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        OracleError::Malformed(format!("{} (回复: {})", e, preview))
    })
}

const ACTION_CATALOG: &str = r#"Available action commands:
- ssh_connect("host", "username", "password")   open an SSH session to a Linux host
- ssh_run("command")                             run a shell command over the SSH session
- ssh_disconnect()                               close the SSH session
- powershell_connect("host", "username", "password")  open a WinRM session to a Windows host
- powershell_run("command")                      run PowerShell on the connected Windows host
- powershell_command("command")                  run PowerShell on this machine (PowerCLI, vCenter)
- powershell_capability("command")               probe a local PowerShell module; empty output is fatal
- powershell_disconnect()                        close the WinRM session
- local_run("command")                           run a local non-PowerShell command
- verify_output("expected")                      check the previous command output contains the text
- done                                           the goal is complete

Rules:
- Copy hosts, usernames and passwords exactly as written, never invent or mask them.
- vCenter is never reached through WinRM; PowerCLI always runs via powershell_command.
- Commands must be non-interactive."#;

/// 基于大模型的决策服务
pub struct LlmOracle {
    llm: Arc<dyn LlmClient>,
}

impl LlmOracle {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    async fn ask(&self, stage: &str, prompt: String) -> OracleResult<String> {
        debug!("决策服务请求 [{}]", stage);
        let reply = self
            .llm
            .ask(&prompt)
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        debug!("决策服务回复 [{}]: {}", stage, reply);
        Ok(reply)
    }
}

fn plan_prompt(testcase_text: &str) -> String {
    format!(
        r#"You plan infrastructure acceptance tests.
Turn the testcase below into one goal and an ordered list of required steps.
Keep every literal (hosts, usernames, passwords, quoted strings) exactly as written.

Testcase:
{testcase_text}

Reply with JSON only:
{{"goal": "...", "steps": ["...", "..."]}}"#
    )
}

fn action_list_prompt(goal: &str, steps: &[String]) -> String {
    let steps_text = steps
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Goal:
{goal}

Steps:
{steps_text}

{ACTION_CATALOG}

Translate the steps into action commands, one per array item, ending with "done".
Reply with a JSON array of strings only."#
    )
}

fn next_action_prompt(
    goal: &str,
    history: &[HistoryEntry],
    last: Option<&ExecutionResult>,
) -> String {
    let last_text = match last {
        Some(result) => format!(
            "success: {}\nstdout: {}\nerror: {}",
            result.success,
            result.stdout,
            result.error.as_deref().unwrap_or("")
        ),
        None => "none".to_string(),
    };

    format!(
        r#"Goal:
{goal}

Actions so far:
{history}

Last result:
{last_text}

Decide the single next action. If the goal is already met reply {{"status": "goal_achieved"}}.
Otherwise reply
{{"status": "continue", "action": {{"type": "command", "machine": "local|ssh|powershell", "command": "...", "params": {{}}}}}}
Connection actions use type ssh_connect/powershell_connect with params host, username, password.
Reply with JSON only."#,
        history = summarize_history(history),
    )
}

fn heal_prompt(ctx: &HealingContext<'_>) -> String {
    let failed = serde_json::to_string(ctx.failed_action).unwrap_or_else(|_| ctx.failed_action.describe());

    format!(
        r#"An automated test action failed. Find the root cause and propose one corrected action.

Goal: {goal}
Attempt: {attempt} of {max}

Failed action:
{failed}

Result:
exit code: {exit_code}
stdout: {stdout}
stderr: {stderr}
error: {error}

Recent actions:
{history}

Reply with JSON only:
{{"should_retry": true, "give_up": false, "root_cause": "...",
  "corrected_action": {{"type": "command", "machine": "local|ssh|powershell", "command": "...", "params": {{}}}},
  "reason": "..."}}
Set give_up to true when retrying cannot help (bad credentials, missing host, wrong expectations)."#,
        goal = ctx.goal,
        attempt = ctx.attempt,
        max = ctx.max_attempts,
        exit_code = ctx.result.exit_code_text(),
        stdout = ctx.result.stdout,
        stderr = ctx.result.stderr,
        error = ctx.result.error.as_deref().unwrap_or(""),
        history = summarize_history(ctx.history),
    )
}

fn continuation_prompt(ctx: &ContinuationContext<'_>) -> String {
    let upcoming = if ctx.upcoming.is_empty() {
        "none".to_string()
    } else {
        ctx.upcoming.join("\n")
    };

    format!(
        r#"An action failed and could not be repaired. Decide whether the remaining actions can still run.

Failed action: {failed}
error: {error}
stdout: {stdout}
stderr: {stderr}
exit code: {exit_code}

Next actions ({remaining} remaining):
{upcoming}

Recent actions:
{history}

Stop when the failure breaks what follows (lost connection, missing prerequisite).
Reply with JSON only:
{{"should_continue": true, "reason": "...", "suggestion": "..."}}"#,
        failed = ctx.failed_action.describe(),
        error = ctx.result.error.as_deref().unwrap_or(""),
        stdout = ctx.result.stdout,
        stderr = ctx.result.stderr,
        exit_code = ctx.result.exit_code_text(),
        remaining = ctx.remaining,
        history = summarize_history(ctx.history),
    )
}

#[async_trait]
impl DecisionOracle for LlmOracle {
    async fn plan(&self, testcase_text: &str) -> OracleResult<Plan> {
        let reply = self.ask("plan", plan_prompt(testcase_text)).await?;
        let plan: Plan = decode_reply(&reply)?;
        info!("测试目标: {} ({} 个步骤)", plan.goal, plan.steps.len());
        Ok(plan)
    }

    async fn action_list(&self, goal: &str, steps: &[String]) -> OracleResult<Vec<String>> {
        let reply = self
            .ask("action_list", action_list_prompt(goal, steps))
            .await?;
        decode_reply(&reply)
    }

    async fn next_action(
        &self,
        goal: &str,
        history: &[HistoryEntry],
        last: Option<&ExecutionResult>,
    ) -> OracleResult<NextAction> {
        let reply = self
            .ask("next_action", next_action_prompt(goal, history, last))
            .await?;
        decode_reply::<NextActionReply>(&reply)?.try_into()
    }

    async fn heal(&self, ctx: &HealingContext<'_>) -> OracleResult<HealingDecision> {
        let reply = self.ask("heal", heal_prompt(ctx)).await?;
        decode_reply::<HealingReply>(&reply)?.try_into()
    }

    async fn should_continue(
        &self,
        ctx: &ContinuationContext<'_>,
    ) -> OracleResult<ContinuationVerdict> {
        let reply = self
            .ask("should_continue", continuation_prompt(ctx))
            .await?;
        decode_reply(&reply)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::action::Transport;
    use atp_llm::{LlmError, Result as LlmResult};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 依次返回预设回复的大模型
    pub(crate) struct CannedLlm {
        pub replies: Mutex<VecDeque<LlmResult<String>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl CannedLlm {
        pub(crate) fn new(replies: Vec<LlmResult<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn ask(&self, prompt: &str) -> LlmResult<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::EmptyResponse))
        }
    }

    fn oracle(replies: Vec<LlmResult<String>>) -> (LlmOracle, Arc<CannedLlm>) {
        let llm = Arc::new(CannedLlm::new(replies));
        (LlmOracle::new(llm.clone()), llm)
    }

    #[test]
    fn test_decode_reply_strips_fence() {
        let plan: Plan = decode_reply(
            "Here you go:\n```json\n{\"goal\": \"check report\", \"steps\": [\"connect\"]}\n```\n",
        )
        .unwrap();
        assert_eq!(plan.goal, "check report");

        let list: Vec<String> =
            decode_reply("```\n[\"ssh_disconnect()\", \"done\"]\n```").unwrap();
        assert_eq!(list, vec!["ssh_disconnect()", "done"]);

        let plain: ContinuationVerdict =
            decode_reply(r#"  {"should_continue": false, "reason": "lost"}  "#).unwrap();
        assert!(!plain.should_continue);
        assert_eq!(plain.suggestion, "");
    }

    #[test]
    fn test_decode_reply_malformed() {
        let err = decode_reply::<Plan>("I cannot help with that").unwrap_err();
        assert!(matches!(err, OracleError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_plan_and_action_list() {
        let (oracle, llm) = oracle(vec![
            Ok(r#"{"goal": "report exists", "steps": ["connect", "check"]}"#.to_string()),
            Ok(r#"["ssh_connect(\"10.0.0.1\", \"root\", \"pw\")", "done"]"#.to_string()),
        ]);

        let plan = oracle.plan("@pre\nconnect to 10.0.0.1").await.unwrap();
        assert_eq!(plan.steps.len(), 2);
        let actions = oracle.action_list(&plan.goal, &plan.steps).await.unwrap();
        assert_eq!(actions.len(), 2);

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].contains("connect to 10.0.0.1"));
        assert!(prompts[1].contains("1. connect\n2. check"));
    }

    #[tokio::test]
    async fn test_transport_error() {
        let (oracle, _) = oracle(vec![Err(LlmError::ApiError(503, "unavailable".to_string()))]);
        let err = oracle.plan("x").await.unwrap_err();
        assert!(matches!(err, OracleError::Transport(_)));
    }

    #[tokio::test]
    async fn test_next_action() {
        let (oracle, _) = oracle(vec![
            Ok(r#"{"status": "goal_achieved"}"#.to_string()),
            Ok(r#"{"status": "continue", "action": {"type": "command", "machine": "ssh", "command": "uptime"}}"#.to_string()),
            Ok(r#"{"status": "continue"}"#.to_string()),
        ]);

        assert_eq!(
            oracle.next_action("g", &[], None).await.unwrap(),
            NextAction::GoalAchieved
        );
        assert_eq!(
            oracle.next_action("g", &[], None).await.unwrap(),
            NextAction::Continue(Action::RunCommand {
                transport: Transport::Ssh,
                command: "uptime".to_string(),
            })
        );
        assert!(matches!(
            oracle.next_action("g", &[], None).await,
            Err(OracleError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_heal_decision() {
        let (oracle, llm) = oracle(vec![Ok(r#"```json
{"should_retry": true, "give_up": false, "root_cause": "typo",
 "corrected_action": {"type": "command", "machine": "ssh", "command": "ls /opt/data"},
 "reason": "fix path"}
```"#
            .to_string())]);

        let failed = Action::RunCommand {
            transport: Transport::Ssh,
            command: "ls /opt/dta".to_string(),
        };
        let result = ExecutionResult::failure("No such file or directory");
        let ctx = HealingContext {
            failed_action: &failed,
            result: &result,
            goal: "list data",
            history: &[],
            attempt: 1,
            max_attempts: 3,
        };

        let decision = oracle.heal(&ctx).await.unwrap();
        assert!(decision.should_retry);
        assert_eq!(decision.root_cause, "typo");
        assert_eq!(
            decision.corrected_action.unwrap().command(),
            Some("ls /opt/data")
        );
        assert!(llm.prompts.lock().unwrap()[0].contains("Attempt: 1 of 3"));
    }
}

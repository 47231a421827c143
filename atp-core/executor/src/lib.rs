//! ATP 执行器
//!
//! 基础设施验收测试的执行与恢复引擎：
//! - 依赖编排：按依赖关系运行测试用例，每个用例在一次运行中只执行一次
//! - 会话路由：按执行通道维护会话状态并分发动作
//! - 自愈执行：动作失败后由决策服务给出修正动作并重试
//! - 两阶段交互：界面步骤优先回放缓存的操作配方，失效时重新分析或交给恢复代理

pub mod action;
pub mod config;
pub mod healing;
pub mod interaction;
pub mod oracle;
pub mod orchestrator;
pub mod phases;
pub mod report;
pub mod result;
pub mod router;
pub mod snapshot;
pub mod testcase;
pub mod transport;
pub mod ui_bridge;

pub use action::{parse_action_command, Action, ActionKind, Credentials, PlannedStep, Transport};
pub use config::{ExecutionConfig, HealingConfig, RunConfig, UiConfig};
pub use healing::{
    ContinuationDecision, ContinuationPolicy, DecisionSource, HealingOutcome, OperatorPrompt,
    SelfHealingExecutor, StdinPrompt,
};
pub use interaction::{
    AgentRun, Candidate, InteractionEngine, InteractionOptions, InteractionPath, RecoveryAgent,
    StepKind, StepOutcome, UiAnalyzer, UiDriver, UiError, UiResult,
};
pub use oracle::{
    decode_reply, ContinuationContext, ContinuationVerdict, DecisionOracle, HealingContext,
    HealingDecision, LlmOracle, NextAction, OracleError, OracleResult, Plan,
};
pub use orchestrator::TestOrchestrator;
pub use phases::{PhaseRunner, TestCaseExecutor};
pub use report::{
    Phase, PhaseReport, RunSummary, StepReport, StepStatus, TestCaseReport, TestStatus,
};
pub use result::{ExecutionResult, HistoryEntry};
pub use router::{CommandRunner, RemoteSession, SessionConnector, SessionRouter, SessionState};
pub use snapshot::{InteractionRecipe, RecipeTarget, SnapshotStore};
pub use testcase::{Step, TestCase, TestCaseLoader, TestCaseSource, Timing};
pub use transport::{system_router, SshDefaults};
pub use ui_bridge::UiBridgeClient;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("测试用例不存在: {0}")]
    TestCaseNotFound(String),

    #[error("测试用例加载失败: {0}")]
    TestCaseLoadFailed(String),

    #[error("检测到循环依赖: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("依赖用例未通过: {dependency} (被 {testcase} 依赖)")]
    DependencyFailed { testcase: String, dependency: String },

    #[error("测试用例失败: {0}")]
    TestcaseFailed(String),

    #[error("动作命令格式错误: {0}")]
    InvalidActionCommand(String),

    #[error("决策服务返回无效结果: {0}")]
    OracleDecision(String),

    #[error("恢复代理日志中没有带坐标的点击动作, 步骤: {0}")]
    AgentLogInconsistent(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerdeError(String),
}

impl ExecutorError {
    /// 结构性错误：测试图或决策结果本身有问题，整个运行立即中止
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ExecutorError::CircularDependency(_)
                | ExecutorError::InvalidActionCommand(_)
                | ExecutorError::OracleDecision(_)
                | ExecutorError::AgentLogInconsistent(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

//! 执行报告

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// 测试用例结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Passed => write!(f, "PASSED"),
            TestStatus::Failed => write!(f, "FAILED"),
            TestStatus::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// 阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Interaction,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Interaction => write!(f, "interaction"),
            Phase::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// 步骤报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// 步骤索引
    pub index: usize,

    /// 步骤描述（动作描述或界面步骤文本）
    pub description: String,

    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// 修复时分发的修正动作数
    #[serde(default)]
    pub healing_attempts: u32,

    /// 耗时（毫秒）
    pub duration_ms: u64,
}

impl StepReport {
    pub fn success(index: usize, description: &str) -> Self {
        Self {
            index,
            description: description.to_string(),
            status: StepStatus::Success,
            error: None,
            output: None,
            healing_attempts: 0,
            duration_ms: 0,
        }
    }

    pub fn failed(index: usize, description: &str, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            status: StepStatus::Failed,
            ..Self::success(index, description)
        }
    }

    /// 前面的步骤失败，未执行
    pub fn skipped(index: usize, description: &str) -> Self {
        Self {
            status: StepStatus::Skipped,
            ..Self::success(index, description)
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        let output = output.into();
        if !output.is_empty() {
            self.output = Some(output);
        }
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_healing_attempts(mut self, attempts: u32) -> Self {
        self.healing_attempts = attempts;
        self
    }
}

/// 阶段报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub passed: bool,

    /// 失败或提前结束的原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub steps: Vec<StepReport>,
    pub duration_ms: u64,
}

impl PhaseReport {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            passed: true,
            reason: None,
            steps: Vec::new(),
            duration_ms: 0,
        }
    }

    /// 记录步骤；阶段结论只由 [`PhaseReport::fail`] 改变
    pub fn add_step(&mut self, step: StepReport) {
        self.steps.push(step);
    }

    /// 标记阶段失败
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.passed = false;
        self.reason = Some(reason.into());
    }

    pub fn failed_steps(&self) -> usize {
        self.count_steps(StepStatus::Failed)
    }

    pub fn skipped_steps(&self) -> usize {
        self.count_steps(StepStatus::Skipped)
    }

    fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// 测试用例报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseReport {
    pub name: String,
    pub status: TestStatus,

    /// 跳过原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub phases: Vec<PhaseReport>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TestCaseReport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: TestStatus::Passed,
            reason: None,
            phases: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// 依赖未通过而跳过
    pub fn skipped(name: &str, dependency: &str, dependency_status: TestStatus) -> Self {
        Self {
            status: TestStatus::Skipped,
            reason: Some(format!("依赖 {} 结果为 {}", dependency, dependency_status)),
            ..Self::new(name)
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// 由各阶段结果汇总结论
    pub fn finalize(&mut self) {
        self.status = if self.phases.iter().all(|p| p.passed) {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };
        self.duration_ms = (Utc::now() - self.started_at).num_milliseconds().max(0) as u64;
    }
}

/// 一次运行的汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,

    /// 请求运行的测试用例
    pub target: String,

    pub status: TestStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// 每个测试用例的结论
    pub results: BTreeMap<String, TestStatus>,

    /// 按执行顺序排列的报告
    pub reports: Vec<TestCaseReport>,
}

impl RunSummary {
    pub fn passed_count(&self) -> usize {
        self.count(TestStatus::Passed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(TestStatus::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(TestStatus::Skipped)
    }

    fn count(&self, status: TestStatus) -> usize {
        self.results.values().filter(|s| **s == status).count()
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// 导出为 YAML
    pub fn to_yaml(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_report() {
        let mut phase = PhaseReport::new(Phase::Setup);
        phase.add_step(StepReport::success(0, "ssh_connect on ssh: root@h"));
        assert!(phase.passed);

        // 失败后继续执行的步骤不改变阶段结论
        phase.add_step(StepReport::failed(1, "command on ssh: false", "exit 1"));
        assert!(phase.passed);
        assert_eq!(phase.failed_steps(), 1);

        phase.fail("verification failed");
        assert!(!phase.passed);
        assert_eq!(phase.reason.as_deref(), Some("verification failed"));
    }

    #[test]
    fn test_skipped_steps_are_counted_separately() {
        let mut phase = PhaseReport::new(Phase::Interaction);
        phase.add_step(StepReport::failed(0, "Click \"Backup\"", "not found"));
        phase.add_step(StepReport::skipped(1, "Press Enter"));

        assert_eq!(phase.failed_steps(), 1);
        assert_eq!(phase.skipped_steps(), 1);
        assert_eq!(phase.steps[1].status, StepStatus::Skipped);
        assert!(phase.steps[1].error.is_none());
    }

    #[test]
    fn test_finalize() {
        let mut report = TestCaseReport::new("backup_vm");
        report.phases.push(PhaseReport::new(Phase::Setup));
        report.finalize();
        assert_eq!(report.status, TestStatus::Passed);

        let mut cleanup = PhaseReport::new(Phase::Cleanup);
        cleanup.fail("cleanup failed");
        report.phases.push(cleanup);
        report.finalize();
        assert_eq!(report.status, TestStatus::Failed);
        assert!(report.phase(Phase::Interaction).is_none());
    }

    #[test]
    fn test_summary_export() {
        let mut results = BTreeMap::new();
        results.insert("backup_vm".to_string(), TestStatus::Failed);
        results.insert("restore_vm".to_string(), TestStatus::Skipped);

        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            target: "restore_vm".to_string(),
            status: TestStatus::Skipped,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            results,
            reports: vec![TestCaseReport::skipped(
                "restore_vm",
                "backup_vm",
                TestStatus::Failed,
            )],
        };

        assert_eq!(summary.failed_count(), 1);
        assert_eq!(summary.skipped_count(), 1);
        assert_eq!(summary.passed_count(), 0);

        let json = summary.to_json().unwrap();
        assert!(json.contains("\"SKIPPED\""));
        assert!(json.contains("依赖 backup_vm 结果为 FAILED"));
        assert!(summary.to_yaml().unwrap().contains("target: restore_vm"));
    }
}

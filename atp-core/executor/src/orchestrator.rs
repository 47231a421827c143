//! 依赖编排
//!
//! 按 `@depends_on` 递归运行测试用例：
//! - 每个用例在一次运行中最多执行一次，结论被记住并复用
//! - 依赖未通过时用例记为 SKIPPED，不执行任何阶段
//! - 递归链上出现重复用例即为循环依赖

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::phases::PhaseRunner;
use crate::report::{RunSummary, TestCaseReport, TestStatus};
use crate::testcase::TestCaseSource;
use crate::{ExecutorError, Result};

/// 测试用例编排器
pub struct TestOrchestrator<S, E> {
    source: S,
    runner: E,

    /// 已得出结论的用例
    results: HashMap<String, TestStatus>,

    /// 当前递归链
    stack: Vec<String>,

    /// 依赖或用例失败时立即中止整个运行
    fail_fast: bool,

    reports: Vec<TestCaseReport>,
    started_at: DateTime<Utc>,
}

impl<S, E> TestOrchestrator<S, E>
where
    S: TestCaseSource,
    E: PhaseRunner,
{
    pub fn new(source: S, runner: E) -> Self {
        Self {
            source,
            runner,
            results: HashMap::new(),
            stack: Vec::new(),
            fail_fast: true,
            reports: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// 运行测试用例及其依赖，返回该用例的结论
    pub fn run<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, Result<TestStatus>> {
        async move {
            if let Some(status) = self.results.get(name) {
                info!("复用已有结论: {} = {}", name, status);
                return Ok(*status);
            }

            if self.stack.iter().any(|n| n == name) {
                let mut chain = self.stack.clone();
                chain.push(name.to_string());
                error!("检测到循环依赖: {}", chain.join(" -> "));
                return Err(ExecutorError::CircularDependency(chain));
            }

            self.stack.push(name.to_string());
            let outcome = self.resolve(name).await;
            self.stack.pop();
            outcome
        }
        .boxed()
    }

    async fn resolve(&mut self, name: &str) -> Result<TestStatus> {
        let testcase = self.source.load(name)?;

        for dependency in &testcase.depends_on {
            let status = self.run(dependency).await?;
            if status == TestStatus::Passed {
                continue;
            }

            warn!("⏭️  SKIPPED: {} (依赖 {} 结果为 {})", name, dependency, status);
            self.results.insert(name.to_string(), TestStatus::Skipped);
            self.reports
                .push(TestCaseReport::skipped(name, dependency, status));

            if self.fail_fast {
                return Err(ExecutorError::DependencyFailed {
                    testcase: name.to_string(),
                    dependency: dependency.clone(),
                });
            }
            return Ok(TestStatus::Skipped);
        }

        let report = self.runner.execute(&testcase).await?;
        let status = report.status;
        self.results.insert(name.to_string(), status);
        self.reports.push(report);

        if self.fail_fast && status != TestStatus::Passed {
            return Err(ExecutorError::TestcaseFailed(name.to_string()));
        }
        Ok(status)
    }

    /// 已得出的全部结论
    pub fn results(&self) -> &HashMap<String, TestStatus> {
        &self.results
    }

    /// 按完成顺序排列的报告
    pub fn reports(&self) -> &[TestCaseReport] {
        &self.reports
    }

    /// 生成运行汇总；目标用例没有结论时记为 FAILED
    pub fn summary(&self, target: &str) -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            target: target.to_string(),
            status: self
                .results
                .get(target)
                .copied()
                .unwrap_or(TestStatus::Failed),
            started_at: self.started_at,
            finished_at: Utc::now(),
            results: self
                .results
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect::<BTreeMap<_, _>>(),
            reports: self.reports.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Phase, PhaseReport};
    use crate::testcase::TestCase;
    use async_trait::async_trait;

    struct MapSource(HashMap<String, String>);

    impl MapSource {
        fn new(cases: &[(&str, &str)]) -> Self {
            Self(
                cases
                    .iter()
                    .map(|(n, t)| (n.to_string(), t.to_string()))
                    .collect(),
            )
        }
    }

    impl TestCaseSource for MapSource {
        fn load(&self, name: &str) -> Result<TestCase> {
            self.0
                .get(name)
                .map(|t| TestCase::parse(t))
                .ok_or_else(|| ExecutorError::TestCaseNotFound(name.to_string()))
        }
    }

    /// 名称以 fail 开头的用例失败
    #[derive(Default)]
    struct NameRunner {
        executed: Vec<String>,
    }

    #[async_trait]
    impl PhaseRunner for NameRunner {
        async fn execute(&mut self, testcase: &TestCase) -> Result<TestCaseReport> {
            self.executed.push(testcase.name.clone());
            let mut report = TestCaseReport::new(&testcase.name);
            let mut phase = PhaseReport::new(Phase::Setup);
            if testcase.name.starts_with("fail") {
                phase.fail("boom");
            }
            report.phases.push(phase);
            report.finalize();
            Ok(report)
        }
    }

    #[tokio::test]
    async fn test_shared_dependency_runs_once() {
        let source = MapSource::new(&[
            ("base", "@testcase base"),
            ("left", "@testcase left\n@depends_on base"),
            ("right", "@testcase right\n@depends_on base"),
            ("top", "@testcase top\n@depends_on left right"),
        ]);
        let mut orchestrator = TestOrchestrator::new(source, NameRunner::default());

        let status = orchestrator.run("top").await.unwrap();
        assert_eq!(status, TestStatus::Passed);
        assert_eq!(
            orchestrator.runner.executed,
            vec!["base", "left", "right", "top"]
        );
        assert_eq!(orchestrator.results().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_without_fail_fast() {
        let source = MapSource::new(&[
            ("fail_backup", "@testcase fail_backup"),
            ("restore", "@testcase restore\n@depends_on fail_backup"),
        ]);
        let mut orchestrator =
            TestOrchestrator::new(source, NameRunner::default()).with_fail_fast(false);

        let status = orchestrator.run("restore").await.unwrap();
        assert_eq!(status, TestStatus::Skipped);
        assert_eq!(orchestrator.runner.executed, vec!["fail_backup"]);

        let summary = orchestrator.summary("restore");
        assert_eq!(summary.status, TestStatus::Skipped);
        assert_eq!(summary.failed_count(), 1);
        assert_eq!(summary.skipped_count(), 1);
        assert_eq!(summary.reports.len(), 2);
    }

    #[tokio::test]
    async fn test_fail_fast_escalates() {
        let source = MapSource::new(&[
            ("fail_backup", "@testcase fail_backup"),
            ("restore", "@testcase restore\n@depends_on fail_backup"),
        ]);
        let mut orchestrator = TestOrchestrator::new(source, NameRunner::default());

        let err = orchestrator.run("restore").await.unwrap_err();
        assert!(matches!(err, ExecutorError::TestcaseFailed(ref n) if n == "fail_backup"));
        assert_eq!(orchestrator.results()["fail_backup"], TestStatus::Failed);
        assert!(!orchestrator.results().contains_key("restore"));
    }

    #[tokio::test]
    async fn test_cycle_detected() {
        let source = MapSource::new(&[
            ("a", "@testcase a\n@depends_on b"),
            ("b", "@testcase b\n@depends_on a"),
        ]);
        let mut orchestrator = TestOrchestrator::new(source, NameRunner::default());

        let err = orchestrator.run("a").await.unwrap_err();
        match err {
            ExecutorError::CircularDependency(chain) => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {}", other),
        }
        assert!(orchestrator.runner.executed.is_empty());
        assert!(orchestrator.stack.is_empty());
    }

    #[tokio::test]
    async fn test_missing_testcase() {
        let source = MapSource::new(&[("a", "@testcase a\n@depends_on ghost")]);
        let mut orchestrator = TestOrchestrator::new(source, NameRunner::default());

        let err = orchestrator.run("a").await.unwrap_err();
        assert!(matches!(err, ExecutorError::TestCaseNotFound(ref n) if n == "ghost"));
        assert_eq!(orchestrator.summary("a").status, TestStatus::Failed);
    }
}

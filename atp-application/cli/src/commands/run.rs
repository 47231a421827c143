//! Run 命令处理

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use atp_executor::{
    RunConfig, RunSummary, TestCaseExecutor, TestCaseLoader, TestOrchestrator, TestStatus,
};

use super::load_config;
use super::output::print_summary;
use crate::RunArgs;

pub async fn handle(args: RunArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = load_config(config_path)?;
    apply_args(&mut config, &args);
    config.validate()?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .context("进度条模板无效")?,
    );
    spinner.set_message("初始化执行器...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let loader = TestCaseLoader::new(&config.testcase_dir);
    let executor = TestCaseExecutor::from_config(&config).context("初始化执行器失败")?;
    let mut orchestrator =
        TestOrchestrator::new(loader, executor).with_fail_fast(config.execution.fail_fast);

    spinner.finish_with_message(format!(
        "{} 测试用例目录: {}",
        "✓".green().bold(),
        config.testcase_dir.display()
    ));

    if !config.oracle_enabled() {
        println!(
            "{} 未配置 GEMINI_API_KEY, 准备和清理步骤将无法执行",
            "⚠".yellow()
        );
    }

    println!("\n{} {}\n", "开始运行:".bold(), args.testcase.cyan());
    let outcome = orchestrator.run(&args.testcase).await;

    let summary = orchestrator.summary(&args.testcase);
    print_summary(&summary);

    if let Some(path) = report_path(&config, &args, &summary) {
        write_report(&summary, &path)?;
        println!("{} 报告已保存: {}", "✓".green(), path.display());
    }

    match outcome {
        Ok(TestStatus::Passed) => Ok(()),
        Ok(status) => anyhow::bail!("测试用例 {} 结果为 {}", args.testcase, status),
        Err(e) => Err(e).with_context(|| format!("运行测试用例 {} 失败", args.testcase)),
    }
}

/// 命令行参数覆盖配置
fn apply_args(config: &mut RunConfig, args: &RunArgs) {
    if let Some(dir) = &args.testcase_dir {
        config.testcase_dir = dir.clone();
    }
    if let Some(path) = &args.snapshot_path {
        config.snapshot_path = path.clone();
    }
    if args.fail_fast {
        config.execution.fail_fast = true;
    }
    if args.no_fail_fast {
        config.execution.fail_fast = false;
    }
    if args.interactive {
        config.execution.interactive = true;
    }
    if let Some(attempts) = args.max_heal_attempts {
        config.healing.max_heal_attempts = attempts;
    }
}

/// `--report` 优先，其次是配置中的报告目录
fn report_path(config: &RunConfig, args: &RunArgs, summary: &RunSummary) -> Option<PathBuf> {
    if let Some(path) = &args.report {
        return Some(path.clone());
    }
    config
        .report_dir
        .as_ref()
        .map(|dir| dir.join(format!("{}-{}.json", summary.target, summary.run_id)))
}

fn write_report(summary: &RunSummary, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建报告目录失败: {:?}", parent))?;
        }
    }

    let content = match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => summary.to_yaml().context("序列化报告失败")?,
        _ => summary.to_json().context("序列化报告失败")?,
    };
    std::fs::write(path, content).with_context(|| format!("写入报告失败: {:?}", path))?;

    info!("运行汇总已写入: {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use atp_executor::TestCaseReport;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn args() -> RunArgs {
        RunArgs {
            testcase: "restore_vm".to_string(),
            testcase_dir: None,
            snapshot_path: None,
            fail_fast: false,
            no_fail_fast: false,
            interactive: false,
            max_heal_attempts: None,
            report: None,
        }
    }

    fn summary() -> RunSummary {
        let mut results = BTreeMap::new();
        results.insert("restore_vm".to_string(), TestStatus::Passed);
        RunSummary {
            run_id: Uuid::nil(),
            target: "restore_vm".to_string(),
            status: TestStatus::Passed,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            results,
            reports: vec![TestCaseReport::new("restore_vm")],
        }
    }

    #[test]
    fn test_args_override_config() {
        let mut config = RunConfig::default();
        let args = RunArgs {
            testcase_dir: Some(PathBuf::from("/srv/testcases")),
            no_fail_fast: true,
            interactive: true,
            max_heal_attempts: Some(1),
            ..args()
        };

        apply_args(&mut config, &args);
        assert_eq!(config.testcase_dir, PathBuf::from("/srv/testcases"));
        assert!(!config.execution.fail_fast);
        assert!(config.execution.interactive);
        assert_eq!(config.healing.max_heal_attempts, 1);
        assert_eq!(config.snapshot_path, RunConfig::default().snapshot_path);
    }

    #[test]
    fn test_report_path() {
        let mut config = RunConfig::default();
        let summary = summary();
        assert!(report_path(&config, &args(), &summary).is_none());

        config.report_dir = Some(PathBuf::from("reports"));
        let path = report_path(&config, &args(), &summary).unwrap();
        assert!(path.starts_with("reports"));
        assert!(path.to_string_lossy().ends_with(".json"));

        let explicit = RunArgs {
            report: Some(PathBuf::from("out/summary.yaml")),
            ..args()
        };
        assert_eq!(
            report_path(&config, &explicit, &summary),
            Some(PathBuf::from("out/summary.yaml"))
        );
    }

    #[test]
    fn test_write_report_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let summary = summary();

        let yaml = dir.path().join("nested/summary.yaml");
        write_report(&summary, &yaml).unwrap();
        assert!(std::fs::read_to_string(&yaml)
            .unwrap()
            .contains("target: restore_vm"));

        let json = dir.path().join("summary.json");
        write_report(&summary, &json).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(value["status"], "PASSED");
    }
}
